// Worker lifecycle states

use serde::{Deserialize, Serialize};

/// initializing -> running -> {stopped | aborted | failed | died}
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerState {
    Initializing,
    Running,
    Stopped,
    Aborted,
    Failed,
    Died,
}

impl WorkerState {
    /// Only a running worker accepts and groups new jobs
    pub fn is_accepting(self) -> bool {
        self == WorkerState::Running
    }

    /// States reached through stop/abort/exit-on-error; submissions are rejected
    pub fn is_shut_down(self) -> bool {
        matches!(
            self,
            WorkerState::Stopped | WorkerState::Aborted | WorkerState::Failed
        )
    }

    pub fn is_terminal(self) -> bool {
        self.is_shut_down() || self == WorkerState::Died
    }
}

impl std::fmt::Display for WorkerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkerState::Initializing => write!(f, "INITIALIZING"),
            WorkerState::Running => write!(f, "RUNNING"),
            WorkerState::Stopped => write!(f, "STOPPED"),
            WorkerState::Aborted => write!(f, "ABORTED"),
            WorkerState::Failed => write!(f, "FAILED"),
            WorkerState::Died => write!(f, "DIED"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_classes() {
        assert!(WorkerState::Running.is_accepting());
        assert!(!WorkerState::Initializing.is_accepting());
        assert!(!WorkerState::Stopped.is_accepting());

        assert!(WorkerState::Failed.is_shut_down());
        assert!(!WorkerState::Died.is_shut_down());
        assert!(WorkerState::Died.is_terminal());
        assert!(!WorkerState::Running.is_terminal());
    }
}
