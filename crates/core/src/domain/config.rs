// Pipeline configuration (loaded by the composition root)

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Logical queue length at which a worker reports itself full (advisory)
pub const DEFAULT_QUEUE_LIMIT: usize = 1000;

/// Maximum members in one job group
pub const DEFAULT_GROUP_LIMIT: usize = 100;

/// Idle time after which a target connection gets a keepalive statement (1 hour)
pub const DEFAULT_KEEPALIVE_INTERVAL_SECS: u64 = 60 * 60;

/// Worker configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub name: String,
    pub queue_limit: usize,
    /// Transition to FAILED on the first job error instead of continuing
    pub exit_on_error: bool,
}

impl WorkerConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_queue_limit(mut self, queue_limit: usize) -> Self {
        self.queue_limit = queue_limit;
        self
    }

    pub fn with_exit_on_error(mut self, exit_on_error: bool) -> Self {
        self.exit_on_error = exit_on_error;
        self
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            name: "publish".to_string(),
            queue_limit: DEFAULT_QUEUE_LIMIT,
            exit_on_error: false,
        }
    }
}

/// Publish pipeline configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PublishConfig {
    pub worker: WorkerConfig,
    pub group_limit: usize,
    pub keepalive_interval_secs: u64,
    /// None waits for target locks without bound
    pub lock_timeout_ms: Option<u64>,
}

impl PublishConfig {
    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_secs(self.keepalive_interval_secs)
    }

    pub fn lock_timeout(&self) -> Option<Duration> {
        self.lock_timeout_ms.map(Duration::from_millis)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.worker.name.trim().is_empty() {
            return Err("worker name cannot be empty".to_string());
        }
        if self.worker.queue_limit == 0 {
            return Err("queue limit must be at least 1".to_string());
        }
        if self.group_limit == 0 {
            return Err("group limit must be at least 1".to_string());
        }
        if self.keepalive_interval_secs == 0 {
            return Err("keepalive interval must be at least 1 second".to_string());
        }
        Ok(())
    }
}

impl Default for PublishConfig {
    fn default() -> Self {
        Self {
            worker: WorkerConfig::default(),
            group_limit: DEFAULT_GROUP_LIMIT,
            keepalive_interval_secs: DEFAULT_KEEPALIVE_INTERVAL_SECS,
            lock_timeout_ms: None,
        }
    }
}
