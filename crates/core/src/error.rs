// Central Error Type for the publish pipeline

use crate::domain::WorkerState;
use std::sync::Arc;
use thiserror::Error;

/// Pipeline-level error type
#[derive(Error, Debug)]
pub enum PublishError {
    #[error("Domain error: {0}")]
    Domain(#[from] crate::domain::DomainError),

    /// Worker is stopped, aborted or failed; the caller may retry elsewhere
    #[error("Worker '{worker}' is not accepting jobs (state: {state})")]
    Rejected { worker: String, state: WorkerState },

    /// Worker was never started or its consumer task is gone
    #[error("Worker '{worker}' is unavailable (state: {state})")]
    Unavailable { worker: String, state: WorkerState },

    #[error("Job '{job}' failed: {source}")]
    JobFailed {
        job: String,
        #[source]
        source: Arc<PublishError>,
    },

    #[error("Job panicked: {0}")]
    JobPanicked(String),

    #[error("Lock '{0}' was not initialized")]
    LockNotInitialized(String),

    #[error("Timed out after {waited_ms}ms acquiring lock '{key}' (last holder: {holder})")]
    LockTimeout {
        key: String,
        waited_ms: u128,
        holder: String,
    },

    #[error("Acquiring lock '{0}' was interrupted")]
    LockInterrupted(String),

    #[error("Lock service '{service}' failed for '{key}': {message}")]
    LockService {
        service: String,
        key: String,
        message: String,
    },

    #[error("Store error: {0}")]
    Store(String),

    #[error("Publish handler '{handler}' failed: {message}")]
    Handler { handler: String, message: String },

    #[error("Unknown publish target: {0}")]
    UnknownTarget(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl PublishError {
    /// True for lock timeouts, so callers can retry a publish run later
    pub fn is_lock_timeout(&self) -> bool {
        matches!(self, PublishError::LockTimeout { .. })
    }
}

/// Result type alias using PublishError
pub type Result<T> = std::result::Result<T, PublishError>;
