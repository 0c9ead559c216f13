// Domain Layer - content objects, worker lifecycle, configuration

pub mod config;
pub mod content;
pub mod error;
pub mod worker_state;

// Re-exports
pub use config::{PublishConfig, WorkerConfig};
pub use content::{ContentObject, PublishOp, TargetKey};
pub use error::DomainError;
pub use worker_state::WorkerState;
