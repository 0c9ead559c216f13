// Port Layer - Interfaces for external collaborators

pub mod content_store;
pub mod lock_service;
pub mod publish_handler;
pub mod time_provider;

// Re-exports
pub use content_store::{ContentStore, StoreTransaction};
pub use lock_service::LockService;
pub use publish_handler::PublishHandler;
pub use time_provider::TimeProvider;
