// ContentMap Infrastructure - SQLite Adapter
// Implements: ContentStore (contentmap table), LockService (publish_locks table)

mod connection;
mod content_store;
mod error;
mod lock_service;
mod migration;

pub use connection::create_pool;
pub use content_store::{SqliteContentStore, SqliteStoreTransaction};
pub use lock_service::{SqliteLockService, DEFAULT_LEASE_TTL, DEFAULT_POLL_INTERVAL};
pub use migration::run_migrations;
