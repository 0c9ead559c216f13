//! Environment configuration for the publisher
//!
//! # Environment Variables
//!
//! - `CONTENTMAP_DB_PATH`: content database file (default `~/.contentmap/contentmap.db`,
//!   `sqlite::memory:` for a throwaway store)
//! - `CONTENTMAP_LOCK_DB_PATH`: shared lock database; unset means process-local locking only
//! - `CONTENTMAP_LOCK_LEASE_SECS`: age after which another process may take over a lock
//!   left behind in the lock database
//! - `CONTENTMAP_TARGET`: publish target key (default `contentmap`)
//! - `CONTENTMAP_QUEUE_LIMIT`, `CONTENTMAP_GROUP_LIMIT`: worker queue and batch sizes
//! - `CONTENTMAP_KEEPALIVE_SECS`: idle time before a keepalive statement
//! - `CONTENTMAP_LOCK_TIMEOUT_MS`: give up acquiring the target lock after this long
//! - `CONTENTMAP_EXIT_ON_ERROR`: stop the worker on the first failed job

use contentmap_core::domain::PublishConfig;
use contentmap_core::error::{PublishError, Result};
use contentmap_infra_sqlite::DEFAULT_LEASE_TTL;
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_DB_PATH: &str = "~/.contentmap/contentmap.db";
pub const DEFAULT_TARGET: &str = "contentmap";

#[derive(Debug, Clone, PartialEq)]
pub struct DaemonConfig {
    pub db_path: String,
    pub lock_db_path: Option<String>,
    pub lock_lease: Duration,
    pub target: String,
    pub publish: PublishConfig,
}

impl DaemonConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from any variable source (tests pass a map)
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let db_path = lookup("CONTENTMAP_DB_PATH").unwrap_or_else(|| DEFAULT_DB_PATH.to_string());
        let lock_db_path = lookup("CONTENTMAP_LOCK_DB_PATH").filter(|path| !path.trim().is_empty());
        let target = lookup("CONTENTMAP_TARGET").unwrap_or_else(|| DEFAULT_TARGET.to_string());
        if target.trim().is_empty() {
            return Err(PublishError::Config("CONTENTMAP_TARGET cannot be empty".to_string()));
        }

        let lock_lease = match parse(&lookup, "CONTENTMAP_LOCK_LEASE_SECS")? {
            Some(0) => {
                return Err(PublishError::Config(
                    "CONTENTMAP_LOCK_LEASE_SECS must be positive".to_string(),
                ))
            }
            Some(secs) => Duration::from_secs(secs),
            None => DEFAULT_LEASE_TTL,
        };

        let mut publish = PublishConfig::default();
        if let Some(limit) = parse(&lookup, "CONTENTMAP_QUEUE_LIMIT")? {
            publish.worker.queue_limit = limit;
        }
        if let Some(limit) = parse(&lookup, "CONTENTMAP_GROUP_LIMIT")? {
            publish.group_limit = limit;
        }
        if let Some(secs) = parse(&lookup, "CONTENTMAP_KEEPALIVE_SECS")? {
            publish.keepalive_interval_secs = secs;
        }
        publish.lock_timeout_ms = parse(&lookup, "CONTENTMAP_LOCK_TIMEOUT_MS")?;
        if let Some(exit) = parse(&lookup, "CONTENTMAP_EXIT_ON_ERROR")? {
            publish.worker.exit_on_error = exit;
        }
        publish.validate().map_err(PublishError::Config)?;

        Ok(Self {
            db_path,
            lock_db_path,
            lock_lease,
            target,
            publish,
        })
    }

    pub fn database_url(&self) -> String {
        database_url(&self.db_path)
    }

    pub fn lock_database_url(&self) -> Option<String> {
        self.lock_db_path.as_deref().map(database_url)
    }
}

/// Tilde-expand a file path into an sqlx url; urls pass through
fn database_url(path: &str) -> String {
    if path.starts_with("sqlite:") {
        path.to_string()
    } else {
        format!("sqlite://{}", shellexpand::tilde(path))
    }
}

fn parse<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Result<Option<T>> {
    match lookup(name) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| PublishError::Config(format!("invalid value for {}: '{}'", name, raw))),
    }
}
