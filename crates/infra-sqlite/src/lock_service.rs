// SQLite LockService Implementation
// A row in publish_locks marks the key as held; processes sharing the
// database file exclude each other per target

use crate::error::map_sqlx_error;
use async_trait::async_trait;
use contentmap_core::error::{PublishError, Result};
use contentmap_core::port::time_provider::SystemTimeProvider;
use contentmap_core::port::{LockService, TimeProvider};
use sqlx::SqlitePool;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{debug, warn};
use uuid::Uuid;

/// Interval between attempts on a held lock
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Age after which a lock row is considered abandoned by a dead owner
pub const DEFAULT_LEASE_TTL: Duration = Duration::from_secs(600);

/// Lock rows are leases: a row older than the lease TTL may be taken over by
/// another owner, so a crashed process cannot block a target forever. The
/// TTL must exceed the longest transaction a live owner keeps open.
pub struct SqliteLockService {
    pool: SqlitePool,
    owner: String,
    poll_interval: Duration,
    lease_ttl: Duration,
    time_provider: Arc<dyn TimeProvider>,
}

impl SqliteLockService {
    /// Each instance is a distinct owner
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            owner: Uuid::new_v4().to_string(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            lease_ttl: DEFAULT_LEASE_TTL,
            time_provider: Arc::new(SystemTimeProvider),
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_lease_ttl(mut self, lease_ttl: Duration) -> Self {
        self.lease_ttl = lease_ttl;
        self
    }

    pub fn with_time_provider(mut self, time_provider: Arc<dyn TimeProvider>) -> Self {
        self.time_provider = time_provider;
        self
    }

    pub fn lease_ttl(&self) -> Duration {
        self.lease_ttl
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Current owner of `key`, if anyone holds it
    pub async fn holder(&self, key: &str) -> Result<Option<String>> {
        sqlx::query_scalar("SELECT owner FROM publish_locks WHERE lock_key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx_error)
    }

    /// Drop every lock this owner still holds; returns how many were held
    pub async fn release_all(&self) -> Result<u64> {
        let result = sqlx::query("DELETE FROM publish_locks WHERE owner = ?")
            .bind(&self.owner)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        Ok(result.rows_affected())
    }

    /// Insert the lock row, or take over a row whose lease has run out
    async fn try_acquire(&self, key: &str) -> Result<bool> {
        let now = self.time_provider.now_millis();
        let ttl = i64::try_from(self.lease_ttl.as_millis()).unwrap_or(i64::MAX);
        let stale_before = now.saturating_sub(ttl);

        let result = sqlx::query(
            r#"
            INSERT INTO publish_locks (lock_key, owner, acquired_at)
            VALUES (?, ?, ?)
            ON CONFLICT(lock_key) DO UPDATE SET
                owner = excluded.owner,
                acquired_at = excluded.acquired_at
            WHERE publish_locks.acquired_at < ?
            "#,
        )
        .bind(key)
        .bind(&self.owner)
        .bind(now)
        .bind(stale_before)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        Ok(result.rows_affected() == 1)
    }
}

#[async_trait]
impl LockService for SqliteLockService {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn acquire(&self, key: &str) -> Result<()> {
        while !self.try_acquire(key).await? {
            sleep(self.poll_interval).await;
        }
        debug!(key = %key, owner = %self.owner, "Acquired publish lock");
        Ok(())
    }

    async fn acquire_timeout(&self, key: &str, timeout: Duration) -> Result<()> {
        let started = Instant::now();
        loop {
            if self.try_acquire(key).await? {
                debug!(key = %key, owner = %self.owner, "Acquired publish lock");
                return Ok(());
            }
            let waited = started.elapsed();
            if waited >= timeout {
                let holder = self
                    .holder(key)
                    .await?
                    .map_or_else(|| "unknown".to_string(), |owner| format!("owner {}", owner));
                return Err(PublishError::LockTimeout {
                    key: key.to_string(),
                    waited_ms: waited.as_millis(),
                    holder,
                });
            }
            sleep(self.poll_interval.min(timeout - waited)).await;
        }
    }

    async fn release(&self, key: &str) -> Result<()> {
        let result = sqlx::query("DELETE FROM publish_locks WHERE lock_key = ? AND owner = ?")
            .bind(key)
            .bind(&self.owner)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_error)?;

        if result.rows_affected() == 0 {
            warn!(key = %key, owner = %self.owner, "Publish lock was no longer held at release");
        }
        Ok(())
    }
}
