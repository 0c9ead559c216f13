// Publish handler that reports every transaction through tracing

use async_trait::async_trait;
use contentmap_core::domain::ContentObject;
use contentmap_core::error::Result;
use contentmap_core::port::PublishHandler;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use tracing::{debug, info};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct Counts {
    created: u64,
    updated: u64,
    deleted: u64,
}

/// Logs a summary per committed transaction and keeps running totals
pub struct LogHandler {
    started_at: Mutex<i64>,
    current: Mutex<Counts>,
    committed: AtomicU64,
}

impl LogHandler {
    pub fn new() -> Self {
        Self {
            started_at: Mutex::new(0),
            current: Mutex::new(Counts::default()),
            committed: AtomicU64::new(0),
        }
    }

    /// Objects written by committed transactions
    pub fn committed(&self) -> u64 {
        self.committed.load(Ordering::Relaxed)
    }

    fn count(&self, f: impl FnOnce(&mut Counts)) {
        f(&mut self.current.lock().unwrap_or_else(PoisonError::into_inner));
    }

    fn take_counts(&self) -> Counts {
        std::mem::take(&mut *self.current.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

impl Default for LogHandler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PublishHandler for LogHandler {
    fn name(&self) -> &str {
        "log"
    }

    async fn open(&self, timestamp: i64) -> Result<()> {
        *self.started_at.lock().unwrap_or_else(PoisonError::into_inner) = timestamp;
        self.take_counts();
        Ok(())
    }

    async fn create_object(&self, object: &ContentObject) -> Result<()> {
        debug!(content_id = %object.content_id(), "create");
        self.count(|c| c.created += 1);
        Ok(())
    }

    async fn update_object(
        &self,
        object: &ContentObject,
        _previous: Option<&ContentObject>,
        changed: &[String],
    ) -> Result<()> {
        debug!(content_id = %object.content_id(), changed = ?changed, "update");
        self.count(|c| c.updated += 1);
        Ok(())
    }

    async fn delete_object(&self, object: &ContentObject) -> Result<()> {
        debug!(content_id = %object.content_id(), "delete");
        self.count(|c| c.deleted += 1);
        Ok(())
    }

    async fn commit(&self) -> Result<()> {
        let counts = self.take_counts();
        let started_at = *self.started_at.lock().unwrap_or_else(PoisonError::into_inner);
        self.committed
            .fetch_add(counts.created + counts.updated + counts.deleted, Ordering::Relaxed);
        info!(
            started_at = %started_at,
            created = %counts.created,
            updated = %counts.updated,
            deleted = %counts.deleted,
            "Published transaction"
        );
        Ok(())
    }

    async fn rollback(&self) -> Result<()> {
        let counts = self.take_counts();
        info!(
            discarded = %(counts.created + counts.updated + counts.deleted),
            "Transaction rolled back"
        );
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::assert_ok;

    #[tokio::test]
    async fn test_counts_only_committed_writes() {
        let handler = LogHandler::new();
        let object = ContentObject::new(10007, 1);

        assert_ok!(handler.open(1).await);
        assert_ok!(handler.create_object(&object).await);
        assert_ok!(handler.update_object(&object, None, &[]).await);
        assert_ok!(handler.commit().await);
        assert_ok!(handler.close().await);

        assert_ok!(handler.open(2).await);
        assert_ok!(handler.delete_object(&object).await);
        assert_ok!(handler.rollback().await);
        assert_ok!(handler.close().await);

        assert_eq!(handler.committed(), 2);
    }
}
