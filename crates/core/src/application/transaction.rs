// Transaction scope: one locked write transaction against a publish target

use crate::application::context::{PublishContext, PublishTarget};
use crate::application::semaphore_map::LockGuard;
use crate::domain::{ContentObject, PublishOp};
use crate::error::{PublishError, Result};
use crate::port::{PublishHandler, StoreTransaction};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

type CommitCallback = Box<dyn FnOnce() + Send>;

/// A write transaction holding the target's lock
///
/// `begin` acquires the target lock, begins the store transaction and opens
/// every registered handler. `close` commits if [`mark_success`] was called
/// and rolls back otherwise; either way the lock is released exactly once as
/// the last step. A scope dropped without `close` rolls back on a spawned task.
///
/// [`mark_success`]: TransactionScope::mark_success
pub struct TransactionScope {
    target: Arc<PublishTarget>,
    guard: Option<LockGuard>,
    tx: Option<Box<dyn StoreTransaction>>,
    opened: Vec<Arc<dyn PublishHandler>>,
    success: bool,
    on_commit: Option<CommitCallback>,
    writes: u64,
}

impl TransactionScope {
    pub async fn begin(ctx: &PublishContext, key: &str) -> Result<Self> {
        let target = ctx.target(key)?;
        let guard = match ctx.config().lock_timeout() {
            Some(timeout) => ctx.locks().acquire_timeout(key, timeout).await?,
            None => ctx.locks().acquire(key).await?,
        };

        let tx = match target.store().begin().await {
            Ok(tx) => tx,
            Err(e) => {
                error!(key = %key, error = %e, "Failed to begin transaction");
                guard.release().await;
                return Err(e);
            }
        };

        let mut scope = Self {
            target,
            guard: Some(guard),
            tx: Some(tx),
            opened: Vec::new(),
            success: false,
            on_commit: None,
            writes: 0,
        };

        let timestamp = ctx.now_millis();
        let handlers = scope.target.handlers().to_vec();
        for handler in handlers {
            if let Err(e) = handler.open(timestamp).await {
                error!(key = %key, handler = %handler.name(), error = %e, "Failed to open publish handler");
                if let Some(rollback_error) = scope.finish_rollback().await {
                    warn!(key = %key, error = %rollback_error, "Rollback after failed open reported an error");
                }
                return Err(e);
            }
            scope.opened.push(handler);
        }

        debug!(key = %key, handlers = %scope.opened.len(), "Transaction begun");
        Ok(scope)
    }

    pub fn key(&self) -> &str {
        self.target.key()
    }

    /// Route the eventual `close` to commit
    pub fn mark_success(&mut self) {
        self.success = true;
    }

    pub fn is_success(&self) -> bool {
        self.success
    }

    /// Run `callback` after a successful commit
    pub fn on_commit(&mut self, callback: impl FnOnce() + Send + 'static) {
        self.on_commit = Some(Box::new(callback));
    }

    /// Objects written so far
    pub fn writes(&self) -> u64 {
        self.writes
    }

    fn tx_mut(&mut self) -> Result<&mut Box<dyn StoreTransaction>> {
        self.tx
            .as_mut()
            .ok_or_else(|| PublishError::InvalidState("transaction already finished".to_string()))
    }

    pub async fn create_object(&mut self, object: &ContentObject) -> Result<()> {
        object.validate()?;
        self.tx_mut()?.put_object(object).await?;
        for handler in &self.opened {
            handler.create_object(object).await?;
        }
        self.writes += 1;
        Ok(())
    }

    /// `changed` may be empty when `previous` is given; it is then derived
    pub async fn update_object(
        &mut self,
        object: &ContentObject,
        previous: Option<&ContentObject>,
        changed: &[String],
    ) -> Result<()> {
        object.validate()?;
        let derived;
        let changed = match previous {
            Some(previous) if changed.is_empty() => {
                derived = object.changed_attributes(previous);
                derived.as_slice()
            }
            _ => changed,
        };

        self.tx_mut()?.put_object(object).await?;
        for handler in &self.opened {
            handler.update_object(object, previous, changed).await?;
        }
        self.writes += 1;
        Ok(())
    }

    pub async fn delete_object(&mut self, object: &ContentObject) -> Result<()> {
        self.tx_mut()?.delete_object(object).await?;
        for handler in &self.opened {
            handler.delete_object(object).await?;
        }
        self.writes += 1;
        Ok(())
    }

    pub async fn apply(&mut self, op: &PublishOp) -> Result<()> {
        op.validate()?;
        match op {
            PublishOp::Create { object } => self.create_object(object).await,
            PublishOp::Update {
                object,
                previous,
                changed,
            } => self.update_object(object, previous.as_ref(), changed).await,
            PublishOp::Delete { object } => self.delete_object(object).await,
        }
    }

    /// Commit or roll back, then release the lock
    pub async fn close(mut self) -> Result<()> {
        if self.success {
            self.finish_commit().await
        } else {
            match self.finish_rollback().await {
                Some(e) => Err(e),
                None => Ok(()),
            }
        }
    }

    async fn finish_commit(&mut self) -> Result<()> {
        let Some(mut tx) = self.tx.take() else {
            self.release_lock().await;
            return Err(PublishError::InvalidState(
                "transaction already finished".to_string(),
            ));
        };

        if let Err(commit_error) = tx.commit().await {
            error!(key = %self.key(), error = %commit_error, "Commit failed, rolling back");
            match tx.rollback().await {
                Ok(()) => info!(key = %self.key(), "Store transaction finished after failed commit"),
                Err(e) => error!(key = %self.key(), error = %e, "Rollback after failed commit failed"),
            }
            self.rollback_handlers().await;
            self.release_lock().await;
            return Err(commit_error);
        }

        let mut first_error = None;
        for handler in std::mem::take(&mut self.opened) {
            if let Err(e) = handler.commit().await {
                error!(key = %self.key(), handler = %handler.name(), error = %e, "Publish handler commit failed");
                first_error.get_or_insert(e);
            }
            if let Err(e) = handler.close().await {
                error!(key = %self.key(), handler = %handler.name(), error = %e, "Publish handler close failed");
                first_error.get_or_insert(e);
            }
        }

        self.target.touch();
        if first_error.is_none() {
            if let Some(callback) = self.on_commit.take() {
                callback();
            }
        }
        debug!(key = %self.key(), writes = %self.writes, "Transaction committed");
        self.release_lock().await;

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Roll back store and handlers, release the lock; returns the first error
    async fn finish_rollback(&mut self) -> Option<PublishError> {
        let mut first_error = None;
        if let Some(mut tx) = self.tx.take() {
            if let Err(e) = tx.rollback().await {
                error!(key = %self.key(), error = %e, "Rollback failed");
                first_error = Some(e);
            }
        }
        if let Some(e) = self.rollback_handlers().await {
            first_error.get_or_insert(e);
        }
        debug!(key = %self.key(), "Transaction rolled back");
        self.release_lock().await;
        first_error
    }

    async fn rollback_handlers(&mut self) -> Option<PublishError> {
        let mut first_error = None;
        for handler in std::mem::take(&mut self.opened) {
            if let Err(e) = handler.rollback().await {
                error!(key = %self.key(), handler = %handler.name(), error = %e, "Publish handler rollback failed");
                first_error.get_or_insert(e);
            }
            if let Err(e) = handler.close().await {
                error!(key = %self.key(), handler = %handler.name(), error = %e, "Publish handler close failed");
                first_error.get_or_insert(e);
            }
        }
        first_error
    }

    async fn release_lock(&mut self) {
        if let Some(guard) = self.guard.take() {
            guard.release().await;
        }
    }
}

impl std::fmt::Debug for TransactionScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionScope")
            .field("key", &self.key())
            .field("open", &self.tx.is_some())
            .field("handlers", &self.opened.len())
            .field("success", &self.success)
            .field("writes", &self.writes)
            .finish()
    }
}

impl Drop for TransactionScope {
    fn drop(&mut self) {
        let Some(guard) = self.guard.take() else {
            return;
        };
        warn!(key = %self.key(), "Transaction scope dropped without close, rolling back");

        let key = self.key().to_string();
        let tx = self.tx.take();
        let handlers = std::mem::take(&mut self.opened);
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            // the guard's own drop frees the local permit
            return;
        };
        runtime.spawn(async move {
            if let Some(mut tx) = tx {
                if let Err(e) = tx.rollback().await {
                    error!(key = %key, error = %e, "Rollback of dropped scope failed");
                }
            }
            for handler in handlers {
                if let Err(e) = handler.rollback().await {
                    error!(key = %key, handler = %handler.name(), error = %e, "Publish handler rollback failed");
                }
                if let Err(e) = handler.close().await {
                    error!(key = %key, handler = %handler.name(), error = %e, "Publish handler close failed");
                }
            }
            guard.release().await;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::PublishConfig;
    use crate::port::content_store::mocks::MockContentStore;
    use crate::port::publish_handler::mocks::RecordingHandler;
    use crate::port::time_provider::mocks::FixedTimeProvider;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;
    use tokio_test::{assert_err, assert_ok};

    const KEY: &str = "cr_trx_1";

    fn context(
        store: &MockContentStore,
        handlers: Vec<Arc<dyn PublishHandler>>,
    ) -> PublishContext {
        let ctx = PublishContext::new(PublishConfig::default(), vec![])
            .with_time_provider(Arc::new(FixedTimeProvider::new(1_000)));
        ctx.register_target(KEY, Arc::new(store.clone()), handlers);
        ctx
    }

    fn article(id: u64) -> ContentObject {
        ContentObject::new(10007, id).with_attribute("name", json!(format!("article {}", id)))
    }

    #[tokio::test]
    async fn test_success_commits_store_and_handlers() {
        let store = MockContentStore::new();
        let handler = Arc::new(RecordingHandler::new("h"));
        let ctx = context(&store, vec![handler.clone()]);

        let committed = Arc::new(AtomicBool::new(false));
        let mut scope = assert_ok!(ctx.begin(KEY).await);
        assert_eq!(ctx.locks().available_permits(KEY), 0);
        scope.create_object(&article(1)).await.unwrap();
        scope.mark_success();
        let flag = committed.clone();
        scope.on_commit(move || flag.store(true, Ordering::SeqCst));
        assert_ok!(scope.close().await);

        assert_eq!(ctx.locks().available_permits(KEY), 1);
        assert!(committed.load(Ordering::SeqCst));
        assert_eq!(store.events(), vec!["begin", "put 10007.1", "commit"]);
        assert_eq!(
            handler.events(),
            vec!["h open", "h create 10007.1", "h commit", "h close"]
        );
        assert!(store.with_state(|s| s.objects.contains_key("10007.1")));
    }

    #[tokio::test]
    async fn test_close_without_success_rolls_back() {
        let store = MockContentStore::new();
        let handler = Arc::new(RecordingHandler::new("h"));
        let ctx = context(&store, vec![handler.clone()]);

        let mut scope = ctx.begin(KEY).await.unwrap();
        scope.create_object(&article(1)).await.unwrap();
        assert_ok!(scope.close().await);

        assert_eq!(ctx.locks().available_permits(KEY), 1);
        assert_eq!(store.with_state(|s| (s.commits, s.rollbacks)), (0, 1));
        assert_eq!(
            handler.events(),
            vec!["h open", "h create 10007.1", "h rollback", "h close"]
        );
        assert!(store.with_state(|s| s.objects.is_empty()));
    }

    #[tokio::test]
    async fn test_commit_failure_rolls_back_and_surfaces_commit_error() {
        let store = MockContentStore::failing_commit();
        let handler = Arc::new(RecordingHandler::new("h"));
        let ctx = context(&store, vec![handler.clone()]);

        let mut scope = ctx.begin(KEY).await.unwrap();
        scope.create_object(&article(1)).await.unwrap();
        scope.mark_success();
        let err = assert_err!(scope.close().await);

        assert_eq!(err.to_string(), "Store error: mock commit failure");
        assert_eq!(
            store.events(),
            vec!["begin", "put 10007.1", "commit failed", "rollback"]
        );
        assert_eq!(
            handler.events(),
            vec!["h open", "h create 10007.1", "h rollback", "h close"]
        );
        assert_eq!(ctx.locks().available_permits(KEY), 1);
    }

    #[tokio::test]
    async fn test_begin_failure_releases_lock() {
        let store = MockContentStore::failing_begin();
        let handler = Arc::new(RecordingHandler::new("h"));
        let ctx = context(&store, vec![handler.clone()]);

        let result = ctx.begin(KEY).await;
        assert!(matches!(result, Err(PublishError::Store(_))));
        assert_eq!(ctx.locks().available_permits(KEY), 1);
        assert!(handler.events().is_empty());
    }

    #[tokio::test]
    async fn test_failed_open_rolls_back_already_opened_handlers() {
        let store = MockContentStore::new();
        let first = Arc::new(RecordingHandler::new("first"));
        let second = Arc::new(RecordingHandler::failing_on("second", "open"));
        let third = Arc::new(RecordingHandler::new("third"));
        let ctx = context(&store, vec![first.clone(), second, third.clone()]);

        let result = ctx.begin(KEY).await;

        assert!(matches!(result, Err(PublishError::Handler { .. })));
        assert_eq!(
            first.events(),
            vec!["first open", "first rollback", "first close"]
        );
        assert!(third.events().is_empty());
        assert_eq!(store.with_state(|s| s.rollbacks), 1);
        assert_eq!(ctx.locks().available_permits(KEY), 1);
    }

    #[tokio::test]
    async fn test_handler_write_failure_leaves_nothing_held() {
        let store = MockContentStore::new();
        let handler = Arc::new(RecordingHandler::failing_on("h", "create"));
        let ctx = context(&store, vec![handler.clone()]);

        let mut scope = ctx.begin(KEY).await.unwrap();
        let err = assert_err!(scope.create_object(&article(1)).await);
        assert!(matches!(err, PublishError::Handler { .. }));
        assert_ok!(scope.close().await);

        assert_eq!(handler.events(), vec!["h open", "h rollback", "h close"]);
        assert_eq!(store.with_state(|s| s.rollbacks), 1);
        assert_eq!(ctx.locks().available_permits(KEY), 1);
    }

    #[tokio::test]
    async fn test_handler_commit_failure_still_closes_everything() {
        let store = MockContentStore::new();
        let failing = Arc::new(RecordingHandler::failing_on("a", "commit"));
        let other = Arc::new(RecordingHandler::new("b"));
        let ctx = context(&store, vec![failing.clone(), other.clone()]);

        let committed = Arc::new(AtomicBool::new(false));
        let mut scope = ctx.begin(KEY).await.unwrap();
        scope.delete_object(&article(3)).await.unwrap();
        scope.mark_success();
        let flag = committed.clone();
        scope.on_commit(move || flag.store(true, Ordering::SeqCst));
        let result = scope.close().await;

        assert!(matches!(result, Err(PublishError::Handler { .. })));
        assert_eq!(failing.events(), vec!["a open", "a delete 10007.3", "a close"]);
        assert_eq!(
            other.events(),
            vec!["b open", "b delete 10007.3", "b commit", "b close"]
        );
        assert!(!committed.load(Ordering::SeqCst));
        assert_eq!(ctx.locks().available_permits(KEY), 1);
    }

    #[tokio::test]
    async fn test_update_derives_changed_attributes() {
        let store = MockContentStore::new();
        let handler = Arc::new(RecordingHandler::new("h"));
        let ctx = context(&store, vec![handler.clone()]);

        let previous = article(2);
        let current = article(2).with_attribute("teaser", json!("new"));
        let mut scope = ctx.begin(KEY).await.unwrap();
        scope
            .apply(&PublishOp::Update {
                object: current,
                previous: Some(previous),
                changed: vec![],
            })
            .await
            .unwrap();
        assert_eq!(scope.writes(), 1);
        scope.mark_success();
        scope.close().await.unwrap();

        assert_eq!(handler.events()[1], "h update 10007.2 [teaser]");
    }

    #[tokio::test]
    async fn test_dropped_scope_rolls_back_and_frees_lock() {
        let store = MockContentStore::new();
        let handler = Arc::new(RecordingHandler::new("h"));
        let ctx = context(&store, vec![handler.clone()]);

        {
            let mut scope = ctx.begin(KEY).await.unwrap();
            scope.create_object(&article(1)).await.unwrap();
            scope.mark_success();
        }

        let guard = ctx
            .locks()
            .acquire_timeout(KEY, Duration::from_secs(5))
            .await
            .unwrap();
        guard.release().await;
        assert_eq!(store.with_state(|s| (s.commits, s.rollbacks)), (0, 1));
        assert_eq!(
            handler.events(),
            vec!["h open", "h create 10007.1", "h rollback", "h close"]
        );
    }

    #[tokio::test]
    async fn test_scopes_on_same_target_are_serialized() {
        let store = MockContentStore::new();
        let ctx = Arc::new(context(&store, vec![]));

        let mut handles = Vec::new();
        for id in 1..=5 {
            let ctx = Arc::clone(&ctx);
            handles.push(tokio::spawn(async move {
                let mut scope = ctx.begin(KEY).await.unwrap();
                scope.create_object(&article(id)).await.unwrap();
                tokio::task::yield_now().await;
                scope.mark_success();
                scope.close().await.unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        // begin/put/commit triples never interleave
        let events = store.events();
        assert_eq!(events.len(), 15);
        for triple in events.chunks(3) {
            assert_eq!(triple[0], "begin");
            assert!(triple[1].starts_with("put "));
            assert_eq!(triple[2], "commit");
        }
        assert_eq!(ctx.locks().available_permits(KEY), 1);
    }
}
