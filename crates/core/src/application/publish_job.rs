// Publish job: one content write against one target, batchable per target

use crate::application::context::PublishContext;
use crate::application::job::{Job, JobContext};
use crate::application::job_group::{GroupHooks, JobGroup};
use crate::domain::{PublishOp, TargetKey};
use crate::error::{PublishError, Result};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, warn};

/// Applies one [`PublishOp`] to a target
///
/// Run alone, the job opens its own transaction scope. Consecutive jobs for
/// the same target are folded into a group that shares one scope opened by
/// [`BatchTransactionHooks`].
pub struct PublishObjectJob {
    ctx: Arc<PublishContext>,
    target: TargetKey,
    op: PublishOp,
}

impl PublishObjectJob {
    pub fn new(ctx: Arc<PublishContext>, target: impl Into<TargetKey>, op: PublishOp) -> Self {
        Self {
            ctx,
            target: target.into(),
            op,
        }
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn op(&self) -> &PublishOp {
        &self.op
    }
}

#[async_trait]
impl Job for PublishObjectJob {
    fn description(&self) -> String {
        format!(
            "{} {} on {}",
            self.op.kind(),
            self.op.object().content_id(),
            self.target
        )
    }

    fn group(&self) -> Option<JobGroup> {
        let hooks = BatchTransactionHooks::new(Arc::clone(&self.ctx), self.target.clone());
        Some(JobGroup::new(
            format!("publish:{}", self.target),
            Arc::new(hooks),
            self.ctx.config().group_limit,
        ))
    }

    async fn process(&mut self, jc: &JobContext) -> Result<u64> {
        if let Some(batch) = jc.transaction() {
            let mut scope = batch.lock().await;
            if scope.key() != self.target {
                return Err(PublishError::InvalidState(format!(
                    "batch transaction is on '{}', job targets '{}'",
                    scope.key(),
                    self.target
                )));
            }
            scope.apply(&self.op).await?;
            return Ok(1);
        }

        let mut scope = self.ctx.begin(&self.target).await?;
        match scope.apply(&self.op).await {
            Ok(()) => {
                scope.mark_success();
                scope.close().await?;
                Ok(1)
            }
            Err(e) => {
                if let Err(close_error) = scope.close().await {
                    warn!(key = %self.target, error = %close_error, "Rollback after failed write reported an error");
                }
                Err(e)
            }
        }
    }
}

/// Opens one transaction scope for a whole group and closes it afterwards:
/// committed when every member succeeded, rolled back otherwise. A rolled
/// back batch is replayed with one scope per member, so only the broken
/// member is lost.
pub struct BatchTransactionHooks {
    ctx: Arc<PublishContext>,
    target: TargetKey,
}

impl BatchTransactionHooks {
    pub fn new(ctx: Arc<PublishContext>, target: impl Into<TargetKey>) -> Self {
        Self {
            ctx,
            target: target.into(),
        }
    }
}

#[async_trait]
impl GroupHooks for BatchTransactionHooks {
    async fn pre_process(&self, ctx: &mut JobContext, members: usize) -> Result<()> {
        let scope = self.ctx.begin(&self.target).await?;
        debug!(key = %self.target, members = %members, "Batch transaction opened");
        ctx.set_transaction(Arc::new(tokio::sync::Mutex::new(scope)));
        Ok(())
    }

    async fn post_process(&self, ctx: &mut JobContext, failed: bool) -> Result<()> {
        let Some(batch) = ctx.take_transaction() else {
            return Err(PublishError::InvalidState(format!(
                "no batch transaction open on '{}'",
                self.target
            )));
        };
        // a leaked clone keeps the scope alive; its drop rolls back
        let mut scope = Arc::try_unwrap(batch)
            .map_err(|_| {
                PublishError::InvalidState(format!(
                    "batch transaction on '{}' is still shared",
                    self.target
                ))
            })?
            .into_inner();
        if !failed {
            scope.mark_success();
        }
        let writes = scope.writes();
        scope.close().await?;
        debug!(key = %self.target, writes = %writes, committed = %!failed, "Batch transaction closed");
        Ok(())
    }

    fn replays_failed_batch(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::worker::Worker;
    use crate::domain::{ContentObject, PublishConfig, WorkerConfig};
    use crate::port::content_store::mocks::MockContentStore;
    use crate::port::publish_handler::mocks::RecordingHandler;
    use serde_json::json;
    use tokio::sync::oneshot;
    use tokio_test::{assert_err, assert_ok};

    const KEY: &str = "cr_trx_1";

    fn context(store: &MockContentStore, handler: &Arc<RecordingHandler>) -> Arc<PublishContext> {
        let ctx = PublishContext::new(PublishConfig::default(), vec![]);
        ctx.register_target(KEY, Arc::new(store.clone()), vec![handler.clone()]);
        Arc::new(ctx)
    }

    fn create(ctx: &Arc<PublishContext>, id: u64) -> PublishObjectJob {
        let object = ContentObject::new(10007, id).with_attribute("name", json!("article"));
        PublishObjectJob::new(Arc::clone(ctx), KEY, PublishOp::Create { object })
    }

    /// Occupies the worker until released
    struct Gate(Option<oneshot::Receiver<()>>);

    #[async_trait]
    impl Job for Gate {
        fn description(&self) -> String {
            "gate".to_string()
        }

        async fn process(&mut self, _ctx: &JobContext) -> Result<u64> {
            if let Some(rx) = self.0.take() {
                let _ = rx.await;
            }
            Ok(0)
        }
    }

    #[tokio::test]
    async fn test_single_job_commits_own_scope() {
        let store = MockContentStore::new();
        let handler = Arc::new(RecordingHandler::new("h"));
        let ctx = context(&store, &handler);

        let mut job = create(&ctx, 1);
        assert_eq!(job.description(), "create 10007.1 on cr_trx_1");
        let units = assert_ok!(job.process(&JobContext::detached("test")).await);

        assert_eq!(units, 1);
        assert_eq!(store.events(), vec!["begin", "put 10007.1", "commit"]);
        assert_eq!(ctx.locks().available_permits(KEY), 1);
    }

    #[tokio::test]
    async fn test_single_job_failure_rolls_back() {
        let store = MockContentStore::new();
        store.fail_put_for("10007.1");
        let handler = Arc::new(RecordingHandler::new("h"));
        let ctx = context(&store, &handler);

        let mut job = create(&ctx, 1);
        assert_err!(job.process(&JobContext::detached("test")).await);

        assert_eq!(store.events(), vec!["begin", "rollback"]);
        assert_eq!(handler.events(), vec!["h open", "h rollback", "h close"]);
        assert_eq!(ctx.locks().available_permits(KEY), 1);
    }

    #[tokio::test]
    async fn test_group_shares_one_transaction() {
        let store = MockContentStore::new();
        let handler = Arc::new(RecordingHandler::new("h"));
        let ctx = context(&store, &handler);

        let first = create(&ctx, 1);
        let mut group = first.group().unwrap();
        assert_eq!(group.key(), "publish:cr_trx_1");
        assert!(group.add(Box::new(first)).is_ok());
        assert!(group.add(Box::new(create(&ctx, 2))).is_ok());
        assert!(group.add(Box::new(create(&ctx, 3))).is_ok());

        let units = assert_ok!(group.process(&JobContext::detached("test")).await);

        assert_eq!(units, 3);
        assert_eq!(
            store.events(),
            vec!["begin", "put 10007.1", "put 10007.2", "put 10007.3", "commit"]
        );
        assert_eq!(handler.events().first().map(String::as_str), Some("h open"));
        assert_eq!(handler.events().last().map(String::as_str), Some("h close"));
        assert_eq!(ctx.locks().available_permits(KEY), 1);
    }

    #[tokio::test]
    async fn test_group_member_failure_replays_the_rest() {
        let store = MockContentStore::new();
        store.fail_put_for("10007.2");
        let handler = Arc::new(RecordingHandler::new("h"));
        let ctx = context(&store, &handler);

        let mut group = create(&ctx, 1).group().unwrap();
        for id in 1..=3 {
            assert!(group.add(Box::new(create(&ctx, id))).is_ok());
        }
        let jc = JobContext::detached("test");
        let units = assert_ok!(group.process(&jc).await);

        assert_eq!(units, 2);
        assert_eq!(
            store.events(),
            vec![
                "begin",
                "put 10007.1",
                "rollback",
                "begin",
                "put 10007.1",
                "commit",
                "begin",
                "rollback",
                "begin",
                "put 10007.3",
                "commit",
            ]
        );
        assert_eq!(store.with_state(|s| s.objects.len()), 2);
        let stats = jc.stats().lock().unwrap().snapshot();
        assert_eq!(stats.work_units, 2);
        assert_eq!(stats.failures, 1);
        assert_eq!(jc.last_failure().map(|f| f.job), Some("create 10007.2 on cr_trx_1".to_string()));
        assert_eq!(ctx.locks().available_permits(KEY), 1);
    }

    #[tokio::test]
    async fn test_failed_batch_commit_replays_members() {
        let store = MockContentStore::new();
        let handler = Arc::new(RecordingHandler::new("h"));
        let ctx = context(&store, &handler);
        store.fail_next_commit();

        let mut group = create(&ctx, 1).group().unwrap();
        for id in 1..=2 {
            assert!(group.add(Box::new(create(&ctx, id))).is_ok());
        }
        let jc = JobContext::detached("test");
        assert_eq!(assert_ok!(group.process(&jc).await), 2);

        assert_eq!(store.with_state(|s| s.objects.len()), 2);
        assert_eq!(jc.failures(), 0);
        assert_eq!(ctx.locks().available_permits(KEY), 1);
    }

    #[tokio::test]
    async fn test_member_rejects_foreign_batch() {
        let store = MockContentStore::new();
        let handler = Arc::new(RecordingHandler::new("h"));
        let ctx = context(&store, &handler);
        ctx.register_target("other", Arc::new(MockContentStore::new()), vec![]);

        let mut jc = JobContext::detached("test");
        let hooks = BatchTransactionHooks::new(Arc::clone(&ctx), "other");
        hooks.pre_process(&mut jc, 1).await.unwrap();

        let mut job = create(&ctx, 1);
        let err = assert_err!(job.process(&jc).await);
        assert!(matches!(err, PublishError::InvalidState(_)));

        hooks.post_process(&mut jc, true).await.unwrap();
        assert_eq!(ctx.locks().available_permits("other"), 1);
    }

    #[tokio::test]
    async fn test_worker_batches_queued_jobs() {
        let store = MockContentStore::new();
        let handler = Arc::new(RecordingHandler::new("h"));
        let ctx = context(&store, &handler);

        let worker = Worker::new(WorkerConfig::new("publish"));
        worker.start().unwrap();
        let (release, gate) = oneshot::channel();
        worker.submit(Box::new(Gate(Some(gate)))).unwrap();
        for id in 1..=4 {
            worker.submit(Box::new(create(&ctx, id))).unwrap();
        }
        assert_eq!(worker.queue_len(), 5);
        release.send(()).unwrap();

        worker.flush().await;

        let begins = store.with_state(|s| s.begins);
        assert_eq!(begins, 1);
        assert_eq!(store.with_state(|s| s.objects.len()), 4);
        let stats = worker.stats();
        assert_eq!(stats.work_units, 4);
        worker.stop();
        worker.join().await.unwrap();
    }
}
