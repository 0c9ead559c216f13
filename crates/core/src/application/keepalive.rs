// Keepalive for idle target connections

use crate::application::context::{PublishContext, PublishTarget};
use crate::application::job::{Job, JobContext};
use crate::application::worker::{ShutdownToken, Worker};
use crate::domain::TargetKey;
use crate::error::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Sends a no-op statement to a target that has been idle for the keepalive
/// interval. Runs under the target lock so it never overlaps a transaction.
pub struct KeepAliveJob {
    ctx: Arc<PublishContext>,
    target: TargetKey,
}

impl KeepAliveJob {
    pub fn new(ctx: Arc<PublishContext>, target: impl Into<TargetKey>) -> Self {
        Self {
            ctx,
            target: target.into(),
        }
    }
}

#[async_trait]
impl Job for KeepAliveJob {
    fn description(&self) -> String {
        format!("keepalive {}", self.target)
    }

    fn is_logged(&self) -> bool {
        false
    }

    async fn process(&mut self, _jc: &JobContext) -> Result<u64> {
        let target = self.ctx.target(&self.target)?;
        let guard = match self.ctx.config().lock_timeout() {
            Some(timeout) => self.ctx.locks().acquire_timeout(&self.target, timeout).await?,
            None => self.ctx.locks().acquire(&self.target).await?,
        };

        // a write may have landed while this job was queued
        let interval = self.ctx.config().keepalive_interval();
        let result = if target.idle_for() >= interval {
            debug!(key = %self.target, "Sending keepalive");
            target.store().keepalive().await
        } else {
            debug!(key = %self.target, "Target written recently, keepalive skipped");
            Ok(())
        };

        guard.release().await;
        result.map(|()| 0)
    }
}

/// Watches one target's activity queue and schedules a [`KeepAliveJob`]
/// whenever the target has been quiet for the keepalive interval
pub struct KeepAliveMonitor {
    ctx: Arc<PublishContext>,
    target: Arc<PublishTarget>,
    worker: Option<Arc<Worker>>,
}

impl KeepAliveMonitor {
    pub fn new(ctx: Arc<PublishContext>, target: Arc<PublishTarget>) -> Self {
        Self {
            ctx,
            target,
            worker: None,
        }
    }

    /// Queue keepalives on `worker` while it runs instead of running them inline
    pub fn with_worker(mut self, worker: Arc<Worker>) -> Self {
        self.worker = Some(worker);
        self
    }

    pub fn spawn(self, shutdown: ShutdownToken) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }

    pub async fn run(self, mut shutdown: ShutdownToken) {
        let key = self.target.key().to_string();
        info!(key = %key, interval_secs = %self.ctx.config().keepalive_interval_secs, "Keepalive monitor started");

        loop {
            tokio::select! {
                _ = self.target.activity().take() => {}
                _ = shutdown.wait() => break,
            }
            // coalesce triggers that became ready together
            self.target.activity().drain();

            let job = KeepAliveJob::new(Arc::clone(&self.ctx), key.clone());
            self.dispatch(job).await;

            // re-arm for the next quiet period
            self.target.activity().put(());
        }

        info!(key = %key, "Keepalive monitor stopped");
    }

    async fn dispatch(&self, mut job: KeepAliveJob) {
        if let Some(worker) = &self.worker {
            if worker.state().is_accepting() {
                match worker.submit(Box::new(job)) {
                    Ok(()) => return,
                    Err(e) => {
                        warn!(key = %self.target.key(), error = %e, "Keepalive not queued");
                        return;
                    }
                }
            }
        }

        let jc = JobContext::detached("keepalive");
        if let Err(e) = job.process(&jc).await {
            warn!(key = %self.target.key(), error = %e, "Keepalive failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::worker::shutdown_channel;
    use crate::domain::{PublishConfig, WorkerConfig};
    use crate::port::content_store::mocks::MockContentStore;
    use std::time::Duration;

    const KEY: &str = "cr_trx_1";
    const INTERVAL: Duration = Duration::from_secs(60);

    fn context(store: &MockContentStore) -> (Arc<PublishContext>, Arc<PublishTarget>) {
        let config = PublishConfig {
            keepalive_interval_secs: INTERVAL.as_secs(),
            ..PublishConfig::default()
        };
        let ctx = Arc::new(PublishContext::new(config, vec![]));
        let target = ctx.register_target(KEY, Arc::new(store.clone()), vec![]);
        (ctx, target)
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_target_gets_keepalive() {
        let store = MockContentStore::new();
        let (ctx, target) = context(&store);
        let (sender, token) = shutdown_channel();
        let handle = KeepAliveMonitor::new(ctx, target).spawn(token);

        tokio::time::sleep(INTERVAL - Duration::from_secs(1)).await;
        assert_eq!(store.with_state(|s| s.keepalives), 0);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(store.with_state(|s| s.keepalives), 1);

        tokio::time::sleep(INTERVAL).await;
        assert_eq!(store.with_state(|s| s.keepalives), 2);

        sender.shutdown();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_writes_postpone_keepalive() {
        let store = MockContentStore::new();
        let (ctx, target) = context(&store);
        let (sender, token) = shutdown_channel();
        let handle = KeepAliveMonitor::new(ctx, Arc::clone(&target)).spawn(token);

        tokio::time::sleep(INTERVAL / 2).await;
        target.touch();

        tokio::time::sleep(INTERVAL / 2 + Duration::from_secs(1)).await;
        assert_eq!(store.with_state(|s| s.keepalives), 0);

        tokio::time::sleep(INTERVAL / 2).await;
        assert_eq!(store.with_state(|s| s.keepalives), 1);

        sender.shutdown();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_keepalive_job_skips_recently_written_target() {
        let store = MockContentStore::new();
        let (ctx, _target) = context(&store);

        let mut job = KeepAliveJob::new(Arc::clone(&ctx), KEY);
        assert!(!job.is_logged());
        assert_eq!(job.process(&JobContext::detached("test")).await.unwrap(), 0);

        assert_eq!(store.with_state(|s| s.keepalives), 0);
        assert_eq!(ctx.locks().available_permits(KEY), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_keepalive_runs_on_worker() {
        let store = MockContentStore::new();
        let (ctx, target) = context(&store);
        let worker = Arc::new(Worker::new(WorkerConfig::new("publish")));
        worker.start().unwrap();

        let (sender, token) = shutdown_channel();
        let handle = KeepAliveMonitor::new(ctx, target)
            .with_worker(Arc::clone(&worker))
            .spawn(token);

        tokio::time::sleep(INTERVAL + Duration::from_secs(1)).await;
        worker.flush().await;

        assert_eq!(store.with_state(|s| s.keepalives), 1);
        let stats = worker.stats();
        assert_eq!(stats.jobs_processed, 1);
        assert_eq!(stats.logged_jobs, 0);

        sender.shutdown();
        handle.await.unwrap();
        worker.stop();
        worker.join().await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_stops_monitor() {
        let store = MockContentStore::new();
        let (ctx, target) = context(&store);
        let (sender, token) = shutdown_channel();
        let handle = KeepAliveMonitor::new(ctx, target).spawn(token);

        sender.shutdown();
        handle.await.unwrap();
        assert_eq!(store.with_state(|s| s.keepalives), 0);
    }
}
