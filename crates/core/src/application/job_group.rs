// Batching container for compatible jobs

use crate::application::job::{Job, JobContext};
use crate::domain::config::DEFAULT_GROUP_LIMIT;
use crate::error::Result;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, warn};

/// Hooks run around a group's members (e.g. open and commit one batch
/// transaction for all of them)
#[async_trait]
pub trait GroupHooks: Send + Sync {
    async fn pre_process(&self, _ctx: &mut JobContext, _members: usize) -> Result<()> {
        Ok(())
    }

    /// Runs after the members, also when one of them failed
    async fn post_process(&self, _ctx: &mut JobContext, _failed: bool) -> Result<()> {
        Ok(())
    }

    /// Members share state that one failure throws away for all of them.
    /// A failed batch is then rerun member by member, outside the hooks.
    fn replays_failed_batch(&self) -> bool {
        false
    }
}

/// Hooks that do nothing
pub struct NoHooks;

impl GroupHooks for NoHooks {}

/// A member that finished inside the batch, accounted once the batch holds
struct Finished {
    description: String,
    logged: bool,
    units: u64,
    elapsed: Duration,
}

/// Ordered batch of jobs sharing a group key, bounded by `job_limit`
///
/// Every member is accounted on the [`JobContext`] the way the worker
/// accounts a standalone job: successes through `record`, errors through
/// `fail`. A member's error never stops the members after it.
pub struct JobGroup {
    key: String,
    hooks: Arc<dyn GroupHooks>,
    limit: usize,
    jobs: Vec<Box<dyn Job>>,
}

impl JobGroup {
    pub fn new(key: impl Into<String>, hooks: Arc<dyn GroupHooks>, limit: usize) -> Self {
        Self {
            key: key.into(),
            hooks,
            limit: limit.max(1),
            jobs: Vec::new(),
        }
    }

    /// Group without hooks and the default limit
    pub fn plain(key: impl Into<String>) -> Self {
        Self::new(key, Arc::new(NoHooks), DEFAULT_GROUP_LIMIT)
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn job_limit(&self) -> usize {
        self.limit
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.jobs.len() >= self.limit
    }

    /// Groups with the same key absorb each other's jobs
    pub fn accepts(&self, other: &JobGroup) -> bool {
        self.key == other.key
    }

    /// Append a job; a full group hands it back
    pub fn add(&mut self, job: Box<dyn Job>) -> std::result::Result<(), Box<dyn Job>> {
        if self.is_full() {
            return Err(job);
        }
        self.jobs.push(job);
        Ok(())
    }

    /// Run every member on its own, outside the hooks
    async fn replay(&mut self, ctx: &JobContext) -> u64 {
        let mut solo = ctx.clone();
        solo.take_transaction();

        let mut units = 0;
        for job in self.jobs.iter_mut() {
            let started = Instant::now();
            match job.process(&solo).await {
                Ok(produced) => {
                    units += account(
                        ctx,
                        Finished {
                            description: job.description(),
                            logged: job.is_logged(),
                            units: produced,
                            elapsed: started.elapsed(),
                        },
                    );
                }
                Err(e) => {
                    error!(worker = %ctx.worker(), group = %self.key, job = %job.description(), error = %e, "Grouped job failed");
                    ctx.fail(job.description(), e);
                }
            }
        }
        units
    }
}

/// Record one finished member; returns the units it contributes
fn account(ctx: &JobContext, done: Finished) -> u64 {
    ctx.record(done.elapsed, done.units, done.logged);
    if !done.logged {
        return 0;
    }
    debug!(
        worker = %ctx.worker(),
        job = %done.description,
        duration_ms = %done.elapsed.as_millis(),
        "Grouped job done"
    );
    done.units
}

#[async_trait]
impl Job for JobGroup {
    fn description(&self) -> String {
        format!("{} ({} jobs)", self.key, self.jobs.len())
    }

    // Members are accounted one by one
    fn is_logged(&self) -> bool {
        false
    }

    fn accounts_members(&self) -> bool {
        true
    }

    fn size(&self) -> usize {
        self.jobs.len()
    }

    async fn process(&mut self, ctx: &JobContext) -> Result<u64> {
        let replay = self.hooks.replays_failed_batch();
        let mut batch_ctx = ctx.clone();
        if let Err(e) = self
            .hooks
            .pre_process(&mut batch_ctx, self.jobs.len())
            .await
        {
            error!(worker = %ctx.worker(), group = %self.key, error = %e, "Group could not be prepared");
            // every member is lost with the batch
            let e = Arc::new(e);
            for job in &self.jobs {
                ctx.fail(job.description(), Arc::clone(&e));
            }
            return Ok(0);
        }

        let mut finished = Vec::with_capacity(self.jobs.len());
        let mut failed = false;
        for job in self.jobs.iter_mut() {
            let started = Instant::now();
            match job.process(&batch_ctx).await {
                Ok(units) => finished.push(Finished {
                    description: job.description(),
                    logged: job.is_logged(),
                    units,
                    elapsed: started.elapsed(),
                }),
                Err(e) if replay => {
                    warn!(worker = %ctx.worker(), group = %self.key, job = %job.description(), error = %e, "Grouped job failed, abandoning batch");
                    failed = true;
                    break;
                }
                Err(e) => {
                    error!(worker = %ctx.worker(), group = %self.key, job = %job.description(), error = %e, "Grouped job failed");
                    ctx.fail(job.description(), e);
                    failed = true;
                }
            }
        }

        let post = self.hooks.post_process(&mut batch_ctx, failed).await;
        if replay && (failed || post.is_err()) {
            if let Err(e) = &post {
                warn!(group = %self.key, error = %e, "Batch could not be completed");
            }
            warn!(group = %self.key, members = %self.jobs.len(), "Batch rolled back, replaying members one by one");
            return Ok(self.replay(ctx).await);
        }

        let units: u64 = finished.into_iter().map(|done| account(ctx, done)).sum();
        if let Err(e) = post {
            warn!(group = %self.key, error = %e, "Post-processing of group failed");
            return Err(e);
        }
        Ok(units)
    }
}
