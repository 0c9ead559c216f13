// Job contract between producers and the worker

use crate::application::job_group::JobGroup;
use crate::application::transaction::TransactionScope;
use crate::application::worker::stats::WorkerStats;
use crate::error::{PublishError, Result};
use async_trait::async_trait;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

/// Transaction shared by the members of a batch
pub type BatchTransaction = Arc<tokio::sync::Mutex<TransactionScope>>;

/// Smallest unit of publish work
///
/// A job is consumed exactly once by a worker. Jobs that can be batched
/// return a fresh [`JobGroup`] from [`Job::group`]; the worker folds
/// consecutive jobs whose groups share a key into one group.
#[async_trait]
pub trait Job: Send + 'static {
    /// Human readable description for logs
    fn description(&self) -> String;

    /// Unlogged jobs (keepalives, dummies) stay out of the statistics
    fn is_logged(&self) -> bool {
        true
    }

    /// Logical jobs represented by this one (groups count their members)
    fn size(&self) -> usize {
        1
    }

    /// The group this job can be batched into, if it is groupable right now
    fn group(&self) -> Option<JobGroup> {
        None
    }

    /// Containers that account each member through the [`JobContext`]
    /// themselves; the worker does not count them as a job of their own
    fn accounts_members(&self) -> bool {
        false
    }

    /// Execute the job and return the number of work units it produced
    async fn process(&mut self, ctx: &JobContext) -> Result<u64>;
}

/// Most recent job failure seen through a context
#[derive(Debug, Clone)]
pub struct FailedJob {
    pub job: String,
    pub error: Arc<PublishError>,
}

/// What a running job sees of the pipeline: the worker it runs on, the
/// statistics and failure sinks, and the batch transaction when it runs
/// inside a group
#[derive(Clone)]
pub struct JobContext {
    worker: Arc<str>,
    stats: Arc<Mutex<WorkerStats>>,
    last_failure: Arc<Mutex<Option<FailedJob>>>,
    transaction: Option<BatchTransaction>,
}

impl JobContext {
    pub fn new(worker: &str, stats: Arc<Mutex<WorkerStats>>) -> Self {
        Self {
            worker: Arc::from(worker),
            stats,
            last_failure: Arc::new(Mutex::new(None)),
            transaction: None,
        }
    }

    /// Report failures into a slot shared with the owner of the context
    pub fn with_failure_slot(mut self, slot: Arc<Mutex<Option<FailedJob>>>) -> Self {
        self.last_failure = slot;
        self
    }

    /// Context for running a job outside any worker
    pub fn detached(name: &str) -> Self {
        Self::new(name, Arc::new(Mutex::new(WorkerStats::default())))
    }

    pub fn worker(&self) -> &str {
        &self.worker
    }

    /// Account one finished job
    pub fn record(&self, duration: Duration, units: u64, logged: bool) {
        self.stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .record(duration, units, logged);
    }

    /// Account one failed job and keep its error as the latest failure
    pub fn fail(&self, job: impl Into<String>, error: impl Into<Arc<PublishError>>) {
        self.stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .record_failure();
        *self
            .last_failure
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(FailedJob {
            job: job.into(),
            error: error.into(),
        });
    }

    pub fn failures(&self) -> u64 {
        self.stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .failures()
    }

    pub fn last_failure(&self) -> Option<FailedJob> {
        self.last_failure
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn stats(&self) -> Arc<Mutex<WorkerStats>> {
        Arc::clone(&self.stats)
    }

    pub fn transaction(&self) -> Option<&BatchTransaction> {
        self.transaction.as_ref()
    }

    pub fn set_transaction(&mut self, transaction: BatchTransaction) {
        self.transaction = Some(transaction);
    }

    pub fn take_transaction(&mut self) -> Option<BatchTransaction> {
        self.transaction.take()
    }
}
