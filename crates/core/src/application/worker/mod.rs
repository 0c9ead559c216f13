// Worker - single-consumer publish job queue

pub mod constants;
mod shutdown;
pub mod stats;

pub use shutdown::{shutdown_channel, ShutdownSender, ShutdownToken};
pub use stats::{WorkerStats, WorkerStatsSnapshot};

use crate::application::job::{FailedJob, Job, JobContext};
use crate::application::job_group::JobGroup;
use crate::domain::{WorkerConfig, WorkerState};
use crate::error::{PublishError, Result};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Pending work: sealed jobs plus the group still absorbing compatible jobs
#[derive(Default)]
struct JobQueue {
    jobs: VecDeque<Box<dyn Job>>,
    open_group: Option<JobGroup>,
    /// Logical jobs not yet started, grouped members counted one by one
    pending: usize,
    in_flight: bool,
}

impl JobQueue {
    fn push(&mut self, job: Box<dyn Job>) {
        self.pending += job.size();

        let Some(mut candidate) = job.group() else {
            self.seal_open_group();
            self.jobs.push_back(job);
            return;
        };

        let job = match self.open_group.take() {
            Some(mut open) if open.accepts(&candidate) => match open.add(job) {
                Ok(()) => {
                    self.stash(open);
                    return;
                }
                Err(job) => {
                    self.jobs.push_back(Box::new(open));
                    job
                }
            },
            Some(open) => {
                self.jobs.push_back(Box::new(open));
                job
            }
            None => job,
        };

        match candidate.add(job) {
            Ok(()) => self.stash(candidate),
            Err(job) => self.jobs.push_back(job),
        }
    }

    /// Keep a group open unless it reached its limit
    fn stash(&mut self, group: JobGroup) {
        if group.is_full() {
            self.jobs.push_back(Box::new(group));
        } else {
            self.open_group = Some(group);
        }
    }

    fn seal_open_group(&mut self) {
        if let Some(group) = self.open_group.take() {
            if !group.is_empty() {
                self.jobs.push_back(Box::new(group));
            }
        }
    }

    /// Next job in FIFO order; the open group is the tail of the queue
    fn pop(&mut self) -> Option<Box<dyn Job>> {
        let job: Box<dyn Job> = match self.jobs.pop_front() {
            Some(job) => job,
            None => Box::new(self.open_group.take()?),
        };
        self.pending = self.pending.saturating_sub(job.size());
        self.in_flight = true;
        Some(job)
    }

    /// Drop everything not yet started; returns the logical count discarded
    fn discard(&mut self) -> usize {
        let discarded = self.jobs.iter().map(|job| job.size()).sum::<usize>()
            + self.open_group.as_ref().map_or(0, JobGroup::len);
        self.jobs.clear();
        self.open_group = None;
        self.pending = 0;
        discarded
    }

    fn is_drained(&self) -> bool {
        self.jobs.is_empty() && self.open_group.is_none() && !self.in_flight
    }
}

struct Inner {
    config: WorkerConfig,
    state: Mutex<WorkerState>,
    queue: Mutex<JobQueue>,
    job_ready: Notify,
    drained: Notify,
    alive: AtomicBool,
    stats: Arc<Mutex<WorkerStats>>,
    last_error: Arc<Mutex<Option<FailedJob>>>,
}

impl Inner {
    fn state(&self) -> MutexGuard<'_, WorkerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn queue(&self) -> MutexGuard<'_, JobQueue> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_running(&self) -> bool {
        self.state().is_accepting()
    }

    /// Run one job on its own task so a panic cannot take the consumer down.
    /// Returns false if the job, or any member it accounts for, failed.
    async fn execute(&self, job: Box<dyn Job>, ctx: &JobContext) -> bool {
        let description = job.description();
        let logged = job.is_logged();
        let accounts_members = job.accounts_members();
        let failures_before = ctx.failures();
        let started = Instant::now();

        let job_ctx = ctx.clone();
        let handle = tokio::spawn(async move {
            let mut job = job;
            job.process(&job_ctx).await
        });

        match handle.await {
            Ok(Ok(units)) => {
                let elapsed = started.elapsed();
                if accounts_members {
                    debug!(
                        worker = %self.config.name,
                        group = %description,
                        units = %units,
                        duration_ms = %elapsed.as_millis(),
                        "Group done"
                    );
                    return ctx.failures() == failures_before;
                }
                ctx.record(elapsed, units, logged);
                if logged {
                    debug!(
                        worker = %self.config.name,
                        job = %description,
                        units = %units,
                        duration_ms = %elapsed.as_millis(),
                        "Job done"
                    );
                }
                true
            }
            Ok(Err(e)) => {
                error!(worker = %self.config.name, job = %description, error = %e, "Job failed");
                ctx.fail(description, e);
                false
            }
            Err(join_err) => {
                let message = if join_err.is_panic() {
                    panic_message(join_err.into_panic())
                } else {
                    "job task was cancelled".to_string()
                };
                error!(worker = %self.config.name, job = %description, panic_msg = %message, "Job panicked");
                ctx.fail(description, PublishError::JobPanicked(message));
                false
            }
        }
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "Unknown panic".to_string()
    }
}

/// Marks the consumer dead and empties the queue however the loop ends
struct ConsumerExit(Arc<Inner>);

impl Drop for ConsumerExit {
    fn drop(&mut self) {
        let discarded = {
            let mut queue = self.0.queue();
            queue.in_flight = false;
            queue.discard()
        };
        self.0.alive.store(false, Ordering::SeqCst);
        if discarded > 0 {
            warn!(worker = %self.0.config.name, discarded = %discarded, "Worker exited with queued jobs");
        }
        self.0.drained.notify_waiters();
    }
}

async fn consume(inner: Arc<Inner>) {
    let _exit = ConsumerExit(Arc::clone(&inner));
    let ctx = JobContext::new(&inner.config.name, Arc::clone(&inner.stats))
        .with_failure_slot(Arc::clone(&inner.last_error));
    info!(worker = %inner.config.name, "Worker started");

    loop {
        let next = inner.queue().pop();
        let job = match next {
            Some(job) => job,
            None => {
                inner.drained.notify_waiters();
                if !inner.is_running() {
                    break;
                }
                inner.job_ready.notified().await;
                continue;
            }
        };

        let succeeded = inner.execute(job, &ctx).await;
        let drained = {
            let mut queue = inner.queue();
            queue.in_flight = false;
            queue.is_drained()
        };
        if drained {
            inner.drained.notify_waiters();
        }

        if !succeeded && inner.config.exit_on_error {
            let mut state = inner.state();
            if *state == WorkerState::Running {
                *state = WorkerState::Failed;
            }
            error!(worker = %inner.config.name, "Worker giving up after job failure");
            break;
        }
    }

    let stats = inner
        .stats
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .snapshot();
    info!(
        worker = %inner.config.name,
        state = %*inner.state(),
        jobs = %stats.jobs_processed,
        failures = %stats.failures,
        avg_ms = %stats.average_duration.map_or(0, |d| d.as_millis()),
        idle_percent = %format!("{:.1}", stats.idle_percent),
        "Worker stopped"
    );
}

/// Owns one queue and one consumer task
///
/// Producers call [`Worker::submit`] from anywhere; the consumer executes jobs
/// strictly one at a time in submission order, folding consecutive groupable
/// jobs with the same group key into one [`JobGroup`].
pub struct Worker {
    inner: Arc<Inner>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Worker {
    pub fn new(config: WorkerConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                state: Mutex::new(WorkerState::Initializing),
                queue: Mutex::new(JobQueue::default()),
                job_ready: Notify::new(),
                drained: Notify::new(),
                alive: AtomicBool::new(false),
                stats: Arc::new(Mutex::new(WorkerStats::default())),
                last_error: Arc::new(Mutex::new(None)),
            }),
            handle: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.config.name
    }

    /// Spawn the consumer task (requires a tokio runtime)
    pub fn start(&self) -> Result<()> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| PublishError::Internal(format!("no runtime to start worker: {}", e)))?;

        let mut state = self.inner.state();
        if *state != WorkerState::Initializing {
            return Err(PublishError::InvalidState(format!(
                "worker '{}' cannot start from {}",
                self.name(),
                *state
            )));
        }
        *state = WorkerState::Running;
        self.inner.alive.store(true, Ordering::SeqCst);
        let handle = runtime.spawn(consume(Arc::clone(&self.inner)));
        *self.handle.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
        Ok(())
    }

    /// State lock, with a running worker whose consumer is gone turned DIED
    fn checked_state(&self) -> MutexGuard<'_, WorkerState> {
        let mut state = self.inner.state();
        if *state == WorkerState::Running && !self.inner.alive.load(Ordering::SeqCst) {
            error!(worker = %self.name(), "Worker consumer died");
            *state = WorkerState::Died;
        }
        state
    }

    pub fn state(&self) -> WorkerState {
        *self.checked_state()
    }

    /// Queue a job; never blocks
    pub fn submit(&self, job: Box<dyn Job>) -> Result<()> {
        let guard = self.checked_state();
        let state = *guard;
        match state {
            WorkerState::Running => {}
            WorkerState::Stopped | WorkerState::Aborted | WorkerState::Failed => {
                return Err(PublishError::Rejected {
                    worker: self.name().to_string(),
                    state,
                });
            }
            WorkerState::Initializing | WorkerState::Died => {
                return Err(PublishError::Unavailable {
                    worker: self.name().to_string(),
                    state,
                });
            }
        }
        self.inner.queue().push(job);
        drop(guard);
        self.inner.job_ready.notify_one();
        Ok(())
    }

    /// Logical jobs waiting to start
    pub fn queue_len(&self) -> usize {
        self.inner.queue().pending
    }

    /// Advisory backpressure signal; `submit` does not consult it
    pub fn is_full(&self) -> bool {
        self.queue_len() >= self.inner.config.queue_limit
    }

    /// Seal the open group, then wait until nothing is queued or executing
    pub async fn flush(&self) {
        self.inner.queue().seal_open_group();
        self.inner.job_ready.notify_one();

        loop {
            let drained = self.inner.drained.notified();
            tokio::pin!(drained);
            drained.as_mut().enable();

            if !self.inner.alive.load(Ordering::SeqCst) || self.inner.queue().is_drained() {
                return;
            }
            drained.await;
        }
    }

    /// Finish in-flight and queued work, then let the consumer exit
    pub fn stop(&self) {
        let mut state = self.inner.state();
        if matches!(*state, WorkerState::Running | WorkerState::Initializing) {
            *state = WorkerState::Stopped;
            self.inner.queue().seal_open_group();
            info!(worker = %self.name(), "Worker stopping");
        }
        drop(state);
        self.inner.job_ready.notify_one();
    }

    /// Discard queued jobs; a job already executing runs to completion
    pub fn abort(&self) {
        let mut state = self.inner.state();
        if !state.is_terminal() {
            *state = WorkerState::Aborted;
            let discarded = self.inner.queue().discard();
            warn!(worker = %self.name(), discarded = %discarded, "Worker aborted");
        }
        drop(state);
        self.inner.job_ready.notify_one();
    }

    /// Wait for the consumer task to end
    pub async fn join(&self) -> Result<()> {
        let handle = self
            .handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            handle
                .await
                .map_err(|e| PublishError::Internal(format!("worker task failed: {}", e)))?;
        }
        Ok(())
    }

    /// Re-raise the most recent job failure, if any
    pub fn last_error(&self) -> Result<()> {
        match &*self
            .inner
            .last_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
        {
            Some(last) => Err(PublishError::JobFailed {
                job: last.job.clone(),
                source: Arc::clone(&last.error),
            }),
            None => Ok(()),
        }
    }

    pub fn stats(&self) -> WorkerStatsSnapshot {
        self.inner
            .stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .snapshot()
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        // Let a still-running consumer drain and exit instead of idling forever
        if self.inner.is_running() {
            self.stop();
        }
    }
}
