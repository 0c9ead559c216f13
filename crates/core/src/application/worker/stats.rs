// Worker throughput statistics

use super::constants::STATS_WINDOW_SIZE;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;

/// Running totals plus a floating window over the latest logged durations
#[derive(Debug)]
pub struct WorkerStats {
    window: VecDeque<Duration>,
    window_size: usize,
    busy: Duration,
    jobs_processed: u64,
    logged_jobs: u64,
    work_units: u64,
    failures: u64,
    started_at: Instant,
}

/// Point-in-time copy of [`WorkerStats`]
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerStatsSnapshot {
    pub jobs_processed: u64,
    pub logged_jobs: u64,
    pub work_units: u64,
    pub failures: u64,
    pub average_duration: Option<Duration>,
    pub total_busy: Duration,
    pub idle_percent: f64,
}

impl WorkerStats {
    pub fn new(window_size: usize) -> Self {
        Self {
            window: VecDeque::with_capacity(window_size),
            window_size: window_size.max(1),
            busy: Duration::ZERO,
            jobs_processed: 0,
            logged_jobs: 0,
            work_units: 0,
            failures: 0,
            started_at: Instant::now(),
        }
    }

    /// Count a finished job; only logged jobs feed durations and units
    pub fn record(&mut self, duration: Duration, units: u64, logged: bool) {
        self.jobs_processed += 1;
        if !logged {
            return;
        }
        self.logged_jobs += 1;
        self.work_units += units;
        self.busy += duration;
        if self.window.len() == self.window_size {
            self.window.pop_front();
        }
        self.window.push_back(duration);
    }

    pub fn record_failure(&mut self) {
        self.failures += 1;
    }

    pub fn failures(&self) -> u64 {
        self.failures
    }

    /// Mean over the floating window
    pub fn average_duration(&self) -> Option<Duration> {
        if self.window.is_empty() {
            return None;
        }
        let total: Duration = self.window.iter().sum();
        Some(total / self.window.len() as u32)
    }

    /// Share of wall-clock time since start not spent in logged jobs
    pub fn idle_percent(&self) -> f64 {
        let elapsed = self.started_at.elapsed().as_secs_f64();
        if elapsed <= 0.0 {
            return 100.0;
        }
        let busy = self.busy.as_secs_f64().min(elapsed);
        (1.0 - busy / elapsed) * 100.0
    }

    pub fn snapshot(&self) -> WorkerStatsSnapshot {
        WorkerStatsSnapshot {
            jobs_processed: self.jobs_processed,
            logged_jobs: self.logged_jobs,
            work_units: self.work_units,
            failures: self.failures,
            average_duration: self.average_duration(),
            total_busy: self.busy,
            idle_percent: self.idle_percent(),
        }
    }
}

impl Default for WorkerStats {
    fn default() -> Self {
        Self::new(STATS_WINDOW_SIZE)
    }
}
