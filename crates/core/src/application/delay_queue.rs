// Debounce queue: elements are released only after inserts have gone quiet

use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::{sleep_until, Instant};

struct State<T> {
    items: VecDeque<(T, Instant)>,
    last_insertion: Option<Instant>,
}

enum Next<T> {
    Ready(T),
    At(Instant),
    Empty,
}

/// FIFO queue whose head becomes available once no `put` has happened for
/// `quiet_period`.
///
/// Readiness is measured against the most recent insertion into the whole
/// queue, not the element's own insertion: any new `put` pushes back every
/// queued element. A burst of triggers therefore turns into one action after
/// the burst ends.
pub struct DelayQueue<T> {
    quiet_period: Duration,
    state: Mutex<State<T>>,
    inserted: Notify,
}

impl<T> DelayQueue<T> {
    pub fn new(quiet_period: Duration) -> Self {
        Self {
            quiet_period,
            state: Mutex::new(State {
                items: VecDeque::new(),
                last_insertion: None,
            }),
            inserted: Notify::new(),
        }
    }

    pub fn quiet_period(&self) -> Duration {
        self.quiet_period
    }

    pub fn put(&self, item: T) {
        let now = Instant::now();
        {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            state.items.push_back((item, now));
            state.last_insertion = Some(now);
        }
        self.inserted.notify_waiters();
    }

    /// Restart the quiet period for everything queued without inserting
    pub fn defer(&self) {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .last_insertion = Some(Instant::now());
        self.inserted.notify_waiters();
    }

    fn next(&self) -> Next<T> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let ready_at = match (state.items.front(), state.last_insertion) {
            (Some(_), Some(last)) => last + self.quiet_period,
            _ => return Next::Empty,
        };
        if Instant::now() < ready_at {
            return Next::At(ready_at);
        }
        match state.items.pop_front() {
            Some((item, _)) => Next::Ready(item),
            None => Next::Empty,
        }
    }

    /// Pop the head if the queue has been quiet long enough
    pub fn try_take(&self) -> Option<T> {
        match self.next() {
            Next::Ready(item) => Some(item),
            _ => None,
        }
    }

    /// Wait until the head is ready and pop it
    pub async fn take(&self) -> T {
        loop {
            let notified = self.inserted.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.next() {
                Next::Ready(item) => return item,
                Next::At(ready_at) => {
                    tokio::select! {
                        _ = sleep_until(ready_at) => {}
                        _ = &mut notified => {}
                    }
                }
                Next::Empty => notified.await,
            }
        }
    }

    /// Like `take`, but give up after `timeout`
    pub async fn poll(&self, timeout: Duration) -> Option<T> {
        let give_up = Instant::now() + timeout;
        loop {
            let notified = self.inserted.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let wake_at = match self.next() {
                Next::Ready(item) => return Some(item),
                Next::At(ready_at) => ready_at.min(give_up),
                Next::Empty => give_up,
            };
            if Instant::now() >= give_up {
                return None;
            }
            tokio::select! {
                _ = sleep_until(wake_at) => {}
                _ = &mut notified => {}
            }
        }
    }

    /// Remove everything still queued, ready or not
    pub fn drain(&self) -> Vec<T> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.items.drain(..).map(|(item, _)| item).collect()
    }

    pub fn len(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .items
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
