// Explicit publish context: lock registry, targets and configuration

use crate::application::delay_queue::DelayQueue;
use crate::application::semaphore_map::SemaphoreMap;
use crate::application::transaction::TransactionScope;
use crate::domain::{PublishConfig, TargetKey};
use crate::error::{PublishError, Result};
use crate::port::time_provider::SystemTimeProvider;
use crate::port::{ContentStore, LockService, PublishHandler, TimeProvider};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;
use tokio::time::Instant;
use tracing::info;

/// One external content store with its handlers and activity markers
pub struct PublishTarget {
    key: TargetKey,
    store: Arc<dyn ContentStore>,
    handlers: Vec<Arc<dyn PublishHandler>>,
    last_write: Mutex<Instant>,
    activity: DelayQueue<()>,
}

impl PublishTarget {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn store(&self) -> &Arc<dyn ContentStore> {
        &self.store
    }

    pub fn handlers(&self) -> &[Arc<dyn PublishHandler>] {
        &self.handlers
    }

    /// Record a committed write and restart the keepalive quiet period
    pub fn touch(&self) {
        *self
            .last_write
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Instant::now();
        // one pending trigger is enough; later writes only push it back
        if self.activity.is_empty() {
            self.activity.put(());
        } else {
            self.activity.defer();
        }
    }

    /// Time since the last committed write (or registration)
    pub fn idle_for(&self) -> Duration {
        self.last_write
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .elapsed()
    }

    /// Write triggers, released once the target has been quiet for the
    /// keepalive interval
    pub fn activity(&self) -> &DelayQueue<()> {
        &self.activity
    }
}

/// Process-wide publish state handed to every caller explicitly
///
/// Holds the one [`SemaphoreMap`] for the process lifetime and the registered
/// targets. Targets must be registered before transactions are opened on them.
pub struct PublishContext {
    config: PublishConfig,
    locks: Arc<SemaphoreMap>,
    targets: RwLock<HashMap<TargetKey, Arc<PublishTarget>>>,
    time_provider: Arc<dyn TimeProvider>,
}

impl PublishContext {
    pub fn new(config: PublishConfig, lock_services: Vec<Arc<dyn LockService>>) -> Self {
        Self {
            config,
            locks: Arc::new(SemaphoreMap::with_lock_services(lock_services)),
            targets: RwLock::new(HashMap::new()),
            time_provider: Arc::new(SystemTimeProvider),
        }
    }

    pub fn with_time_provider(mut self, time_provider: Arc<dyn TimeProvider>) -> Self {
        self.time_provider = time_provider;
        self
    }

    pub fn config(&self) -> &PublishConfig {
        &self.config
    }

    pub fn locks(&self) -> &Arc<SemaphoreMap> {
        &self.locks
    }

    pub fn now_millis(&self) -> i64 {
        self.time_provider.now_millis()
    }

    /// Register (or replace) a target and initialize its lock
    pub fn register_target(
        &self,
        key: impl Into<TargetKey>,
        store: Arc<dyn ContentStore>,
        handlers: Vec<Arc<dyn PublishHandler>>,
    ) -> Arc<PublishTarget> {
        let key = key.into();
        self.locks.init(&key);

        let target = Arc::new(PublishTarget {
            key: key.clone(),
            store,
            handlers,
            last_write: Mutex::new(Instant::now()),
            activity: DelayQueue::new(self.config.keepalive_interval()),
        });
        // Arm the keepalive for a target that never gets written
        target.activity.put(());

        info!(key = %key, handlers = %target.handlers.len(), "Registered publish target");
        self.targets
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key, Arc::clone(&target));
        target
    }

    pub fn target(&self, key: &str) -> Result<Arc<PublishTarget>> {
        self.targets
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
            .ok_or_else(|| PublishError::UnknownTarget(key.to_string()))
    }

    pub fn targets(&self) -> Vec<Arc<PublishTarget>> {
        let mut targets: Vec<_> = self
            .targets
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        targets.sort_by(|a, b| a.key.cmp(&b.key));
        targets
    }

    /// Open a transaction scope on `key`
    pub async fn begin(&self, key: &str) -> Result<TransactionScope> {
        TransactionScope::begin(self, key).await
    }
}
