// Per-target binary semaphores layered over optional distributed lock services

use crate::error::{PublishError, Result};
use crate::port::LockService;
use chrono::{DateTime, Utc};
use std::backtrace::{Backtrace, BacktraceStatus};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tracing::{debug, warn};

/// Diagnostic record of the last successful acquirer of a key
#[derive(Debug, Clone)]
pub struct HolderInfo {
    pub thread: String,
    pub acquired_at: DateTime<Utc>,
    /// Present when backtraces are enabled (RUST_BACKTRACE / RUST_LIB_BACKTRACE)
    pub backtrace: Option<String>,
}

impl HolderInfo {
    fn capture() -> Self {
        let current = std::thread::current();
        let thread = match current.name() {
            Some(name) => name.to_string(),
            None => format!("{:?}", current.id()),
        };
        let backtrace = Backtrace::capture();
        Self {
            thread,
            acquired_at: Utc::now(),
            backtrace: match backtrace.status() {
                BacktraceStatus::Captured => Some(backtrace.to_string()),
                _ => None,
            },
        }
    }
}

impl fmt::Display for HolderInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "thread {} since {}",
            self.thread,
            self.acquired_at.to_rfc3339()
        )?;
        if let Some(backtrace) = &self.backtrace {
            write!(f, "\n{}", backtrace)?;
        }
        Ok(())
    }
}

struct Entry {
    semaphore: Arc<Semaphore>,
    last_holder: Mutex<Option<HolderInfo>>,
}

impl Entry {
    fn holder_description(&self) -> String {
        match &*self.last_holder.lock().unwrap_or_else(PoisonError::into_inner) {
            Some(holder) => holder.to_string(),
            None => "unknown".to_string(),
        }
    }
}

/// Registry of one fair, single-permit semaphore per key
///
/// The map-level lock guards only `init` and lookups; acquiring and releasing
/// an initialized key works on that key's semaphore alone, so unrelated
/// targets never serialize through a global lock.
pub struct SemaphoreMap {
    entries: RwLock<HashMap<String, Arc<Entry>>>,
    lock_services: Vec<Arc<dyn LockService>>,
}

impl SemaphoreMap {
    /// Process-local exclusion only
    pub fn new() -> Self {
        Self::with_lock_services(Vec::new())
    }

    /// Lock services are acquired in the given order before the local permit
    pub fn with_lock_services(lock_services: Vec<Arc<dyn LockService>>) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            lock_services,
        }
    }

    /// Create the semaphore for `key` if absent. Keys must be initialized
    /// before their first acquire.
    pub fn init(&self, key: &str) {
        let mut entries = self
            .entries
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        entries.entry(key.to_string()).or_insert_with(|| {
            debug!(key = %key, "Initialized lock");
            Arc::new(Entry {
                semaphore: Arc::new(Semaphore::new(1)),
                last_holder: Mutex::new(None),
            })
        });
    }

    fn entry(&self, key: &str) -> Result<Arc<Entry>> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
            .ok_or_else(|| PublishError::LockNotInitialized(key.to_string()))
    }

    /// Wait for the lock of `key` without bound
    pub async fn acquire(&self, key: &str) -> Result<LockGuard> {
        self.acquire_inner(key, None).await
    }

    /// Wait at most `timeout` for the lock of `key`
    ///
    /// On expiry every external lock already taken for `key` is released
    /// before the `LockTimeout` error (naming the last holder) is returned.
    pub async fn acquire_timeout(&self, key: &str, timeout: Duration) -> Result<LockGuard> {
        self.acquire_inner(key, Some(timeout)).await
    }

    async fn acquire_inner(&self, key: &str, timeout: Option<Duration>) -> Result<LockGuard> {
        let entry = self.entry(key)?;
        let started = Instant::now();
        let remaining = |timeout: Duration| timeout.saturating_sub(started.elapsed());

        // Cross-process exclusion first, then local
        let mut external = ExternalLocks::new(key);
        for service in &self.lock_services {
            let acquired = match timeout {
                Some(timeout) => service.acquire_timeout(key, remaining(timeout)).await,
                None => service.acquire(key).await,
            };
            if let Err(e) = acquired {
                warn!(key = %key, service = %service.name(), error = %e, "Lock service refused lock");
                external.release_all().await;
                return Err(e);
            }
            external.held.push(Arc::clone(service));
        }

        let semaphore = Arc::clone(&entry.semaphore);
        let permit = match timeout {
            Some(timeout) => {
                match tokio::time::timeout(remaining(timeout), semaphore.acquire_owned()).await {
                    Ok(Ok(permit)) => permit,
                    Ok(Err(_)) => {
                        external.release_all().await;
                        return Err(PublishError::LockInterrupted(key.to_string()));
                    }
                    Err(_) => {
                        external.release_all().await;
                        let holder = entry.holder_description();
                        warn!(
                            key = %key,
                            timeout_ms = %timeout.as_millis(),
                            holder = %holder,
                            "Timed out waiting for lock"
                        );
                        return Err(PublishError::LockTimeout {
                            key: key.to_string(),
                            waited_ms: started.elapsed().as_millis(),
                            holder,
                        });
                    }
                }
            }
            None => match semaphore.acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => {
                    external.release_all().await;
                    return Err(PublishError::LockInterrupted(key.to_string()));
                }
            },
        };

        *entry
            .last_holder
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(HolderInfo::capture());
        debug!(key = %key, waited_ms = %started.elapsed().as_millis(), "Acquired lock");

        Ok(LockGuard {
            key: key.to_string(),
            permit: Some(permit),
            services: external.disarm(),
        })
    }

    /// Interrupt every waiter and refuse further acquires with
    /// `LockInterrupted`; guards already handed out stay valid
    pub fn close(&self) {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        for entry in entries.values() {
            entry.semaphore.close();
        }
        debug!(keys = %entries.len(), "Locks closed");
    }

    /// Release a lock obtained from this map
    pub async fn release(&self, guard: LockGuard) {
        guard.release().await;
    }

    /// 1 if free, 0 if held or never initialized
    pub fn available_permits(&self, key: &str) -> usize {
        self.entry(key)
            .map(|entry| entry.semaphore.available_permits())
            .unwrap_or(0)
    }

    pub fn last_holder(&self, key: &str) -> Option<HolderInfo> {
        self.entry(key).ok().and_then(|entry| {
            entry
                .last_holder
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone()
        })
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        keys.sort();
        keys
    }
}

impl Default for SemaphoreMap {
    fn default() -> Self {
        Self::new()
    }
}

/// Held lock for one key. Release it with [`LockGuard::release`] (or
/// [`SemaphoreMap::release`]); the guard is consumed, so a lock cannot be
/// released twice.
///
/// Dropping an unreleased guard frees the local permit at once and releases
/// the external locks on a spawned task.
#[must_use = "a dropped LockGuard releases its lock immediately"]
pub struct LockGuard {
    key: String,
    permit: Option<OwnedSemaphorePermit>,
    services: Vec<Arc<dyn LockService>>,
}

impl LockGuard {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Local permit first, then every lock service
    pub async fn release(mut self) {
        drop(self.permit.take());
        let services = std::mem::take(&mut self.services);
        release_external(&self.key, &services).await;
        debug!(key = %self.key, "Released lock");
    }
}

impl fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockGuard")
            .field("key", &self.key)
            .field("held", &self.permit.is_some())
            .field("services", &self.services.len())
            .finish()
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if self.permit.take().is_some() {
            warn!(key = %self.key, "Lock dropped without explicit release");
        }
        if !self.services.is_empty() {
            spawn_external_release(self.key.clone(), std::mem::take(&mut self.services));
        }
    }
}

/// External locks taken during one acquire; unwound if the acquire fails or
/// its future is dropped
struct ExternalLocks {
    key: String,
    held: Vec<Arc<dyn LockService>>,
}

impl ExternalLocks {
    fn new(key: &str) -> Self {
        Self {
            key: key.to_string(),
            held: Vec::new(),
        }
    }

    async fn release_all(&mut self) {
        let held = std::mem::take(&mut self.held);
        release_external(&self.key, &held).await;
    }

    fn disarm(mut self) -> Vec<Arc<dyn LockService>> {
        std::mem::take(&mut self.held)
    }
}

impl Drop for ExternalLocks {
    fn drop(&mut self) {
        if !self.held.is_empty() {
            spawn_external_release(self.key.clone(), std::mem::take(&mut self.held));
        }
    }
}

async fn release_external(key: &str, services: &[Arc<dyn LockService>]) {
    for service in services {
        if let Err(e) = service.release(key).await {
            warn!(key = %key, service = %service.name(), error = %e, "Failed to release external lock");
        }
    }
}

fn spawn_external_release(key: String, services: Vec<Arc<dyn LockService>>) {
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn(async move {
                release_external(&key, &services).await;
            });
        }
        Err(_) => {
            warn!(key = %key, "No runtime available; external locks stay held until their lease runs out");
        }
    }
}
