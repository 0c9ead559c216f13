// Distributed lock service port
// Layered beneath the in-process SemaphoreMap so exclusion can span processes

use crate::error::Result;
use async_trait::async_trait;
use std::time::Duration;

/// Cross-process lock keyed by publish target
///
/// Implementations are registered explicitly at startup. With none registered
/// the pipeline falls back to process-local exclusion.
#[async_trait]
pub trait LockService: Send + Sync {
    /// Name used in logs and error messages
    fn name(&self) -> &str;

    /// Block until the lock for `key` is held by this process
    async fn acquire(&self, key: &str) -> Result<()>;

    /// Like `acquire`, but fail with `PublishError::LockTimeout` after `timeout`
    async fn acquire_timeout(&self, key: &str, timeout: Duration) -> Result<()>;

    async fn release(&self, key: &str) -> Result<()>;
}

// ============================================================================
// Mock Implementations for Testing
// ============================================================================

pub mod mocks {
    use super::*;
    use crate::error::PublishError;
    use std::sync::Mutex;

    /// Records every call; can be told to refuse acquisitions
    #[derive(Default)]
    pub struct RecordingLockService {
        name: String,
        fail_acquire: bool,
        events: Mutex<Vec<String>>,
    }

    impl RecordingLockService {
        pub fn new(name: impl Into<String>) -> Self {
            Self {
                name: name.into(),
                ..Self::default()
            }
        }

        pub fn refusing(name: impl Into<String>) -> Self {
            Self {
                name: name.into(),
                fail_acquire: true,
                ..Self::default()
            }
        }

        pub fn events(&self) -> Vec<String> {
            self.events.lock().unwrap().clone()
        }

        fn record(&self, event: String) {
            self.events.lock().unwrap().push(event);
        }

        fn check(&self, key: &str) -> Result<()> {
            if self.fail_acquire {
                return Err(PublishError::LockService {
                    service: self.name.clone(),
                    key: key.to_string(),
                    message: "refused".to_string(),
                });
            }
            Ok(())
        }
    }

    #[async_trait]
    impl LockService for RecordingLockService {
        fn name(&self) -> &str {
            &self.name
        }

        async fn acquire(&self, key: &str) -> Result<()> {
            self.check(key)?;
            self.record(format!("{} acquire {}", self.name, key));
            Ok(())
        }

        async fn acquire_timeout(&self, key: &str, timeout: Duration) -> Result<()> {
            self.check(key)?;
            self.record(format!(
                "{} acquire {} within {}ms",
                self.name,
                key,
                timeout.as_millis()
            ));
            Ok(())
        }

        async fn release(&self, key: &str) -> Result<()> {
            self.record(format!("{} release {}", self.name, key));
            Ok(())
        }
    }
}
