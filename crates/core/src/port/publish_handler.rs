// Publish handler port
// Observers driven through every transaction on a target:
// open -> {create | update | delete}* -> {commit | rollback} -> close

use crate::domain::ContentObject;
use crate::error::Result;
use async_trait::async_trait;

/// Per-transaction observer of content writes
///
/// Handlers keep their own per-transaction state behind interior mutability;
/// the target lock guarantees only one transaction drives them at a time.
/// Any error aborts the enclosing transaction scope.
#[async_trait]
pub trait PublishHandler: Send + Sync {
    fn name(&self) -> &str;

    /// `timestamp` is the transaction start in epoch milliseconds
    async fn open(&self, timestamp: i64) -> Result<()>;

    async fn create_object(&self, _object: &ContentObject) -> Result<()> {
        Ok(())
    }

    async fn update_object(
        &self,
        _object: &ContentObject,
        _previous: Option<&ContentObject>,
        _changed: &[String],
    ) -> Result<()> {
        Ok(())
    }

    async fn delete_object(&self, _object: &ContentObject) -> Result<()> {
        Ok(())
    }

    async fn commit(&self) -> Result<()>;

    async fn rollback(&self) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

// ============================================================================
// Mock Implementations for Testing
// ============================================================================

pub mod mocks {
    use super::*;
    use crate::error::PublishError;
    use std::sync::Mutex;

    /// Records lifecycle calls as "<name> <event>" strings
    pub struct RecordingHandler {
        name: String,
        fail_on: Option<&'static str>,
        events: Mutex<Vec<String>>,
    }

    impl RecordingHandler {
        pub fn new(name: impl Into<String>) -> Self {
            Self {
                name: name.into(),
                fail_on: None,
                events: Mutex::new(Vec::new()),
            }
        }

        /// Fail the given lifecycle step ("open", "create", "commit", ...)
        pub fn failing_on(name: impl Into<String>, step: &'static str) -> Self {
            Self {
                fail_on: Some(step),
                ..Self::new(name)
            }
        }

        pub fn events(&self) -> Vec<String> {
            self.events.lock().unwrap().clone()
        }

        fn step(&self, step: &str, detail: Option<String>) -> Result<()> {
            if self.fail_on == Some(step) {
                return Err(PublishError::Handler {
                    handler: self.name.clone(),
                    message: format!("{} failed", step),
                });
            }
            let event = match detail {
                Some(detail) => format!("{} {} {}", self.name, step, detail),
                None => format!("{} {}", self.name, step),
            };
            self.events.lock().unwrap().push(event);
            Ok(())
        }
    }

    #[async_trait]
    impl PublishHandler for RecordingHandler {
        fn name(&self) -> &str {
            &self.name
        }

        async fn open(&self, _timestamp: i64) -> Result<()> {
            self.step("open", None)
        }

        async fn create_object(&self, object: &ContentObject) -> Result<()> {
            self.step("create", Some(object.content_id()))
        }

        async fn update_object(
            &self,
            object: &ContentObject,
            _previous: Option<&ContentObject>,
            changed: &[String],
        ) -> Result<()> {
            self.step(
                "update",
                Some(format!("{} [{}]", object.content_id(), changed.join(","))),
            )
        }

        async fn delete_object(&self, object: &ContentObject) -> Result<()> {
            self.step("delete", Some(object.content_id()))
        }

        async fn commit(&self) -> Result<()> {
            self.step("commit", None)
        }

        async fn rollback(&self) -> Result<()> {
            self.step("rollback", None)
        }

        async fn close(&self) -> Result<()> {
            self.step("close", None)
        }
    }
}
