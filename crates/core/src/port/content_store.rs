// External content store port
// One store per publish target; writes happen only inside a store transaction

use crate::domain::ContentObject;
use crate::error::Result;
use async_trait::async_trait;

/// An open write transaction against a content store
///
/// `commit` and `rollback` borrow mutably so a failed commit can still be
/// followed by a rollback attempt. After a failed commit, `rollback` must
/// leave none of the transaction's writes behind, either by rolling back
/// itself or because the driver already did. A rollback after a finished
/// transaction is a no-op.
#[async_trait]
pub trait StoreTransaction: Send {
    /// Insert or replace the object
    async fn put_object(&mut self, object: &ContentObject) -> Result<()>;

    async fn delete_object(&mut self, object: &ContentObject) -> Result<()>;

    async fn commit(&mut self) -> Result<()>;

    async fn rollback(&mut self) -> Result<()>;
}

/// Transactional store behind a publish target
#[async_trait]
pub trait ContentStore: Send + Sync {
    /// Begin a new write transaction
    async fn begin(&self) -> Result<Box<dyn StoreTransaction>>;

    /// Issue a no-op statement so the peer does not drop an idle session
    async fn keepalive(&self) -> Result<()>;
}

// ============================================================================
// Mock Implementations for Testing
// ============================================================================

pub mod mocks {
    use super::*;
    use crate::error::PublishError;
    use std::collections::BTreeMap;
    use std::sync::{Arc, Mutex};

    /// Shared, inspectable state of a [`MockContentStore`]
    #[derive(Debug, Default)]
    pub struct MockStoreState {
        pub objects: BTreeMap<String, ContentObject>,
        pub begins: usize,
        pub commits: usize,
        pub rollbacks: usize,
        pub keepalives: usize,
        pub fail_begin: bool,
        pub fail_commit: bool,
        /// Fail this many upcoming commits
        pub fail_commits: usize,
        pub fail_rollback: bool,
        /// Fail `put_object` for this content id
        pub fail_put_for: Option<String>,
        pub events: Vec<String>,
    }

    /// In-memory store; writes are buffered per transaction and applied on commit
    #[derive(Clone, Default)]
    pub struct MockContentStore {
        state: Arc<Mutex<MockStoreState>>,
    }

    impl MockContentStore {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn failing_commit() -> Self {
            let store = Self::new();
            store.state.lock().unwrap().fail_commit = true;
            store
        }

        pub fn failing_begin() -> Self {
            let store = Self::new();
            store.state.lock().unwrap().fail_begin = true;
            store
        }

        pub fn fail_next_commit(&self) {
            self.state.lock().unwrap().fail_commits += 1;
        }

        pub fn fail_put_for(&self, content_id: impl Into<String>) {
            self.state.lock().unwrap().fail_put_for = Some(content_id.into());
        }

        pub fn with_state<R>(&self, f: impl FnOnce(&MockStoreState) -> R) -> R {
            f(&self.state.lock().unwrap())
        }

        pub fn events(&self) -> Vec<String> {
            self.state.lock().unwrap().events.clone()
        }
    }

    enum Pending {
        Put(ContentObject),
        Delete(String),
    }

    struct MockTransaction {
        state: Arc<Mutex<MockStoreState>>,
        pending: Vec<Pending>,
        finished: bool,
    }

    #[async_trait]
    impl StoreTransaction for MockTransaction {
        async fn put_object(&mut self, object: &ContentObject) -> Result<()> {
            let mut state = self.state.lock().unwrap();
            if state.fail_put_for.as_deref() == Some(object.content_id().as_str()) {
                return Err(PublishError::Store(format!(
                    "mock put failure for {}",
                    object.content_id()
                )));
            }
            state.events.push(format!("put {}", object.content_id()));
            self.pending.push(Pending::Put(object.clone()));
            Ok(())
        }

        async fn delete_object(&mut self, object: &ContentObject) -> Result<()> {
            self.state
                .lock()
                .unwrap()
                .events
                .push(format!("delete {}", object.content_id()));
            self.pending.push(Pending::Delete(object.content_id()));
            Ok(())
        }

        async fn commit(&mut self) -> Result<()> {
            let mut state = self.state.lock().unwrap();
            if state.fail_commit || state.fail_commits > 0 {
                state.fail_commits = state.fail_commits.saturating_sub(1);
                state.events.push("commit failed".to_string());
                return Err(PublishError::Store("mock commit failure".to_string()));
            }
            for pending in self.pending.drain(..) {
                match pending {
                    Pending::Put(object) => {
                        state.objects.insert(object.content_id(), object);
                    }
                    Pending::Delete(content_id) => {
                        state.objects.remove(&content_id);
                    }
                }
            }
            state.commits += 1;
            state.events.push("commit".to_string());
            self.finished = true;
            Ok(())
        }

        async fn rollback(&mut self) -> Result<()> {
            if self.finished {
                return Ok(());
            }
            let mut state = self.state.lock().unwrap();
            if state.fail_rollback {
                return Err(PublishError::Store("mock rollback failure".to_string()));
            }
            self.pending.clear();
            state.rollbacks += 1;
            state.events.push("rollback".to_string());
            self.finished = true;
            Ok(())
        }
    }

    #[async_trait]
    impl ContentStore for MockContentStore {
        async fn begin(&self) -> Result<Box<dyn StoreTransaction>> {
            let mut state = self.state.lock().unwrap();
            if state.fail_begin {
                return Err(PublishError::Store("mock begin failure".to_string()));
            }
            state.begins += 1;
            state.events.push("begin".to_string());
            Ok(Box::new(MockTransaction {
                state: Arc::clone(&self.state),
                pending: Vec::new(),
                finished: false,
            }))
        }

        async fn keepalive(&self) -> Result<()> {
            let mut state = self.state.lock().unwrap();
            state.keepalives += 1;
            state.events.push("keepalive".to_string());
            Ok(())
        }
    }
}
