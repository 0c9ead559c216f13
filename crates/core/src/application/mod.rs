// Application Layer - publish pipeline

pub mod context;
pub mod delay_queue;
pub mod job;
pub mod job_group;
pub mod keepalive;
pub mod publish_job;
pub mod semaphore_map;
pub mod transaction;
pub mod worker;

// Re-exports
pub use context::{PublishContext, PublishTarget};
pub use delay_queue::DelayQueue;
pub use job::{BatchTransaction, FailedJob, Job, JobContext};
pub use job_group::{GroupHooks, JobGroup, NoHooks};
pub use keepalive::{KeepAliveJob, KeepAliveMonitor};
pub use publish_job::{BatchTransactionHooks, PublishObjectJob};
pub use semaphore_map::{HolderInfo, LockGuard, SemaphoreMap};
pub use transaction::TransactionScope;
pub use worker::{shutdown_channel, ShutdownSender, ShutdownToken, Worker, WorkerStatsSnapshot};
