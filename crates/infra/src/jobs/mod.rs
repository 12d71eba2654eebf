//! Sync job queue and its execution machinery.
//!
//! - [`store`]: durable job rows; atomic claim, retry re-queue and
//!   compare-and-set terminal transitions.
//! - [`supervisor`]: retry-or-fail decision for a failed attempt.
//! - [`worker`]: tokio worker pool polling the queue.

pub mod store;
pub mod supervisor;
pub mod worker;

pub use store::{FailGuard, JobFilter, SyncJobStore};
pub use supervisor::{RetryDecision, Supervisor};
pub use worker::{drain, WorkerConfig, WorkerPool, WorkerPoolHandle, WorkerStats};
