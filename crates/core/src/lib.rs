//! `tablesync-core` — domain foundation for the warehouse synchronization engine.
//!
//! This crate contains **pure domain** primitives (no infrastructure concerns):
//! identifiers, the job/registry/watermark data model, the error taxonomy,
//! source-to-destination schema translation and retry/backoff math.

pub mod error;
pub mod id;
pub mod model;
pub mod retry;
pub mod schema;
pub mod watermark;

pub use error::{SyncError, SyncResult};
pub use id::{JobId, TableId};
pub use model::{
    JobCounts, JobStats, JobStatus, RegisteredTable, SyncJob, SyncRequest, SyncStrategy,
    TableStatus, TableSyncStatus, DEFAULT_BATCH_SIZE, validate_identifier,
};
pub use retry::{BackoffStrategy, RetryPolicy};
pub use schema::{
    DestinationColumn, DestinationType, SourceColumn, create_table_sql, destination_table_name,
    quote_ident, translate_columns,
};
pub use watermark::{advance as advance_watermark, compare_watermarks, watermark_text};
