//! Source warehouse capability.
//!
//! The engine only ever talks to the warehouse through [`SourceClient`].
//! Implementations classify their failures at the boundary as
//! [`SourceError::Transient`] (retryable) or [`SourceError::Logical`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use tablesync_core::{SourceColumn, SyncError};

pub mod memory;
pub mod snowflake;

pub use memory::{MemorySource, SourceCall, SourceOp};
pub use snowflake::{SnowflakeClient, SnowflakeConfig};

/// Error reported by a source client, already classified.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SourceError {
    /// Connection reset, timeout, throttling or warehouse-side operational fault.
    #[error("{0}")]
    Transient(String),
    /// Malformed query, permission denial or schema mismatch.
    #[error("{0}")]
    Logical(String),
}

impl SourceError {
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }

    pub fn logical(msg: impl Into<String>) -> Self {
        Self::Logical(msg.into())
    }
}

impl From<SourceError> for SyncError {
    fn from(err: SourceError) -> Self {
        match err {
            SourceError::Transient(msg) => SyncError::TransientSource(msg),
            SourceError::Logical(msg) => SyncError::Logical(msg),
        }
    }
}

/// Size information for a source table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableStats {
    pub row_count: u64,
    pub size_bytes: u64,
}

/// One chunk of the read window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    pub batch_size: u32,
    pub offset: u64,
}

impl Page {
    pub fn first(batch_size: u32) -> Self {
        Self {
            batch_size,
            offset: 0,
        }
    }

    pub fn next(self) -> Self {
        Self {
            batch_size: self.batch_size,
            offset: self.offset + u64::from(self.batch_size),
        }
    }
}

/// Rows returned by a fetch, column-aligned.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RowBatch {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
    /// Rows in the whole read window, not just this chunk.
    pub total_rows: u64,
}

impl RowBatch {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Position of `name` among the batch columns, case-insensitive.
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns
            .iter()
            .position(|c| c == name)
            .or_else(|| self.columns.iter().position(|c| c.eq_ignore_ascii_case(name)))
    }
}

/// Read access to the source warehouse.
#[async_trait]
pub trait SourceClient: Send + Sync {
    /// Tag recorded as the registered table's `source_system`.
    fn system_name(&self) -> &str;

    /// Ordered column descriptors. Empty when the table does not exist.
    async fn fetch_schema(&self, table: &str, schema: &str)
    -> Result<Vec<SourceColumn>, SourceError>;

    async fn fetch_table_stats(&self, table: &str, schema: &str)
    -> Result<TableStats, SourceError>;

    /// One chunk of the full table, optionally narrowed by `filter`.
    async fn fetch_data(
        &self,
        table: &str,
        schema: &str,
        page: Page,
        filter: Option<&str>,
    ) -> Result<RowBatch, SourceError>;

    /// One chunk of rows whose `key` exceeds `last_value` (all rows when
    /// absent), ordered by `key` and conjoined with `filter`.
    async fn fetch_incremental_data(
        &self,
        table: &str,
        schema: &str,
        key: &str,
        last_value: Option<&str>,
        page: Page,
        filter: Option<&str>,
    ) -> Result<RowBatch, SourceError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_errors_map_onto_the_engine_taxonomy() {
        let e: SyncError = SourceError::transient("connection reset").into();
        assert!(e.is_transient());

        let e: SyncError = SourceError::logical("SQL compilation error").into();
        assert_eq!(e, SyncError::Logical("SQL compilation error".into()));
    }

    #[test]
    fn pages_advance_by_batch_size() {
        let page = Page::first(2).next().next();
        assert_eq!(page.offset, 4);
        assert_eq!(page.batch_size, 2);
    }
}
