//! Registry, job and watermark data model.

use core::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{SyncError, SyncResult};
use crate::id::{JobId, TableId};

/// Default number of rows pulled from the source per chunk.
pub const DEFAULT_BATCH_SIZE: u32 = 10_000;

/// Registration status of a syncable table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TableStatus {
    Active,
    Inactive,
}

impl TableStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Inactive => "inactive",
        }
    }
}

impl FromStr for TableStatus {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "inactive" => Ok(Self::Inactive),
            other => Err(SyncError::internal(format!("unknown table status '{other}'"))),
        }
    }
}

/// A table approved for synchronization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisteredTable {
    pub table_id: TableId,
    pub table_name: String,
    pub schema_name: String,
    /// Tag of the source system the table lives in (e.g. `snowflake`).
    pub source_system: String,
    pub status: TableStatus,
    pub created_at: DateTime<Utc>,
}

impl RegisteredTable {
    pub fn is_active(&self) -> bool {
        self.status == TableStatus::Active
    }

    /// `schema.table`, for logs and error messages.
    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.schema_name, self.table_name)
    }
}

/// Synchronization mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStrategy {
    /// Replace all destination rows with the source rows.
    Full,
    /// Append rows whose incremental key exceeds the stored watermark.
    Incremental,
    /// Point-in-time full extract into a freshly created destination table.
    Snapshot,
}

impl SyncStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::Incremental => "incremental",
            Self::Snapshot => "snapshot",
        }
    }
}

impl FromStr for SyncStrategy {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "full" => Ok(Self::Full),
            "incremental" => Ok(Self::Incremental),
            "snapshot" => Ok(Self::Snapshot),
            other => Err(SyncError::invalid_request(format!("unknown strategy '{other}'"))),
        }
    }
}

/// Lifecycle state of a sync job.
///
/// `pending → running → {completed, failed}`; a transient failure with
/// attempts remaining moves `running` back to `pending`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Queued, waiting to be claimed by a worker
    Pending,
    /// Claimed by a worker
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl FromStr for JobStatus {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(SyncError::invalid_request(format!("unknown job status '{other}'"))),
        }
    }
}

/// Per-run statistics recorded on the job row.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStats {
    pub rows_processed: u64,
    /// Rows matching the read window at fetch time.
    pub total_rows: u64,
    /// Serialized size of the rows written.
    pub bytes_processed: u64,
    /// Source table size as reported by the warehouse.
    pub size_bytes: u64,
    /// Highest incremental-key value observed (incremental runs only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_value: Option<String>,
}

/// A request to synchronize one table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncRequest {
    pub table_name: String,
    pub schema_name: String,
    pub strategy: SyncStrategy,
    pub incremental_key: Option<String>,
    /// Raw source-side predicate, conjoined with the incremental window.
    pub filter_expression: Option<String>,
    pub batch_size: u32,
    /// Overrides the engine-wide retry bound for this job.
    pub max_attempts: Option<u32>,
}

impl SyncRequest {
    pub fn new(
        table_name: impl Into<String>,
        schema_name: impl Into<String>,
        strategy: SyncStrategy,
    ) -> Self {
        Self {
            table_name: table_name.into(),
            schema_name: schema_name.into(),
            strategy,
            incremental_key: None,
            filter_expression: None,
            batch_size: DEFAULT_BATCH_SIZE,
            max_attempts: None,
        }
    }

    pub fn full(table_name: impl Into<String>, schema_name: impl Into<String>) -> Self {
        Self::new(table_name, schema_name, SyncStrategy::Full)
    }

    pub fn incremental(
        table_name: impl Into<String>,
        schema_name: impl Into<String>,
        incremental_key: impl Into<String>,
    ) -> Self {
        Self::new(table_name, schema_name, SyncStrategy::Incremental)
            .with_incremental_key(incremental_key)
    }

    pub fn snapshot(table_name: impl Into<String>, schema_name: impl Into<String>) -> Self {
        Self::new(table_name, schema_name, SyncStrategy::Snapshot)
    }

    pub fn with_incremental_key(mut self, key: impl Into<String>) -> Self {
        self.incremental_key = Some(key.into());
        self
    }

    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filter_expression = Some(filter.into());
        self
    }

    pub fn with_batch_size(mut self, batch_size: u32) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    /// Reject requests that can never succeed.
    pub fn validate(&self) -> SyncResult<()> {
        validate_identifier("table name", &self.table_name)?;
        validate_identifier("schema name", &self.schema_name)?;
        if self.batch_size == 0 {
            return Err(SyncError::invalid_request("batch_size must be greater than zero"));
        }
        if self.max_attempts == Some(0) {
            return Err(SyncError::invalid_request("max_attempts must be at least 1"));
        }
        match (&self.strategy, &self.incremental_key) {
            (SyncStrategy::Incremental, None) => Err(SyncError::invalid_request(
                "incremental strategy requires an incremental_key",
            )),
            (_, Some(key)) => validate_identifier("incremental key", key),
            _ => Ok(()),
        }
    }
}

/// Identifiers are interpolated into warehouse SQL and local DDL, so only
/// plain identifier characters are accepted.
pub fn validate_identifier(kind: &str, value: &str) -> SyncResult<()> {
    if value.is_empty() {
        return Err(SyncError::invalid_request(format!("{kind} must not be empty")));
    }
    if value.len() > 255 {
        return Err(SyncError::invalid_request(format!("{kind} is too long")));
    }
    let valid = value
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '$');
    if !valid || value.starts_with(|c: char| c.is_ascii_digit()) {
        return Err(SyncError::invalid_request(format!(
            "{kind} '{value}' is not a valid identifier"
        )));
    }
    Ok(())
}

/// One synchronization attempt series for a table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncJob {
    pub job_id: JobId,
    pub table_id: TableId,
    pub strategy: SyncStrategy,
    pub status: JobStatus,
    pub incremental_key: Option<String>,
    pub filter_expression: Option<String>,
    pub batch_size: u32,
    /// Total attempts allowed (first run included).
    pub max_attempts: u32,
    pub created_at: DateTime<Utc>,
    /// Start of the current (or last) attempt.
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Earliest time a re-queued attempt may be claimed.
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub stats: JobStats,
    /// Number of retries scheduled so far.
    pub retries: u32,
}

impl SyncJob {
    /// Create a pending job for an already validated request.
    pub fn new(table_id: TableId, request: &SyncRequest, max_attempts: u32) -> Self {
        Self {
            job_id: JobId::new(),
            table_id,
            strategy: request.strategy,
            status: JobStatus::Pending,
            incremental_key: request.incremental_key.clone(),
            filter_expression: request.filter_expression.clone(),
            batch_size: request.batch_size,
            max_attempts: request.max_attempts.unwrap_or(max_attempts).max(1),
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            next_attempt_at: None,
            error: None,
            stats: JobStats::default(),
            retries: 0,
        }
    }

    /// 1-based number of the current attempt.
    pub fn attempt(&self) -> u32 {
        self.retries + 1
    }
}

/// Per-table record of the most recent sync outcome (the watermark).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSyncStatus {
    pub table_id: TableId,
    pub table_name: String,
    pub schema_name: String,
    pub last_job_id: Option<JobId>,
    pub last_status: Option<JobStatus>,
    /// Completion time of the last successful sync.
    pub last_sync_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    /// Last known-good source row count.
    pub row_count: u64,
    /// Last known-good source size.
    pub size_bytes: u64,
    /// Key the incremental seed below belongs to.
    pub incremental_key: Option<String>,
    pub last_value: Option<String>,
}

impl TableSyncStatus {
    /// Status of a registered table that has never been synced.
    pub fn never_synced(table: &RegisteredTable) -> Self {
        Self {
            table_id: table.table_id,
            table_name: table.table_name.clone(),
            schema_name: table.schema_name.clone(),
            last_job_id: None,
            last_status: None,
            last_sync_at: None,
            last_error: None,
            row_count: 0,
            size_bytes: 0,
            incremental_key: None,
            last_value: None,
        }
    }

    /// Incremental seed for `key`, if the stored one belongs to the same key.
    pub fn seed_for(&self, key: &str) -> Option<&str> {
        match &self.incremental_key {
            Some(stored) if stored == key => self.last_value.as_deref(),
            _ => None,
        }
    }
}

/// Job counts by status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct JobCounts {
    pub pending: u64,
    pub running: u64,
    pub completed: u64,
    pub failed: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> RegisteredTable {
        RegisteredTable {
            table_id: TableId::new(),
            table_name: "orders".into(),
            schema_name: "sales".into(),
            source_system: "snowflake".into(),
            status: TableStatus::Active,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn incremental_request_requires_key() {
        let req = SyncRequest::new("orders", "sales", SyncStrategy::Incremental);
        assert!(matches!(req.validate(), Err(SyncError::InvalidRequest(_))));

        let req = SyncRequest::incremental("orders", "sales", "updated_at");
        assert!(req.validate().is_ok());
    }

    #[test]
    fn zero_batch_size_is_rejected() {
        let req = SyncRequest::full("orders", "sales").with_batch_size(0);
        assert!(matches!(req.validate(), Err(SyncError::InvalidRequest(_))));
    }

    #[test]
    fn identifiers_reject_sql_fragments() {
        assert!(validate_identifier("table name", "ORDERS_2024").is_ok());
        assert!(validate_identifier("table name", "orders; drop table x").is_err());
        assert!(validate_identifier("table name", "1orders").is_err());
        assert!(validate_identifier("table name", "").is_err());
    }

    #[test]
    fn job_takes_engine_bound_unless_overridden() {
        let id = TableId::new();
        let job = SyncJob::new(id, &SyncRequest::full("orders", "sales"), 3);
        assert_eq!(job.max_attempts, 3);
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.attempt(), 1);

        let job = SyncJob::new(id, &SyncRequest::full("orders", "sales").with_max_attempts(5), 3);
        assert_eq!(job.max_attempts, 5);
    }

    #[test]
    fn statuses_round_trip_through_text() {
        for status in [
            JobStatus::Pending,
            JobStatus::Running,
            JobStatus::Completed,
            JobStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<JobStatus>().unwrap(), status);
        }
        assert!(JobStatus::Failed.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
    }

    #[test]
    fn seed_ignores_value_recorded_for_another_key() {
        let mut status = TableSyncStatus::never_synced(&table());
        status.incremental_key = Some("updated_at".into());
        status.last_value = Some("2024-01-01".into());

        assert_eq!(status.seed_for("updated_at"), Some("2024-01-01"));
        assert_eq!(status.seed_for("id"), None);
    }

    #[test]
    fn stats_omit_absent_last_value() {
        let json = serde_json::to_value(JobStats::default()).unwrap();
        assert!(json.get("last_value").is_none());
        assert_eq!(json["rows_processed"], 0);
    }
}
