//! Per-table sync status (the watermark).
//!
//! One row per table, upserted on `table_id`. Success writes replace the
//! row wholesale; failure writes only touch the outcome fields so the
//! last known-good counts survive failed runs.

use chrono::{DateTime, Utc};
use sqlx::{FromRow, SqliteConnection, SqlitePool};
use tracing::{debug, instrument};

use tablesync_core::{JobId, JobStatus, SyncResult, TableId, TableSyncStatus};

use crate::db::{format_ts, map_sqlx_error, parse_opt_ts, parse_stored, to_i64, to_u64};

/// Outcome of a successful run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatermarkUpdate {
    pub table_id: TableId,
    pub job_id: JobId,
    pub status: JobStatus,
    pub synced_at: DateTime<Utc>,
    pub row_count: u64,
    pub size_bytes: u64,
    /// `None` leaves the stored incremental key and seed untouched.
    pub incremental_key: Option<String>,
    /// New seed for `incremental_key`; ignored when the key is `None`.
    pub last_value: Option<String>,
}

#[derive(Debug, FromRow)]
struct StatusRow {
    table_id: String,
    table_name: String,
    schema_name: String,
    last_job_id: Option<String>,
    last_status: Option<String>,
    last_sync_at: Option<String>,
    last_error: Option<String>,
    row_count: i64,
    size_bytes: i64,
    incremental_key: Option<String>,
    last_value: Option<String>,
}

impl TryFrom<StatusRow> for TableSyncStatus {
    type Error = tablesync_core::SyncError;

    fn try_from(row: StatusRow) -> SyncResult<Self> {
        Ok(Self {
            table_id: parse_stored("table_id", &row.table_id)?,
            table_name: row.table_name,
            schema_name: row.schema_name,
            last_job_id: row
                .last_job_id
                .as_deref()
                .map(|id| parse_stored("last_job_id", id))
                .transpose()?,
            last_status: row
                .last_status
                .as_deref()
                .map(|s| parse_stored("last_status", s))
                .transpose()?,
            last_sync_at: parse_opt_ts(row.last_sync_at)?,
            last_error: row.last_error,
            row_count: to_u64(row.row_count),
            size_bytes: to_u64(row.size_bytes),
            incremental_key: row.incremental_key,
            last_value: row.last_value,
        })
    }
}

#[derive(Debug, Clone)]
pub struct WatermarkStore {
    pool: SqlitePool,
}

impl WatermarkStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    #[instrument(skip(self), fields(table_id = %table_id), err)]
    pub async fn get(&self, table_id: TableId) -> SyncResult<Option<TableSyncStatus>> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| map_sqlx_error("get_watermark", e))?;
        Self::get_in(&mut *conn, table_id).await
    }

    pub async fn get_in(
        conn: &mut SqliteConnection,
        table_id: TableId,
    ) -> SyncResult<Option<TableSyncStatus>> {
        let row: Option<StatusRow> = sqlx::query_as(
            r#"
            SELECT
                s.table_id,
                t.table_name,
                t.schema_name,
                s.last_job_id,
                s.last_status,
                s.last_sync_at,
                s.last_error,
                s.row_count,
                s.size_bytes,
                s.incremental_key,
                s.last_value
            FROM table_sync_status s
            JOIN registered_tables t ON t.table_id = s.table_id
            WHERE s.table_id = ?1
            "#,
        )
        .bind(table_id.to_string())
        .fetch_optional(&mut *conn)
        .await
        .map_err(|e| map_sqlx_error("get_watermark", e))?;

        row.map(TableSyncStatus::try_from).transpose()
    }

    #[instrument(skip(self, update), fields(table_id = %update.table_id), err)]
    pub async fn upsert(&self, update: &WatermarkUpdate) -> SyncResult<()> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| map_sqlx_error("upsert_watermark", e))?;
        Self::upsert_in(&mut *conn, update).await
    }

    /// Last-write-wins upsert of a successful outcome; clears `last_error`.
    pub async fn upsert_in(conn: &mut SqliteConnection, update: &WatermarkUpdate) -> SyncResult<()> {
        sqlx::query(
            r#"
            INSERT INTO table_sync_status (
                table_id, last_job_id, last_status, last_sync_at, last_error,
                row_count, size_bytes, incremental_key, last_value, updated_at
            )
            VALUES (?1, ?2, ?3, ?4, NULL, ?5, ?6, ?7, ?8, ?4)
            ON CONFLICT (table_id) DO UPDATE SET
                last_job_id = excluded.last_job_id,
                last_status = excluded.last_status,
                last_sync_at = excluded.last_sync_at,
                last_error = NULL,
                row_count = excluded.row_count,
                size_bytes = excluded.size_bytes,
                incremental_key = COALESCE(excluded.incremental_key, table_sync_status.incremental_key),
                last_value = CASE
                    WHEN excluded.incremental_key IS NULL THEN table_sync_status.last_value
                    ELSE excluded.last_value
                END,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(update.table_id.to_string())
        .bind(update.job_id.to_string())
        .bind(update.status.as_str())
        .bind(format_ts(update.synced_at))
        .bind(to_i64(update.row_count))
        .bind(to_i64(update.size_bytes))
        .bind(update.incremental_key.as_deref())
        .bind(update.last_value.as_deref())
        .execute(&mut *conn)
        .await
        .map_err(|e| map_sqlx_error("upsert_watermark", e))?;

        debug!(table_id = %update.table_id, job_id = %update.job_id, "watermark updated");
        Ok(())
    }

    #[instrument(skip(self, error), fields(table_id = %table_id, job_id = %job_id), err)]
    pub async fn record_failure(&self, table_id: TableId, job_id: JobId, error: &str) -> SyncResult<()> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| map_sqlx_error("record_failure", e))?;
        Self::record_failure_in(&mut *conn, table_id, job_id, error, Utc::now()).await
    }

    /// Record a failed outcome. Counts, `last_sync_at` and the incremental
    /// seed describe the last good sync and are left alone.
    pub async fn record_failure_in(
        conn: &mut SqliteConnection,
        table_id: TableId,
        job_id: JobId,
        error: &str,
        at: DateTime<Utc>,
    ) -> SyncResult<()> {
        sqlx::query(
            r#"
            INSERT INTO table_sync_status (table_id, last_job_id, last_status, last_error, updated_at)
            VALUES (?1, ?2, 'failed', ?3, ?4)
            ON CONFLICT (table_id) DO UPDATE SET
                last_job_id = excluded.last_job_id,
                last_status = 'failed',
                last_error = excluded.last_error,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(table_id.to_string())
        .bind(job_id.to_string())
        .bind(error)
        .bind(format_ts(at))
        .execute(&mut *conn)
        .await
        .map_err(|e| map_sqlx_error("record_failure", e))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::registry::TableRegistry;
    use crate::source::MemorySource;
    use serde_json::json;
    use tablesync_core::SourceColumn;

    async fn setup() -> (WatermarkStore, TableId) {
        let pool = db::connect_in_memory().await.unwrap();
        db::migrate(&pool).await.unwrap();
        let source = MemorySource::arc();
        source.add_table(
            "sales",
            "orders",
            vec![SourceColumn::new("ID", "NUMBER")],
            vec![vec![json!(1)]],
        );
        let table = TableRegistry::new(pool.clone(), source)
            .register("orders", "sales")
            .await
            .unwrap();
        (WatermarkStore::new(pool), table.table_id)
    }

    fn success(table_id: TableId, key: Option<&str>, last_value: Option<&str>) -> WatermarkUpdate {
        WatermarkUpdate {
            table_id,
            job_id: JobId::new(),
            status: JobStatus::Completed,
            synced_at: Utc::now(),
            row_count: 10,
            size_bytes: 2048,
            incremental_key: key.map(str::to_string),
            last_value: last_value.map(str::to_string),
        }
    }

    #[tokio::test]
    async fn missing_row_reads_as_none() {
        let (store, table_id) = setup().await;
        assert!(store.get(table_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn upsert_is_last_write_wins() {
        let (store, table_id) = setup().await;
        store.upsert(&success(table_id, Some("ID"), Some("7"))).await.unwrap();

        let second = success(table_id, Some("ID"), Some("9"));
        store.upsert(&second).await.unwrap();

        let status = store.get(table_id).await.unwrap().unwrap();
        assert_eq!(status.table_name, "orders");
        assert_eq!(status.last_job_id, Some(second.job_id));
        assert_eq!(status.last_status, Some(JobStatus::Completed));
        assert_eq!(status.row_count, 10);
        assert_eq!(status.size_bytes, 2048);
        assert_eq!(status.last_value.as_deref(), Some("9"));
    }

    #[tokio::test]
    async fn keyless_success_keeps_the_seed() {
        let (store, table_id) = setup().await;
        store.upsert(&success(table_id, Some("ID"), Some("7"))).await.unwrap();
        store.upsert(&success(table_id, None, None)).await.unwrap();

        let status = store.get(table_id).await.unwrap().unwrap();
        assert_eq!(status.seed_for("ID"), Some("7"));
    }

    #[tokio::test]
    async fn failure_preserves_counts_and_success_clears_error() {
        let (store, table_id) = setup().await;
        let good = success(table_id, Some("ID"), Some("7"));
        store.upsert(&good).await.unwrap();

        let failed_job = JobId::new();
        store.record_failure(table_id, failed_job, "boom").await.unwrap();

        let status = store.get(table_id).await.unwrap().unwrap();
        assert_eq!(status.last_job_id, Some(failed_job));
        assert_eq!(status.last_status, Some(JobStatus::Failed));
        assert_eq!(status.last_error.as_deref(), Some("boom"));
        assert_eq!(status.row_count, 10);
        assert!(status.last_sync_at.is_some());
        assert_eq!(status.last_value.as_deref(), Some("7"));

        store.upsert(&success(table_id, None, None)).await.unwrap();
        let status = store.get(table_id).await.unwrap().unwrap();
        assert!(status.last_error.is_none());
    }

    #[tokio::test]
    async fn first_failure_inserts_a_row() {
        let (store, table_id) = setup().await;
        let job_id = JobId::new();
        store.record_failure(table_id, job_id, "timeout").await.unwrap();

        let status = store.get(table_id).await.unwrap().unwrap();
        assert_eq!(status.last_job_id, Some(job_id));
        assert_eq!(status.row_count, 0);
        assert!(status.last_sync_at.is_none());
    }
}
