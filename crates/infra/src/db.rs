//! Embedded SQLite store: connection setup, schema migration and the
//! conversions shared by every repository in this crate.
//!
//! ## Layout
//!
//! One database holds both the engine metadata (`registered_tables`,
//! `sync_jobs`, `table_sync_status`, `table_columns`) and the mirrored tables,
//! which are named `"<schema>.<table>"`. Keeping both in one file lets a job
//! commit its rows, its completion and its watermark in a single transaction.
//!
//! Timestamps are fixed-width RFC 3339 UTC text with microseconds, so string
//! comparison in SQL matches chronological order.

use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Sqlite, SqlitePool, Transaction};
use tracing::{info, instrument};

use tablesync_core::{SyncError, SyncResult};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS registered_tables (
    table_id      TEXT PRIMARY KEY,
    table_name    TEXT NOT NULL,
    schema_name   TEXT NOT NULL,
    source_system TEXT NOT NULL,
    status        TEXT NOT NULL CHECK (status IN ('active', 'inactive')),
    created_at    TEXT NOT NULL,
    updated_at    TEXT NOT NULL,
    UNIQUE (schema_name, table_name)
);

CREATE TABLE IF NOT EXISTS sync_jobs (
    job_id            TEXT PRIMARY KEY,
    table_id          TEXT NOT NULL REFERENCES registered_tables (table_id),
    strategy          TEXT NOT NULL,
    status            TEXT NOT NULL CHECK (status IN ('pending', 'running', 'completed', 'failed')),
    incremental_key   TEXT NULL,
    filter_expression TEXT NULL,
    batch_size        INTEGER NOT NULL,
    max_attempts      INTEGER NOT NULL,
    created_at        TEXT NOT NULL,
    started_at        TEXT NULL,
    completed_at      TEXT NULL,
    next_attempt_at   TEXT NULL,
    error             TEXT NULL,
    stats             TEXT NOT NULL DEFAULT '{}',
    retries           INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS sync_jobs_status_created
    ON sync_jobs (status, created_at);
CREATE INDEX IF NOT EXISTS sync_jobs_table
    ON sync_jobs (table_id, status);

CREATE TABLE IF NOT EXISTS table_sync_status (
    table_id        TEXT PRIMARY KEY REFERENCES registered_tables (table_id),
    last_job_id     TEXT NULL,
    last_status     TEXT NULL,
    last_sync_at    TEXT NULL,
    last_error      TEXT NULL,
    row_count       INTEGER NOT NULL DEFAULT 0,
    size_bytes      INTEGER NOT NULL DEFAULT 0,
    incremental_key TEXT NULL,
    last_value      TEXT NULL,
    updated_at      TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS table_columns (
    table_id         TEXT NOT NULL REFERENCES registered_tables (table_id),
    ordinal          INTEGER NOT NULL,
    column_name      TEXT NOT NULL,
    source_type      TEXT NOT NULL,
    destination_type TEXT NOT NULL,
    nullable         INTEGER NOT NULL,
    PRIMARY KEY (table_id, ordinal)
);
"#;

/// Open (creating if missing) a file-backed store. Missing parent
/// directories of the database file are created as well.
#[instrument(err)]
pub async fn connect(url: &str) -> SyncResult<SqlitePool> {
    let options = SqliteConnectOptions::from_str(url)
        .map_err(|e| map_sqlx_error("connect", e))?;

    if let Some(parent) = options.get_filename().parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                SyncError::internal(format!(
                    "failed to create database directory {}: {e}",
                    parent.display()
                ))
            })?;
        }
    }

    let options = options
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .foreign_keys(true)
        .busy_timeout(Duration::from_secs(30));

    let pool = SqlitePoolOptions::new()
        .max_connections(8)
        .connect_with(options)
        .await
        .map_err(|e| map_sqlx_error("connect", e))?;

    info!(url, "opened local store");
    Ok(pool)
}

/// Open a private in-memory store on a single pinned connection.
///
/// Every handle shares that one connection, so the database lives exactly as
/// long as the pool.
pub async fn connect_in_memory() -> SyncResult<SqlitePool> {
    let options = SqliteConnectOptions::from_str("sqlite::memory:")
        .map_err(|e| map_sqlx_error("connect_in_memory", e))?
        .foreign_keys(true);

    SqlitePoolOptions::new()
        .max_connections(1)
        .min_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect_with(options)
        .await
        .map_err(|e| map_sqlx_error("connect_in_memory", e))
}

/// Start a transaction that takes the write lock up front.
///
/// A deferred transaction that reads before it writes fails with
/// `SQLITE_BUSY` without waiting if another connection commits in between,
/// so every transaction that writes opens with `BEGIN IMMEDIATE`.
pub async fn begin_write(
    pool: &SqlitePool,
    operation: &str,
) -> SyncResult<Transaction<'static, Sqlite>> {
    pool.begin_with("BEGIN IMMEDIATE")
        .await
        .map_err(|e| map_sqlx_error(operation, e))
}

/// Create the metadata tables. Idempotent.
#[instrument(skip(pool), err)]
pub async fn migrate(pool: &SqlitePool) -> SyncResult<()> {
    sqlx::raw_sql(SCHEMA)
        .execute(pool)
        .await
        .map_err(|e| map_sqlx_error("migrate", e))?;
    Ok(())
}

/// Map a sqlx error into the engine taxonomy, naming the failed operation.
pub fn map_sqlx_error(operation: &str, err: sqlx::Error) -> SyncError {
    match err {
        sqlx::Error::Database(db_err) => {
            SyncError::internal(format!("database error in {}: {}", operation, db_err.message()))
        }
        sqlx::Error::PoolClosed => {
            SyncError::internal(format!("connection pool closed in {}", operation))
        }
        sqlx::Error::PoolTimedOut => {
            SyncError::internal(format!("timed out acquiring a connection in {}", operation))
        }
        sqlx::Error::RowNotFound => {
            SyncError::internal(format!("unexpected row not found in {}", operation))
        }
        other => SyncError::internal(format!("sqlx error in {}: {}", operation, other)),
    }
}

pub fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn parse_ts(raw: &str) -> SyncResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| SyncError::internal(format!("malformed timestamp '{raw}': {e}")))
}

pub fn parse_opt_ts(raw: Option<String>) -> SyncResult<Option<DateTime<Utc>>> {
    raw.as_deref().map(parse_ts).transpose()
}

/// Parse an identifier or enum stored as text. Corrupt values are internal
/// errors, not request errors.
pub(crate) fn parse_stored<T>(column: &str, raw: &str) -> SyncResult<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.parse::<T>()
        .map_err(|e| SyncError::internal(format!("corrupt {column} '{raw}': {e}")))
}

/// Non-negative INTEGER column to `u64`.
pub(crate) fn to_u64(value: i64) -> u64 {
    u64::try_from(value).unwrap_or_default()
}

/// `u64` counter to an INTEGER bind value, saturating.
pub(crate) fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[tokio::test]
    async fn migrate_is_idempotent() {
        let pool = connect_in_memory().await.unwrap();
        migrate(&pool).await.unwrap();
        migrate(&pool).await.unwrap();

        let tables: Vec<(String,)> = sqlx::query_as(
            "SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name",
        )
        .fetch_all(&pool)
        .await
        .unwrap();
        let names: Vec<_> = tables.into_iter().map(|(n,)| n).collect();
        assert_eq!(
            names,
            vec!["registered_tables", "sync_jobs", "table_columns", "table_sync_status"]
        );
    }

    #[test]
    fn timestamps_are_fixed_width_and_round_trip() {
        let a = Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap();
        let b = a + chrono::Duration::microseconds(1);

        assert_eq!(format_ts(a), "2024-01-02T03:04:05.000000Z");
        assert!(format_ts(a) < format_ts(b));
        assert_eq!(parse_ts(&format_ts(b)).unwrap(), b);
    }

    #[test]
    fn malformed_timestamp_is_internal() {
        assert!(matches!(parse_ts("yesterday"), Err(SyncError::Internal(_))));
    }

    #[tokio::test]
    async fn connect_creates_missing_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data").join("nested").join("sync.db");

        let pool = connect(&format!("sqlite://{}", path.display())).await.unwrap();
        migrate(&pool).await.unwrap();
        pool.close().await;

        assert!(path.exists());
    }

    #[tokio::test]
    async fn write_transactions_roll_back_when_dropped() {
        let pool = connect_in_memory().await.unwrap();
        migrate(&pool).await.unwrap();

        let mut tx = begin_write(&pool, "test").await.unwrap();
        sqlx::query("CREATE TABLE scratch (id INTEGER)")
            .execute(&mut *tx)
            .await
            .unwrap();
        drop(tx);

        let exists: Option<(String,)> =
            sqlx::query_as("SELECT name FROM sqlite_master WHERE name = 'scratch'")
                .fetch_optional(&pool)
                .await
                .unwrap();
        assert!(exists.is_none());
    }
}
