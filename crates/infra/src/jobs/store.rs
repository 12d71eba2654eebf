//! Durable sync job queue.
//!
//! Jobs live in `sync_jobs`. Every state transition is a compare-and-set on
//! the current status, so a transition that lost a race (a reaped job, a
//! removed table) is reported as `false` instead of overwriting a terminal
//! state.

use chrono::{DateTime, Utc};
use sqlx::{FromRow, QueryBuilder, Sqlite, SqliteConnection, SqlitePool};
use tracing::{debug, instrument};

use tablesync_core::{
    JobCounts, JobId, JobStats, JobStatus, SyncError, SyncJob, SyncResult, TableId,
};

use crate::db::{format_ts, map_sqlx_error, parse_opt_ts, parse_stored, parse_ts, to_u64};

const JOB_COLUMNS: &str = "job_id, table_id, strategy, status, incremental_key, filter_expression, \
     batch_size, max_attempts, created_at, started_at, completed_at, next_attempt_at, error, \
     stats, retries";

#[derive(Debug, FromRow)]
struct JobRow {
    job_id: String,
    table_id: String,
    strategy: String,
    status: String,
    incremental_key: Option<String>,
    filter_expression: Option<String>,
    batch_size: i64,
    max_attempts: i64,
    created_at: String,
    started_at: Option<String>,
    completed_at: Option<String>,
    next_attempt_at: Option<String>,
    error: Option<String>,
    stats: String,
    retries: i64,
}

impl TryFrom<JobRow> for SyncJob {
    type Error = SyncError;

    fn try_from(row: JobRow) -> SyncResult<Self> {
        let stats: JobStats = serde_json::from_str(&row.stats)
            .map_err(|e| SyncError::internal(format!("corrupt stats for job {}: {e}", row.job_id)))?;

        Ok(Self {
            job_id: parse_stored("job_id", &row.job_id)?,
            table_id: parse_stored("table_id", &row.table_id)?,
            strategy: parse_stored("strategy", &row.strategy)?,
            status: parse_stored("status", &row.status)?,
            incremental_key: row.incremental_key,
            filter_expression: row.filter_expression,
            batch_size: u32::try_from(row.batch_size).unwrap_or(u32::MAX),
            max_attempts: u32::try_from(row.max_attempts).unwrap_or(1),
            created_at: parse_ts(&row.created_at)?,
            started_at: parse_opt_ts(row.started_at)?,
            completed_at: parse_opt_ts(row.completed_at)?,
            next_attempt_at: parse_opt_ts(row.next_attempt_at)?,
            error: row.error,
            stats,
            retries: u32::try_from(row.retries).unwrap_or_default(),
        })
    }
}

/// Condition a `running → failed` transition must still satisfy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailGuard {
    /// The job is still on this attempt (`retries` unchanged).
    Attempt(u32),
    /// The attempt started before this instant.
    StartedBefore(DateTime<Utc>),
}

/// Filter for [`SyncJobStore::list`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JobFilter {
    pub table_id: Option<TableId>,
    pub status: Option<JobStatus>,
}

impl JobFilter {
    pub fn table(table_id: TableId) -> Self {
        Self {
            table_id: Some(table_id),
            status: None,
        }
    }

    pub fn with_status(mut self, status: JobStatus) -> Self {
        self.status = Some(status);
        self
    }
}

fn encode_stats(stats: &JobStats) -> SyncResult<String> {
    serde_json::to_string(stats).map_err(|e| SyncError::internal(format!("failed to encode stats: {e}")))
}

#[derive(Debug, Clone)]
pub struct SyncJobStore {
    pool: SqlitePool,
}

impl SyncJobStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    #[instrument(skip(self, job), fields(job_id = %job.job_id, table_id = %job.table_id), err)]
    pub async fn insert(&self, job: &SyncJob) -> SyncResult<()> {
        sqlx::query(&format!(
            "INSERT INTO sync_jobs ({JOB_COLUMNS}) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)"
        ))
        .bind(job.job_id.to_string())
        .bind(job.table_id.to_string())
        .bind(job.strategy.as_str())
        .bind(job.status.as_str())
        .bind(job.incremental_key.as_deref())
        .bind(job.filter_expression.as_deref())
        .bind(i64::from(job.batch_size))
        .bind(i64::from(job.max_attempts))
        .bind(format_ts(job.created_at))
        .bind(job.started_at.map(format_ts))
        .bind(job.completed_at.map(format_ts))
        .bind(job.next_attempt_at.map(format_ts))
        .bind(job.error.as_deref())
        .bind(encode_stats(&job.stats)?)
        .bind(i64::from(job.retries))
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("insert_job", e))?;
        Ok(())
    }

    pub async fn get(&self, job_id: JobId) -> SyncResult<Option<SyncJob>> {
        let row: Option<JobRow> =
            sqlx::query_as(&format!("SELECT {JOB_COLUMNS} FROM sync_jobs WHERE job_id = ?1"))
                .bind(job_id.to_string())
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| map_sqlx_error("get_job", e))?;

        row.map(SyncJob::try_from).transpose()
    }

    /// Claim the oldest due pending job and mark it `running`.
    ///
    /// A job is skipped while another job of the same table is running or
    /// an older job of the same table is still pending, so each table runs
    /// its jobs one at a time in submission order.
    #[instrument(skip(self), err)]
    pub async fn claim_next(&self, now: DateTime<Utc>) -> SyncResult<Option<SyncJob>> {
        let row: Option<JobRow> = sqlx::query_as(&format!(
            r#"
            UPDATE sync_jobs
            SET status = 'running', started_at = ?1
            WHERE job_id = (
                SELECT j.job_id
                FROM sync_jobs j
                WHERE j.status = 'pending'
                  AND (j.next_attempt_at IS NULL OR j.next_attempt_at <= ?1)
                  AND NOT EXISTS (
                      SELECT 1 FROM sync_jobs r
                      WHERE r.table_id = j.table_id AND r.status = 'running'
                  )
                  AND NOT EXISTS (
                      SELECT 1 FROM sync_jobs o
                      WHERE o.table_id = j.table_id
                        AND o.status = 'pending'
                        AND (o.created_at < j.created_at
                             OR (o.created_at = j.created_at AND o.job_id < j.job_id))
                  )
                ORDER BY j.created_at, j.job_id
                LIMIT 1
            )
            AND status = 'pending'
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(format_ts(now))
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("claim_next", e))?;

        let job = row.map(SyncJob::try_from).transpose()?;
        if let Some(job) = &job {
            debug!(job_id = %job.job_id, table_id = %job.table_id, attempt = job.attempt(), "claimed job");
        }
        Ok(job)
    }

    /// Put a running job back in the queue for another attempt.
    pub async fn requeue(
        &self,
        job_id: JobId,
        retries: u32,
        next_attempt_at: DateTime<Utc>,
        error: &str,
    ) -> SyncResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE sync_jobs
            SET status = 'pending', retries = retries + 1, next_attempt_at = ?3, error = ?4
            WHERE job_id = ?1 AND status = 'running' AND retries = ?2
            "#,
        )
        .bind(job_id.to_string())
        .bind(i64::from(retries))
        .bind(format_ts(next_attempt_at))
        .bind(error)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("requeue_job", e))?;

        Ok(result.rows_affected() == 1)
    }

    /// `running → completed` for the attempt identified by `retries`.
    pub async fn complete_in(
        conn: &mut SqliteConnection,
        job_id: JobId,
        retries: u32,
        completed_at: DateTime<Utc>,
        stats: &JobStats,
    ) -> SyncResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE sync_jobs
            SET status = 'completed', completed_at = ?3, stats = ?4, error = NULL, next_attempt_at = NULL
            WHERE job_id = ?1 AND status = 'running' AND retries = ?2
            "#,
        )
        .bind(job_id.to_string())
        .bind(i64::from(retries))
        .bind(format_ts(completed_at))
        .bind(encode_stats(stats)?)
        .execute(&mut *conn)
        .await
        .map_err(|e| map_sqlx_error("complete_job", e))?;

        Ok(result.rows_affected() == 1)
    }

    /// `running → failed`, provided `guard` still holds.
    pub async fn fail_in(
        conn: &mut SqliteConnection,
        job_id: JobId,
        guard: FailGuard,
        error: &str,
        at: DateTime<Utc>,
    ) -> SyncResult<bool> {
        let condition = match guard {
            FailGuard::Attempt(_) => "retries = ?4",
            FailGuard::StartedBefore(_) => "started_at < ?4",
        };
        let sql = format!(
            "UPDATE sync_jobs SET status = 'failed', completed_at = ?2, error = ?3, next_attempt_at = NULL \
             WHERE job_id = ?1 AND status = 'running' AND {condition}"
        );

        let query = sqlx::query(&sql)
            .bind(job_id.to_string())
            .bind(format_ts(at))
            .bind(error);
        let query = match guard {
            FailGuard::Attempt(retries) => query.bind(i64::from(retries)),
            FailGuard::StartedBefore(cutoff) => query.bind(format_ts(cutoff)),
        };
        let result = query
            .execute(&mut *conn)
            .await
            .map_err(|e| map_sqlx_error("fail_job", e))?;

        Ok(result.rows_affected() == 1)
    }

    /// Jobs newest first.
    pub async fn list(&self, filter: JobFilter, limit: u32) -> SyncResult<Vec<SyncJob>> {
        let mut qb: QueryBuilder<Sqlite> =
            QueryBuilder::new(format!("SELECT {JOB_COLUMNS} FROM sync_jobs WHERE 1 = 1"));
        if let Some(table_id) = filter.table_id {
            qb.push(" AND table_id = ").push_bind(table_id.to_string());
        }
        if let Some(status) = filter.status {
            qb.push(" AND status = ").push_bind(status.as_str());
        }
        qb.push(" ORDER BY created_at DESC, job_id DESC LIMIT ")
            .push_bind(i64::from(limit));

        let rows: Vec<JobRow> = qb
            .build_query_as()
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("list_jobs", e))?;

        rows.into_iter().map(SyncJob::try_from).collect()
    }

    pub async fn counts(&self) -> SyncResult<JobCounts> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM sync_jobs GROUP BY status")
                .fetch_all(&self.pool)
                .await
                .map_err(|e| map_sqlx_error("job_counts", e))?;

        let mut counts = JobCounts::default();
        for (status, n) in rows {
            let n = to_u64(n);
            match parse_stored::<JobStatus>("status", &status)? {
                JobStatus::Pending => counts.pending = n,
                JobStatus::Running => counts.running = n,
                JobStatus::Completed => counts.completed = n,
                JobStatus::Failed => counts.failed = n,
            }
        }
        Ok(counts)
    }

    /// Running jobs whose attempt started before `cutoff`.
    pub async fn running_since_before(&self, cutoff: DateTime<Utc>) -> SyncResult<Vec<SyncJob>> {
        let rows: Vec<JobRow> = sqlx::query_as(&format!(
            "SELECT {JOB_COLUMNS} FROM sync_jobs \
             WHERE status = 'running' AND started_at < ?1 \
             ORDER BY started_at"
        ))
        .bind(format_ts(cutoff))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("stale_jobs", e))?;

        rows.into_iter().map(SyncJob::try_from).collect()
    }

    /// Delete `status` jobs that finished before `cutoff`, except jobs a
    /// watermark still points at. Returns the number deleted.
    pub async fn delete_finished_before(
        &self,
        status: JobStatus,
        cutoff: DateTime<Utc>,
    ) -> SyncResult<u64> {
        if !status.is_terminal() {
            return Err(SyncError::internal(format!(
                "refusing to purge {} jobs",
                status.as_str()
            )));
        }

        let result = sqlx::query(
            r#"
            DELETE FROM sync_jobs
            WHERE status = ?1
              AND completed_at < ?2
              AND job_id NOT IN (
                  SELECT last_job_id FROM table_sync_status WHERE last_job_id IS NOT NULL
              )
            "#,
        )
        .bind(status.as_str())
        .bind(format_ts(cutoff))
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("purge_jobs", e))?;

        Ok(result.rows_affected())
    }
}
