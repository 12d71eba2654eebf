//! Sync job engine.
//!
//! `start_sync` validates a request and queues a `pending` job. Workers call
//! [`SyncEngine::run_next`], which claims the next due job and executes it:
//!
//! 1. re-check that the table is registered and active,
//! 2. fetch and translate the source schema, creating the mirrored table
//!    when absent (a snapshot rebuilds it instead),
//! 3. read the window chunk by chunk into a per-job staging table,
//! 4. in one transaction: publish the staged rows (clearing the mirror for
//!    full and snapshot runs), mark the job `completed` and upsert the
//!    watermark.
//!
//! Failures go through the [`Supervisor`]: transient source errors re-queue
//! the job with backoff until its attempts run out, everything else fails it.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use sqlx::SqlitePool;
use tracing::{error, info, instrument, warn};

use tablesync_core::watermark::advance;
use tablesync_core::{
    translate_columns, DestinationColumn, JobCounts, JobId, JobStats, JobStatus, RegisteredTable,
    RetryPolicy, SyncError, SyncJob, SyncRequest, SyncResult, SyncStrategy, TableSyncStatus,
    DEFAULT_BATCH_SIZE,
};

use crate::destination::{mirror_name, DestinationStore};
use crate::jobs::store::{FailGuard, JobFilter, SyncJobStore};
use crate::jobs::supervisor::{RetryDecision, Supervisor};
use crate::registry::TableRegistry;
use crate::source::{Page, RowBatch, SourceClient};
use crate::watermark::{WatermarkStore, WatermarkUpdate};

/// Engine-wide settings.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Chunk size for requests built with [`SyncEngine::request`].
    pub batch_size: u32,
    /// Backoff and default attempt bound.
    pub retry: RetryPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            retry: RetryPolicy::default(),
        }
    }
}

impl EngineConfig {
    pub fn with_batch_size(mut self, batch_size: u32) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

/// Response to a sync submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SubmittedJob {
    pub job_id: JobId,
    pub status: JobStatus,
}

/// Result of executing one claimed job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Completed { rows_processed: u64 },
    /// Re-queued after a transient source error.
    Retrying { delay: Duration },
    Failed { error: String },
    /// The job left `running` underneath the attempt (reaped or removed);
    /// nothing was recorded.
    Abandoned,
}

/// Rows read by one attempt, before publishing.
struct Staged {
    rows: u64,
    total_rows: u64,
    bytes: u64,
    last_value: Option<String>,
}

#[derive(Clone)]
pub struct SyncEngine {
    source: Arc<dyn SourceClient>,
    registry: TableRegistry,
    jobs: SyncJobStore,
    watermarks: WatermarkStore,
    destination: DestinationStore,
    supervisor: Supervisor,
    config: EngineConfig,
    pool: SqlitePool,
}

impl std::fmt::Debug for SyncEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine")
            .field("source", &self.source.system_name())
            .field("config", &self.config)
            .finish()
    }
}

impl SyncEngine {
    pub fn new(pool: SqlitePool, source: Arc<dyn SourceClient>, config: EngineConfig) -> Self {
        Self {
            registry: TableRegistry::new(pool.clone(), source.clone()),
            jobs: SyncJobStore::new(pool.clone()),
            watermarks: WatermarkStore::new(pool.clone()),
            destination: DestinationStore::new(pool.clone()),
            supervisor: Supervisor::new(config.retry.clone()),
            source,
            config,
            pool,
        }
    }

    pub fn registry(&self) -> &TableRegistry {
        &self.registry
    }

    pub fn jobs(&self) -> &SyncJobStore {
        &self.jobs
    }

    pub fn watermarks(&self) -> &WatermarkStore {
        &self.watermarks
    }

    pub fn destination(&self) -> &DestinationStore {
        &self.destination
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// A request pre-filled with the configured batch size.
    pub fn request(&self, table_name: &str, schema_name: &str, strategy: SyncStrategy) -> SyncRequest {
        SyncRequest::new(table_name, schema_name, strategy).with_batch_size(self.config.batch_size)
    }

    pub async fn register_table(&self, table_name: &str, schema_name: &str) -> SyncResult<RegisteredTable> {
        self.registry.register(table_name, schema_name).await
    }

    pub async fn remove_table(&self, table_name: &str, schema_name: &str) -> SyncResult<RegisteredTable> {
        self.registry.remove(table_name, schema_name).await
    }

    pub async fn list_tables(&self) -> SyncResult<Vec<RegisteredTable>> {
        self.registry.list().await
    }

    /// Queue a sync job for an active table.
    #[instrument(
        skip(self, request),
        fields(table = %format!("{}.{}", request.schema_name, request.table_name), strategy = request.strategy.as_str()),
        err
    )]
    pub async fn start_sync(&self, request: SyncRequest) -> SyncResult<SubmittedJob> {
        request.validate()?;

        let table = self
            .registry
            .get(&request.table_name, &request.schema_name)
            .await?
            .filter(RegisteredTable::is_active)
            .ok_or_else(|| {
                SyncError::not_allowed(format!(
                    "table {}.{} is not registered or not active",
                    request.schema_name, request.table_name
                ))
            })?;

        let job = SyncJob::new(table.table_id, &request, self.config.retry.max_attempts);
        self.jobs.insert(&job).await?;

        info!(
            job_id = %job.job_id,
            table = %table.qualified_name(),
            strategy = job.strategy.as_str(),
            max_attempts = job.max_attempts,
            "sync job queued"
        );
        Ok(SubmittedJob {
            job_id: job.job_id,
            status: job.status,
        })
    }

    pub async fn get_job_status(&self, job_id: JobId) -> SyncResult<SyncJob> {
        self.jobs
            .get(job_id)
            .await?
            .ok_or_else(|| SyncError::not_found(format!("job {job_id} not found")))
    }

    pub async fn get_table_status(&self, table_name: &str, schema_name: &str) -> SyncResult<TableSyncStatus> {
        let table = self.registered(table_name, schema_name).await?;
        Ok(self
            .watermarks
            .get(table.table_id)
            .await?
            .unwrap_or_else(|| TableSyncStatus::never_synced(&table)))
    }

    pub async fn list_jobs(&self, filter: JobFilter, limit: u32) -> SyncResult<Vec<SyncJob>> {
        self.jobs.list(filter, limit).await
    }

    pub async fn job_counts(&self) -> SyncResult<JobCounts> {
        self.jobs.counts().await
    }

    /// Column mapping recorded for the mirrored table.
    pub async fn destination_columns(
        &self,
        table_name: &str,
        schema_name: &str,
    ) -> SyncResult<Vec<DestinationColumn>> {
        let table = self.registered(table_name, schema_name).await?;
        self.destination.columns(table.table_id).await
    }

    async fn registered(&self, table_name: &str, schema_name: &str) -> SyncResult<RegisteredTable> {
        self.registry
            .get(table_name, schema_name)
            .await?
            .ok_or_else(|| {
                SyncError::not_found(format!("table {schema_name}.{table_name} is not registered"))
            })
    }

    /// Claim and execute the next due job, if any.
    pub async fn run_next(&self) -> SyncResult<Option<(JobId, RunOutcome)>> {
        let Some(job) = self.jobs.claim_next(Utc::now()).await? else {
            return Ok(None);
        };
        let outcome = self.run_claimed(&job).await?;
        Ok(Some((job.job_id, outcome)))
    }

    /// Execute a job already moved to `running` by this caller.
    #[instrument(skip(self, job), fields(job_id = %job.job_id, attempt = job.attempt()))]
    pub async fn run_claimed(&self, job: &SyncJob) -> SyncResult<RunOutcome> {
        info!(strategy = job.strategy.as_str(), "sync job running");

        let result = self.execute(job).await;
        if let Err(err) = self.destination.drop_staging(job.job_id).await {
            warn!(error = %err, "failed to drop staging table");
        }

        match result {
            Ok(stats) => {
                info!(
                    rows = stats.rows_processed,
                    total_rows = stats.total_rows,
                    bytes = stats.bytes_processed,
                    "sync job completed"
                );
                Ok(RunOutcome::Completed {
                    rows_processed: stats.rows_processed,
                })
            }
            Err(err) => self.handle_failure(job, err).await,
        }
    }

    async fn handle_failure(&self, job: &SyncJob, err: SyncError) -> SyncResult<RunOutcome> {
        match self.supervisor.decide(job, &err) {
            RetryDecision::Retry { delay } => {
                let next = Utc::now() + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
                if !self.jobs.requeue(job.job_id, job.retries, next, &err.to_string()).await? {
                    warn!(error = %err, "job left running before it could be re-queued");
                    return Ok(RunOutcome::Abandoned);
                }
                warn!(
                    error = %err,
                    delay_ms = delay.as_millis() as u64,
                    max_attempts = job.max_attempts,
                    "transient failure; job re-queued"
                );
                Ok(RunOutcome::Retrying { delay })
            }
            RetryDecision::Fail { error: message } => {
                let mut tx = crate::db::begin_write(&self.pool, "fail_job").await?;

                let now = Utc::now();
                let failed = SyncJobStore::fail_in(
                    &mut *tx,
                    job.job_id,
                    FailGuard::Attempt(job.retries),
                    &message,
                    now,
                )
                .await?;
                if !failed {
                    warn!(error = %message, "job left running before it could be failed");
                    return Ok(RunOutcome::Abandoned);
                }
                WatermarkStore::record_failure_in(&mut *tx, job.table_id, job.job_id, &message, now)
                    .await?;
                tx.commit()
                    .await
                    .map_err(|e| crate::db::map_sqlx_error("fail_job", e))?;

                error!(error = %message, "sync job failed");
                Ok(RunOutcome::Failed { error: message })
            }
        }
    }

    async fn execute(&self, job: &SyncJob) -> SyncResult<JobStats> {
        let table = self
            .registry
            .get_by_id(job.table_id)
            .await?
            .filter(RegisteredTable::is_active)
            .ok_or_else(|| {
                SyncError::not_allowed(format!("table {} is no longer active", job.table_id))
            })?;

        let source_columns = self
            .source
            .fetch_schema(&table.table_name, &table.schema_name)
            .await?;
        if source_columns.is_empty() {
            return Err(SyncError::logical(format!(
                "source table {} has no columns or no longer exists",
                table.qualified_name()
            )));
        }
        let translated = translate_columns(&source_columns);

        let columns = if job.strategy == SyncStrategy::Snapshot {
            translated
        } else {
            let recorded = self.destination.ensure_table(&table, &translated).await?;
            let drift: Vec<&str> = translated
                .iter()
                .filter(|c| !recorded.iter().any(|r| r.name == c.name))
                .map(|c| c.name.as_str())
                .collect();
            if !drift.is_empty() {
                warn!(
                    table = %table.qualified_name(),
                    columns = ?drift,
                    "source columns missing from destination; skipping them"
                );
            }
            recorded
        };

        let stats = self
            .source
            .fetch_table_stats(&table.table_name, &table.schema_name)
            .await?;

        let seed = match (job.strategy, job.incremental_key.as_deref()) {
            (SyncStrategy::Incremental, Some(key)) => self
                .watermarks
                .get(table.table_id)
                .await?
                .and_then(|status| status.seed_for(key).map(str::to_string)),
            (SyncStrategy::Incremental, None) => {
                return Err(SyncError::logical("incremental job without an incremental key"));
            }
            _ => None,
        };

        let staging = self.destination.create_staging(job.job_id, &columns).await?;
        let staged = self.stage(job, &table, &columns, &staging, seed.as_deref()).await?;

        let completed_at = Utc::now();
        let job_stats = JobStats {
            rows_processed: staged.rows,
            total_rows: staged.total_rows,
            bytes_processed: staged.bytes,
            size_bytes: stats.size_bytes,
            last_value: staged.last_value.clone(),
        };

        let mut tx = crate::db::begin_write(&self.pool, "complete_job").await?;

        let target = mirror_name(&table);
        let replace = match job.strategy {
            SyncStrategy::Snapshot => {
                DestinationStore::recreate_in(&mut *tx, &table, &columns).await?;
                false
            }
            SyncStrategy::Full => true,
            // Without a seed for this key the run read the whole table.
            SyncStrategy::Incremental => seed.is_none(),
        };
        DestinationStore::publish_in(&mut *tx, &staging, &target, &columns, replace).await?;

        if !SyncJobStore::complete_in(&mut *tx, job.job_id, job.retries, completed_at, &job_stats).await? {
            // Dropping `tx` rolls back the published rows.
            return Err(SyncError::internal(format!(
                "job {} is no longer running; results discarded",
                job.job_id
            )));
        }

        let (incremental_key, last_value) = match job.strategy {
            SyncStrategy::Incremental => (job.incremental_key.clone(), staged.last_value.or(seed)),
            _ => (None, None),
        };
        WatermarkStore::upsert_in(
            &mut *tx,
            &WatermarkUpdate {
                table_id: table.table_id,
                job_id: job.job_id,
                status: JobStatus::Completed,
                synced_at: completed_at,
                row_count: stats.row_count,
                size_bytes: stats.size_bytes,
                incremental_key,
                last_value,
            },
        )
        .await?;

        tx.commit()
            .await
            .map_err(|e| crate::db::map_sqlx_error("complete_job", e))?;
        Ok(job_stats)
    }

    /// Read the job's window into `staging`, one chunk at a time.
    async fn stage(
        &self,
        job: &SyncJob,
        table: &RegisteredTable,
        columns: &[DestinationColumn],
        staging: &str,
        seed: Option<&str>,
    ) -> SyncResult<Staged> {
        let mut staged = Staged {
            rows: 0,
            total_rows: 0,
            bytes: 0,
            last_value: None,
        };
        let mut page = Page::first(job.batch_size);
        let filter = job.filter_expression.as_deref();

        loop {
            let batch = self.fetch_page(job, table, page, seed, filter).await?;
            if page.offset == 0 {
                staged.total_rows = batch.total_rows;
            }
            if batch.is_empty() {
                break;
            }

            if let Some(key) = job.incremental_key.as_deref().filter(|_| job.strategy == SyncStrategy::Incremental) {
                let idx = batch.column_index(key).ok_or_else(|| {
                    SyncError::logical(format!("incremental key {key} is not a column of {}", table.qualified_name()))
                })?;
                for row in &batch.rows {
                    if let Some(value) = row.get(idx) {
                        advance(&mut staged.last_value, value);
                    }
                }
            }

            staged.bytes += self.destination.insert_batch(staging, columns, &batch).await?;
            staged.rows += batch.len() as u64;

            if batch.len() < job.batch_size as usize {
                break;
            }
            page = page.next();
        }

        Ok(staged)
    }

    async fn fetch_page(
        &self,
        job: &SyncJob,
        table: &RegisteredTable,
        page: Page,
        seed: Option<&str>,
        filter: Option<&str>,
    ) -> SyncResult<RowBatch> {
        let batch = match (job.strategy, job.incremental_key.as_deref()) {
            (SyncStrategy::Incremental, Some(key)) => {
                self.source
                    .fetch_incremental_data(&table.table_name, &table.schema_name, key, seed, page, filter)
                    .await?
            }
            _ => {
                self.source
                    .fetch_data(&table.table_name, &table.schema_name, page, filter)
                    .await?
            }
        };
        Ok(batch)
    }
}
