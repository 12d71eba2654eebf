//! Stale-job reaper.
//!
//! Two independent passes:
//!
//! - **staleness**: jobs `running` for longer than `stale_after` are failed
//!   with "job timed out" and their watermark records the failure;
//! - **retention**: terminal jobs older than their keep window are deleted,
//!   except the job each watermark points at.
//!
//! Both passes are conditional updates/deletes and can run concurrently with
//! each other, with workers and with other reapers.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::SqlitePool;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, instrument, warn};

use tablesync_core::{JobStatus, SyncResult};

use crate::db::{begin_write, map_sqlx_error};
use crate::destination::DestinationStore;
use crate::jobs::store::{FailGuard, SyncJobStore};
use crate::watermark::WatermarkStore;

/// Error recorded on jobs failed by the staleness pass.
pub const TIMED_OUT: &str = "job timed out";

#[derive(Debug, Clone)]
pub struct ReaperConfig {
    /// Running jobs started longer ago than this are failed.
    pub stale_after: Duration,
    pub stale_interval: Duration,
    pub keep_completed: Duration,
    pub keep_failed: Duration,
    pub retention_interval: Duration,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            stale_after: Duration::from_secs(60 * 60),
            stale_interval: Duration::from_secs(5 * 60),
            keep_completed: Duration::from_secs(24 * 60 * 60),
            keep_failed: Duration::from_secs(72 * 60 * 60),
            retention_interval: Duration::from_secs(60 * 60),
        }
    }
}

impl ReaperConfig {
    pub fn with_stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = stale_after;
        self
    }

    pub fn with_stale_interval(mut self, interval: Duration) -> Self {
        self.stale_interval = interval;
        self
    }

    pub fn with_keep_completed(mut self, keep: Duration) -> Self {
        self.keep_completed = keep;
        self
    }

    pub fn with_keep_failed(mut self, keep: Duration) -> Self {
        self.keep_failed = keep;
        self
    }

    pub fn with_retention_interval(mut self, interval: Duration) -> Self {
        self.retention_interval = interval;
        self
    }
}

/// Jobs deleted by one retention pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RetentionReport {
    pub completed: u64,
    pub failed: u64,
}

#[derive(Debug, Clone)]
pub struct Reaper {
    pool: SqlitePool,
    jobs: SyncJobStore,
    destination: DestinationStore,
    config: ReaperConfig,
}

fn before(now: DateTime<Utc>, age: Duration) -> DateTime<Utc> {
    now - chrono::Duration::from_std(age).unwrap_or_else(|_| chrono::Duration::zero())
}

impl Reaper {
    pub fn new(pool: SqlitePool, config: ReaperConfig) -> Self {
        Self {
            jobs: SyncJobStore::new(pool.clone()),
            destination: DestinationStore::new(pool.clone()),
            pool,
            config,
        }
    }

    pub fn config(&self) -> &ReaperConfig {
        &self.config
    }

    /// Fail jobs that have been running since before `now - stale_after`.
    /// Returns the number of jobs this call failed.
    #[instrument(skip(self), err)]
    pub async fn sweep_stale(&self, now: DateTime<Utc>) -> SyncResult<u64> {
        let cutoff = before(now, self.config.stale_after);
        let mut reaped = 0;

        for job in self.jobs.running_since_before(cutoff).await? {
            let mut tx = begin_write(&self.pool, "reap_job").await?;

            let failed = SyncJobStore::fail_in(
                &mut *tx,
                job.job_id,
                FailGuard::StartedBefore(cutoff),
                TIMED_OUT,
                now,
            )
            .await?;
            if !failed {
                debug!(job_id = %job.job_id, "job finished before it could be reaped");
                continue;
            }
            WatermarkStore::record_failure_in(&mut *tx, job.table_id, job.job_id, TIMED_OUT, now)
                .await?;
            tx.commit()
                .await
                .map_err(|e| map_sqlx_error("reap_job", e))?;

            if let Err(err) = self.destination.drop_staging(job.job_id).await {
                warn!(job_id = %job.job_id, error = %err, "failed to drop staging table of reaped job");
            }

            warn!(
                job_id = %job.job_id,
                table_id = %job.table_id,
                started_at = ?job.started_at,
                "stale job failed"
            );
            reaped += 1;
        }

        Ok(reaped)
    }

    /// Delete terminal jobs past their keep window.
    #[instrument(skip(self), err)]
    pub async fn sweep_retention(&self, now: DateTime<Utc>) -> SyncResult<RetentionReport> {
        let report = RetentionReport {
            completed: self
                .jobs
                .delete_finished_before(JobStatus::Completed, before(now, self.config.keep_completed))
                .await?,
            failed: self
                .jobs
                .delete_finished_before(JobStatus::Failed, before(now, self.config.keep_failed))
                .await?,
        };

        if report != RetentionReport::default() {
            info!(completed = report.completed, failed = report.failed, "purged old jobs");
        }
        Ok(report)
    }

    /// Run both passes on their intervals until shut down.
    pub fn spawn(self) -> ReaperHandle {
        let (shutdown_tx, mut shutdown) = watch::channel(false);

        let join = tokio::spawn(async move {
            let mut stale = tokio::time::interval(self.config.stale_interval);
            stale.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut retention = tokio::time::interval(self.config.retention_interval);
            retention.set_missed_tick_behavior(MissedTickBehavior::Delay);

            info!(
                stale_after_secs = self.config.stale_after.as_secs(),
                "reaper started"
            );
            loop {
                tokio::select! {
                    _ = stale.tick() => {
                        if let Err(err) = self.sweep_stale(Utc::now()).await {
                            error!(error = %err, "staleness sweep failed");
                        }
                    }
                    _ = retention.tick() => {
                        if let Err(err) = self.sweep_retention(Utc::now()).await {
                            error!(error = %err, "retention sweep failed");
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }
            info!("reaper stopped");
        });

        ReaperHandle {
            shutdown: shutdown_tx,
            join,
        }
    }
}

#[derive(Debug)]
pub struct ReaperHandle {
    shutdown: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl ReaperHandle {
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(err) = self.join.await {
            error!(error = %err, "reaper task panicked");
        }
    }
}
