//! Worker pool that drives the sync engine.
//!
//! Each worker is a tokio task that claims jobs and hands them to
//! [`SyncEngine::run_claimed`] back to back, sleeping for the poll interval
//! when nothing is due. The claim query guarantees one running job per table, so any
//! number of workers can share an engine.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use tablesync_core::{JobId, SyncResult};

use crate::engine::{RunOutcome, SyncEngine};

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Number of concurrent workers.
    pub workers: usize,
    /// Sleep between polls when no job is due.
    pub poll_interval: Duration,
    /// Name for logging.
    pub name: String,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            poll_interval: Duration::from_millis(500),
            name: "sync-worker".to_string(),
        }
    }
}

impl WorkerConfig {
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

/// Pool runtime statistics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct WorkerStats {
    pub jobs_processed: u64,
    pub jobs_completed: u64,
    pub jobs_retried: u64,
    pub jobs_failed: u64,
    pub jobs_abandoned: u64,
    pub current_running: usize,
    pub uptime_secs: u64,
}

impl WorkerStats {
    fn record(&mut self, outcome: &RunOutcome) {
        self.jobs_processed += 1;
        match outcome {
            RunOutcome::Completed { .. } => self.jobs_completed += 1,
            RunOutcome::Retrying { .. } => self.jobs_retried += 1,
            RunOutcome::Failed { .. } => self.jobs_failed += 1,
            RunOutcome::Abandoned => self.jobs_abandoned += 1,
        }
    }
}

/// Handle to a running pool.
#[derive(Debug)]
pub struct WorkerPoolHandle {
    shutdown: watch::Sender<bool>,
    joins: Vec<JoinHandle<()>>,
    stats: Arc<Mutex<WorkerStats>>,
    started: Instant,
}

impl WorkerPoolHandle {
    /// Stop polling and wait for in-flight jobs to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for join in self.joins {
            if let Err(err) = join.await {
                error!(error = %err, "worker task panicked");
            }
        }
    }

    pub fn stats(&self) -> WorkerStats {
        let mut stats = self
            .stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        stats.uptime_secs = self.started.elapsed().as_secs();
        stats
    }
}

pub struct WorkerPool;

impl WorkerPool {
    /// Spawn `config.workers` tasks on the current runtime.
    pub fn spawn(engine: Arc<SyncEngine>, config: WorkerConfig) -> WorkerPoolHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let stats = Arc::new(Mutex::new(WorkerStats::default()));

        let joins = (0..config.workers.max(1))
            .map(|index| {
                let engine = engine.clone();
                let config = config.clone();
                let shutdown = shutdown_rx.clone();
                let stats = stats.clone();
                tokio::spawn(async move { worker_loop(index, engine, config, shutdown, stats).await })
            })
            .collect();

        info!(pool = %config.name, workers = config.workers, "worker pool started");
        WorkerPoolHandle {
            shutdown: shutdown_tx,
            joins,
            stats,
            started: Instant::now(),
        }
    }
}

async fn worker_loop(
    index: usize,
    engine: Arc<SyncEngine>,
    config: WorkerConfig,
    mut shutdown: watch::Receiver<bool>,
    stats: Arc<Mutex<WorkerStats>>,
) {
    debug!(pool = %config.name, worker = index, "worker started");

    loop {
        let stopping = *shutdown.borrow();
        if stopping {
            break;
        }
        match engine.jobs().claim_next(chrono::Utc::now()).await {
            Ok(Some(job)) => {
                update(&stats, |s| s.current_running += 1);
                let result = engine.run_claimed(&job).await;
                update(&stats, |s| {
                    s.current_running = s.current_running.saturating_sub(1);
                    if let Ok(outcome) = &result {
                        s.record(outcome);
                    }
                });
                if let Err(err) = result {
                    error!(pool = %config.name, worker = index, job_id = %job.job_id, error = %err, "failed to record job outcome");
                }
                continue;
            }
            Ok(None) => {}
            Err(err) => {
                error!(pool = %config.name, worker = index, error = %err, "failed to claim job");
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(config.poll_interval) => {}
            _ = shutdown.changed() => {}
        }
    }

    debug!(pool = %config.name, worker = index, "worker stopped");
}

fn update(stats: &Mutex<WorkerStats>, f: impl FnOnce(&mut WorkerStats)) {
    f(&mut stats.lock().unwrap_or_else(PoisonError::into_inner));
}

/// Run due jobs on the calling task until none is left.
pub async fn drain(engine: &SyncEngine) -> SyncResult<Vec<(JobId, RunOutcome)>> {
    let mut outcomes = Vec::new();
    while let Some(outcome) = engine.run_next().await? {
        outcomes.push(outcome);
    }
    Ok(outcomes)
}

#[cfg(test)]
mod tests {
    use super::*;

    use tablesync_core::{SourceColumn, SyncRequest};

    use crate::db;
    use crate::engine::EngineConfig;
    use crate::source::MemorySource;

    #[tokio::test]
    async fn pool_runs_queued_jobs_and_shuts_down() {
        let pool = db::connect_in_memory().await.unwrap();
        db::migrate(&pool).await.unwrap();

        let source = MemorySource::arc();
        for table in ["orders", "customers"] {
            source.add_table(
                "sales",
                table,
                vec![SourceColumn::new("ID", "NUMBER")],
                vec![vec![serde_json::json!(1)], vec![serde_json::json!(2)]],
            );
        }
        let engine = Arc::new(SyncEngine::new(pool, source.clone(), EngineConfig::default()));
        for table in ["orders", "customers"] {
            engine.register_table(table, "sales").await.unwrap();
            engine.start_sync(SyncRequest::full(table, "sales")).await.unwrap();
        }

        let handle = WorkerPool::spawn(
            engine.clone(),
            WorkerConfig::default()
                .with_workers(2)
                .with_poll_interval(Duration::from_millis(10)),
        );

        let deadline = Instant::now() + Duration::from_secs(5);
        while handle.stats().jobs_completed < 2 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let stats = handle.stats();
        handle.shutdown().await;

        assert_eq!(stats.jobs_completed, 2);
        assert_eq!(stats.jobs_failed, 0);
        assert_eq!(engine.job_counts().await.unwrap().completed, 2);
    }

    #[test]
    fn config_builders() {
        let config = WorkerConfig::default()
            .with_workers(0)
            .with_name("test")
            .with_poll_interval(Duration::from_secs(1));
        assert_eq!(config.workers, 1);
        assert_eq!(config.name, "test");
        assert_eq!(config.poll_interval, Duration::from_secs(1));
    }
}
