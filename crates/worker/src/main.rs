use std::sync::Arc;

use anyhow::Context;

use tablesync_infra::jobs::WorkerPool;
use tablesync_infra::source::SnowflakeClient;
use tablesync_infra::{db, AppConfig, Reaper, SyncEngine};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tablesync_observability::init();

    let config = AppConfig::from_env().context("invalid configuration")?;

    let pool = db::connect(&config.database_url)
        .await
        .with_context(|| format!("failed to open {}", config.database_url))?;
    db::migrate(&pool).await.context("failed to migrate local store")?;

    let snowflake = config
        .snowflake
        .client_config()
        .context("snowflake credentials")?;
    let source = Arc::new(SnowflakeClient::new(snowflake).context("failed to build snowflake client")?);

    let engine = Arc::new(SyncEngine::new(pool.clone(), source, config.engine.clone()));
    let workers = WorkerPool::spawn(engine, config.workers.clone());
    let reaper = Reaper::new(pool.clone(), config.reaper.clone()).spawn();

    tracing::info!(database = %config.database_url, "tablesync worker running");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    tracing::info!("shutdown requested");

    workers.shutdown().await;
    reaper.shutdown().await;
    pool.close().await;

    tracing::info!("tablesync worker stopped");
    Ok(())
}
