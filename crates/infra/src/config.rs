//! Environment configuration for the worker process.

use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use tablesync_core::RetryPolicy;

use crate::engine::EngineConfig;
use crate::jobs::worker::WorkerConfig;
use crate::reaper::ReaperConfig;
use crate::source::SnowflakeConfig;

pub const DEFAULT_DATABASE_URL: &str = "sqlite://data/tablesync.db";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(String),
    #[error("invalid value for {key}: {value:?}")]
    Invalid { key: String, value: String },
}

/// Snowflake settings as read from the environment; the account URL and
/// token are only required when a client is built.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SnowflakeSettings {
    pub account_url: Option<String>,
    pub token: Option<String>,
    pub token_type: String,
    pub warehouse: Option<String>,
    pub database: Option<String>,
    pub role: Option<String>,
    pub statement_timeout: Duration,
}

impl SnowflakeSettings {
    pub fn client_config(&self) -> Result<SnowflakeConfig, ConfigError> {
        let account_url = self
            .account_url
            .clone()
            .ok_or_else(|| ConfigError::Missing("SNOWFLAKE_ACCOUNT_URL".to_string()))?;
        let token = self
            .token
            .clone()
            .ok_or_else(|| ConfigError::Missing("SNOWFLAKE_TOKEN".to_string()))?;

        let mut config = SnowflakeConfig::new(account_url, token)
            .with_token_type(self.token_type.clone())
            .with_statement_timeout(self.statement_timeout);
        if let Some(warehouse) = &self.warehouse {
            config = config.with_warehouse(warehouse.clone());
        }
        if let Some(database) = &self.database {
            config = config.with_database(database.clone());
        }
        if let Some(role) = &self.role {
            config = config.with_role(role.clone());
        }
        Ok(config)
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database_url: String,
    pub snowflake: SnowflakeSettings,
    pub engine: EngineConfig,
    pub workers: WorkerConfig,
    pub reaper: ReaperConfig,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env(&lookup);

        let retry = RetryPolicy::exponential(
            env.parse("TABLESYNC_MAX_ATTEMPTS", 3u32)?,
            Duration::from_millis(env.parse("TABLESYNC_RETRY_BASE_MS", 1_000u64)?),
            Duration::from_millis(env.parse("TABLESYNC_RETRY_MAX_MS", 60_000u64)?),
        )
        .with_jitter(env.parse("TABLESYNC_RETRY_JITTER", 0.2f64)?);

        let batch_size: u32 = env.parse("TABLESYNC_BATCH_SIZE", tablesync_core::DEFAULT_BATCH_SIZE)?;
        if batch_size == 0 {
            return Err(env.invalid("TABLESYNC_BATCH_SIZE"));
        }

        let workers: usize = env.parse("TABLESYNC_WORKERS", 4)?;
        if workers == 0 {
            return Err(env.invalid("TABLESYNC_WORKERS"));
        }

        Ok(Self {
            database_url: env
                .get("TABLESYNC_DATABASE_URL")
                .unwrap_or_else(|| DEFAULT_DATABASE_URL.to_string()),
            snowflake: SnowflakeSettings {
                account_url: env.get("SNOWFLAKE_ACCOUNT_URL"),
                token: env.get("SNOWFLAKE_TOKEN"),
                token_type: env
                    .get("SNOWFLAKE_TOKEN_TYPE")
                    .unwrap_or_else(|| "OAUTH".to_string()),
                warehouse: env.get("SNOWFLAKE_WAREHOUSE"),
                database: env.get("SNOWFLAKE_DATABASE"),
                role: env.get("SNOWFLAKE_ROLE"),
                statement_timeout: Duration::from_secs(
                    env.parse("SNOWFLAKE_STATEMENT_TIMEOUT_SECS", 300u64)?,
                ),
            },
            engine: EngineConfig::default()
                .with_batch_size(batch_size)
                .with_retry(retry),
            workers: WorkerConfig::default()
                .with_workers(workers)
                .with_poll_interval(Duration::from_millis(
                    env.parse("TABLESYNC_POLL_INTERVAL_MS", 500u64)?,
                )),
            reaper: ReaperConfig::default()
                .with_stale_after(secs(env.parse("TABLESYNC_STALE_AFTER_SECS", 3_600)?))
                .with_stale_interval(secs(env.parse("TABLESYNC_STALE_SWEEP_SECS", 300)?))
                .with_keep_completed(secs(env.parse::<u64>("TABLESYNC_KEEP_COMPLETED_HOURS", 24)? * 3_600))
                .with_keep_failed(secs(env.parse::<u64>("TABLESYNC_KEEP_FAILED_HOURS", 72)? * 3_600))
                .with_retention_interval(secs(env.parse("TABLESYNC_RETENTION_SWEEP_SECS", 3_600)?)),
        })
    }
}

fn secs(n: u64) -> Duration {
    Duration::from_secs(n)
}

struct Env<'a, F>(&'a F);

impl<F> Env<'_, F>
where
    F: Fn(&str) -> Option<String>,
{
    /// Unset and blank values both read as absent.
    fn get(&self, key: &str) -> Option<String> {
        (self.0)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn parse<T: FromStr>(&self, key: &str, default: T) -> Result<T, ConfigError> {
        match self.get(key) {
            None => Ok(default),
            Some(raw) => raw.parse().map_err(|_| ConfigError::Invalid {
                key: key.to_string(),
                value: raw,
            }),
        }
    }

    fn invalid(&self, key: &str) -> ConfigError {
        ConfigError::Invalid {
            key: key.to_string(),
            value: self.get(key).unwrap_or_default(),
        }
    }
}
