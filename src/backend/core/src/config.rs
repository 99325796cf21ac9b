//! Configuration management.
//!
//! Values come from an optional file and `UNO_JOBS__*` environment variables
//! (`UNO_JOBS__WORKERS__POLL_INTERVAL=250ms`). Durations use humantime
//! notation.

use serde::Deserialize;
use std::collections::BTreeMap;
use std::time::Duration;

use crate::error::{JobsError, Result};
use crate::jobs::job::validate_queue_name;
use crate::jobs::retry::BackoffStrategy;
use crate::jobs::storage::StorageRetry;
use crate::telemetry::logging::LoggingConfig;
use crate::telemetry::metrics::MetricsConfig;

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "UNO_JOBS";

/// Main application configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub workers: WorkersConfig,

    #[serde(default)]
    pub scheduler: SchedulerConfig,

    /// Backoff between automatic retries of failed jobs
    #[serde(default)]
    pub retry: BackoffStrategy,

    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub metrics: MetricsConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// HTTP server host
    #[serde(default = "default_host")]
    pub host: String,

    /// HTTP server port
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl ServerConfig {
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Which storage backend holds jobs.
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    Memory,
    Postgres,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: StorageBackend,

    /// PostgreSQL connection URL (postgres backend only)
    pub url: Option<String>,

    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    #[serde(default = "default_min_connections")]
    pub min_connections: u32,

    #[serde(default = "default_acquire_timeout", with = "humantime_serde")]
    pub acquire_timeout: Duration,

    /// Apply embedded migrations on connect
    #[serde(default = "default_true")]
    pub run_migrations: bool,

    /// Attempts for a storage operation before giving up
    #[serde(default = "default_operation_attempts")]
    pub operation_attempts: u32,

    /// Initial delay between attempts; doubles each time
    #[serde(default = "default_operation_backoff", with = "humantime_serde")]
    pub operation_backoff: Duration,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::default(),
            url: None,
            max_connections: default_max_connections(),
            min_connections: default_min_connections(),
            acquire_timeout: default_acquire_timeout(),
            run_migrations: true,
            operation_attempts: default_operation_attempts(),
            operation_backoff: default_operation_backoff(),
        }
    }
}

impl StorageConfig {
    pub fn retry(&self) -> StorageRetry {
        StorageRetry {
            attempts: self.operation_attempts,
            backoff: self.operation_backoff,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorkersConfig {
    /// Start worker pools at all
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Prefix for worker names
    #[serde(default = "default_worker_prefix")]
    pub name_prefix: String,

    /// Workers given to a queue not listed in `queues` when it first
    /// receives a job
    #[serde(default = "default_concurrency")]
    pub default_concurrency: usize,

    /// Workers per queue
    #[serde(default = "default_queues")]
    pub queues: BTreeMap<String, usize>,

    /// Sleep between empty claim attempts
    #[serde(default = "default_poll_interval", with = "humantime_serde")]
    pub poll_interval: Duration,

    /// Upper bound on a single claim round trip
    #[serde(default = "default_claim_timeout", with = "humantime_serde")]
    pub claim_timeout: Duration,

    /// How long a busy worker may go without finishing a job and still
    /// count as healthy (jobs without a timeout)
    #[serde(default = "default_liveness_window", with = "humantime_serde")]
    pub liveness_window: Duration,

    /// Grace period for in-flight jobs on shutdown
    #[serde(default = "default_shutdown_timeout", with = "humantime_serde")]
    pub shutdown_timeout: Duration,
}

impl Default for WorkersConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            name_prefix: default_worker_prefix(),
            default_concurrency: default_concurrency(),
            queues: default_queues(),
            poll_interval: default_poll_interval(),
            claim_timeout: default_claim_timeout(),
            liveness_window: default_liveness_window(),
            shutdown_timeout: default_shutdown_timeout(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Time between scans for due schedules
    #[serde(default = "default_tick_interval", with = "humantime_serde")]
    pub tick_interval: Duration,

    /// Consecutive failed ticks before the scheduler reports unhealthy
    #[serde(default = "default_max_consecutive_errors")]
    pub max_consecutive_errors: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            tick_interval: default_tick_interval(),
            max_consecutive_errors: default_max_consecutive_errors(),
        }
    }
}

// Default value functions
fn default_host() -> String { "0.0.0.0".to_string() }
fn default_port() -> u16 { 8080 }
fn default_true() -> bool { true }
fn default_max_connections() -> u32 { 20 }
fn default_min_connections() -> u32 { 2 }
fn default_acquire_timeout() -> Duration { Duration::from_secs(5) }
fn default_operation_attempts() -> u32 { 3 }
fn default_operation_backoff() -> Duration { Duration::from_millis(100) }
fn default_worker_prefix() -> String { "worker".to_string() }
fn default_concurrency() -> usize { 2 }
fn default_queues() -> BTreeMap<String, usize> { BTreeMap::from([("default".to_string(), 2)]) }
fn default_poll_interval() -> Duration { Duration::from_millis(500) }
fn default_claim_timeout() -> Duration { Duration::from_secs(5) }
fn default_liveness_window() -> Duration { Duration::from_secs(300) }
fn default_shutdown_timeout() -> Duration { Duration::from_secs(30) }
fn default_tick_interval() -> Duration { Duration::from_secs(1) }
fn default_max_consecutive_errors() -> u32 { 3 }

impl Config {
    /// Load configuration from the environment, plus `UNO_JOBS_CONFIG` if set.
    pub fn load() -> Result<Self> {
        match std::env::var(format!("{}_CONFIG", ENV_PREFIX)) {
            Ok(path) if !path.is_empty() => Self::from_file(&path),
            _ => {
                let config = config::Config::builder()
                    .add_source(environment())
                    .build()?;
                Self::finish(config.try_deserialize()?)
            }
        }
    }

    /// Load from a specific file path; environment variables still win.
    pub fn from_file(path: &str) -> Result<Self> {
        let config = config::Config::builder()
            .add_source(config::File::with_name(path))
            .add_source(environment())
            .build()?;
        Self::finish(config.try_deserialize()?)
    }

    fn finish(cfg: Config) -> Result<Self> {
        cfg.validate()?;
        Ok(cfg)
    }

    /// Reject settings the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.storage.backend == StorageBackend::Postgres
            && self.storage.url.as_deref().map_or(true, str::is_empty)
        {
            return Err(JobsError::configuration(
                "storage.url is required when storage.backend = postgres",
            ));
        }
        if self.storage.operation_attempts == 0 {
            return Err(JobsError::configuration("storage.operation_attempts must be at least 1"));
        }
        if self.storage.min_connections > self.storage.max_connections {
            return Err(JobsError::configuration(
                "storage.min_connections cannot exceed storage.max_connections",
            ));
        }
        if self.workers.default_concurrency == 0 {
            return Err(JobsError::configuration("workers.default_concurrency must be at least 1"));
        }
        for (name, &concurrency) in &self.workers.queues {
            validate_queue_name(name).map_err(|e| JobsError::configuration(e.message().to_string()))?;
            if concurrency == 0 {
                return Err(JobsError::configuration(format!("workers.queues.{} must be at least 1", name)));
            }
        }
        if self.workers.poll_interval.is_zero() {
            return Err(JobsError::configuration("workers.poll_interval must be greater than zero"));
        }
        if self.workers.claim_timeout.is_zero() {
            return Err(JobsError::configuration("workers.claim_timeout must be greater than zero"));
        }
        if self.scheduler.tick_interval.is_zero() {
            return Err(JobsError::configuration("scheduler.tick_interval must be greater than zero"));
        }
        match &self.retry {
            BackoffStrategy::Exponential { multiplier, .. }
            | BackoffStrategy::ExponentialWithJitter { multiplier, .. }
                if !multiplier.is_finite() || *multiplier < 1.0 =>
            {
                Err(JobsError::configuration("retry.multiplier must be at least 1.0"))
            }
            BackoffStrategy::ExponentialWithJitter { jitter_factor, .. }
                if !(0.0..=1.0).contains(jitter_factor) =>
            {
                Err(JobsError::configuration("retry.jitter_factor must be between 0 and 1"))
            }
            _ => Ok(()),
        }
    }
}

fn environment() -> config::Environment {
    config::Environment::with_prefix(ENV_PREFIX)
        .separator("__")
        .try_parsing(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.storage.backend, StorageBackend::Memory);
        assert_eq!(config.workers.queues.get("default"), Some(&2));
        assert_eq!(config.workers.poll_interval, Duration::from_millis(500));
        assert_eq!(config.scheduler.tick_interval, Duration::from_secs(1));
        assert_eq!(config.retry, BackoffStrategy::Fixed);
        config.validate().unwrap();
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[server]
port = 9100

[workers]
poll_interval = "250ms"

[workers.queues]
default = 4
emails = 1

[scheduler]
tick_interval = "5s"

[retry]
strategy = "exponential"
multiplier = 2.0
max_delay = "10m"
"#
        )
        .unwrap();

        let config = Config::from_file(file.path().to_str().unwrap()).unwrap();
        assert_eq!(config.server.port, 9100);
        assert_eq!(config.workers.poll_interval, Duration::from_millis(250));
        assert_eq!(config.workers.queues.get("emails"), Some(&1));
        assert_eq!(config.scheduler.tick_interval, Duration::from_secs(5));
        assert_eq!(
            config.retry,
            BackoffStrategy::Exponential {
                multiplier: 2.0,
                max_delay: Duration::from_secs(600),
            }
        );
    }

    #[test]
    fn test_postgres_requires_url() {
        let mut config = Config::default();
        config.storage.backend = StorageBackend::Postgres;
        let err = config.validate().unwrap_err();
        assert_eq!(err.code(), crate::error::ErrorCode::Configuration);

        config.storage.url = Some("postgres://localhost/uno".into());
        config.validate().unwrap();
    }

    #[test]
    fn test_invalid_queue_name_rejected() {
        let mut config = Config::default();
        config.workers.queues.insert("bad queue".into(), 1);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_concurrency_rejected() {
        let mut config = Config::default();
        config.workers.queues.insert("emails".into(), 0);
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.workers.default_concurrency = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_bad_multiplier_rejected() {
        let config = Config {
            retry: BackoffStrategy::Exponential {
                multiplier: 0.5,
                max_delay: Duration::from_secs(60),
            },
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
