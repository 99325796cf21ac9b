//! Structured logging.
//!
//! One `tracing-subscriber` registry: an `EnvFilter` built from the configured
//! level and per-target directives, and a single fmt layer in the chosen
//! format. `RUST_LOG`, when set, replaces the configured filter entirely.

use serde::Deserialize;
use std::collections::BTreeMap;
use tracing::Subscriber;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    registry::LookupSpan,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Base level, or any `EnvFilter` directive string
    pub level: String,

    pub format: LogFormat,

    /// Per-target levels, e.g. `sqlx = "warn"`, `uno_jobs::jobs::scheduler = "debug"`
    pub targets: BTreeMap<String, String>,

    /// Emit file and line for every event
    pub source_location: bool,

    pub thread_info: bool,

    /// Log each closed `job` span with its busy and idle time
    pub job_timings: bool,

    /// Honor `RUST_LOG` over the configured filter
    pub respect_rust_log: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::default(),
            targets: BTreeMap::new(),
            source_location: false,
            thread_info: false,
            job_timings: false,
            respect_rust_log: true,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// One JSON object per line
    #[default]
    Json,
    Pretty,
    Compact,
}

/// The filter the subscriber will use, before any `RUST_LOG` override.
pub fn build_filter(config: &LoggingConfig) -> anyhow::Result<EnvFilter> {
    config
        .targets
        .iter()
        .try_fold(EnvFilter::try_new(&config.level)?, |filter, (target, level)| -> anyhow::Result<EnvFilter> {
            Ok(filter.add_directive(format!("{target}={level}").parse()?))
        })
}

fn fmt_layer<S>(config: &LoggingConfig) -> Box<dyn Layer<S> + Send + Sync>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    let spans = if config.job_timings {
        FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    };
    let layer = fmt::layer()
        .with_span_events(spans)
        .with_file(config.source_location)
        .with_line_number(config.source_location)
        .with_thread_ids(config.thread_info)
        .with_thread_names(config.thread_info);

    match config.format {
        LogFormat::Json => layer.json().flatten_event(true).boxed(),
        LogFormat::Pretty => layer.pretty().boxed(),
        LogFormat::Compact => layer.compact().boxed(),
    }
}

/// Install the global subscriber.
///
/// Fails on a malformed filter or when a subscriber is already installed.
pub fn init_logging(config: &LoggingConfig) -> anyhow::Result<()> {
    let filter = match std::env::var("RUST_LOG") {
        Ok(directives) if config.respect_rust_log && !directives.is_empty() => EnvFilter::try_new(directives)?,
        _ => build_filter(config)?,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer(config))
        .try_init()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_target_directives_are_appended() {
        let mut config = LoggingConfig::default();
        config.targets.insert("sqlx".into(), "warn".into());
        config.targets.insert("uno_jobs::jobs::scheduler".into(), "debug".into());
        let rendered = build_filter(&config).unwrap().to_string();
        assert!(rendered.contains("sqlx=warn"));
        assert!(rendered.contains("uno_jobs::jobs::scheduler=debug"));
    }

    #[test]
    fn test_malformed_target_level_fails() {
        let mut config = LoggingConfig::default();
        config.targets.insert("sqlx".into(), "loud".into());
        assert!(build_filter(&config).is_err());
    }

    #[test]
    fn test_partial_section_keeps_defaults() {
        let config: LoggingConfig = serde_json::from_str(r#"{"format": "compact"}"#).unwrap();
        assert_eq!(config.format, LogFormat::Compact);
        assert_eq!(config.level, "info");
        assert!(config.respect_rust_log);
    }
}
