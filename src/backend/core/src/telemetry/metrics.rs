//! Prometheus metrics.
//!
//! Engine components record through the `metrics` facade (see
//! [`crate::jobs::monitoring::JobMetrics`]); this module installs the
//! Prometheus recorder and renders its text exposition.
//!
//! ```rust,no_run
//! use uno_jobs::telemetry::metrics::{init_metrics, MetricsConfig};
//!
//! let registry = init_metrics(&MetricsConfig::default(), "uno-jobs").unwrap();
//! println!("{}", registry.render());
//! ```

use metrics::{counter, describe_counter, describe_histogram, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Install the Prometheus recorder
    pub enabled: bool,

    /// Buckets for job run time and queue wait, in seconds
    pub job_buckets: Vec<f64>,

    /// Buckets for admin API latency, in seconds
    pub http_buckets: Vec<f64>,

    /// Labels added to every series
    pub global_labels: BTreeMap<String, String>,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            job_buckets: vec![0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 15.0, 60.0, 300.0, 900.0, 3600.0],
            http_buckets: vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5],
            global_labels: BTreeMap::new(),
        }
    }
}

const COUNTERS: &[(&str, &str)] = &[
    ("uno_jobs_enqueued_total", "Jobs accepted into a queue"),
    ("uno_jobs_started_total", "Job attempts started by a worker"),
    ("uno_jobs_finished_total", "Job attempts finished, by outcome"),
    ("uno_jobs_timeouts_total", "Job attempts that exceeded their timeout"),
    ("uno_jobs_cancelled_total", "Jobs cancelled before running"),
    ("uno_jobs_schedule_firings_total", "Jobs enqueued by schedules"),
    ("uno_jobs_schedule_errors_total", "Schedule firings that failed"),
    ("uno_jobs_storage_errors_total", "Storage operations that failed after retries"),
    ("uno_jobs_errors_total", "Errors raised, by code"),
    ("http_requests_total", "Admin API requests"),
];

const HISTOGRAMS: &[(&str, &str)] = &[
    ("uno_jobs_run_duration_seconds", "Handler execution time"),
    ("uno_jobs_queue_wait_seconds", "Time from eligible to claimed"),
    ("http_request_duration_seconds", "Admin API request latency"),
];

/// Handle to the installed recorder. Cheap to clone.
#[derive(Clone, Default)]
pub struct MetricsRegistry {
    handle: Option<PrometheusHandle>,
}

impl std::fmt::Debug for MetricsRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsRegistry")
            .field("enabled", &self.handle.is_some())
            .finish()
    }
}

impl MetricsRegistry {
    /// No exporter; `render` returns an empty string.
    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn is_enabled(&self) -> bool {
        self.handle.is_some()
    }

    /// Prometheus text exposition.
    pub fn render(&self) -> String {
        self.handle.as_ref().map(PrometheusHandle::render).unwrap_or_default()
    }
}

/// Install the Prometheus recorder, labelling every series with `service`.
///
/// Fails on empty bucket lists or when a recorder is already installed in
/// this process.
pub fn init_metrics(config: &MetricsConfig, service: &str) -> anyhow::Result<MetricsRegistry> {
    if !config.enabled {
        return Ok(MetricsRegistry::disabled());
    }

    let builder = config
        .global_labels
        .iter()
        .fold(PrometheusBuilder::new().add_global_label("service", service), |b, (k, v)| {
            b.add_global_label(k, v)
        })
        .set_buckets_for_metric(Matcher::Prefix("uno_jobs_".to_string()), &config.job_buckets)?
        .set_buckets_for_metric(Matcher::Prefix("http_".to_string()), &config.http_buckets)?;
    let handle = builder.install_recorder()?;

    for &(name, help) in COUNTERS {
        describe_counter!(name, help);
    }
    for &(name, help) in HISTOGRAMS {
        describe_histogram!(name, help);
    }

    tracing::info!(service, "Prometheus recorder installed");
    Ok(MetricsRegistry { handle: Some(handle) })
}

/// Count one admin API request and its latency, labelled by route template.
pub fn record_http_request(method: &str, route: &str, status: u16, took: Duration) {
    let labels = [
        ("method", method.to_string()),
        ("path", route.to_string()),
        ("status", status.to_string()),
    ];
    histogram!("http_request_duration_seconds", &labels).record(took.as_secs_f64());
    counter!("http_requests_total", &labels).increment(1);
}
