//! Telemetry: structured logging and Prometheus metrics.

pub mod logging;
pub mod metrics;

pub use logging::{init_logging, LogFormat, LoggingConfig};
pub use metrics::{init_metrics, record_http_request, MetricsConfig, MetricsRegistry};

/// Service name used in health reports and metric labels.
pub const SERVICE_NAME: &str = "uno-jobs";
