//! Health report types.
//!
//! A component is `healthy`, `degraded` (still serving, e.g. slow storage or
//! some wedged workers) or `unhealthy`. The engine is as healthy as its worst
//! component, and counts as up while nothing is unhealthy.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    #[default]
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    pub fn is_up(self) -> bool {
        self != Self::Unhealthy
    }
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Unhealthy => "unhealthy",
        })
    }
}

/// Result of one component check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub name: String,
    pub status: HealthStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub details: BTreeMap<String, serde_json::Value>,
}

impl ComponentHealth {
    fn with_status(name: &str, status: HealthStatus, message: Option<String>) -> Self {
        Self {
            name: name.to_string(),
            status,
            message,
            latency_ms: None,
            details: BTreeMap::new(),
        }
    }

    pub fn up(name: &str) -> Self {
        Self::with_status(name, HealthStatus::Healthy, None)
    }

    pub fn degraded(name: &str, message: impl Into<String>) -> Self {
        Self::with_status(name, HealthStatus::Degraded, Some(message.into()))
    }

    pub fn down(name: &str, message: impl Into<String>) -> Self {
        Self::with_status(name, HealthStatus::Unhealthy, Some(message.into()))
    }

    /// Up or down depending on a probe's outcome, with its latency.
    pub fn probe<E: std::fmt::Display>(name: &str, outcome: Result<(), E>, took: Duration) -> Self {
        let health = match outcome {
            Ok(()) => Self::up(name),
            Err(e) => Self::down(name, e.to_string()),
        };
        Self {
            latency_ms: Some(took.as_millis() as u64),
            ..health
        }
    }

    /// Attach a serializable detail; values that fail to serialize are dropped.
    pub fn detail(mut self, key: &str, value: impl Serialize) -> Self {
        if let Ok(value) = serde_json::to_value(value) {
            self.details.insert(key.to_string(), value);
        }
        self
    }

    /// A healthy component whose check exceeded `threshold` becomes degraded.
    pub(crate) fn apply_latency_threshold(&mut self, threshold: Duration) {
        let limit = threshold.as_millis() as u64;
        match self.latency_ms {
            Some(ms) if ms > limit && self.status == HealthStatus::Healthy => {
                self.status = HealthStatus::Degraded;
                self.message = Some(format!("slow check: {}ms over {}ms", ms, limit));
            }
            _ => {}
        }
    }
}

/// Engine-wide report served at `/jobs/health`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub healthy: bool,
    pub service: String,
    pub version: String,
    pub checked_at: DateTime<Utc>,
    pub uptime_secs: u64,
    pub components: Vec<ComponentHealth>,
}

impl HealthReport {
    pub fn assemble(service: &str, uptime: Duration, components: Vec<ComponentHealth>) -> Self {
        let status = components.iter().map(|c| c.status).max().unwrap_or_default();
        Self {
            status,
            healthy: status.is_up(),
            service: service.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            checked_at: Utc::now(),
            uptime_secs: uptime.as_secs(),
            components,
        }
    }

    pub fn component(&self, name: &str) -> Option<&ComponentHealth> {
        self.components.iter().find(|c| c.name == name)
    }
}
