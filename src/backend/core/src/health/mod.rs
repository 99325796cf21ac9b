//! Engine health checks.
//!
//! Each component gets a [`HealthChecker`]; [`HealthService`] runs them
//! concurrently, each bounded by a timeout, and folds the results into one
//! [`HealthReport`].

mod check;
mod checker;

pub use check::*;
pub use checker::*;

use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy)]
pub struct HealthConfig {
    /// Timeout for individual health checks
    pub check_timeout: Duration,
    /// Checks slower than this report degraded
    pub latency_threshold: Duration,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            check_timeout: Duration::from_secs(5),
            latency_threshold: Duration::from_millis(500),
        }
    }
}

pub struct HealthService {
    service: String,
    config: HealthConfig,
    checkers: Vec<Arc<dyn HealthChecker>>,
    started_at: Instant,
}

impl HealthService {
    pub fn new(service: impl Into<String>, config: HealthConfig) -> Self {
        Self {
            service: service.into(),
            config,
            checkers: Vec::new(),
            started_at: Instant::now(),
        }
    }

    pub fn register_checker(&mut self, checker: Arc<dyn HealthChecker>) {
        self.checkers.push(checker);
    }

    pub async fn check_health(&self) -> HealthReport {
        let HealthConfig {
            check_timeout,
            latency_threshold,
        } = self.config;
        let checks = self.checkers.iter().map(|checker| async move {
            match tokio::time::timeout(check_timeout, checker.check()).await {
                Ok(mut health) => {
                    health.apply_latency_threshold(latency_threshold);
                    health
                }
                Err(_) => ComponentHealth::down(checker.name(), format!("check timed out after {:?}", check_timeout)),
            }
        });
        let components = futures::future::join_all(checks).await;

        HealthReport::assemble(&self.service, self.uptime(), components)
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct Slow;

    #[async_trait]
    impl HealthChecker for Slow {
        fn name(&self) -> &str {
            "slow"
        }

        async fn check(&self) -> ComponentHealth {
            tokio::time::sleep(Duration::from_secs(10)).await;
            ComponentHealth::up("slow")
        }
    }

    #[tokio::test]
    async fn test_check_timeout_is_unhealthy() {
        let mut service = HealthService::new(
            "uno-jobs",
            HealthConfig {
                check_timeout: Duration::from_millis(20),
                ..Default::default()
            },
        );
        service.register_checker(Arc::new(Slow));
        let report = service.check_health().await;
        assert_eq!(report.status, HealthStatus::Unhealthy);
        assert!(report.components[0].message.as_deref().unwrap().contains("timed out"));
    }
}
