//! Health checkers for the engine components.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Instant;

use super::check::ComponentHealth;
use crate::jobs::scheduler::Scheduler;
use crate::jobs::storage::JobStorage;
use crate::jobs::worker::WorkerPool;

#[async_trait]
pub trait HealthChecker: Send + Sync {
    fn name(&self) -> &str;

    async fn check(&self) -> ComponentHealth;
}

/// Pings the job store.
pub struct StorageHealthChecker {
    storage: Arc<dyn JobStorage>,
}

impl StorageHealthChecker {
    pub fn new(storage: Arc<dyn JobStorage>) -> Self {
        Self { storage }
    }
}

#[async_trait]
impl HealthChecker for StorageHealthChecker {
    fn name(&self) -> &str {
        "storage"
    }

    async fn check(&self) -> ComponentHealth {
        let start = Instant::now();
        let result = self.storage.ping().await;
        ComponentHealth::probe(self.name(), result, start.elapsed()).detail("backend", self.storage.backend_name())
    }
}

/// Degraded when some workers are wedged, unhealthy when all are.
pub struct WorkerPoolHealthChecker {
    pool: Arc<WorkerPool>,
}

impl WorkerPoolHealthChecker {
    pub fn new(pool: Arc<WorkerPool>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl HealthChecker for WorkerPoolHealthChecker {
    fn name(&self) -> &str {
        "workers"
    }

    async fn check(&self) -> ComponentHealth {
        let workers = self.pool.workers();
        let unhealthy: Vec<&str> = workers
            .iter()
            .filter(|w| !w.healthy)
            .map(|w| w.name.as_str())
            .collect();

        let health = if workers.is_empty() {
            ComponentHealth::degraded(self.name(), "no workers running")
        } else if unhealthy.is_empty() {
            ComponentHealth::up(self.name())
        } else if unhealthy.len() == workers.len() {
            ComponentHealth::down(self.name(), "every worker is past its liveness window")
        } else {
            ComponentHealth::degraded(
                self.name(),
                format!("{} of {} workers past their liveness window", unhealthy.len(), workers.len()),
            )
        };
        health
            .detail("workers", workers.len())
            .detail("unhealthy_workers", &unhealthy)
    }
}

pub struct SchedulerHealthChecker {
    scheduler: Arc<Scheduler>,
}

impl SchedulerHealthChecker {
    pub fn new(scheduler: Arc<Scheduler>) -> Self {
        Self { scheduler }
    }
}

#[async_trait]
impl HealthChecker for SchedulerHealthChecker {
    fn name(&self) -> &str {
        "scheduler"
    }

    async fn check(&self) -> ComponentHealth {
        let status = self.scheduler.status();
        let health = if status.healthy {
            ComponentHealth::up(self.name())
        } else if !status.running {
            ComponentHealth::down(self.name(), "tick loop not running")
        } else if status.consecutive_errors > 0 {
            ComponentHealth::down(self.name(), format!("{} consecutive failed ticks", status.consecutive_errors))
        } else {
            ComponentHealth::down(self.name(), "tick loop stalled")
        };
        health
            .detail("last_tick_at", status.last_tick_at)
            .detail("consecutive_errors", status.consecutive_errors)
    }
}
