//! The job engine facade.
//!
//! [`JobManager`] owns storage, the worker pool and the scheduler, and
//! exposes the operations the admin API serves. Every operation returns a
//! [`Result`]; the HTTP layer maps error codes to status codes.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::info;

use super::job::{validate_queue_name, Job, JobId, NewJob, StatusUpdate};
use super::monitoring::{JobMetrics, MetricsSnapshot};
use super::queue::{Enqueuer, JobQueue, QueueInfo};
use super::registry::TaskRegistry;
use super::retry::RetryPolicy;
use super::scheduler::{Scheduler, SchedulerStatus};
use super::storage::{JobFilter, JobStorage, StatusCounts, StorageRetry};
use super::worker::{WorkerInfo, WorkerPool};
use crate::config::Config;
use crate::error::{JobsError, Result};
use crate::health::{
    HealthConfig, HealthReport, HealthService, SchedulerHealthChecker, StorageHealthChecker,
    WorkerPoolHealthChecker,
};
use crate::telemetry::SERVICE_NAME;

/// Engine-wide summary served by the info endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagerInfo {
    pub version: String,
    pub workers: usize,
    pub queues: Vec<QueueInfo>,
    pub schedules: usize,
    pub enabled_schedules: usize,
    pub total_jobs: u64,
    pub counts: StatusCounts,
    pub registered_tasks: Vec<String>,
    pub scheduler: SchedulerStatus,
    pub healthy: bool,
}

pub struct JobManager {
    storage: Arc<dyn JobStorage>,
    registry: TaskRegistry,
    metrics: Arc<JobMetrics>,
    enqueuer: Enqueuer,
    pool: Arc<WorkerPool>,
    scheduler: Arc<Scheduler>,
    health: HealthService,
    retry: StorageRetry,
    run_workers: bool,
    run_scheduler: bool,
}

impl JobManager {
    /// A manager with default configuration.
    pub fn new(storage: Arc<dyn JobStorage>, registry: TaskRegistry) -> Self {
        Self::from_config(storage, registry, &Config::default())
    }

    pub fn from_config(storage: Arc<dyn JobStorage>, registry: TaskRegistry, config: &Config) -> Self {
        let metrics = Arc::new(JobMetrics::new());
        let retry = config.storage.retry();

        let pool = Arc::new(
            WorkerPool::new(
                Arc::clone(&storage),
                registry.clone(),
                Arc::clone(&metrics),
                config.workers.clone(),
            )
            .with_retry_policy(RetryPolicy::new(config.retry.clone()))
            .with_storage_retry(retry),
        );

        let enqueuer = Enqueuer::new(Arc::clone(&storage), Arc::clone(&metrics))
            .with_retry(retry)
            .with_pool(Arc::clone(&pool));

        let scheduler = Arc::new(
            Scheduler::new(
                Arc::clone(&storage),
                enqueuer.clone(),
                Arc::clone(&metrics),
                config.scheduler.clone(),
            )
            .with_storage_retry(retry),
        );

        let mut health = HealthService::new(SERVICE_NAME, HealthConfig::default());
        health.register_checker(Arc::new(StorageHealthChecker::new(Arc::clone(&storage))));
        if config.workers.enabled {
            health.register_checker(Arc::new(WorkerPoolHealthChecker::new(Arc::clone(&pool))));
        }
        if config.scheduler.enabled {
            health.register_checker(Arc::new(SchedulerHealthChecker::new(Arc::clone(&scheduler))));
        }

        Self {
            storage,
            registry,
            metrics,
            enqueuer,
            pool,
            scheduler,
            health,
            retry,
            run_workers: config.workers.enabled,
            run_scheduler: config.scheduler.enabled,
        }
    }

    // ─── Lifecycle ───────────────────────────────────────────────────────────

    /// Start the worker pool and the scheduler, as configured.
    pub fn start(&self) -> Result<()> {
        if self.run_workers {
            self.pool.start()?;
        }
        if self.run_scheduler {
            self.scheduler.start();
        }
        info!(
            workers = self.pool.worker_count(),
            scheduler = self.scheduler.is_running(),
            tasks = self.registry.len(),
            "Job manager started"
        );
        Ok(())
    }

    /// Stop the scheduler first so nothing new is enqueued, then drain the
    /// worker pool.
    pub async fn shutdown(&self) {
        self.scheduler.stop().await;
        self.pool.shutdown().await;
        info!("Job manager stopped");
    }

    // ─── Jobs ────────────────────────────────────────────────────────────────

    pub async fn enqueue(&self, request: NewJob) -> Result<Job> {
        self.enqueuer.enqueue(request).await
    }

    pub async fn get_job(&self, id: JobId) -> Result<Job> {
        let storage = &self.storage;
        self.retry
            .run("get", || storage.get(id))
            .await?
            .ok_or_else(|| JobsError::not_found("Job", id.to_string()))
    }

    /// Cancel a PENDING job. A job that is already running, or finished,
    /// fails with an invalid transition.
    pub async fn cancel_job(&self, id: JobId) -> Result<Job> {
        let storage = &self.storage;
        let job = self
            .retry
            .run("update_status", || storage.update_status(id, StatusUpdate::cancelled()))
            .await?;
        self.metrics.record_cancelled(1);
        info!(job_id = %id, queue = %job.queue_name, "Job cancelled");
        Ok(job)
    }

    /// Put a FAILED job back in its queue with a fresh retry budget.
    ///
    /// `retries` is reset to 0 rather than incremented, so the job gets
    /// `max_retries` automatic retries again. `worker_id`, `started_at`,
    /// `completed_at` and `scheduled_at` are cleared; the last `error` stays
    /// until the next attempt replaces it. Only legal from FAILED.
    pub async fn retry_job(&self, id: JobId) -> Result<Job> {
        let storage = &self.storage;
        let job = self
            .retry
            .run("update_status", || storage.update_status(id, StatusUpdate::requeued()))
            .await?;
        info!(job_id = %id, queue = %job.queue_name, "Job requeued by operator");
        Ok(job)
    }

    pub async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<Job>> {
        let storage = &self.storage;
        self.retry
            .run("get_jobs_by_status", || storage.get_jobs_by_status(filter))
            .await
    }

    // ─── Queues ──────────────────────────────────────────────────────────────

    /// Queues that hold jobs, are paused, or have workers.
    pub async fn get_queue_names(&self) -> Result<Vec<String>> {
        let storage = &self.storage;
        let mut names: BTreeSet<String> = self
            .retry
            .run("queue_names", || storage.queue_names())
            .await?
            .into_iter()
            .collect();
        names.extend(self.pool.queues());
        Ok(names.into_iter().collect())
    }

    pub async fn get_queue(&self, name: &str) -> Result<QueueInfo> {
        validate_queue_name(name)?;
        if !self.get_queue_names().await?.iter().any(|q| q == name) {
            return Err(JobsError::not_found("Queue", name));
        }
        self.queue(name).info(self.pool.concurrency(name)).await
    }

    pub async fn get_queues(&self) -> Result<Vec<QueueInfo>> {
        let mut queues = Vec::new();
        for name in self.get_queue_names().await? {
            queues.push(self.queue(&name).info(self.pool.concurrency(&name)).await?);
        }
        Ok(queues)
    }

    /// Cancel every PENDING job in the queue; returns how many were cancelled.
    pub async fn clear_queue(&self, name: &str) -> Result<u64> {
        validate_queue_name(name)?;
        let cleared = self.queue(name).clear().await?;
        self.metrics.record_cancelled(cleared);
        Ok(cleared)
    }

    /// Stop workers from claiming this queue's jobs. Queues need not exist
    /// yet to be paused.
    pub async fn pause_queue(&self, name: &str) -> Result<QueueInfo> {
        validate_queue_name(name)?;
        let queue = self.queue(name);
        queue.pause().await?;
        queue.info(self.pool.concurrency(name)).await
    }

    pub async fn resume_queue(&self, name: &str) -> Result<QueueInfo> {
        validate_queue_name(name)?;
        let queue = self.queue(name);
        queue.resume().await?;
        queue.info(self.pool.concurrency(name)).await
    }

    fn queue(&self, name: &str) -> JobQueue {
        JobQueue::new(name, Arc::clone(&self.storage))
    }

    // ─── Workers ─────────────────────────────────────────────────────────────

    pub fn workers(&self) -> Vec<WorkerInfo> {
        self.pool.workers()
    }

    pub fn worker(&self, name: &str) -> Result<WorkerInfo> {
        self.pool.worker(name)
    }

    pub fn resize_pool(&self, queue: &str, count: usize) -> Result<()> {
        self.pool.resize(queue, count)
    }

    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    // ─── Scheduler, Registry, Observability ──────────────────────────────────

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    pub fn registry(&self) -> &TaskRegistry {
        &self.registry
    }

    pub fn storage(&self) -> &Arc<dyn JobStorage> {
        &self.storage
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn job_metrics(&self) -> &Arc<JobMetrics> {
        &self.metrics
    }

    pub async fn health(&self) -> HealthReport {
        self.health.check_health().await
    }

    pub async fn info(&self) -> Result<ManagerInfo> {
        let storage = &self.storage;
        let counts = self
            .retry
            .run("count_by_status", || storage.count_by_status(None))
            .await?;
        let schedules = self.scheduler.get_all_schedules().await?;
        let queues = self.get_queues().await?;
        let health = self.health().await;

        Ok(ManagerInfo {
            version: env!("CARGO_PKG_VERSION").to_string(),
            workers: self.pool.worker_count(),
            queues,
            schedules: schedules.len(),
            enabled_schedules: schedules.iter().filter(|s| s.enabled).count(),
            total_jobs: counts.total(),
            counts,
            registered_tasks: self.registry.task_names(),
            scheduler: self.scheduler.status(),
            healthy: health.healthy,
        })
    }
}

impl std::fmt::Debug for JobManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobManager")
            .field("pool", &self.pool)
            .field("registry", &self.registry)
            .field("run_workers", &self.run_workers)
            .field("run_scheduler", &self.run_scheduler)
            .finish()
    }
}
