//! Named, pausable views over stored jobs.
//!
//! A queue holds no jobs of its own. Ordering is enforced by
//! [`JobStorage::claim_next`]; this type only scopes storage calls to one
//! queue name and carries its paused flag.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

use super::job::{Job, NewJob};
use super::monitoring::JobMetrics;
use super::storage::{JobStorage, StatusCounts, StorageRetry};
use super::worker::WorkerPool;
use crate::error::Result;

/// Snapshot of one queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueInfo {
    pub name: String,
    /// Jobs waiting to run, including ones deferred to a later time
    pub length: u64,
    pub paused: bool,
    pub counts: StatusCounts,
    /// Workers configured to pull from this queue
    pub workers: usize,
}

/// Handle for one logical queue.
#[derive(Clone)]
pub struct JobQueue {
    name: String,
    storage: Arc<dyn JobStorage>,
}

impl JobQueue {
    pub fn new(name: impl Into<String>, storage: Arc<dyn JobStorage>) -> Self {
        Self {
            name: name.into(),
            storage,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of PENDING jobs, eligible now or later.
    pub async fn get_length(&self) -> Result<u64> {
        Ok(self.storage.count_by_status(Some(&self.name)).await?.waiting())
    }

    pub async fn is_paused(&self) -> Result<bool> {
        Ok(self.storage.paused_queues().await?.contains(&self.name))
    }

    /// Stop workers from claiming jobs of this queue. Running jobs finish.
    pub async fn pause(&self) -> Result<()> {
        self.storage.set_queue_paused(&self.name, true).await?;
        info!(queue = %self.name, "Queue paused");
        Ok(())
    }

    pub async fn resume(&self) -> Result<()> {
        self.storage.set_queue_paused(&self.name, false).await?;
        info!(queue = %self.name, "Queue resumed");
        Ok(())
    }

    /// Cancel every PENDING job; returns how many were cancelled.
    pub async fn clear(&self) -> Result<u64> {
        let cleared = self.storage.clear_queue(&self.name).await?;
        info!(queue = %self.name, cleared, "Queue cleared");
        Ok(cleared)
    }

    pub async fn info(&self, workers: usize) -> Result<QueueInfo> {
        let counts = self.storage.count_by_status(Some(&self.name)).await?;
        Ok(QueueInfo {
            name: self.name.clone(),
            length: counts.waiting(),
            paused: self.is_paused().await?,
            counts,
            workers,
        })
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Enqueue Path
// ═══════════════════════════════════════════════════════════════════════════════

/// The single write path for new jobs, shared by ad-hoc submissions and
/// schedule firings.
#[derive(Clone)]
pub struct Enqueuer {
    storage: Arc<dyn JobStorage>,
    metrics: Arc<JobMetrics>,
    retry: StorageRetry,
    pool: Option<Arc<WorkerPool>>,
}

impl Enqueuer {
    pub fn new(storage: Arc<dyn JobStorage>, metrics: Arc<JobMetrics>) -> Self {
        Self {
            storage,
            metrics,
            retry: StorageRetry::default(),
            pool: None,
        }
    }

    pub fn with_retry(mut self, retry: StorageRetry) -> Self {
        self.retry = retry;
        self
    }

    /// Make sure every queue that receives a job has workers in `pool`.
    pub fn with_pool(mut self, pool: Arc<WorkerPool>) -> Self {
        self.pool = Some(pool);
        self
    }

    /// Validate, persist and count a new job.
    pub async fn enqueue(&self, request: NewJob) -> Result<Job> {
        request.validate()?;
        let job = request.into_job(Utc::now());
        let storage = &self.storage;
        self.retry.run("persist", || storage.persist(&job)).await?;
        self.metrics.record_enqueued(&job.queue_name, &job.task_name);
        info!(
            job_id = %job.id,
            task = %job.task_name,
            queue = %job.queue_name,
            priority = %job.priority,
            scheduled_at = ?job.scheduled_at,
            "Job enqueued"
        );
        if let Some(pool) = &self.pool {
            pool.ensure_queue(&job.queue_name);
        }
        Ok(job)
    }
}
