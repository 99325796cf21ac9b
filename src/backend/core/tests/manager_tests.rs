//! End-to-end tests through the job manager.
//!
//! Tests cover:
//! - Enqueue to completion with a registered handler
//! - Retry exhaustion
//! - Cancel before and after a worker claims the job
//! - Scheduled firings executed by the worker pool
//! - Queue views and engine info
//! - Workers for queues missing from the configuration
//! - Worker, health and info views while the pool and scheduler run

use chrono::{Duration as ChronoDuration, Utc};
use serde_json::json;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use uno_jobs::config::Config;
use uno_jobs::error::ErrorCode;
use uno_jobs::health::HealthStatus;
use uno_jobs::jobs::{
    InMemoryStorage, Job, JobFilter, JobId, JobManager, JobStatus, NewJob, NewSchedule, Priority,
    Schedule, TaskError, TaskRegistry,
};

fn config(workers: bool, scheduler: bool) -> Config {
    let mut config = Config::default();
    config.workers.enabled = workers;
    config.workers.poll_interval = Duration::from_millis(10);
    config.workers.shutdown_timeout = Duration::from_millis(200);
    config.scheduler.enabled = scheduler;
    config.scheduler.tick_interval = Duration::from_millis(20);
    config
}

fn manager(registry: TaskRegistry, config: &Config) -> JobManager {
    JobManager::from_config(Arc::new(InMemoryStorage::new()), registry, config)
}

async fn wait_for(manager: &JobManager, id: JobId, status: JobStatus) -> Job {
    for _ in 0..500 {
        let job = manager.get_job(id).await.unwrap();
        if job.status == status {
            return job;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("job {} never reached {}", id, status);
}

fn email_registry() -> TaskRegistry {
    let registry = TaskRegistry::new();
    registry.register_fn("send_email", |_ctx| async move { Ok(json!({"sent": true})) });
    registry
}

// ============================================================================
// Job Lifecycle
// ============================================================================

#[tokio::test]
async fn test_enqueued_job_runs_to_success() {
    let manager = manager(email_registry(), &config(true, false));

    let job = manager
        .enqueue(
            NewJob::new("send_email")
                .queue("default")
                .priority(Priority::High)
                .kwarg("to", json!("ops@example.com")),
        )
        .await
        .unwrap();
    assert_eq!(manager.get_job(job.id).await.unwrap().status, JobStatus::Pending);

    manager.start().unwrap();
    let done = wait_for(&manager, job.id, JobStatus::Succeeded).await;
    assert_eq!(done.result, Some(json!({"sent": true})));
    assert!(done.completed_at.is_some());
    assert_eq!(done.priority, Priority::High);

    manager.shutdown().await;
    let metrics = manager.metrics();
    assert_eq!(metrics.enqueued, 1);
    assert_eq!(metrics.succeeded, 1);
}

#[tokio::test]
async fn test_retries_are_exhausted_then_failed() {
    let attempts = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&attempts);
    let registry = TaskRegistry::new();
    registry.register_fn("flaky", move |_ctx| {
        let counter = Arc::clone(&counter);
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(TaskError::new("smtp unavailable"))
        }
    });
    let manager = manager(registry, &config(true, false));
    manager.start().unwrap();

    let job = manager
        .enqueue(NewJob::new("flaky").max_retries(2).retry_delay(Duration::ZERO))
        .await
        .unwrap();
    let failed = wait_for(&manager, job.id, JobStatus::Failed).await;

    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    assert_eq!(failed.retries, 2);
    let error = failed.error.unwrap();
    assert_eq!(error.kind, "TaskError");
    assert_eq!(error.message, "smtp unavailable");

    // operator retry restarts the budget
    let requeued = manager.retry_job(job.id).await.unwrap();
    assert_eq!(requeued.retries, 0);
    wait_for(&manager, job.id, JobStatus::Failed).await;
    assert_eq!(attempts.load(Ordering::SeqCst), 6);

    manager.shutdown().await;
    let metrics = manager.metrics();
    assert_eq!(metrics.retried, 4);
    assert_eq!(metrics.failed, 2);
}

// ============================================================================
// Cancellation
// ============================================================================

#[tokio::test]
async fn test_claimed_job_cannot_be_cancelled() {
    let manager = manager(email_registry(), &config(false, false));
    let job = manager.enqueue(NewJob::new("send_email")).await.unwrap();

    let claimed = manager
        .storage()
        .claim_next("default", "external-worker")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(claimed.id, job.id);

    let err = manager.cancel_job(job.id).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidTransition);
    assert_eq!(manager.get_job(job.id).await.unwrap().status, JobStatus::Running);
}

#[tokio::test]
async fn test_cancelled_job_never_runs() {
    let runs = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&runs);
    let registry = TaskRegistry::new();
    registry.register_fn("count", move |_ctx| {
        let counter = Arc::clone(&counter);
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(json!(null))
        }
    });
    let manager = manager(registry, &config(true, false));

    manager.pause_queue("default").await.unwrap();
    manager.start().unwrap();
    let doomed = manager.enqueue(NewJob::new("count")).await.unwrap();
    let cancelled = manager.cancel_job(doomed.id).await.unwrap();
    assert_eq!(cancelled.status, JobStatus::Cancelled);

    let err = manager.cancel_job(doomed.id).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidTransition);

    manager.resume_queue("default").await.unwrap();
    let kept = manager.enqueue(NewJob::new("count")).await.unwrap();
    wait_for(&manager, kept.id, JobStatus::Succeeded).await;

    assert_eq!(runs.load(Ordering::SeqCst), 1);
    assert_eq!(
        manager.get_job(doomed.id).await.unwrap().status,
        JobStatus::Cancelled
    );
    manager.shutdown().await;
}

// ============================================================================
// Scheduling
// ============================================================================

#[tokio::test]
async fn test_schedule_fires_into_worker_pool() {
    let manager = manager(email_registry(), &config(true, true));
    manager.start().unwrap();

    let schedule = manager
        .scheduler()
        .add_schedule(NewSchedule::new(
            "welcome",
            "send_email",
            Schedule::one_shot(Utc::now() - ChronoDuration::seconds(1)),
        ))
        .await
        .unwrap();

    let mut fired = Vec::new();
    for _ in 0..500 {
        fired = manager
            .list_jobs(&JobFilter::default().status(JobStatus::Succeeded))
            .await
            .unwrap();
        if !fired.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(fired.len(), 1);
    assert!(fired[0].is_scheduled);

    let after = manager.scheduler().get_schedule(schedule.id).await.unwrap();
    assert_eq!(after.run_count, 1);
    assert!(!after.enabled);

    manager.shutdown().await;
    assert!(!manager.scheduler().is_running());
}

// ============================================================================
// Queues and Info
// ============================================================================

#[tokio::test]
async fn test_queue_views_and_info() {
    let manager = manager(email_registry(), &config(false, false));
    for priority in [Priority::Low, Priority::Critical, Priority::Normal] {
        manager
            .enqueue(NewJob::new("send_email").queue("emails").priority(priority))
            .await
            .unwrap();
    }

    let queue = manager.get_queue("emails").await.unwrap();
    assert_eq!(queue.length, 3);
    assert!(!queue.paused);
    assert!(manager.get_queue("missing").await.unwrap_err().is_not_found());

    // highest priority is claimed first
    let first = manager.storage().claim_next("emails", "w").await.unwrap().unwrap();
    assert_eq!(first.priority, Priority::Critical);

    assert_eq!(manager.clear_queue("emails").await.unwrap(), 2);

    let info = manager.info().await.unwrap();
    assert_eq!(info.total_jobs, 3);
    assert_eq!(info.counts.get(JobStatus::Cancelled), 2);
    assert_eq!(info.counts.get(JobStatus::Running), 1);
    assert_eq!(info.registered_tasks, vec!["send_email"]);
    assert_eq!(info.workers, 0);
}

#[tokio::test]
async fn test_unconfigured_queue_gets_default_workers() {
    let config = config(true, false);
    let manager = manager(email_registry(), &config);

    // before start, the queue is only remembered
    let early = manager
        .enqueue(NewJob::new("send_email").queue("emails"))
        .await
        .unwrap();
    assert!(manager.workers().is_empty());

    manager.start().unwrap();
    wait_for(&manager, early.id, JobStatus::Succeeded).await;

    let late = manager
        .enqueue(NewJob::new("send_email").queue("reports"))
        .await
        .unwrap();
    wait_for(&manager, late.id, JobStatus::Succeeded).await;

    let default_concurrency = config.workers.default_concurrency;
    assert_eq!(manager.get_queue("emails").await.unwrap().workers, default_concurrency);
    assert_eq!(manager.get_queue("reports").await.unwrap().workers, default_concurrency);

    // an explicit size sticks
    manager.resize_pool("reports", 0).unwrap();
    manager
        .enqueue(NewJob::new("send_email").queue("reports"))
        .await
        .unwrap();
    assert_eq!(manager.get_queue("reports").await.unwrap().workers, 0);

    manager.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_views_while_pool_and_scheduler_run() {
    let manager = Arc::new(manager(email_registry(), &config(true, true)));
    manager.start().unwrap();
    tokio::time::sleep(Duration::from_millis(60)).await;

    let views = Arc::clone(&manager);
    let (workers, status) = tokio::time::timeout(
        Duration::from_secs(2),
        tokio::task::spawn_blocking(move || (views.workers(), views.scheduler().status())),
    )
    .await
    .expect("worker and scheduler views blocked")
    .unwrap();

    assert_eq!(workers.len(), 2);
    assert!(workers.iter().all(|w| w.running && w.healthy));
    assert!(status.running);
    assert!(status.healthy);

    let name = workers[0].name.clone();
    assert_eq!(manager.worker(&name).unwrap().name, name);

    let report = tokio::time::timeout(Duration::from_secs(2), manager.health())
        .await
        .expect("health check blocked");
    assert_eq!(report.status, HealthStatus::Healthy);
    assert_eq!(report.component("workers").unwrap().status, HealthStatus::Healthy);
    assert_eq!(report.component("scheduler").unwrap().status, HealthStatus::Healthy);

    let info = tokio::time::timeout(Duration::from_secs(2), manager.info())
        .await
        .expect("info blocked")
        .unwrap();
    assert_eq!(info.workers, 2);
    assert!(info.scheduler.running);
    assert!(info.healthy);

    manager.shutdown().await;
}
