//! Worker pool tests.
//!
//! Tests cover:
//! - Dispatch to registered handlers and result recording
//! - Paused queues
//! - Timeouts, panics, fatal errors and unknown tasks
//! - Resizing at runtime
//! - Graceful shutdown and release of aborted jobs

use serde_json::json;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use uno_jobs::config::WorkersConfig;
use uno_jobs::jobs::{
    Enqueuer, InMemoryStorage, Job, JobId, JobMetrics, JobStatus, JobStorage, NewJob, TaskError,
    TaskRegistry, WorkerPool,
};

struct Harness {
    storage: Arc<dyn JobStorage>,
    metrics: Arc<JobMetrics>,
    enqueuer: Enqueuer,
    pool: WorkerPool,
}

fn config(queues: &[(&str, usize)]) -> WorkersConfig {
    WorkersConfig {
        queues: queues
            .iter()
            .map(|(q, n)| (q.to_string(), *n))
            .collect::<BTreeMap<_, _>>(),
        poll_interval: Duration::from_millis(10),
        shutdown_timeout: Duration::from_millis(200),
        ..Default::default()
    }
}

fn harness(registry: TaskRegistry, config: WorkersConfig) -> Harness {
    let storage: Arc<dyn JobStorage> = Arc::new(InMemoryStorage::new());
    let metrics = Arc::new(JobMetrics::new());
    let enqueuer = Enqueuer::new(Arc::clone(&storage), Arc::clone(&metrics));
    let pool = WorkerPool::new(Arc::clone(&storage), registry, Arc::clone(&metrics), config);
    Harness {
        storage,
        metrics,
        enqueuer,
        pool,
    }
}

async fn wait_for(storage: &Arc<dyn JobStorage>, id: JobId, status: JobStatus) -> Job {
    for _ in 0..500 {
        let job = storage.get(id).await.unwrap().unwrap();
        if job.status == status {
            return job;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("job {} never reached {}", id, status);
}

// ============================================================================
// Dispatch
// ============================================================================

#[tokio::test]
async fn test_pool_runs_registered_handler() {
    let registry = TaskRegistry::new();
    registry.register_fn("add", |ctx| async move {
        let a: i64 = ctx.arg(0)?;
        let b: i64 = ctx.arg(1)?;
        Ok(json!(a + b))
    });
    let h = harness(registry, config(&[("default", 2)]));
    h.pool.start().unwrap();
    assert_eq!(h.pool.worker_count(), 2);

    let job = h
        .enqueuer
        .enqueue(NewJob::new("add").args(vec![json!(2), json!(3)]))
        .await
        .unwrap();
    let done = wait_for(&h.storage, job.id, JobStatus::Succeeded).await;

    assert_eq!(done.result, Some(json!(5)));
    assert!(done.completed_at.is_some());
    assert!(done.worker_id.unwrap().starts_with("worker-default-"));

    h.pool.shutdown().await;
    let snapshot = h.metrics.snapshot();
    assert_eq!(snapshot.started, 1);
    assert_eq!(snapshot.succeeded, 1);
}

#[tokio::test]
async fn test_paused_queue_is_not_consumed() {
    let registry = TaskRegistry::new();
    registry.register_fn("noop", |_ctx| async move { Ok(json!(null)) });
    let h = harness(registry, config(&[("default", 1)]));

    h.storage.set_queue_paused("default", true).await.unwrap();
    h.pool.start().unwrap();
    let job = h.enqueuer.enqueue(NewJob::new("noop")).await.unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(
        h.storage.get(job.id).await.unwrap().unwrap().status,
        JobStatus::Pending
    );

    h.storage.set_queue_paused("default", false).await.unwrap();
    wait_for(&h.storage, job.id, JobStatus::Succeeded).await;
    h.pool.shutdown().await;
}

// ============================================================================
// Failures
// ============================================================================

#[tokio::test]
async fn test_timeout_fails_the_attempt() {
    let registry = TaskRegistry::new();
    registry.register_fn("slow", |_ctx| async move {
        tokio::time::sleep(Duration::from_secs(30)).await;
        Ok(json!(null))
    });
    let h = harness(registry, config(&[("default", 1)]));
    h.pool.start().unwrap();

    let job = h
        .enqueuer
        .enqueue(
            NewJob::new("slow")
                .timeout(Duration::from_millis(50))
                .max_retries(0),
        )
        .await
        .unwrap();
    let failed = wait_for(&h.storage, job.id, JobStatus::Failed).await;

    assert_eq!(failed.error.unwrap().kind, "TimeoutError");
    assert_eq!(h.metrics.snapshot().timed_out, 1);
    h.pool.shutdown().await;
}

#[tokio::test]
async fn test_panic_is_retried_then_failed() {
    let attempts = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&attempts);
    let registry = TaskRegistry::new();
    registry.register_fn("explode", move |_ctx| {
        let counter = Arc::clone(&counter);
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            panic!("kaboom");
        }
    });
    let h = harness(registry, config(&[("default", 1)]));
    h.pool.start().unwrap();

    let job = h
        .enqueuer
        .enqueue(NewJob::new("explode").max_retries(1).retry_delay(Duration::ZERO))
        .await
        .unwrap();
    let failed = wait_for(&h.storage, job.id, JobStatus::Failed).await;

    let error = failed.error.unwrap();
    assert_eq!(error.kind, "Panic");
    assert!(error.message.contains("kaboom"));
    assert_eq!(attempts.load(Ordering::SeqCst), 2);
    assert!(h.pool.is_healthy());
    h.pool.shutdown().await;
}

#[tokio::test]
async fn test_fatal_error_skips_retries() {
    let attempts = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&attempts);
    let registry = TaskRegistry::new();
    registry.register_fn("validate", move |_ctx| {
        let counter = Arc::clone(&counter);
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(TaskError::fatal("bad input"))
        }
    });
    let h = harness(registry, config(&[("default", 1)]));
    h.pool.start().unwrap();

    let job = h
        .enqueuer
        .enqueue(NewJob::new("validate").max_retries(5).retry_delay(Duration::ZERO))
        .await
        .unwrap();
    let failed = wait_for(&h.storage, job.id, JobStatus::Failed).await;

    assert_eq!(failed.retries, 0);
    assert_eq!(attempts.load(Ordering::SeqCst), 1);
    h.pool.shutdown().await;
}

#[tokio::test]
async fn test_unknown_task_fails_closed() {
    let h = harness(TaskRegistry::new(), config(&[("default", 1)]));
    h.pool.start().unwrap();

    let job = h
        .enqueuer
        .enqueue(NewJob::new("missing").max_retries(3))
        .await
        .unwrap();
    let failed = wait_for(&h.storage, job.id, JobStatus::Failed).await;

    assert_eq!(failed.error.unwrap().kind, "UnknownTaskError");
    assert_eq!(failed.retries, 0);
    h.pool.shutdown().await;
}

// ============================================================================
// Pool Management
// ============================================================================

#[tokio::test]
async fn test_resize_grows_and_shrinks() {
    let h = harness(TaskRegistry::new(), config(&[("default", 1)]));
    h.pool.start().unwrap();

    h.pool.resize("emails", 3).unwrap();
    assert_eq!(h.pool.concurrency("emails"), 3);
    assert_eq!(h.pool.worker_count(), 4);
    assert_eq!(h.pool.queues(), vec!["default", "emails"]);

    let names: Vec<String> = h.pool.workers().into_iter().map(|w| w.name).collect();
    assert!(names.iter().any(|n| n == "worker-emails-2"));
    let info = h.pool.worker("worker-emails-2").unwrap();
    assert_eq!(info.queue_names, vec!["emails"]);

    h.pool.resize("emails", 1).unwrap();
    assert_eq!(h.pool.concurrency("emails"), 1);
    h.pool.resize("emails", 0).unwrap();
    assert_eq!(h.pool.queues(), vec!["default"]);

    assert!(h.pool.resize("emails", 10_000).is_err());
    assert!(h.pool.worker("worker-nope-1").unwrap_err().is_not_found());
    h.pool.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_releases_stuck_jobs() {
    let registry = TaskRegistry::new();
    registry.register_fn("stuck", |_ctx| async move {
        tokio::time::sleep(Duration::from_secs(60)).await;
        Ok(json!(null))
    });
    let h = harness(registry, config(&[("default", 1)]));
    h.pool.start().unwrap();

    let job = h.enqueuer.enqueue(NewJob::new("stuck")).await.unwrap();
    wait_for(&h.storage, job.id, JobStatus::Running).await;

    h.pool.shutdown().await;

    let released = h.storage.get(job.id).await.unwrap().unwrap();
    assert_eq!(released.status, JobStatus::Pending);
    assert_eq!(released.retries, 0);
    assert_eq!(released.error.unwrap().kind, "Shutdown");
    assert_eq!(h.pool.worker_count(), 0);
}
