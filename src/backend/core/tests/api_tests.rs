//! Admin API tests, driven through the router without a socket.
//!
//! Tests cover:
//! - Job submission, lookup, listing, cancel and retry
//! - Status codes for malformed input, unknown ids and illegal transitions
//! - Queue pause/resume/clear and queue lookup
//! - Schedule management
//! - Worker resizing
//! - Health, info, metrics and request ids
//! - Worker, health and info views with the pool and scheduler running

use axum::{
    body::Body,
    http::{header, Method, Request, StatusCode},
    Router,
};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;
use uno_jobs::api::{build_router, AppState};
use uno_jobs::config::Config;
use uno_jobs::jobs::{register_builtins, InMemoryStorage, JobManager, TaskRegistry};
use uno_jobs::telemetry::MetricsRegistry;

fn app() -> Router {
    let mut config = Config::default();
    config.workers.enabled = false;
    config.scheduler.enabled = false;

    let registry = TaskRegistry::new();
    register_builtins(&registry);
    let manager = JobManager::from_config(Arc::new(InMemoryStorage::new()), registry, &config);
    build_router(AppState::new(Arc::new(manager), MetricsRegistry::disabled()))
}

/// A router over a started manager with the default worker and scheduler
/// configuration.
fn running_app() -> (Router, Arc<JobManager>) {
    let mut config = Config::default();
    config.workers.poll_interval = Duration::from_millis(10);
    config.workers.shutdown_timeout = Duration::from_millis(200);
    config.scheduler.tick_interval = Duration::from_millis(20);

    let registry = TaskRegistry::new();
    register_builtins(&registry);
    let manager = Arc::new(JobManager::from_config(
        Arc::new(InMemoryStorage::new()),
        registry,
        &config,
    ));
    manager.start().unwrap();
    let app = build_router(AppState::new(Arc::clone(&manager), MetricsRegistry::disabled()));
    (app, manager)
}

async fn send_within(app: &Router, uri: &str) -> (StatusCode, Value) {
    tokio::time::timeout(Duration::from_secs(2), send(app, Method::GET, uri, None))
        .await
        .unwrap_or_else(|_| panic!("GET {} did not answer", uri))
}

async fn send(app: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let builder = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(body) => builder
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into_owned()))
    };
    (status, value)
}

async fn create_job(app: &Router, body: Value) -> Value {
    let (status, body) = send(app, Method::POST, "/jobs/jobs", Some(body)).await;
    assert_eq!(status, StatusCode::CREATED, "{}", body);
    body["data"].clone()
}

// ============================================================================
// Jobs
// ============================================================================

#[tokio::test]
async fn test_create_and_get_job() {
    let app = app();
    let job = create_job(
        &app,
        json!({"task_name": "echo", "priority": "HIGH", "args": [1, 2], "tags": ["smoke"]}),
    )
    .await;
    assert_eq!(job["status"], "PENDING");
    assert_eq!(job["priority"], "HIGH");
    assert_eq!(job["queue_name"], "default");

    let id = job["id"].as_str().unwrap();
    let (status, body) = send(&app, Method::GET, &format!("/jobs/jobs/{}", id), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    assert_eq!(body["data"]["id"], id);
    assert_eq!(body["data"]["args"], json!([1, 2]));
}

#[tokio::test]
async fn test_deferred_job_reports_scheduled() {
    let app = app();
    let job = create_job(
        &app,
        json!({"task_name": "noop", "scheduled_at": "2999-01-01T00:00:00Z"}),
    )
    .await;
    assert_eq!(job["status"], "SCHEDULED");

    let (status, body) = send(&app, Method::GET, "/jobs/jobs?status=SCHEDULED", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"].as_array().unwrap().len(), 1);

    let (_, body) = send(&app, Method::GET, "/jobs/jobs?status=PENDING,RUNNING", None).await;
    assert!(body["data"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_malformed_requests_are_rejected() {
    let app = app();

    let (status, body) = send(&app, Method::GET, "/jobs/jobs/not-a-uuid", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["success"], false);
    assert_eq!(body["error"]["code"], "VALIDATION");

    let (status, _) = send(
        &app,
        Method::POST,
        "/jobs/jobs",
        Some(json!({"task_name": "echo", "priority": "URGENT"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = send(&app, Method::POST, "/jobs/jobs", Some(json!({"args": []}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = send(&app, Method::GET, "/jobs/jobs?status=LOST", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = send(
        &app,
        Method::POST,
        "/jobs/jobs",
        Some(json!({"task_name": "echo", "timeout_seconds": 0})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_unknown_job_is_not_found() {
    let app = app();
    let uri = format!("/jobs/jobs/{}", uuid::Uuid::new_v4());
    let (status, body) = send(&app, Method::GET, &uri, None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["code"], "NOT_FOUND");

    let (status, _) = send(&app, Method::POST, &format!("{}/cancel", uri), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_cancel_twice_conflicts() {
    let app = app();
    let job = create_job(&app, json!({"task_name": "noop"})).await;
    let uri = format!("/jobs/jobs/{}/cancel", job["id"].as_str().unwrap());

    let (status, body) = send(&app, Method::POST, &uri, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["status"], "CANCELLED");

    let (status, body) = send(&app, Method::POST, &uri, None).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"]["code"], "INVALID_TRANSITION");
}

#[tokio::test]
async fn test_retry_requires_failed_job() {
    let app = app();
    let job = create_job(&app, json!({"task_name": "noop"})).await;
    let uri = format!("/jobs/jobs/{}/retry", job["id"].as_str().unwrap());

    let (status, _) = send(&app, Method::POST, &uri, None).await;
    assert_eq!(status, StatusCode::CONFLICT);
}

// ============================================================================
// Queues
// ============================================================================

#[tokio::test]
async fn test_queue_operations() {
    let app = app();
    for _ in 0..2 {
        create_job(&app, json!({"task_name": "noop", "queue_name": "emails"})).await;
    }

    let (status, body) = send(&app, Method::GET, "/jobs/queues/emails", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["length"], 2);

    let (status, body) = send(&app, Method::POST, "/jobs/queues/emails/pause", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["paused"], true);

    let (_, body) = send(&app, Method::POST, "/jobs/queues/emails/resume", None).await;
    assert_eq!(body["data"]["paused"], false);

    let (status, body) = send(&app, Method::POST, "/jobs/queues/emails/clear", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["cleared"], 2);

    let (status, body) = send(&app, Method::GET, "/jobs/queues", None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["data"]
        .as_array()
        .unwrap()
        .iter()
        .any(|q| q["name"] == "emails"));

    let (status, _) = send(&app, Method::GET, "/jobs/queues/nowhere", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

// ============================================================================
// Schedules
// ============================================================================

#[tokio::test]
async fn test_schedule_management() {
    let app = app();

    let (status, body) = send(
        &app,
        Method::POST,
        "/jobs/schedules",
        Some(json!({"name": "heartbeat", "task_name": "noop", "interval_seconds": 60})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED, "{}", body);
    let id = body["data"]["id"].as_str().unwrap().to_string();
    assert_eq!(body["data"]["enabled"], true);

    let (status, body) = send(&app, Method::POST, &format!("/jobs/schedules/{}/disable", id), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["enabled"], false);

    let (status, body) = send(
        &app,
        Method::POST,
        &format!("/jobs/schedules/{}", id),
        Some(json!({"name": "pulse", "cron": "0 * * * *"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{}", body);
    assert_eq!(body["data"]["name"], "pulse");

    let (_, body) = send(&app, Method::GET, "/jobs/schedules", None).await;
    assert_eq!(body["data"].as_array().unwrap().len(), 1);

    let (status, _) = send(&app, Method::DELETE, &format!("/jobs/schedules/{}", id), None).await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = send(&app, Method::GET, &format!("/jobs/schedules/{}", id), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_schedule_requires_exactly_one_rule() {
    let app = app();

    let (status, _) = send(
        &app,
        Method::POST,
        "/jobs/schedules",
        Some(json!({"name": "none", "task_name": "noop"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = send(
        &app,
        Method::POST,
        "/jobs/schedules",
        Some(json!({"name": "both", "task_name": "noop", "cron": "* * * * *", "interval_seconds": 5})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = send(
        &app,
        Method::POST,
        "/jobs/schedules",
        Some(json!({"name": "bad", "task_name": "noop", "cron": "every tuesday"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

// ============================================================================
// Workers
// ============================================================================

#[tokio::test]
async fn test_resize_workers() {
    let app = app();

    let (status, body) = send(
        &app,
        Method::POST,
        "/jobs/workers/resize",
        Some(json!({"queue_name": "emails", "count": 2})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["count"], 2);

    let (_, body) = send(&app, Method::GET, "/jobs/workers", None).await;
    let workers = body["data"].as_array().unwrap();
    assert_eq!(workers.len(), 2);
    let name = workers[0]["name"].as_str().unwrap().to_string();

    let (status, body) = send(&app, Method::GET, &format!("/jobs/workers/{}", name), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["queue_names"], json!(["emails"]));

    let (status, _) = send(&app, Method::GET, "/jobs/workers/ghost", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = send(
        &app,
        Method::POST,
        "/jobs/workers/resize",
        Some(json!({"queue_name": "emails", "count": 100000})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

// ============================================================================
// Engine
// ============================================================================

#[tokio::test]
async fn test_health_info_and_metrics() {
    let app = app();

    let (status, body) = send(&app, Method::GET, "/jobs/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["healthy"], true);

    create_job(&app, json!({"task_name": "noop"})).await;
    let (status, body) = send(&app, Method::GET, "/jobs/info", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["total_jobs"], 1);
    assert!(body["data"]["registered_tasks"]
        .as_array()
        .unwrap()
        .contains(&json!("echo")));

    let (status, body) = send(&app, Method::GET, "/jobs/metrics", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["enqueued"], 1);

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/jobs/metrics/prometheus")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers()[header::CONTENT_TYPE]
        .to_str()
        .unwrap()
        .starts_with("text/plain"));
}

#[tokio::test]
async fn test_request_id_is_echoed() {
    let app = app();
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/jobs/health")
                .header("x-request-id", "req-42")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.headers()["x-request-id"], "req-42");

    let response = app
        .oneshot(Request::builder().uri("/jobs/info").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert!(response.headers().contains_key("x-request-id"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_views_with_pool_and_scheduler_running() {
    let (app, manager) = running_app();
    tokio::time::sleep(Duration::from_millis(60)).await;

    let (status, body) = send_within(&app, "/jobs/workers").await;
    assert_eq!(status, StatusCode::OK);
    let workers = body["data"].as_array().unwrap();
    assert_eq!(workers.len(), 2);
    assert!(workers.iter().all(|w| w["healthy"] == true));
    let name = workers[0]["name"].as_str().unwrap().to_string();

    let (status, body) = send_within(&app, &format!("/jobs/workers/{}", name)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["queue_names"], json!(["default"]));

    let (status, body) = send_within(&app, "/jobs/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["status"], "healthy");

    let (status, body) = send_within(&app, "/jobs/info").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["workers"], 2);
    assert_eq!(body["data"]["scheduler"]["running"], true);
    assert_eq!(body["data"]["scheduler"]["healthy"], true);

    manager.shutdown().await;
}
