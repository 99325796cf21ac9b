//! Admin HTTP API.
//!
//! Every route lives under `/jobs`. Successful bodies are wrapped as
//! `{"success": true, "data": ...}`; errors use the
//! [`ErrorResponse`](crate::error::ErrorResponse) shape.
//!
//! - Engine: `GET /info`, `GET /health`, `GET /metrics`, `GET /metrics/prometheus`
//! - Queues: `GET /queues`, `GET /queues/{name}`, `POST /queues/{name}/{clear,pause,resume}`
//! - Jobs: `GET /jobs`, `POST /jobs`, `GET /jobs/{id}`, `POST /jobs/{id}/{cancel,retry}`
//! - Workers: `GET /workers`, `GET /workers/{name}`, `POST /workers/resize`
//! - Schedules: `GET /schedules`, `POST /schedules`, `GET /schedules/{id}`,
//!   `POST /schedules/{id}` (partial update), `DELETE /schedules/{id}`,
//!   `POST /schedules/{id}/{enable,disable}`

mod extract;
mod handlers;
pub mod middleware;

pub use handlers::{
    CreateJobRequest, CreateScheduleRequest, ListJobsQuery, ResizeRequest, UpdateScheduleRequest,
};

use axum::{
    middleware as axum_middleware,
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use crate::jobs::JobManager;
use crate::telemetry::MetricsRegistry;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<JobManager>,
    pub metrics: MetricsRegistry,
}

impl AppState {
    pub fn new(manager: Arc<JobManager>, metrics: MetricsRegistry) -> Self {
        Self { manager, metrics }
    }
}

/// Build the admin router.
///
/// ```rust,ignore
/// let state = AppState::new(manager, metrics_registry);
/// let app = build_router(state);
/// ```
pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .nest("/jobs", jobs_router())
        .layer(axum_middleware::from_fn(middleware::request_id))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

fn jobs_router() -> Router<AppState> {
    Router::new()
        .route("/info", get(handlers::info))
        .route("/health", get(handlers::health))
        .route("/metrics", get(handlers::metrics))
        .route("/metrics/prometheus", get(handlers::prometheus_metrics))
        // Queues
        .route("/queues", get(handlers::list_queues))
        .route("/queues/:name", get(handlers::get_queue))
        .route("/queues/:name/clear", post(handlers::clear_queue))
        .route("/queues/:name/pause", post(handlers::pause_queue))
        .route("/queues/:name/resume", post(handlers::resume_queue))
        // Jobs
        .route("/jobs", get(handlers::list_jobs).post(handlers::create_job))
        .route("/jobs/:id", get(handlers::get_job))
        .route("/jobs/:id/cancel", post(handlers::cancel_job))
        .route("/jobs/:id/retry", post(handlers::retry_job))
        // Workers
        .route("/workers", get(handlers::list_workers))
        .route("/workers/resize", post(handlers::resize_workers))
        .route("/workers/:name", get(handlers::get_worker))
        // Schedules
        .route(
            "/schedules",
            get(handlers::list_schedules).post(handlers::create_schedule),
        )
        .route(
            "/schedules/:id",
            get(handlers::get_schedule)
                .post(handlers::update_schedule)
                .delete(handlers::delete_schedule),
        )
        .route("/schedules/:id/enable", post(handlers::enable_schedule))
        .route("/schedules/:id/disable", post(handlers::disable_schedule))
        .route_layer(axum_middleware::from_fn(middleware::track_metrics))
}

/// API response wrapper.
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_response_success() {
        let response = ApiResponse::success("test data");
        assert!(response.success);
        assert_eq!(response.data, Some("test data"));
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json, serde_json::json!({"success": true, "data": "test data"}));
    }
}
