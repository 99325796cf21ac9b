//! API middleware: request ids and request metrics.

use axum::{
    extract::{MatchedPath, Request},
    http::header::{HeaderName, HeaderValue},
    middleware::Next,
    response::Response,
};
use std::time::Instant;

use crate::telemetry::record_http_request;

const REQUEST_ID: HeaderName = HeaderName::from_static("x-request-id");

/// Echo the caller's `x-request-id`, or assign one.
pub async fn request_id(req: Request, next: Next) -> Response {
    let request_id = req
        .headers()
        .get(&REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    let mut response = next.run(req).await;
    if let Ok(val) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert(REQUEST_ID, val);
    }
    response
}

/// Record `http_request_duration_seconds` labelled by route template.
///
/// Must be installed with `route_layer` so the matched path is known.
pub async fn track_metrics(req: Request, next: Next) -> Response {
    let start = Instant::now();
    let path = req
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| "unmatched".to_string());
    let method = req.method().clone();

    let response = next.run(req).await;

    record_http_request(method.as_str(), &path, response.status().as_u16(), start.elapsed());
    response
}
