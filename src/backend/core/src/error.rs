//! Error handling for the job engine.
//!
//! Every fallible public operation returns [`Result<T>`]. A [`JobsError`]
//! carries a machine-readable [`ErrorCode`], a message safe to show API
//! clients, an optional cause kept for logs only, and [`ErrorDetails`] naming
//! the job, schedule, queue or worker involved.
//!
//! Status codes are decided here but applied only by the HTTP layer, through
//! the `IntoResponse` impl.
//!
//! ```rust,ignore
//! let job = storage.get_job(id).await?.ok_or_else(|| JobsError::not_found("Job", id))?;
//! ```

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use metrics::counter;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, JobsError>;

// ═══════════════════════════════════════════════════════════════════════════════
// Error Codes
// ═══════════════════════════════════════════════════════════════════════════════

/// Machine-readable error codes.
///
/// The first seven are the engine's own failure kinds; the rest come from the
/// surrounding layers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Unknown job, schedule, worker or queue
    NotFound,
    /// Illegal job status change
    InvalidTransition,
    /// Id collision on insert
    DuplicateId,
    /// No handler registered for a task name
    UnknownTask,
    Timeout,
    /// Backing store unavailable or inconsistent
    Storage,
    /// Malformed enqueue or schedule request
    Validation,

    Configuration,
    Serialization,
    Internal,
}

impl ErrorCode {
    /// Stable number sent alongside the code; grouped by layer.
    pub const fn numeric_code(&self) -> u32 {
        match self {
            Self::NotFound => 1000,
            Self::InvalidTransition => 1001,
            Self::DuplicateId => 1002,
            Self::UnknownTask => 1100,
            Self::Timeout => 1101,
            Self::Storage => 2000,
            Self::Serialization => 2200,
            Self::Validation => 4100,
            Self::Configuration => 5000,
            Self::Internal => 9000,
        }
    }

    pub const fn http_status(&self) -> StatusCode {
        match self {
            Self::Validation | Self::UnknownTask => StatusCode::BAD_REQUEST,
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::InvalidTransition | Self::DuplicateId => StatusCode::CONFLICT,
            Self::Timeout => StatusCode::GATEWAY_TIMEOUT,
            Self::Storage | Self::Configuration | Self::Serialization | Self::Internal => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Whether the same storage operation may succeed if attempted again.
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Storage | Self::Timeout)
    }

    /// Name used in metric labels and job error records.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::NotFound => "NotFoundError",
            Self::InvalidTransition => "InvalidTransitionError",
            Self::DuplicateId => "DuplicateIdError",
            Self::UnknownTask => "UnknownTaskError",
            Self::Timeout => "TimeoutError",
            Self::Storage => "StorageError",
            Self::Validation => "ValidationError",
            Self::Configuration => "ConfigurationError",
            Self::Serialization => "SerializationError",
            Self::Internal => "InternalError",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the error is about, for API clients.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ErrorDetails {
    /// `Job`, `Schedule`, `Queue`, `Worker` or `Task`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl ErrorDetails {
    pub fn about(resource: &str, id: impl fmt::Display) -> Self {
        Self {
            resource: Some(resource.to_string()),
            id: Some(id.to_string()),
            extra: BTreeMap::new(),
        }
    }

    fn is_empty(&self) -> bool {
        self.resource.is_none() && self.id.is_none() && self.extra.is_empty()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// JobsError
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Error, Debug)]
pub struct JobsError {
    code: ErrorCode,
    message: Cow<'static, str>,
    /// Never sent to clients
    cause: Option<String>,
    details: ErrorDetails,
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl fmt::Display for JobsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)?;
        match &self.cause {
            Some(cause) => write!(f, ": {}", cause),
            None => Ok(()),
        }
    }
}

impl JobsError {
    /// Build an error and count it in `uno_jobs_errors_total`.
    pub fn new(code: ErrorCode, message: impl Into<Cow<'static, str>>) -> Self {
        counter!(
            "uno_jobs_errors_total",
            "code" => code.as_str(),
            "retryable" => if code.is_retryable() { "true" } else { "false" },
        )
        .increment(1);

        Self {
            code,
            message: message.into(),
            cause: None,
            details: ErrorDetails::default(),
            source: None,
        }
    }

    pub fn not_found(resource: &str, id: impl fmt::Display) -> Self {
        Self::new(ErrorCode::NotFound, format!("{} not found: {}", resource, id))
            .with_details(ErrorDetails::about(resource, id))
    }

    pub fn invalid_transition(job_id: impl fmt::Display, from: impl fmt::Display, to: impl fmt::Display) -> Self {
        Self::new(
            ErrorCode::InvalidTransition,
            format!("Job {} cannot move from {} to {}", job_id, from, to),
        )
        .with_details(ErrorDetails::about("Job", job_id))
        .detail("from", from.to_string())
        .detail("to", to.to_string())
    }

    pub fn duplicate_id(resource: &str, id: impl fmt::Display) -> Self {
        Self::new(ErrorCode::DuplicateId, format!("{} already exists: {}", resource, id))
            .with_details(ErrorDetails::about(resource, id))
    }

    pub fn unknown_task(task_name: impl Into<String>) -> Self {
        let task_name = task_name.into();
        Self::new(
            ErrorCode::UnknownTask,
            format!("No handler registered for task '{}'", task_name),
        )
        .with_details(ErrorDetails::about("Task", &task_name))
    }

    pub fn timeout(what: impl fmt::Display, after: std::time::Duration) -> Self {
        Self::new(ErrorCode::Timeout, format!("{} timed out after {:?}", what, after))
    }

    pub fn validation(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorCode::Validation, message)
    }

    /// Storage failure; `cause` is logged but clients only see a generic message.
    pub fn storage(cause: impl Into<String>) -> Self {
        Self::new(ErrorCode::Storage, "Job storage is unavailable").with_cause(cause)
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Configuration, message.into())
    }

    pub fn internal(cause: impl Into<String>) -> Self {
        Self::new(ErrorCode::Internal, "An internal error occurred").with_cause(cause)
    }

    pub fn with_cause(mut self, cause: impl Into<String>) -> Self {
        self.cause = Some(cause.into());
        self
    }

    pub fn with_source<E>(mut self, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        self.source = Some(Box::new(source));
        self
    }

    pub fn with_details(mut self, details: ErrorDetails) -> Self {
        self.details = details;
        self
    }

    pub fn detail(mut self, key: &str, value: impl Serialize) -> Self {
        if let Ok(value) = serde_json::to_value(value) {
            self.details.extra.insert(key.to_string(), value);
        }
        self
    }

    pub fn code(&self) -> ErrorCode {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn cause(&self) -> Option<&str> {
        self.cause.as_deref()
    }

    pub fn details(&self) -> &ErrorDetails {
        &self.details
    }

    pub fn http_status(&self) -> StatusCode {
        self.code.http_status()
    }

    pub fn is_retryable(&self) -> bool {
        self.code.is_retryable()
    }

    pub fn is_not_found(&self) -> bool {
        self.code == ErrorCode::NotFound
    }

    /// A refused status change; cancelling a job that already started is
    /// "too late", not a fault.
    pub fn is_invalid_transition(&self) -> bool {
        self.code == ErrorCode::InvalidTransition
    }

    /// Log a failed API request: server faults at error, conflicts at warn,
    /// bad input at debug.
    fn log_rejection(&self) {
        let status = self.http_status().as_u16();
        match self.http_status() {
            s if s.is_server_error() => tracing::error!(
                code = %self.code,
                status,
                message = %self.message,
                cause = ?self.cause,
                source = ?self.source,
                "Request failed"
            ),
            StatusCode::CONFLICT => {
                tracing::warn!(code = %self.code, status, message = %self.message, "Request rejected")
            }
            _ => tracing::debug!(code = %self.code, status, message = %self.message, "Request rejected"),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// HTTP
// ═══════════════════════════════════════════════════════════════════════════════

/// `{"success": false, "error": {...}}`
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub success: bool,
    pub error: ErrorInfo,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub code: ErrorCode,
    pub numeric_code: u32,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<ErrorDetails>,
    pub timestamp: DateTime<Utc>,
}

impl From<&JobsError> for ErrorResponse {
    fn from(error: &JobsError) -> Self {
        Self {
            success: false,
            error: ErrorInfo {
                code: error.code,
                numeric_code: error.code.numeric_code(),
                message: error.message.to_string(),
                details: (!error.details.is_empty()).then(|| error.details.clone()),
                timestamp: Utc::now(),
            },
        }
    }
}

impl IntoResponse for JobsError {
    fn into_response(self) -> Response {
        self.log_rejection();
        (self.http_status(), Json(ErrorResponse::from(&self))).into_response()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Conversions
// ═══════════════════════════════════════════════════════════════════════════════

impl From<sqlx::Error> for JobsError {
    fn from(error: sqlx::Error) -> Self {
        let duplicate = matches!(&error, sqlx::Error::Database(db) if db.is_unique_violation());
        let converted = if duplicate {
            Self::new(ErrorCode::DuplicateId, "A record with this id already exists")
        } else {
            Self::new(ErrorCode::Storage, "Job storage is unavailable")
        };
        converted.with_cause(error.to_string()).with_source(error)
    }
}

impl From<sqlx::migrate::MigrateError> for JobsError {
    fn from(error: sqlx::migrate::MigrateError) -> Self {
        Self::storage(format!("migration failed: {}", error)).with_source(error)
    }
}

impl From<serde_json::Error> for JobsError {
    fn from(error: serde_json::Error) -> Self {
        Self::new(ErrorCode::Serialization, "Failed to process JSON data")
            .with_cause(error.to_string())
            .with_source(error)
    }
}

impl From<config::ConfigError> for JobsError {
    fn from(error: config::ConfigError) -> Self {
        Self::new(ErrorCode::Configuration, "Configuration error")
            .with_cause(error.to_string())
            .with_source(error)
    }
}

impl From<std::io::Error> for JobsError {
    fn from(error: std::io::Error) -> Self {
        Self::internal(error.to_string()).with_source(error)
    }
}
