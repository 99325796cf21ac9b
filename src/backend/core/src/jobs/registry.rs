//! Task registry: maps task names to handlers.
//!
//! Handlers are registered explicitly at startup and looked up by name at
//! dispatch time. A miss fails the job with `UnknownTaskError`.

use async_trait::async_trait;
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::watch;

use super::job::{Job, JobFailure, JobId};
use crate::error::JobsError;

/// Failure kind recorded for plain handler errors.
pub const TASK_ERROR_KIND: &str = "TaskError";

// ═══════════════════════════════════════════════════════════════════════════════
// Task Error
// ═══════════════════════════════════════════════════════════════════════════════

/// Error returned by a task handler.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskError {
    pub message: String,
    pub kind: String,
    /// Fatal errors skip any remaining retries
    pub fatal: bool,
    pub context: Option<Value>,
}

impl TaskError {
    /// A failure that may be retried.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind: TASK_ERROR_KIND.to_string(),
            fatal: false,
            context: None,
        }
    }

    /// A failure that retrying cannot fix.
    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            fatal: true,
            ..Self::new(message)
        }
    }

    pub fn with_kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = kind.into();
        self
    }

    pub fn with_context(mut self, context: Value) -> Self {
        self.context = Some(context);
        self
    }

    pub fn to_failure(&self) -> JobFailure {
        JobFailure {
            message: self.message.clone(),
            kind: self.kind.clone(),
            context: self.context.clone(),
        }
    }
}

impl fmt::Display for TaskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for TaskError {}

impl From<serde_json::Error> for TaskError {
    fn from(e: serde_json::Error) -> Self {
        Self::fatal(e.to_string()).with_kind("ArgumentError")
    }
}

impl From<anyhow::Error> for TaskError {
    fn from(e: anyhow::Error) -> Self {
        Self::new(format!("{:#}", e))
    }
}

impl From<JobsError> for TaskError {
    fn from(e: JobsError) -> Self {
        let error = Self::new(e.message()).with_kind(e.code().as_str());
        if e.is_retryable() {
            error
        } else {
            Self { fatal: true, ..error }
        }
    }
}

pub type TaskResult = std::result::Result<Value, TaskError>;

// ═══════════════════════════════════════════════════════════════════════════════
// Task Context
// ═══════════════════════════════════════════════════════════════════════════════

/// Everything a handler gets to see about the job it runs.
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub job_id: JobId,
    pub task_name: String,
    pub queue_name: String,
    /// 1 for the first attempt, 2 for the first retry, ...
    pub attempt: u32,
    pub args: Vec<Value>,
    pub kwargs: Map<String, Value>,
    pub metadata: Map<String, Value>,
    pub tags: BTreeSet<String>,
    cancellation: watch::Receiver<bool>,
}

impl TaskContext {
    pub fn new(job: &Job, cancellation: watch::Receiver<bool>) -> Self {
        Self {
            job_id: job.id,
            task_name: job.task_name.clone(),
            queue_name: job.queue_name.clone(),
            attempt: job.retries + 1,
            args: job.args.clone(),
            kwargs: job.kwargs.clone(),
            metadata: job.metadata.clone(),
            tags: job.tags.clone(),
            cancellation,
        }
    }

    /// Positional argument `index`, deserialized.
    pub fn arg<T: DeserializeOwned>(&self, index: usize) -> Result<T, TaskError> {
        let value = self.args.get(index).cloned().ok_or_else(|| {
            TaskError::fatal(format!("missing positional argument {}", index)).with_kind("ArgumentError")
        })?;
        Ok(serde_json::from_value(value)?)
    }

    /// Keyword argument `name`, deserialized.
    pub fn kwarg<T: DeserializeOwned>(&self, name: &str) -> Result<T, TaskError> {
        let value = self.kwargs.get(name).cloned().ok_or_else(|| {
            TaskError::fatal(format!("missing keyword argument '{}'", name)).with_kind("ArgumentError")
        })?;
        Ok(serde_json::from_value(value)?)
    }

    /// Keyword argument `name`, or `None` when absent.
    pub fn kwarg_opt<T: DeserializeOwned>(&self, name: &str) -> Result<Option<T>, TaskError> {
        match self.kwargs.get(name) {
            Some(value) => Ok(Some(serde_json::from_value(value.clone())?)),
            None => Ok(None),
        }
    }

    /// Whether the engine has asked this task to stop.
    pub fn is_cancelled(&self) -> bool {
        *self.cancellation.borrow()
    }

    /// Resolves once cancellation is requested.
    pub async fn cancelled(&mut self) {
        while !*self.cancellation.borrow() {
            if self.cancellation.changed().await.is_err() {
                // sender gone: the engine dropped this attempt
                return;
            }
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Handlers
// ═══════════════════════════════════════════════════════════════════════════════

/// A function the engine can run for jobs with a given `task_name`.
#[async_trait]
pub trait TaskHandler: Send + Sync + 'static {
    async fn execute(&self, ctx: TaskContext) -> TaskResult;
}

struct FnHandler<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> TaskHandler for FnHandler<F>
where
    F: Fn(TaskContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = TaskResult> + Send + 'static,
{
    async fn execute(&self, ctx: TaskContext) -> TaskResult {
        (self.f)(ctx).await
    }
}

/// Name to handler mapping shared by every worker.
#[derive(Default, Clone)]
pub struct TaskRegistry {
    handlers: Arc<DashMap<String, Arc<dyn TaskHandler>>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler, replacing any previous one with the same name.
    pub fn register(&self, name: impl Into<String>, handler: impl TaskHandler) -> &Self {
        let name = name.into();
        if self.handlers.insert(name.clone(), Arc::new(handler)).is_some() {
            tracing::warn!(task = %name, "Replaced existing task handler");
        }
        self
    }

    /// Register an async closure as a handler.
    pub fn register_fn<F, Fut>(&self, name: impl Into<String>, f: F) -> &Self
    where
        F: Fn(TaskContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = TaskResult> + Send + 'static,
    {
        self.register(name, FnHandler { f })
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.get(name).map(|h| Arc::clone(h.value()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    /// Registered task names, sorted.
    pub fn task_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl fmt::Debug for TaskRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskRegistry")
            .field("tasks", &self.task_names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::job::NewJob;
    use chrono::Utc;
    use serde_json::json;

    fn context(job: NewJob) -> TaskContext {
        let (_tx, rx) = watch::channel(false);
        TaskContext::new(&job.into_job(Utc::now()), rx)
    }

    #[tokio::test]
    async fn test_register_and_dispatch() {
        let registry = TaskRegistry::new();
        registry.register_fn("double", |ctx: TaskContext| async move {
            let n: i64 = ctx.arg(0)?;
            Ok::<_, TaskError>(json!(n * 2))
        });

        assert!(registry.contains("double"));
        assert_eq!(registry.task_names(), vec!["double".to_string()]);

        let handler = registry.get("double").unwrap();
        let result = handler
            .execute(context(NewJob::new("double").args(vec![json!(21)])))
            .await
            .unwrap();
        assert_eq!(result, json!(42));
        assert!(registry.get("missing").is_none());
    }

    #[test]
    fn test_context_arguments() {
        let ctx = context(
            NewJob::new("send_email")
                .args(vec![json!("a@b.c")])
                .kwarg("retries", json!(2)),
        );
        assert_eq!(ctx.attempt, 1);
        assert_eq!(ctx.arg::<String>(0).unwrap(), "a@b.c");
        assert_eq!(ctx.kwarg::<u32>("retries").unwrap(), 2);
        assert_eq!(ctx.kwarg_opt::<u32>("absent").unwrap(), None);

        let missing = ctx.arg::<String>(3).unwrap_err();
        assert!(missing.fatal);
        let wrong_type = ctx.kwarg::<String>("retries").unwrap_err();
        assert_eq!(wrong_type.kind, "ArgumentError");
    }

    #[test]
    fn test_task_error_failure_record() {
        let failure = TaskError::new("smtp down")
            .with_context(json!({"host": "mail"}))
            .to_failure();
        assert_eq!(failure.kind, TASK_ERROR_KIND);
        assert_eq!(failure.message, "smtp down");
        assert_eq!(failure.context, Some(json!({"host": "mail"})));
        assert!(TaskError::fatal("bad input").fatal);
    }

    #[tokio::test]
    async fn test_context_cancellation() {
        let (tx, rx) = watch::channel(false);
        let mut ctx = TaskContext::new(&NewJob::new("t").into_job(Utc::now()), rx);
        assert!(!ctx.is_cancelled());
        tx.send(true).unwrap();
        ctx.cancelled().await;
        assert!(ctx.is_cancelled());
    }
}
