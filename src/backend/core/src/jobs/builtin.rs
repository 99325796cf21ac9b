//! Built-in tasks, handy for smoke tests and operations.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::time::Duration;

use super::registry::{TaskContext, TaskError, TaskHandler, TaskRegistry, TaskResult};

/// Task: return the job's arguments unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct EchoTask;

#[async_trait]
impl TaskHandler for EchoTask {
    async fn execute(&self, ctx: TaskContext) -> TaskResult {
        Ok(json!({
            "args": ctx.args,
            "kwargs": ctx.kwargs,
        }))
    }
}

/// Task: sleep for `seconds` (keyword, default 1), stopping early on cancellation.
#[derive(Debug, Clone, Copy, Default)]
pub struct SleepTask;

#[async_trait]
impl TaskHandler for SleepTask {
    async fn execute(&self, mut ctx: TaskContext) -> TaskResult {
        let seconds: f64 = ctx.kwarg_opt("seconds")?.unwrap_or(1.0);
        let duration = Duration::try_from_secs_f64(seconds).map_err(|_| {
            TaskError::fatal("seconds must be a non-negative number within range").with_kind("ArgumentError")
        })?;
        tokio::select! {
            _ = tokio::time::sleep(duration) => Ok(json!({ "slept_seconds": seconds })),
            _ = ctx.cancelled() => Err(TaskError::new("sleep cancelled").with_kind("Cancelled")),
        }
    }
}

/// Task: do nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopTask;

#[async_trait]
impl TaskHandler for NoopTask {
    async fn execute(&self, _ctx: TaskContext) -> TaskResult {
        Ok(Value::Null)
    }
}

/// Task: always fail with `message`; `fatal: true` skips retries.
#[derive(Debug, Clone, Copy, Default)]
pub struct FailTask;

#[async_trait]
impl TaskHandler for FailTask {
    async fn execute(&self, ctx: TaskContext) -> TaskResult {
        let message: String = ctx
            .kwarg_opt("message")?
            .unwrap_or_else(|| "requested failure".to_string());
        let fatal: bool = ctx.kwarg_opt("fatal")?.unwrap_or(false);
        Err(if fatal {
            TaskError::fatal(message)
        } else {
            TaskError::new(message)
        })
    }
}

/// Register every built-in task under its conventional name.
pub fn register_builtins(registry: &TaskRegistry) {
    registry
        .register("echo", EchoTask)
        .register("sleep", SleepTask)
        .register("noop", NoopTask)
        .register("fail", FailTask);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::job::NewJob;
    use chrono::Utc;
    use tokio::sync::watch;
    use tokio_test::{assert_pending, assert_ready_err};

    fn run_ctx(job: NewJob) -> (watch::Sender<bool>, TaskContext) {
        let (tx, rx) = watch::channel(false);
        (tx, TaskContext::new(&job.into_job(Utc::now()), rx))
    }

    #[tokio::test]
    async fn test_echo() {
        let (_tx, ctx) = run_ctx(NewJob::new("echo").args(vec![json!(1)]).kwarg("k", json!("v")));
        let result = EchoTask.execute(ctx).await.unwrap();
        assert_eq!(result, json!({"args": [1], "kwargs": {"k": "v"}}));
    }

    #[tokio::test]
    async fn test_sleep_stops_on_cancellation() {
        let (tx, ctx) = run_ctx(NewJob::new("sleep").kwarg("seconds", json!(30)));
        let task = SleepTask;
        let mut sleep = tokio_test::task::spawn(task.execute(ctx));
        assert_pending!(sleep.poll());

        tx.send(true).unwrap();
        assert!(sleep.is_woken());
        let err = assert_ready_err!(sleep.poll());
        assert_eq!(err.kind, "Cancelled");
    }

    #[tokio::test]
    async fn test_sleep_rejects_bad_durations() {
        for seconds in [json!(-1), json!(1e30)] {
            let (_tx, ctx) = run_ctx(NewJob::new("sleep").kwarg("seconds", seconds));
            let err = SleepTask.execute(ctx).await.unwrap_err();
            assert!(err.fatal);
            assert_eq!(err.kind, "ArgumentError");
        }
    }

    #[tokio::test]
    async fn test_fail() {
        let (_tx, ctx) = run_ctx(NewJob::new("fail").kwarg("fatal", json!(true)));
        let err = FailTask.execute(ctx).await.unwrap_err();
        assert!(err.fatal);
        assert_eq!(err.message, "requested failure");
    }

    #[test]
    fn test_register_builtins() {
        let registry = TaskRegistry::new();
        register_builtins(&registry);
        assert_eq!(registry.task_names(), vec!["echo", "fail", "noop", "sleep"]);
    }
}
