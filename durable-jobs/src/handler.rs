//! Job handlers and the registry mapping job types to them.
use std::{
    collections::HashMap, error::Error, fmt::Display, future::Future, sync::Arc, time::Duration,
};

use async_trait::async_trait;
use chrono::TimeDelta;
use serde::Serialize;
use thiserror::Error;

use crate::{
    executor::{Executor, ExecutorHandler},
    job::Job,
};

/// Executes jobs of one type.
///
/// Jobs are delivered at least once, so handlers must tolerate being run again for the same job.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: &Job) -> ExecutionResult;

    /// Upper bound on a single invocation. Falls back to the runner's default when [`None`].
    fn timeout(&self, _job: &Job) -> Option<Duration> {
        None
    }

    /// Delay before retrying a failed attempt. Falls back to the runner's backoff when [`None`].
    fn backoff(&self, _job: &Job) -> Option<TimeDelta> {
        None
    }

    /// Set for computationally expensive handlers; they are run via
    /// [`tokio::task::spawn_blocking`] to avoid stalling the async runtime.
    fn is_blocking(&self) -> bool {
        false
    }
}

/// The outcome of one handler invocation.
pub enum ExecutionResult {
    /// The job succeeded, optionally producing a result to persist.
    Done { result: Option<serde_json::Value> },
    /// A transient failure. The job is retried while attempts remain.
    Error { error: Box<dyn ExecutionError> },
    /// A permanent failure. The job is dead-lettered without further attempts.
    Discard { reason: String },
}

impl ExecutionResult {
    pub fn done() -> Self {
        Self::Done { result: None }
    }

    /// Succeeds with a result. A result that cannot be serialized discards the job.
    pub fn done_with(result: impl Serialize) -> Self {
        match serde_json::to_value(result) {
            Ok(result) => Self::Done {
                result: Some(result),
            },
            Err(error) => Self::discard(format!("result could not be encoded: {error}")),
        }
    }

    pub fn discard(reason: impl Display) -> Self {
        Self::Discard {
            reason: reason.to_string(),
        }
    }
}

impl<T> From<T> for ExecutionResult
where
    T: ExecutionError + 'static,
{
    fn from(value: T) -> Self {
        Self::Error {
            error: Box::new(value),
        }
    }
}

impl std::fmt::Debug for ExecutionResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Done { result } => f.debug_struct("Done").field("result", result).finish(),
            Self::Error { error } => f
                .debug_struct("Error")
                .field("error_type", &error.error_type())
                .field("message", &error.to_string())
                .finish(),
            Self::Discard { reason } => f.debug_struct("Discard").field("reason", reason).finish(),
        }
    }
}

pub trait ExecutionError: Error + Send {
    fn error_type(&self) -> &'static str;
}

/// A general purpose transient error for handlers that have no error type of their own.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct HandlerError {
    message: String,
}

impl HandlerError {
    pub fn new(message: impl Display) -> Self {
        Self {
            message: message.to_string(),
        }
    }
}

impl ExecutionError for HandlerError {
    fn error_type(&self) -> &'static str {
        "handler"
    }
}

/// Adapts an async closure over the job payload into a [`JobHandler`].
pub struct FnHandler<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> JobHandler for FnHandler<F>
where
    F: Fn(serde_json::Value) -> Fut + Send + Sync,
    Fut: Future<Output = ExecutionResult> + Send,
{
    async fn handle(&self, job: &Job) -> ExecutionResult {
        (self.f)(job.payload.clone()).await
    }
}

/// Explicit mapping from job type to handler.
///
/// Built once at start-up and handed to each runner.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn JobHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` for `job_type`, returning any handler it replaced.
    pub fn register(
        &mut self,
        job_type: impl Into<String>,
        handler: Arc<dyn JobHandler>,
    ) -> Option<Arc<dyn JobHandler>> {
        let job_type = job_type.into();
        let previous = self.handlers.insert(job_type.clone(), handler);
        if previous.is_some() {
            tracing::warn!(%job_type, "Replaced the handler registered for {job_type}");
        }
        previous
    }

    pub fn with_handler(
        mut self,
        job_type: impl Into<String>,
        handler: impl JobHandler + 'static,
    ) -> Self {
        self.register(job_type, Arc::new(handler));
        self
    }

    /// Registers an async closure receiving the job payload.
    pub fn register_fn<F, Fut>(
        &mut self,
        job_type: impl Into<String>,
        f: F,
    ) -> Option<Arc<dyn JobHandler>>
    where
        F: Fn(serde_json::Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ExecutionResult> + Send + 'static,
    {
        self.register(job_type, Arc::new(FnHandler { f }))
    }

    pub fn with_fn<F, Fut>(mut self, job_type: impl Into<String>, f: F) -> Self
    where
        F: Fn(serde_json::Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ExecutionResult> + Send + 'static,
    {
        self.register_fn(job_type, f);
        self
    }

    /// Registers a typed [`Executor`] under [`Executor::NAME`].
    pub fn with_executor<E: Executor>(self, executor: E) -> Self {
        self.with_handler(E::NAME, ExecutorHandler::new(executor))
    }

    pub fn get(&self, job_type: &str) -> Option<Arc<dyn JobHandler>> {
        self.handlers.get(job_type).cloned()
    }

    pub fn contains(&self, job_type: &str) -> bool {
        self.handlers.contains_key(job_type)
    }

    pub fn job_types(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut job_types: Vec<_> = self.job_types().collect();
        job_types.sort_unstable();
        f.debug_struct("HandlerRegistry")
            .field("job_types", &job_types)
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod test {
    use assert_matches::assert_matches;

    use super::*;

    pub(crate) struct Succeed;

    #[async_trait]
    impl JobHandler for Succeed {
        async fn handle(&self, _job: &Job) -> ExecutionResult {
            ExecutionResult::done()
        }
    }

    #[tokio::test]
    async fn register_and_get() {
        let registry = HandlerRegistry::new().with_handler("send_email", Succeed);

        assert!(registry.contains("send_email"));
        assert!(registry.get("resize_image").is_none());
        let handler = registry.get("send_email").unwrap();
        assert_matches!(
            handler.handle(&Job::raw_job()).await,
            ExecutionResult::Done { result: None }
        );
    }

    #[tokio::test]
    async fn register_replaces_existing_handler() {
        let mut registry = HandlerRegistry::new();
        assert!(registry.register("send_email", Arc::new(Succeed)).is_none());
        assert!(registry.register("send_email", Arc::new(Succeed)).is_some());
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn fn_handler_receives_payload() {
        let registry = HandlerRegistry::new().with_fn("send_email", |payload| async move {
            match payload.get("to").and_then(|to| to.as_str()) {
                Some(to) => ExecutionResult::done_with(format!("sent to {to}")),
                None => ExecutionResult::discard("missing recipient"),
            }
        });

        let handler = registry.get("send_email").unwrap();
        assert_matches!(
            handler.handle(&Job::raw_job()).await,
            ExecutionResult::Done { result: Some(serde_json::Value::String(sent)) } if sent == "sent to user@example.com"
        );

        let job = Job {
            payload: serde_json::json!({}),
            ..Job::raw_job()
        };
        assert_matches!(
            handler.handle(&job).await,
            ExecutionResult::Discard { reason } if reason == "missing recipient"
        );
    }

    #[test]
    fn errors_convert_into_execution_results() {
        let result: ExecutionResult = HandlerError::new("smtp refused").into();
        assert_matches!(
            result,
            ExecutionResult::Error { error } if error.error_type() == "handler" && error.to_string() == "smtp refused"
        );
    }

    #[test]
    fn debug_lists_job_types() {
        let registry = HandlerRegistry::new()
            .with_handler("send_email", Succeed)
            .with_handler("audit_export", Succeed);
        assert_eq!(
            format!("{registry:?}"),
            r#"HandlerRegistry { job_types: ["audit_export", "send_email"] }"#
        );
    }
}
