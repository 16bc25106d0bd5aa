use std::{fmt::Display, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use tokio::{task::JoinError, time::Instant};
use tracing::{instrument, Instrument};

use crate::{
    backoff::Strategy,
    events::JobEvent,
    handler::{ExecutionError, ExecutionResult, JobHandler},
    job::{Job, JobStatus},
    retry::retry_transient,
    store::{JobStore, StoreError},
};

use super::JobRunner;

/// Why a job execution failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    /// No handler is registered for the job type.
    ConfigurationFault,
    /// The handler reported an error that may succeed on retry.
    Transient,
    /// The handler reported that the job can never succeed.
    Permanent,
    Timeout,
    Panic,
}

impl FailureKind {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::ConfigurationFault => "configuration fault",
            Self::Transient => "transient failure",
            Self::Permanent => "permanent failure",
            Self::Timeout => "timeout",
            Self::Panic => "panic",
        }
    }

    /// Whether a job failing this way is retried while it has attempts left.
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient | Self::Timeout | Self::Panic)
    }
}

impl Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failed execution, recorded against the job as `"{kind}: {message}"`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Failure {
    pub kind: FailureKind,
    pub message: String,
}

impl Failure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    fn missing_handler(job_type: &str) -> Self {
        Self::new(
            FailureKind::ConfigurationFault,
            format!("no handler registered for job type '{job_type}'"),
        )
    }

    fn timeout(timeout: Duration) -> Self {
        Self::new(
            FailureKind::Timeout,
            format!("job failed to complete within {timeout:?}"),
        )
    }
}

impl Display for Failure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl From<JoinError> for Failure {
    fn from(value: JoinError) -> Self {
        let msg = value.to_string();
        let message = match value.try_into_panic() {
            Ok(panic) => panic
                .downcast_ref::<&str>()
                .map(ToString::to_string)
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or(msg),
            Err(_) => msg,
        };
        Self::new(FailureKind::Panic, message)
    }
}

impl From<Box<dyn ExecutionError>> for Failure {
    fn from(value: Box<dyn ExecutionError>) -> Self {
        Self::new(FailureKind::Transient, value.to_string())
    }
}

impl<S> JobRunner<S>
where
    S: JobStore + Clone + 'static,
{
    #[instrument(skip(self, job), fields(job_id = %job.id, job_type = %job.job_type, attempt = job.attempts))]
    pub(super) async fn execute_job(&self, job: Job) {
        let Some(handler) = self.registry.get(&job.job_type) else {
            self.dead_letter(&job, Failure::missing_handler(&job.job_type), None)
                .await;
            return;
        };

        let started = Instant::now();
        let outcome = self.invoke(handler.clone(), job.clone()).await;
        let duration = started.elapsed();

        match outcome {
            Ok(ExecutionResult::Done { result }) => self.complete(&job, result, duration).await,
            Ok(ExecutionResult::Discard { reason }) => {
                let failure = Failure::new(FailureKind::Permanent, reason);
                self.dead_letter(&job, failure, Some(duration)).await
            }
            Ok(ExecutionResult::Error { error }) => {
                tracing::debug!(error_type = error.error_type(), "Handler returned an error");
                self.fail(&job, handler.as_ref(), error.into(), duration)
                    .await
            }
            Err(failure) => {
                self.fail(&job, handler.as_ref(), failure, duration)
                    .await
            }
        }
    }

    /// Runs the handler in its own task so that panics and timeouts cannot reach the runner.
    ///
    /// The deadline is enforced on the task rather than inside it, so it also holds for blocking
    /// handlers that never yield. A blocking handler that overruns keeps its thread until it
    /// returns, but its job is released.
    async fn invoke(
        &self,
        handler: Arc<dyn JobHandler>,
        job: Job,
    ) -> Result<ExecutionResult, Failure> {
        let timeout = self.config.handler_timeout(handler.timeout(&job));
        let blocking = handler.is_blocking();
        let job_id = job.id;

        let fut = async move { handler.handle(&job).await }.in_current_span();

        let mut task = if blocking {
            tracing::debug!(%job_id, "Executing blocking job {job_id}");
            tokio::task::spawn_blocking(|| futures::executor::block_on(fut))
        } else {
            tracing::debug!(%job_id, "Executing job {job_id}");
            tokio::spawn(fut)
        };

        match tokio::time::timeout(timeout, &mut task).await {
            Ok(joined) => Ok(joined?),
            Err(_elapsed) => {
                task.abort();
                Err(Failure::timeout(timeout))
            }
        }
    }

    async fn complete(&self, job: &Job, result: Option<serde_json::Value>, duration: Duration) {
        let job_id = job.id;
        tracing::debug!(%job_id, ?duration, "Job complete {job_id}");
        let outcome = retry_transient(&self.config.store_retry, "mark_completed", || {
            self.store
                .mark_completed(job_id, &self.runner_id, result.clone())
        })
        .await;

        match outcome {
            Ok(()) => self.events.emit(
                JobEvent::new(job_id, &job.job_type, JobStatus::Completed, job.attempts)
                    .with_duration(duration),
            ),
            Err(error) => self.store_error(job, "completed", error),
        }
    }

    async fn fail(&self, job: &Job, handler: &dyn JobHandler, failure: Failure, duration: Duration) {
        if !failure.kind.is_retryable() || job.is_final_attempt() {
            return self.dead_letter(job, failure, Some(duration)).await;
        }

        let job_id = job.id;
        let delay = handler
            .backoff(job)
            .unwrap_or_else(|| self.config.backoff.backoff(job.attempts));
        let next_run_at = Utc::now()
            .checked_add_signed(delay)
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        let message = failure.to_string();
        tracing::warn!(
            %job_id,
            kind = %failure.kind,
            "Job {job_id} failed and will be retried in {delay}: {}",
            failure.message
        );

        let outcome = retry_transient(&self.config.store_retry, "mark_retry", || {
            self.store
                .mark_retry(job_id, &self.runner_id, next_run_at, &message)
        })
        .await;

        match outcome {
            Ok(status) => self.events.emit(
                JobEvent::new(job_id, &job.job_type, status, job.attempts).with_duration(duration),
            ),
            Err(error) => self.store_error(job, "retryable", error),
        }
    }

    async fn dead_letter(&self, job: &Job, failure: Failure, duration: Option<Duration>) {
        let job_id = job.id;
        let message = failure.to_string();
        tracing::error!(
            %job_id,
            kind = %failure.kind,
            "Job {job_id} failed and will be dead-lettered: {}",
            failure.message
        );

        let outcome = retry_transient(&self.config.store_retry, "mark_dead_letter", || {
            self.store
                .mark_dead_letter(job_id, &self.runner_id, &message)
        })
        .await;

        match outcome {
            Ok(()) => {
                let event = JobEvent::new(job_id, &job.job_type, JobStatus::DeadLetter, job.attempts);
                self.events.emit(match duration {
                    Some(duration) => event.with_duration(duration),
                    None => event,
                })
            }
            Err(error) => self.store_error(job, "dead-lettered", error),
        }
    }

    fn store_error(&self, job: &Job, outcome: &str, error: StoreError) {
        let job_id = job.id;
        match error {
            StoreError::LockLost(_) => tracing::debug!(
                %job_id,
                "Lock on {job_id} was lost before it could be marked {outcome}, discarding the outcome"
            ),
            error => tracing::error!(
                ?error,
                %job_id,
                "Failed to mark job {job_id} as {outcome}, error: {error:?}"
            ),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::handler::HandlerError;

    #[test]
    fn failures_render_kind_and_message() {
        let failure = Failure::missing_handler("unregistered_type");
        assert_eq!(
            failure.to_string(),
            "configuration fault: no handler registered for job type 'unregistered_type'"
        );
        assert!(!failure.kind.is_retryable());
    }

    #[test]
    fn execution_errors_are_transient() {
        let error: Box<dyn ExecutionError> = Box::new(HandlerError::new("smtp refused"));
        let failure = Failure::from(error);
        assert_eq!(failure.kind, FailureKind::Transient);
        assert_eq!(failure.to_string(), "transient failure: smtp refused");
        assert!(failure.kind.is_retryable());
    }

    #[tokio::test]
    async fn panics_are_captured() {
        let error = tokio::spawn(async { panic!("boom") }).await.unwrap_err();
        let failure = Failure::from(error);
        assert_eq!(failure.kind, FailureKind::Panic);
        assert_eq!(failure.message, "boom");
    }

    #[test]
    fn only_handler_failures_are_retryable() {
        assert!(FailureKind::Timeout.is_retryable());
        assert!(FailureKind::Panic.is_retryable());
        assert!(!FailureKind::Permanent.is_retryable());
        assert!(!FailureKind::ConfigurationFault.is_retryable());
    }
}
