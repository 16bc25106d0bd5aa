//! Typed handlers with a statically known job type and payload.
use std::time::Duration;

use async_trait::async_trait;
use chrono::TimeDelta;
use serde::{de::DeserializeOwned, Serialize};

use crate::{
    handler::{ExecutionResult, JobHandler},
    job::{builder::JobBuilder, Job},
};

/// A typed job handler.
///
/// The payload of every job is decoded into [`Executor::Data`] before [`Executor::execute`] is
/// called. A payload that fails to decode can never succeed, so the job is dead-lettered.
///
/// # Example
///
/// ```
/// # use durable_jobs::prelude::*;
/// # use serde::{Deserialize, Serialize};
/// #[derive(Serialize, Deserialize)]
/// struct Email {
///     to: String,
/// }
///
/// struct SendEmail;
///
/// #[async_trait::async_trait]
/// impl Executor for SendEmail {
///     type Data = Email;
///     const NAME: &'static str = "send_email";
///
///     async fn execute(&self, email: Email, _job: &Job) -> ExecutionResult {
///         if email.to.contains('@') {
///             ExecutionResult::done()
///         } else {
///             ExecutionResult::discard("invalid address")
///         }
///     }
/// }
///
/// let registry = HandlerRegistry::new().with_executor(SendEmail);
/// assert!(registry.contains("send_email"));
/// ```
#[async_trait]
pub trait Executor: Send + Sync + 'static {
    /// The type of the job payload.
    ///
    /// If this is not needed it can be set to unit `()`.
    type Data: Serialize + DeserializeOwned + Send;
    /// The job type handled by this executor.
    ///
    /// Using a static string rather than the rust type name allows the type to be renamed
    /// without orphaning jobs already persisted.
    const NAME: &'static str;
    /// Overrides the queue's default attempt ceiling for jobs built with [`Executor::builder`].
    const MAX_ATTEMPTS: Option<u16> = None;
    /// Set for computationally expensive executors.
    ///
    /// Under the covers this results in the executor being ran via
    /// [`tokio::task::spawn_blocking`].
    const BLOCKING: bool = false;

    async fn execute(&self, data: Self::Data, job: &Job) -> ExecutionResult;

    fn timeout(&self, _job: &Job) -> Option<Duration> {
        None
    }

    fn backoff(&self, _job: &Job) -> Option<TimeDelta> {
        None
    }

    fn builder() -> JobBuilder
    where
        Self: Sized,
    {
        let builder = JobBuilder::new(Self::NAME);
        match Self::MAX_ATTEMPTS {
            Some(max_attempts) => builder.with_max_attempts(max_attempts),
            None => builder,
        }
    }
}

/// Adapts an [`Executor`] to the object safe [`JobHandler`] interface.
pub(crate) struct ExecutorHandler<E> {
    executor: E,
}

impl<E> ExecutorHandler<E> {
    pub(crate) fn new(executor: E) -> Self {
        Self { executor }
    }
}

#[async_trait]
impl<E: Executor> JobHandler for ExecutorHandler<E> {
    async fn handle(&self, job: &Job) -> ExecutionResult {
        match job.payload_as::<E::Data>() {
            Ok(data) => self.executor.execute(data, job).await,
            Err(error) => {
                tracing::error!(
                    job_id = %job.id,
                    ?error,
                    "Failed to decode payload of {} for {}",
                    job.id,
                    E::NAME
                );
                ExecutionResult::discard(format!("payload could not be decoded: {error}"))
            }
        }
    }

    fn timeout(&self, job: &Job) -> Option<Duration> {
        self.executor.timeout(job)
    }

    fn backoff(&self, job: &Job) -> Option<TimeDelta> {
        self.executor.backoff(job)
    }

    fn is_blocking(&self) -> bool {
        E::BLOCKING
    }
}
