//! Durable background jobs.
//!
//! Jobs are persisted in a [`store::JobStore`] by a [`queue::JobQueue`] and executed by one or
//! more [`runner::JobRunner`]s which dispatch each job to the handler registered for its type in
//! a [`handler::HandlerRegistry`]. Failed jobs are retried with backoff until their attempts are
//! exhausted and then moved to a dead letter state, jobs abandoned by crashed runners are
//! reclaimed, and every state transition is reported to an [`events::EventSink`].
//!
//! Execution is at least once: a handler may run more than once for the same job and should be
//! idempotent.
//!
//! # Example
//!
//! ```
//! # use durable_jobs::prelude::*;
//! # use std::time::Duration;
//! # tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(async {
//! let registry = HandlerRegistry::new().with_fn("send_email", |payload| async move {
//!     match payload.get("to").and_then(|to| to.as_str()) {
//!         Some(_to) => ExecutionResult::done(),
//!         None => ExecutionResult::discard("missing recipient"),
//!     }
//! });
//!
//! let mut jobs = DurableJobs::new(InMemoryJobStore::new())
//!     .with_runner(registry, RunnerConfig::default().with_poll_interval(Duration::from_millis(10)))
//!     .unwrap();
//!
//! let job_id = jobs
//!     .queue()
//!     .enqueue(
//!         "send_email",
//!         serde_json::json!({"to": "user@example.com"}),
//!         EnqueueOptions::default().with_idempotency_key("welcome-42"),
//!     )
//!     .await
//!     .unwrap();
//!
//! # tokio::time::sleep(Duration::from_millis(100)).await;
//! jobs.graceful_shutdown().await.unwrap();
//! # assert_eq!(jobs.queue().job(job_id).await.unwrap().unwrap().status, JobStatus::Completed);
//! # });
//! ```
use std::sync::Arc;

use cache::{CacheMirror, NoopCache};
use config::{QueueConfig, RunnerConfig};
use events::{EventSink, TracingEventSink};
use handler::HandlerRegistry;
use queue::JobQueue;
use runner::{JobRunner, RunnerHandle};
use store::{JobStore, StoreError};
use thiserror::Error;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

pub mod backoff;
pub mod cache;
pub mod config;
pub mod events;
pub mod executor;
pub mod handler;
pub mod job;
pub mod prelude;
pub mod queue;
mod retry;
pub mod runner;
pub mod store;
pub mod testing;

/// Wires a store, a queue and any number of runners together.
///
/// Runners added with [`DurableJobs::with_runner`] share the queue's cache mirror, event sink and
/// wake signal, so a job enqueued through [`DurableJobs::queue`] is picked up without waiting for
/// the next poll.
pub struct DurableJobs<S: JobStore> {
    queue: JobQueue<S>,
    cache: Arc<dyn CacheMirror>,
    events: Arc<dyn EventSink>,
    wake: Arc<Notify>,
    runners: Vec<RunnerHandle>,
    cancellation_token: CancellationToken,
}

impl<S> DurableJobs<S>
where
    S: JobStore + Clone + 'static,
{
    pub fn new(store: S) -> Self {
        let cache: Arc<dyn CacheMirror> = Arc::new(NoopCache);
        let events: Arc<dyn EventSink> = Arc::new(TracingEventSink);
        let wake = Arc::new(Notify::new());
        Self {
            queue: JobQueue::new(store)
                .with_cache(cache.clone())
                .with_event_sink(events.clone())
                .with_waker(wake.clone()),
            cache,
            events,
            wake,
            runners: Vec::new(),
            cancellation_token: CancellationToken::new(),
        }
    }

    /// Sets the cache mirror used by the queue and by runners added afterwards.
    pub fn with_cache(self, cache: Arc<dyn CacheMirror>) -> Self {
        Self {
            queue: self.queue.with_cache(cache.clone()),
            cache,
            ..self
        }
    }

    /// Sets the event sink used by the queue and by runners added afterwards.
    pub fn with_event_sink(self, events: Arc<dyn EventSink>) -> Self {
        Self {
            queue: self.queue.with_event_sink(events.clone()),
            events,
            ..self
        }
    }

    pub fn with_queue_config(self, config: QueueConfig) -> Self {
        Self {
            queue: self.queue.with_config(config),
            ..self
        }
    }

    /// Spawns a runner executing jobs with the handlers in `registry`.
    pub fn with_runner(
        mut self,
        registry: HandlerRegistry,
        config: RunnerConfig,
    ) -> Result<Self, JobsError> {
        let runner = JobRunner::new(self.queue.store().clone(), registry, config)?
            .with_cache(self.cache.clone())
            .with_event_sink(self.events.clone())
            .with_waker(self.wake.clone());
        self.runners
            .push(runner.spawn(self.cancellation_token.child_token()));
        Ok(self)
    }

    pub fn queue(&self) -> &JobQueue<S> {
        &self.queue
    }

    pub fn waker(&self) -> Arc<Notify> {
        self.wake.clone()
    }

    /// Stops every runner, waiting for in-flight jobs up to each runner's shutdown timeout.
    pub async fn graceful_shutdown(&mut self) -> Result<(), JobsError> {
        tracing::debug!("Shutting down {} job runners", self.runners.len());
        self.cancellation_token.cancel();
        futures::future::join_all(
            self.runners
                .iter_mut()
                .map(RunnerHandle::graceful_shutdown),
        )
        .await
        .into_iter()
        .collect()
    }
}

impl<S: JobStore> std::fmt::Debug for DurableJobs<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DurableJobs")
            .field("queue", &self.queue)
            .field("runners", &self.runners)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Error)]
pub enum JobsError {
    #[error("Invalid job: {0}")]
    InvalidJob(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("Error encoding or decoding value")]
    Encode(#[from] serde_json::Error),
    #[error("Error communicating with the job store")]
    Store(#[from] StoreError),
    #[error("Failed to gracefully shut down")]
    GracefulShutdownFailed,
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::{
        cache::InMemoryCache,
        events::ChannelEventSink,
        handler::test::Succeed,
        job::JobStatus,
        queue::EnqueueOptions,
        store::memory::InMemoryJobStore,
    };

    #[tokio::test]
    async fn jobs_enqueued_through_the_queue_are_executed() {
        let cache = Arc::new(InMemoryCache::new());
        let (sink, mut events) = ChannelEventSink::new();
        let mut jobs = DurableJobs::new(InMemoryJobStore::new())
            .with_cache(cache.clone())
            .with_event_sink(Arc::new(sink))
            .with_runner(
                HandlerRegistry::new().with_handler("send_email", Succeed),
                RunnerConfig::default().with_poll_interval(Duration::from_secs(60)),
            )
            .unwrap();

        let id = jobs
            .queue()
            .enqueue("send_email", (), EnqueueOptions::default())
            .await
            .unwrap();

        let mut statuses = Vec::new();
        while let Some(event) = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .unwrap()
        {
            statuses.push(event.status);
            if event.status == JobStatus::Completed {
                break;
            }
        }
        jobs.graceful_shutdown().await.unwrap();

        assert_eq!(
            statuses,
            vec![JobStatus::Pending, JobStatus::Running, JobStatus::Completed]
        );
        assert_eq!(
            jobs.queue().job(id).await.unwrap().unwrap().status,
            JobStatus::Completed
        );
    }

    #[tokio::test]
    async fn invalid_runner_config_is_rejected() {
        let result = DurableJobs::new(InMemoryJobStore::new()).with_runner(
            HandlerRegistry::new(),
            RunnerConfig::default().with_max_concurrency(0),
        );
        assert!(matches!(result, Err(JobsError::InvalidConfig(_))));
    }

    #[tokio::test]
    async fn graceful_shutdown_without_runners() {
        let mut jobs = DurableJobs::new(InMemoryJobStore::new());
        assert!(jobs.graceful_shutdown().await.is_ok());
    }
}
