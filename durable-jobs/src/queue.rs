//! The enqueue facing API.
use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;
use tokio::sync::Notify;

use crate::{
    cache::{CacheMirror, JobPointer, NoopCache},
    config::QueueConfig,
    events::{EventSink, JobEvent, TracingEventSink},
    job::{Job, JobId, JobStatus},
    retry::retry_transient,
    store::{IdempotencyScope, Inserted, JobStore, NewJob, Query},
    JobsError,
};

/// The longest accepted job type, in characters.
pub const MAX_JOB_TYPE_LEN: usize = 100;
/// The longest accepted idempotency key, in characters.
pub const MAX_IDEMPOTENCY_KEY_LEN: usize = 255;

/// Optional settings for [`JobQueue::enqueue`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EnqueueOptions {
    pub idempotency_key: Option<String>,
    /// How long after enqueueing the job first becomes due.
    pub delay: TimeDelta,
    /// Falls back to [`QueueConfig::default_max_attempts`].
    pub max_attempts: Option<u16>,
    pub expires_at: Option<DateTime<Utc>>,
    /// Falls back to [`QueueConfig::idempotency_scope`].
    pub idempotency_scope: Option<IdempotencyScope>,
}

impl EnqueueOptions {
    pub fn with_idempotency_key(self, key: impl Into<String>) -> Self {
        Self {
            idempotency_key: Some(key.into()),
            ..self
        }
    }

    pub fn with_delay(self, delay: TimeDelta) -> Self {
        Self { delay, ..self }
    }

    pub fn with_max_attempts(self, max_attempts: u16) -> Self {
        Self {
            max_attempts: Some(max_attempts),
            ..self
        }
    }

    pub fn with_expires_at(self, expires_at: DateTime<Utc>) -> Self {
        Self {
            expires_at: Some(expires_at),
            ..self
        }
    }

    pub fn with_idempotency_scope(self, scope: IdempotencyScope) -> Self {
        Self {
            idempotency_scope: Some(scope),
            ..self
        }
    }
}

/// Accepts new jobs and exposes read access to the store.
///
/// Cloning is cheap; clones share the store, cache and event sink.
#[derive(Clone)]
pub struct JobQueue<S> {
    store: S,
    cache: Arc<dyn CacheMirror>,
    events: Arc<dyn EventSink>,
    config: QueueConfig,
    waker: Option<Arc<Notify>>,
}

impl<S> JobQueue<S>
where
    S: JobStore,
{
    pub fn new(store: S) -> Self {
        Self {
            store,
            cache: Arc::new(NoopCache),
            events: Arc::new(TracingEventSink),
            config: QueueConfig::default(),
            waker: None,
        }
    }

    pub fn with_cache(self, cache: Arc<dyn CacheMirror>) -> Self {
        Self { cache, ..self }
    }

    pub fn with_event_sink(self, events: Arc<dyn EventSink>) -> Self {
        Self { events, ..self }
    }

    pub fn with_config(self, config: QueueConfig) -> Self {
        Self { config, ..self }
    }

    /// Runners sharing this signal are woken when a job is created.
    pub fn with_waker(self, waker: Arc<Notify>) -> Self {
        Self {
            waker: Some(waker),
            ..self
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Submits a job, returning its id.
    ///
    /// When `options` carries an idempotency key already held by an active job, the id of that
    /// job is returned and nothing new is persisted.
    pub async fn enqueue(
        &self,
        job_type: &str,
        payload: impl Serialize,
        options: EnqueueOptions,
    ) -> Result<JobId, JobsError> {
        let payload = serde_json::to_value(payload)?;
        let job = self.new_job(job_type, payload, options)?;
        let due_at = job.next_run_at;

        let inserted = retry_transient(&self.config.store_retry, "insert", || {
            self.store.insert(job.clone())
        })
        .await
        .inspect_err(|error| {
            tracing::error!(?error, %job_type, "Failed to enqueue {job_type} job: {error}")
        })?;

        match inserted {
            Inserted::Created(id) => {
                tracing::debug!(job_id = %id, %job_type, "Enqueued {id}");
                let _ = self
                    .cache
                    .record(JobPointer { due_at, id })
                    .await
                    .inspect_err(|error| {
                        tracing::warn!(?error, job_id = %id, "Failed to mirror {id} to the cache")
                    });
                self.events
                    .emit(JobEvent::new(id, job_type, JobStatus::Pending, 0));
                if let Some(waker) = &self.waker {
                    waker.notify_one();
                }
            }
            Inserted::Existing(id) => {
                tracing::debug!(
                    job_id = %id,
                    %job_type,
                    "Idempotency key already held by {id}, returning the existing job"
                );
            }
        }

        Ok(inserted.id())
    }

    fn new_job(
        &self,
        job_type: &str,
        payload: serde_json::Value,
        options: EnqueueOptions,
    ) -> Result<NewJob, JobsError> {
        if job_type.trim().is_empty() {
            return Err(JobsError::InvalidJob("job_type must not be empty".to_owned()));
        }
        if job_type.chars().count() > MAX_JOB_TYPE_LEN {
            return Err(JobsError::InvalidJob(format!(
                "job_type must be at most {MAX_JOB_TYPE_LEN} characters"
            )));
        }
        if let Some(key) = &options.idempotency_key {
            if key.is_empty() || key.chars().count() > MAX_IDEMPOTENCY_KEY_LEN {
                return Err(JobsError::InvalidJob(format!(
                    "idempotency_key must be between 1 and {MAX_IDEMPOTENCY_KEY_LEN} characters"
                )));
            }
        }
        if options.delay < TimeDelta::zero() {
            return Err(JobsError::InvalidJob("delay must not be negative".to_owned()));
        }
        let max_attempts = options
            .max_attempts
            .unwrap_or(self.config.default_max_attempts);
        if max_attempts == 0 {
            return Err(JobsError::InvalidJob(
                "max_attempts must be at least 1".to_owned(),
            ));
        }

        Ok(NewJob {
            job_type: job_type.to_owned(),
            payload,
            max_attempts,
            next_run_at: Utc::now() + options.delay,
            expires_at: options.expires_at,
            idempotency_key: options.idempotency_key,
            idempotency_scope: options
                .idempotency_scope
                .unwrap_or(self.config.idempotency_scope),
        })
    }

    pub async fn job(&self, id: JobId) -> Result<Option<Job>, JobsError> {
        Ok(self.store.get(id).await?)
    }

    /// Dead-lettered jobs, optionally restricted to one job type.
    pub async fn dead_letters(&self, job_type: Option<&str>) -> Result<Vec<Job>, JobsError> {
        let status = Query::StatusEqual(JobStatus::DeadLetter);
        let query = match job_type {
            Some(job_type) => Query::And(vec![status, Query::JobTypeEqual(job_type)]),
            None => status,
        };
        Ok(self.store.query(query).await?)
    }

    /// Up to `limit` pending jobs, earliest due first.
    pub async fn pending(&self, limit: usize) -> Result<Vec<Job>, JobsError> {
        let mut jobs = self
            .store
            .query(Query::StatusEqual(JobStatus::Pending))
            .await?;
        jobs.sort_by_key(|job| (job.next_run_at, job.id));
        jobs.truncate(limit);
        Ok(jobs)
    }

    pub async fn query(&self, query: Query<'_>) -> Result<Vec<Job>, JobsError> {
        Ok(self.store.query(query).await?)
    }
}

impl<S> std::fmt::Debug for JobQueue<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobQueue")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
