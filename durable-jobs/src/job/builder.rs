use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;

use crate::{
    queue::{EnqueueOptions, JobQueue},
    store::JobStore,
    JobsError,
};

use super::JobId;

/// Fluent construction of a job, see also [`crate::executor::Executor::builder`].
///
/// # Example
///
/// ```
/// # use durable_jobs::prelude::*;
/// # use chrono::TimeDelta;
/// # tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(async {
/// let queue = JobQueue::new(InMemoryJobStore::new());
///
/// let job_id = JobBuilder::new("send_email")
///     .with_payload(serde_json::json!({"to": "user@example.com"}))
///     .with_idempotency_key("welcome-42")
///     .with_max_attempts(5)
///     .schedule_in(TimeDelta::minutes(10))
///     .enqueue(&queue)
///     .await
///     .unwrap();
///
/// assert_eq!(queue.job(job_id).await.unwrap().unwrap().max_attempts, 5);
/// # });
/// ```
#[derive(Debug)]
pub struct JobBuilder {
    job_type: String,
    payload: Result<serde_json::Value, serde_json::Error>,
    options: EnqueueOptions,
}

impl JobBuilder {
    pub fn new(job_type: impl Into<String>) -> Self {
        Self {
            job_type: job_type.into(),
            payload: Ok(serde_json::Value::Null),
            options: EnqueueOptions::default(),
        }
    }

    /// Sets the payload. An encoding failure is reported by [`JobBuilder::enqueue`].
    pub fn with_payload(self, payload: impl Serialize) -> Self {
        Self {
            payload: serde_json::to_value(payload),
            ..self
        }
    }

    pub fn with_idempotency_key(self, key: impl Into<String>) -> Self {
        Self {
            options: self.options.with_idempotency_key(key),
            ..self
        }
    }

    pub fn with_max_attempts(self, max_attempts: u16) -> Self {
        Self {
            options: self.options.with_max_attempts(max_attempts),
            ..self
        }
    }

    pub fn schedule_in(self, delay: TimeDelta) -> Self {
        Self {
            options: self.options.with_delay(delay),
            ..self
        }
    }

    pub fn expires_at(self, expires_at: DateTime<Utc>) -> Self {
        Self {
            options: self.options.with_expires_at(expires_at),
            ..self
        }
    }

    pub fn expires_in(self, ttl: TimeDelta) -> Self {
        self.expires_at(Utc::now() + ttl)
    }

    pub async fn enqueue<S>(self, queue: &JobQueue<S>) -> Result<JobId, JobsError>
    where
        S: JobStore + Clone,
    {
        queue
            .enqueue(&self.job_type, self.payload?, self.options)
            .await
    }
}
