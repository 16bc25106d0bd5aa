//! Durable persistence of jobs.
//!
//! A [`JobStore`] is the single source of truth for job state. Every transition is a conditional
//! write so that several runners can share one store without further coordination.
use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use thiserror::Error;

use crate::job::{Job, JobId, JobStatus, RunnerId};

pub mod memory;
mod queryable;
pub mod testing;

#[async_trait]
pub trait JobStore: Send + Sync {
    /// Persists a new `pending` job.
    ///
    /// When the job carries an idempotency key and an active job already holds that key within
    /// the job's [`IdempotencyScope`], nothing is written and the existing id is returned as
    /// [`Inserted::Existing`].
    async fn insert(&self, job: NewJob) -> Result<Inserted, StoreError>;

    /// Atomically claims up to `limit` due jobs for `runner_id`, earliest `next_run_at` first.
    ///
    /// Claimed jobs are `running`, locked by `runner_id` at `now` and have had their attempt
    /// counter incremented. No job is returned to two concurrent callers.
    async fn claim_next_batch(
        &self,
        runner_id: &RunnerId,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<Job>, StoreError>;

    /// Recovers jobs abandoned by crashed runners and dead-letters expired jobs.
    ///
    /// Active jobs whose `expires_at` has passed move to `dead_letter`. Running jobs locked
    /// before `now - threshold` return to `pending`, or move to `dead_letter` when the
    /// abandoned attempt was their last.
    async fn reclaim_stale(
        &self,
        threshold: TimeDelta,
        now: DateTime<Utc>,
    ) -> Result<Vec<ReclaimedJob>, StoreError>;

    /// Marks a job owned by `runner_id` as completed.
    async fn mark_completed(
        &self,
        id: JobId,
        runner_id: &RunnerId,
        result: Option<serde_json::Value>,
    ) -> Result<(), StoreError>;

    /// Returns a job owned by `runner_id` to `pending` until `next_run_at`.
    ///
    /// The stored `next_run_at` never moves backwards. A job with no attempts left is
    /// dead-lettered instead; the resulting status is returned.
    async fn mark_retry(
        &self,
        id: JobId,
        runner_id: &RunnerId,
        next_run_at: DateTime<Utc>,
        error_message: &str,
    ) -> Result<JobStatus, StoreError>;

    /// Moves a job owned by `runner_id` to `dead_letter`.
    async fn mark_dead_letter(
        &self,
        id: JobId,
        runner_id: &RunnerId,
        error_message: &str,
    ) -> Result<(), StoreError>;

    /// Returns all jobs matching the query ordered by id.
    async fn query<'a>(&self, query: Query<'a>) -> Result<Vec<Job>, StoreError>;

    async fn get(&self, id: JobId) -> Result<Option<Job>, StoreError> {
        Ok(self.query(Query::IdEquals(id)).await?.pop())
    }
}

/// A job ready to be inserted into a [`JobStore`].
#[derive(Debug, Clone, PartialEq)]
pub struct NewJob {
    pub job_type: String,
    pub payload: serde_json::Value,
    pub max_attempts: u16,
    pub next_run_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub idempotency_key: Option<String>,
    pub idempotency_scope: IdempotencyScope,
}

/// Which jobs an idempotency key is compared against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum IdempotencyScope {
    /// Keys only collide with active jobs of the same type.
    #[default]
    JobType,
    /// Keys collide with active jobs of any type.
    Global,
}

/// The outcome of [`JobStore::insert`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Inserted {
    Created(JobId),
    Existing(JobId),
}

impl Inserted {
    pub fn id(&self) -> JobId {
        match self {
            Self::Created(id) | Self::Existing(id) => *id,
        }
    }

    pub fn is_created(&self) -> bool {
        matches!(self, Self::Created(_))
    }
}

/// A job transitioned by [`JobStore::reclaim_stale`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReclaimedJob {
    pub id: JobId,
    pub job_type: String,
    pub attempts: u16,
    /// The status the job was moved to.
    pub status: JobStatus,
    pub reason: ReclaimReason,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReclaimReason {
    Expired,
    StaleLock,
}

impl ReclaimReason {
    /// The message recorded against a job reclaimed for this reason.
    pub fn error_message(&self) -> &'static str {
        match self {
            Self::Expired => "expired: deadline passed before the job completed",
            Self::StaleLock => "stale lock: runner stopped responding",
        }
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    /// The store could not be reached. The operation may be retried.
    #[error("Job store unavailable: {0}")]
    Unavailable(String),
    /// The job is no longer `running` under the caller's lock.
    #[error("Lock on {0} is no longer held by this runner")]
    LockLost(JobId),
    #[error("Job not found: {0}")]
    JobNotFound(JobId),
    #[error("Error encoding or decoding data")]
    EncodeDecode(#[from] serde_json::Error),
    #[error("Job store in bad state")]
    BadState,
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

/// A filter over stored jobs.
///
/// An empty [`Query::And`] matches every job and an empty [`Query::Or`] matches none.
#[derive(Debug, Clone, PartialEq)]
pub enum Query<'a> {
    All,
    Not(Box<Query<'a>>),
    And(Vec<Query<'a>>),
    Or(Vec<Query<'a>>),
    IdEquals(JobId),
    JobTypeEqual(&'a str),
    StatusEqual(JobStatus),
    IdempotencyKeyEqual(&'a str),
    PayloadEquals(serde_json::Value),
    NextRunAtBefore(DateTime<Utc>),
    NextRunAtAfter(DateTime<Utc>),
}
