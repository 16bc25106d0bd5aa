//! Provides an in memory implementation of [`JobStore`].
//!
//! It is not optimized, instead it is designed to be a correct implementation for use in tests
//! and local development. Jobs are lost when the process exits.
use std::sync::{
    atomic::{AtomicI64, AtomicUsize, Ordering},
    Arc, RwLock,
};

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};

use crate::job::{sanitize_error_message, Job, JobId, JobStatus, RunnerId};

use super::{
    queryable::Queryable, Inserted, JobStore, NewJob, Query, ReclaimReason, ReclaimedJob,
    StoreError,
};

/// An in memory implementation of [`JobStore`].
///
/// **This is not designed for use in a production systems.**
#[derive(Clone, Default)]
pub struct InMemoryJobStore {
    jobs: Arc<RwLock<Vec<Job>>>,
    id_counter: Arc<AtomicI64>,
    outages: Arc<AtomicUsize>,
}

impl InMemoryJobStore {
    /// Creates a new, empty, instance of [`InMemoryJobStore`].
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `operations` calls fail with [`StoreError::Unavailable`].
    ///
    /// Useful for exercising the retry and degraded polling paths of callers.
    pub fn simulate_outage(&self, operations: usize) {
        self.outages.store(operations, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), StoreError> {
        match self
            .outages
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |remaining| {
                remaining.checked_sub(1)
            }) {
            Ok(_) => Err(StoreError::Unavailable("simulated outage".to_owned())),
            Err(_) => Ok(()),
        }
    }

    fn owned_job<'a>(
        jobs: &'a mut [Job],
        id: JobId,
        runner_id: &RunnerId,
    ) -> Result<&'a mut Job, StoreError> {
        match jobs.iter_mut().find(|job| job.id == id) {
            None => Err(StoreError::JobNotFound(id)),
            Some(job) if !job.is_locked_by(runner_id) => Err(StoreError::LockLost(id)),
            Some(job) => Ok(job),
        }
    }
}

impl NewJob {
    fn into_job(self, id: JobId, now: DateTime<Utc>) -> Job {
        Job {
            id,
            job_type: self.job_type,
            payload: self.payload,
            status: JobStatus::Pending,
            attempts: 0,
            max_attempts: self.max_attempts,
            next_run_at: self.next_run_at,
            locked_by: None,
            locked_at: None,
            expires_at: self.expires_at,
            idempotency_key: self.idempotency_key,
            error_message: None,
            result: None,
            inserted_at: now,
            updated_at: now,
        }
    }
}

impl Job {
    fn is_locked_by(&self, runner_id: &RunnerId) -> bool {
        self.status == JobStatus::Running && self.locked_by.as_ref() == Some(runner_id)
    }

    fn is_stale(&self, cutoff: DateTime<Utc>) -> bool {
        self.status == JobStatus::Running && self.locked_at.is_some_and(|at| at < cutoff)
    }

    fn release(&mut self, status: JobStatus, now: DateTime<Utc>) {
        self.status = status;
        self.locked_by = None;
        self.locked_at = None;
        self.updated_at = now;
    }

    fn mark_running(&mut self, runner_id: &RunnerId, now: DateTime<Utc>) {
        self.status = JobStatus::Running;
        self.locked_by = Some(runner_id.clone());
        self.locked_at = Some(now);
        self.attempts += 1;
        self.updated_at = now;
    }

    fn mark_completed(&mut self, result: Option<serde_json::Value>) {
        self.result = result;
        self.release(JobStatus::Completed, Utc::now());
    }

    fn mark_pending(&mut self, next_run_at: DateTime<Utc>, error_message: &str) {
        self.next_run_at = self.next_run_at.max(next_run_at);
        self.error_message = Some(sanitize_error_message(error_message));
        self.release(JobStatus::Pending, Utc::now());
    }

    fn mark_dead_letter(&mut self, error_message: &str, now: DateTime<Utc>) {
        self.error_message = Some(sanitize_error_message(error_message));
        self.release(JobStatus::DeadLetter, now);
    }

    fn reclaimed(&self, reason: ReclaimReason) -> ReclaimedJob {
        ReclaimedJob {
            id: self.id,
            job_type: self.job_type.clone(),
            attempts: self.attempts,
            status: self.status,
            reason,
        }
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn insert(&self, job: NewJob) -> Result<Inserted, StoreError> {
        self.check_available()?;
        let mut jobs = self.jobs.write().map_err(|_| StoreError::BadState)?;
        if let Some(existing) = jobs.iter().find(|existing| job.matches(existing)) {
            return Ok(Inserted::Existing(existing.id));
        }
        let id = JobId::from(self.id_counter.fetch_add(1, Ordering::SeqCst) + 1);
        jobs.push(job.into_job(id, Utc::now()));
        Ok(Inserted::Created(id))
    }

    async fn claim_next_batch(
        &self,
        runner_id: &RunnerId,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<Job>, StoreError> {
        self.check_available()?;
        let mut jobs = self.jobs.write().map_err(|_| StoreError::BadState)?;
        let mut claimable = jobs
            .iter_mut()
            .filter(|job| job.is_claimable(now))
            .collect::<Vec<_>>();
        claimable.sort_by(|a, b| a.next_run_at.cmp(&b.next_run_at).then(a.id.cmp(&b.id)));
        Ok(claimable
            .into_iter()
            .take(limit)
            .map(|job| {
                job.mark_running(runner_id, now);
                job.clone()
            })
            .collect())
    }

    async fn reclaim_stale(
        &self,
        threshold: TimeDelta,
        now: DateTime<Utc>,
    ) -> Result<Vec<ReclaimedJob>, StoreError> {
        self.check_available()?;
        let cutoff = now - threshold;
        let mut jobs = self.jobs.write().map_err(|_| StoreError::BadState)?;
        let mut reclaimed = Vec::new();
        for job in jobs.iter_mut() {
            if job.status.is_active() && job.is_expired(now) {
                job.mark_dead_letter(ReclaimReason::Expired.error_message(), now);
                reclaimed.push(job.reclaimed(ReclaimReason::Expired));
            } else if job.is_stale(cutoff) {
                let message = ReclaimReason::StaleLock.error_message();
                if job.is_final_attempt() {
                    job.mark_dead_letter(message, now);
                } else {
                    job.mark_pending(now, message);
                }
                reclaimed.push(job.reclaimed(ReclaimReason::StaleLock));
            }
        }
        Ok(reclaimed)
    }

    async fn mark_completed(
        &self,
        id: JobId,
        runner_id: &RunnerId,
        result: Option<serde_json::Value>,
    ) -> Result<(), StoreError> {
        self.check_available()?;
        let mut jobs = self.jobs.write().map_err(|_| StoreError::BadState)?;
        Self::owned_job(&mut jobs, id, runner_id)?.mark_completed(result);
        Ok(())
    }

    async fn mark_retry(
        &self,
        id: JobId,
        runner_id: &RunnerId,
        next_run_at: DateTime<Utc>,
        error_message: &str,
    ) -> Result<JobStatus, StoreError> {
        self.check_available()?;
        let mut jobs = self.jobs.write().map_err(|_| StoreError::BadState)?;
        let job = Self::owned_job(&mut jobs, id, runner_id)?;
        if job.is_final_attempt() {
            job.mark_dead_letter(error_message, Utc::now());
        } else {
            job.mark_pending(next_run_at, error_message);
        }
        Ok(job.status)
    }

    async fn mark_dead_letter(
        &self,
        id: JobId,
        runner_id: &RunnerId,
        error_message: &str,
    ) -> Result<(), StoreError> {
        self.check_available()?;
        let mut jobs = self.jobs.write().map_err(|_| StoreError::BadState)?;
        Self::owned_job(&mut jobs, id, runner_id)?.mark_dead_letter(error_message, Utc::now());
        Ok(())
    }

    async fn query<'a>(&self, query: Query<'a>) -> Result<Vec<Job>, StoreError> {
        self.check_available()?;
        Ok(self
            .jobs
            .read()
            .map_err(|_| StoreError::BadState)?
            .iter()
            .filter(|job| query.matches(job))
            .cloned()
            .collect())
    }
}
