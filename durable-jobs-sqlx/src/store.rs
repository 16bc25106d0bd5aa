use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use durable_jobs::{
    job::{Job, JobId, JobStatus, RunnerId},
    store::{Inserted, JobStore, NewJob, Query, ReclaimedJob, StoreError},
};

use crate::{is_unique_violation, map_err, PgJobStore};

impl PgJobStore {
    /// An update matching no row either lost its lock or targeted a missing job.
    async fn handle_update(&self, rows_affected: u64, id: JobId) -> Result<(), StoreError> {
        match rows_affected {
            0 => Err(self.missed_update(id).await),
            1 => Ok(()),
            _ => Err(StoreError::BadState),
        }
    }

    async fn missed_update(&self, id: JobId) -> StoreError {
        match self.exists(id).await {
            Ok(true) => StoreError::LockLost(id),
            Ok(false) => StoreError::JobNotFound(id),
            Err(error) => map_err(error),
        }
    }
}

#[async_trait]
impl JobStore for PgJobStore {
    #[tracing::instrument(skip(self, job), fields(job_type = %job.job_type))]
    async fn insert(&self, job: NewJob) -> Result<Inserted, StoreError> {
        match self.insert_job(&job).await {
            Ok(inserted) => Ok(inserted),
            Err(error) if is_unique_violation(&error) => self
                .existing_job_after_conflict(&job)
                .await
                .map_err(map_err)?
                .map(Inserted::Existing)
                .ok_or(StoreError::BadState),
            Err(error) => Err(map_err(error)),
        }
    }

    async fn claim_next_batch(
        &self,
        runner_id: &RunnerId,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<Job>, StoreError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut jobs = self
            .claim(runner_id, limit, now)
            .await
            .map_err(map_err)?
            .into_iter()
            .map(Job::try_from)
            .collect::<Result<Vec<_>, _>>()?;
        jobs.sort_by(|a, b| a.next_run_at.cmp(&b.next_run_at).then(a.id.cmp(&b.id)));
        Ok(jobs)
    }

    async fn reclaim_stale(
        &self,
        threshold: TimeDelta,
        now: DateTime<Utc>,
    ) -> Result<Vec<ReclaimedJob>, StoreError> {
        self.reclaim(threshold, now).await
    }

    async fn mark_completed(
        &self,
        id: JobId,
        runner_id: &RunnerId,
        result: Option<serde_json::Value>,
    ) -> Result<(), StoreError> {
        let rows_affected = self
            .complete(id, runner_id, result)
            .await
            .map_err(map_err)?;
        self.handle_update(rows_affected, id).await
    }

    async fn mark_retry(
        &self,
        id: JobId,
        runner_id: &RunnerId,
        next_run_at: DateTime<Utc>,
        error_message: &str,
    ) -> Result<JobStatus, StoreError> {
        match self
            .retry(id, runner_id, next_run_at, error_message)
            .await
            .map_err(map_err)?
        {
            Some(status) => Ok(status.into()),
            None => Err(self.missed_update(id).await),
        }
    }

    async fn mark_dead_letter(
        &self,
        id: JobId,
        runner_id: &RunnerId,
        error_message: &str,
    ) -> Result<(), StoreError> {
        let rows_affected = self
            .dead_letter(id, runner_id, error_message)
            .await
            .map_err(map_err)?;
        self.handle_update(rows_affected, id).await
    }

    async fn query<'a>(&self, query: Query<'a>) -> Result<Vec<Job>, StoreError> {
        self.run_query(&query)
            .await
            .map_err(map_err)?
            .into_iter()
            .map(TryFrom::try_from)
            .collect()
    }
}
