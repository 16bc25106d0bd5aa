use crate::job::Job;

use super::{IdempotencyScope, NewJob, Query};

pub(super) trait Queryable {
    fn matches(&self, job: &Job) -> bool;
}

impl Queryable for Query<'_> {
    fn matches(&self, job: &Job) -> bool {
        match self {
            Query::All => true,
            Query::Not(inner) => !inner.matches(job),
            Query::And(inner) => inner.iter().all(|query| query.matches(job)),
            Query::Or(inner) => inner.iter().any(|query| query.matches(job)),
            Query::IdEquals(id) => job.id == *id,
            Query::JobTypeEqual(job_type) => job.job_type == *job_type,
            Query::StatusEqual(status) => job.status == *status,
            Query::IdempotencyKeyEqual(key) => job.idempotency_key.as_deref() == Some(*key),
            Query::PayloadEquals(payload) => &job.payload == payload,
            Query::NextRunAtBefore(next_run_at) => job.next_run_at < *next_run_at,
            Query::NextRunAtAfter(next_run_at) => job.next_run_at > *next_run_at,
        }
    }
}

/// A new job matches the active jobs its idempotency key collides with.
impl Queryable for NewJob {
    fn matches(&self, job: &Job) -> bool {
        let Some(key) = self.idempotency_key.as_deref() else {
            return false;
        };
        job.status.is_active()
            && job.idempotency_key.as_deref() == Some(key)
            && match self.idempotency_scope {
                IdempotencyScope::JobType => job.job_type == self.job_type,
                IdempotencyScope::Global => true,
            }
    }
}
