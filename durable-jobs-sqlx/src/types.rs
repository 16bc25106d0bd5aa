use chrono::{DateTime, Utc};
use durable_jobs::{
    job::{Job, JobId, RunnerId},
    store::{ReclaimReason, ReclaimedJob, StoreError},
};

#[derive(sqlx::Type, Debug, Clone, Copy, PartialEq, Eq)]
#[sqlx(type_name = "durable_job_status", rename_all = "snake_case")]
pub(crate) enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    DeadLetter,
}

impl From<JobStatus> for durable_jobs::job::JobStatus {
    fn from(value: JobStatus) -> Self {
        match value {
            JobStatus::Pending => Self::Pending,
            JobStatus::Running => Self::Running,
            JobStatus::Completed => Self::Completed,
            JobStatus::Failed => Self::Failed,
            JobStatus::DeadLetter => Self::DeadLetter,
        }
    }
}

impl From<durable_jobs::job::JobStatus> for JobStatus {
    fn from(value: durable_jobs::job::JobStatus) -> Self {
        match value {
            durable_jobs::job::JobStatus::Pending => Self::Pending,
            durable_jobs::job::JobStatus::Running => Self::Running,
            durable_jobs::job::JobStatus::Completed => Self::Completed,
            durable_jobs::job::JobStatus::Failed => Self::Failed,
            durable_jobs::job::JobStatus::DeadLetter => Self::DeadLetter,
        }
    }
}

#[derive(sqlx::FromRow, Debug)]
pub(crate) struct JobRow {
    pub id: i64,
    pub job_type: String,
    pub payload: serde_json::Value,
    pub status: JobStatus,
    pub attempts: i32,
    pub max_attempts: i32,
    pub next_run_at: DateTime<Utc>,
    pub locked_by: Option<String>,
    pub locked_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub idempotency_key: Option<String>,
    pub error_message: Option<String>,
    pub result: Option<serde_json::Value>,
    pub inserted_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

fn attempts(value: i32) -> Result<u16, StoreError> {
    u16::try_from(value).map_err(|_| StoreError::BadState)
}

impl TryFrom<JobRow> for Job {
    type Error = StoreError;

    fn try_from(value: JobRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: value.id.into(),
            job_type: value.job_type,
            payload: value.payload,
            status: value.status.into(),
            attempts: attempts(value.attempts)?,
            max_attempts: attempts(value.max_attempts)?,
            next_run_at: value.next_run_at,
            locked_by: value.locked_by.map(RunnerId::from),
            locked_at: value.locked_at,
            expires_at: value.expires_at,
            idempotency_key: value.idempotency_key,
            error_message: value.error_message,
            result: value.result,
            inserted_at: value.inserted_at,
            updated_at: value.updated_at,
        })
    }
}

#[derive(sqlx::FromRow, Debug)]
pub(crate) struct ReclaimedRow {
    pub id: i64,
    pub job_type: String,
    pub attempts: i32,
    pub status: JobStatus,
}

impl ReclaimedRow {
    pub(crate) fn into_reclaimed(self, reason: ReclaimReason) -> Result<ReclaimedJob, StoreError> {
        Ok(ReclaimedJob {
            id: JobId::from(self.id),
            job_type: self.job_type,
            attempts: attempts(self.attempts)?,
            status: self.status.into(),
            reason,
        })
    }
}
