//! The persisted job record and the identifiers used to refer to it.
use std::{fmt::Display, str::FromStr};

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;

pub mod builder;

/// The longest error message stored against a job, in characters.
pub const MAX_ERROR_MESSAGE_LEN: usize = 1000;

/// Durable identifier of a job, assigned by the store on insert.
#[derive(Debug, Eq, PartialEq, Ord, PartialOrd, Clone, Copy, Hash, Serialize, Deserialize)]
pub struct JobId(i64);

impl From<i64> for JobId {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

impl From<JobId> for i64 {
    fn from(value: JobId) -> Self {
        value.0
    }
}

impl Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "JobId({})", self.0)
    }
}

/// Identifies the runner instance holding a claim on a job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunnerId(String);

impl RunnerId {
    /// Generates a random identifier of the form `runner-<16 hex digits>`.
    pub fn generate() -> Self {
        Self(format!("runner-{:016x}", rand::thread_rng().gen::<u64>()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for RunnerId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for RunnerId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl Display for RunnerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lifecycle state of a job.
///
/// A job is created `Pending`, moves to `Running` when claimed and from there to `Completed`,
/// back to `Pending` for a retry, or to `DeadLetter`.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    /// Retained so that rows written by older deployments can still be read. Runners never
    /// write this status and treat it as terminal.
    Failed,
    DeadLetter,
}

impl JobStatus {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::DeadLetter => "dead_letter",
        }
    }

    /// Whether a job in this state still holds its idempotency key.
    pub const fn is_active(&self) -> bool {
        matches!(self, Self::Pending | Self::Running)
    }

    pub const fn is_terminal(&self) -> bool {
        !self.is_active()
    }
}

impl Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("Unknown job status: {0}")]
pub struct UnknownStatus(pub String);

impl FromStr for JobStatus {
    type Err = UnknownStatus;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "dead_letter" => Ok(Self::DeadLetter),
            other => Err(UnknownStatus(other.to_owned())),
        }
    }
}

/// A unit of deferred work as persisted by a [`crate::store::JobStore`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub job_type: String,
    pub payload: serde_json::Value,
    pub status: JobStatus,
    pub attempts: u16,
    pub max_attempts: u16,
    pub next_run_at: DateTime<Utc>,
    pub locked_by: Option<RunnerId>,
    pub locked_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub idempotency_key: Option<String>,
    pub error_message: Option<String>,
    pub result: Option<serde_json::Value>,
    pub inserted_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// True when the job's deadline has passed at `now`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|expires_at| expires_at <= now)
    }

    /// True when a runner may claim the job at `now`.
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Pending
            && self.next_run_at <= now
            && self.attempts < self.max_attempts
            && !self.is_expired(now)
    }

    /// True once the attempt ceiling is reached; a failure now dead-letters the job.
    pub fn is_final_attempt(&self) -> bool {
        self.attempts >= self.max_attempts
    }

    /// Decodes the payload into a concrete type.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        T::deserialize(&self.payload)
    }
}

/// Replaces control characters and bounds the message to [`MAX_ERROR_MESSAGE_LEN`] characters.
pub fn sanitize_error_message(message: &str) -> String {
    const ELLIPSIS: &str = "...";

    let cleaned = message
        .chars()
        .map(|c| if c.is_control() { ' ' } else { c });
    if message.chars().count() <= MAX_ERROR_MESSAGE_LEN {
        return cleaned.collect();
    }
    let mut truncated: String = cleaned
        .take(MAX_ERROR_MESSAGE_LEN - ELLIPSIS.len())
        .collect();
    truncated.push_str(ELLIPSIS);
    truncated
}
