//! Observability hooks emitted on every job state transition.
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;

use crate::job::{JobId, JobStatus};

/// A job entered `status`.
///
/// `duration` is the time spent in the handler for transitions that follow an execution.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobEvent {
    pub job_id: JobId,
    pub job_type: String,
    pub status: JobStatus,
    pub attempts: u16,
    pub duration: Option<Duration>,
    pub occurred_at: DateTime<Utc>,
}

impl JobEvent {
    pub fn new(job_id: JobId, job_type: impl Into<String>, status: JobStatus, attempts: u16) -> Self {
        Self {
            job_id,
            job_type: job_type.into(),
            status,
            attempts,
            duration: None,
            occurred_at: Utc::now(),
        }
    }

    pub fn with_duration(self, duration: Duration) -> Self {
        Self {
            duration: Some(duration),
            ..self
        }
    }

    /// Counter name for metrics backends, e.g. `jobs.send_email.completed`.
    pub fn metric_name(&self) -> String {
        format!("jobs.{}.{}", self.job_type, self.status)
    }
}

/// Receives [`JobEvent`]s. Implementations must not block.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: JobEvent);
}

/// Emits each event as a structured `tracing` event at info level.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn emit(&self, event: JobEvent) {
        tracing::info!(
            target: "durable_jobs::events",
            job_id = %event.job_id,
            job_type = %event.job_type,
            status = %event.status,
            attempts = event.attempts,
            duration_ms = event.duration.map(|duration| duration.as_millis() as u64),
            metric = %event.metric_name(),
            "Job {} is {}",
            event.job_id,
            event.status,
        );
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopEventSink;

impl EventSink for NoopEventSink {
    fn emit(&self, _event: JobEvent) {}
}

/// Forwards events to a channel, for consumers such as metrics exporters or tests.
#[derive(Debug, Clone)]
pub struct ChannelEventSink {
    sender: mpsc::UnboundedSender<JobEvent>,
}

impl ChannelEventSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<JobEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

impl EventSink for ChannelEventSink {
    fn emit(&self, event: JobEvent) {
        if self.sender.send(event).is_err() {
            tracing::trace!("Dropped job event, receiver closed");
        }
    }
}
