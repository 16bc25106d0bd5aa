//! The purpose of this module is to alleviate the need to import many of the `[durable_jobs]`
//! types.
//!
//! ```
//! # #![allow(unused_imports)]
//! use durable_jobs::prelude::*;
//! ```
pub use crate::backoff::BackoffStrategy;
pub use crate::backoff::Jitter;
pub use crate::backoff::Strategy;
pub use crate::cache::{CacheMirror, InMemoryCache, NoopCache};
pub use crate::config::{QueueConfig, RunnerConfig, StoreRetryPolicy};
pub use crate::events::{ChannelEventSink, EventSink, JobEvent, NoopEventSink, TracingEventSink};
pub use crate::executor::Executor;
pub use crate::handler::{ExecutionError, ExecutionResult, HandlerError, HandlerRegistry, JobHandler};
pub use crate::job::builder::JobBuilder;
pub use crate::job::{Job, JobId, JobStatus};
pub use crate::queue::{EnqueueOptions, JobQueue};
pub use crate::runner::JobRunner;
pub use crate::store::memory::InMemoryJobStore;
pub use crate::store::{IdempotencyScope, JobStore, Query};
pub use crate::DurableJobs;
pub use crate::JobsError;
