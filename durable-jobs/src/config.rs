//! Runner and queue configuration.
//!
//! Every setting has a default, so `RunnerConfig::default()` is a working configuration.
//! Values are validated when a runner is constructed.
use std::{sync::Arc, time::Duration};

use chrono::TimeDelta;
use tokio::sync::Semaphore;

use crate::{
    backoff::{BackoffStrategy, Exponential, Strategy},
    job::RunnerId,
    store::IdempotencyScope,
    JobsError,
};

/// How transient store failures are retried before an operation gives up.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StoreRetryPolicy {
    /// Total attempts, including the first. `1` disables retrying.
    pub max_attempts: u16,
    pub backoff: BackoffStrategy<Exponential>,
}

impl StoreRetryPolicy {
    pub const fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::DEFAULT
        }
    }

    const DEFAULT: Self = Self {
        max_attempts: 5,
        backoff: BackoffStrategy::exponential(TimeDelta::milliseconds(100))
            .with_max(TimeDelta::seconds(5)),
    };
}

impl Default for StoreRetryPolicy {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// Configuration of a [`crate::runner::JobRunner`].
#[derive(Clone)]
pub struct RunnerConfig {
    /// Identity recorded in `locked_by`. Generated when unset.
    pub runner_id: Option<RunnerId>,
    /// Upper bound on concurrently executing jobs.
    pub max_concurrency: usize,
    /// Delay between polls when idle.
    pub poll_interval: Duration,
    /// Ceiling on the delay between polls while the store is failing.
    pub max_poll_backoff: Duration,
    pub reclaim_interval: Duration,
    /// How long a job may stay `running` before its lock is considered abandoned.
    pub stale_lock_threshold: TimeDelta,
    /// Timeout applied to handlers that do not define their own. Every timeout, including
    /// `None`, is capped by [`RunnerConfig::handler_timeout`].
    pub default_timeout: Option<Duration>,
    /// Delay before retrying a failed job, for handlers that do not define their own.
    pub backoff: Arc<dyn Strategy>,
    pub store_retry: StoreRetryPolicy,
    /// How long shutdown waits for in-flight jobs.
    pub shutdown_timeout: Duration,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            runner_id: None,
            max_concurrency: 5,
            poll_interval: Duration::from_secs(1),
            max_poll_backoff: Duration::from_secs(30),
            reclaim_interval: Duration::from_secs(30),
            stale_lock_threshold: TimeDelta::minutes(5),
            default_timeout: Some(Duration::from_secs(60)),
            backoff: Arc::new(
                BackoffStrategy::exponential(TimeDelta::seconds(2)).with_max(TimeDelta::hours(1)),
            ),
            store_retry: StoreRetryPolicy::default(),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl RunnerConfig {
    pub fn with_runner_id(self, runner_id: impl Into<RunnerId>) -> Self {
        Self {
            runner_id: Some(runner_id.into()),
            ..self
        }
    }

    pub fn with_max_concurrency(self, max_concurrency: usize) -> Self {
        Self {
            max_concurrency,
            ..self
        }
    }

    pub fn with_poll_interval(self, poll_interval: Duration) -> Self {
        Self {
            poll_interval,
            ..self
        }
    }

    pub fn with_max_poll_backoff(self, max_poll_backoff: Duration) -> Self {
        Self {
            max_poll_backoff,
            ..self
        }
    }

    pub fn with_reclaim_interval(self, reclaim_interval: Duration) -> Self {
        Self {
            reclaim_interval,
            ..self
        }
    }

    pub fn with_stale_lock_threshold(self, stale_lock_threshold: TimeDelta) -> Self {
        Self {
            stale_lock_threshold,
            ..self
        }
    }

    pub fn with_default_timeout(self, default_timeout: Option<Duration>) -> Self {
        Self {
            default_timeout,
            ..self
        }
    }

    pub fn with_backoff(self, backoff: impl Strategy + 'static) -> Self {
        Self {
            backoff: Arc::new(backoff),
            ..self
        }
    }

    pub fn with_store_retry(self, store_retry: StoreRetryPolicy) -> Self {
        Self {
            store_retry,
            ..self
        }
    }

    pub fn with_shutdown_timeout(self, shutdown_timeout: Duration) -> Self {
        Self {
            shutdown_timeout,
            ..self
        }
    }

    /// Rejects configurations a runner cannot operate under.
    ///
    /// The stale lock threshold must exceed the default timeout, otherwise jobs still executing
    /// within their timeout would be reclaimed from under their runner.
    pub fn validate(&self) -> Result<(), JobsError> {
        if self.max_concurrency == 0 {
            return Err(JobsError::InvalidConfig(
                "max_concurrency must be at least 1".to_owned(),
            ));
        }
        if self.poll_interval.is_zero() {
            return Err(JobsError::InvalidConfig(
                "poll_interval must be greater than zero".to_owned(),
            ));
        }
        if self.reclaim_interval.is_zero() {
            return Err(JobsError::InvalidConfig(
                "reclaim_interval must be greater than zero".to_owned(),
            ));
        }
        if self.stale_lock_threshold <= TimeDelta::zero() {
            return Err(JobsError::InvalidConfig(
                "stale_lock_threshold must be greater than zero".to_owned(),
            ));
        }
        if self.max_concurrency > Semaphore::MAX_PERMITS {
            return Err(JobsError::InvalidConfig(format!(
                "max_concurrency must not exceed {}",
                Semaphore::MAX_PERMITS
            )));
        }
        if let Some(timeout) = self.default_timeout {
            let exceeds = TimeDelta::from_std(timeout)
                .map(|timeout| self.stale_lock_threshold <= timeout)
                .unwrap_or(true);
            if exceeds {
                return Err(JobsError::InvalidConfig(format!(
                    "stale_lock_threshold ({}) must exceed default_timeout ({timeout:?})",
                    self.stale_lock_threshold
                )));
            }
        }
        Ok(())
    }

    /// Timeout for one handler invocation, given the handler's own.
    ///
    /// A handler may not outlive its lock: a job still running past the stale lock threshold
    /// would be reclaimed and run again. A tenth of the threshold is left for recording the
    /// outcome.
    pub fn handler_timeout(&self, requested: Option<Duration>) -> Duration {
        let threshold = self.stale_lock_threshold.to_std().unwrap_or(Duration::ZERO);
        let limit = threshold - threshold / 10;
        match requested.or(self.default_timeout) {
            Some(requested) => requested.min(limit),
            None => limit,
        }
    }

    /// Delay before the next poll after `consecutive_failures` failed polls in a row.
    pub(crate) fn degraded_poll_delay(&self, consecutive_failures: u32) -> Duration {
        let factor = 2u32.saturating_pow(consecutive_failures.min(16));
        self.poll_interval
            .saturating_mul(factor)
            .min(self.max_poll_backoff.max(self.poll_interval))
    }
}

impl std::fmt::Debug for RunnerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunnerConfig")
            .field("runner_id", &self.runner_id)
            .field("max_concurrency", &self.max_concurrency)
            .field("poll_interval", &self.poll_interval)
            .field("max_poll_backoff", &self.max_poll_backoff)
            .field("reclaim_interval", &self.reclaim_interval)
            .field("stale_lock_threshold", &self.stale_lock_threshold)
            .field("default_timeout", &self.default_timeout)
            .field("store_retry", &self.store_retry)
            .field("shutdown_timeout", &self.shutdown_timeout)
            .finish_non_exhaustive()
    }
}

/// Configuration of a [`crate::queue::JobQueue`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QueueConfig {
    /// Attempt ceiling for jobs enqueued without one.
    pub default_max_attempts: u16,
    pub idempotency_scope: IdempotencyScope,
    pub store_retry: StoreRetryPolicy,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            default_max_attempts: 3,
            idempotency_scope: IdempotencyScope::default(),
            store_retry: StoreRetryPolicy::default(),
        }
    }
}

impl QueueConfig {
    pub fn with_default_max_attempts(self, default_max_attempts: u16) -> Self {
        Self {
            default_max_attempts,
            ..self
        }
    }

    pub fn with_idempotency_scope(self, idempotency_scope: IdempotencyScope) -> Self {
        Self {
            idempotency_scope,
            ..self
        }
    }

    pub fn with_store_retry(self, store_retry: StoreRetryPolicy) -> Self {
        Self {
            store_retry,
            ..self
        }
    }
}

#[cfg(test)]
mod test {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(RunnerConfig::default().validate().is_ok());
    }

    #[test]
    fn zero_concurrency_is_rejected() {
        assert_matches!(
            RunnerConfig::default().with_max_concurrency(0).validate(),
            Err(JobsError::InvalidConfig(_))
        );
    }

    #[test]
    fn zero_poll_interval_is_rejected() {
        assert_matches!(
            RunnerConfig::default()
                .with_poll_interval(Duration::ZERO)
                .validate(),
            Err(JobsError::InvalidConfig(_))
        );
    }

    #[test]
    fn stale_threshold_must_exceed_default_timeout() {
        let config = RunnerConfig::default()
            .with_default_timeout(Some(Duration::from_secs(60)))
            .with_stale_lock_threshold(TimeDelta::seconds(60));
        assert_matches!(config.validate(), Err(JobsError::InvalidConfig(message)) if message.contains("stale_lock_threshold"));

        let config = config.with_default_timeout(None);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn concurrency_beyond_semaphore_capacity_is_rejected() {
        assert_matches!(
            RunnerConfig::default()
                .with_max_concurrency(Semaphore::MAX_PERMITS + 1)
                .validate(),
            Err(JobsError::InvalidConfig(message)) if message.contains("max_concurrency")
        );
        assert!(RunnerConfig::default()
            .with_max_concurrency(Semaphore::MAX_PERMITS)
            .validate()
            .is_ok());
    }

    #[test]
    fn handler_timeouts_stay_below_stale_lock_threshold() {
        let config = RunnerConfig::default()
            .with_stale_lock_threshold(TimeDelta::seconds(10))
            .with_default_timeout(Some(Duration::from_secs(2)));

        assert_eq!(config.handler_timeout(None), Duration::from_secs(2));
        assert_eq!(
            config.handler_timeout(Some(Duration::from_secs(5))),
            Duration::from_secs(5)
        );
        assert_eq!(
            config.handler_timeout(Some(Duration::from_secs(60))),
            Duration::from_secs(9)
        );

        let unbounded = config.with_default_timeout(None);
        assert_eq!(unbounded.handler_timeout(None), Duration::from_secs(9));
    }

    #[test]
    fn degraded_poll_delay_doubles_up_to_ceiling() {
        let config = RunnerConfig::default()
            .with_poll_interval(Duration::from_secs(1))
            .with_max_poll_backoff(Duration::from_secs(10));

        assert_eq!(config.degraded_poll_delay(0), Duration::from_secs(1));
        assert_eq!(config.degraded_poll_delay(1), Duration::from_secs(2));
        assert_eq!(config.degraded_poll_delay(3), Duration::from_secs(8));
        assert_eq!(config.degraded_poll_delay(4), Duration::from_secs(10));
        assert_eq!(config.degraded_poll_delay(u32::MAX), Duration::from_secs(10));
    }

    #[test]
    fn store_retry_none_makes_a_single_attempt() {
        assert_eq!(StoreRetryPolicy::none().max_attempts, 1);
        assert_eq!(StoreRetryPolicy::default().max_attempts, 5);
    }
}
