//! Retry delays.
//!
//! Failed jobs are retried after `base * 2^(attempts - 1)`, capped by a maximum and optionally
//! lengthened by random [`Jitter`] so that jobs failing together do not retry together. A
//! [`Constant`] delay is also available, mostly for tests. Every constructor and builder method
//! is `const`, so strategies can live in constants.
//!
//! # Example
//!
//! ```
//! # use durable_jobs::prelude::*;
//! # use chrono::TimeDelta;
//! let strategy = BackoffStrategy::exponential(TimeDelta::seconds(2))
//!     .with_max(TimeDelta::seconds(30));
//!
//! assert_eq!(strategy.backoff(1), TimeDelta::seconds(2));
//! assert_eq!(strategy.backoff(2), TimeDelta::seconds(4));
//! assert_eq!(strategy.backoff(3), TimeDelta::seconds(8));
//! assert_eq!(strategy.backoff(5), TimeDelta::seconds(30));
//! ```
use chrono::TimeDelta;
use rand::Rng;

/// Upper bound on any computed delay, regardless of configuration.
pub const MAX_BACKOFF: TimeDelta = TimeDelta::days(365);

/// Computes the delay before retrying a job.
pub trait Strategy: Send + Sync {
    /// `attempt` is the number of attempts already made, so the first retry sees `1`.
    fn backoff(&self, attempt: u16) -> TimeDelta;
}

/// The same delay for every attempt. Built with [`BackoffStrategy::constant`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Constant {
    delay: TimeDelta,
}

impl Strategy for Constant {
    fn backoff(&self, _attempt: u16) -> TimeDelta {
        self.delay
    }
}

/// Doubles from `base` on every attempt. Built with [`BackoffStrategy::exponential`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Exponential {
    base: TimeDelta,
}

impl Strategy for Exponential {
    fn backoff(&self, attempt: u16) -> TimeDelta {
        let doublings = u32::from(attempt.saturating_sub(1));
        let milliseconds = 2_i64
            .checked_pow(doublings)
            .and_then(|factor| factor.checked_mul(self.base.num_milliseconds()))
            .map_or(MAX_BACKOFF.num_milliseconds(), |delay| {
                delay.min(MAX_BACKOFF.num_milliseconds())
            });
        TimeDelta::milliseconds(milliseconds)
    }
}

/// Random extra delay added to a computed delay.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Jitter {
    /// Uniform in `[0, delta]`.
    Absolute(TimeDelta),
    /// Uniform in `[0, ratio * delay]`.
    Relative(f64),
}

impl Jitter {
    fn spread(&self, delay: TimeDelta) -> TimeDelta {
        let bound = match self {
            Self::Absolute(delta) => delta.num_milliseconds(),
            Self::Relative(ratio) => (delay.num_milliseconds() as f64 * ratio).round() as i64,
        }
        .saturating_abs();
        if bound == 0 {
            return delay;
        }
        delay + TimeDelta::milliseconds(rand::thread_rng().gen_range(0..=bound))
    }
}

/// A [`Strategy`] with optional jitter, clamped to `[min, max]`.
///
/// Jittered delays stay within `max` and never exceed the unjittered delay of the following
/// attempt, so delays never decrease from one attempt to the next. A constant strategy therefore
/// gets no jitter.
///
/// ```
/// # use durable_jobs::prelude::*;
/// # use chrono::TimeDelta;
/// let strategy = BackoffStrategy::exponential(TimeDelta::seconds(10))
///     .with_max(TimeDelta::minutes(1))
///     .with_jitter(Jitter::Relative(0.5));
///
/// assert!(strategy.backoff(1) >= TimeDelta::seconds(10));
/// assert!(strategy.backoff(1) <= TimeDelta::seconds(15));
/// assert!(strategy.backoff(20) <= TimeDelta::minutes(1));
/// ```
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffStrategy<T: Strategy> {
    strategy: T,
    jitter: Option<Jitter>,
    min: TimeDelta,
    max: TimeDelta,
}

impl BackoffStrategy<Constant> {
    pub const fn constant(delay: TimeDelta) -> Self {
        Self::new(Constant { delay })
    }
}

impl BackoffStrategy<Exponential> {
    /// `base * 2^(attempt - 1)`, so the first retry waits `base`.
    pub const fn exponential(base: TimeDelta) -> Self {
        Self::new(Exponential { base })
    }
}

impl<T: Strategy> BackoffStrategy<T> {
    /// Wraps a custom [`Strategy`].
    pub const fn new(strategy: T) -> Self {
        Self {
            strategy,
            jitter: None,
            min: TimeDelta::zero(),
            max: MAX_BACKOFF,
        }
    }

    pub const fn with_jitter(mut self, jitter: Jitter) -> Self {
        self.jitter = Some(jitter);
        self
    }

    /// Floor for every delay.
    pub const fn with_min(mut self, min: TimeDelta) -> Self {
        self.min = min;
        self
    }

    pub const fn with_max(mut self, max: TimeDelta) -> Self {
        self.max = max;
        self
    }
}

impl<T: Strategy> Strategy for BackoffStrategy<T> {
    fn backoff(&self, attempt: u16) -> TimeDelta {
        let delay = self.clamp(self.strategy.backoff(attempt));
        match &self.jitter {
            Some(jitter) => {
                let ceiling = self
                    .clamp(self.strategy.backoff(attempt.saturating_add(1)))
                    .max(delay);
                jitter.spread(delay).clamp(delay, ceiling)
            }
            None => delay,
        }
    }
}

impl<T: Strategy> BackoffStrategy<T> {
    fn clamp(&self, delay: TimeDelta) -> TimeDelta {
        delay
            .min(self.max.min(MAX_BACKOFF))
            .max(self.min)
            .max(TimeDelta::zero())
    }
}
