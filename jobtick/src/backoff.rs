//! When a failed job should be attempted again.
//!
//! By default a failed job simply waits for its next scheduled time
//! ([`RetryPolicy::FollowSchedule`]). With [`RetryPolicy::Backoff`] a retryable failure is
//! instead retried after a delay given by a [`BackoffStrategy`], unless the schedule comes
//! around sooner.
//!
//! Three backoff curves are provided:
//!
//! 1. Constant
//! 2. Linear
//! 3. Exponential
//!
//! each which can be optionally modified by applying different types of jitter.
//!
//! All of the constructors and configuration functions are `const`.
//!
//! # Example
//!
//! ```
//! # use jobtick::prelude::*;
//! # use chrono::TimeDelta;
//! let strategy = BackoffStrategy::linear(TimeDelta::seconds(20))
//!     .with_max(TimeDelta::seconds(60))
//!     .with_jitter(Jitter::Absolute(TimeDelta::seconds(10)));
//!
//! assert!(strategy.backoff(1) >= TimeDelta::seconds(10));
//! assert!(strategy.backoff(1) <= TimeDelta::seconds(30));
//! assert!(strategy.backoff(2) >= TimeDelta::seconds(30));
//! assert!(strategy.backoff(2) <= TimeDelta::seconds(50));
//! // Note the max here is the max plus max jitter
//! assert!(strategy.backoff(10) >= TimeDelta::seconds(50));
//! assert!(strategy.backoff(10) <= TimeDelta::seconds(70));
//! ```
use chrono::{DateTime, TimeDelta, Utc};
use rand::Rng;

/// A random jitter to be applied to a given backoff.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Jitter {
    /// A random jitter to be added to the backoff in the range `-delta =< jitter =< delta`.
    Absolute(TimeDelta),
    /// A random jitter to be added as a proportion of the current backoff.
    Relative(f64),
}

impl Jitter {
    fn apply_jitter(&self, value: TimeDelta) -> TimeDelta {
        let milliseconds = match self {
            Self::Absolute(delta) => delta.num_milliseconds(),
            Self::Relative(ratio) => (value.num_milliseconds() as f64 * ratio).round() as i64,
        }
        .abs();
        let rand_jitter = rand::thread_rng().gen_range(-milliseconds..=milliseconds);
        value
            .checked_add(&TimeDelta::milliseconds(rand_jitter))
            .unwrap_or(value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Curve {
    Constant(TimeDelta),
    Linear(TimeDelta),
    Exponential(TimeDelta),
}

impl Curve {
    fn delay(&self, attempt: u16) -> TimeDelta {
        let attempt = attempt.max(1);
        match *self {
            Self::Constant(delay) => delay,
            Self::Linear(factor) => factor
                .checked_mul(attempt.into())
                .unwrap_or(TimeDelta::MAX),
            Self::Exponential(base) => 2_i32
                .checked_pow(u32::from(attempt) - 1)
                .and_then(|factor| base.checked_mul(factor))
                .unwrap_or(TimeDelta::MAX),
        }
    }
}

/// How long to wait before retrying a failed job.
///
/// The attempt number passed to [`BackoffStrategy::backoff`] is the job's retry count after the
/// failure, so the first retry is attempt `1`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffStrategy {
    curve: Curve,
    max: Option<TimeDelta>,
    jitter: Option<Jitter>,
    min: TimeDelta,
}

impl BackoffStrategy {
    const fn new(curve: Curve) -> Self {
        Self {
            curve,
            max: None,
            jitter: None,
            min: TimeDelta::zero(),
        }
    }

    /// Always wait `delay`, no matter what the attempt number is.
    ///
    /// ```
    /// # use jobtick::prelude::*;
    /// # use chrono::TimeDelta;
    /// let strategy = BackoffStrategy::constant(TimeDelta::seconds(10));
    ///
    /// assert_eq!(strategy.backoff(1), TimeDelta::seconds(10));
    /// assert_eq!(strategy.backoff(3), TimeDelta::seconds(10));
    /// ```
    pub const fn constant(delay: TimeDelta) -> Self {
        Self::new(Curve::Constant(delay))
    }

    /// Wait `factor` times the attempt number.
    pub const fn linear(factor: TimeDelta) -> Self {
        Self::new(Curve::Linear(factor))
    }

    /// Wait `base` for the first attempt, doubling with each attempt after that. Setting a
    /// maximum with [`BackoffStrategy::with_max`] is advisable.
    ///
    /// ```
    /// # use jobtick::prelude::*;
    /// # use chrono::TimeDelta;
    /// let strategy =
    ///     BackoffStrategy::exponential(TimeDelta::seconds(2)).with_max(TimeDelta::seconds(30));
    ///
    /// assert_eq!(strategy.backoff(1), TimeDelta::seconds(2));
    /// assert_eq!(strategy.backoff(2), TimeDelta::seconds(4));
    /// assert_eq!(strategy.backoff(4), TimeDelta::seconds(16));
    /// assert_eq!(strategy.backoff(5), TimeDelta::seconds(30));
    /// ```
    pub const fn exponential(base: TimeDelta) -> Self {
        Self::new(Curve::Exponential(base))
    }

    /// Clamps the delay before jitter is applied to `max_delay`.
    pub const fn with_max(mut self, max_delay: TimeDelta) -> Self {
        self.max = Some(max_delay);
        self
    }

    /// Add a jitter to the backoff strategy see [`Jitter`] for more information about how this
    /// affects the strategy.
    pub const fn with_jitter(mut self, jitter: Jitter) -> Self {
        self.jitter = Some(jitter);
        self
    }

    /// Add a minimum value. This can be useful when you have a particularly large jitter and would
    /// like to avoid a delay of less than a given amount.
    pub const fn with_min(mut self, min: TimeDelta) -> Self {
        self.min = min;
        self
    }

    pub fn backoff(&self, attempt: u16) -> TimeDelta {
        let mut backoff = self.curve.delay(attempt);
        if let Some(max) = self.max {
            backoff = backoff.min(max);
        }
        if let Some(jitter) = self.jitter {
            backoff = jitter.apply_jitter(backoff);
        }
        backoff.max(self.min)
    }
}

/// When a job that failed but still has retries left runs next.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum RetryPolicy {
    /// Wait for the next time the job's schedule fires.
    #[default]
    FollowSchedule,
    /// Retry after the strategy's backoff, or at the next scheduled time if that comes first.
    Backoff(BackoffStrategy),
}

impl RetryPolicy {
    /// The next execution time of a job that just failed with `retry_count` consecutive failures
    /// and is still eligible for retry, given its next scheduled time.
    pub fn next_retry_at(
        &self,
        retry_count: u16,
        scheduled: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> DateTime<Utc> {
        match self {
            Self::FollowSchedule => scheduled,
            Self::Backoff(strategy) => now
                .checked_add_signed(strategy.backoff(retry_count))
                .map_or(scheduled, |retry_at| retry_at.min(scheduled)),
        }
    }
}
