//! Tuning knobs for the dispatch loop.
use std::time::Duration;

use tokio::sync::Semaphore;

use crate::backoff::RetryPolicy;

/// Configuration of a [`crate::Scheduler`].
///
/// # Example
///
/// ```
/// # use jobtick::prelude::*;
/// # use std::time::Duration;
/// let config = SchedulerConfig::default()
///     .with_tick_interval(Duration::from_secs(30))
///     .with_max_concurrent_jobs(10)
///     .with_abandonment_threshold(None);
///
/// assert_eq!(config.max_concurrent_jobs, 10);
/// ```
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SchedulerConfig {
    /// How often the dispatch loop looks for due jobs.
    pub tick_interval: Duration,
    /// How many jobs may be executing at once, at most [`Semaphore::MAX_PERMITS`].
    pub max_concurrent_jobs: usize,
    /// Jobs whose failure count exceeds this are no longer dispatched. [`None`] disables the
    /// check.
    pub abandonment_threshold: Option<u32>,
    /// Execution timeout for jobs whose config does not carry one.
    pub default_timeout: Duration,
    pub retry_policy: RetryPolicy,
}

impl SchedulerConfig {
    pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_secs(60);
    pub const DEFAULT_MAX_CONCURRENT_JOBS: usize = 5;
    pub const DEFAULT_ABANDONMENT_THRESHOLD: u32 = 10;
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

    pub const fn new() -> Self {
        Self {
            tick_interval: Self::DEFAULT_TICK_INTERVAL,
            max_concurrent_jobs: Self::DEFAULT_MAX_CONCURRENT_JOBS,
            abandonment_threshold: Some(Self::DEFAULT_ABANDONMENT_THRESHOLD),
            default_timeout: Self::DEFAULT_TIMEOUT,
            retry_policy: RetryPolicy::FollowSchedule,
        }
    }

    pub const fn with_tick_interval(mut self, tick_interval: Duration) -> Self {
        self.tick_interval = tick_interval;
        self
    }

    /// Values above [`Semaphore::MAX_PERMITS`] are clamped to it.
    pub const fn with_max_concurrent_jobs(mut self, max_concurrent_jobs: usize) -> Self {
        self.max_concurrent_jobs = if max_concurrent_jobs > Semaphore::MAX_PERMITS {
            Semaphore::MAX_PERMITS
        } else {
            max_concurrent_jobs
        };
        self
    }

    pub const fn with_abandonment_threshold(mut self, threshold: Option<u32>) -> Self {
        self.abandonment_threshold = threshold;
        self
    }

    pub const fn with_default_timeout(mut self, default_timeout: Duration) -> Self {
        self.default_timeout = default_timeout;
        self
    }

    pub const fn with_retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }

    /// Whether a job with `failure_count` failures is past the abandonment threshold.
    pub fn is_abandoned(&self, failure_count: u32) -> bool {
        self.abandonment_threshold
            .is_some_and(|threshold| failure_count > threshold)
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self::new()
    }
}
