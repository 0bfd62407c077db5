//! Helpers for testing code that schedules jobs.
//!
//! [`StubExecutor`] stands in for a real [`Executor`]: it performs no side effect, finishes
//! with a scripted outcome and records how many executions it saw and how many overlapped.
//!
//! # Example
//!
//! ```
//! # use jobtick::prelude::*;
//! # use std::{sync::Arc, time::Duration};
//! use jobtick::testing::StubExecutor;
//! # tokio::runtime::Builder::new_current_thread().enable_time().build().unwrap().block_on(async {
//! let executor = Arc::new(StubExecutor::failing("upstream down").with_delay(Duration::from_millis(5)));
//! let scheduler = Scheduler::new(InMemoryJobStore::new(), executor.clone());
//!
//! let job = scheduler
//!     .create(JobBuilder::notification("nightly", "0 2 * * *", "hello").build())
//!     .await
//!     .unwrap();
//! let job = scheduler.trigger(job.id).await.unwrap();
//!
//! assert_eq!(job.last_error.as_deref(), Some("Function `stub` failed: upstream down"));
//! assert_eq!(executor.executions(), 1);
//! # });
//! ```
use std::{
    sync::atomic::{AtomicUsize, Ordering},
    time::Duration,
};

use async_trait::async_trait;

use crate::{
    executor::{ExecutionError, Executor},
    job::Job,
};

const STUB_FUNCTION: &str = "stub";

#[derive(Debug, Clone, PartialEq, Eq)]
enum Behaviour {
    Succeed,
    Fail(String),
    Panic(String),
}

/// An [`Executor`] with a fixed outcome.
#[derive(Debug)]
pub struct StubExecutor {
    behaviour: Behaviour,
    delay: Option<Duration>,
    timeout: Option<Duration>,
    executions: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl StubExecutor {
    fn new(behaviour: Behaviour) -> Self {
        Self {
            behaviour,
            delay: None,
            timeout: None,
            executions: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    /// Every execution succeeds.
    pub fn succeeding() -> Self {
        Self::new(Behaviour::Succeed)
    }

    /// Every execution fails with `reason`, reported as a failed function call.
    pub fn failing(reason: impl Into<String>) -> Self {
        Self::new(Behaviour::Fail(reason.into()))
    }

    /// Every execution panics with `message`.
    pub fn panicking(message: impl Into<String>) -> Self {
        Self::new(Behaviour::Panic(message.into()))
    }

    /// Sleep for `delay` before finishing each execution.
    pub fn with_delay(self, delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..self
        }
    }

    /// Report `timeout` as the execution timeout of every job.
    pub fn with_timeout(self, timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
            ..self
        }
    }

    /// How many executions have started.
    pub fn executions(&self) -> usize {
        self.executions.load(Ordering::SeqCst)
    }

    /// The largest number of executions that were in progress at the same time.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl Executor for StubExecutor {
    async fn execute(&self, _job: &Job) -> Result<(), ExecutionError> {
        self.executions.fetch_add(1, Ordering::SeqCst);
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        let _guard = InFlight(&self.in_flight);
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        match &self.behaviour {
            Behaviour::Succeed => Ok(()),
            Behaviour::Fail(reason) => Err(ExecutionError::Function {
                name: STUB_FUNCTION.to_owned(),
                source: reason.clone().into(),
            }),
            Behaviour::Panic(message) => panic!("{message}"),
        }
    }

    fn timeout(&self, _job: &Job) -> Option<Duration> {
        self.timeout
    }
}
