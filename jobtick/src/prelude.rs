//! The types needed to define and run jobs in one import.
//!
//! ```
//! # #![allow(unused_imports)]
//! use jobtick::prelude::*;
//! ```
pub use crate::backoff::{BackoffStrategy, Jitter, RetryPolicy};
pub use crate::config::SchedulerConfig;
pub use crate::dispatch::{DispatchReport, JobOutcome};
pub use crate::executor::function::FunctionRegistry;
pub use crate::executor::messaging::{LogMessenger, Messenger, WebhookMessenger};
pub use crate::executor::{ExecutionError, Executor, JobExecutor};
pub use crate::job::builder::JobBuilder;
pub use crate::job::{Job, JobId, JobStatus, JobType, JobUpdate, NewJob, SchedulerStatus};
pub use crate::schedule::{CronCalculator, ScheduleCalculator};
pub use crate::store::{memory::InMemoryJobStore, JobStore, StoreError};
pub use crate::{Scheduler, SchedulerError, SchedulerHandle};
