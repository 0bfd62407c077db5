//! A single process scheduler for recurring jobs.
//!
//! Jobs are defined by a five field cron expression, a [`JobType`](job::JobType) and a JSON
//! config. A [`Scheduler`] stores them in a [`JobStore`](store::JobStore), and once per tick
//! executes those that are due, at most
//! [`max_concurrent_jobs`](config::SchedulerConfig::max_concurrent_jobs) at a time. Failures
//! are recorded on the job and retried on later runs until the job's retry budget is spent.
//!
//! # Example
//!
//! ```
//! # use jobtick::prelude::*;
//! # use jobtick::executor::function::HandlerError;
//! # tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(async {
//! let functions = FunctionRegistry::new().register("cleanup", |_params: serde_json::Value| async {
//!     Ok::<_, HandlerError>(())
//! });
//! let scheduler = Scheduler::new(InMemoryJobStore::new(), JobExecutor::new(functions))
//!     .with_config(SchedulerConfig::default().with_max_concurrent_jobs(2));
//!
//! let job = JobBuilder::function_call("cleanup", "*/15 * * * *", "cleanup", serde_json::json!({}))
//!     .create(&scheduler)
//!     .await
//!     .unwrap();
//!
//! let handle = scheduler.spawn();
//! let job = scheduler.trigger(job.id).await.unwrap();
//! assert_eq!(job.status, JobStatus::Completed);
//!
//! handle.graceful_shutdown().await.unwrap();
//! # });
//! ```
use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub mod backoff;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod executor;
pub mod job;
pub mod prelude;
pub mod schedule;
pub mod store;
pub mod testing;

use config::SchedulerConfig;
use dispatch::{DispatchReport, Dispatcher};
use error::ValidationError;
use executor::Executor;
use job::{
    config::JobConfig, Job, JobId, JobStatus, JobUpdate, NewJob, SchedulerStatus,
    DEFAULT_MAX_RETRIES, MAX_RETRIES_LIMIT,
};
use schedule::{CronCalculator, ScheduleCalculator, ScheduleError};
use store::{JobStore, StoreError};

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("Job {0} not found")]
    NotFound(JobId),
    #[error("Error communicating with the job store")]
    Persistence(#[source] StoreError),
    #[error("Job {id} cannot be scheduled")]
    Schedule {
        id: JobId,
        #[source]
        source: ScheduleError,
    },
    #[error("Failed to gracefully shut down")]
    GracefulShutdownFailed,
}

impl From<StoreError> for SchedulerError {
    fn from(value: StoreError) -> Self {
        match value {
            StoreError::NotFound(id) => Self::NotFound(id),
            error => Self::Persistence(error),
        }
    }
}

/// Manages recurring jobs and drives their execution.
///
/// Clones share the same store, executor and concurrency limit.
#[derive(Clone)]
pub struct Scheduler {
    store: Arc<dyn JobStore>,
    schedule: Arc<dyn ScheduleCalculator>,
    executor: Arc<dyn Executor>,
    config: SchedulerConfig,
    dispatcher: Arc<Dispatcher>,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Scheduler {
    /// A scheduler using the default [`SchedulerConfig`] and [`CronCalculator`].
    pub fn new<S, E>(store: S, executor: E) -> Self
    where
        S: JobStore + 'static,
        E: Executor + 'static,
    {
        Self::assemble(
            Arc::new(store),
            Arc::new(CronCalculator),
            Arc::new(executor),
            SchedulerConfig::default(),
        )
    }

    fn assemble(
        store: Arc<dyn JobStore>,
        schedule: Arc<dyn ScheduleCalculator>,
        executor: Arc<dyn Executor>,
        config: SchedulerConfig,
    ) -> Self {
        let dispatcher = Arc::new(Dispatcher::new(
            store.clone(),
            schedule.clone(),
            executor.clone(),
            config,
        ));
        Self {
            store,
            schedule,
            executor,
            config,
            dispatcher,
        }
    }

    pub fn with_config(self, config: SchedulerConfig) -> Self {
        Self::assemble(self.store, self.schedule, self.executor, config)
    }

    pub fn with_schedule_calculator(self, schedule: impl ScheduleCalculator + 'static) -> Self {
        Self::assemble(self.store, Arc::new(schedule), self.executor, self.config)
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Validate and store a new job.
    ///
    /// The job starts out pending, due at the next time its schedule fires.
    pub async fn create(&self, new_job: NewJob) -> Result<Job, SchedulerError> {
        let now = Utc::now();
        validate_name(&new_job.name)?;
        JobConfig::from_value(new_job.job_type, new_job.config.clone())
            .map_err(ValidationError::from)?;
        let max_retries = validate_max_retries(new_job.max_retries.unwrap_or(DEFAULT_MAX_RETRIES))?;
        let next_execution_at = self
            .schedule
            .next_execution_time(&new_job.cron_expression, now)
            .map_err(ValidationError::from)?;

        let job = Job {
            id: JobId::new(),
            name: new_job.name,
            description: new_job.description,
            cron_expression: new_job.cron_expression,
            job_type: new_job.job_type,
            config: new_job.config.to_string(),
            status: JobStatus::Pending,
            is_active: new_job.is_active.unwrap_or(true),
            last_executed_at: None,
            next_execution_at: Some(next_execution_at),
            success_count: 0,
            failure_count: 0,
            last_error: None,
            max_retries,
            retry_count: 0,
            created_at: now,
            updated_at: now,
        };
        let job = self.store.save(job).await?;
        tracing::info!(job_id = %job.id, next_execution_at = %next_execution_at, "Created job {}", job.name);
        Ok(job)
    }

    /// Change the definition of job `id`.
    ///
    /// Changed fields are validated as on creation. A new cron expression reschedules the job
    /// from now. The change is applied atomically and leaves the job's status and counters
    /// alone, so it is safe while the job is running.
    pub async fn update(&self, id: JobId, update: JobUpdate) -> Result<Job, SchedulerError> {
        let current = self.store.get_by_id(id).await?;

        if let Some(name) = &update.name {
            validate_name(name)?;
        }
        let max_retries = update.max_retries.map(validate_max_retries).transpose()?;
        let schedule = match update.cron_expression {
            Some(cron_expression) => {
                let next = self
                    .schedule
                    .next_execution_time(&cron_expression, Utc::now())
                    .map_err(ValidationError::from)?;
                Some((cron_expression, next))
            }
            None => None,
        };
        // A new type alone is validated against the config read above, which must still be
        // the stored one when the change is applied.
        let mut retyped_from = None;
        let definition = if update.job_type.is_some() || update.config.is_some() {
            let job_type = update.job_type.unwrap_or(current.job_type);
            let config = match update.config {
                Some(config) => config,
                None => {
                    retyped_from = Some(current.config.clone());
                    let config = current.config_map().map_err(ValidationError::from)?;
                    serde_json::Value::Object(config)
                }
            };
            JobConfig::from_value(job_type, config.clone()).map_err(ValidationError::from)?;
            Some((job_type, config.to_string()))
        } else {
            None
        };

        let name = update.name;
        let description = update.description;
        let is_active = update.is_active;
        let job = self
            .store
            .update(
                id,
                Box::new(move |mut job: Job| {
                    if retyped_from.is_some_and(|config| config != job.config) {
                        return None;
                    }
                    if let Some(name) = name {
                        job.name = name;
                    }
                    if let Some(description) = description {
                        job.description = Some(description);
                    }
                    if let Some((cron_expression, next)) = schedule {
                        job.cron_expression = cron_expression;
                        job.next_execution_at = Some(next);
                    }
                    if let Some((job_type, config)) = definition {
                        job.job_type = job_type;
                        job.config = config;
                    }
                    if let Some(is_active) = is_active {
                        job.is_active = is_active;
                    }
                    if let Some(max_retries) = max_retries {
                        job.max_retries = max_retries;
                        job.retry_count = job.retry_count.min(max_retries);
                    }
                    Some(job)
                }),
            )
            .await?
            .ok_or(StoreError::Conflict(id))?;
        tracing::info!(job_id = %id, "Updated job {}", job.name);
        Ok(job)
    }

    pub async fn remove(&self, id: JobId) -> Result<(), SchedulerError> {
        self.store.remove(id).await?;
        tracing::info!(job_id = %id, "Removed job");
        Ok(())
    }

    pub async fn find(&self, id: JobId) -> Result<Job, SchedulerError> {
        Ok(self.store.get_by_id(id).await?)
    }

    /// Every job, newest first.
    pub async fn list(&self) -> Result<Vec<Job>, SchedulerError> {
        Ok(self.store.list_all().await?)
    }

    /// Active jobs, earliest due first.
    pub async fn list_active(&self) -> Result<Vec<Job>, SchedulerError> {
        Ok(self.store.list_active().await?)
    }

    pub async fn list_by_status(&self, status: JobStatus) -> Result<Vec<Job>, SchedulerError> {
        Ok(self.store.list_by_status(status).await?)
    }

    /// Execute job `id` now, outside its schedule, and return the job as recorded afterwards.
    ///
    /// A failed execution is not an error: it is recorded on the returned job like any other.
    pub async fn trigger(&self, id: JobId) -> Result<Job, SchedulerError> {
        Ok(self.dispatcher.trigger(id).await?)
    }

    /// Switch job `id` on, clearing its retries and rescheduling it from now.
    pub async fn activate(&self, id: JobId) -> Result<Job, SchedulerError> {
        let job = self.store.get_by_id(id).await?;
        let next = self
            .schedule
            .next_execution_time(&job.cron_expression, Utc::now())
            .map_err(|source| SchedulerError::Schedule { id, source })?;
        let job = self
            .store
            .update(id, Box::new(move |job: Job| Some(job.activated(next))))
            .await?
            .ok_or(StoreError::Conflict(id))?;
        tracing::info!(job_id = %id, "Activated job {}", job.name);
        Ok(job)
    }

    /// Switch job `id` off. It will not be executed again until activated.
    pub async fn deactivate(&self, id: JobId) -> Result<Job, SchedulerError> {
        let job = self
            .store
            .update(id, Box::new(|job: Job| Some(job.deactivated())))
            .await?
            .ok_or(StoreError::Conflict(id))?;
        tracing::info!(job_id = %id, "Deactivated job {}", job.name);
        Ok(job)
    }

    /// Job counts by status.
    pub async fn status(&self) -> Result<SchedulerStatus, SchedulerError> {
        let jobs = self.store.list_all().await?;
        Ok(SchedulerStatus::from_jobs(&jobs))
    }

    /// Run a single tick now.
    pub async fn run_tick(&self) -> DispatchReport {
        self.dispatcher.run_tick().await
    }

    /// Start ticking every [`SchedulerConfig::tick_interval`] in a background task.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(&self) -> SchedulerHandle {
        let cancellation_token = CancellationToken::new();
        let handle = tokio::spawn(self.dispatcher.clone().run(cancellation_token.clone()));
        tracing::info!(
            tick_interval = ?self.config.tick_interval,
            max_concurrent_jobs = self.config.max_concurrent_jobs,
            "Started job scheduler"
        );
        SchedulerHandle {
            cancellation_token,
            handle,
        }
    }
}

/// Controls a scheduler started with [`Scheduler::spawn`].
#[derive(Debug)]
pub struct SchedulerHandle {
    cancellation_token: CancellationToken,
    handle: JoinHandle<()>,
}

impl SchedulerHandle {
    /// Stop ticking and wait for the ticks in progress to finish.
    pub async fn graceful_shutdown(self) -> Result<(), SchedulerError> {
        tracing::debug!("Shutting down the job scheduler");
        self.cancellation_token.cancel();
        self.handle
            .await
            .map_err(|_| SchedulerError::GracefulShutdownFailed)
    }
}

fn validate_name(name: &str) -> Result<(), ValidationError> {
    if name.trim().is_empty() {
        return Err(ValidationError::EmptyName);
    }
    Ok(())
}

fn validate_max_retries(value: u16) -> Result<u16, ValidationError> {
    if value > MAX_RETRIES_LIMIT {
        return Err(ValidationError::MaxRetries {
            value,
            max: MAX_RETRIES_LIMIT,
        });
    }
    Ok(value)
}
