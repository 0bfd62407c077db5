//! The periodic dispatch loop.
//!
//! Once per tick the [`Dispatcher`] reads the active jobs, keeps those that are due, and
//! executes as many of them as the concurrency limit allows. Due jobs that do not fit are
//! left untouched and considered again on the next tick.
//!
//! Each admitted job goes through one execution cycle: it is claimed (marked running), its
//! executor runs in a task of its own under a timeout, and the outcome is recorded. Failures
//! of one job never affect the others in the same tick.
use std::{sync::Arc, time::Duration};

use chrono::{DateTime, TimeDelta, Utc};
use futures::future::join_all;
use serde::Serialize;
use tokio::{
    sync::{OwnedSemaphorePermit, Semaphore},
    task::JoinSet,
    time::{Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::{
    config::SchedulerConfig,
    error::to_display_string,
    executor::{ExecutionError, Executor},
    job::{lifecycle::LifecycleController, Job, JobId, JobStatus},
    schedule::ScheduleCalculator,
    store::{JobStore, StoreError},
};

/// Whether `job` should be executed by a tick at `now`.
///
/// A job is due when it is active, idle (pending or completed), its next execution time has
/// been reached, and it has not failed more often than the abandonment threshold allows.
pub fn is_due(job: &Job, now: DateTime<Utc>, config: &SchedulerConfig) -> bool {
    job.is_active
        && matches!(job.status, JobStatus::Pending | JobStatus::Completed)
        && job.next_execution_at.is_some_and(|next| next <= now)
        && !config.is_abandoned(job.failure_count)
}

/// What happened to a job admitted by a tick.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "message", rename_all = "snake_case")]
pub enum JobOutcome {
    Succeeded,
    /// The executor failed; the failure was recorded on the job.
    Failed(String),
    /// The job's record could not be read or written.
    Persistence(String),
    /// The job was no longer due when it came to be claimed.
    Skipped,
}

/// A summary of one tick.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchReport {
    pub started_at: DateTime<Utc>,
    /// Active jobs read from the store.
    pub considered: usize,
    pub due: usize,
    pub admitted: usize,
    /// Due jobs left for a later tick because the concurrency limit was reached.
    pub deferred: usize,
    pub outcomes: Vec<(JobId, JobOutcome)>,
    /// Set when the active jobs could not be read, in which case nothing was executed.
    pub store_error: Option<String>,
}

impl DispatchReport {
    fn new(started_at: DateTime<Utc>) -> Self {
        Self {
            started_at,
            considered: 0,
            due: 0,
            admitted: 0,
            deferred: 0,
            outcomes: Vec::new(),
            store_error: None,
        }
    }

    pub fn succeeded(&self) -> usize {
        self.count(|outcome| matches!(outcome, JobOutcome::Succeeded))
    }

    pub fn failed(&self) -> usize {
        self.count(|outcome| matches!(outcome, JobOutcome::Failed(_)))
    }

    fn count(&self, predicate: impl Fn(&JobOutcome) -> bool) -> usize {
        self.outcomes
            .iter()
            .filter(|(_, outcome)| predicate(outcome))
            .count()
    }
}

/// The result of one execution cycle that got past its claim.
#[derive(Debug)]
pub(crate) struct Executed {
    pub(crate) job: Job,
    pub(crate) error: Option<ExecutionError>,
}

/// Drives execution of due jobs.
pub struct Dispatcher {
    store: Arc<dyn JobStore>,
    executor: Arc<dyn Executor>,
    lifecycle: LifecycleController,
    config: SchedulerConfig,
    permits: Arc<Semaphore>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("config", &self.config)
            .field("available_permits", &self.permits.available_permits())
            .finish_non_exhaustive()
    }
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn JobStore>,
        schedule: Arc<dyn ScheduleCalculator>,
        executor: Arc<dyn Executor>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            lifecycle: LifecycleController::new(store.clone(), schedule, config.retry_policy),
            store,
            executor,
            permits: Arc::new(Semaphore::new(
                config.max_concurrent_jobs.min(Semaphore::MAX_PERMITS),
            )),
            config,
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Run one tick now.
    pub async fn run_tick(&self) -> DispatchReport {
        self.run_tick_at(Utc::now()).await
    }

    /// Run one tick as if the current time were `now`.
    pub async fn run_tick_at(&self, now: DateTime<Utc>) -> DispatchReport {
        let mut report = DispatchReport::new(now);

        let jobs = match self.store.list_active().await {
            Ok(jobs) => jobs,
            Err(error) => {
                tracing::error!(?error, "Failed to load active jobs: {error}");
                report.store_error = Some(to_display_string(&error));
                return report;
            }
        };
        report.considered = jobs.len();

        let unlimited = self.config.with_abandonment_threshold(None);
        let due: Vec<_> = jobs
            .into_iter()
            .filter(|job| {
                let due = is_due(job, now, &self.config);
                if !due && is_due(job, now, &unlimited) {
                    tracing::warn!(
                        job_id = %job.id,
                        failure_count = job.failure_count,
                        "Skipping job {} after too many failures",
                        job.name
                    );
                }
                due
            })
            .collect();
        report.due = due.len();

        let mut claimed = Vec::with_capacity(due.len());
        for job in due {
            let Ok(permit) = self.permits.clone().try_acquire_owned() else {
                tracing::warn!(job_id = %job.id, "Concurrency limit reached, deferring job {}", job.name);
                report.deferred += 1;
                continue;
            };
            let config = self.config;
            match self
                .lifecycle
                .claim(job.id, now, move |job| is_due(job, now, &config))
                .await
            {
                Ok(Some(running)) => claimed.push((running, permit)),
                Ok(None) => {
                    tracing::debug!(job_id = %job.id, "Job {} was claimed elsewhere", job.name);
                    report.outcomes.push((job.id, JobOutcome::Skipped));
                }
                Err(error) => {
                    tracing::error!(?error, job_id = %job.id, "Failed to claim job {}: {error}", job.name);
                    report
                        .outcomes
                        .push((job.id, JobOutcome::Persistence(to_display_string(&error))));
                }
            }
        }
        report.admitted = claimed.len();
        tracing::debug!(
            considered = report.considered,
            due = report.due,
            admitted = report.admitted,
            deferred = report.deferred,
            "Dispatching jobs"
        );

        let cycles = claimed.into_iter().map(|(job, permit)| async move {
            let id = job.id;
            let outcome = match self.execute_claimed(job, now, Some(permit)).await {
                Ok(Executed { error: None, .. }) => JobOutcome::Succeeded,
                Ok(Executed {
                    error: Some(error), ..
                }) => JobOutcome::Failed(to_display_string(&error)),
                Err(error) => JobOutcome::Persistence(to_display_string(&error)),
            };
            (id, outcome)
        });
        report.outcomes.extend(join_all(cycles).await);

        report
    }

    /// Run the execution cycle of job `id` immediately, whatever its schedule.
    ///
    /// A job that is already running is returned as it is.
    pub async fn trigger(&self, id: JobId) -> Result<Job, StoreError> {
        let now = Utc::now();
        match self.lifecycle.claim(id, now, |_| true).await? {
            Some(running) => Ok(self.execute_claimed(running, now, None).await?.job),
            None => {
                tracing::debug!(job_id = %id, "Job is already running");
                self.store.get_by_id(id).await
            }
        }
    }

    /// Execute a job claimed at `now` and record the outcome.
    ///
    /// A failed outcome write is retried once. If that fails too the job is released back to
    /// pending so a later tick picks it up again.
    #[instrument(skip(self, job, permit), fields(job_id = %job.id))]
    pub(crate) async fn execute_claimed(
        &self,
        job: Job,
        now: DateTime<Utc>,
        permit: Option<OwnedSemaphorePermit>,
    ) -> Result<Executed, StoreError> {
        let id = job.id;
        tracing::info!(job_type = %job.job_type, "Executing job {}", job.name);

        let started = Instant::now();
        let result = self.execute(job).await;
        drop(permit);
        let finished_at = now + TimeDelta::from_std(started.elapsed()).unwrap_or(TimeDelta::zero());

        let error = match result {
            Ok(()) => None,
            Err(error) => {
                tracing::warn!(
                    ?error,
                    error_type = error.error_type(),
                    "Job execution failed: {error}"
                );
                Some(error)
            }
        };
        let outcome = error
            .as_ref()
            .map_or(Ok(()), |error| Err(to_display_string(error)));

        let job = match self.lifecycle.record(id, outcome.clone(), finished_at).await {
            Ok(job) => job,
            Err(error) => {
                tracing::warn!(?error, "Failed to record the outcome of job execution, retrying: {error}");
                match self.lifecycle.record(id, outcome, finished_at).await {
                    Ok(job) => job,
                    Err(error) => {
                        tracing::error!(?error, "Failed to record the outcome of job execution: {error}");
                        self.release(id).await;
                        return Err(error);
                    }
                }
            }
        };
        match job.status {
            JobStatus::Failed => {
                tracing::warn!(retry_count = job.retry_count, "Job {} has failed", job.name)
            }
            JobStatus::Pending => {
                tracing::warn!(retry_count = job.retry_count, "Job {} will be retried", job.name)
            }
            _ => {}
        }

        Ok(Executed { job, error })
    }

    async fn release(&self, id: JobId) {
        match self.lifecycle.release(id).await {
            Ok(Some(_)) => tracing::warn!("Released job without recording its outcome"),
            Ok(None) => {}
            Err(error) => {
                tracing::error!(?error, "Failed to release job, it stays marked as running: {error}")
            }
        }
    }

    async fn execute(&self, job: Job) -> Result<(), ExecutionError> {
        let timeout = self
            .executor
            .timeout(&job)
            .unwrap_or(self.config.default_timeout);
        let executor = self.executor.clone();
        let handle = tokio::spawn(async move {
            tokio::time::timeout(timeout, executor.execute(&job))
                .await
                .unwrap_or(Err(ExecutionError::Timeout(timeout)))
        });
        handle.await.unwrap_or_else(|error| Err(error.into()))
    }

    /// Tick every `tick_interval` until `cancellation_token` is cancelled, then wait for the
    /// ticks in progress to finish.
    ///
    /// Each tick runs in its own task, so a slow tick does not delay the next one.
    pub(crate) async fn run(self: Arc<Self>, cancellation_token: CancellationToken) {
        let period = self.config.tick_interval.max(Duration::from_millis(1));
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut ticks = JoinSet::new();

        loop {
            tokio::select! {
                _ = cancellation_token.cancelled() => {
                    tracing::debug!("Shutting down the job dispatcher");
                    break;
                },
                _ = interval.tick() => {
                    let dispatcher = self.clone();
                    ticks.spawn(async move { dispatcher.run_tick().await });
                },
                Some(finished) = ticks.join_next(), if !ticks.is_empty() => {
                    if let Err(error) = finished {
                        tracing::error!(?error, "Dispatch tick did not complete: {error}");
                    }
                },
            }
        }

        while let Some(finished) = ticks.join_next().await {
            if let Err(error) = finished {
                tracing::error!(?error, "Dispatch tick did not complete: {error}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use assert_matches::assert_matches;
    use chrono::TimeZone;

    use super::*;
    use crate::{
        schedule::CronCalculator,
        store::{memory::InMemoryJobStore, MockJobStore},
        testing::StubExecutor,
    };

    fn dispatcher(
        store: impl JobStore + 'static,
        executor: Arc<StubExecutor>,
        config: SchedulerConfig,
    ) -> Dispatcher {
        Dispatcher::new(
            Arc::new(store),
            Arc::new(CronCalculator),
            executor,
            config,
        )
    }

    fn overdue(now: DateTime<Utc>) -> Job {
        Job::mock_job().with_next_execution_at(Some(now - TimeDelta::seconds(1)))
    }

    /// A store delegating to `healthy` whose `update` fails on the listed calls, counting from 1.
    fn flaky_store(healthy: InMemoryJobStore, failing_calls: &'static [usize]) -> MockJobStore {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut store = MockJobStore::new();
        store.expect_list_active().returning({
            let healthy = healthy.clone();
            move || futures::executor::block_on(healthy.list_active())
        });
        store.expect_update().returning(move |id, transition| {
            let call = calls.fetch_add(1, Ordering::SeqCst) + 1;
            if failing_calls.contains(&call) {
                return Err(StoreError::Unavailable("blip".to_owned()));
            }
            futures::executor::block_on(healthy.update(id, transition))
        });
        store
    }

    #[test]
    fn due_filter() {
        let now = Utc::now();
        let config = SchedulerConfig::default();

        assert!(is_due(&overdue(now), now, &config));
        assert!(is_due(
            &overdue(now).with_status(JobStatus::Completed),
            now,
            &config
        ));
        assert!(is_due(&Job::mock_job().with_next_execution_at(Some(now)), now, &config));

        assert!(!is_due(&overdue(now).with_active(false), now, &config));
        assert!(!is_due(&overdue(now).with_status(JobStatus::Running), now, &config));
        assert!(!is_due(&overdue(now).with_status(JobStatus::Failed), now, &config));
        assert!(!is_due(&overdue(now).with_status(JobStatus::Cancelled), now, &config));
        assert!(!is_due(&overdue(now).with_next_execution_at(None), now, &config));
        assert!(!is_due(
            &overdue(now).with_next_execution_at(Some(now + TimeDelta::seconds(1))),
            now,
            &config
        ));
        assert!(!is_due(&overdue(now).with_failure_count(11), now, &config));
        assert!(is_due(&overdue(now).with_failure_count(10), now, &config));
        assert!(is_due(
            &overdue(now).with_failure_count(500),
            now,
            &config.with_abandonment_threshold(None)
        ));
    }

    #[test]
    fn due_filter_is_idempotent() {
        let now = Utc::now();
        let config = SchedulerConfig::default();
        let jobs: Vec<_> = (0..20)
            .map(|i| {
                overdue(now)
                    .with_next_execution_at(Some(now + TimeDelta::seconds(i - 10)))
                    .with_failure_count(i as u32)
            })
            .collect();
        let select = || {
            jobs.iter()
                .filter(|job| is_due(job, now, &config))
                .map(|job| job.id)
                .collect::<Vec<_>>()
        };

        assert_eq!(select(), select());
        assert_eq!(select().len(), 11);
    }

    #[tokio::test]
    async fn successful_tick() {
        let now = Utc::now();
        let job = overdue(now);
        let store = InMemoryJobStore::with_jobs([job.clone()]);
        let executor = Arc::new(StubExecutor::succeeding());

        let report = dispatcher(store.clone(), executor.clone(), SchedulerConfig::default())
            .run_tick_at(now)
            .await;

        assert_eq!(report.outcomes, vec![(job.id, JobOutcome::Succeeded)]);
        assert_eq!(executor.executions(), 1);
        let job = store.get_by_id(job.id).await.unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.success_count, 1);
        assert_eq!(job.retry_count, 0);
        assert_eq!(job.last_executed_at, Some(now));
        assert!(job.next_execution_at.unwrap() > now);
    }

    #[tokio::test]
    async fn inactive_and_future_jobs_are_untouched() {
        let now = Utc::now();
        let inactive = overdue(now).with_active(false).with_status(JobStatus::Completed);
        let future = Job::mock_job().with_next_execution_at(Some(now + TimeDelta::minutes(1)));
        let store = InMemoryJobStore::with_jobs([inactive.clone(), future.clone()]);
        let executor = Arc::new(StubExecutor::succeeding());

        let report = dispatcher(store.clone(), executor.clone(), SchedulerConfig::default())
            .run_tick_at(now)
            .await;

        assert_eq!(report.considered, 1);
        assert_eq!(report.due, 0);
        assert_eq!(executor.executions(), 0);
        assert_eq!(store.get_by_id(inactive.id).await.unwrap(), inactive);
        assert_eq!(store.get_by_id(future.id).await.unwrap(), future);
    }

    #[tokio::test]
    async fn always_failing_job_ends_failed() {
        let job = Job::mock_job()
            .with_cron_expression("0 2 * * *")
            .with_max_retries(3)
            .with_next_execution_at(Some(Utc.with_ymd_and_hms(2024, 5, 2, 2, 0, 0).unwrap()));
        let store = InMemoryJobStore::with_jobs([job.clone()]);
        let dispatcher = dispatcher(
            store.clone(),
            Arc::new(StubExecutor::failing("connection refused")),
            SchedulerConfig::default(),
        );

        for _ in 0..3 {
            let now = store
                .get_by_id(job.id)
                .await
                .unwrap()
                .next_execution_at
                .unwrap();
            let report = dispatcher.run_tick_at(now).await;
            assert_eq!(report.failed(), 1);
        }

        let job = store.get_by_id(job.id).await.unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.retry_count, 3);
        assert_eq!(job.failure_count, 3);
        assert_eq!(
            job.last_error.as_deref(),
            Some("Function `stub` failed: connection refused")
        );

        let report = dispatcher
            .run_tick_at(job.next_execution_at.unwrap())
            .await;
        assert_eq!(report.due, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrency_limit_defers_excess_jobs() {
        let now = Utc::now();
        let jobs: Vec<_> = (0..10).map(|_| overdue(now)).collect();
        let store = InMemoryJobStore::with_jobs(jobs.clone());
        let executor = Arc::new(StubExecutor::succeeding().with_delay(Duration::from_millis(50)));

        let report = dispatcher(
            store.clone(),
            executor.clone(),
            SchedulerConfig::default().with_max_concurrent_jobs(5),
        )
        .run_tick_at(now)
        .await;

        assert_eq!(report.due, 10);
        assert_eq!(report.admitted, 5);
        assert_eq!(report.deferred, 5);
        assert_eq!(report.succeeded(), 5);
        assert_eq!(executor.executions(), 5);
        assert!(executor.max_in_flight() <= 5);

        let mut untouched = 0;
        for job in &jobs {
            let stored = store.get_by_id(job.id).await.unwrap();
            if stored.status == JobStatus::Pending {
                assert_eq!(stored.next_execution_at, job.next_execution_at);
                untouched += 1;
            }
        }
        assert_eq!(untouched, 5);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn admitted_jobs_run_concurrently() {
        let now = Utc::now();
        let store = InMemoryJobStore::with_jobs((0..3).map(|_| overdue(now)));
        let executor = Arc::new(StubExecutor::succeeding().with_delay(Duration::from_millis(200)));

        let report = dispatcher(store, executor.clone(), SchedulerConfig::default())
            .run_tick_at(now)
            .await;

        assert_eq!(report.succeeded(), 3);
        assert_eq!(executor.max_in_flight(), 3);
    }

    #[tokio::test]
    async fn overlapping_ticks_execute_a_job_once() {
        let now = Utc::now();
        let job = overdue(now);
        let store = InMemoryJobStore::with_jobs([job.clone()]);
        let executor = Arc::new(StubExecutor::succeeding().with_delay(Duration::from_millis(20)));
        let dispatcher = dispatcher(store, executor.clone(), SchedulerConfig::default());

        let (first, second) =
            tokio::join!(dispatcher.run_tick_at(now), dispatcher.run_tick_at(now));

        assert_eq!(executor.executions(), 1);
        let mut outcomes = [first.outcomes, second.outcomes].concat();
        outcomes.sort_by_key(|(_, outcome)| outcome != &JobOutcome::Succeeded);
        assert_eq!(outcomes.first(), Some(&(job.id, JobOutcome::Succeeded)));
        assert!(outcomes[1..]
            .iter()
            .all(|(_, outcome)| outcome == &JobOutcome::Skipped));
    }

    #[tokio::test]
    async fn panicking_executor_is_a_failure() {
        let now = Utc::now();
        let job = overdue(now);
        let store = InMemoryJobStore::with_jobs([job.clone()]);
        let sibling = overdue(now);
        store.save(sibling.clone()).await.unwrap();

        let report = dispatcher(
            store.clone(),
            Arc::new(StubExecutor::panicking("oh no")),
            SchedulerConfig::default(),
        )
        .run_tick_at(now)
        .await;

        assert_eq!(report.failed(), 2);
        let job = store.get_by_id(job.id).await.unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.last_error.as_deref(), Some("Job panicked: oh no"));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_execution_times_out() {
        let now = Utc::now();
        let job = overdue(now);
        let store = InMemoryJobStore::with_jobs([job.clone()]);
        let executor = StubExecutor::succeeding()
            .with_delay(Duration::from_secs(60))
            .with_timeout(Duration::from_secs(1));

        let report = dispatcher(store.clone(), Arc::new(executor), SchedulerConfig::default())
            .run_tick_at(now)
            .await;

        assert_matches!(&report.outcomes[..], [(_, JobOutcome::Failed(message))] => {
            assert!(message.contains("timeout"));
        });
        let job = store.get_by_id(job.id).await.unwrap();
        assert_eq!(job.failure_count, 1);
        assert_eq!(job.last_executed_at, Some(now));
    }

    #[tokio::test]
    async fn store_unavailable_ends_tick() {
        let mut store = MockJobStore::new();
        store
            .expect_list_active()
            .returning(|| Err(StoreError::Unavailable("connection refused".to_owned())));
        store.expect_update().never();
        let executor = Arc::new(StubExecutor::succeeding());

        let report = dispatcher(store, executor.clone(), SchedulerConfig::default())
            .run_tick()
            .await;

        assert_eq!(
            report.store_error.as_deref(),
            Some("Job store unavailable: connection refused")
        );
        assert_eq!(report.admitted, 0);
        assert_eq!(executor.executions(), 0);
    }

    #[tokio::test]
    async fn persistence_failure_does_not_abort_siblings() {
        let now = Utc::now();
        let healthy = InMemoryJobStore::with_jobs([overdue(now), overdue(now)]);
        let jobs = healthy.list_active().await.unwrap();
        let broken = jobs[0].id;

        let mut store = MockJobStore::new();
        store.expect_list_active().returning({
            let jobs = jobs.clone();
            move || Ok(jobs.clone())
        });
        store.expect_update().returning(move |id, transition| {
            if id == broken {
                return Err(StoreError::Unavailable("disk full".to_owned()));
            }
            let healthy = healthy.clone();
            futures::executor::block_on(healthy.update(id, transition))
        });
        let executor = Arc::new(StubExecutor::succeeding());

        let report = dispatcher(store, executor.clone(), SchedulerConfig::default())
            .run_tick_at(now)
            .await;

        assert_eq!(report.admitted, 1);
        assert!(report.outcomes.contains(&(
            broken,
            JobOutcome::Persistence("Job store unavailable: disk full".to_owned())
        )));
        assert!(report
            .outcomes
            .contains(&(jobs[1].id, JobOutcome::Succeeded)));
        assert_eq!(executor.executions(), 1);
    }

    #[tokio::test]
    async fn outcome_write_is_retried() {
        let now = Utc::now();
        let job = overdue(now);
        let healthy = InMemoryJobStore::with_jobs([job.clone()]);
        // claim, then the first outcome write
        let store = flaky_store(healthy.clone(), &[2]);
        let executor = Arc::new(StubExecutor::succeeding());

        let report = dispatcher(store, executor.clone(), SchedulerConfig::default())
            .run_tick_at(now)
            .await;

        assert_eq!(report.outcomes, vec![(job.id, JobOutcome::Succeeded)]);
        let stored = healthy.get_by_id(job.id).await.unwrap();
        assert_eq!(stored.status, JobStatus::Completed);
        assert_eq!(stored.success_count, 1);
        assert_eq!(executor.executions(), 1);
    }

    #[tokio::test]
    async fn unrecorded_outcome_releases_job() {
        let now = Utc::now();
        let job = overdue(now);
        let healthy = InMemoryJobStore::with_jobs([job.clone()]);
        // both outcome writes of the first cycle
        let store = flaky_store(healthy.clone(), &[2, 3]);
        let executor = Arc::new(StubExecutor::succeeding());
        let dispatcher = dispatcher(store, executor.clone(), SchedulerConfig::default());

        let report = dispatcher.run_tick_at(now).await;

        assert_eq!(
            report.outcomes,
            vec![(
                job.id,
                JobOutcome::Persistence("Job store unavailable: blip".to_owned())
            )]
        );
        let stored = healthy.get_by_id(job.id).await.unwrap();
        assert_eq!(stored.status, JobStatus::Pending);
        assert_eq!(stored.next_execution_at, job.next_execution_at);
        assert_eq!(stored.success_count, 0);

        let report = dispatcher.run_tick_at(now).await;

        assert_eq!(report.outcomes, vec![(job.id, JobOutcome::Succeeded)]);
        assert_eq!(
            healthy.get_by_id(job.id).await.unwrap().status,
            JobStatus::Completed
        );
        assert_eq!(executor.executions(), 2);
    }

    #[tokio::test]
    async fn skipped_job_frees_its_slot() {
        let now = Utc::now();
        let first = overdue(now);
        let second = overdue(now);
        let healthy = InMemoryJobStore::with_jobs([
            first.clone().with_status(JobStatus::Running),
            second.clone(),
        ]);
        let mut store = MockJobStore::new();
        store.expect_list_active().returning({
            let listed = vec![first.clone(), second.clone()];
            move || Ok(listed.clone())
        });
        store.expect_update().returning(move |id, transition| {
            futures::executor::block_on(healthy.update(id, transition))
        });
        let executor = Arc::new(StubExecutor::succeeding());

        let report = dispatcher(
            store,
            executor.clone(),
            SchedulerConfig::default().with_max_concurrent_jobs(1),
        )
        .run_tick_at(now)
        .await;

        assert_eq!(report.due, 2);
        assert_eq!(report.admitted, 1);
        assert_eq!(report.deferred, 0);
        assert_eq!(
            report.outcomes,
            vec![
                (first.id, JobOutcome::Skipped),
                (second.id, JobOutcome::Succeeded)
            ]
        );
        assert_eq!(executor.executions(), 1);
    }

    #[tokio::test]
    async fn oversized_concurrency_limit_is_clamped() {
        let config = SchedulerConfig {
            max_concurrent_jobs: usize::MAX,
            ..SchedulerConfig::default()
        };

        let dispatcher = dispatcher(
            InMemoryJobStore::new(),
            Arc::new(StubExecutor::succeeding()),
            config,
        );

        assert_eq!(
            dispatcher.permits.available_permits(),
            Semaphore::MAX_PERMITS
        );
    }

    #[tokio::test]
    async fn trigger_runs_job_outside_schedule() {
        let job = Job::mock_job()
            .with_next_execution_at(Some(Utc::now() + TimeDelta::hours(1)))
            .with_status(JobStatus::Failed);
        let store = InMemoryJobStore::with_jobs([job.clone()]);
        let executor = Arc::new(StubExecutor::failing("nope"));

        let job = dispatcher(store, executor.clone(), SchedulerConfig::default())
            .trigger(job.id)
            .await
            .unwrap();

        assert_eq!(executor.executions(), 1);
        assert_eq!(job.failure_count, 1);
        assert_eq!(job.last_error.as_deref(), Some("Function `stub` failed: nope"));
    }

    #[tokio::test]
    async fn trigger_running_job_returns_it_unchanged() {
        let job = Job::mock_job().with_status(JobStatus::Running);
        let store = InMemoryJobStore::with_jobs([job.clone()]);
        let executor = Arc::new(StubExecutor::succeeding());

        let triggered = dispatcher(store, executor.clone(), SchedulerConfig::default())
            .trigger(job.id)
            .await
            .unwrap();

        assert_eq!(triggered, job);
        assert_eq!(executor.executions(), 0);
    }

    #[tokio::test]
    async fn trigger_unknown_job() {
        let dispatcher = dispatcher(
            InMemoryJobStore::new(),
            Arc::new(StubExecutor::succeeding()),
            SchedulerConfig::default(),
        );

        assert_matches!(
            dispatcher.trigger(JobId::new()).await,
            Err(StoreError::NotFound(_))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn run_ticks_until_cancelled() {
        let store = InMemoryJobStore::with_jobs([Job::mock_job()
            .with_cron_expression("* * * * *")
            .with_next_execution_at(Some(Utc::now() - TimeDelta::seconds(1)))]);
        let executor = Arc::new(StubExecutor::succeeding());
        let dispatcher = Arc::new(dispatcher(
            store,
            executor.clone(),
            SchedulerConfig::default().with_tick_interval(Duration::from_secs(60)),
        ));
        let cancellation_token = CancellationToken::new();

        let handle = tokio::spawn(dispatcher.run(cancellation_token.clone()));
        tokio::time::sleep(Duration::from_millis(10)).await;
        cancellation_token.cancel();
        handle.await.unwrap();

        assert_eq!(executor.executions(), 1);
    }
}
