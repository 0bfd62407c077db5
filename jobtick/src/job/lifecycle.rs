//! The execution state machine of a job.
//!
//! Every execution attempt moves a job through two persisted snapshots: the claim, written
//! before the executor runs, and the outcome, written after. Both are computed from the stored
//! record by pure functions and applied through [`JobStore::update`], so a concurrent write to
//! the same job (a deactivation, say) is never lost.
use std::sync::Arc;

use chrono::{DateTime, Utc};

use super::{Job, JobId, JobStatus};
use crate::{
    backoff::RetryPolicy,
    error::to_display_string,
    schedule::{ScheduleCalculator, ScheduleError},
    store::{JobStore, StoreError},
};

impl Job {
    /// The job as it is while executing.
    pub(crate) fn started(self, now: DateTime<Utc>) -> Self {
        Self {
            status: JobStatus::Running,
            last_executed_at: Some(now),
            ..self
        }
    }

    /// The job after an execution attempt finished with `outcome`, `next` being its next
    /// scheduled time computed at `now`.
    pub(crate) fn finished(
        self,
        outcome: Result<(), String>,
        next: Result<DateTime<Utc>, ScheduleError>,
        retry_policy: &RetryPolicy,
        now: DateTime<Utc>,
    ) -> Self {
        let cancelled = self.status == JobStatus::Cancelled;
        let mut job = match outcome {
            Ok(()) => Self {
                status: JobStatus::Completed,
                success_count: self.success_count.saturating_add(1),
                retry_count: 0,
                ..self
            },
            Err(message) => {
                let mut job = Self {
                    failure_count: self.failure_count.saturating_add(1),
                    last_error: Some(message),
                    retry_count: self.retry_count.saturating_add(1).min(self.max_retries),
                    ..self
                };
                job.status = if job.retries_exhausted() {
                    JobStatus::Failed
                } else {
                    JobStatus::Pending
                };
                job
            }
        };

        match next {
            Ok(scheduled) if job.status == JobStatus::Pending => {
                job.next_execution_at =
                    Some(retry_policy.next_retry_at(job.retry_count, scheduled, now));
            }
            Ok(scheduled) => job.next_execution_at = Some(scheduled),
            Err(error) => {
                tracing::warn!(?error, job_id = %job.id, "Job can no longer be scheduled: {error}");
                job.status = JobStatus::Failed;
                job.next_execution_at = None;
                job.last_error = Some(to_display_string(&error));
            }
        }

        if cancelled {
            job.status = JobStatus::Cancelled;
        }
        job
    }

    /// The job as it was before a claim whose outcome could not be recorded.
    ///
    /// `next_execution_at` is left alone so the job stays due.
    pub(crate) fn released(self) -> Self {
        Self {
            status: JobStatus::Pending,
            ..self
        }
    }

    /// The job after being switched on, next due at `next`.
    pub(crate) fn activated(self, next: DateTime<Utc>) -> Self {
        Self {
            is_active: true,
            status: JobStatus::Pending,
            retry_count: 0,
            next_execution_at: Some(next),
            ..self
        }
    }

    /// The job after being switched off.
    pub(crate) fn deactivated(self) -> Self {
        Self {
            is_active: false,
            status: JobStatus::Cancelled,
            ..self
        }
    }
}

/// Applies execution outcomes to stored job records.
#[derive(Clone)]
pub struct LifecycleController {
    store: Arc<dyn JobStore>,
    schedule: Arc<dyn ScheduleCalculator>,
    retry_policy: RetryPolicy,
}

impl std::fmt::Debug for LifecycleController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LifecycleController")
            .field("retry_policy", &self.retry_policy)
            .finish_non_exhaustive()
    }
}

impl LifecycleController {
    pub fn new(
        store: Arc<dyn JobStore>,
        schedule: Arc<dyn ScheduleCalculator>,
        retry_policy: RetryPolicy,
    ) -> Self {
        Self {
            store,
            schedule,
            retry_policy,
        }
    }

    /// Mark job `id` as running if `admit` accepts its current record.
    ///
    /// Returns the running record, or [`None`] when the job is already running or `admit`
    /// declined it.
    pub async fn claim<F>(
        &self,
        id: JobId,
        now: DateTime<Utc>,
        admit: F,
    ) -> Result<Option<Job>, StoreError>
    where
        F: FnOnce(&Job) -> bool + Send + 'static,
    {
        self.store
            .update(
                id,
                Box::new(move |job: Job| {
                    (job.status != JobStatus::Running && admit(&job)).then(|| job.started(now))
                }),
            )
            .await
    }

    /// Record the outcome of the execution of job `id` that started from a claim.
    pub async fn record(
        &self,
        id: JobId,
        outcome: Result<(), String>,
        now: DateTime<Utc>,
    ) -> Result<Job, StoreError> {
        let schedule = self.schedule.clone();
        let retry_policy = self.retry_policy;
        self.store
            .update(
                id,
                Box::new(move |job: Job| {
                    let next = schedule.next_execution_time(&job.cron_expression, now);
                    Some(job.finished(outcome, next, &retry_policy, now))
                }),
            )
            .await?
            .ok_or(StoreError::Conflict(id))
    }

    /// Return job `id` to pending if it is still marked as running.
    ///
    /// Used when the outcome of an execution could not be recorded, so the job is not left
    /// running forever.
    pub async fn release(&self, id: JobId) -> Result<Option<Job>, StoreError> {
        self.store
            .update(
                id,
                Box::new(|job: Job| (job.status == JobStatus::Running).then(|| job.released())),
            )
            .await
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use chrono::{TimeDelta, TimeZone};

    use super::*;
    use crate::{
        backoff::BackoffStrategy,
        schedule::CronCalculator,
        store::{memory::InMemoryJobStore, MockJobStore},
    };

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    fn next(job: &Job, at: DateTime<Utc>) -> Result<DateTime<Utc>, ScheduleError> {
        CronCalculator.next_execution_time(&job.cron_expression, at)
    }

    fn fail(job: Job, at: DateTime<Utc>) -> Job {
        let next = next(&job, at);
        job.started(at)
            .finished(Err("boom".to_owned()), next, &RetryPolicy::FollowSchedule, at)
    }

    #[test]
    fn success_completes_and_resets_retries() {
        let job = Job {
            retry_count: 2,
            last_error: Some("earlier".to_owned()),
            ..Job::mock_job().with_cron_expression("0 2 * * *")
        };

        let next = next(&job, now());
        let job = job
            .started(now())
            .finished(Ok(()), next, &RetryPolicy::FollowSchedule, now());

        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.success_count, 1);
        assert_eq!(job.retry_count, 0);
        assert_eq!(job.last_executed_at, Some(now()));
        assert_eq!(job.last_error.as_deref(), Some("earlier"));
        assert_eq!(
            job.next_execution_at,
            Some(Utc.with_ymd_and_hms(2024, 1, 1, 2, 0, 0).unwrap())
        );
    }

    #[test]
    fn failures_retry_until_budget_is_spent() {
        let mut job = Job::mock_job()
            .with_cron_expression("0 2 * * *")
            .with_max_retries(3);
        let mut at = now();

        for (attempt, expected) in [
            (1, JobStatus::Pending),
            (2, JobStatus::Pending),
            (3, JobStatus::Failed),
        ] {
            job = fail(job, at);
            assert_eq!(job.status, expected);
            assert_eq!(job.retry_count, attempt);
            assert_eq!(job.failure_count, u32::from(attempt));
            at = job.next_execution_at.unwrap();
        }

        assert_eq!(job.last_error.as_deref(), Some("boom"));
        assert_eq!(
            job.next_execution_at,
            Some(Utc.with_ymd_and_hms(2024, 1, 3, 2, 0, 0).unwrap())
        );

        let job = fail(job, at);
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.retry_count, 3);
        assert_eq!(job.failure_count, 4);
    }

    #[test]
    fn retry_count_never_exceeds_max_retries() {
        for max_retries in [0, 1, 5, 10] {
            let mut job = Job::mock_job().with_max_retries(max_retries);
            for _ in 0..15 {
                job = fail(job, now());
                assert!(job.retry_count <= job.max_retries);
            }
            assert!(job.retries_exhausted());
            assert_eq!(job.status, JobStatus::Failed);
        }
    }

    #[test]
    fn zero_retries_fails_immediately() {
        let job = fail(Job::mock_job().with_max_retries(0), now());

        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.retry_count, 0);
        assert_eq!(job.failure_count, 1);
    }

    #[test]
    fn unschedulable_job_is_failed() {
        let job = Job::mock_job().with_cron_expression("0 0 30 2 *");

        let next = next(&job, now());
        let job = job
            .started(now())
            .finished(Ok(()), next, &RetryPolicy::FollowSchedule, now());

        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.success_count, 1);
        assert_eq!(job.next_execution_at, None);
        assert_matches!(job.last_error, Some(message) if message.contains("0 0 30 2 *"));
    }

    #[test]
    fn deactivation_during_execution_wins() {
        let job = Job::mock_job().started(now()).deactivated();

        let next = next(&job, now());
        let job = job.finished(Err("boom".to_owned()), next, &RetryPolicy::FollowSchedule, now());

        assert_eq!(job.status, JobStatus::Cancelled);
        assert!(!job.is_active);
        assert_eq!(job.failure_count, 1);
    }

    #[test]
    fn backoff_policy_brings_retry_forward() {
        let job = Job::mock_job().with_cron_expression("0 2 * * *");
        let policy = RetryPolicy::Backoff(BackoffStrategy::constant(TimeDelta::minutes(5)));

        let next = next(&job, now());
        let job = job
            .started(now())
            .finished(Err("boom".to_owned()), next, &policy, now());

        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.next_execution_at, Some(now() + TimeDelta::minutes(5)));
    }

    #[test]
    fn activation_resets_retries() {
        let job = Job {
            retry_count: 3,
            ..Job::mock_job()
                .with_status(JobStatus::Failed)
                .deactivated()
        };

        let job = job.activated(now());

        assert!(job.is_active);
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.retry_count, 0);
        assert_eq!(job.next_execution_at, Some(now()));
    }

    fn controller(store: impl JobStore + 'static) -> LifecycleController {
        LifecycleController::new(
            Arc::new(store),
            Arc::new(CronCalculator),
            RetryPolicy::FollowSchedule,
        )
    }

    #[tokio::test]
    async fn claim_refuses_running_job() {
        let job = Job::mock_job().with_status(JobStatus::Running);
        let controller = controller(InMemoryJobStore::with_jobs([job.clone()]));

        let claimed = controller.claim(job.id, now(), |_| true).await.unwrap();

        assert!(claimed.is_none());
    }

    #[tokio::test]
    async fn claim_then_record_persists_both_snapshots() {
        let store = InMemoryJobStore::new();
        let job = store.save(Job::mock_job()).await.unwrap();
        let controller = controller(store.clone());

        let claimed = controller
            .claim(job.id, now(), |job| job.is_active)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(claimed.status, JobStatus::Running);
        assert_eq!(
            store.get_by_id(job.id).await.unwrap().status,
            JobStatus::Running
        );

        let recorded = controller
            .record(job.id, Err("boom".to_owned()), now())
            .await
            .unwrap();
        assert_eq!(recorded.status, JobStatus::Pending);
        assert_eq!(store.get_by_id(job.id).await.unwrap(), recorded);
    }

    #[tokio::test]
    async fn release_returns_running_job_to_pending() {
        let next = Some(now() - TimeDelta::minutes(1));
        let running = Job::mock_job()
            .with_next_execution_at(next)
            .started(now());
        let idle = Job::mock_job().with_status(JobStatus::Completed);
        let controller = controller(InMemoryJobStore::with_jobs([running.clone(), idle.clone()]));

        let released = controller.release(running.id).await.unwrap().unwrap();

        assert_eq!(released.status, JobStatus::Pending);
        assert_eq!(released.next_execution_at, next);
        assert_eq!(released.last_executed_at, Some(now()));
        assert!(controller.release(idle.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn record_surfaces_store_failure() {
        let mut store = MockJobStore::new();
        store
            .expect_update()
            .returning(|_, _| Err(StoreError::Unavailable("connection refused".to_owned())));

        let result = controller(store)
            .record(JobId::new(), Ok(()), now())
            .await;

        assert_matches!(result, Err(StoreError::Unavailable(_)));
    }
}
