//! Provides an in memory implementation of [`JobStore`].
//!
//! Records live only as long as the process. This is a correct implementation suitable for
//! tests and for single process deployments that do not need jobs to survive a restart.
use std::{
    cmp::Reverse,
    collections::HashMap,
    sync::{Arc, RwLock},
};

use async_trait::async_trait;
use chrono::Utc;

use super::{JobStore, StoreError, Transition};
use crate::job::{Job, JobId, JobStatus};

/// An in memory implementation of [`JobStore`].
///
/// Clones share the same underlying records.
#[derive(Clone, Debug, Default)]
pub struct InMemoryJobStore {
    jobs: Arc<RwLock<HashMap<JobId, Job>>>,
}

impl InMemoryJobStore {
    /// Creates a new, empty instance of [`InMemoryJobStore`].
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store holding `jobs` exactly as given.
    pub fn with_jobs(jobs: impl IntoIterator<Item = Job>) -> Self {
        Self {
            jobs: Arc::new(RwLock::new(
                jobs.into_iter().map(|job| (job.id, job)).collect(),
            )),
        }
    }

    fn collect(&self, filter: impl Fn(&Job) -> bool) -> Result<Vec<Job>, StoreError> {
        Ok(self
            .jobs
            .read()
            .map_err(|_| poisoned())?
            .values()
            .filter(|job| filter(job))
            .cloned()
            .collect())
    }

    fn newest_first(&self, filter: impl Fn(&Job) -> bool) -> Result<Vec<Job>, StoreError> {
        let mut jobs = self.collect(filter)?;
        jobs.sort_by_key(|job| Reverse(job.created_at));
        Ok(jobs)
    }
}

fn poisoned() -> StoreError {
    StoreError::Unavailable("in memory store lock poisoned".to_owned())
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn list_active(&self) -> Result<Vec<Job>, StoreError> {
        let mut jobs = self.collect(|job| job.is_active)?;
        jobs.sort_by_key(|job| {
            (
                job.next_execution_at.is_none(),
                job.next_execution_at,
                job.created_at,
            )
        });
        Ok(jobs)
    }

    async fn get_by_id(&self, id: JobId) -> Result<Job, StoreError> {
        self.jobs
            .read()
            .map_err(|_| poisoned())?
            .get(&id)
            .cloned()
            .ok_or(StoreError::NotFound(id))
    }

    async fn save(&self, job: Job) -> Result<Job, StoreError> {
        let job = Job {
            updated_at: Utc::now(),
            ..job
        };
        self.jobs
            .write()
            .map_err(|_| poisoned())?
            .insert(job.id, job.clone());
        Ok(job)
    }

    async fn list_by_status(&self, status: JobStatus) -> Result<Vec<Job>, StoreError> {
        self.newest_first(|job| job.status == status)
    }

    async fn list_all(&self) -> Result<Vec<Job>, StoreError> {
        self.newest_first(|_| true)
    }

    async fn remove(&self, id: JobId) -> Result<(), StoreError> {
        self.jobs
            .write()
            .map_err(|_| poisoned())?
            .remove(&id)
            .map(|_| ())
            .ok_or(StoreError::NotFound(id))
    }

    async fn update(&self, id: JobId, transition: Transition) -> Result<Option<Job>, StoreError> {
        let mut jobs = self.jobs.write().map_err(|_| poisoned())?;
        let current = jobs.get(&id).cloned().ok_or(StoreError::NotFound(id))?;
        let Some(next) = transition(current) else {
            return Ok(None);
        };
        if next.id != id {
            return Err(StoreError::Conflict(id));
        }
        let next = Job {
            updated_at: Utc::now(),
            ..next
        };
        jobs.insert(id, next.clone());
        Ok(Some(next))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_suite;

    test_suite!(for: InMemoryJobStore::new());

    #[tokio::test]
    async fn clones_share_records() {
        let store = InMemoryJobStore::new();
        let job = Job::mock_job();

        store.clone().save(job.clone()).await.unwrap();

        assert_eq!(store.get_by_id(job.id).await.unwrap().name, job.name);
    }
}
