//! Persistence of job records.
//!
//! The scheduler only ever talks to storage through the [`JobStore`] trait. An
//! [`memory::InMemoryJobStore`] is provided for tests and single-process deployments; the
//! `jobtick-sqlx` crate provides a Postgres implementation.
//!
//! Implementations can be checked against the expected behaviour with the
//! [`test_suite`](crate::test_suite) macro.
use async_trait::async_trait;
use thiserror::Error;

use crate::job::{Job, JobId, JobStatus};

pub mod memory;
#[doc(hidden)]
pub mod testing;

/// A conditional modification of a single job record.
///
/// Receives the currently stored record and returns the record to store, or [`None`] to leave
/// the stored record untouched.
pub type Transition = Box<dyn FnOnce(Job) -> Option<Job> + Send>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Job {0} not found")]
    NotFound(JobId),
    #[error("Job store unavailable: {0}")]
    Unavailable(String),
    #[error("Conflicting write to job {0}")]
    Conflict(JobId),
    #[error("Error encoding or decoding job")]
    Encode(#[from] serde_json::Error),
}

/// Durable storage of [`Job`] records.
///
/// Reads must observe every write previously acknowledged for the same job id.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait JobStore: Send + Sync {
    /// All jobs with `is_active` set, earliest `next_execution_at` first. Jobs without a next
    /// execution time come last.
    async fn list_active(&self) -> Result<Vec<Job>, StoreError>;

    async fn get_by_id(&self, id: JobId) -> Result<Job, StoreError>;

    /// Insert or replace `job`, returning the stored record with `updated_at` refreshed.
    async fn save(&self, job: Job) -> Result<Job, StoreError>;

    /// All jobs with the given status, newest first.
    async fn list_by_status(&self, status: JobStatus) -> Result<Vec<Job>, StoreError>;

    /// Every job, newest first.
    async fn list_all(&self) -> Result<Vec<Job>, StoreError>;

    async fn remove(&self, id: JobId) -> Result<(), StoreError>;

    /// Atomically apply `transition` to the stored record of job `id`.
    ///
    /// No other write to the same job may interleave between reading the record and writing
    /// the transitioned one. Returns the stored record when the transition produced one, and
    /// `Ok(None)` when it declined.
    async fn update(&self, id: JobId, transition: Transition) -> Result<Option<Job>, StoreError>;
}
