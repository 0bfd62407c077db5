//! The persisted job record and the types describing its state.
//!
//! A [`Job`] describes a recurring unit of work: when it should run (a five field cron
//! expression), what it should do ([`JobType`] plus a serialized config) and what has happened
//! so far (status, counters and the last error).
use std::{fmt::Display, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ValidationError;

pub mod builder;
pub mod config;
pub mod lifecycle;

use config::{ConfigError, JobConfig};

/// The default number of consecutive failures tolerated before a job is left failed.
pub const DEFAULT_MAX_RETRIES: u16 = 3;
/// The largest retry budget a job can be configured with.
pub const MAX_RETRIES_LIMIT: u16 = 10;

#[derive(Debug, Eq, PartialEq, Clone, Copy, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for JobId {
    fn from(value: Uuid) -> Self {
        Self(value)
    }
}

impl From<JobId> for Uuid {
    fn from(value: JobId) -> Self {
        value.0
    }
}

impl FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(s.parse()?))
    }
}

impl Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Where a job is in its execution state machine.
///
/// `Pending -> Running -> {Completed, Failed}`, returning to `Pending` while the retry budget
/// allows. `Cancelled` is only reached by deactivating the job.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub const ALL: [JobStatus; 5] = [
        JobStatus::Pending,
        JobStatus::Running,
        JobStatus::Completed,
        JobStatus::Failed,
        JobStatus::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| ValidationError::UnknownStatus(s.to_owned()))
    }
}

/// The closed set of actions a job can perform.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    HttpRequest,
    FunctionCall,
    Email,
    Notification,
}

impl JobType {
    pub const ALL: [JobType; 4] = [
        JobType::HttpRequest,
        JobType::FunctionCall,
        JobType::Email,
        JobType::Notification,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::HttpRequest => "http_request",
            Self::FunctionCall => "function_call",
            Self::Email => "email",
            Self::Notification => "notification",
        }
    }
}

impl Display for JobType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobType {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|job_type| job_type.as_str() == s)
            .ok_or_else(|| ValidationError::UnknownJobType(s.to_owned()))
    }
}

/// A recurring job as held by a [`crate::store::JobStore`].
///
/// `config` holds the serialized JSON text of the job's configuration, as it is persisted. Use
/// [`Job::typed_config`] to decode it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: JobId,
    pub name: String,
    pub description: Option<String>,
    pub cron_expression: String,
    #[serde(rename = "type")]
    pub job_type: JobType,
    pub config: String,
    pub status: JobStatus,
    pub is_active: bool,
    pub last_executed_at: Option<DateTime<Utc>>,
    pub next_execution_at: Option<DateTime<Utc>>,
    pub success_count: u32,
    pub failure_count: u32,
    pub last_error: Option<String>,
    pub max_retries: u16,
    pub retry_count: u16,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Decode the stored config into the variant matching this job's type.
    pub fn typed_config(&self) -> Result<JobConfig, ConfigError> {
        JobConfig::parse(self.job_type, &self.config)
    }

    /// Decode the stored config as an untyped JSON object.
    pub fn config_map(&self) -> Result<serde_json::Map<String, serde_json::Value>, ConfigError> {
        config::parse_mapping(&self.config)
    }

    /// Whether the retry budget is spent.
    pub fn retries_exhausted(&self) -> bool {
        self.retry_count >= self.max_retries
    }
}

/// The data needed to create a job.
///
/// Usually constructed via [`builder::JobBuilder`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewJob {
    pub name: String,
    pub description: Option<String>,
    pub cron_expression: String,
    #[serde(rename = "type")]
    pub job_type: JobType,
    pub config: serde_json::Value,
    pub is_active: Option<bool>,
    pub max_retries: Option<u16>,
}

/// A partial update of a job's definition. Fields left as `None` are unchanged.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobUpdate {
    pub name: Option<String>,
    pub description: Option<String>,
    pub cron_expression: Option<String>,
    #[serde(rename = "type")]
    pub job_type: Option<JobType>,
    pub config: Option<serde_json::Value>,
    pub is_active: Option<bool>,
    pub max_retries: Option<u16>,
}

/// Aggregate job counts, computed on demand.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulerStatus {
    pub total_jobs: usize,
    pub active_jobs: usize,
    pub pending_jobs: usize,
    pub running_jobs: usize,
    pub completed_jobs: usize,
    pub failed_jobs: usize,
}

impl SchedulerStatus {
    pub(crate) fn from_jobs<'a>(jobs: impl IntoIterator<Item = &'a Job>) -> Self {
        jobs.into_iter().fold(Self::default(), |mut status, job| {
            status.total_jobs += 1;
            if job.is_active {
                status.active_jobs += 1;
            }
            match job.status {
                JobStatus::Pending => status.pending_jobs += 1,
                JobStatus::Running => status.running_jobs += 1,
                JobStatus::Completed => status.completed_jobs += 1,
                JobStatus::Failed => status.failed_jobs += 1,
                JobStatus::Cancelled => {}
            }
            status
        })
    }
}
