use chrono::{DateTime, Utc};
use jobtick::{
    job::{Job, JobId, JobStatus, JobType},
    store::StoreError,
};
use sqlx::prelude::FromRow;
use uuid::Uuid;

#[derive(sqlx::Type, Debug, Clone, Copy, PartialEq, Eq)]
#[sqlx(type_name = "jobtick_job_status", rename_all = "lowercase")]
pub(crate) enum PgJobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl From<PgJobStatus> for JobStatus {
    fn from(value: PgJobStatus) -> Self {
        match value {
            PgJobStatus::Pending => Self::Pending,
            PgJobStatus::Running => Self::Running,
            PgJobStatus::Completed => Self::Completed,
            PgJobStatus::Failed => Self::Failed,
            PgJobStatus::Cancelled => Self::Cancelled,
        }
    }
}

impl From<JobStatus> for PgJobStatus {
    fn from(value: JobStatus) -> Self {
        match value {
            JobStatus::Pending => Self::Pending,
            JobStatus::Running => Self::Running,
            JobStatus::Completed => Self::Completed,
            JobStatus::Failed => Self::Failed,
            JobStatus::Cancelled => Self::Cancelled,
        }
    }
}

#[derive(sqlx::Type, Debug, Clone, Copy, PartialEq, Eq)]
#[sqlx(type_name = "jobtick_job_type", rename_all = "snake_case")]
pub(crate) enum PgJobType {
    HttpRequest,
    FunctionCall,
    Email,
    Notification,
}

impl From<PgJobType> for JobType {
    fn from(value: PgJobType) -> Self {
        match value {
            PgJobType::HttpRequest => Self::HttpRequest,
            PgJobType::FunctionCall => Self::FunctionCall,
            PgJobType::Email => Self::Email,
            PgJobType::Notification => Self::Notification,
        }
    }
}

impl From<JobType> for PgJobType {
    fn from(value: JobType) -> Self {
        match value {
            JobType::HttpRequest => Self::HttpRequest,
            JobType::FunctionCall => Self::FunctionCall,
            JobType::Email => Self::Email,
            JobType::Notification => Self::Notification,
        }
    }
}

#[derive(Debug, FromRow)]
pub(crate) struct JobRow {
    pub id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub cron_expression: String,
    pub job_type: PgJobType,
    pub config: String,
    pub status: PgJobStatus,
    pub is_active: bool,
    pub last_executed_at: Option<DateTime<Utc>>,
    pub next_execution_at: Option<DateTime<Utc>>,
    pub success_count: i64,
    pub failure_count: i64,
    pub last_error: Option<String>,
    pub max_retries: i32,
    pub retry_count: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

fn in_range<T, U>(id: Uuid, column: &str, value: T) -> Result<U, StoreError>
where
    T: Copy + std::fmt::Display,
    U: TryFrom<T>,
{
    U::try_from(value).map_err(|_| {
        StoreError::Unavailable(format!("job {id} has out of range {column}: {value}"))
    })
}

impl TryFrom<JobRow> for Job {
    type Error = StoreError;

    fn try_from(value: JobRow) -> Result<Self, Self::Error> {
        let id = value.id;
        Ok(Self {
            id: JobId::from(id),
            name: value.name,
            description: value.description,
            cron_expression: value.cron_expression,
            job_type: value.job_type.into(),
            config: value.config,
            status: value.status.into(),
            is_active: value.is_active,
            last_executed_at: value.last_executed_at,
            next_execution_at: value.next_execution_at,
            success_count: in_range(id, "success_count", value.success_count)?,
            failure_count: in_range(id, "failure_count", value.failure_count)?,
            last_error: value.last_error,
            max_retries: in_range(id, "max_retries", value.max_retries)?,
            retry_count: in_range(id, "retry_count", value.retry_count)?,
            created_at: value.created_at,
            updated_at: value.updated_at,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn row() -> JobRow {
        let now = Utc::now();
        JobRow {
            id: Uuid::new_v4(),
            name: "report".to_owned(),
            description: None,
            cron_expression: "0 2 * * *".to_owned(),
            job_type: PgJobType::Email,
            config: r#"{"to":"ops@example.com"}"#.to_owned(),
            status: PgJobStatus::Failed,
            is_active: true,
            last_executed_at: Some(now),
            next_execution_at: None,
            success_count: 7,
            failure_count: 3,
            last_error: Some("smtp down".to_owned()),
            max_retries: 3,
            retry_count: 3,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn row_converts_to_job() {
        let row = row();
        let id = row.id;

        let job = Job::try_from(row).unwrap();

        assert_eq!(Uuid::from(job.id), id);
        assert_eq!(job.job_type, JobType::Email);
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.success_count, 7);
        assert_eq!(job.retry_count, 3);
    }

    #[test]
    fn negative_counter_is_rejected() {
        let row = JobRow {
            failure_count: -1,
            ..row()
        };

        let result = Job::try_from(row);

        assert!(
            matches!(result, Err(StoreError::Unavailable(message)) if message.contains("failure_count"))
        );
    }
}
