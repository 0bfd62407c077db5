//! A Postgres implementation of the jobtick [`JobStore`].
//!
//! Jobs live in the `jobtick_jobs` table created by the migrations shipped with this crate.
//! [`PgJobStore::from_pool`] applies them before returning.
//!
//! ```no_run
//! # use jobtick::prelude::*;
//! # use jobtick_sqlx::PgJobStore;
//! # async fn run(pool: sqlx::PgPool) -> Result<(), Box<dyn std::error::Error>> {
//! let store = PgJobStore::from_pool(pool).await?;
//! let scheduler = Scheduler::new(store, JobExecutor::new(FunctionRegistry::new()));
//! let handle = scheduler.spawn();
//! # handle.graceful_shutdown().await?;
//! # Ok(())
//! # }
//! ```
use std::ops::Deref;

use async_trait::async_trait;
use chrono::{SubsecRound, Utc};
use jobtick::{
    error::to_display_string,
    job::{Job, JobId, JobStatus},
    store::{JobStore, StoreError, Transition},
};
use sqlx::{PgExecutor, PgPool};
use tracing::instrument;
use uuid::Uuid;

mod types;

use types::{JobRow, PgJobStatus, PgJobType};

macro_rules! job_columns {
    () => {
        r#"
            id,
            name,
            description,
            cron_expression,
            job_type,
            config,
            status,
            is_active,
            last_executed_at,
            next_execution_at,
            success_count,
            failure_count,
            last_error,
            max_retries,
            retry_count,
            created_at,
            updated_at
        "#
    };
}

const SELECT_BY_ID: &str = concat!("SELECT", job_columns!(), "FROM jobtick_jobs WHERE id = $1");

const SELECT_BY_ID_FOR_UPDATE: &str = concat!(
    "SELECT",
    job_columns!(),
    "FROM jobtick_jobs WHERE id = $1 FOR UPDATE"
);

const SELECT_ACTIVE: &str = concat!(
    "SELECT",
    job_columns!(),
    "FROM jobtick_jobs WHERE is_active ORDER BY next_execution_at ASC NULLS LAST, created_at ASC"
);

const SELECT_BY_STATUS: &str = concat!(
    "SELECT",
    job_columns!(),
    "FROM jobtick_jobs WHERE status = $1 ORDER BY created_at DESC"
);

const SELECT_ALL: &str = concat!(
    "SELECT",
    job_columns!(),
    "FROM jobtick_jobs ORDER BY created_at DESC"
);

const UPSERT: &str = concat!(
    "INSERT INTO jobtick_jobs (",
    job_columns!(),
    r#") VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)
    ON CONFLICT (id) DO UPDATE SET
        name = EXCLUDED.name,
        description = EXCLUDED.description,
        cron_expression = EXCLUDED.cron_expression,
        job_type = EXCLUDED.job_type,
        config = EXCLUDED.config,
        status = EXCLUDED.status,
        is_active = EXCLUDED.is_active,
        last_executed_at = EXCLUDED.last_executed_at,
        next_execution_at = EXCLUDED.next_execution_at,
        success_count = EXCLUDED.success_count,
        failure_count = EXCLUDED.failure_count,
        last_error = EXCLUDED.last_error,
        max_retries = EXCLUDED.max_retries,
        retry_count = EXCLUDED.retry_count,
        created_at = EXCLUDED.created_at,
        updated_at = EXCLUDED.updated_at
    RETURNING"#,
    job_columns!()
);

/// A [`JobStore`] backed by a Postgres connection pool.
#[derive(Clone, Debug)]
pub struct PgJobStore {
    pool: PgPool,
}

impl Deref for PgJobStore {
    type Target = PgPool;

    fn deref(&self) -> &Self::Target {
        &self.pool
    }
}

impl PgJobStore {
    /// Connect to the database at `url` and apply any pending migrations.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let pool = PgPool::connect(url).await.map_err(unavailable)?;
        Self::from_pool(pool).await
    }

    /// Use `pool`, applying any pending migrations first.
    pub async fn from_pool(pool: PgPool) -> Result<Self, StoreError> {
        let this = Self { pool };
        this.migrate().await?;
        Ok(this)
    }

    /// Apply the migrations creating the `jobtick_jobs` table.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!()
            .run(&self.pool)
            .await
            .map_err(|error| StoreError::Unavailable(to_display_string(&error)))
    }
}

fn unavailable(error: sqlx::Error) -> StoreError {
    tracing::error!(?error, "Postgres job store error: {error}");
    StoreError::Unavailable(to_display_string(&error))
}

async fn upsert<'e, E>(executor: E, job: Job) -> Result<Job, StoreError>
where
    E: PgExecutor<'e>,
{
    sqlx::query_as::<_, JobRow>(UPSERT)
        .bind(Uuid::from(job.id))
        .bind(job.name)
        .bind(job.description)
        .bind(job.cron_expression)
        .bind(PgJobType::from(job.job_type))
        .bind(job.config)
        .bind(PgJobStatus::from(job.status))
        .bind(job.is_active)
        .bind(job.last_executed_at)
        .bind(job.next_execution_at)
        .bind(i64::from(job.success_count))
        .bind(i64::from(job.failure_count))
        .bind(job.last_error)
        .bind(i32::from(job.max_retries))
        .bind(i32::from(job.retry_count))
        .bind(job.created_at)
        .bind(Utc::now().trunc_subsecs(6))
        .fetch_one(executor)
        .await
        .map_err(unavailable)?
        .try_into()
}

fn into_jobs(rows: Vec<JobRow>) -> Result<Vec<Job>, StoreError> {
    rows.into_iter().map(Job::try_from).collect()
}

#[async_trait]
impl JobStore for PgJobStore {
    #[instrument(skip(self))]
    async fn list_active(&self) -> Result<Vec<Job>, StoreError> {
        into_jobs(
            sqlx::query_as(SELECT_ACTIVE)
                .fetch_all(self.deref())
                .await
                .map_err(unavailable)?,
        )
    }

    async fn get_by_id(&self, id: JobId) -> Result<Job, StoreError> {
        sqlx::query_as::<_, JobRow>(SELECT_BY_ID)
            .bind(Uuid::from(id))
            .fetch_optional(self.deref())
            .await
            .map_err(unavailable)?
            .ok_or(StoreError::NotFound(id))?
            .try_into()
    }

    async fn save(&self, job: Job) -> Result<Job, StoreError> {
        upsert(self.deref(), job).await
    }

    async fn list_by_status(&self, status: JobStatus) -> Result<Vec<Job>, StoreError> {
        into_jobs(
            sqlx::query_as(SELECT_BY_STATUS)
                .bind(PgJobStatus::from(status))
                .fetch_all(self.deref())
                .await
                .map_err(unavailable)?,
        )
    }

    async fn list_all(&self) -> Result<Vec<Job>, StoreError> {
        into_jobs(
            sqlx::query_as(SELECT_ALL)
                .fetch_all(self.deref())
                .await
                .map_err(unavailable)?,
        )
    }

    async fn remove(&self, id: JobId) -> Result<(), StoreError> {
        let result = sqlx::query("DELETE FROM jobtick_jobs WHERE id = $1")
            .bind(Uuid::from(id))
            .execute(self.deref())
            .await
            .map_err(unavailable)?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(id));
        }
        Ok(())
    }

    #[instrument(skip(self, transition))]
    async fn update(&self, id: JobId, transition: Transition) -> Result<Option<Job>, StoreError> {
        let mut tx = self.pool.begin().await.map_err(unavailable)?;

        let current: Job = sqlx::query_as::<_, JobRow>(SELECT_BY_ID_FOR_UPDATE)
            .bind(Uuid::from(id))
            .fetch_optional(&mut *tx)
            .await
            .map_err(unavailable)?
            .ok_or(StoreError::NotFound(id))?
            .try_into()?;

        let Some(next) = transition(current) else {
            tx.rollback().await.map_err(unavailable)?;
            return Ok(None);
        };
        if next.id != id {
            return Err(StoreError::Conflict(id));
        }

        let job = upsert(&mut *tx, next).await?;
        tx.commit().await.map_err(unavailable)?;
        Ok(Some(job))
    }
}
