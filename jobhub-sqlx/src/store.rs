use std::ops::Deref;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jobhub::{
    job::{
        query::{JobFilter, JobPage, JobStats, Page, Scope},
        Job, JobId, NewJob,
    },
    store::{retry_step, strip_nul, JobStore, StoreError},
};
use sqlx::{migrate::Migrator, postgres::PgPoolOptions, PgPool};
use tracing::instrument;

use crate::{
    query,
    types::{JobRow, StatsRow, JOB_COLUMNS},
};

static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

/// A [`JobStore`] keeping job records in the `jobhub_jobs` PostgreSQL table.
///
/// Every transition is a single conditional `UPDATE`, so two writers racing on the same record
/// cannot both succeed.
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

impl From<PgPool> for PgJobStore {
    fn from(pool: PgPool) -> Self {
        Self { pool }
    }
}

impl From<&PgPool> for PgJobStore {
    fn from(pool: &PgPool) -> Self {
        Self {
            pool: pool.to_owned(),
        }
    }
}

impl PgJobStore {
    pub fn from_pool(pool: PgPool) -> Self {
        pool.into()
    }

    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .connect(database_url)
            .await
            .map_err(database_error)?;
        Ok(pool.into())
    }

    /// Creates or upgrades the `jobhub_jobs` table.
    #[instrument(skip(self))]
    pub async fn migrate(&self) -> Result<(), StoreError> {
        MIGRATOR
            .run(&self.pool)
            .await
            .map_err(|err| StoreError::Database(err.to_string()))
            .inspect_err(|err| tracing::error!(?err, "Failed to migrate job store: {err}"))
    }

    async fn update_returning(&self, sql: &str, id: JobId) -> Result<Option<Job>, StoreError> {
        sqlx::query_as::<_, JobRow>(sql)
            .bind(id.as_uuid())
            .fetch_optional(self.deref())
            .await
            .map_err(database_error)?
            .map(Job::try_from)
            .transpose()
    }
}

fn database_error(err: sqlx::Error) -> StoreError {
    tracing::error!(?err, "Job store query failed: {err}");
    StoreError::Database(err.to_string())
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn insert(&self, job: NewJob) -> Result<Job, StoreError> {
        let row = sqlx::query_as::<_, JobRow>(&format!(
            r#"INSERT INTO jobhub_jobs (
                id,
                task_type,
                lane,
                owner_user_id,
                owner_tenant_id,
                current_step,
                input_payload,
                max_retries,
                created_at,
                expires_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            RETURNING {JOB_COLUMNS}"#
        ))
        .bind(job.id.as_uuid())
        .bind(&job.task_type)
        .bind(job.lane.as_str())
        .bind(job.owner.user_id)
        .bind(job.owner.tenant_id)
        .bind(jobhub::job::STEP_QUEUED)
        .bind(&job.input)
        .bind(i32::try_from(job.max_retries).unwrap_or(i32::MAX))
        .bind(job.created_at)
        .bind(job.expires_at)
        .fetch_one(self.deref())
        .await
        .map_err(database_error)?;
        row.try_into()
    }

    async fn get(&self, id: JobId) -> Result<Option<Job>, StoreError> {
        sqlx::query_as::<_, JobRow>(&format!(
            "SELECT {JOB_COLUMNS} FROM jobhub_jobs WHERE id = $1"
        ))
        .bind(id.as_uuid())
        .fetch_optional(self.deref())
        .await
        .map_err(database_error)?
        .map(Job::try_from)
        .transpose()
    }

    async fn mark_processing(&self, id: JobId) -> Result<Option<Job>, StoreError> {
        self.update_returning(
            &format!(
                r#"UPDATE jobhub_jobs
                SET
                    status = 'processing',
                    started_at = now()
                WHERE id = $1 AND status = 'queued'
                RETURNING {JOB_COLUMNS}"#
            ),
            id,
        )
        .await
    }

    async fn update_progress(
        &self,
        id: JobId,
        progress: u8,
        step: &str,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"UPDATE jobhub_jobs
            SET
                progress = $2,
                current_step = $3
            WHERE id = $1 AND status = 'processing'"#,
        )
        .bind(id.as_uuid())
        .bind(i16::from(progress.min(100)))
        .bind(strip_nul(step))
        .execute(self.deref())
        .await
        .map_err(database_error)?;
        Ok(result.rows_affected() > 0)
    }

    async fn mark_completed(
        &self,
        id: JobId,
        result: serde_json::Value,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"UPDATE jobhub_jobs
            SET
                status = 'completed',
                progress = 100,
                result_payload = $2,
                completed_at = now()
            WHERE id = $1 AND status = 'processing'"#,
        )
        .bind(id.as_uuid())
        .bind(result)
        .execute(self.deref())
        .await
        .map_err(database_error)?;
        Ok(result.rows_affected() > 0)
    }

    async fn mark_retrying(&self, id: JobId, error: &str) -> Result<Option<Job>, StoreError> {
        let error = strip_nul(error);
        sqlx::query_as::<_, JobRow>(&format!(
            r#"UPDATE jobhub_jobs
            SET
                status = 'queued',
                retry_count = retry_count + 1,
                current_step = $2,
                error_message = $3
            WHERE id = $1 AND status = 'processing' AND retry_count < max_retries
            RETURNING {JOB_COLUMNS}"#
        ))
        .bind(id.as_uuid())
        .bind(retry_step(&error))
        .bind(error)
        .fetch_optional(self.deref())
        .await
        .map_err(database_error)?
        .map(Job::try_from)
        .transpose()
    }

    async fn mark_failed(&self, id: JobId, error: &str) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"UPDATE jobhub_jobs
            SET
                status = 'failed',
                error_message = $2,
                completed_at = now()
            WHERE id = $1 AND status IN ('queued', 'processing')"#,
        )
        .bind(id.as_uuid())
        .bind(strip_nul(error))
        .execute(self.deref())
        .await
        .map_err(database_error)?;
        Ok(result.rows_affected() > 0)
    }

    async fn list(&self, filter: &JobFilter, page: Page) -> Result<JobPage, StoreError> {
        let total: i64 = query::count(filter)
            .build_query_scalar()
            .fetch_one(self.deref())
            .await
            .map_err(database_error)?;
        let jobs = query::list(filter, page)
            .build_query_as::<JobRow>()
            .fetch_all(self.deref())
            .await
            .map_err(database_error)?
            .into_iter()
            .map(Job::try_from)
            .collect::<Result<_, _>>()?;

        Ok(JobPage {
            jobs,
            total: total.max(0) as u64,
            page: page.number(),
            page_size: page.size(),
        })
    }

    async fn stats(&self, scope: Scope, since: DateTime<Utc>) -> Result<JobStats, StoreError> {
        let row = query::stats(&scope, since)
            .build_query_as::<StatsRow>()
            .fetch_one(self.deref())
            .await
            .map_err(database_error)?;
        Ok(row.into())
    }

    async fn delete_expired(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"DELETE FROM jobhub_jobs
            WHERE status IN ('completed', 'failed') AND expires_at < $1"#,
        )
        .bind(now)
        .execute(self.deref())
        .await
        .map_err(database_error)?;
        Ok(result.rows_affected())
    }
}
