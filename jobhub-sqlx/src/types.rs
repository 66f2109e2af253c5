use chrono::{DateTime, Utc};
use jobhub::{
    job::{Job, Lane, Owner},
    prelude::JobStats,
    store::StoreError,
};
use sqlx::prelude::FromRow;
use uuid::Uuid;

#[derive(sqlx::Type, Debug, Clone, Copy, PartialEq, Eq)]
#[sqlx(type_name = "jobhub_job_status", rename_all = "lowercase")]
pub(crate) enum JobStatus {
    Queued,
    Processing,
    Completed,
    Failed,
}

impl From<JobStatus> for jobhub::job::JobStatus {
    fn from(value: JobStatus) -> Self {
        match value {
            JobStatus::Queued => Self::Queued,
            JobStatus::Processing => Self::Processing,
            JobStatus::Completed => Self::Completed,
            JobStatus::Failed => Self::Failed,
        }
    }
}

impl From<jobhub::job::JobStatus> for JobStatus {
    fn from(value: jobhub::job::JobStatus) -> Self {
        match value {
            jobhub::job::JobStatus::Queued => Self::Queued,
            jobhub::job::JobStatus::Processing => Self::Processing,
            jobhub::job::JobStatus::Completed => Self::Completed,
            jobhub::job::JobStatus::Failed => Self::Failed,
        }
    }
}

/// Column list shared by every query returning whole rows.
pub(crate) const JOB_COLUMNS: &str = r#"
    id,
    task_type,
    status,
    lane,
    owner_user_id,
    owner_tenant_id,
    progress,
    current_step,
    input_payload,
    result_payload,
    error_message,
    retry_count,
    max_retries,
    created_at,
    started_at,
    completed_at,
    expires_at"#;

#[derive(Debug, FromRow)]
pub(crate) struct JobRow {
    pub id: Uuid,
    pub task_type: String,
    pub status: JobStatus,
    pub lane: String,
    pub owner_user_id: i64,
    pub owner_tenant_id: Option<i64>,
    pub progress: i16,
    pub current_step: Option<String>,
    pub input_payload: serde_json::Value,
    pub result_payload: Option<serde_json::Value>,
    pub error_message: Option<String>,
    pub retry_count: i32,
    pub max_retries: i32,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub expires_at: DateTime<Utc>,
}

impl TryFrom<JobRow> for Job {
    type Error = StoreError;

    fn try_from(value: JobRow) -> Result<Self, Self::Error> {
        let lane = value
            .lane
            .parse::<Lane>()
            .map_err(|err| StoreError::Database(err.to_string()))?;
        let counter = |count: i32, column: &str| {
            u32::try_from(count)
                .map_err(|_| StoreError::Database(format!("negative {column} for job {}", value.id)))
        };
        Ok(Self {
            id: value.id.into(),
            task_type: value.task_type,
            status: value.status.into(),
            lane,
            owner: Owner {
                user_id: value.owner_user_id,
                tenant_id: value.owner_tenant_id,
            },
            progress: value.progress.clamp(0, 100) as u8,
            current_step: value.current_step,
            input: value.input_payload,
            result: value.result_payload,
            error_message: value.error_message,
            retry_count: counter(value.retry_count, "retry_count")?,
            max_retries: counter(value.max_retries, "max_retries")?,
            created_at: value.created_at,
            started_at: value.started_at,
            completed_at: value.completed_at,
            expires_at: value.expires_at,
        })
    }
}

#[derive(Debug, FromRow)]
pub(crate) struct StatsRow {
    pub total: i64,
    pub queued: i64,
    pub processing: i64,
    pub completed: i64,
    pub failed: i64,
    pub recent: i64,
    pub avg_processing_secs: Option<f64>,
}

impl From<StatsRow> for JobStats {
    fn from(value: StatsRow) -> Self {
        let count = |count: i64| count.max(0) as u64;
        Self {
            total: count(value.total),
            queued: count(value.queued),
            processing: count(value.processing),
            completed: count(value.completed),
            failed: count(value.failed),
            recent: count(value.recent),
            avg_processing_secs: value.avg_processing_secs.unwrap_or_default(),
        }
    }
}

#[cfg(test)]
mod test {
    use assert_matches::assert_matches;
    use chrono::TimeDelta;
    use serde_json::json;

    use super::*;

    fn row() -> JobRow {
        let now = Utc::now();
        JobRow {
            id: Uuid::new_v4(),
            task_type: "grade_quiz".to_owned(),
            status: JobStatus::Completed,
            lane: "low".to_owned(),
            owner_user_id: 3,
            owner_tenant_id: Some(9),
            progress: 100,
            current_step: Some("done".to_owned()),
            input_payload: json!({"quiz_id": 1}),
            result_payload: Some(json!({"score": 87})),
            error_message: None,
            retry_count: 1,
            max_retries: 3,
            created_at: now - TimeDelta::minutes(2),
            started_at: Some(now - TimeDelta::minutes(1)),
            completed_at: Some(now),
            expires_at: now + TimeDelta::hours(24),
        }
    }

    #[test]
    fn row_converts_to_job() {
        let row = row();
        let id = row.id;

        let job = Job::try_from(row).unwrap();

        assert_eq!(job.id.as_uuid(), &id);
        assert_eq!(job.status, jobhub::job::JobStatus::Completed);
        assert_eq!(job.lane, Lane::Low);
        assert_eq!(job.owner, Owner::user(3).with_tenant(9));
        assert_eq!(job.result, Some(json!({"score": 87})));
        assert_eq!(job.retry_count, 1);
        assert_eq!(job.processing_time(), Some(TimeDelta::minutes(1)));
    }

    #[test]
    fn corrupt_rows_are_rejected() {
        let bad_lane = JobRow {
            lane: "urgent".to_owned(),
            ..row()
        };
        assert_matches!(Job::try_from(bad_lane), Err(StoreError::Database(_)));

        let bad_count = JobRow {
            retry_count: -1,
            ..row()
        };
        assert_matches!(Job::try_from(bad_count), Err(StoreError::Database(_)));
    }

    #[test]
    fn status_maps_both_ways() {
        for status in jobhub::job::JobStatus::ALL {
            assert_eq!(jobhub::job::JobStatus::from(JobStatus::from(status)), status);
        }
    }

    #[test]
    fn empty_stats_average_to_zero() {
        let stats = JobStats::from(StatsRow {
            total: 0,
            queued: 0,
            processing: 0,
            completed: 0,
            failed: 0,
            recent: 0,
            avg_processing_secs: None,
        });

        assert_eq!(stats.avg_processing_secs, 0.0);
    }
}
