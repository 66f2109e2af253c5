//! The job record: the single source of truth for a unit of background work.
use std::{fmt::Display, str::FromStr};

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub mod query;

/// Opaque, globally unique identifier of a job, handed back to callers at enqueue time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    /// Generates a fresh random identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
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

impl Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Error returned when a status or lane name cannot be parsed.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("Unknown {kind}: {value}")]
pub struct ParseError {
    kind: &'static str,
    value: String,
}

/// Lifecycle state of a job.
///
/// `Queued -> Processing -> Completed`, with `Processing -> Queued` on a retry and any
/// non-terminal state able to move to `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub const ALL: [JobStatus; 4] = [
        JobStatus::Queued,
        JobStatus::Processing,
        JobStatus::Completed,
        JobStatus::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    /// Completed and failed jobs never change again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

impl Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| ParseError {
                kind: "job status",
                value: s.to_owned(),
            })
    }
}

/// Priority lane a job is published to.
///
/// Workers always drain `High` before `Default` and `Default` before `Low`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Lane {
    High,
    #[default]
    Default,
    Low,
}

impl Lane {
    /// Lanes in the order workers consult them.
    pub const ALL: [Lane; 3] = [Lane::High, Lane::Default, Lane::Low];

    pub fn as_str(&self) -> &'static str {
        match self {
            Lane::High => "high",
            Lane::Default => "default",
            Lane::Low => "low",
        }
    }

    pub(crate) fn index(self) -> usize {
        match self {
            Lane::High => 0,
            Lane::Default => 1,
            Lane::Low => 2,
        }
    }
}

impl Display for Lane {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Lane {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|lane| lane.as_str() == s)
            .ok_or_else(|| ParseError {
                kind: "lane",
                value: s.to_owned(),
            })
    }
}

/// The user (and optionally tenant) a job belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Owner {
    pub user_id: i64,
    pub tenant_id: Option<i64>,
}

impl Owner {
    pub const fn user(user_id: i64) -> Self {
        Self {
            user_id,
            tenant_id: None,
        }
    }

    pub const fn with_tenant(self, tenant_id: i64) -> Self {
        Self {
            tenant_id: Some(tenant_id),
            ..self
        }
    }
}

/// A persisted job record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub task_type: String,
    pub status: JobStatus,
    pub lane: Lane,
    pub owner: Owner,
    pub progress: u8,
    pub current_step: Option<String>,
    pub input: serde_json::Value,
    pub result: Option<serde_json::Value>,
    pub error_message: Option<String>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub expires_at: DateTime<Utc>,
}

impl Job {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Whether another attempt is still allowed after a failure.
    pub fn can_retry(&self) -> bool {
        self.retry_count < self.max_retries
    }

    /// Only terminal jobs expire; queued and processing jobs are kept regardless of age.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.is_terminal() && now > self.expires_at
    }

    pub fn processing_time(&self) -> Option<TimeDelta> {
        Some(self.completed_at? - self.started_at?)
    }
}

/// Step recorded on a freshly created job.
pub const STEP_QUEUED: &str = "queued";

/// Everything the producer hands to a store to create a job.
#[derive(Debug, Clone, PartialEq)]
pub struct NewJob {
    pub id: JobId,
    pub task_type: String,
    pub lane: Lane,
    pub owner: Owner,
    pub input: serde_json::Value,
    pub max_retries: u32,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl NewJob {
    pub fn into_job(self) -> Job {
        Job {
            id: self.id,
            task_type: self.task_type,
            status: JobStatus::Queued,
            lane: self.lane,
            owner: self.owner,
            progress: 0,
            current_step: Some(STEP_QUEUED.to_owned()),
            input: self.input,
            result: None,
            error_message: None,
            retry_count: 0,
            max_retries: self.max_retries,
            created_at: self.created_at,
            started_at: None,
            completed_at: None,
            expires_at: self.expires_at,
        }
    }
}

#[cfg(test)]
mod test {
    use assert_matches::assert_matches;

    use super::*;

    fn job() -> Job {
        let now = Utc::now();
        NewJob {
            id: JobId::new(),
            task_type: "echo".to_owned(),
            lane: Lane::High,
            owner: Owner::user(7),
            input: serde_json::json!({"value": 42}),
            max_retries: 2,
            created_at: now,
            expires_at: now + TimeDelta::hours(24),
        }
        .into_job()
    }

    #[test]
    fn new_job_starts_queued() {
        let job = job();

        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.progress, 0);
        assert_eq!(job.retry_count, 0);
        assert_eq!(job.current_step.as_deref(), Some(STEP_QUEUED));
        assert!(job.can_retry());
        assert!(job.processing_time().is_none());
    }

    #[test]
    fn only_terminal_jobs_expire() {
        let mut job = job();
        let later = job.expires_at + TimeDelta::seconds(1);

        assert!(!job.is_expired(later));
        job.status = JobStatus::Processing;
        assert!(!job.is_expired(later));
        job.status = JobStatus::Completed;
        assert!(job.is_expired(later));
        assert!(!job.is_expired(job.expires_at));
    }

    #[test]
    fn status_and_lane_parse() {
        assert_eq!("processing".parse::<JobStatus>(), Ok(JobStatus::Processing));
        assert_matches!("cancelled".parse::<JobStatus>(), Err(_));
        assert_eq!("low".parse::<Lane>(), Ok(Lane::Low));
        assert_matches!("urgent".parse::<Lane>(), Err(_));
        assert_eq!(
            serde_json::to_value(JobStatus::Completed).unwrap(),
            serde_json::json!("completed")
        );
    }

    #[test]
    fn job_id_round_trips_through_display() {
        let id = JobId::new();

        assert_eq!(id.to_string().parse::<JobId>().unwrap(), id);
        assert_matches!("not-a-uuid".parse::<JobId>(), Err(_));
    }
}
