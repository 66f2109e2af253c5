//! Filters, paging and aggregate types used when reading job records back out of a store.
use serde::{Deserialize, Serialize};

use super::{Job, JobStatus, Owner};

/// Which owners' jobs a read may see.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    /// Every job, used for administrators.
    All,
    /// Jobs owned by a single user.
    User(i64),
    /// Jobs owned by anyone in a tenant.
    Tenant(i64),
}

impl Scope {
    pub fn includes(&self, owner: &Owner) -> bool {
        match self {
            Scope::All => true,
            Scope::User(user_id) => owner.user_id == *user_id,
            Scope::Tenant(tenant_id) => owner.tenant_id == Some(*tenant_id),
        }
    }
}

/// Filter for listing jobs.
///
/// # Example
///
/// ```
/// use jobhub::job::{JobStatus, query::{JobFilter, Scope}};
///
/// let filter = JobFilter::new(Scope::User(7))
///     .with_status(JobStatus::Failed)
///     .with_task_type("grade_submission");
/// assert_eq!(filter.status, Some(JobStatus::Failed));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobFilter {
    pub scope: Scope,
    pub status: Option<JobStatus>,
    pub task_type: Option<String>,
}

impl JobFilter {
    pub fn new(scope: Scope) -> Self {
        Self {
            scope,
            status: None,
            task_type: None,
        }
    }

    pub fn with_status(self, status: JobStatus) -> Self {
        Self {
            status: Some(status),
            ..self
        }
    }

    pub fn with_task_type(self, task_type: impl Into<String>) -> Self {
        Self {
            task_type: Some(task_type.into()),
            ..self
        }
    }

    pub fn matches(&self, job: &Job) -> bool {
        self.scope.includes(&job.owner)
            && self.status.map_or(true, |status| job.status == status)
            && self
                .task_type
                .as_deref()
                .map_or(true, |task_type| job.task_type == task_type)
    }
}

/// A 1-based page request. Sizes are clamped to `1..=MAX_SIZE`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    number: u32,
    size: u32,
}

impl Page {
    pub const DEFAULT_SIZE: u32 = 50;
    pub const MAX_SIZE: u32 = 100;

    pub fn new(number: Option<u32>, size: Option<u32>) -> Self {
        Self {
            number: number.unwrap_or(1).max(1),
            size: size
                .unwrap_or(Self::DEFAULT_SIZE)
                .clamp(1, Self::MAX_SIZE),
        }
    }

    pub fn number(&self) -> u32 {
        self.number
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn offset(&self) -> u64 {
        u64::from(self.number - 1) * u64::from(self.size)
    }
}

impl Default for Page {
    fn default() -> Self {
        Self::new(None, None)
    }
}

/// One page of jobs, newest first, with the total number matching the filter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobPage {
    pub jobs: Vec<Job>,
    pub total: u64,
    pub page: u32,
    pub page_size: u32,
}

/// Aggregate counts over the jobs visible to a scope.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobStats {
    pub total: u64,
    pub queued: u64,
    pub processing: u64,
    pub completed: u64,
    pub failed: u64,
    /// Jobs created since the start of the stats window.
    pub recent: u64,
    /// Mean `completed_at - started_at` of completed jobs created inside the window.
    pub avg_processing_secs: f64,
}
