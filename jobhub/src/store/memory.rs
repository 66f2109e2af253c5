//! Provides an in memory implementation of [`JobStore`].
//!
//! It is not optimized, instead it is designed to be a correct implementation for tests and single
//! process setups. Records do not survive a restart.
use std::sync::{Arc, RwLock, RwLockWriteGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::job::{
    query::{JobFilter, JobPage, JobStats, Page, Scope},
    Job, JobId, JobStatus, NewJob,
};

use super::{
    queryable::{CreatedSince, Queryable},
    retry_step, strip_nul, JobStore, StoreError,
};

/// An in memory implementation of [`JobStore`].
///
/// **This is not designed for use in multi process deployments.**
#[derive(Clone, Default)]
pub struct InMemoryStore {
    jobs: Arc<RwLock<Vec<Job>>>,
}

impl InMemoryStore {
    /// Creates a new instance of [`InMemoryStore`].
    pub fn new() -> Self {
        Self::default()
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Vec<Job>>, StoreError> {
        self.jobs.write().map_err(|_| StoreError::BadState)
    }

    /// Applies `update` to the job if it exists and `condition` holds, returning the updated copy.
    fn update_where(
        &self,
        id: JobId,
        condition: impl Fn(&Job) -> bool,
        update: impl FnOnce(&mut Job),
    ) -> Result<Option<Job>, StoreError> {
        let mut jobs = self.write()?;
        match jobs.iter_mut().find(|job| job.id == id) {
            Some(job) if condition(job) => {
                update(job);
                Ok(Some(job.clone()))
            }
            _ => Ok(None),
        }
    }
}

#[async_trait]
impl JobStore for InMemoryStore {
    async fn insert(&self, job: NewJob) -> Result<Job, StoreError> {
        let job = job.into_job();
        self.write()?.push(job.clone());
        Ok(job)
    }

    async fn get(&self, id: JobId) -> Result<Option<Job>, StoreError> {
        Ok(self
            .jobs
            .read()
            .map_err(|_| StoreError::BadState)?
            .iter()
            .find(|job| job.id == id)
            .cloned())
    }

    async fn mark_processing(&self, id: JobId) -> Result<Option<Job>, StoreError> {
        self.update_where(
            id,
            |job| job.status == JobStatus::Queued,
            |job| {
                job.status = JobStatus::Processing;
                job.started_at = Some(Utc::now());
            },
        )
    }

    async fn update_progress(
        &self,
        id: JobId,
        progress: u8,
        step: &str,
    ) -> Result<bool, StoreError> {
        self.update_where(
            id,
            |job| job.status == JobStatus::Processing,
            |job| {
                job.progress = progress.min(100);
                job.current_step = Some(strip_nul(step).into_owned());
            },
        )
        .map(|job| job.is_some())
    }

    async fn mark_completed(
        &self,
        id: JobId,
        result: serde_json::Value,
    ) -> Result<bool, StoreError> {
        self.update_where(
            id,
            |job| job.status == JobStatus::Processing,
            |job| {
                job.status = JobStatus::Completed;
                job.progress = 100;
                job.result = Some(result);
                job.completed_at = Some(Utc::now());
            },
        )
        .map(|job| job.is_some())
    }

    async fn mark_retrying(&self, id: JobId, error: &str) -> Result<Option<Job>, StoreError> {
        let error = strip_nul(error);
        self.update_where(
            id,
            |job| job.status == JobStatus::Processing && job.can_retry(),
            |job| {
                job.status = JobStatus::Queued;
                job.retry_count += 1;
                job.current_step = Some(retry_step(&error));
                job.error_message = Some(error.into_owned());
            },
        )
    }

    async fn mark_failed(&self, id: JobId, error: &str) -> Result<bool, StoreError> {
        self.update_where(
            id,
            |job| !job.is_terminal(),
            |job| {
                job.status = JobStatus::Failed;
                job.error_message = Some(strip_nul(error).into_owned());
                job.completed_at = Some(Utc::now());
            },
        )
        .map(|job| job.is_some())
    }

    async fn list(&self, filter: &JobFilter, page: Page) -> Result<JobPage, StoreError> {
        let jobs = self.jobs.read().map_err(|_| StoreError::BadState)?;
        // Newest insertions first so equal timestamps keep a stable newest-first order.
        let mut matching = jobs
            .iter()
            .rev()
            .filter(|job| filter.matches(job))
            .collect::<Vec<_>>();
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        let total = matching.len() as u64;
        let jobs = matching
            .into_iter()
            .skip(page.offset() as usize)
            .take(page.size() as usize)
            .cloned()
            .collect();

        Ok(JobPage {
            jobs,
            total,
            page: page.number(),
            page_size: page.size(),
        })
    }

    async fn stats(&self, scope: Scope, since: DateTime<Utc>) -> Result<JobStats, StoreError> {
        let jobs = self.jobs.read().map_err(|_| StoreError::BadState)?;
        let visible = jobs
            .iter()
            .filter(|job| scope.matches(job))
            .collect::<Vec<_>>();
        let count = |query: &dyn Queryable| {
            visible.iter().filter(|job| query.matches(job)).count() as u64
        };

        let recent = CreatedSince(since);
        let durations = visible
            .iter()
            .filter(|job| job.status == JobStatus::Completed && recent.matches(job))
            .filter_map(|job| job.processing_time())
            .map(|duration| duration.num_milliseconds() as f64 / 1000.0)
            .collect::<Vec<_>>();
        let avg_processing_secs = if durations.is_empty() {
            0.0
        } else {
            durations.iter().sum::<f64>() / durations.len() as f64
        };

        Ok(JobStats {
            total: visible.len() as u64,
            queued: count(&JobStatus::Queued),
            processing: count(&JobStatus::Processing),
            completed: count(&JobStatus::Completed),
            failed: count(&JobStatus::Failed),
            recent: count(&recent),
            avg_processing_secs,
        })
    }

    async fn delete_expired(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut jobs = self.write()?;
        let before = jobs.len();
        jobs.retain(|job| !job.is_expired(now));
        Ok((before - jobs.len()) as u64)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::store_test_suite;

    store_test_suite!(for: InMemoryStore::new());

    mod multi_thread {
        use super::*;

        store_test_suite!(
            #[cfg_attr(miri, ignore)]
            attr: tokio::test(flavor = "multi_thread", worker_threads = 2),
            args: (),
            store: InMemoryStore::new()
        );
    }
}
