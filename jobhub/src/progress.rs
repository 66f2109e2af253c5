use std::sync::Arc;

use crate::{
    job::JobId,
    store::{memory::InMemoryStore, JobStore},
};

/// Handle given to a running task body for reporting how far along it is.
///
/// Reports are written straight to the job record so pollers see them immediately. A report is
/// only honoured while the job is `processing`; [`ProgressReporter::report`] returns `false`
/// otherwise, which a long running body can use to notice that its job was cancelled.
#[derive(Clone)]
pub struct ProgressReporter {
    job_id: JobId,
    store: Arc<dyn JobStore>,
}

impl ProgressReporter {
    pub(crate) fn new(job_id: JobId, store: Arc<dyn JobStore>) -> Self {
        Self { job_id, store }
    }

    /// A reporter not attached to any stored job, for exercising task bodies in isolation.
    ///
    /// Every report on it returns `false`.
    pub fn detached() -> Self {
        Self::new(JobId::new(), Arc::new(InMemoryStore::new()))
    }

    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    /// Records `percent` (clamped to `0..=100`) and the current step description.
    pub async fn report(&self, percent: i64, step: impl AsRef<str>) -> bool {
        let job_id = self.job_id;
        let progress = clamp_percent(percent);
        match self
            .store
            .update_progress(job_id, progress, step.as_ref())
            .await
        {
            Ok(true) => {
                tracing::trace!(%job_id, progress, "Job {job_id} at {progress}%");
                true
            }
            Ok(false) => {
                tracing::debug!(%job_id, "Ignoring progress for job {job_id}; it is no longer processing");
                false
            }
            Err(err) => {
                tracing::warn!(?err, %job_id, "Failed to record progress of job {job_id}: {err}");
                false
            }
        }
    }
}

fn clamp_percent(percent: i64) -> u8 {
    percent.clamp(0, 100) as u8
}
