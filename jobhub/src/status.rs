//! Read side for callers polling their jobs, plus cancellation.
use std::sync::Arc;

use chrono::{TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    job::{
        query::{JobFilter, JobPage, JobStats, Page, Scope},
        Job, JobId, JobStatus, Owner,
    },
    store::{JobStore, StoreError},
};

/// Error message recorded on jobs cancelled through [`StatusApi::cancel`].
pub const CANCELLED_BY_USER: &str = "cancelled by user";

/// Window used for the `recent` count and average processing time in [`StatusApi::stats`].
pub const STATS_WINDOW: TimeDelta = TimeDelta::hours(24);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    #[default]
    Member,
    /// Sees every job in their own tenant.
    TenantAdmin,
    /// Sees every job.
    Admin,
}

/// The authenticated identity a read or cancel is made on behalf of.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Requester {
    pub user_id: i64,
    pub tenant_id: Option<i64>,
    pub role: Role,
}

impl Requester {
    pub const fn member(user_id: i64) -> Self {
        Self {
            user_id,
            tenant_id: None,
            role: Role::Member,
        }
    }

    pub const fn with_tenant(self, tenant_id: i64) -> Self {
        Self {
            tenant_id: Some(tenant_id),
            ..self
        }
    }

    pub const fn with_role(self, role: Role) -> Self {
        Self { role, ..self }
    }

    /// Jobs this requester is allowed to see.
    pub fn scope(&self) -> Scope {
        match (self.role, self.tenant_id) {
            (Role::Admin, _) => Scope::All,
            (Role::TenantAdmin, Some(tenant_id)) => Scope::Tenant(tenant_id),
            _ => Scope::User(self.user_id),
        }
    }

    /// Owners always have access; admins bypass ownership checks.
    pub fn can_access(&self, owner: &Owner) -> bool {
        owner.user_id == self.user_id || self.scope().includes(owner)
    }
}

#[derive(Debug, Error)]
pub enum StatusError {
    #[error("Job {0} not found")]
    NotFound(JobId),
    #[error("Not allowed to access job {0}")]
    Forbidden(JobId),
    #[error("Job is {0}; its result is not available")]
    NotReady(JobStatus),
    #[error("Job is already {0}")]
    AlreadyTerminal(JobStatus),
    #[error("Error reading job records")]
    Store(#[from] StoreError),
}

/// Optional narrowing of [`StatusApi::list`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListFilter {
    pub status: Option<JobStatus>,
    pub task_type: Option<String>,
}

/// Ownership-checked reads and cancellation of job records.
#[derive(Clone)]
pub struct StatusApi {
    store: Arc<dyn JobStore>,
}

impl StatusApi {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self { store }
    }

    /// Loads a job the requester may see.
    ///
    /// A job owned by someone else is reported as [`StatusError::Forbidden`].
    pub async fn get(&self, id: JobId, requester: &Requester) -> Result<Job, StatusError> {
        let job = self
            .store
            .get(id)
            .await?
            .ok_or(StatusError::NotFound(id))?;
        if !requester.can_access(&job.owner) {
            tracing::debug!(job_id = %id, user_id = requester.user_id, "Denied access to job {id}");
            return Err(StatusError::Forbidden(id));
        }
        Ok(job)
    }

    /// Jobs visible to the requester, newest first.
    pub async fn list(
        &self,
        requester: &Requester,
        filter: ListFilter,
        page: Page,
    ) -> Result<JobPage, StatusError> {
        let mut query = JobFilter::new(requester.scope());
        query.status = filter.status;
        query.task_type = filter.task_type;
        Ok(self.store.list(&query, page).await?)
    }

    /// The stored result of a completed job.
    pub async fn result(
        &self,
        id: JobId,
        requester: &Requester,
    ) -> Result<(Job, serde_json::Value), StatusError> {
        let job = self.get(id, requester).await?;
        match (job.status, job.result.clone()) {
            (JobStatus::Completed, Some(result)) => Ok((job, result)),
            (JobStatus::Completed, None) => Ok((job, serde_json::Value::Null)),
            (status, _) => Err(StatusError::NotReady(status)),
        }
    }

    /// Counts over the requester's jobs, with `recent` and the average processing time limited to
    /// the last [`STATS_WINDOW`].
    pub async fn stats(&self, requester: &Requester) -> Result<JobStats, StatusError> {
        Ok(self
            .store
            .stats(requester.scope(), Utc::now() - STATS_WINDOW)
            .await?)
    }

    /// Marks a non-terminal job failed with [`CANCELLED_BY_USER`].
    ///
    /// A queued job will be discarded when its message is delivered. A processing job keeps
    /// running until its body next reports progress or finishes; its outcome is then dropped.
    pub async fn cancel(&self, id: JobId, requester: &Requester) -> Result<Job, StatusError> {
        let job = self.get(id, requester).await?;
        if job.is_terminal() {
            return Err(StatusError::AlreadyTerminal(job.status));
        }
        if !self.store.mark_failed(id, CANCELLED_BY_USER).await? {
            // Finished between the read and the update.
            let status = self
                .store
                .get(id)
                .await?
                .map_or(JobStatus::Failed, |job| job.status);
            return Err(StatusError::AlreadyTerminal(status));
        }
        tracing::info!(job_id = %id, user_id = requester.user_id, "Cancelled job {id}");
        self.store.get(id).await?.ok_or(StatusError::NotFound(id))
    }
}

#[cfg(test)]
mod test {
    use assert_matches::assert_matches;
    use serde_json::json;

    use super::*;
    use crate::{job::NewJob, store::memory::InMemoryStore};

    async fn setup() -> (InMemoryStore, StatusApi) {
        let store = InMemoryStore::new();
        let api = StatusApi::new(Arc::new(store.clone()));
        (store, api)
    }

    #[test]
    fn requester_scope() {
        assert_eq!(Requester::member(1).scope(), Scope::User(1));
        assert_eq!(Requester::member(1).with_tenant(9).scope(), Scope::User(1));
        assert_eq!(
            Requester::member(1)
                .with_tenant(9)
                .with_role(Role::TenantAdmin)
                .scope(),
            Scope::Tenant(9)
        );
        assert_eq!(
            Requester::member(1).with_role(Role::TenantAdmin).scope(),
            Scope::User(1)
        );
        assert_eq!(Requester::member(1).with_role(Role::Admin).scope(), Scope::All);
    }

    #[tokio::test]
    async fn get_checks_ownership() {
        let (store, api) = setup().await;
        let job = store
            .insert(NewJob::mock_job().with_owner(Owner::user(1)))
            .await
            .unwrap();

        assert_eq!(api.get(job.id, &Requester::member(1)).await.unwrap().id, job.id);
        assert_matches!(
            api.get(job.id, &Requester::member(2)).await,
            Err(StatusError::Forbidden(id)) if id == job.id
        );
        assert!(api
            .get(job.id, &Requester::member(2).with_role(Role::Admin))
            .await
            .is_ok());
        assert_matches!(
            api.get(JobId::new(), &Requester::member(1)).await,
            Err(StatusError::NotFound(_))
        );
    }

    #[tokio::test]
    async fn result_requires_completion() {
        let (store, api) = setup().await;
        let requester = Requester::member(1);
        let job = store.insert(NewJob::mock_job()).await.unwrap();

        assert_matches!(
            api.result(job.id, &requester).await,
            Err(StatusError::NotReady(JobStatus::Queued))
        );

        store.mark_processing(job.id).await.unwrap();
        store.mark_completed(job.id, json!({"value": 42})).await.unwrap();

        let (job, result) = api.result(job.id, &requester).await.unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(result, json!({"value": 42}));
    }

    #[tokio::test]
    async fn cancel_marks_failed_once() {
        let (store, api) = setup().await;
        let requester = Requester::member(1);
        let job = store.insert(NewJob::mock_job()).await.unwrap();

        let cancelled = api.cancel(job.id, &requester).await.unwrap();
        assert_eq!(cancelled.status, JobStatus::Failed);
        assert_eq!(cancelled.error_message.as_deref(), Some(CANCELLED_BY_USER));

        assert_matches!(
            api.cancel(job.id, &requester).await,
            Err(StatusError::AlreadyTerminal(JobStatus::Failed))
        );
        assert_matches!(
            api.cancel(job.id, &Requester::member(2)).await,
            Err(StatusError::Forbidden(_))
        );
    }

    #[tokio::test]
    async fn list_is_scoped_to_requester() {
        let (store, api) = setup().await;
        store
            .insert(NewJob::mock_job().with_owner(Owner::user(1).with_tenant(5)))
            .await
            .unwrap();
        store
            .insert(NewJob::mock_job().with_owner(Owner::user(2).with_tenant(5)))
            .await
            .unwrap();

        let mine = api
            .list(&Requester::member(1), ListFilter::default(), Page::default())
            .await
            .unwrap();
        let tenant = api
            .list(
                &Requester::member(1)
                    .with_tenant(5)
                    .with_role(Role::TenantAdmin),
                ListFilter::default(),
                Page::default(),
            )
            .await
            .unwrap();

        assert_eq!(mine.total, 1);
        assert_eq!(tenant.total, 2);
    }
}
