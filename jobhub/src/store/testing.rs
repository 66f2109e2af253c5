//! Test suite for ensuring a correct implementation of a [`JobStore`].
use chrono::{TimeDelta, Utc};
use serde_json::json;

use crate::job::{
    query::{JobFilter, Page, Scope},
    JobId, JobStatus, Lane, NewJob, Owner, STEP_QUEUED,
};

use super::*;

const DEFAULT_TASK_TYPE: &str = "echo";

impl NewJob {
    pub(crate) fn mock_job() -> Self {
        let now = Utc::now();
        Self {
            id: JobId::new(),
            task_type: DEFAULT_TASK_TYPE.to_owned(),
            lane: Lane::Default,
            owner: Owner::user(1),
            input: json!({"value": 42}),
            max_retries: 2,
            created_at: now,
            expires_at: now + TimeDelta::hours(24),
        }
    }

    pub(crate) fn with_owner(self, owner: Owner) -> Self {
        Self { owner, ..self }
    }

    pub(crate) fn with_task_type(self, task_type: impl ToString) -> Self {
        Self {
            task_type: task_type.to_string(),
            ..self
        }
    }

    pub(crate) fn with_created_at(self, created_at: chrono::DateTime<Utc>) -> Self {
        Self { created_at, ..self }
    }

    pub(crate) fn with_expires_at(self, expires_at: chrono::DateTime<Utc>) -> Self {
        Self { expires_at, ..self }
    }
}

/// Create test suite for a [`JobStore`] implementation.
///
/// For store implementors, it is useful to include this as part of your test suites.
///
/// # Example
///
/// ```
/// use jobhub::store_test_suite;
/// use jobhub::store::memory::InMemoryStore;
/// store_test_suite!(for: InMemoryStore::new());
/// ```
///
/// If you are using a different async test attribute you can configure the macro to use that
/// instead, adding any extra attributes first. For example when using `sqlx::test`:
///
/// ```ignore
/// use jobhub::store_test_suite;
/// store_test_suite!(
///     #[ignore = "requires a database"]
///     attr: sqlx::test,
///     args: (pool: PgPool),
///     store: StoreImplementation::from_pool(pool)
/// );
/// ```
#[macro_export]
macro_rules! store_test_suite {
    (for: $store:expr) => {
        $crate::store_test_suite!(attr: tokio::test, args: (), store: $store);
    };
    ($(#[$extra:meta])* attr: $attr:meta, args: $args:tt, store: $store:expr) => {
        $crate::store_test_suite!(@tests [$(#[$extra])*] $attr, $args, $store,
            insert_and_get,
            get_missing,
            mark_processing,
            mark_processing_requires_queued,
            update_progress,
            update_progress_requires_processing,
            mark_completed,
            mark_completed_does_not_overwrite_failure,
            mark_retrying,
            mark_retrying_respects_max_retries,
            mark_failed,
            mark_failed_keeps_terminal_jobs,
            nul_characters_are_dropped_from_text,
            list_newest_first_with_total,
            list_scopes_and_filters,
            stats,
            delete_expired_only_removes_terminal_jobs
        );
    };
    (@tests $extras:tt $attr:meta, $args:tt, $store:expr, $($name:ident),+) => {
        $(
            $crate::store_test_suite!(@one $extras $attr, $args, $store, $name);
        )+
    };
    (@one [$(#[$extra:meta])*] $attr:meta, $args:tt, $store:expr, $name:ident) => {
        #[$attr]
        $(#[$extra])*
        async fn $name $args {
            let store = $store;
            $crate::store::testing::$name(store).await;
        }
    };
}

#[doc(hidden)]
pub async fn insert_and_get(store: impl JobStore) {
    let new_job = NewJob::mock_job();
    let inserted = store.insert(new_job.clone()).await.unwrap();

    assert_eq!(inserted.id, new_job.id);
    assert_eq!(inserted.status, JobStatus::Queued);
    assert_eq!(inserted.progress, 0);
    assert_eq!(inserted.retry_count, 0);
    assert_eq!(inserted.current_step.as_deref(), Some(STEP_QUEUED));
    assert!(inserted.started_at.is_none());

    let job = store.get(new_job.id).await.unwrap().unwrap();
    assert_eq!(job.id, new_job.id);
    assert_eq!(job.task_type, new_job.task_type);
    assert_eq!(job.input, new_job.input);
    assert_eq!(job.owner, new_job.owner);
    assert_eq!(job.lane, new_job.lane);
    assert_eq!(job.max_retries, new_job.max_retries);
}

#[doc(hidden)]
pub async fn get_missing(store: impl JobStore) {
    assert!(store.get(JobId::new()).await.unwrap().is_none());
}

#[doc(hidden)]
pub async fn mark_processing(store: impl JobStore) {
    let job = store.insert(NewJob::mock_job()).await.unwrap();

    let job = store.mark_processing(job.id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Processing);
    assert!(job.started_at.is_some());

    let stored = store.get(job.id).await.unwrap().unwrap();
    assert_eq!(stored.status, JobStatus::Processing);
}

#[doc(hidden)]
pub async fn mark_processing_requires_queued(store: impl JobStore) {
    assert!(store.mark_processing(JobId::new()).await.unwrap().is_none());

    let job = store.insert(NewJob::mock_job()).await.unwrap();
    store.mark_processing(job.id).await.unwrap().unwrap();
    assert!(store.mark_processing(job.id).await.unwrap().is_none());

    let failed = store.insert(NewJob::mock_job()).await.unwrap();
    assert!(store.mark_failed(failed.id, "boom").await.unwrap());
    assert!(store.mark_processing(failed.id).await.unwrap().is_none());
}

#[doc(hidden)]
pub async fn update_progress(store: impl JobStore) {
    let job = store.insert(NewJob::mock_job()).await.unwrap();
    store.mark_processing(job.id).await.unwrap().unwrap();

    assert!(store.update_progress(job.id, 40, "halfway").await.unwrap());

    let job = store.get(job.id).await.unwrap().unwrap();
    assert_eq!(job.progress, 40);
    assert_eq!(job.current_step.as_deref(), Some("halfway"));
}

#[doc(hidden)]
pub async fn update_progress_requires_processing(store: impl JobStore) {
    let job = store.insert(NewJob::mock_job()).await.unwrap();

    assert!(!store.update_progress(job.id, 40, "early").await.unwrap());
    assert!(!store.update_progress(JobId::new(), 40, "missing").await.unwrap());

    let job = store.get(job.id).await.unwrap().unwrap();
    assert_eq!(job.progress, 0);
}

#[doc(hidden)]
pub async fn mark_completed(store: impl JobStore) {
    let job = store.insert(NewJob::mock_job()).await.unwrap();
    store.mark_processing(job.id).await.unwrap().unwrap();

    assert!(store
        .mark_completed(job.id, json!({"value": 42}))
        .await
        .unwrap());

    let job = store.get(job.id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.progress, 100);
    assert_eq!(job.result, Some(json!({"value": 42})));
    assert!(job.completed_at.is_some());
    assert!(job.completed_at >= job.started_at);
}

#[doc(hidden)]
pub async fn mark_completed_does_not_overwrite_failure(store: impl JobStore) {
    let job = store.insert(NewJob::mock_job()).await.unwrap();
    store.mark_processing(job.id).await.unwrap().unwrap();
    assert!(store.mark_failed(job.id, "cancelled by user").await.unwrap());

    assert!(!store.mark_completed(job.id, json!("late")).await.unwrap());

    let job = store.get(job.id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.result, None);
    assert_eq!(job.error_message.as_deref(), Some("cancelled by user"));
}

#[doc(hidden)]
pub async fn mark_retrying(store: impl JobStore) {
    let job = store.insert(NewJob::mock_job()).await.unwrap();
    store.mark_processing(job.id).await.unwrap().unwrap();
    store.update_progress(job.id, 30, "working").await.unwrap();

    let job = store
        .mark_retrying(job.id, "network: connection reset")
        .await
        .unwrap()
        .unwrap();

    assert_eq!(job.status, JobStatus::Queued);
    assert_eq!(job.retry_count, 1);
    assert_eq!(job.progress, 30);
    assert_eq!(job.error_message.as_deref(), Some("network: connection reset"));
    assert_eq!(
        job.current_step.as_deref(),
        Some("retrying after: network: connection reset")
    );

    let stored = store.get(job.id).await.unwrap().unwrap();
    assert_eq!(stored.status, JobStatus::Queued);
    assert_eq!(stored.retry_count, 1);
}

#[doc(hidden)]
pub async fn mark_retrying_respects_max_retries(store: impl JobStore) {
    let job = store.insert(NewJob::mock_job()).await.unwrap();
    for attempt in 1..=job.max_retries {
        store.mark_processing(job.id).await.unwrap().unwrap();
        let retried = store.mark_retrying(job.id, "again").await.unwrap().unwrap();
        assert_eq!(retried.retry_count, attempt);
    }
    store.mark_processing(job.id).await.unwrap().unwrap();

    assert!(store.mark_retrying(job.id, "again").await.unwrap().is_none());

    let job = store.get(job.id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Processing);
    assert_eq!(job.retry_count, job.max_retries);

    let queued = store.insert(NewJob::mock_job()).await.unwrap();
    assert!(store.mark_retrying(queued.id, "not running").await.unwrap().is_none());
}

#[doc(hidden)]
pub async fn mark_failed(store: impl JobStore) {
    let queued = store.insert(NewJob::mock_job()).await.unwrap();
    let processing = store.insert(NewJob::mock_job()).await.unwrap();
    store.mark_processing(processing.id).await.unwrap().unwrap();

    assert!(store.mark_failed(queued.id, "first").await.unwrap());
    assert!(store.mark_failed(processing.id, "second").await.unwrap());
    assert!(!store.mark_failed(JobId::new(), "missing").await.unwrap());

    let queued = store.get(queued.id).await.unwrap().unwrap();
    assert_eq!(queued.status, JobStatus::Failed);
    assert_eq!(queued.error_message.as_deref(), Some("first"));
    assert!(queued.completed_at.is_some());

    let processing = store.get(processing.id).await.unwrap().unwrap();
    assert_eq!(processing.status, JobStatus::Failed);
    assert_eq!(processing.error_message.as_deref(), Some("second"));
}

#[doc(hidden)]
pub async fn mark_failed_keeps_terminal_jobs(store: impl JobStore) {
    let job = store.insert(NewJob::mock_job()).await.unwrap();
    store.mark_processing(job.id).await.unwrap().unwrap();
    store.mark_completed(job.id, json!(1)).await.unwrap();

    assert!(!store.mark_failed(job.id, "too late").await.unwrap());

    let job = store.get(job.id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.error_message, None);
}

#[doc(hidden)]
pub async fn nul_characters_are_dropped_from_text(store: impl JobStore) {
    let job = store.insert(NewJob::mock_job()).await.unwrap();
    store.mark_processing(job.id).await.unwrap().unwrap();

    assert!(store.update_progress(job.id, 10, "step\0one").await.unwrap());
    let job = store.get(job.id).await.unwrap().unwrap();
    assert_eq!(job.current_step.as_deref(), Some("stepone"));

    let job = store
        .mark_retrying(job.id, "bad\0 byte")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(job.error_message.as_deref(), Some("bad byte"));
    assert_eq!(job.current_step, Some(retry_step("bad byte")));

    store.mark_processing(job.id).await.unwrap().unwrap();
    assert!(store.mark_failed(job.id, "still\0 bad").await.unwrap());
    let job = store.get(job.id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.error_message.as_deref(), Some("still bad"));
}

#[doc(hidden)]
pub async fn list_newest_first_with_total(store: impl JobStore) {
    let owner = Owner::user(31);
    let now = Utc::now();
    let mut ids = vec![];
    for offset in 0..5 {
        let job = store
            .insert(
                NewJob::mock_job()
                    .with_owner(owner)
                    .with_created_at(now + TimeDelta::seconds(offset)),
            )
            .await
            .unwrap();
        ids.push(job.id);
    }
    ids.reverse();

    let filter = JobFilter::new(Scope::User(owner.user_id));
    let first = store.list(&filter, Page::new(Some(1), Some(2))).await.unwrap();
    let last = store.list(&filter, Page::new(Some(3), Some(2))).await.unwrap();
    let beyond = store.list(&filter, Page::new(Some(4), Some(2))).await.unwrap();

    assert_eq!(first.total, 5);
    assert_eq!(first.page, 1);
    assert_eq!(first.page_size, 2);
    assert_eq!(
        first.jobs.iter().map(|job| job.id).collect::<Vec<_>>(),
        ids[..2]
    );
    assert_eq!(
        last.jobs.iter().map(|job| job.id).collect::<Vec<_>>(),
        ids[4..]
    );
    assert_eq!(beyond.total, 5);
    assert!(beyond.jobs.is_empty());
}

#[doc(hidden)]
pub async fn list_scopes_and_filters(store: impl JobStore) {
    let alice = Owner::user(41).with_tenant(400);
    let bob = Owner::user(42).with_tenant(400);
    let carol = Owner::user(43).with_tenant(401);

    let alice_job = store
        .insert(NewJob::mock_job().with_owner(alice))
        .await
        .unwrap();
    let alice_email = store
        .insert(NewJob::mock_job().with_owner(alice).with_task_type("send_email"))
        .await
        .unwrap();
    store
        .insert(NewJob::mock_job().with_owner(bob))
        .await
        .unwrap();
    store
        .insert(NewJob::mock_job().with_owner(carol))
        .await
        .unwrap();
    store.mark_failed(alice_job.id, "boom").await.unwrap();

    let page = Page::default();
    let alice_only = store
        .list(&JobFilter::new(Scope::User(alice.user_id)), page)
        .await
        .unwrap();
    assert_eq!(alice_only.total, 2);
    assert!(alice_only.jobs.iter().all(|job| job.owner == alice));

    let tenant = store
        .list(&JobFilter::new(Scope::Tenant(400)), page)
        .await
        .unwrap();
    assert_eq!(tenant.total, 3);

    let failed = store
        .list(
            &JobFilter::new(Scope::User(alice.user_id)).with_status(JobStatus::Failed),
            page,
        )
        .await
        .unwrap();
    assert_eq!(failed.total, 1);
    assert_eq!(failed.jobs[0].id, alice_job.id);

    let emails = store
        .list(
            &JobFilter::new(Scope::User(alice.user_id)).with_task_type("send_email"),
            page,
        )
        .await
        .unwrap();
    assert_eq!(emails.total, 1);
    assert_eq!(emails.jobs[0].id, alice_email.id);
}

#[doc(hidden)]
pub async fn stats(store: impl JobStore) {
    let owner = Owner::user(51);
    let now = Utc::now();
    let old = store
        .insert(
            NewJob::mock_job()
                .with_owner(owner)
                .with_created_at(now - TimeDelta::hours(48)),
        )
        .await
        .unwrap();
    let completed = store
        .insert(NewJob::mock_job().with_owner(owner))
        .await
        .unwrap();
    let processing = store
        .insert(NewJob::mock_job().with_owner(owner))
        .await
        .unwrap();
    store
        .insert(NewJob::mock_job().with_owner(Owner::user(52)))
        .await
        .unwrap();

    store.mark_failed(old.id, "boom").await.unwrap();
    store.mark_processing(completed.id).await.unwrap().unwrap();
    store.mark_completed(completed.id, json!(1)).await.unwrap();
    store.mark_processing(processing.id).await.unwrap().unwrap();

    let stats = store
        .stats(Scope::User(owner.user_id), now - TimeDelta::hours(24))
        .await
        .unwrap();

    assert_eq!(stats.total, 3);
    assert_eq!(stats.queued, 0);
    assert_eq!(stats.processing, 1);
    assert_eq!(stats.completed, 1);
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.recent, 2);
    assert!(stats.avg_processing_secs >= 0.0);

    let everything = store
        .stats(Scope::All, now - TimeDelta::hours(24))
        .await
        .unwrap();
    assert!(everything.total >= 4);
    assert!(everything.queued >= 1);
}

#[doc(hidden)]
pub async fn delete_expired_only_removes_terminal_jobs(store: impl JobStore) {
    let now = Utc::now();
    let expired = || NewJob::mock_job().with_expires_at(now - TimeDelta::seconds(1));

    let completed = store.insert(expired()).await.unwrap();
    let failed = store.insert(expired()).await.unwrap();
    let queued = store.insert(expired()).await.unwrap();
    let processing = store.insert(expired()).await.unwrap();
    let fresh = store.insert(NewJob::mock_job()).await.unwrap();

    store.mark_processing(completed.id).await.unwrap().unwrap();
    store.mark_completed(completed.id, json!(1)).await.unwrap();
    store.mark_failed(failed.id, "boom").await.unwrap();
    store.mark_processing(processing.id).await.unwrap().unwrap();
    store.mark_failed(fresh.id, "boom").await.unwrap();

    let deleted = store.delete_expired(now).await.unwrap();

    assert_eq!(deleted, 2);
    assert!(store.get(completed.id).await.unwrap().is_none());
    assert!(store.get(failed.id).await.unwrap().is_none());
    assert!(store.get(queued.id).await.unwrap().is_some());
    assert!(store.get(processing.id).await.unwrap().is_some());
    assert!(store.get(fresh.id).await.unwrap().is_some());
}
