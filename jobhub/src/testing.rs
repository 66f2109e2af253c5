//! Helpers for testing code that enqueues or runs jobs.
//!
//! These panic on failure and are not intended for production use.
use std::time::Duration;

use crate::{
    job::{
        query::{JobFilter, Page},
        Job, JobId,
    },
    store::JobStore,
};

/// How long the `wait_for` helpers poll before giving up.
pub const WAIT_TIMEOUT: Duration = Duration::from_secs(5);
const POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Polls until the job satisfies `predicate`, panicking after [`WAIT_TIMEOUT`].
pub async fn wait_for(
    store: &dyn JobStore,
    id: JobId,
    predicate: impl Fn(&Job) -> bool,
) -> Job {
    let poll = async {
        loop {
            if let Some(job) = store.get(id).await.expect("store should be readable") {
                if predicate(&job) {
                    return job;
                }
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    };
    match tokio::time::timeout(WAIT_TIMEOUT, poll).await {
        Ok(job) => job,
        Err(_) => panic!(
            "Job {id} did not reach the expected state within {WAIT_TIMEOUT:?}, last seen: {:#?}",
            store.get(id).await
        ),
    }
}

/// Polls until the job is completed or failed.
pub async fn wait_for_terminal(store: &dyn JobStore, id: JobId) -> Job {
    wait_for(store, id, Job::is_terminal).await
}

/// Every job matching `filter`, across all pages.
pub async fn all_jobs(store: &dyn JobStore, filter: &JobFilter) -> Vec<Job> {
    let mut jobs = vec![];
    for number in 1.. {
        let page = store
            .list(filter, Page::new(Some(number), Some(Page::MAX_SIZE)))
            .await
            .expect("store should be listable");
        let done = page.jobs.len() < Page::MAX_SIZE as usize;
        jobs.extend(page.jobs);
        if done {
            break;
        }
    }
    jobs
}

/// A macro for making assertions about what jobs exist in a store.
///
/// Assertions can be based on task type, status, owner and input.
///
/// # Example
///
/// ```
/// # use jobhub::prelude::*;
/// # use jobhub::testing::assert_enqueued;
/// # use jobhub::{broker::memory::InMemoryBroker, store::memory::InMemoryStore};
/// # struct SendEmail;
/// #
/// # #[async_trait::async_trait]
/// # impl TaskBody for SendEmail {
/// #     type Input = String;
/// #     type Output = ();
/// #     const NAME: &'static str = "send_email";
/// #     const LANE: Lane = Lane::Low;
/// #     async fn run(&self, _: String, _: ProgressReporter) -> Result<(), TaskError> {
/// #         Ok(())
/// #     }
/// # }
/// # tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(async {
/// let store = InMemoryStore::new();
/// let hub = JobHub::new(store.clone(), InMemoryBroker::new()).with_task(SendEmail);
///
/// hub.producer()
///     .enqueue_task::<SendEmail>(Owner::user(1), &"welcome".to_owned())
///     .await
///     .unwrap();
///
/// assert_enqueued!(
///     to: store,
///     for_task: SendEmail,
///     with_input: "welcome",
/// );
/// assert_enqueued!(
///     1 job,
///     to: store,
///     with_status: JobStatus::Queued,
///     owned_by: 1
/// );
/// assert_enqueued!(0 jobs, to: store, for_task: "grade_submission");
/// # });
/// ```
#[macro_export]
macro_rules! assert_enqueued {
    (1 job, to: $store:ident $(, $($tail:tt)*)?) => {
        $crate::assert_enqueued!(@internal Some(1); to: $store, $($($tail)*)?);
    };
    ($n:literal jobs, to: $store:ident $(, $($tail:tt)*)?) => {
        $crate::assert_enqueued!(@internal Some($n); to: $store, $($($tail)*)?);
    };
    (to: $store:ident $(, $($tail:tt)*)?) => {
        $crate::assert_enqueued!(@internal None; to: $store, $($($tail)*)?);
    };
    (@internal $n:expr; to: $store:ident, $($tail:tt)*) => {{
        #[allow(unused_mut)]
        let mut filter = $crate::job::query::JobFilter::new($crate::job::query::Scope::All);
        #[allow(unused_mut)]
        let mut input: Option<$crate::testing::serde_json::Value> = None;
        $crate::assert_enqueued!(@query filter, input; $($tail)*);
        let jobs = $crate::testing::all_jobs(&$store, &filter)
            .await
            .into_iter()
            .filter(|job| input.as_ref().map_or(true, |input| &job.input == input))
            .collect::<Vec<_>>();
        let expected: Option<usize> = $n;
        match expected {
            Some(n) => assert!(
                jobs.len() == n,
                "Unexpected number of jobs enqueued {},\n\n\
                Expected {} jobs, found {} matching jobs:\n\n{jobs:#?}",
                stringify!($($tail)*),
                n,
                jobs.len(),
            ),
            None => assert!(
                !jobs.is_empty(),
                "No jobs enqueued {}",
                stringify!($($tail)*),
            ),
        }
    }};
    (@query $filter:ident, $input:ident;) => {};
    (@query $filter:ident, $input:ident; with_status: $status:expr $(, $($tail:tt)*)?) => {
        $filter.status = Some($status);
        $crate::assert_enqueued!(@query $filter, $input; $($($tail)*)?);
    };
    (@query $filter:ident, $input:ident; owned_by: $user_id:expr $(, $($tail:tt)*)?) => {
        $filter.scope = $crate::job::query::Scope::User($user_id);
        $crate::assert_enqueued!(@query $filter, $input; $($($tail)*)?);
    };
    (@query $filter:ident, $input:ident; with_input: $value:expr $(, $($tail:tt)*)?) => {
        $input = Some($crate::testing::serde_json::to_value($value).unwrap());
        $crate::assert_enqueued!(@query $filter, $input; $($($tail)*)?);
    };
    (@query $filter:ident, $input:ident; for_task: $task:literal $(, $($tail:tt)*)?) => {
        $filter.task_type = Some($task.to_owned());
        $crate::assert_enqueued!(@query $filter, $input; $($($tail)*)?);
    };
    (@query $filter:ident, $input:ident; for_task: $task:path $(, $($tail:tt)*)?) => {
        $filter.task_type = Some(<$task as $crate::task::TaskBody>::NAME.to_owned());
        $crate::assert_enqueued!(@query $filter, $input; $($($tail)*)?);
    };
}

pub use assert_enqueued;
#[doc(hidden)]
pub use serde_json;
