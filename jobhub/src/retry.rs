//! Decides and applies what happens to a job after a failed attempt.
use std::sync::Arc;

use chrono::TimeDelta;

use crate::{
    backoff::BackoffStrategy,
    broker::{Broker, TaskRef},
    job::{Job, JobId},
    store::JobStore,
    task::TaskError,
};

/// What to do with a job whose attempt failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Put the job back on its lane after `delay`.
    Retry { delay: TimeDelta },
    /// Give up and mark the job failed.
    Fail,
}

/// How a failure was finally recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    Retried,
    Failed,
    /// The job had already left `processing`, for example because it was cancelled.
    Superseded,
}

/// Applies [`RetryDecision`]s to the store and broker on behalf of the worker pool.
#[derive(Clone)]
pub struct RetryController {
    store: Arc<dyn JobStore>,
    broker: Arc<dyn Broker>,
}

impl RetryController {
    pub(crate) fn new(store: Arc<dyn JobStore>, broker: Arc<dyn Broker>) -> Self {
        Self { store, broker }
    }

    /// Transient errors are retried while `retry_count < max_retries`; the delay comes from the
    /// task's backoff for the upcoming retry number.
    pub fn decide(job: &Job, error: &TaskError, backoff: &BackoffStrategy) -> RetryDecision {
        if error.is_retryable() && job.can_retry() {
            RetryDecision::Retry {
                delay: backoff.backoff(job.retry_count + 1),
            }
        } else {
            RetryDecision::Fail
        }
    }

    pub(crate) async fn handle_failure(
        &self,
        job: &Job,
        error: &TaskError,
        backoff: &BackoffStrategy,
    ) -> FailureOutcome {
        let job_id = job.id;
        let message = error.to_string();
        match Self::decide(job, error, backoff) {
            RetryDecision::Retry { delay } => {
                tracing::warn!(
                    %job_id,
                    ?error,
                    "Job {job_id} failed and will be retried in {delay}: {message}",
                );
                match self.store.mark_retrying(job_id, &message).await {
                    Ok(Some(job)) => self.republish(&job, delay, &message).await,
                    Ok(None) => {
                        tracing::debug!(%job_id, "Job {job_id} is no longer processing; not retrying");
                        FailureOutcome::Superseded
                    }
                    Err(err) => {
                        tracing::error!(
                            ?err,
                            %job_id,
                            "Failed to mark job {job_id} for retry, error: {err:?}",
                        );
                        self.fail(job_id, &message).await
                    }
                }
            }
            RetryDecision::Fail => {
                tracing::error!(
                    %job_id,
                    ?error,
                    "Job {job_id} failed and will be discarded: {message}",
                );
                self.fail(job_id, &message).await
            }
        }
    }

    async fn republish(&self, job: &Job, delay: TimeDelta, message: &str) -> FailureOutcome {
        let job_id = job.id;
        let task = TaskRef {
            job_id,
            task_type: job.task_type.clone(),
        };
        match self
            .broker
            .publish(job.lane, task, Some(delay.to_std().unwrap_or_default()))
            .await
        {
            Ok(()) => FailureOutcome::Retried,
            Err(err) => {
                tracing::error!(
                    ?err,
                    %job_id,
                    "Failed to re-enqueue job {job_id}, error: {err:?}",
                );
                self.fail(job_id, &format!("failed to re-enqueue after {message}: {err}"))
                    .await
            }
        }
    }

    async fn fail(&self, job_id: JobId, message: &str) -> FailureOutcome {
        match self.store.mark_failed(job_id, message).await {
            Ok(true) => FailureOutcome::Failed,
            Ok(false) => FailureOutcome::Superseded,
            Err(err) => {
                tracing::error!(
                    ?err,
                    %job_id,
                    "Failed to mark job {job_id} as failed, error: {err:?}",
                );
                FailureOutcome::Failed
            }
        }
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use assert_matches::assert_matches;
    use mockall::predicate::{always, eq};

    use super::*;
    use crate::{
        broker::{BrokerError, MockBroker},
        job::{JobStatus, Lane, NewJob},
        store::memory::InMemoryStore,
    };

    async fn processing_job(store: &InMemoryStore) -> Job {
        let job = store.insert(NewJob::mock_job()).await.unwrap();
        store.mark_processing(job.id).await.unwrap().unwrap()
    }

    #[test]
    fn decide() {
        let mut job = NewJob::mock_job().into_job();
        let backoff = BackoffStrategy::linear(TimeDelta::seconds(10));
        let transient = TaskError::network("reset");
        let permanent = TaskError::invalid_input("bad");

        assert_eq!(
            RetryController::decide(&job, &transient, &backoff),
            RetryDecision::Retry {
                delay: TimeDelta::seconds(10)
            }
        );
        assert_eq!(
            RetryController::decide(&job, &permanent, &backoff),
            RetryDecision::Fail
        );

        job.retry_count = 1;
        assert_eq!(
            RetryController::decide(&job, &transient, &backoff),
            RetryDecision::Retry {
                delay: TimeDelta::seconds(20)
            }
        );

        job.retry_count = job.max_retries;
        assert_eq!(
            RetryController::decide(&job, &transient, &backoff),
            RetryDecision::Fail
        );
    }

    #[tokio::test]
    async fn retry_republishes_with_delay() {
        let store = InMemoryStore::new();
        let job = processing_job(&store).await;
        let mut broker = MockBroker::new();
        broker
            .expect_publish()
            .with(
                eq(Lane::Default),
                eq(TaskRef {
                    job_id: job.id,
                    task_type: job.task_type.clone(),
                }),
                eq(Some(Duration::from_secs(10))),
            )
            .times(1)
            .returning(|_, _, _| Ok(()));
        let controller = RetryController::new(Arc::new(store.clone()), Arc::new(broker));

        let outcome = controller
            .handle_failure(
                &job,
                &TaskError::network("reset"),
                &BackoffStrategy::constant(TimeDelta::seconds(10)),
            )
            .await;

        assert_eq!(outcome, FailureOutcome::Retried);
        let job = store.get(job.id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.retry_count, 1);
        assert_eq!(job.error_message.as_deref(), Some("network: reset"));
    }

    #[tokio::test]
    async fn failed_republish_fails_the_job() {
        let store = InMemoryStore::new();
        let job = processing_job(&store).await;
        let mut broker = MockBroker::new();
        broker
            .expect_publish()
            .with(always(), always(), always())
            .returning(|_, _, _| Err(BrokerError::Connection("refused".to_owned())));
        let controller = RetryController::new(Arc::new(store.clone()), Arc::new(broker));

        let outcome = controller
            .handle_failure(&job, &TaskError::network("reset"), &BackoffStrategy::none())
            .await;

        assert_eq!(outcome, FailureOutcome::Failed);
        let job = store.get(job.id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_matches!(job.error_message.as_deref(), Some(message) if message.contains("refused"));
    }

    #[tokio::test]
    async fn permanent_error_fails_without_publishing() {
        let store = InMemoryStore::new();
        let job = processing_job(&store).await;
        let mut broker = MockBroker::new();
        broker.expect_publish().never();
        let controller = RetryController::new(Arc::new(store.clone()), Arc::new(broker));

        let outcome = controller
            .handle_failure(&job, &TaskError::forbidden("nope"), &BackoffStrategy::none())
            .await;

        assert_eq!(outcome, FailureOutcome::Failed);
        let job = store.get(job.id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.retry_count, 0);
        assert_eq!(job.error_message.as_deref(), Some("forbidden: nope"));
    }

    #[tokio::test]
    async fn cancelled_job_is_not_retried() {
        let store = InMemoryStore::new();
        let job = processing_job(&store).await;
        store.mark_failed(job.id, "cancelled by user").await.unwrap();
        let mut broker = MockBroker::new();
        broker.expect_publish().never();
        let controller = RetryController::new(Arc::new(store.clone()), Arc::new(broker));

        let outcome = controller
            .handle_failure(&job, &TaskError::network("reset"), &BackoffStrategy::none())
            .await;

        assert_eq!(outcome, FailureOutcome::Superseded);
        let job = store.get(job.id).await.unwrap().unwrap();
        assert_eq!(job.error_message.as_deref(), Some("cancelled by user"));
    }
}
