//! Creates job records and hands them to the broker.
use std::sync::Arc;

use chrono::{TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::instrument;

use crate::{
    broker::{Broker, TaskRef},
    job::{JobId, NewJob, Owner},
    store::{contains_nul, JobStore, StoreError},
    task::{TaskBody, TaskRegistry},
};

#[derive(Debug, Error)]
pub enum EnqueueError {
    #[error("Unknown task type: {0}")]
    UnknownTaskType(String),
    #[error("Invalid job input: {0}")]
    InvalidInput(String),
    /// The record was created but could not be published; it has been marked failed.
    #[error("Failed to queue job {job_id}: {reason}")]
    EnqueueFailed { job_id: JobId, reason: String },
    #[error("Error encoding job input")]
    Encode(#[from] serde_json::Error),
    #[error("Error storing job")]
    Store(#[from] StoreError),
}

/// A request to run `task_type` with `input` on behalf of `owner`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnqueueRequest {
    pub task_type: String,
    pub owner: Owner,
    pub input: serde_json::Value,
}

/// Entry point for application code that wants work done in the background.
#[derive(Clone)]
pub struct Producer {
    store: Arc<dyn JobStore>,
    broker: Arc<dyn Broker>,
    registry: Arc<TaskRegistry>,
    retention: TimeDelta,
}

impl Producer {
    /// How long a finished job is kept, measured from its creation.
    pub const DEFAULT_RETENTION: TimeDelta = TimeDelta::hours(24);

    pub fn new(
        store: Arc<dyn JobStore>,
        broker: Arc<dyn Broker>,
        registry: Arc<TaskRegistry>,
    ) -> Self {
        Self {
            store,
            broker,
            registry,
            retention: Self::DEFAULT_RETENTION,
        }
    }

    pub fn with_retention(self, retention: TimeDelta) -> Self {
        Self { retention, ..self }
    }

    /// Persists a `queued` record and publishes it on the task's lane.
    ///
    /// The record is always written before the message so a worker can never receive a reference
    /// to a job that does not exist yet.
    #[instrument(skip(self, request), fields(task_type = %request.task_type, job_id))]
    pub async fn enqueue(&self, request: EnqueueRequest) -> Result<JobId, EnqueueError> {
        let settings = self
            .registry
            .settings(&request.task_type)
            .ok_or_else(|| EnqueueError::UnknownTaskType(request.task_type.clone()))?;
        if contains_nul(&request.input) {
            return Err(EnqueueError::InvalidInput(
                "input must not contain NUL characters".to_owned(),
            ));
        }

        let now = Utc::now();
        let job = self
            .store
            .insert(NewJob {
                id: JobId::new(),
                task_type: request.task_type,
                lane: settings.lane,
                owner: request.owner,
                input: request.input,
                max_retries: settings.max_retries,
                created_at: now,
                expires_at: now + self.retention,
            })
            .await?;
        let job_id = job.id;
        tracing::Span::current().record("job_id", tracing::field::display(job_id));

        let task = TaskRef {
            job_id,
            task_type: job.task_type,
        };
        if let Err(err) = self.broker.publish(job.lane, task, None).await {
            tracing::error!(?err, %job_id, "Failed to publish job {job_id}, error: {err:?}");
            let reason = err.to_string();
            let _ = self
                .store
                .mark_failed(job_id, &format!("failed to queue task: {reason}"))
                .await
                .inspect_err(|err| {
                    tracing::error!(
                        ?err,
                        %job_id,
                        "Failed to mark job {job_id} as failed, error: {err:?}",
                    )
                });
            return Err(EnqueueError::EnqueueFailed { job_id, reason });
        }

        tracing::debug!(%job_id, lane = %job.lane, "Enqueued job {job_id}");
        Ok(job_id)
    }

    /// Typed variant of [`Producer::enqueue`] for a registered [`TaskBody`].
    pub async fn enqueue_task<T>(
        &self,
        owner: Owner,
        input: &T::Input,
    ) -> Result<JobId, EnqueueError>
    where
        T: TaskBody,
        T::Input: Serialize + Sync,
    {
        self.enqueue(EnqueueRequest {
            task_type: T::NAME.to_owned(),
            owner,
            input: serde_json::to_value(input)?,
        })
        .await
    }
}

#[cfg(test)]
mod test {
    use assert_matches::assert_matches;
    use mockall::predicate::{always, eq};
    use serde_json::json;

    use super::*;
    use crate::{
        broker::{BrokerError, MockBroker},
        job::{JobStatus, Lane, STEP_QUEUED},
        store::memory::InMemoryStore,
        task::test::EchoTask,
    };

    fn registry() -> Arc<TaskRegistry> {
        let mut registry = TaskRegistry::new();
        registry.register(EchoTask);
        Arc::new(registry)
    }

    fn request() -> EnqueueRequest {
        EnqueueRequest {
            task_type: "echo".to_owned(),
            owner: Owner::user(7),
            input: json!({"value": 42}),
        }
    }

    #[tokio::test]
    async fn enqueue_persists_then_publishes() {
        let store = InMemoryStore::new();
        let mut broker = MockBroker::new();
        broker
            .expect_publish()
            .with(eq(Lane::High), always(), eq(None))
            .times(1)
            .returning(|_, _, _| Ok(()));
        let producer = Producer::new(Arc::new(store.clone()), Arc::new(broker), registry());

        let job_id = producer.enqueue(request()).await.unwrap();

        let job = store.get(job_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.lane, Lane::High);
        assert_eq!(job.owner, Owner::user(7));
        assert_eq!(job.input, json!({"value": 42}));
        assert_eq!(job.max_retries, 3);
        assert_eq!(job.current_step.as_deref(), Some(STEP_QUEUED));
        assert_eq!(job.expires_at - job.created_at, TimeDelta::hours(24));
    }

    #[tokio::test]
    async fn unknown_task_type_creates_nothing() {
        let store = InMemoryStore::new();
        let mut broker = MockBroker::new();
        broker.expect_publish().never();
        let producer = Producer::new(Arc::new(store.clone()), Arc::new(broker), registry());

        let result = producer
            .enqueue(EnqueueRequest {
                task_type: "send_email".to_owned(),
                ..request()
            })
            .await;

        assert_matches!(result, Err(EnqueueError::UnknownTaskType(task_type)) if task_type == "send_email");
        let page = store
            .list(
                &crate::job::query::JobFilter::new(crate::job::query::Scope::All),
                Default::default(),
            )
            .await
            .unwrap();
        assert_eq!(page.total, 0);
    }

    #[tokio::test]
    async fn input_with_nul_character_is_rejected() {
        let store = InMemoryStore::new();
        let mut broker = MockBroker::new();
        broker.expect_publish().never();
        let producer = Producer::new(Arc::new(store.clone()), Arc::new(broker), registry());

        let result = producer
            .enqueue(EnqueueRequest {
                input: json!({"files": ["a.txt", "b\u{0}.txt"]}),
                ..request()
            })
            .await;

        assert_matches!(result, Err(EnqueueError::InvalidInput(_)));
        let page = store
            .list(
                &crate::job::query::JobFilter::new(crate::job::query::Scope::All),
                Default::default(),
            )
            .await
            .unwrap();
        assert_eq!(page.total, 0);
    }

    #[tokio::test]
    async fn publish_failure_marks_job_failed() {
        let store = InMemoryStore::new();
        let mut broker = MockBroker::new();
        broker
            .expect_publish()
            .returning(|_, _, _| Err(BrokerError::Connection("refused".to_owned())));
        let producer = Producer::new(Arc::new(store.clone()), Arc::new(broker), registry());

        let result = producer.enqueue(request()).await;

        let job_id = assert_matches!(result, Err(EnqueueError::EnqueueFailed { job_id, .. }) => job_id);
        let job = store.get(job_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(
            job.error_message.as_deref(),
            Some("failed to queue task: Broker connection error: refused")
        );
    }

    #[tokio::test]
    async fn enqueue_task_uses_task_name_and_retention() {
        let store = InMemoryStore::new();
        let mut broker = MockBroker::new();
        broker.expect_publish().returning(|_, _, _| Ok(()));
        let producer = Producer::new(Arc::new(store.clone()), Arc::new(broker), registry())
            .with_retention(TimeDelta::hours(1));

        let job_id = producer
            .enqueue_task::<EchoTask>(Owner::user(3), &json!("hello"))
            .await
            .unwrap();

        let job = store.get(job_id).await.unwrap().unwrap();
        assert_eq!(job.task_type, "echo");
        assert_eq!(job.input, json!("hello"));
        assert_eq!(job.expires_at - job.created_at, TimeDelta::hours(1));
    }
}
