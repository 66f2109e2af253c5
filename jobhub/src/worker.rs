//! Workers: pull job references off the broker and run the matching task body.
use std::{sync::Arc, time::Duration};

use rand::Rng;
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{instrument, Instrument};

use crate::{
    broker::{Broker, BrokerError, Delivery},
    job::JobId,
    progress::ProgressReporter,
    retry::{FailureOutcome, RetryController},
    store::JobStore,
    task::{TaskError, TaskRegistry},
};

const ERROR_TYPE_PANIC: &str = "panic";
const ERROR_TYPE_ABORTED: &str = "aborted";

/// What became of a single delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Completed,
    Retried,
    Failed,
    /// The delivery was dropped because its record is missing, not queued, or left `processing`
    /// while the body ran.
    Discarded,
    /// The store could not be reached; the delivery was dropped without touching the record.
    Abandoned,
}

impl From<FailureOutcome> for Outcome {
    fn from(value: FailureOutcome) -> Self {
        match value {
            FailureOutcome::Retried => Outcome::Retried,
            FailureOutcome::Failed => Outcome::Failed,
            FailureOutcome::Superseded => Outcome::Discarded,
        }
    }
}

pub(crate) struct JobRunner {
    store: Arc<dyn JobStore>,
    registry: Arc<TaskRegistry>,
    retry: RetryController,
}

impl JobRunner {
    pub(crate) fn new(
        store: Arc<dyn JobStore>,
        broker: Arc<dyn Broker>,
        registry: Arc<TaskRegistry>,
    ) -> Self {
        Self {
            retry: RetryController::new(store.clone(), broker),
            store,
            registry,
        }
    }

    #[instrument(skip(self, delivery), fields(job_id, task_type, lane))]
    pub(crate) async fn execute(&self, delivery: Delivery) -> Outcome {
        let Delivery { lane, task } = delivery;
        let job_id = task.job_id;
        let span = tracing::Span::current();
        span.record("job_id", tracing::field::display(job_id));
        span.record("task_type", task.task_type.as_str());
        span.record("lane", lane.as_str());

        let job = match self.store.mark_processing(job_id).await {
            Ok(Some(job)) => job,
            Ok(None) => {
                tracing::debug!(%job_id, "Job {job_id} is missing or no longer queued; discarding delivery");
                return Outcome::Discarded;
            }
            Err(err) => {
                tracing::error!(?err, %job_id, "Failed to load job {job_id}, error: {err:?}");
                return Outcome::Abandoned;
            }
        };

        let Some(registered) = self.registry.get(&task.task_type).cloned() else {
            tracing::error!(%job_id, "No task body registered for {}", task.task_type);
            let message = format!("unknown task type: {}", task.task_type);
            return match self.store.mark_failed(job_id, &message).await {
                Ok(true) => Outcome::Failed,
                Ok(false) => Outcome::Discarded,
                Err(err) => {
                    tracing::error!(?err, %job_id, "Failed to mark job {job_id} as failed, error: {err:?}");
                    Outcome::Abandoned
                }
            };
        };

        tracing::debug!(%job_id, attempt = job.retry_count + 1, "Executing job {job_id}");
        let body = registered.body.clone();
        let input = job.input.clone();
        let progress = ProgressReporter::new(job_id, self.store.clone());
        let limit = registered.settings.timeout;
        let handle = tokio::spawn(
            async move {
                tokio::time::timeout(limit, body.run(input, progress))
                    .await
                    .unwrap_or_else(|_elapsed| {
                        Err(TaskError::timeout(format!(
                            "Job failed to complete within timeout: {limit:?}"
                        )))
                    })
            }
            .in_current_span(),
        );
        let result = handle.await.unwrap_or_else(|err| Err(err.into()));

        match result {
            Ok(output) => self.handle_job_complete(job_id, output).await,
            Err(error) => self
                .retry
                .handle_failure(&job, &error, &registered.settings.backoff)
                .await
                .into(),
        }
    }

    async fn handle_job_complete(&self, job_id: JobId, output: serde_json::Value) -> Outcome {
        match self.store.mark_completed(job_id, output).await {
            Ok(true) => {
                tracing::debug!(%job_id, "Job complete {job_id}");
                Outcome::Completed
            }
            Ok(false) => {
                tracing::info!(%job_id, "Job {job_id} finished after leaving processing; result discarded");
                Outcome::Discarded
            }
            Err(err) => {
                tracing::error!(
                    ?err,
                    %job_id,
                    "Failed to mark job {job_id} as complete, error: {err:?}",
                );
                Outcome::Abandoned
            }
        }
    }
}

impl From<JoinError> for TaskError {
    fn from(value: JoinError) -> Self {
        let msg = value.to_string();
        match value.try_into_panic() {
            Ok(panic) => TaskError::transient(
                ERROR_TYPE_PANIC,
                panic
                    .downcast_ref::<&str>()
                    .map(ToString::to_string)
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or(msg),
            ),
            Err(_) => TaskError::transient(ERROR_TYPE_ABORTED, msg),
        }
    }
}

/// A fixed number of workers sharing one broker, store and registry.
pub struct WorkerPool {
    runner: Arc<JobRunner>,
    broker: Arc<dyn Broker>,
    workers: usize,
    poll_interval: Duration,
}

impl WorkerPool {
    pub const DEFAULT_WORKERS: usize = 4;
    pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

    pub fn new(
        store: Arc<dyn JobStore>,
        broker: Arc<dyn Broker>,
        registry: Arc<TaskRegistry>,
    ) -> Self {
        Self {
            runner: Arc::new(JobRunner::new(store, broker.clone(), registry)),
            broker,
            workers: Self::DEFAULT_WORKERS,
            poll_interval: Self::DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_workers(self, workers: usize) -> Self {
        Self {
            workers: workers.max(1),
            ..self
        }
    }

    /// Longest a worker blocks on an empty broker before checking for shutdown.
    pub fn with_poll_interval(self, poll_interval: Duration) -> Self {
        Self {
            poll_interval,
            ..self
        }
    }

    /// Receives and processes at most one delivery, waiting up to `wait` for it.
    pub async fn run_next(&self, wait: Duration) -> Result<Option<Outcome>, BrokerError> {
        match self.broker.receive(wait).await? {
            Some(delivery) => Ok(Some(self.runner.execute(delivery).await)),
            None => Ok(None),
        }
    }

    /// Starts the workers. They stop once `cancellation_token` is cancelled, finishing any job in
    /// flight first. Shutdown may take up to the poll interval while a worker waits on the broker.
    pub fn spawn(self, cancellation_token: CancellationToken) -> Vec<JoinHandle<()>> {
        tracing::info!(workers = self.workers, "Starting {} workers", self.workers);
        (0..self.workers)
            .map(|index| {
                let runner = self.runner.clone();
                let broker = self.broker.clone();
                let token = cancellation_token.clone();
                let poll_interval = self.poll_interval;
                tokio::spawn(
                    run_worker(runner, broker, poll_interval, token)
                        .instrument(tracing::info_span!("worker", worker.index = index)),
                )
            })
            .collect()
    }
}

async fn run_worker(
    runner: Arc<JobRunner>,
    broker: Arc<dyn Broker>,
    poll_interval: Duration,
    cancellation_token: CancellationToken,
) {
    // A receive in progress may already own a message, so it is never raced against shutdown.
    while !cancellation_token.is_cancelled() {
        match broker.receive(poll_interval).await {
            Ok(Some(delivery)) => {
                runner.execute(delivery).await;
            }
            Ok(None) => tracing::trace!("No job available"),
            Err(err) => {
                tracing::error!(?err, "Failed to receive from broker, error: {err}");
                tokio::select! {
                    _ = cancellation_token.cancelled() => break,
                    _ = tokio::time::sleep(with_jitter(poll_interval)) => {},
                }
            }
        }
    }
    tracing::debug!("Shutting down worker");
}

/// Spreads reconnect attempts of many workers over `0.5..1.5` times the interval.
fn with_jitter(interval: Duration) -> Duration {
    interval.mul_f64(rand::thread_rng().gen_range(0.5..1.5))
}
