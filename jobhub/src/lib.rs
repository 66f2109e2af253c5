//! Background job orchestration.
//!
//! Application code enqueues work through a [`Producer`], which writes a durable job record and
//! publishes a reference to it on one of three priority lanes. A pool of workers takes references
//! off the lanes, runs the registered [`TaskBody`](task::TaskBody), reports progress and records
//! the outcome, retrying transient failures with backoff. Callers poll the record through the
//! [`StatusApi`], and a [`Reaper`](reaper::Reaper) deletes expired finished jobs.
//!
//! # Example
//!
//! ```
//! # use jobhub::prelude::*;
//! # use jobhub::{broker::memory::InMemoryBroker, store::memory::InMemoryStore};
//! struct Echo;
//!
//! #[async_trait::async_trait]
//! impl TaskBody for Echo {
//!     type Input = serde_json::Value;
//!     type Output = serde_json::Value;
//!     const NAME: &'static str = "echo";
//!
//!     async fn run(
//!         &self,
//!         input: Self::Input,
//!         progress: ProgressReporter,
//!     ) -> Result<Self::Output, TaskError> {
//!         progress.report(100, "done").await;
//!         Ok(input)
//!     }
//! }
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let hub = JobHub::new(InMemoryStore::new(), InMemoryBroker::new())
//!     .with_task(Echo)
//!     .with_workers(2)
//!     .start();
//!
//! let job_id = hub
//!     .producer()
//!     .enqueue_task::<Echo>(Owner::user(1), &serde_json::json!({"value": 42}))
//!     .await
//!     .unwrap();
//! let job = jobhub::testing::wait_for_terminal(hub.store().as_ref(), job_id).await;
//! assert_eq!(job.status, JobStatus::Completed);
//!
//! hub.graceful_shutdown().await.unwrap();
//! # });
//! ```
use std::{sync::Arc, time::Duration};

use chrono::TimeDelta;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub mod backoff;
pub mod broker;
pub mod job;
pub mod prelude;
pub mod producer;
pub mod progress;
pub mod reaper;
pub mod retry;
pub mod settings;
pub mod status;
pub mod store;
pub mod task;
pub mod testing;
pub mod worker;

use broker::Broker;
use producer::Producer;
use reaper::{Reaper, ReaperSchedule};
use settings::Settings;
use status::StatusApi;
use store::JobStore;
use task::{TaskBody, TaskRegistry};
use worker::WorkerPool;

/// Wires a store, a broker and a task registry together and runs the worker pool and reaper.
pub struct JobHub {
    store: Arc<dyn JobStore>,
    broker: Arc<dyn Broker>,
    registry: Arc<TaskRegistry>,
    workers: usize,
    poll_interval: Duration,
    retention: TimeDelta,
    reaper: Option<ReaperSchedule>,
    cancellation_token: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl JobHub {
    pub fn new(store: impl JobStore + 'static, broker: impl Broker + 'static) -> Self {
        Self::from_shared(Arc::new(store), Arc::new(broker))
    }

    pub fn from_shared(store: Arc<dyn JobStore>, broker: Arc<dyn Broker>) -> Self {
        Self {
            store,
            broker,
            registry: Default::default(),
            workers: WorkerPool::DEFAULT_WORKERS,
            poll_interval: WorkerPool::DEFAULT_POLL_INTERVAL,
            retention: Producer::DEFAULT_RETENTION,
            reaper: None,
            cancellation_token: CancellationToken::new(),
            handles: vec![],
        }
    }

    /// Registers a task body. Must be called before [`JobHub::start`].
    pub fn with_task<T: TaskBody>(mut self, body: T) -> Self {
        Arc::make_mut(&mut self.registry).register(body);
        self
    }

    pub fn with_workers(self, workers: usize) -> Self {
        Self { workers, ..self }
    }

    pub fn with_poll_interval(self, poll_interval: Duration) -> Self {
        Self {
            poll_interval,
            ..self
        }
    }

    pub fn with_retention(self, retention: TimeDelta) -> Self {
        Self { retention, ..self }
    }

    /// Runs a [`Reaper`] on `schedule` once started.
    pub fn with_reaper(self, schedule: ReaperSchedule) -> Self {
        Self {
            reaper: Some(schedule),
            ..self
        }
    }

    /// Applies worker, retention, reaper and per task settings. Call after registering tasks.
    pub fn with_settings(mut self, settings: &Settings) -> Result<Self, JobHubError> {
        Arc::make_mut(&mut self.registry).apply_overrides(&settings.tasks);
        let schedule = settings.reaper.schedule()?;
        Ok(self
            .with_workers(settings.workers)
            .with_poll_interval(settings.poll_interval())
            .with_retention(settings.retention())
            .with_reaper(schedule))
    }

    pub fn store(&self) -> Arc<dyn JobStore> {
        self.store.clone()
    }

    pub fn broker(&self) -> Arc<dyn Broker> {
        self.broker.clone()
    }

    pub fn registry(&self) -> &TaskRegistry {
        &self.registry
    }

    pub fn producer(&self) -> Producer {
        Producer::new(
            self.store.clone(),
            self.broker.clone(),
            self.registry.clone(),
        )
        .with_retention(self.retention)
    }

    pub fn status(&self) -> StatusApi {
        StatusApi::new(self.store.clone())
    }

    /// A worker pool over this hub's store, broker and registry that is not yet running.
    pub fn worker_pool(&self) -> WorkerPool {
        WorkerPool::new(
            self.store.clone(),
            self.broker.clone(),
            self.registry.clone(),
        )
        .with_workers(self.workers)
        .with_poll_interval(self.poll_interval)
    }

    /// Spawns the worker pool and, if configured, the reaper.
    pub fn start(mut self) -> Self {
        if !self.handles.is_empty() {
            tracing::warn!("JobHub already started");
            return self;
        }
        tracing::info!(
            task_types = ?self.registry.task_types().collect::<Vec<_>>(),
            "Starting JobHub"
        );
        let mut handles = self.worker_pool().spawn(self.cancellation_token.clone());
        if let Some(schedule) = self.reaper.clone() {
            handles.push(
                Reaper::new(self.store.clone(), schedule).spawn(self.cancellation_token.clone()),
            );
        }
        self.handles = handles;
        self
    }

    /// Stops taking new deliveries and waits for jobs in flight to finish.
    pub async fn graceful_shutdown(self) -> Result<(), JobHubError> {
        tracing::debug!("Shutting down JobHub tasks");
        self.cancellation_token.cancel();
        futures::future::join_all(self.handles)
            .await
            .into_iter()
            .try_for_each(|result| result.map_err(|_| JobHubError::GracefulShutdownFailed))
    }
}

#[derive(Debug, Error)]
pub enum JobHubError {
    #[error("Failed to gracefully shut down")]
    GracefulShutdownFailed,
    #[error("Invalid reaper schedule")]
    InvalidSchedule(#[from] cron::error::Error),
}
