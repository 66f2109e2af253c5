//! Transport of job references from producers to workers.
//!
//! Messages carry only the job identifier and task type; workers always reload the record from the
//! [`crate::store::JobStore`] before running anything.
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::job::{JobId, Lane};

pub mod memory;
#[doc(hidden)]
pub mod testing;

/// The message placed on a lane.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRef {
    pub job_id: JobId,
    pub task_type: String,
}

/// A message taken off a lane by a worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub lane: Lane,
    pub task: TaskRef,
}

/// A prioritised, multi-lane message queue.
///
/// Delivery is at-least-once; a message handed out by [`Broker::receive`] is never handed to a
/// second receiver unless it is published again.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Broker: Send + Sync {
    /// Appends a message to `lane`. With a `delay` the message stays invisible until it elapses.
    async fn publish(
        &self,
        lane: Lane,
        task: TaskRef,
        delay: Option<Duration>,
    ) -> Result<(), BrokerError>;

    /// Takes the next visible message in strict lane priority, waiting at most `wait`.
    async fn receive(&self, wait: Duration) -> Result<Option<Delivery>, BrokerError>;

    /// Number of messages, visible or delayed, waiting on `lane`.
    async fn pending(&self, lane: Lane) -> Result<usize, BrokerError>;
}

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("Broker is closed")]
    Closed,
    #[error("Broker in bad state")]
    BadState,
    #[error("Broker connection error: {0}")]
    Connection(String),
    #[error("Error encoding or decoding message")]
    Encode(#[from] serde_json::Error),
}
