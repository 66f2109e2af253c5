//! Task bodies: the application code a job runs.
//!
//! A task is registered under a unique name together with the lane it is published to, how many
//! times it may be retried and how long a single attempt may take.
//!
//! # Example
//!
//! ```
//! # use jobhub::prelude::*;
//! use serde::{Deserialize, Serialize};
//!
//! struct GradeSubmission;
//!
//! #[derive(Deserialize)]
//! struct Submission {
//!     submission_id: i64,
//! }
//!
//! #[derive(Serialize)]
//! struct Grade {
//!     submission_id: i64,
//!     score: u8,
//! }
//!
//! #[async_trait::async_trait]
//! impl TaskBody for GradeSubmission {
//!     type Input = Submission;
//!     type Output = Grade;
//!     const NAME: &'static str = "grade_submission";
//!
//!     async fn run(
//!         &self,
//!         input: Self::Input,
//!         progress: ProgressReporter,
//!     ) -> Result<Self::Output, TaskError> {
//!         progress.report(50, "grading").await;
//!         Ok(Grade { submission_id: input.submission_id, score: 87 })
//!     }
//! }
//! ```
use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;

use crate::{
    backoff::BackoffStrategy, job::Lane, progress::ProgressReporter, store::contains_nul,
};

mod registry;

pub use registry::{TaskRegistry, TaskSettings};

/// The work behind one task type.
#[async_trait]
pub trait TaskBody: Send + Sync + 'static {
    /// The job's input payload.
    type Input: DeserializeOwned + Send;
    /// Stored as the job's result on success.
    type Output: Serialize + Send;

    /// The task type under which jobs are enqueued. Must be unique within a registry.
    const NAME: &'static str;
    const LANE: Lane = Lane::Default;
    /// Retries allowed after the first attempt.
    const MAX_RETRIES: u32 = 3;

    /// Upper bound on a single attempt. `None` falls back to [`TaskRegistry::DEFAULT_TIMEOUT`].
    fn timeout(&self) -> Option<Duration> {
        None
    }

    fn backoff(&self) -> BackoffStrategy {
        BackoffStrategy::default()
    }

    async fn run(
        &self,
        input: Self::Input,
        progress: ProgressReporter,
    ) -> Result<Self::Output, TaskError>;
}

/// Error raised by a task body.
///
/// Transient errors are retried while the job has retries left; permanent errors fail the job
/// straight away.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TaskError {
    #[error("{kind}: {message}")]
    Transient { kind: &'static str, message: String },
    #[error("{kind}: {message}")]
    Permanent { kind: &'static str, message: String },
}

impl TaskError {
    pub fn transient(kind: &'static str, message: impl Into<String>) -> Self {
        Self::Transient {
            kind,
            message: message.into(),
        }
    }

    pub fn permanent(kind: &'static str, message: impl Into<String>) -> Self {
        Self::Permanent {
            kind,
            message: message.into(),
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::transient("timeout", message)
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::transient("network", message)
    }

    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self::transient("rate_limited", message)
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::permanent("invalid_input", message)
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::permanent("forbidden", message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::permanent("not_found", message)
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Transient { kind, .. } | Self::Permanent { kind, .. } => kind,
        }
    }
}

/// A [`TaskBody`] with its payload types erased to JSON.
#[async_trait]
pub(crate) trait ErasedTask: Send + Sync {
    async fn run(
        &self,
        input: serde_json::Value,
        progress: ProgressReporter,
    ) -> Result<serde_json::Value, TaskError>;
}

struct Erased<T>(T);

#[async_trait]
impl<T: TaskBody> ErasedTask for Erased<T> {
    async fn run(
        &self,
        input: serde_json::Value,
        progress: ProgressReporter,
    ) -> Result<serde_json::Value, TaskError> {
        let input = serde_json::from_value::<T::Input>(input).map_err(|err| {
            TaskError::invalid_input(format!("could not decode input for {}: {err}", T::NAME))
        })?;
        let output = self.0.run(input, progress).await?;
        let output = serde_json::to_value(output).map_err(|err| {
            TaskError::permanent(
                "invalid_output",
                format!("could not encode result of {}: {err}", T::NAME),
            )
        })?;
        if contains_nul(&output) {
            return Err(TaskError::permanent(
                "invalid_output",
                format!("result of {} contains a NUL character", T::NAME),
            ));
        }
        Ok(output)
    }
}

pub(crate) fn erase<T: TaskBody>(body: T) -> Arc<dyn ErasedTask> {
    Arc::new(Erased(body))
}

#[cfg(test)]
pub(crate) mod test {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use assert_matches::assert_matches;
    use serde_json::json;

    use super::*;

    /// Returns its input after reporting progress half way.
    pub(crate) struct EchoTask;

    #[async_trait]
    impl TaskBody for EchoTask {
        type Input = serde_json::Value;
        type Output = serde_json::Value;
        const NAME: &'static str = "echo";
        const LANE: Lane = Lane::High;

        fn backoff(&self) -> BackoffStrategy {
            BackoffStrategy::none()
        }

        async fn run(
            &self,
            input: Self::Input,
            progress: ProgressReporter,
        ) -> Result<Self::Output, TaskError> {
            progress.report(50, "echoing").await;
            Ok(input)
        }
    }

    /// Fails with the given error on every attempt.
    pub(crate) struct FailingTask {
        pub(crate) error: TaskError,
        pub(crate) attempts: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl TaskBody for FailingTask {
        type Input = serde_json::Value;
        type Output = ();
        const NAME: &'static str = "failing";
        const MAX_RETRIES: u32 = 2;

        fn backoff(&self) -> BackoffStrategy {
            BackoffStrategy::none()
        }

        async fn run(&self, _: Self::Input, _: ProgressReporter) -> Result<(), TaskError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            Err(self.error.clone())
        }
    }

    #[derive(serde::Deserialize)]
    struct Typed {
        #[allow(dead_code)]
        value: u32,
    }

    struct TypedTask;

    #[async_trait]
    impl TaskBody for TypedTask {
        type Input = Typed;
        type Output = ();
        const NAME: &'static str = "typed";

        async fn run(&self, _: Self::Input, _: ProgressReporter) -> Result<(), TaskError> {
            Ok(())
        }
    }

    #[test]
    fn errors_classify_retryability() {
        assert!(TaskError::timeout("slow").is_retryable());
        assert!(TaskError::network("reset").is_retryable());
        assert!(TaskError::rate_limited("429").is_retryable());
        assert!(!TaskError::invalid_input("bad").is_retryable());
        assert!(!TaskError::forbidden("no").is_retryable());
        assert!(!TaskError::not_found("gone").is_retryable());
        assert_eq!(TaskError::network("reset").to_string(), "network: reset");
        assert_eq!(TaskError::not_found("gone").kind(), "not_found");
    }

    #[tokio::test]
    async fn undecodable_input_is_permanent() {
        let body = erase(TypedTask);
        let progress = ProgressReporter::detached();

        let result = body.run(json!({"value": "nope"}), progress.clone()).await;
        assert_matches!(result, Err(TaskError::Permanent { kind: "invalid_input", .. }));

        let result = body.run(json!({"value": 1}), progress).await;
        assert_eq!(result, Ok(serde_json::Value::Null));
    }

    #[tokio::test]
    async fn result_with_nul_character_is_permanent() {
        let body = erase(EchoTask);

        let result = body
            .run(json!({"name": "a\u{0}b"}), ProgressReporter::detached())
            .await;

        assert_matches!(result, Err(TaskError::Permanent { kind: "invalid_output", .. }));
    }
}
