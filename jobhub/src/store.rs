//! Persistence of job records.
//!
//! Every state transition is expressed as a conditional update so that the record, not the broker,
//! decides whether a worker may proceed. Implementations must make each method atomic with respect
//! to a single record.
use std::borrow::Cow;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::job::{
    query::{JobFilter, JobPage, JobStats, Page, Scope},
    Job, JobId, NewJob,
};

pub mod memory;
pub(crate) mod queryable;
#[doc(hidden)]
pub mod testing;

/// Storage of job records.
///
/// For tests and single process deployments there is [`memory::InMemoryStore`]. The
/// `jobhub-sqlx` crate provides a PostgreSQL implementation.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Persists a new record in the `queued` state.
    async fn insert(&self, job: NewJob) -> Result<Job, StoreError>;

    async fn get(&self, id: JobId) -> Result<Option<Job>, StoreError>;

    /// Moves a `queued` job to `processing`, stamping `started_at`.
    ///
    /// Returns `None` when the job is missing or not queued, in which case the delivery must be
    /// dropped.
    async fn mark_processing(&self, id: JobId) -> Result<Option<Job>, StoreError>;

    /// Records progress of a `processing` job. Returns `false` when the job is no longer
    /// processing.
    async fn update_progress(&self, id: JobId, progress: u8, step: &str)
        -> Result<bool, StoreError>;

    /// Completes a `processing` job with its result, setting progress to 100.
    async fn mark_completed(
        &self,
        id: JobId,
        result: serde_json::Value,
    ) -> Result<bool, StoreError>;

    /// Moves a `processing` job with retries left back to `queued`, incrementing `retry_count`.
    async fn mark_retrying(&self, id: JobId, error: &str) -> Result<Option<Job>, StoreError>;

    /// Fails a job that is not yet terminal. Returns `false` if it was already terminal.
    async fn mark_failed(&self, id: JobId, error: &str) -> Result<bool, StoreError>;

    /// Matching jobs ordered newest first.
    async fn list(&self, filter: &JobFilter, page: Page) -> Result<JobPage, StoreError>;

    async fn stats(&self, scope: Scope, since: DateTime<Utc>) -> Result<JobStats, StoreError>;

    /// Deletes terminal jobs whose `expires_at` is before `now`, returning how many went.
    async fn delete_expired(&self, now: DateTime<Utc>) -> Result<u64, StoreError>;
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Job {0} not found")]
    NotFound(JobId),
    #[error("Store in bad state")]
    BadState,
    #[error("Database error: {0}")]
    Database(String),
    #[error("Error encoding or decoding data")]
    Encode(#[from] serde_json::Error),
}

/// Drops NUL characters, which PostgreSQL text columns cannot hold.
///
/// Stores apply it to error messages and step labels so every implementation records the same text.
pub fn strip_nul(text: &str) -> Cow<'_, str> {
    if text.contains('\0') {
        Cow::Owned(text.replace('\0', ""))
    } else {
        Cow::Borrowed(text)
    }
}

/// Whether any string or object key in `value` contains a NUL character.
///
/// Such payloads cannot be stored as PostgreSQL `jsonb`, so they are refused before reaching a
/// store.
pub fn contains_nul(value: &serde_json::Value) -> bool {
    use serde_json::Value;
    match value {
        Value::String(text) => text.contains('\0'),
        Value::Array(items) => items.iter().any(contains_nul),
        Value::Object(fields) => fields
            .iter()
            .any(|(key, value)| key.contains('\0') || contains_nul(value)),
        Value::Null | Value::Bool(_) | Value::Number(_) => false,
    }
}

/// Step recorded when a failed attempt is put back on the queue.
pub fn retry_step(error: &str) -> String {
    format!("retrying after: {error}")
}
