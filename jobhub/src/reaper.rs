//! Periodic deletion of expired terminal jobs.
//!
//! Queued and processing jobs are never deleted, however old they are.
use std::{sync::Arc, time::Duration};

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::store::{JobStore, StoreError};

/// When the reaper runs.
#[derive(Debug, Clone)]
pub enum ReaperSchedule {
    /// At a fixed interval, starting one interval after the reaper is spawned.
    Every(Duration),
    /// At each upcoming time of a cron expression, for example `0 0 * * * *` for every hour.
    Cron(Box<cron::Schedule>),
}

impl ReaperSchedule {
    pub const HOURLY: ReaperSchedule = ReaperSchedule::Every(Duration::from_secs(60 * 60));

    /// Parses a cron expression in the `cron` crate's seconds-first syntax.
    pub fn cron(expression: &str) -> Result<Self, cron::error::Error> {
        expression
            .parse::<cron::Schedule>()
            .map(|schedule| Self::Cron(Box::new(schedule)))
    }

    /// Time until the next run, or `None` if the schedule has no further runs.
    fn next_delay(&self) -> Option<Duration> {
        match self {
            Self::Every(interval) => Some(*interval),
            Self::Cron(schedule) => schedule
                .upcoming(Utc)
                .next()
                .map(|next| (next - Utc::now()).to_std().unwrap_or(Duration::ZERO)),
        }
    }
}

impl Default for ReaperSchedule {
    fn default() -> Self {
        Self::HOURLY
    }
}

pub struct Reaper {
    store: Arc<dyn JobStore>,
    schedule: ReaperSchedule,
}

impl Reaper {
    pub fn new(store: Arc<dyn JobStore>, schedule: ReaperSchedule) -> Self {
        Self { store, schedule }
    }

    /// Deletes every expired terminal job now, returning how many were removed.
    #[instrument(skip(self))]
    pub async fn run_once(&self) -> Result<u64, StoreError> {
        let deleted = self.store.delete_expired(Utc::now()).await?;
        tracing::info!(deleted, "Deleted {deleted} expired jobs");
        Ok(deleted)
    }

    pub fn spawn(self, cancellation_token: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                let Some(delay) = self.schedule.next_delay() else {
                    tracing::warn!("Reaper schedule has no upcoming runs; stopping");
                    break;
                };
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {
                        let _ = self.run_once().await.inspect_err(|err| {
                            tracing::error!(?err, "Failed to delete expired jobs with error {err}")
                        });
                    }
                    _ = cancellation_token.cancelled() => {
                        tracing::debug!("Shutting down the job reaper");
                        break;
                    },
                }
            }
        })
    }
}
