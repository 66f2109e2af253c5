//! Deployment settings.
//!
//! These are plain serde types; loading them from files and the environment is left to the binary
//! embedding the library.
use std::{collections::HashMap, time::Duration};

use chrono::TimeDelta;
use serde::Deserialize;

use crate::{job::Lane, reaper::ReaperSchedule};

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// PostgreSQL connection string. Without one, records are kept in memory.
    pub database_url: Option<String>,
    /// Redis connection string. Without one, messages are kept in memory.
    pub broker_url: Option<String>,
    /// Prefix of every broker key, so several deployments can share a Redis instance.
    pub broker_namespace: String,
    pub workers: usize,
    pub poll_interval_ms: u64,
    /// How long finished jobs are kept, measured from creation.
    pub retention_hours: i64,
    pub reaper: ReaperSettings,
    pub http: HttpSettings,
    pub log_format: LogFormat,
    /// Per task type overrides of lane, retries, timeout and backoff.
    pub tasks: HashMap<String, TaskOverride>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            database_url: None,
            broker_url: None,
            broker_namespace: "jobhub".to_owned(),
            workers: 4,
            poll_interval_ms: 1000,
            retention_hours: 24,
            reaper: ReaperSettings::default(),
            http: HttpSettings::default(),
            log_format: LogFormat::default(),
            tasks: HashMap::new(),
        }
    }
}

impl Settings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn retention(&self) -> TimeDelta {
        TimeDelta::hours(self.retention_hours.max(0))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ReaperSettings {
    pub interval_secs: u64,
    /// Takes precedence over `interval_secs` when set.
    pub cron: Option<String>,
}

impl Default for ReaperSettings {
    fn default() -> Self {
        Self {
            interval_secs: 60 * 60,
            cron: None,
        }
    }
}

impl ReaperSettings {
    pub fn schedule(&self) -> Result<ReaperSchedule, cron::error::Error> {
        match &self.cron {
            Some(expression) => ReaperSchedule::cron(expression),
            None => Ok(ReaperSchedule::Every(Duration::from_secs(
                self.interval_secs.max(1),
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct HttpSettings {
    pub bind: String,
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:8080".to_owned(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct TaskOverride {
    pub lane: Option<Lane>,
    pub max_retries: Option<u32>,
    pub timeout_secs: Option<u64>,
    /// Linear backoff step in seconds, capped at five minutes.
    pub backoff_secs: Option<i64>,
}

#[cfg(test)]
mod test {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn defaults() {
        let settings: Settings = serde_json::from_str("{}").unwrap();

        assert_eq!(settings, Settings::default());
        assert_eq!(settings.poll_interval(), Duration::from_secs(1));
        assert_eq!(settings.retention(), TimeDelta::hours(24));
        assert_matches!(
            settings.reaper.schedule(),
            Ok(ReaperSchedule::Every(interval)) if interval == Duration::from_secs(3600)
        );
    }

    #[test]
    fn task_overrides_deserialize() {
        let settings: Settings = serde_json::from_value(serde_json::json!({
            "workers": 8,
            "reaper": {"cron": "0 30 * * * *"},
            "log_format": "json",
            "tasks": {"send_email": {"lane": "low", "max_retries": 0, "timeout_secs": 120}}
        }))
        .unwrap();

        assert_eq!(settings.workers, 8);
        assert_eq!(settings.log_format, LogFormat::Json);
        assert_matches!(settings.reaper.schedule(), Ok(ReaperSchedule::Cron(_)));
        assert_eq!(
            settings.tasks["send_email"],
            TaskOverride {
                lane: Some(Lane::Low),
                max_retries: Some(0),
                timeout_secs: Some(120),
                backoff_secs: None,
            }
        );
    }
}
