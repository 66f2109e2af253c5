use std::{collections::HashMap, sync::Arc, time::Duration};

use chrono::TimeDelta;

use crate::{backoff::BackoffStrategy, job::Lane, settings::TaskOverride};

use super::{erase, ErasedTask, TaskBody};

/// Scheduling settings of a registered task type.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskSettings {
    pub lane: Lane,
    pub max_retries: u32,
    pub timeout: Duration,
    pub backoff: BackoffStrategy,
}

#[derive(Clone)]
pub(crate) struct RegisteredTask {
    pub(crate) body: Arc<dyn ErasedTask>,
    pub(crate) settings: TaskSettings,
}

/// Mapping from task type to the body that runs it.
///
/// Every producer and worker in a deployment must be built from the same registry.
#[derive(Clone, Default)]
pub struct TaskRegistry {
    tasks: HashMap<String, RegisteredTask>,
}

impl TaskRegistry {
    /// Attempt limit for bodies that do not declare one.
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10 * 60);

    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `body` under [`TaskBody::NAME`], replacing any previous registration.
    pub fn register<T: TaskBody>(&mut self, body: T) -> &mut Self {
        let settings = TaskSettings {
            lane: T::LANE,
            max_retries: T::MAX_RETRIES,
            timeout: body.timeout().unwrap_or(Self::DEFAULT_TIMEOUT),
            backoff: body.backoff(),
        };
        if self
            .tasks
            .insert(
                T::NAME.to_owned(),
                RegisteredTask {
                    body: erase(body),
                    settings,
                },
            )
            .is_some()
        {
            tracing::warn!(task_type = T::NAME, "Replacing task body for {}", T::NAME);
        }
        self
    }

    pub fn contains(&self, task_type: &str) -> bool {
        self.tasks.contains_key(task_type)
    }

    pub fn settings(&self, task_type: &str) -> Option<&TaskSettings> {
        self.tasks.get(task_type).map(|task| &task.settings)
    }

    pub fn task_types(&self) -> impl Iterator<Item = &str> {
        self.tasks.keys().map(String::as_str)
    }

    pub(crate) fn get(&self, task_type: &str) -> Option<&RegisteredTask> {
        self.tasks.get(task_type)
    }

    /// Replaces compiled-in settings with configured ones.
    pub fn apply_overrides<'a>(
        &mut self,
        overrides: impl IntoIterator<Item = (&'a String, &'a TaskOverride)>,
    ) {
        for (task_type, task_override) in overrides {
            let Some(task) = self.tasks.get_mut(task_type) else {
                tracing::warn!(%task_type, "Ignoring settings for unregistered task {task_type}");
                continue;
            };
            let settings = &mut task.settings;
            if let Some(lane) = task_override.lane {
                settings.lane = lane;
            }
            if let Some(max_retries) = task_override.max_retries {
                settings.max_retries = max_retries;
            }
            if let Some(timeout_secs) = task_override.timeout_secs {
                settings.timeout = Duration::from_secs(timeout_secs);
            }
            if let Some(backoff_secs) = task_override.backoff_secs {
                settings.backoff = BackoffStrategy::linear(TimeDelta::seconds(backoff_secs))
                    .with_max(TimeDelta::minutes(5));
            }
            tracing::debug!(%task_type, ?settings, "Applied settings for task {task_type}");
        }
    }
}
