//! Hosts a jobhub worker pool and reaper behind the `/jobs` HTTP API.
use std::sync::Arc;

use jobhub::{
    broker::{memory::InMemoryBroker, Broker},
    settings::Settings,
    store::{memory::InMemoryStore, JobStore},
    JobHub,
};
use jobhub_redis::RedisBroker;
use jobhub_sqlx::PgJobStore;

pub mod routes;
pub mod settings;
pub mod tasks;
pub mod telemetry;

/// Connects the configured store and broker and registers the bundled task bodies.
///
/// Without a `database_url` or `broker_url` the in-memory implementations are used, which only
/// suits a single process.
pub async fn build_hub(settings: &Settings) -> anyhow::Result<JobHub> {
    let store: Arc<dyn JobStore> = match &settings.database_url {
        Some(database_url) => {
            let store = PgJobStore::connect(database_url).await?;
            store.migrate().await?;
            Arc::new(store)
        }
        None => {
            tracing::warn!("No database_url configured, job records are kept in memory");
            Arc::new(InMemoryStore::new())
        }
    };
    let broker: Arc<dyn Broker> = match &settings.broker_url {
        Some(broker_url) => {
            Arc::new(RedisBroker::connect(broker_url, &settings.broker_namespace).await?)
        }
        None => {
            tracing::warn!("No broker_url configured, messages are kept in memory");
            Arc::new(InMemoryBroker::new())
        }
    };

    Ok(tasks::register(JobHub::from_shared(store, broker)).with_settings(settings)?)
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn default_settings_build_in_memory_hub() {
        let hub = build_hub(&Settings::default()).await.unwrap();

        assert!(hub.registry().contains("echo"));
    }
}
