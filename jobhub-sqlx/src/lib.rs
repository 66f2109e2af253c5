//! A PostgreSQL [`JobStore`](jobhub::store::JobStore) for jobhub.
//!
//! # Example
//!
//! ```no_run
//! # use jobhub::{broker::memory::InMemoryBroker, JobHub};
//! # use jobhub_sqlx::PgJobStore;
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let store = PgJobStore::connect("postgres://localhost/jobhub").await?;
//! store.migrate().await?;
//!
//! let hub = JobHub::new(store, InMemoryBroker::new()).start();
//! # hub.graceful_shutdown().await?;
//! # Ok(())
//! # }
//! ```
mod query;
mod store;
mod types;

pub use store::PgJobStore;
