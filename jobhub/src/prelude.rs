//! The purpose of this module is to alleviate the need to import many of the [`crate`] types.
//!
//! ```
//! # #![allow(unused_imports)]
//! use jobhub::prelude::*;
//! ```
pub use crate::backoff::{BackoffStrategy, Jitter};
pub use crate::broker::{Broker, BrokerError, Delivery, TaskRef};
pub use crate::job::query::{JobFilter, JobPage, JobStats, Page, Scope};
pub use crate::job::{Job, JobId, JobStatus, Lane, Owner};
pub use crate::producer::{EnqueueError, EnqueueRequest, Producer};
pub use crate::progress::ProgressReporter;
pub use crate::reaper::{Reaper, ReaperSchedule};
pub use crate::retry::{RetryController, RetryDecision};
pub use crate::status::{ListFilter, Requester, Role, StatusApi, StatusError};
pub use crate::store::{JobStore, StoreError};
pub use crate::task::{TaskBody, TaskError, TaskRegistry, TaskSettings};
pub use crate::worker::{Outcome, WorkerPool};
pub use crate::{JobHub, JobHubError};
