//! # Taskgate
//!
//! Topic-based dispatch of external tasks to polling workers.
//!
//! A process engine creates an [`ExternalTask`] whenever an execution reaches
//! an external activity. Workers fetch tasks by topic and receive an exclusive
//! lease that expires on its own if the worker disappears. The holder then
//! completes the task, reports a BPMN error, or reports a failure with a retry
//! budget. A task whose retries reach zero raises an incident until an
//! administrator sets its retries again.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use taskgate::{ExternalTaskService, FetchRequest, NewExternalTask, SqliteTaskStore};
//!
//! let store = SqliteTaskStore::new(pool);
//! store.run_migrations().await?;
//! let service = ExternalTaskService::builder(store).build();
//!
//! service
//!     .create_task(NewExternalTask::new("invoice", "billing", "pi-1", "sendInvoice"))
//!     .await?;
//!
//! let request = FetchRequest::builder("worker-1", 10)
//!     .use_priority(true)
//!     .topic("invoice", 30_000)
//!     .variables(&["amount"])
//!     .build()?;
//! for task in service.fetch_and_lock(&request).await? {
//!     service.complete(task.id(), "worker-1").await?;
//! }
//! ```
//!
//! ## Workers
//!
//! [`worker::TopicWorker`] long-polls for registered topics, runs handlers
//! concurrently and turns handler errors into failure reports with retries
//! taken from a [`worker::RetryPolicy`].
//!
//! ## Feature Flags
//!
//! - `sqlite` - Enable the SQLite-backed task store

pub mod batch;
pub mod clock;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod fetch;
pub mod history;
pub mod hooks;
pub mod incident;
pub mod lease;
pub mod long_poll;
pub mod query;
pub mod retry;
pub mod service;
pub mod store;
pub mod task;
pub mod wake;
pub mod worker;

pub use batch::{
    Batch, BatchJob, BatchRunner, BatchStatus, BatchTarget, FailedBatchJob, ProcessInstanceSource,
    UpdateRetries,
};
pub use clock::{Clock, FakeClock, SystemClock};
pub use config::EngineConfig;
pub use error::{ErrorKind, LeaseAction, TaskError};
pub use fetch::{Direction, FetchBuilder, FetchRequest, TenantFilter, TopicSubscription, VariableSelection};
pub use history::{HistoricLogEntry, LogState};
pub use hooks::{BpmnError, NoopProcessHooks, ProcessHooks};
pub use incident::{Incident, IncidentState};
pub use query::{ExternalTaskQuery, SortKey};
pub use retry::FailureReport;
pub use service::{ExternalTaskService, ExternalTaskServiceBuilder};
pub use store::{IncidentFilter, TaskStore};
pub use task::{ExternalTask, Lease, LockedExternalTask, NewExternalTask, Priority, TaskId, Variables};
pub use wake::WakeCondition;

#[cfg(feature = "sqlite")]
pub use store::SqliteTaskStore;
