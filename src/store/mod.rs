//! Task storage trait and transition types.
//!
//! The store is the single source of truth for lock state. Every method that
//! changes a task applies its history and incident rows in the same
//! transaction, and every ownership-sensitive write is conditional on the lock
//! fields the caller observed.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::TaskError;
use crate::fetch::{FetchOrdering, TopicSubscription};
use crate::history::HistoricLogEntry;
use crate::incident::{Incident, IncidentState};
use crate::query::ExternalTaskQuery;
use crate::task::{ExternalTask, Lease, TaskId, Variables};

#[cfg(feature = "sqlite")]
mod sqlite;

#[cfg(feature = "sqlite")]
pub use sqlite::SqliteTaskStore;

/// A failure report that passed validation and ownership checks.
#[derive(Debug, Clone)]
pub struct FailureUpdate {
    pub task_id: TaskId,
    /// Holder the update is conditional on.
    pub worker_id: String,
    /// Already truncated to the configured bound.
    pub error_message: Option<String>,
    pub error_details: Option<String>,
    pub retries: i32,
    pub retry_after: DateTime<Utc>,
    pub variables: Variables,
    pub local_variables: Variables,
    pub now: DateTime<Utc>,
}

/// Removal of a task by its holder after success or a BPMN error.
#[derive(Debug, Clone)]
pub struct Completion {
    pub task_id: TaskId,
    pub worker_id: String,
    /// Written to the process instance scope.
    pub variables: Variables,
    /// Written to the task's execution scope.
    pub local_variables: Variables,
    pub now: DateTime<Utc>,
}

/// Filter for incident lookups. Unset fields match everything.
#[derive(Debug, Clone, Default)]
pub struct IncidentFilter {
    pub configuration: Option<TaskId>,
    pub process_instance_id: Option<String>,
    pub state: Option<IncidentState>,
}

impl IncidentFilter {
    pub fn for_task(id: &TaskId) -> Self {
        Self {
            configuration: Some(id.clone()),
            ..Default::default()
        }
    }

    pub fn open() -> Self {
        Self {
            state: Some(IncidentState::Open),
            ..Default::default()
        }
    }
}

/// Trait for external task storage backends.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Insert a new task and its creation log entry. Returns the task with its
    /// insertion sequence assigned.
    async fn insert(&self, task: ExternalTask) -> Result<ExternalTask, TaskError>;

    async fn get(&self, id: &TaskId) -> Result<Option<ExternalTask>, TaskError>;

    /// List tasks matching `query`, sorted by its sort keys.
    async fn find(
        &self,
        query: &ExternalTaskQuery,
        now: DateTime<Utc>,
    ) -> Result<Vec<ExternalTask>, TaskError>;

    async fn count(&self, query: &ExternalTaskQuery, now: DateTime<Utc>) -> Result<usize, TaskError> {
        Ok(self.find(query, now).await?.len())
    }

    /// Up to `limit` tasks fetchable at `now` for one subscription, in `ordering`.
    async fn select_candidates(
        &self,
        subscription: &TopicSubscription,
        ordering: FetchOrdering,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<ExternalTask>, TaskError>;

    /// Lease a task for a fetch. Succeeds only if the lock fields still equal
    /// `observed` and the task is still fetchable at `now`.
    async fn try_acquire(
        &self,
        id: &TaskId,
        observed: Option<&Lease>,
        lease: &Lease,
        now: DateTime<Utc>,
    ) -> Result<bool, TaskError>;

    /// Replace the lease of a non-suspended task if its lock fields still equal `observed`.
    async fn replace_lease(
        &self,
        id: &TaskId,
        observed: Option<&Lease>,
        lease: &Lease,
    ) -> Result<bool, TaskError>;

    /// Clear the lease and any retry delay. Returns `false` if the task does not exist.
    async fn release(&self, id: &TaskId) -> Result<bool, TaskError>;

    /// Apply a failure report. Returns `None` if the task is no longer held by
    /// the reporting worker.
    async fn record_failure(&self, failure: &FailureUpdate) -> Result<Option<ExternalTask>, TaskError>;

    /// Set retries on every listed task and open or resolve their incidents.
    ///
    /// With `require_all`, a missing id aborts the whole update with a bad
    /// request error. Otherwise missing ids are skipped. Returns the ids updated.
    async fn update_retries(
        &self,
        ids: &[TaskId],
        retries: i32,
        require_all: bool,
        now: DateTime<Utc>,
    ) -> Result<Vec<TaskId>, TaskError>;

    /// Remove a task held by `completion.worker_id`. Returns the removed task,
    /// or `None` if another worker holds it.
    async fn complete(&self, completion: &Completion) -> Result<Option<ExternalTask>, TaskError>;

    /// Remove every task of a process instance along with its variables.
    async fn delete_process_instance(
        &self,
        process_instance_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<TaskId>, TaskError>;

    async fn set_priority(&self, id: &TaskId, priority: i64) -> Result<bool, TaskError>;

    /// Mirror the suspension state of a process instance onto its tasks.
    async fn set_suspended(&self, process_instance_id: &str, suspended: bool) -> Result<u64, TaskError>;

    /// Distinct topic names; the lock flags are ignored when both or neither are set.
    async fn topic_names(
        &self,
        with_locked: bool,
        with_unlocked: bool,
        with_retries_left: bool,
        now: DateTime<Utc>,
    ) -> Result<Vec<String>, TaskError>;

    async fn set_variables(&self, scope_id: &str, variables: &Variables) -> Result<(), TaskError>;

    async fn variables(&self, scope_id: &str) -> Result<Variables, TaskError>;

    /// Deployment of each listed task that still exists.
    async fn deployments(&self, ids: &[TaskId]) -> Result<Vec<(TaskId, Option<String>)>, TaskError>;

    async fn incidents(&self, filter: &IncidentFilter) -> Result<Vec<Incident>, TaskError>;

    /// Historic log of a task, oldest first.
    async fn history(&self, id: &TaskId) -> Result<Vec<HistoricLogEntry>, TaskError>;

    /// Details of the task's last failure.
    async fn error_details(&self, id: &TaskId) -> Result<Option<String>, TaskError>;
}
