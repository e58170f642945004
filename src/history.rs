//! Historic external task log.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::task::{ExternalTask, TaskId};

/// Transition recorded by a log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogState {
    Created,
    Failed,
    Successful,
    Deleted,
}

impl LogState {
    pub(crate) fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Failed => "failed",
            Self::Successful => "successful",
            Self::Deleted => "deleted",
        }
    }

    pub(crate) fn parse(s: &str) -> Option<Self> {
        match s {
            "created" => Some(Self::Created),
            "failed" => Some(Self::Failed),
            "successful" => Some(Self::Successful),
            "deleted" => Some(Self::Deleted),
            _ => None,
        }
    }
}

/// One entry of the historic log. Entries are append-only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoricLogEntry {
    pub id: String,
    pub external_task_id: TaskId,
    pub timestamp: DateTime<Utc>,
    pub state: LogState,
    pub topic_name: String,
    pub worker_id: Option<String>,
    pub retries: Option<i32>,
    pub priority: i64,
    pub error_message: Option<String>,
    /// Full failure details; never truncated.
    pub error_details: Option<String>,
    pub activity_id: String,
    pub execution_id: String,
    pub process_instance_id: String,
    pub process_definition_id: String,
    pub process_definition_key: String,
    pub tenant_id: Option<String>,
}

impl HistoricLogEntry {
    /// Snapshot the task's current state as a log entry.
    pub(crate) fn record(task: &ExternalTask, state: LogState, now: DateTime<Utc>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            external_task_id: task.id.clone(),
            timestamp: now,
            state,
            topic_name: task.topic_name.clone(),
            worker_id: task.worker_id().map(str::to_string),
            retries: task.retries,
            priority: task.priority,
            error_message: task.error_message.clone(),
            error_details: None,
            activity_id: task.activity_id.clone(),
            execution_id: task.execution_id.clone(),
            process_instance_id: task.process_instance_id.clone(),
            process_definition_id: task.process_definition_id.clone(),
            process_definition_key: task.process_definition_key.clone(),
            tenant_id: task.tenant_id.clone(),
        }
    }
}
