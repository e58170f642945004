//! Incidents raised when a task runs out of retries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::task::{ExternalTask, TaskId};

/// Incident type recorded for external task failures.
pub const FAILED_EXTERNAL_TASK: &str = "failedExternalTask";

/// Lifecycle state of an incident.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IncidentState {
    Open,
    /// Retries were set above zero again.
    Resolved,
    /// The task's process instance was removed.
    Deleted,
}

impl IncidentState {
    pub(crate) fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Resolved => "resolved",
            Self::Deleted => "deleted",
        }
    }

    pub(crate) fn parse(s: &str) -> Option<Self> {
        match s {
            "open" => Some(Self::Open),
            "resolved" => Some(Self::Resolved),
            "deleted" => Some(Self::Deleted),
            _ => None,
        }
    }
}

/// Durable record of a failure that exhausted a task's retries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Incident {
    pub id: String,
    pub incident_type: String,
    /// The external task id this incident correlates to.
    pub configuration: TaskId,
    /// Historic log entry of the failure that raised the incident.
    pub history_configuration: Option<String>,
    pub execution_id: String,
    pub activity_id: String,
    pub process_definition_id: String,
    pub process_instance_id: String,
    pub tenant_id: Option<String>,
    pub incident_message: Option<String>,
    pub cause_incident_id: String,
    pub root_cause_incident_id: String,
    pub timestamp: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub state: IncidentState,
}

impl Incident {
    /// Build the open incident for a task whose retries just reached zero.
    pub(crate) fn for_task(
        task: &ExternalTask,
        message: Option<String>,
        history_configuration: Option<String>,
        now: DateTime<Utc>,
    ) -> Self {
        let id = uuid::Uuid::new_v4().to_string();
        Self {
            incident_type: FAILED_EXTERNAL_TASK.to_string(),
            configuration: task.id.clone(),
            history_configuration,
            execution_id: task.execution_id.clone(),
            activity_id: task.activity_id.clone(),
            process_definition_id: task.process_definition_id.clone(),
            process_instance_id: task.process_instance_id.clone(),
            tenant_id: task.tenant_id.clone(),
            incident_message: message,
            cause_incident_id: id.clone(),
            root_cause_incident_id: id.clone(),
            id,
            timestamp: now,
            end_time: None,
            state: IncidentState::Open,
        }
    }

    pub fn is_open(&self) -> bool {
        self.state == IncidentState::Open
    }
}

/// What a retries update does to the task's incident.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IncidentAction {
    /// Open this incident unless one is already open for the task.
    Open(Incident),
    /// Resolve the open incident, if any.
    Resolve,
}

impl IncidentAction {
    /// Decide the incident transition for `task` whose retries become `retries`.
    ///
    /// `task` carries the state after the update, so its error message is the
    /// one the incident reports.
    pub fn for_retries(
        task: &ExternalTask,
        retries: i32,
        history_configuration: Option<String>,
        now: DateTime<Utc>,
    ) -> Self {
        if retries == 0 {
            Self::Open(Incident::for_task(
                task,
                task.error_message.clone(),
                history_configuration,
                now,
            ))
        } else {
            Self::Resolve
        }
    }
}
