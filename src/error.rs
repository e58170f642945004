//! Error types for external task operations.

use thiserror::Error;

use crate::task::TaskId;

/// Coarse classification of a [`TaskError`] that client code can branch on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed or missing input.
    Validation,
    /// The targeted task does not exist.
    NotFound,
    /// Lease ownership was violated.
    Conflict,
    /// The task belongs to a suspended process instance.
    BusinessState,
    /// A bulk request referenced ids that could not be resolved.
    BadRequest,
    /// Storage, serialization or host-hook failure.
    Internal,
}

/// Operation that requires the caller to hold the task's lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseAction {
    Lock,
    Complete,
    Failure,
    BpmnError,
    Extend,
}

/// Error type for external task operations.
#[derive(Error, Debug)]
pub enum TaskError {
    #[error("{0}")]
    Validation(String),

    #[error("Cannot find external task with id {0}")]
    NotFound(String),

    #[error("{}", conflict_message(.action, .task_id, .worker_id, .holder.as_deref()))]
    LockConflict {
        action: LeaseAction,
        task_id: TaskId,
        worker_id: String,
        holder: Option<String>,
    },

    #[error("Cannot extend a lock that expired: external task {task_id} was locked by worker '{worker_id}'")]
    LockExpired { task_id: TaskId, worker_id: String },

    #[error("ExternalTask with id '{0}' is suspended")]
    Suspended(TaskId),

    #[error("{0}")]
    BadRequest(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("process hook failed: {0}")]
    Hook(#[source] anyhow::Error),
}

impl TaskError {
    /// Create a validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Create a not-found error for the given (possibly absent) id.
    pub fn not_found(id: Option<&str>) -> Self {
        Self::NotFound(id.unwrap_or("null").to_string())
    }

    /// Returns the kind of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) => ErrorKind::Validation,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::LockConflict { .. } | Self::LockExpired { .. } => ErrorKind::Conflict,
            Self::Suspended(_) => ErrorKind::BusinessState,
            Self::BadRequest(_) => ErrorKind::BadRequest,
            Self::Storage(_) | Self::Serialization(_) | Self::Hook(_) => ErrorKind::Internal,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }

    pub fn is_conflict(&self) -> bool {
        self.kind() == ErrorKind::Conflict
    }
}

fn conflict_message(
    action: &LeaseAction,
    task_id: &TaskId,
    worker_id: &str,
    holder: Option<&str>,
) -> String {
    let held_by = match holder {
        Some(holder) => format!("It is locked by worker '{}'.", holder),
        None => "It is not locked.".to_string(),
    };
    match action {
        LeaseAction::Lock => format!(
            "External Task {} cannot be locked by worker '{}'. {}",
            task_id, worker_id, held_by
        ),
        LeaseAction::Complete => format!(
            "External Task {} cannot be completed by worker '{}'. {}",
            task_id, worker_id, held_by
        ),
        LeaseAction::Failure => format!(
            "Failure of External Task {} cannot be reported by worker '{}'. {}",
            task_id, worker_id, held_by
        ),
        LeaseAction::BpmnError => format!(
            "Bpmn error of External Task {} cannot be reported by worker '{}'. {}",
            task_id, worker_id, held_by
        ),
        LeaseAction::Extend => format!(
            "The lock of the External Task {} cannot be extended by worker '{}'. {}",
            task_id, worker_id, held_by
        ),
    }
}
