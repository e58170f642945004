//! Handler trait and error types.

use async_trait::async_trait;
use thiserror::Error;

use crate::hooks::BpmnError;
use crate::task::{LockedExternalTask, Variables};

/// Error returned by a topic handler.
#[derive(Error, Debug)]
pub enum HandlerError {
    /// Transient failure; the task is retried per the worker's policy.
    #[error("retryable: {0}")]
    Retryable(#[source] anyhow::Error),

    /// Failure that will not go away; retries drop to zero and an incident opens.
    #[error("permanent: {0}")]
    Permanent(#[source] anyhow::Error),

    /// Business error to be caught by the process.
    #[error("bpmn error: {}", .0.error_code)]
    Bpmn(BpmnError),
}

impl HandlerError {
    pub fn retryable(err: impl Into<anyhow::Error>) -> Self {
        Self::Retryable(err.into())
    }

    pub fn permanent(err: impl Into<anyhow::Error>) -> Self {
        Self::Permanent(err.into())
    }

    pub fn bpmn(error: BpmnError) -> Self {
        Self::Bpmn(error)
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Retryable(_))
    }
}

/// Processes tasks of one topic.
#[async_trait]
pub trait TopicHandler: Send + Sync {
    /// The topic this handler subscribes to.
    fn topic(&self) -> &str;

    /// Lease length requested for each fetched task.
    fn lock_duration_ms(&self) -> i64 {
        20_000
    }

    /// Handle a leased task. The returned variables are written to the
    /// process instance when the task completes.
    async fn handle(&self, task: &LockedExternalTask) -> Result<Variables, HandlerError>;
}
