//! Callbacks into the host process engine.

use async_trait::async_trait;

use crate::task::{ExternalTask, Variables};

/// A business error raised by a worker instead of completing a task.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct BpmnError {
    pub error_code: String,
    pub error_message: Option<String>,
    pub variables: Variables,
}

impl BpmnError {
    pub fn new(error_code: impl Into<String>) -> Self {
        Self {
            error_code: error_code.into(),
            ..Default::default()
        }
    }

    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.error_message = Some(message.into());
        self
    }

    pub fn variables(mut self, variables: Variables) -> Self {
        self.variables = variables;
        self
    }
}

/// Continues process execution once a task leaves the store.
///
/// Hooks run after the removal is committed; a hook error is reported to the
/// caller but does not restore the task.
#[async_trait]
pub trait ProcessHooks: Send + Sync {
    /// The worker completed `task`; resume its execution.
    async fn on_complete(&self, task: &ExternalTask) -> anyhow::Result<()>;

    /// The worker raised `error` for `task`; propagate it to a catching boundary event.
    async fn on_bpmn_error(&self, task: &ExternalTask, error: &BpmnError) -> anyhow::Result<()>;
}

/// Hooks that do nothing. Useful when the store is used on its own.
#[derive(Debug, Clone, Default)]
pub struct NoopProcessHooks;

impl NoopProcessHooks {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ProcessHooks for NoopProcessHooks {
    async fn on_complete(&self, _task: &ExternalTask) -> anyhow::Result<()> {
        Ok(())
    }

    async fn on_bpmn_error(&self, _task: &ExternalTask, _error: &BpmnError) -> anyhow::Result<()> {
        Ok(())
    }
}
