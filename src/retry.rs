//! Failure reports, retry counters and incidents.

use std::sync::Arc;

use tracing::{debug, info};

use crate::clock::{plus_millis, Clock};
use crate::config::EngineConfig;
use crate::error::{LeaseAction, TaskError};
use crate::lease::{check_holder, require_worker, LeaseManager};
use crate::store::{FailureUpdate, TaskStore};
use crate::task::{ExternalTask, TaskId, Variables};
use crate::wake::WakeCondition;

/// A worker's report that it could not process a task.
///
/// `retries` is taken as given; the caller decides the next budget.
#[derive(Debug, Clone, Default)]
pub struct FailureReport {
    pub worker_id: String,
    pub error_message: Option<String>,
    pub error_details: Option<String>,
    pub retries: i32,
    /// Milliseconds before the task may be fetched again.
    pub retry_duration_ms: i64,
    pub variables: Variables,
    pub local_variables: Variables,
}

impl FailureReport {
    pub fn new(worker_id: impl Into<String>, retries: i32, retry_duration_ms: i64) -> Self {
        Self {
            worker_id: worker_id.into(),
            retries,
            retry_duration_ms,
            ..Default::default()
        }
    }

    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.error_message = Some(message.into());
        self
    }

    pub fn details(mut self, details: impl Into<String>) -> Self {
        self.error_details = Some(details.into());
        self
    }

    pub fn variables(mut self, variables: Variables) -> Self {
        self.variables = variables;
        self
    }

    pub fn local_variables(mut self, variables: Variables) -> Self {
        self.local_variables = variables;
        self
    }
}

pub(crate) fn require_retries(retries: i32) -> Result<(), TaskError> {
    if retries < 0 {
        return Err(TaskError::validation(
            "retries is not greater than or equal to 0",
        ));
    }
    Ok(())
}

/// Keep at most `max_chars` characters of an error message.
pub(crate) fn truncate_message(message: &str, max_chars: usize) -> String {
    match message.char_indices().nth(max_chars) {
        Some((end, _)) => message[..end].to_string(),
        None => message.to_string(),
    }
}

/// Interprets failure reports and administrative retry updates.
///
/// Retries reaching zero open an incident for the task unless one is already
/// open. Retries set above zero resolve it.
pub struct RetryManager {
    store: Arc<dyn TaskStore>,
    clock: Arc<dyn Clock>,
    wake: Arc<WakeCondition>,
    leases: Arc<LeaseManager>,
    error_message_max_len: usize,
}

impl RetryManager {
    pub fn new(
        store: Arc<dyn TaskStore>,
        clock: Arc<dyn Clock>,
        wake: Arc<WakeCondition>,
        leases: Arc<LeaseManager>,
        config: &EngineConfig,
    ) -> Self {
        Self {
            store,
            clock,
            wake,
            leases,
            error_message_max_len: config.error_message_max_len,
        }
    }

    /// Record a failure by the task's holder.
    ///
    /// The lease ends now, but the task stays ineligible for fetching until
    /// `retry_duration_ms` has passed.
    pub async fn report_failure(
        &self,
        task_id: &TaskId,
        report: FailureReport,
    ) -> Result<ExternalTask, TaskError> {
        require_worker(&report.worker_id)?;
        require_retries(report.retries)?;
        if report.retry_duration_ms < 0 {
            return Err(TaskError::validation(
                "retryDuration is not greater than or equal to 0",
            ));
        }

        let task = self.leases.load(task_id).await?;
        check_holder(&task, &report.worker_id, LeaseAction::Failure)?;
        if task.suspended {
            return Err(TaskError::Suspended(task.id));
        }

        let now = self.clock.now();
        let update = FailureUpdate {
            task_id: task.id.clone(),
            worker_id: report.worker_id.clone(),
            error_message: report
                .error_message
                .as_deref()
                .map(|m| truncate_message(m, self.error_message_max_len)),
            error_details: report.error_details,
            retries: report.retries,
            retry_after: plus_millis(now, report.retry_duration_ms),
            variables: report.variables,
            local_variables: report.local_variables,
            now,
        };

        let updated = match self.store.record_failure(&update).await? {
            Some(updated) => updated,
            None => {
                return Err(self
                    .leases
                    .conflict_after_race(LeaseAction::Failure, task_id, &report.worker_id)
                    .await)
            }
        };

        if report.retries == 0 {
            info!(
                task = %task_id,
                worker = %report.worker_id,
                topic = %updated.topic_name,
                "retries exhausted; incident open"
            );
        } else {
            debug!(
                task = %task_id,
                worker = %report.worker_id,
                retries = report.retries,
                retry_after = %update.retry_after,
                "failure recorded"
            );
            self.wake.signal();
        }
        Ok(updated)
    }

    /// Administratively set the retries of one task. No lock is required.
    pub async fn set_retries(&self, task_id: &TaskId, retries: i32) -> Result<(), TaskError> {
        if task_id.as_str().is_empty() {
            return Err(TaskError::validation("externalTaskId is null"));
        }
        require_retries(retries)?;
        self.leases.load(task_id).await?;
        match self.apply(std::slice::from_ref(task_id), retries, true).await {
            Err(TaskError::BadRequest(_)) => Err(TaskError::not_found(Some(task_id.as_str()))),
            other => other.map(|_| ()),
        }
    }

    /// Set retries on all listed tasks in one all-or-nothing update.
    pub async fn set_retries_many(&self, task_ids: &[TaskId], retries: i32) -> Result<(), TaskError> {
        if task_ids.is_empty() {
            return Err(TaskError::validation("externalTaskIds is empty"));
        }
        if task_ids.iter().any(|id| id.as_str().is_empty()) {
            return Err(TaskError::BadRequest(
                "External task id cannot be null".to_string(),
            ));
        }
        require_retries(retries)?;
        self.apply(task_ids, retries, true).await.map(|_| ())
    }

    /// Update retries and apply the incident rule. Used by the bulk paths.
    pub(crate) async fn apply(
        &self,
        task_ids: &[TaskId],
        retries: i32,
        require_all: bool,
    ) -> Result<Vec<TaskId>, TaskError> {
        let now = self.clock.now();
        let updated = self
            .store
            .update_retries(task_ids, retries, require_all, now)
            .await?;

        if retries == 0 {
            info!(count = updated.len(), "retries set to zero; incidents open");
        } else {
            debug!(count = updated.len(), retries, "retries updated");
            if !updated.is_empty() {
                self.wake.signal();
            }
        }
        Ok(updated)
    }

    /// Full details of the task's most recent failure.
    pub async fn error_details(&self, task_id: &TaskId) -> Result<Option<String>, TaskError> {
        if task_id.as_str().is_empty() {
            return Err(TaskError::not_found(None));
        }
        self.store.error_details(task_id).await
    }
}
