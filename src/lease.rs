//! Lock state machine of a single task.
//!
//! A task is either unlocked or leased to one worker until an expiry instant.
//! Expiry is never written by a timer: a lease whose `expires_at <= now` is
//! simply ignored by eligibility checks and overwritten by the next acquire.
//! All writes are conditional on the lock fields read beforehand, so two
//! concurrent acquirers can never both succeed.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::clock::{plus_millis, Clock};
use crate::error::{LeaseAction, TaskError};
use crate::store::{Completion, TaskStore};
use crate::task::{ExternalTask, Lease, TaskId, Variables};
use crate::wake::WakeCondition;

pub(crate) fn require_worker(worker_id: &str) -> Result<(), TaskError> {
    if worker_id.is_empty() {
        return Err(TaskError::validation("workerId is null"));
    }
    Ok(())
}

pub(crate) fn require_lock_duration(lock_duration_ms: i64) -> Result<(), TaskError> {
    if lock_duration_ms <= 0 {
        return Err(TaskError::validation("lockTime is not greater than 0"));
    }
    Ok(())
}

/// Owns acquire, explicit lock, extend, release and holder checks.
pub struct LeaseManager {
    store: Arc<dyn TaskStore>,
    clock: Arc<dyn Clock>,
    wake: Arc<WakeCondition>,
}

impl LeaseManager {
    pub fn new(store: Arc<dyn TaskStore>, clock: Arc<dyn Clock>, wake: Arc<WakeCondition>) -> Self {
        Self { store, clock, wake }
    }

    /// Load a task or fail with not-found. An empty id counts as absent.
    pub async fn load(&self, task_id: &TaskId) -> Result<ExternalTask, TaskError> {
        if task_id.as_str().is_empty() {
            return Err(TaskError::not_found(None));
        }
        self.store
            .get(task_id)
            .await?
            .ok_or_else(|| TaskError::not_found(Some(task_id.as_str())))
    }

    /// Lease `task` for a fetch, comparing against the lock state it was read with.
    ///
    /// Returns `None` when another fetch won the race.
    pub(crate) async fn acquire(
        &self,
        task: &ExternalTask,
        worker_id: &str,
        lock_duration_ms: i64,
        now: DateTime<Utc>,
    ) -> Result<Option<Lease>, TaskError> {
        let lease = Lease {
            worker_id: worker_id.to_string(),
            expires_at: plus_millis(now, lock_duration_ms),
        };
        if self
            .store
            .try_acquire(&task.id, task.lease.as_ref(), &lease, now)
            .await?
        {
            Ok(Some(lease))
        } else {
            debug!(task = %task.id, worker = worker_id, "lost lease race");
            Ok(None)
        }
    }

    /// Lock a task directly. The current holder may renew; anyone else must wait
    /// for the lease to expire.
    pub async fn lock(
        &self,
        task_id: &TaskId,
        worker_id: &str,
        lock_duration_ms: i64,
    ) -> Result<Lease, TaskError> {
        require_worker(worker_id)?;
        require_lock_duration(lock_duration_ms)?;

        let task = self.load(task_id).await?;
        if task.suspended {
            return Err(TaskError::Suspended(task.id));
        }

        let now = self.clock.now();
        if let Some(current) = &task.lease {
            if current.worker_id != worker_id && !current.is_expired_at(now) {
                return Err(conflict(LeaseAction::Lock, &task, worker_id));
            }
        }

        let lease = Lease {
            worker_id: worker_id.to_string(),
            expires_at: plus_millis(now, lock_duration_ms),
        };
        if !self
            .store
            .replace_lease(&task.id, task.lease.as_ref(), &lease)
            .await?
        {
            return Err(self.conflict_after_race(LeaseAction::Lock, task_id, worker_id).await);
        }

        debug!(task = %task_id, worker = worker_id, expires_at = %lease.expires_at, "locked");
        Ok(lease)
    }

    /// Move the expiry of a live lease held by `worker_id`.
    pub async fn extend(
        &self,
        task_id: &TaskId,
        worker_id: &str,
        new_duration_ms: i64,
    ) -> Result<Lease, TaskError> {
        require_worker(worker_id)?;
        require_lock_duration(new_duration_ms)?;

        let task = self.load(task_id).await?;
        check_holder(&task, worker_id, LeaseAction::Extend)?;

        let now = self.clock.now();
        if task.lease.as_ref().is_some_and(|l| l.is_expired_at(now)) {
            return Err(TaskError::LockExpired {
                task_id: task.id,
                worker_id: worker_id.to_string(),
            });
        }
        if task.suspended {
            return Err(TaskError::Suspended(task.id));
        }

        let lease = Lease {
            worker_id: worker_id.to_string(),
            expires_at: plus_millis(now, new_duration_ms),
        };
        if !self
            .store
            .replace_lease(&task.id, task.lease.as_ref(), &lease)
            .await?
        {
            return Err(self.conflict_after_race(LeaseAction::Extend, task_id, worker_id).await);
        }

        debug!(task = %task_id, worker = worker_id, expires_at = %lease.expires_at, "lock extended");
        Ok(lease)
    }

    /// Release the lease whoever holds it. Unlocking an unlocked task is a no-op.
    pub async fn unlock(&self, task_id: &TaskId) -> Result<(), TaskError> {
        if task_id.as_str().is_empty() {
            return Err(TaskError::not_found(None));
        }
        if !self.store.release(task_id).await? {
            return Err(TaskError::not_found(Some(task_id.as_str())));
        }
        debug!(task = %task_id, "unlocked");
        self.wake.signal();
        Ok(())
    }

    /// Undo leases taken by a fetch whose result never reached the worker.
    ///
    /// Only leases still held by `worker_id` are released. Failures are logged;
    /// the leases then lapse on their own at expiry.
    pub(crate) async fn release_unreported(&self, task_ids: &[TaskId], worker_id: &str) {
        let mut released = 0usize;
        for task_id in task_ids {
            let held = match self.store.get(task_id).await {
                Ok(Some(task)) => task.worker_id() == Some(worker_id),
                Ok(None) => false,
                Err(e) => {
                    warn!(task = %task_id, worker = worker_id, error = %e, "could not read leased task");
                    continue;
                }
            };
            if !held {
                continue;
            }
            match self.store.release(task_id).await {
                Ok(true) => released += 1,
                Ok(false) => {}
                Err(e) => {
                    warn!(task = %task_id, worker = worker_id, error = %e, "could not release lease");
                }
            }
        }
        if released > 0 {
            debug!(worker = worker_id, released, "released unreported leases");
            self.wake.signal();
        }
    }

    /// Remove a task held by `worker_id` after success or a BPMN error.
    pub(crate) async fn finish(
        &self,
        action: LeaseAction,
        task_id: &TaskId,
        worker_id: &str,
        variables: Variables,
        local_variables: Variables,
    ) -> Result<ExternalTask, TaskError> {
        require_worker(worker_id)?;
        let task = self.load(task_id).await?;
        check_holder(&task, worker_id, action)?;
        if task.suspended {
            return Err(TaskError::Suspended(task.id));
        }

        let completion = Completion {
            task_id: task.id.clone(),
            worker_id: worker_id.to_string(),
            variables,
            local_variables,
            now: self.clock.now(),
        };
        match self.store.complete(&completion).await? {
            Some(removed) => Ok(removed),
            None => Err(self.conflict_after_race(action, task_id, worker_id).await),
        }
    }

    /// Build the conflict error for a conditional write that matched nothing.
    pub(crate) async fn conflict_after_race(
        &self,
        action: LeaseAction,
        task_id: &TaskId,
        worker_id: &str,
    ) -> TaskError {
        match self.store.get(task_id).await {
            Ok(Some(task)) if task.suspended => TaskError::Suspended(task.id),
            Ok(Some(task)) => conflict(action, &task, worker_id),
            Ok(None) => TaskError::not_found(Some(task_id.as_str())),
            Err(e) => e,
        }
    }
}

/// Require that `worker_id` is the task's current holder, expired or not.
pub(crate) fn check_holder(
    task: &ExternalTask,
    worker_id: &str,
    action: LeaseAction,
) -> Result<(), TaskError> {
    match task.worker_id() {
        Some(holder) if holder == worker_id => Ok(()),
        _ => Err(conflict(action, task, worker_id)),
    }
}

fn conflict(action: LeaseAction, task: &ExternalTask, worker_id: &str) -> TaskError {
    TaskError::LockConflict {
        action,
        task_id: task.id.clone(),
        worker_id: worker_id.to_string(),
        holder: task.worker_id().map(str::to_string),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::from_millis;
    use std::collections::BTreeMap;

    fn task_with(lease: Option<Lease>) -> ExternalTask {
        ExternalTask {
            id: TaskId::new("t"),
            topic_name: "topic".into(),
            process_instance_id: "pi".into(),
            process_definition_id: "def:1".into(),
            process_definition_key: "def".into(),
            process_definition_version_tag: None,
            deployment_id: None,
            execution_id: "pi".into(),
            activity_id: "act".into(),
            activity_instance_id: "act:1".into(),
            priority: 0,
            create_time: from_millis(0),
            retries: None,
            error_message: None,
            suspended: false,
            tenant_id: None,
            business_key: None,
            extension_properties: BTreeMap::new(),
            lease,
            retry_after: None,
            seq: 1,
        }
    }

    #[test]
    fn test_holder_check_ignores_expiry() {
        let task = task_with(Some(Lease {
            worker_id: "w1".into(),
            expires_at: from_millis(0),
        }));
        assert!(check_holder(&task, "w1", LeaseAction::Complete).is_ok());
    }

    #[test]
    fn test_holder_check_names_holder() {
        let task = task_with(Some(Lease {
            worker_id: "w1".into(),
            expires_at: from_millis(10_000),
        }));
        let err = check_holder(&task, "w2", LeaseAction::Failure).unwrap_err();
        assert!(err.is_conflict());
        assert!(err.to_string().contains("'w2'"));
        assert!(err.to_string().contains("locked by worker 'w1'"));
    }

    #[test]
    fn test_unlocked_task_has_no_holder() {
        let err = check_holder(&task_with(None), "w", LeaseAction::Extend).unwrap_err();
        assert!(err.is_conflict());
    }
}
