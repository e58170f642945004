//! Fetch-and-lock across topic subscriptions.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::error::TaskError;
use crate::fetch::{FetchRequest, TopicSubscription, VariableSelection};
use crate::lease::LeaseManager;
use crate::store::TaskStore;
use crate::task::{ExternalTask, Lease, LockedExternalTask, TaskId, Variables};
use crate::wake::WakeCondition;

/// Selects eligible tasks for a fetch request and leases them.
pub struct Dispatcher {
    store: Arc<dyn TaskStore>,
    clock: Arc<dyn Clock>,
    wake: Arc<WakeCondition>,
    leases: Arc<LeaseManager>,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn TaskStore>,
        clock: Arc<dyn Clock>,
        wake: Arc<WakeCondition>,
        leases: Arc<LeaseManager>,
    ) -> Self {
        Self {
            store,
            clock,
            wake,
            leases,
        }
    }

    /// Lease up to `request.max_tasks` tasks for the requesting worker.
    ///
    /// Returns immediately. A task claimed by a concurrent fetch between
    /// selection and leasing is skipped without replacement, so fewer tasks
    /// than requested may come back.
    pub async fn fetch_and_lock(
        &self,
        request: &FetchRequest,
    ) -> Result<Vec<LockedExternalTask>, TaskError> {
        request.validate()?;
        if request.topics.is_empty() || request.max_tasks == 0 {
            return Ok(Vec::new());
        }

        let now = self.clock.now();
        let max_tasks = usize::try_from(request.max_tasks).unwrap_or(usize::MAX);
        let ordering = request.ordering();

        // Each subscription sees only tasks not already picked by an earlier one.
        let mut seen = HashSet::new();
        let mut candidates: Vec<(usize, ExternalTask)> = Vec::new();
        for (index, subscription) in request.topics.iter().enumerate() {
            let limit = max_tasks.saturating_add(seen.len());
            let found = self
                .store
                .select_candidates(subscription, ordering, limit, now)
                .await?;
            for task in found {
                if seen.insert(task.id.clone()) {
                    candidates.push((index, task));
                }
            }
        }

        candidates.sort_by(|(_, a), (_, b)| ordering.compare(a, b));
        let expired_left_over = candidates
            .iter()
            .skip(max_tasks)
            .any(|(_, task)| task.lease.is_some());
        candidates.truncate(max_tasks);

        // Nothing leased here may outlive an error: the worker never sees it.
        let mut leased: Vec<TaskId> = Vec::with_capacity(candidates.len());
        let mut locked = Vec::with_capacity(candidates.len());
        for (index, mut task) in candidates {
            let subscription = &request.topics[index];
            let acquired = self
                .leases
                .acquire(&task, &request.worker_id, subscription.lock_duration_ms, now)
                .await;
            let lease = match acquired {
                Ok(Some(lease)) => lease,
                Ok(None) => continue,
                Err(e) => return Err(self.abandon(&leased, &request.worker_id, e).await),
            };
            leased.push(task.id.clone());
            task.lease = Some(lease.clone());
            task.retry_after = None;
            match self.assemble(task, subscription, lease).await {
                Ok(assembled) => locked.push(assembled),
                Err(e) => return Err(self.abandon(&leased, &request.worker_id, e).await),
            }
        }

        if expired_left_over {
            debug!("expired leases remain unclaimed; waking long-poll");
            self.wake.signal();
        }

        if !locked.is_empty() {
            info!(
                worker = %request.worker_id,
                count = locked.len(),
                requested = request.max_tasks,
                "fetched and locked tasks"
            );
        }
        Ok(locked)
    }

    /// Hand leases back for tasks that will never reach `worker_id`.
    pub(crate) async fn release(&self, tasks: &[LockedExternalTask], worker_id: &str) {
        let ids: Vec<TaskId> = tasks.iter().map(|t| t.task.id.clone()).collect();
        self.leases.release_unreported(&ids, worker_id).await;
    }

    async fn abandon(&self, leased: &[TaskId], worker_id: &str, error: TaskError) -> TaskError {
        warn!(worker = worker_id, leased = leased.len(), error = %error, "fetch failed; releasing leases");
        self.leases.release_unreported(leased, worker_id).await;
        error
    }

    async fn assemble(
        &self,
        mut task: ExternalTask,
        subscription: &TopicSubscription,
        lease: Lease,
    ) -> Result<LockedExternalTask, TaskError> {
        let variables = self.resolve_variables(&task, subscription).await?;
        let error_details = if task.error_message.is_some() {
            self.store.error_details(&task.id).await?
        } else {
            None
        };
        if !subscription.include_extension_properties {
            task.extension_properties.clear();
        }

        Ok(LockedExternalTask {
            task,
            worker_id: lease.worker_id,
            lock_expiration_time: lease.expires_at,
            variables,
            error_details,
        })
    }

    /// Execution-local variables shadow process-instance variables unless the
    /// subscription asked for local variables only.
    async fn resolve_variables(
        &self,
        task: &ExternalTask,
        subscription: &TopicSubscription,
    ) -> Result<Variables, TaskError> {
        if matches!(&subscription.variables, VariableSelection::Named(names) if names.is_empty()) {
            return Ok(Variables::new());
        }

        let mut variables = Variables::new();
        if !subscription.local_variables && task.execution_id != task.process_instance_id {
            variables = self.store.variables(&task.process_instance_id).await?;
        }
        variables.extend(self.store.variables(&task.execution_id).await?);

        Ok(variables
            .into_iter()
            .filter(|(name, _)| subscription.variables.includes(name))
            .collect())
    }
}
