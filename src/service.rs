//! Public entry point wiring the store, clock, wake condition and managers.

use std::sync::Arc;
use std::time::Duration;

use chrono::SubsecRound;
use tokio::sync::OnceCell;
use tracing::{debug, info};

use crate::batch::{Batch, BatchRunner, UpdateRetries};
use crate::clock::{Clock, SystemClock};
use crate::config::EngineConfig;
use crate::dispatch::Dispatcher;
use crate::error::{LeaseAction, TaskError};
use crate::fetch::FetchRequest;
use crate::history::HistoricLogEntry;
use crate::hooks::{BpmnError, NoopProcessHooks, ProcessHooks};
use crate::incident::Incident;
use crate::lease::{require_worker, LeaseManager};
use crate::long_poll::LongPollHandler;
use crate::query::ExternalTaskQuery;
use crate::retry::{FailureReport, RetryManager};
use crate::store::{IncidentFilter, TaskStore};
use crate::task::{ExternalTask, Lease, LockedExternalTask, NewExternalTask, Priority, TaskId, Variables};
use crate::wake::WakeCondition;

/// External task operations for workers and administrators.
///
/// Cheap to share behind an `Arc`; all state lives in the store.
pub struct ExternalTaskService {
    store: Arc<dyn TaskStore>,
    clock: Arc<dyn Clock>,
    wake: Arc<WakeCondition>,
    hooks: Arc<dyn ProcessHooks>,
    config: EngineConfig,
    leases: Arc<LeaseManager>,
    dispatcher: Arc<Dispatcher>,
    retries: Arc<RetryManager>,
    long_poll: OnceCell<LongPollHandler>,
}

impl ExternalTaskService {
    pub fn builder<S: TaskStore + 'static>(store: S) -> ExternalTaskServiceBuilder {
        ExternalTaskServiceBuilder::new(store)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn wake_condition(&self) -> &Arc<WakeCondition> {
        &self.wake
    }

    /// Create a task for an execution that reached an external activity.
    pub async fn create_task(&self, new_task: NewExternalTask) -> Result<ExternalTask, TaskError> {
        if new_task.topic_name.is_empty() {
            return Err(TaskError::validation("topicName is null"));
        }
        let priority = self.resolve_priority(&new_task).await?;
        let now = self.clock.now();

        let activity_instance_id = new_task.activity_instance_id.unwrap_or_else(|| {
            format!("{}:{}", new_task.activity_id, uuid::Uuid::new_v4())
        });
        let task = ExternalTask {
            id: TaskId::generate(),
            topic_name: new_task.topic_name,
            process_instance_id: new_task.process_instance_id,
            process_definition_id: new_task.process_definition_id,
            process_definition_key: new_task.process_definition_key,
            process_definition_version_tag: new_task.process_definition_version_tag,
            deployment_id: new_task.deployment_id,
            execution_id: new_task.execution_id,
            activity_id: new_task.activity_id,
            activity_instance_id,
            priority,
            create_time: now.trunc_subsecs(0),
            retries: None,
            error_message: None,
            suspended: false,
            tenant_id: new_task.tenant_id,
            business_key: new_task.business_key,
            extension_properties: new_task.extension_properties,
            lease: None,
            retry_after: None,
            seq: 0,
        };

        let task = self.store.insert(task).await?;
        debug!(task = %task.id, topic = %task.topic_name, priority, "external task created");
        self.wake.signal();
        Ok(task)
    }

    /// Activity priority wins over the process priority, which wins over the configured default.
    async fn resolve_priority(&self, new_task: &NewExternalTask) -> Result<i64, TaskError> {
        let declared = new_task
            .activity_priority
            .as_ref()
            .or(new_task.process_priority.as_ref());
        match declared {
            None => Ok(self.config.default_priority),
            Some(Priority::Value(value)) => Ok(*value),
            Some(Priority::Expression(name)) => {
                let variables = self.store.variables(&new_task.process_instance_id).await?;
                let value = variables.get(name).ok_or_else(|| {
                    TaskError::validation(format!("Unknown property used in expression: ${{{}}}", name))
                })?;
                value
                    .as_i64()
                    .ok_or_else(|| TaskError::validation("Priority value is not an Integer"))
            }
        }
    }

    pub async fn fetch_and_lock(
        &self,
        request: &FetchRequest,
    ) -> Result<Vec<LockedExternalTask>, TaskError> {
        self.dispatcher.fetch_and_lock(request).await
    }

    /// Fetch, waiting up to `timeout` for tasks to become available.
    pub async fn fetch_and_lock_long_poll(
        &self,
        request: FetchRequest,
        timeout: Duration,
    ) -> Result<Vec<LockedExternalTask>, TaskError> {
        if timeout.is_zero() {
            return self.dispatcher.fetch_and_lock(&request).await;
        }
        let handler = self
            .long_poll
            .get_or_try_init(|| async {
                LongPollHandler::spawn(
                    self.dispatcher.clone(),
                    &self.wake,
                    Duration::from_millis(self.config.long_poll_max_timeout_ms),
                )
            })
            .await?;
        handler.fetch_and_lock(request, timeout).await
    }

    pub async fn lock(
        &self,
        task_id: &TaskId,
        worker_id: &str,
        lock_duration_ms: i64,
    ) -> Result<Lease, TaskError> {
        self.leases.lock(task_id, worker_id, lock_duration_ms).await
    }

    pub async fn unlock(&self, task_id: &TaskId) -> Result<(), TaskError> {
        self.leases.unlock(task_id).await
    }

    pub async fn extend_lock(
        &self,
        task_id: &TaskId,
        worker_id: &str,
        new_duration_ms: i64,
    ) -> Result<Lease, TaskError> {
        self.leases.extend(task_id, worker_id, new_duration_ms).await
    }

    pub async fn complete(&self, task_id: &TaskId, worker_id: &str) -> Result<(), TaskError> {
        self.complete_with_variables(task_id, worker_id, Variables::new(), Variables::new())
            .await
    }

    /// Complete a task held by `worker_id`, writing `variables` to the process
    /// instance and `local_variables` to the task's execution.
    pub async fn complete_with_variables(
        &self,
        task_id: &TaskId,
        worker_id: &str,
        variables: Variables,
        local_variables: Variables,
    ) -> Result<(), TaskError> {
        let removed = self
            .leases
            .finish(LeaseAction::Complete, task_id, worker_id, variables, local_variables)
            .await?;
        info!(task = %task_id, worker = worker_id, topic = %removed.topic_name, "external task completed");
        self.hooks.on_complete(&removed).await.map_err(TaskError::Hook)
    }

    pub async fn handle_failure(&self, task_id: &TaskId, report: FailureReport) -> Result<(), TaskError> {
        self.retries.report_failure(task_id, report).await.map(|_| ())
    }

    pub async fn handle_bpmn_error(
        &self,
        task_id: &TaskId,
        worker_id: &str,
        error: BpmnError,
    ) -> Result<(), TaskError> {
        require_worker(worker_id)?;
        if error.error_code.is_empty() {
            return Err(TaskError::validation("errorCode is null"));
        }
        let removed = self
            .leases
            .finish(
                LeaseAction::BpmnError,
                task_id,
                worker_id,
                error.variables.clone(),
                Variables::new(),
            )
            .await?;
        info!(
            task = %task_id,
            worker = worker_id,
            error_code = %error.error_code,
            "bpmn error reported"
        );
        self.hooks
            .on_bpmn_error(&removed, &error)
            .await
            .map_err(TaskError::Hook)
    }

    pub async fn set_retries(&self, task_id: &TaskId, retries: i32) -> Result<(), TaskError> {
        self.retries.set_retries(task_id, retries).await
    }

    pub async fn set_retries_many(&self, task_ids: &[TaskId], retries: i32) -> Result<(), TaskError> {
        self.retries.set_retries_many(task_ids, retries).await
    }

    /// Plan an asynchronous retry update for the listed tasks.
    pub async fn set_retries_async(&self, task_ids: &[TaskId], retries: i32) -> Result<Batch, TaskError> {
        self.update_retries()
            .external_task_ids(task_ids.iter().cloned())
            .set_async(retries)
            .await
    }

    /// Start a bulk retry update over any combination of selectors.
    pub fn update_retries(&self) -> UpdateRetries {
        UpdateRetries::new(
            self.store.clone(),
            self.retries.clone(),
            self.clock.clone(),
            &self.config,
        )
    }

    pub fn batch_runner(&self) -> BatchRunner {
        BatchRunner::new(self.store.clone(), self.retries.clone())
    }

    pub async fn set_priority(&self, task_id: &TaskId, priority: i64) -> Result<(), TaskError> {
        if task_id.as_str().is_empty() {
            return Err(TaskError::not_found(None));
        }
        if !self.store.set_priority(task_id, priority).await? {
            return Err(TaskError::not_found(Some(task_id.as_str())));
        }
        debug!(task = %task_id, priority, "priority updated");
        Ok(())
    }

    /// Distinct topic names. The lock filters only apply when exactly one is set.
    pub async fn get_topic_names(
        &self,
        with_locked_tasks: bool,
        with_unlocked_tasks: bool,
        with_retries_left: bool,
    ) -> Result<Vec<String>, TaskError> {
        self.store
            .topic_names(
                with_locked_tasks,
                with_unlocked_tasks,
                with_retries_left,
                self.clock.now(),
            )
            .await
    }

    pub fn create_query(&self) -> ExternalTaskQuery {
        ExternalTaskQuery::new()
    }

    pub async fn list(&self, query: &ExternalTaskQuery) -> Result<Vec<ExternalTask>, TaskError> {
        self.store.find(query, self.clock.now()).await
    }

    pub async fn count(&self, query: &ExternalTaskQuery) -> Result<usize, TaskError> {
        self.store.count(query, self.clock.now()).await
    }

    pub async fn get_task(&self, task_id: &TaskId) -> Result<Option<ExternalTask>, TaskError> {
        self.store.get(task_id).await
    }

    pub async fn get_error_details(&self, task_id: &TaskId) -> Result<Option<String>, TaskError> {
        self.retries.error_details(task_id).await
    }

    pub async fn suspend_process_instance(&self, process_instance_id: &str) -> Result<(), TaskError> {
        let count = self.store.set_suspended(process_instance_id, true).await?;
        info!(process_instance = process_instance_id, tasks = count, "process instance suspended");
        Ok(())
    }

    pub async fn activate_process_instance(&self, process_instance_id: &str) -> Result<(), TaskError> {
        let count = self.store.set_suspended(process_instance_id, false).await?;
        info!(process_instance = process_instance_id, tasks = count, "process instance activated");
        if count > 0 {
            self.wake.signal();
        }
        Ok(())
    }

    /// Remove all tasks, variables and open incidents of a process instance.
    pub async fn delete_process_instance(&self, process_instance_id: &str) -> Result<(), TaskError> {
        let removed = self
            .store
            .delete_process_instance(process_instance_id, self.clock.now())
            .await?;
        info!(process_instance = process_instance_id, tasks = removed.len(), "process instance deleted");
        Ok(())
    }

    /// Write variables to an execution or process instance scope.
    pub async fn set_variables(&self, scope_id: &str, variables: &Variables) -> Result<(), TaskError> {
        self.store.set_variables(scope_id, variables).await
    }

    pub async fn variables(&self, scope_id: &str) -> Result<Variables, TaskError> {
        self.store.variables(scope_id).await
    }

    pub async fn incidents(&self, filter: &IncidentFilter) -> Result<Vec<Incident>, TaskError> {
        self.store.incidents(filter).await
    }

    pub async fn history(&self, task_id: &TaskId) -> Result<Vec<HistoricLogEntry>, TaskError> {
        self.store.history(task_id).await
    }
}

/// Builder for an [`ExternalTaskService`].
pub struct ExternalTaskServiceBuilder {
    store: Arc<dyn TaskStore>,
    clock: Arc<dyn Clock>,
    wake: Option<Arc<WakeCondition>>,
    hooks: Arc<dyn ProcessHooks>,
    config: EngineConfig,
}

impl ExternalTaskServiceBuilder {
    /// Create a new builder with the given store.
    pub fn new<S: TaskStore + 'static>(store: S) -> Self {
        Self {
            store: Arc::new(store),
            clock: Arc::new(SystemClock),
            wake: None,
            hooks: Arc::new(NoopProcessHooks),
            config: EngineConfig::default(),
        }
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Share a wake condition with another component.
    pub fn wake_condition(mut self, wake: Arc<WakeCondition>) -> Self {
        self.wake = Some(wake);
        self
    }

    pub fn hooks(mut self, hooks: Arc<dyn ProcessHooks>) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> ExternalTaskService {
        let wake = self.wake.unwrap_or_else(WakeCondition::new);
        let leases = Arc::new(LeaseManager::new(
            self.store.clone(),
            self.clock.clone(),
            wake.clone(),
        ));
        let dispatcher = Arc::new(Dispatcher::new(
            self.store.clone(),
            self.clock.clone(),
            wake.clone(),
            leases.clone(),
        ));
        let retries = Arc::new(RetryManager::new(
            self.store.clone(),
            self.clock.clone(),
            wake.clone(),
            leases.clone(),
            &self.config,
        ));

        ExternalTaskService {
            store: self.store,
            clock: self.clock,
            wake,
            hooks: self.hooks,
            config: self.config,
            leases,
            dispatcher,
            retries,
            long_poll: OnceCell::new(),
        }
    }
}
