//! Worker loop that long-polls for tasks and dispatches them to handlers.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::Semaphore;
use tracing::{debug, error, warn};

use super::backoff::{RetryDecision, RetryPolicy};
use super::handler::{HandlerError, TopicHandler};
use crate::error::TaskError;
use crate::fetch::FetchRequest;
use crate::retry::FailureReport;
use crate::service::ExternalTaskService;
use crate::task::{LockedExternalTask, Variables};

/// A worker that fetches tasks for its registered topics and reports outcomes.
pub struct TopicWorker {
    service: Arc<ExternalTaskService>,
    worker_id: String,
    handlers: HashMap<String, Arc<dyn TopicHandler>>,
    retry_policy: RetryPolicy,
    max_concurrent: usize,
    poll_timeout: Duration,
    error_backoff: Duration,
    use_priority: bool,
}

impl TopicWorker {
    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Fetch and process tasks indefinitely.
    pub async fn run(&self) -> ! {
        let semaphore = Arc::new(Semaphore::new(self.max_concurrent));

        loop {
            // Wait for a free slot before asking for work.
            match semaphore.clone().acquire_owned().await {
                Ok(permit) => drop(permit),
                Err(_) => continue,
            }
            let available = semaphore.available_permits();

            let tasks = match self.fetch(available, self.poll_timeout).await {
                Ok(tasks) => tasks,
                Err(e) => {
                    error!(worker = %self.worker_id, error = %e, "fetch failed");
                    tokio::time::sleep(self.error_backoff).await;
                    continue;
                }
            };

            for task in tasks {
                let Ok(permit) = semaphore.clone().acquire_owned().await else {
                    continue;
                };
                let Some(handler) = self.handlers.get(task.topic_name()).cloned() else {
                    warn!(task = %task.id(), topic = task.topic_name(), "no handler for topic");
                    continue;
                };
                let service = self.service.clone();
                let worker_id = self.worker_id.clone();
                let policy = self.retry_policy.clone();

                tokio::spawn(async move {
                    Self::process(&service, handler.as_ref(), &policy, &worker_id, task).await;
                    drop(permit);
                });
            }
        }
    }

    /// Fetch once without waiting and process every task fetched before returning.
    ///
    /// Returns the number of tasks handled.
    pub async fn poll_once(&self) -> Result<usize, TaskError> {
        let tasks = self.fetch(self.max_concurrent, Duration::ZERO).await?;
        let count = tasks.len();

        let runs = tasks.into_iter().filter_map(|task| {
            let handler = self.handlers.get(task.topic_name())?.clone();
            Some(async move {
                Self::process(
                    &self.service,
                    handler.as_ref(),
                    &self.retry_policy,
                    &self.worker_id,
                    task,
                )
                .await
            })
        });
        join_all(runs).await;
        Ok(count)
    }

    async fn fetch(
        &self,
        max_tasks: usize,
        timeout: Duration,
    ) -> Result<Vec<LockedExternalTask>, TaskError> {
        let mut builder = FetchRequest::builder(
            self.worker_id.clone(),
            i64::try_from(max_tasks).unwrap_or(i64::MAX),
        )
        .use_priority(self.use_priority);
        for handler in self.handlers.values() {
            builder = builder.topic(handler.topic(), handler.lock_duration_ms());
        }
        let request = builder.build()?;

        self.service.fetch_and_lock_long_poll(request, timeout).await
    }

    async fn process(
        service: &ExternalTaskService,
        handler: &dyn TopicHandler,
        policy: &RetryPolicy,
        worker_id: &str,
        task: LockedExternalTask,
    ) {
        let task_id = task.id().clone();
        let outcome = match handler.handle(&task).await {
            Ok(variables) => {
                debug!(task = %task_id, worker = worker_id, "handler succeeded");
                service
                    .complete_with_variables(&task_id, worker_id, variables, Variables::new())
                    .await
            }
            Err(HandlerError::Bpmn(bpmn)) => service.handle_bpmn_error(&task_id, worker_id, bpmn).await,
            Err(e) => {
                let decision = if e.is_retryable() {
                    policy.next_failure(task.retries())
                } else {
                    RetryDecision::exhausted()
                };
                warn!(
                    task = %task_id,
                    worker = worker_id,
                    retries = decision.retries,
                    error = %e,
                    "handler failed"
                );
                let report = FailureReport::new(worker_id, decision.retries, decision.delay_ms())
                    .message(e.to_string())
                    .details(format!("{:?}", e));
                service.handle_failure(&task_id, report).await
            }
        };

        if let Err(e) = outcome {
            error!(task = %task_id, worker = worker_id, error = %e, "could not report task outcome");
        }
    }
}

/// Builder for constructing a [`TopicWorker`].
pub struct TopicWorkerBuilder {
    service: Arc<ExternalTaskService>,
    worker_id: String,
    handlers: HashMap<String, Arc<dyn TopicHandler>>,
    retry_policy: RetryPolicy,
    max_concurrent: usize,
    poll_timeout: Duration,
    error_backoff: Duration,
    use_priority: bool,
}

impl TopicWorkerBuilder {
    pub fn new(service: Arc<ExternalTaskService>, worker_id: impl Into<String>) -> Self {
        Self {
            service,
            worker_id: worker_id.into(),
            handlers: HashMap::new(),
            retry_policy: RetryPolicy::None,
            max_concurrent: 1,
            poll_timeout: Duration::from_secs(30),
            error_backoff: Duration::from_secs(1),
            use_priority: true,
        }
    }

    /// Register a handler for its topic. A later handler for the same topic replaces the earlier one.
    pub fn handler(mut self, handler: impl TopicHandler + 'static) -> Self {
        self.handlers
            .insert(handler.topic().to_string(), Arc::new(handler));
        self
    }

    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    pub fn max_concurrent(mut self, n: usize) -> Self {
        self.max_concurrent = n.max(1);
        self
    }

    /// How long one fetch waits for tasks to appear.
    pub fn poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = timeout;
        self
    }

    /// Pause after a failed fetch.
    pub fn error_backoff(mut self, backoff: Duration) -> Self {
        self.error_backoff = backoff;
        self
    }

    pub fn use_priority(mut self, use_priority: bool) -> Self {
        self.use_priority = use_priority;
        self
    }

    pub fn build(self) -> TopicWorker {
        TopicWorker {
            service: self.service,
            worker_id: self.worker_id,
            handlers: self.handlers,
            retry_policy: self.retry_policy,
            max_concurrent: self.max_concurrent,
            poll_timeout: self.poll_timeout,
            error_backoff: self.error_backoff,
            use_priority: self.use_priority,
        }
    }
}
