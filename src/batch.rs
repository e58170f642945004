//! Bulk and batched retry updates.
//!
//! A selector of task ids, process instances and queries resolves to a set of
//! tasks. [`UpdateRetries::set`] updates them all in one transaction.
//! [`UpdateRetries::set_async`] plans a [`Batch`] whose jobs each update one
//! chunk of ids and can fail independently.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use tracing::{info, warn};

use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::error::TaskError;
use crate::query::ExternalTaskQuery;
use crate::retry::RetryManager;
use crate::store::TaskStore;
use crate::task::TaskId;

/// Batch type recorded on retry batches.
pub const SET_EXTERNAL_TASK_RETRIES: &str = "set-external-task-retries";

/// Host-side query producing process instance ids, such as a runtime or
/// historic process instance query.
#[async_trait]
pub trait ProcessInstanceSource: Send + Sync {
    async fn process_instance_ids(&self) -> anyhow::Result<Vec<String>>;
}

/// A task id selected for a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchTarget {
    pub task_id: TaskId,
    /// Listed by the caller rather than derived from a query. A missing
    /// explicit id fails its job; a missing derived id is skipped.
    pub explicit: bool,
}

/// One chunk of work within a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchJob {
    pub batch_id: String,
    pub index: usize,
    pub deployment_id: Option<String>,
    pub targets: Vec<BatchTarget>,
}

/// An asynchronous retry update, split into jobs.
///
/// Jobs are handed out by [`Batch::seed`], at most `batch_jobs_per_seed` at a time.
#[derive(Debug)]
pub struct Batch {
    pub id: String,
    pub batch_type: &'static str,
    pub retries: i32,
    pub total_jobs: usize,
    pub invocations_per_batch_job: usize,
    pub batch_jobs_per_seed: usize,
    pub created_at: DateTime<Utc>,
    unseeded: VecDeque<BatchJob>,
}

impl Batch {
    /// Materialize the next step of jobs. Empty once fully seeded.
    pub fn seed(&mut self) -> Vec<BatchJob> {
        let take = self.batch_jobs_per_seed.max(1).min(self.unseeded.len());
        self.unseeded.drain(..take).collect()
    }

    pub fn is_fully_seeded(&self) -> bool {
        self.unseeded.is_empty()
    }

    pub fn remaining_jobs(&self) -> usize {
        self.unseeded.len()
    }
}

/// Group targets by deployment, in order of first appearance, then chunk each group.
fn plan_jobs(
    batch_id: &str,
    targets: Vec<BatchTarget>,
    deployments: &HashMap<TaskId, Option<String>>,
    chunk_size: usize,
) -> VecDeque<BatchJob> {
    let mut groups: Vec<(Option<String>, Vec<BatchTarget>)> = Vec::new();
    for target in targets {
        let deployment = deployments.get(&target.task_id).cloned().flatten();
        match groups.iter_mut().find(|(d, _)| *d == deployment) {
            Some((_, members)) => members.push(target),
            None => groups.push((deployment, vec![target])),
        }
    }

    let mut jobs = VecDeque::new();
    for (deployment_id, members) in groups {
        for chunk in members.chunks(chunk_size.max(1)) {
            jobs.push_back(BatchJob {
                batch_id: batch_id.to_string(),
                index: jobs.len(),
                deployment_id: deployment_id.clone(),
                targets: chunk.to_vec(),
            });
        }
    }
    jobs
}

/// Selector builder for bulk retry updates.
pub struct UpdateRetries {
    store: Arc<dyn TaskStore>,
    retries: Arc<RetryManager>,
    clock: Arc<dyn Clock>,
    invocations_per_batch_job: usize,
    batch_jobs_per_seed: usize,
    task_ids: Vec<TaskId>,
    process_instance_ids: Vec<String>,
    queries: Vec<ExternalTaskQuery>,
    sources: Vec<Arc<dyn ProcessInstanceSource>>,
}

impl UpdateRetries {
    pub(crate) fn new(
        store: Arc<dyn TaskStore>,
        retries: Arc<RetryManager>,
        clock: Arc<dyn Clock>,
        config: &EngineConfig,
    ) -> Self {
        Self {
            store,
            retries,
            clock,
            invocations_per_batch_job: config.invocations_per_batch_job.max(1),
            batch_jobs_per_seed: config.batch_jobs_per_seed.max(1),
            task_ids: Vec::new(),
            process_instance_ids: Vec::new(),
            queries: Vec::new(),
            sources: Vec::new(),
        }
    }

    pub fn external_task_ids<I, T>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<TaskId>,
    {
        self.task_ids.extend(ids.into_iter().map(Into::into));
        self
    }

    pub fn process_instance_ids<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.process_instance_ids.extend(ids.into_iter().map(Into::into));
        self
    }

    pub fn external_task_query(mut self, query: ExternalTaskQuery) -> Self {
        self.queries.push(query);
        self
    }

    pub fn process_instance_query(mut self, source: Arc<dyn ProcessInstanceSource>) -> Self {
        self.sources.push(source);
        self
    }

    pub fn historic_process_instance_query(mut self, source: Arc<dyn ProcessInstanceSource>) -> Self {
        self.sources.push(source);
        self
    }

    /// Union of all selectors, explicit ids first, without duplicates.
    async fn resolve(&self) -> Result<Vec<BatchTarget>, TaskError> {
        if self.task_ids.iter().any(|id| id.as_str().is_empty()) {
            return Err(TaskError::BadRequest(
                "External task id cannot be null".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        let mut targets = Vec::new();
        for id in &self.task_ids {
            if seen.insert(id.clone()) {
                targets.push(BatchTarget {
                    task_id: id.clone(),
                    explicit: true,
                });
            }
        }

        let mut process_instance_ids = self.process_instance_ids.clone();
        for source in &self.sources {
            let ids = source.process_instance_ids().await.map_err(TaskError::Hook)?;
            process_instance_ids.extend(ids);
        }

        let now = self.clock.now();
        let mut queries = self.queries.clone();
        if !process_instance_ids.is_empty() {
            queries.push(ExternalTaskQuery::new().process_instance_id_in(process_instance_ids));
        }
        for query in &queries {
            for task in self.store.find(query, now).await? {
                if seen.insert(task.id.clone()) {
                    targets.push(BatchTarget {
                        task_id: task.id,
                        explicit: false,
                    });
                }
            }
        }

        if targets.is_empty() {
            return Err(TaskError::validation("externalTaskIds is empty"));
        }
        Ok(targets)
    }

    /// Apply `retries` to every selected task, or to none if any is missing.
    pub async fn set(self, retries: i32) -> Result<(), TaskError> {
        require_batch_retries(retries)?;
        let ids: Vec<TaskId> = self
            .resolve()
            .await?
            .into_iter()
            .map(|t| t.task_id)
            .collect();
        self.retries.apply(&ids, retries, true).await.map(|_| ())
    }

    /// Plan an asynchronous batch applying `retries` chunk by chunk.
    pub async fn set_async(self, retries: i32) -> Result<Batch, TaskError> {
        require_batch_retries(retries)?;
        let targets = self.resolve().await?;

        let ids: Vec<TaskId> = targets.iter().map(|t| t.task_id.clone()).collect();
        let deployments: HashMap<TaskId, Option<String>> =
            self.store.deployments(&ids).await?.into_iter().collect();

        let id = uuid::Uuid::new_v4().to_string();
        let unseeded = plan_jobs(&id, targets, &deployments, self.invocations_per_batch_job);
        let batch = Batch {
            total_jobs: unseeded.len(),
            id,
            batch_type: SET_EXTERNAL_TASK_RETRIES,
            retries,
            invocations_per_batch_job: self.invocations_per_batch_job,
            batch_jobs_per_seed: self.batch_jobs_per_seed,
            created_at: self.clock.now(),
            unseeded,
        };

        info!(
            batch = %batch.id,
            tasks = ids.len(),
            jobs = batch.total_jobs,
            retries,
            "retry batch created"
        );
        Ok(batch)
    }
}

fn require_batch_retries(retries: i32) -> Result<(), TaskError> {
    if retries < 0 {
        return Err(TaskError::validation("The number of retries cannot be negative"));
    }
    Ok(())
}

/// A job that did not apply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedBatchJob {
    pub index: usize,
    pub deployment_id: Option<String>,
    pub error: String,
}

/// Outcome of running a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchStatus {
    pub batch_id: String,
    pub total_jobs: usize,
    pub completed_jobs: usize,
    pub failed_jobs: Vec<FailedBatchJob>,
    pub updated_tasks: usize,
}

impl BatchStatus {
    pub fn is_finished(&self) -> bool {
        self.completed_jobs + self.failed_jobs.len() == self.total_jobs
    }

    pub fn succeeded(&self) -> bool {
        self.is_finished() && self.failed_jobs.is_empty()
    }
}

/// Executes batch jobs, several at a time.
pub struct BatchRunner {
    store: Arc<dyn TaskStore>,
    retries: Arc<RetryManager>,
    max_concurrent: usize,
}

impl BatchRunner {
    pub(crate) fn new(store: Arc<dyn TaskStore>, retries: Arc<RetryManager>) -> Self {
        Self {
            store,
            retries,
            max_concurrent: 4,
        }
    }

    /// Set the maximum number of jobs in flight.
    pub fn max_concurrent(mut self, n: usize) -> Self {
        self.max_concurrent = n.max(1);
        self
    }

    /// Apply `retries` to one job's tasks. Returns the number of tasks updated.
    pub async fn execute_job(&self, job: &BatchJob, retries: i32) -> Result<usize, TaskError> {
        let explicit: Vec<TaskId> = job
            .targets
            .iter()
            .filter(|t| t.explicit)
            .map(|t| t.task_id.clone())
            .collect();
        if !explicit.is_empty() {
            let existing: HashSet<TaskId> = self
                .store
                .deployments(&explicit)
                .await?
                .into_iter()
                .map(|(id, _)| id)
                .collect();
            if let Some(missing) = explicit.iter().find(|id| !existing.contains(*id)) {
                return Err(TaskError::BadRequest(format!(
                    "Cannot find external task with id {}",
                    missing
                )));
            }
        }

        let ids: Vec<TaskId> = job.targets.iter().map(|t| t.task_id.clone()).collect();
        Ok(self.retries.apply(&ids, retries, false).await?.len())
    }

    /// Seed and execute every job of `batch`. A failing job does not stop the others.
    pub async fn run(&self, batch: &mut Batch) -> BatchStatus {
        let mut status = BatchStatus {
            batch_id: batch.id.clone(),
            total_jobs: batch.total_jobs,
            completed_jobs: 0,
            failed_jobs: Vec::new(),
            updated_tasks: 0,
        };
        let retries = batch.retries;

        loop {
            let jobs = batch.seed();
            if jobs.is_empty() {
                break;
            }

            let results: Vec<(&BatchJob, Result<usize, TaskError>)> = futures::stream::iter(&jobs)
                .map(|job| async move { (job, self.execute_job(job, retries).await) })
                .buffer_unordered(self.max_concurrent)
                .collect()
                .await;

            for (job, result) in results {
                match result {
                    Ok(updated) => {
                        status.completed_jobs += 1;
                        status.updated_tasks += updated;
                    }
                    Err(e) => {
                        warn!(batch = %job.batch_id, job = job.index, error = %e, "batch job failed");
                        status.failed_jobs.push(FailedBatchJob {
                            index: job.index,
                            deployment_id: job.deployment_id.clone(),
                            error: e.to_string(),
                        });
                    }
                }
            }
        }

        status.failed_jobs.sort_by_key(|f| f.index);
        info!(
            batch = %status.batch_id,
            completed = status.completed_jobs,
            failed = status.failed_jobs.len(),
            "retry batch finished"
        );
        status
    }
}
