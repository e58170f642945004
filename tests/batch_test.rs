//! Tests for bulk and batched retry updates.

use std::sync::Arc;

use async_trait::async_trait;
use sqlx::sqlite::SqlitePoolOptions;
use taskgate::{
    EngineConfig, ErrorKind, ExternalTaskService, FakeClock, IncidentFilter, NewExternalTask,
    ProcessInstanceSource, SqliteTaskStore, TaskId,
};

async fn setup_with(config: EngineConfig) -> ExternalTaskService {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect(":memory:")
        .await
        .unwrap();
    let store = SqliteTaskStore::with_config(pool, &config);
    store.run_migrations().await.unwrap();
    ExternalTaskService::builder(store)
        .clock(Arc::new(FakeClock::at_millis(1_700_000_000_000)))
        .config(config)
        .build()
}

async fn setup() -> ExternalTaskService {
    setup_with(EngineConfig::default()).await
}

async fn create(service: &ExternalTaskService, pi: &str, deployment: &str) -> TaskId {
    service
        .create_task(
            NewExternalTask::new("topic", "process", pi, "externalTask").deployment(deployment),
        )
        .await
        .unwrap()
        .id
}

async fn retries_of(service: &ExternalTaskService, id: &TaskId) -> Option<i32> {
    service.get_task(id).await.unwrap().unwrap().retries
}

/// Host process instance query returning a fixed list.
struct FixedInstances(Vec<String>);

#[async_trait]
impl ProcessInstanceSource for FixedInstances {
    async fn process_instance_ids(&self) -> anyhow::Result<Vec<String>> {
        Ok(self.0.clone())
    }
}

#[tokio::test]
async fn test_sync_update_by_ids() {
    let service = setup().await;
    let a = create(&service, "pi-1", "d1").await;
    let b = create(&service, "pi-2", "d1").await;

    service
        .update_retries()
        .external_task_ids([a.clone(), b.clone()])
        .set(5)
        .await
        .unwrap();

    assert_eq!(retries_of(&service, &a).await, Some(5));
    assert_eq!(retries_of(&service, &b).await, Some(5));
}

#[tokio::test]
async fn test_sync_update_with_missing_id_changes_nothing() {
    let service = setup().await;
    let a = create(&service, "pi-1", "d1").await;

    let err = service
        .update_retries()
        .external_task_ids([a.clone(), TaskId::new("gone")])
        .set(0)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::BadRequest);
    assert_eq!(retries_of(&service, &a).await, None);
    assert!(service.incidents(&IncidentFilter::open()).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_selectors_are_unioned() {
    let service = setup().await;
    let a = create(&service, "pi-1", "d1").await;
    let b = create(&service, "pi-2", "d1").await;
    let c = create(&service, "pi-3", "d1").await;
    let untouched = create(&service, "pi-4", "d1").await;

    let query = service.create_query().process_instance_id("pi-2");
    service
        .update_retries()
        .external_task_ids([a.clone()])
        .process_instance_ids(["pi-1"])
        .external_task_query(query)
        .process_instance_query(Arc::new(FixedInstances(vec!["pi-3".to_string()])))
        .set(2)
        .await
        .unwrap();

    assert_eq!(retries_of(&service, &a).await, Some(2));
    assert_eq!(retries_of(&service, &b).await, Some(2));
    assert_eq!(retries_of(&service, &c).await, Some(2));
    assert_eq!(retries_of(&service, &untouched).await, None);
}

#[tokio::test]
async fn test_empty_selection_and_negative_retries() {
    let service = setup().await;
    create(&service, "pi-1", "d1").await;

    let err = service
        .update_retries()
        .process_instance_ids(["unknown"])
        .set(1)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
    assert_eq!(err.to_string(), "externalTaskIds is empty");

    let err = service.update_retries().set(1).await.unwrap_err();
    assert_eq!(err.to_string(), "externalTaskIds is empty");

    let err = service
        .update_retries()
        .process_instance_ids(["pi-1"])
        .set(-1)
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "The number of retries cannot be negative");

    let err = service
        .update_retries()
        .external_task_ids([TaskId::new("")])
        .set(1)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::BadRequest);
}

#[tokio::test]
async fn test_async_batch_plans_chunks_by_deployment() {
    let service = setup_with(EngineConfig {
        invocations_per_batch_job: 2,
        batch_jobs_per_seed: 1,
        ..EngineConfig::default()
    })
    .await;
    let mut ids = Vec::new();
    for i in 0..3 {
        ids.push(create(&service, &format!("a-{}", i), "d1").await);
    }
    ids.push(create(&service, "b-0", "d2").await);

    let mut batch = service.set_retries_async(&ids, 3).await.unwrap();
    assert_eq!(batch.batch_type, "set-external-task-retries");
    assert_eq!(batch.total_jobs, 3);
    assert_eq!(batch.remaining_jobs(), 3);

    let first = batch.seed();
    assert_eq!(first.len(), 1);
    assert_eq!(first[0].deployment_id.as_deref(), Some("d1"));
    assert_eq!(first[0].targets.len(), 2);

    let runner = service.batch_runner();
    for job in &first {
        runner.execute_job(job, batch.retries).await.unwrap();
    }
    let status = runner.run(&mut batch).await;
    assert_eq!(status.completed_jobs, 2);
    assert!(batch.is_fully_seeded());

    for id in &ids {
        assert_eq!(retries_of(&service, id).await, Some(3));
    }
}

#[tokio::test]
async fn test_async_batch_isolates_failing_chunks() {
    let service = setup_with(EngineConfig {
        invocations_per_batch_job: 1,
        ..EngineConfig::default()
    })
    .await;
    let a = create(&service, "pi-1", "d1").await;
    let b = create(&service, "pi-2", "d1").await;
    let c = create(&service, "pi-3", "d1").await;

    let mut batch = service
        .set_retries_async(&[a.clone(), b.clone(), c.clone()], 0)
        .await
        .unwrap();
    // The task disappears between planning and execution.
    service.delete_process_instance("pi-2").await.unwrap();

    let status = service.batch_runner().max_concurrent(2).run(&mut batch).await;
    assert_eq!(status.total_jobs, 3);
    assert_eq!(status.completed_jobs, 2);
    assert_eq!(status.failed_jobs.len(), 1);
    assert!(status.failed_jobs[0].error.contains(b.as_str()));
    assert!(status.is_finished());
    assert!(!status.succeeded());
    assert_eq!(status.updated_tasks, 2);

    assert_eq!(retries_of(&service, &a).await, Some(0));
    assert_eq!(retries_of(&service, &c).await, Some(0));
    assert_eq!(service.incidents(&IncidentFilter::open()).await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_async_batch_skips_vanished_query_results() {
    let service = setup().await;
    create(&service, "pi-1", "d1").await;
    let kept = create(&service, "pi-2", "d1").await;

    let mut batch = service
        .update_retries()
        .process_instance_ids(["pi-1", "pi-2"])
        .set_async(4)
        .await
        .unwrap();
    service.delete_process_instance("pi-1").await.unwrap();

    let status = service.batch_runner().run(&mut batch).await;
    assert!(status.succeeded());
    assert_eq!(status.updated_tasks, 1);
    assert_eq!(retries_of(&service, &kept).await, Some(4));
}

#[tokio::test]
async fn test_zero_batch_sizes_in_code_config_still_finish() {
    let service = setup_with(EngineConfig {
        invocations_per_batch_job: 0,
        batch_jobs_per_seed: 0,
        ..EngineConfig::default()
    })
    .await;
    let a = create(&service, "pi-1", "d1").await;
    let b = create(&service, "pi-2", "d1").await;

    let mut batch = service
        .set_retries_async(&[a.clone(), b.clone()], 4)
        .await
        .unwrap();
    assert_eq!(batch.total_jobs, 2);

    let status = service.batch_runner().run(&mut batch).await;
    assert!(status.succeeded());
    assert_eq!(status.updated_tasks, 2);
    assert_eq!(retries_of(&service, &a).await, Some(4));
    assert_eq!(retries_of(&service, &b).await, Some(4));
}
