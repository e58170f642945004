//! Tests for administrative retry updates and the incident lifecycle.

use std::sync::Arc;

use sqlx::sqlite::SqlitePoolOptions;
use taskgate::{
    ErrorKind, ExternalTaskService, FailureReport, FakeClock, FetchRequest, IncidentFilter,
    IncidentState, LogState, NewExternalTask, SqliteTaskStore, TaskId,
};

async fn setup() -> ExternalTaskService {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect(":memory:")
        .await
        .unwrap();
    let store = SqliteTaskStore::new(pool);
    store.run_migrations().await.unwrap();
    let clock = Arc::new(FakeClock::at_millis(1_700_000_000_000));
    ExternalTaskService::builder(store).clock(clock).build()
}

async fn create(service: &ExternalTaskService, pi: &str) -> TaskId {
    service
        .create_task(NewExternalTask::new("topic", "process", pi, "externalTask"))
        .await
        .unwrap()
        .id
}

async fn open_incidents(service: &ExternalTaskService, id: &TaskId) -> usize {
    service
        .incidents(&IncidentFilter::for_task(id))
        .await
        .unwrap()
        .iter()
        .filter(|i| i.is_open())
        .count()
}

#[tokio::test]
async fn test_incident_round_trip() {
    let service = setup().await;
    let id = create(&service, "pi-1").await;

    service.set_retries(&id, 0).await.unwrap();
    assert_eq!(open_incidents(&service, &id).await, 1);

    // Setting zero again does not open a second incident.
    service.set_retries(&id, 0).await.unwrap();
    assert_eq!(open_incidents(&service, &id).await, 1);

    service.set_retries(&id, 5).await.unwrap();
    assert_eq!(open_incidents(&service, &id).await, 0);
    let incidents = service.incidents(&IncidentFilter::for_task(&id)).await.unwrap();
    assert_eq!(incidents.len(), 1);
    assert_eq!(incidents[0].state, IncidentState::Resolved);
    assert!(incidents[0].end_time.is_some());

    assert_eq!(service.get_task(&id).await.unwrap().unwrap().retries, Some(5));
}

#[tokio::test]
async fn test_incident_after_failure_references_failure_log() {
    let service = setup().await;
    let id = create(&service, "pi-1").await;
    let request = FetchRequest::builder("w", 1).topic("topic", 1_000).build().unwrap();
    service.fetch_and_lock(&request).await.unwrap();
    service
        .handle_failure(&id, FailureReport::new("w", 1, 0).message("first"))
        .await
        .unwrap();

    service.set_retries(&id, 0).await.unwrap();

    let incidents = service.incidents(&IncidentFilter::open()).await.unwrap();
    assert_eq!(incidents.len(), 1);
    assert_eq!(incidents[0].incident_message.as_deref(), Some("first"));
    let failed = service
        .history(&id)
        .await
        .unwrap()
        .into_iter()
        .find(|e| e.state == LogState::Failed)
        .unwrap();
    assert_eq!(incidents[0].history_configuration, Some(failed.id));
}

#[tokio::test]
async fn test_set_retries_validation() {
    let service = setup().await;
    let id = create(&service, "pi-1").await;

    let err = service.set_retries(&id, -1).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
    assert_eq!(err.to_string(), "retries is not greater than or equal to 0");

    let err = service.set_retries(&TaskId::new(""), 1).await.unwrap_err();
    assert_eq!(err.to_string(), "externalTaskId is null");

    let err = service.set_retries(&TaskId::new("missing"), 1).await.unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn test_set_retries_needs_no_lock() {
    let service = setup().await;
    let id = create(&service, "pi-1").await;
    let request = FetchRequest::builder("w", 1).topic("topic", 60_000).build().unwrap();
    service.fetch_and_lock(&request).await.unwrap();

    service.set_retries(&id, 7).await.unwrap();
    let task = service.get_task(&id).await.unwrap().unwrap();
    assert_eq!(task.retries, Some(7));
    assert_eq!(task.worker_id(), Some("w"));
}

#[tokio::test]
async fn test_set_retries_many_is_all_or_nothing() {
    let service = setup().await;
    let a = create(&service, "pi-1").await;
    let b = create(&service, "pi-2").await;

    service.set_retries_many(&[a.clone(), b.clone()], 4).await.unwrap();
    assert_eq!(service.get_task(&a).await.unwrap().unwrap().retries, Some(4));
    assert_eq!(service.get_task(&b).await.unwrap().unwrap().retries, Some(4));

    let err = service
        .set_retries_many(&[a.clone(), TaskId::new("missing")], 0)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::BadRequest);
    assert_eq!(err.to_string(), "Cannot find external task with id missing");
    assert_eq!(service.get_task(&a).await.unwrap().unwrap().retries, Some(4));
    assert_eq!(open_incidents(&service, &a).await, 0);
}

#[tokio::test]
async fn test_set_retries_many_validation() {
    let service = setup().await;

    let err = service.set_retries_many(&[], 1).await.unwrap_err();
    assert_eq!(err.to_string(), "externalTaskIds is empty");

    let err = service
        .set_retries_many(&[TaskId::new("")], 1)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::BadRequest);
    assert_eq!(err.to_string(), "External task id cannot be null");
}

#[tokio::test]
async fn test_delete_process_instance_deletes_incidents() {
    let service = setup().await;
    let id = create(&service, "pi-1").await;
    let other = create(&service, "pi-2").await;
    service.set_retries(&id, 0).await.unwrap();
    service.set_retries(&other, 0).await.unwrap();

    service.delete_process_instance("pi-1").await.unwrap();

    assert!(service.get_task(&id).await.unwrap().is_none());
    let incidents = service.incidents(&IncidentFilter::for_task(&id)).await.unwrap();
    assert_eq!(incidents[0].state, IncidentState::Deleted);
    assert_eq!(open_incidents(&service, &other).await, 1);

    let states: Vec<_> = service
        .history(&id)
        .await
        .unwrap()
        .into_iter()
        .map(|e| e.state)
        .collect();
    assert_eq!(states, vec![LogState::Created, LogState::Deleted]);
}

#[tokio::test]
async fn test_second_exhaustion_opens_a_new_incident() {
    let service = setup().await;
    let id = create(&service, "pi-1").await;

    service.set_retries(&id, 0).await.unwrap();
    service.set_retries(&id, 1).await.unwrap();
    service.set_retries(&id, 0).await.unwrap();

    let incidents = service.incidents(&IncidentFilter::for_task(&id)).await.unwrap();
    assert_eq!(incidents.len(), 2);
    assert_ne!(incidents[0].id, incidents[1].id);
    assert_eq!(incidents[0].state, IncidentState::Resolved);
    assert!(incidents[1].is_open());
}
