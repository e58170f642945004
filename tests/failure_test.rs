//! Tests for failure reports.

use std::sync::Arc;
use std::time::Duration;

use sqlx::sqlite::SqlitePoolOptions;
use taskgate::{
    Clock, ErrorKind, ExternalTaskService, FailureReport, FakeClock, FetchRequest, IncidentFilter,
    LogState, NewExternalTask, SqliteTaskStore, TaskId,
};

async fn setup() -> (ExternalTaskService, Arc<FakeClock>) {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect(":memory:")
        .await
        .unwrap();
    let store = SqliteTaskStore::new(pool);
    store.run_migrations().await.unwrap();
    let clock = Arc::new(FakeClock::at_millis(1_700_000_000_000));
    let service = ExternalTaskService::builder(store).clock(clock.clone()).build();
    (service, clock)
}

async fn create_and_fetch(service: &ExternalTaskService, worker: &str) -> TaskId {
    let task = service
        .create_task(NewExternalTask::new("topic", "process", "pi-1", "externalTask"))
        .await
        .unwrap();
    let request = FetchRequest::builder(worker, 1).topic("topic", 10_000).build().unwrap();
    assert_eq!(service.fetch_and_lock(&request).await.unwrap().len(), 1);
    task.id
}

#[tokio::test]
async fn test_failure_records_retries_message_and_details() {
    let (service, clock) = setup().await;
    let id = create_and_fetch(&service, "w").await;

    service
        .handle_failure(
            &id,
            FailureReport::new("w", 3, 1_000)
                .message("connection refused")
                .details("at line 42"),
        )
        .await
        .unwrap();

    let task = service.get_task(&id).await.unwrap().unwrap();
    assert_eq!(task.retries, Some(3));
    assert_eq!(task.error_message.as_deref(), Some("connection refused"));
    assert_eq!(task.worker_id(), Some("w"));
    assert!(!task.is_locked_at(clock.now()));
    assert_eq!(
        service.get_error_details(&id).await.unwrap().as_deref(),
        Some("at line 42")
    );

    let history = service.history(&id).await.unwrap();
    let failed = history.iter().find(|e| e.state == LogState::Failed).unwrap();
    assert_eq!(failed.error_details.as_deref(), Some("at line 42"));
    assert_eq!(failed.retries, Some(3));

    assert!(service
        .incidents(&IncidentFilter::for_task(&id))
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_long_error_message_is_truncated() {
    let (service, _clock) = setup().await;
    let id = create_and_fetch(&service, "w").await;
    let long = "x".repeat(1_000);

    service
        .handle_failure(&id, FailureReport::new("w", 1, 0).message(long.clone()).details(long.clone()))
        .await
        .unwrap();

    let task = service.get_task(&id).await.unwrap().unwrap();
    assert_eq!(task.error_message.map(|m| m.chars().count()), Some(666));
    // Details are kept in full.
    assert_eq!(service.get_error_details(&id).await.unwrap(), Some(long));
}

#[tokio::test]
async fn test_failure_with_zero_retries_opens_incident() {
    let (service, _clock) = setup().await;
    let id = create_and_fetch(&service, "w").await;

    service
        .handle_failure(&id, FailureReport::new("w", 0, 0).message("fatal"))
        .await
        .unwrap();

    let incidents = service.incidents(&IncidentFilter::for_task(&id)).await.unwrap();
    assert_eq!(incidents.len(), 1);
    let incident = &incidents[0];
    assert!(incident.is_open());
    assert_eq!(incident.incident_type, "failedExternalTask");
    assert_eq!(incident.incident_message.as_deref(), Some("fatal"));
    assert_eq!(incident.activity_id, "externalTask");
    assert_eq!(incident.cause_incident_id, incident.id);
    assert_eq!(incident.root_cause_incident_id, incident.id);

    let history = service.history(&id).await.unwrap();
    let failed = history.iter().find(|e| e.state == LogState::Failed).unwrap();
    assert_eq!(incident.history_configuration.as_deref(), Some(failed.id.as_str()));

    // Zero retries keep the task away from fetchers.
    let request = FetchRequest::builder("w", 1).topic("topic", 1_000).build().unwrap();
    assert!(service.fetch_and_lock(&request).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_failure_by_other_worker_conflicts() {
    let (service, _clock) = setup().await;
    let id = create_and_fetch(&service, "aWorkerId").await;

    let err = service
        .handle_failure(&id, FailureReport::new("anotherWorkerId", 1, 0))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);
    assert_eq!(
        err.to_string(),
        format!(
            "Failure of External Task {} cannot be reported by worker 'anotherWorkerId'. It is locked by worker 'aWorkerId'.",
            id
        )
    );
}

#[tokio::test]
async fn test_failure_validation() {
    let (service, _clock) = setup().await;
    let id = create_and_fetch(&service, "w").await;

    let err = service
        .handle_failure(&id, FailureReport::new("w", -1, 0))
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "retries is not greater than or equal to 0");

    let err = service
        .handle_failure(&id, FailureReport::new("w", 1, -5))
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "retryDuration is not greater than or equal to 0");

    let err = service
        .handle_failure(&id, FailureReport::new("", 1, 0))
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "workerId is null");

    let err = service
        .handle_failure(&TaskId::new("missing"), FailureReport::new("w", 1, 0))
        .await
        .unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn test_failure_on_suspended_task_is_business_error() {
    let (service, _clock) = setup().await;
    let id = create_and_fetch(&service, "w").await;
    service.suspend_process_instance("pi-1").await.unwrap();

    let err = service
        .handle_failure(&id, FailureReport::new("w", 1, 0))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::BusinessState);
}

#[tokio::test]
async fn test_failure_after_expiry_by_holder_is_accepted() {
    let (service, clock) = setup().await;
    let id = create_and_fetch(&service, "w").await;

    clock.advance(Duration::from_secs(60));
    service
        .handle_failure(&id, FailureReport::new("w", 2, 0).message("late"))
        .await
        .unwrap();
    assert_eq!(service.get_task(&id).await.unwrap().unwrap().retries, Some(2));
}

#[tokio::test]
async fn test_holder_may_still_complete_after_failure() {
    let (service, _clock) = setup().await;
    let id = create_and_fetch(&service, "w").await;

    service
        .handle_failure(&id, FailureReport::new("w", 0, 0).message("fatal"))
        .await
        .unwrap();
    service.complete(&id, "w").await.unwrap();

    let incidents = service.incidents(&IncidentFilter::for_task(&id)).await.unwrap();
    assert_eq!(incidents.len(), 1);
    assert!(!incidents[0].is_open());
}

#[tokio::test]
async fn test_error_details_of_missing_task() {
    let (service, _clock) = setup().await;
    let err = service.get_error_details(&TaskId::new("missing")).await.unwrap_err();
    assert!(err.is_not_found());

    let id = create_and_fetch(&service, "w").await;
    assert_eq!(service.get_error_details(&id).await.unwrap(), None);
}
