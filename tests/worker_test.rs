//! Tests for the topic worker driving handlers through the service.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use serde_json::json;
use sqlx::sqlite::SqlitePoolOptions;
use taskgate::worker::{HandlerError, RetryPolicy, TopicHandler, TopicWorkerBuilder};
use taskgate::{
    BpmnError, ExternalTask, ExternalTaskService, FakeClock, IncidentFilter, LockedExternalTask,
    NewExternalTask, ProcessHooks, SqliteTaskStore, Variables,
};

#[derive(Clone, Copy)]
enum Outcome {
    Succeed,
    Retry,
    Fail,
    Bpmn,
}

struct ScriptedHandler {
    topic: &'static str,
    outcome: Outcome,
    calls: Arc<AtomicUsize>,
}

#[async_trait]
impl TopicHandler for ScriptedHandler {
    fn topic(&self) -> &str {
        self.topic
    }

    async fn handle(&self, task: &LockedExternalTask) -> Result<Variables, HandlerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.outcome {
            Outcome::Succeed => {
                let mut variables = Variables::new();
                variables.insert("handledBy".into(), json!(task.worker_id));
                Ok(variables)
            }
            Outcome::Retry => Err(HandlerError::retryable(anyhow!("gateway timeout"))),
            Outcome::Fail => Err(HandlerError::permanent(anyhow!("invalid card number"))),
            Outcome::Bpmn => Err(HandlerError::bpmn(BpmnError::new("CARD_DECLINED"))),
        }
    }
}

#[derive(Default)]
struct CountingHooks {
    bpmn_errors: AtomicUsize,
}

#[async_trait]
impl ProcessHooks for CountingHooks {
    async fn on_complete(&self, _task: &ExternalTask) -> anyhow::Result<()> {
        Ok(())
    }

    async fn on_bpmn_error(&self, _task: &ExternalTask, _error: &BpmnError) -> anyhow::Result<()> {
        self.bpmn_errors.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct Harness {
    service: Arc<ExternalTaskService>,
    clock: Arc<FakeClock>,
    hooks: Arc<CountingHooks>,
}

async fn setup() -> Harness {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect(":memory:")
        .await
        .unwrap();
    let store = SqliteTaskStore::new(pool);
    store.run_migrations().await.unwrap();
    let clock = Arc::new(FakeClock::at_millis(1_700_000_000_000));
    let hooks = Arc::new(CountingHooks::default());
    let service = ExternalTaskService::builder(store)
        .clock(clock.clone())
        .hooks(hooks.clone())
        .build();
    Harness {
        service: Arc::new(service),
        clock,
        hooks,
    }
}

fn handler(outcome: Outcome) -> (ScriptedHandler, Arc<AtomicUsize>) {
    let calls = Arc::new(AtomicUsize::new(0));
    (
        ScriptedHandler {
            topic: "charge-card",
            outcome,
            calls: calls.clone(),
        },
        calls,
    )
}

async fn create(service: &ExternalTaskService, pi: &str) -> ExternalTask {
    service
        .create_task(NewExternalTask::new("charge-card", "payment", pi, "charge"))
        .await
        .unwrap()
}

#[tokio::test]
async fn test_success_completes_with_variables() {
    let h = setup().await;
    let first = create(&h.service, "pi-1").await;
    let second = create(&h.service, "pi-2").await;
    let (handler, calls) = handler(Outcome::Succeed);
    let worker = TopicWorkerBuilder::new(h.service.clone(), "worker-1")
        .handler(handler)
        .max_concurrent(5)
        .build();

    assert_eq!(worker.poll_once().await.unwrap(), 2);
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    assert!(h.service.get_task(&first.id).await.unwrap().is_none());
    assert!(h.service.get_task(&second.id).await.unwrap().is_none());
    assert_eq!(
        h.service.variables("pi-1").await.unwrap().get("handledBy"),
        Some(&json!("worker-1"))
    );
    assert_eq!(worker.poll_once().await.unwrap(), 0);
}

#[tokio::test]
async fn test_retryable_failure_spends_retries_then_opens_incident() {
    let h = setup().await;
    let task = create(&h.service, "pi-1").await;
    let (handler, calls) = handler(Outcome::Retry);
    let worker = TopicWorkerBuilder::new(h.service.clone(), "worker-1")
        .handler(handler)
        .retry_policy(RetryPolicy::fixed(2, Duration::from_secs(1)))
        .build();

    assert_eq!(worker.poll_once().await.unwrap(), 1);
    let stored = h.service.get_task(&task.id).await.unwrap().unwrap();
    assert_eq!(stored.retries, Some(2));
    assert_eq!(stored.error_message.as_deref(), Some("retryable: gateway timeout"));

    // The retry delay keeps the task away from the next poll.
    assert_eq!(worker.poll_once().await.unwrap(), 0);

    h.clock.advance(Duration::from_secs(1));
    assert_eq!(worker.poll_once().await.unwrap(), 1);
    assert_eq!(h.service.get_task(&task.id).await.unwrap().unwrap().retries, Some(1));

    h.clock.advance(Duration::from_secs(1));
    assert_eq!(worker.poll_once().await.unwrap(), 1);
    assert_eq!(h.service.get_task(&task.id).await.unwrap().unwrap().retries, Some(0));
    assert_eq!(calls.load(Ordering::SeqCst), 3);

    let incidents = h.service.incidents(&IncidentFilter::open()).await.unwrap();
    assert_eq!(incidents.len(), 1);

    h.clock.advance(Duration::from_secs(60));
    assert_eq!(worker.poll_once().await.unwrap(), 0);
}

#[tokio::test]
async fn test_permanent_failure_opens_incident_at_once() {
    let h = setup().await;
    let task = create(&h.service, "pi-1").await;
    let (handler, _calls) = handler(Outcome::Fail);
    let worker = TopicWorkerBuilder::new(h.service.clone(), "worker-1")
        .handler(handler)
        .retry_policy(RetryPolicy::exponential(5))
        .build();

    assert_eq!(worker.poll_once().await.unwrap(), 1);
    let stored = h.service.get_task(&task.id).await.unwrap().unwrap();
    assert_eq!(stored.retries, Some(0));

    let details = h.service.get_error_details(&task.id).await.unwrap().unwrap();
    assert!(details.contains("invalid card number"));
    assert_eq!(
        h.service
            .incidents(&IncidentFilter::for_task(&task.id))
            .await
            .unwrap()
            .len(),
        1
    );
}

#[tokio::test]
async fn test_bpmn_error_reaches_process_hooks() {
    let h = setup().await;
    let task = create(&h.service, "pi-1").await;
    let (handler, _calls) = handler(Outcome::Bpmn);
    let worker = TopicWorkerBuilder::new(h.service.clone(), "worker-1")
        .handler(handler)
        .build();

    assert_eq!(worker.poll_once().await.unwrap(), 1);
    assert!(h.service.get_task(&task.id).await.unwrap().is_none());
    assert_eq!(h.hooks.bpmn_errors.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_worker_only_fetches_registered_topics() {
    let h = setup().await;
    h.service
        .create_task(NewExternalTask::new("ship-parcel", "payment", "pi-1", "ship"))
        .await
        .unwrap();
    let (handler, calls) = handler(Outcome::Succeed);
    let worker = TopicWorkerBuilder::new(h.service.clone(), "worker-1")
        .handler(handler)
        .build();

    assert_eq!(worker.worker_id(), "worker-1");
    assert_eq!(worker.poll_once().await.unwrap(), 0);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}
