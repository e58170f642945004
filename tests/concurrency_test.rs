//! Concurrent fetchers and lockers against a shared file-backed database.

use std::collections::HashSet;
use std::sync::Arc;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use taskgate::{
    ErrorKind, ExternalTaskService, FetchRequest, NewExternalTask, SqliteTaskStore, TaskId,
};
use tempfile::TempDir;

async fn setup(dir: &TempDir) -> Arc<ExternalTaskService> {
    let options = SqliteConnectOptions::new()
        .filename(dir.path().join("tasks.db"))
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal);
    let pool = SqlitePoolOptions::new()
        .max_connections(4)
        .connect_with(options)
        .await
        .unwrap();
    let store = SqliteTaskStore::new(pool);
    store.run_migrations().await.unwrap();
    Arc::new(ExternalTaskService::builder(store).build())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_fetchers_never_share_a_task() {
    let dir = TempDir::new().unwrap();
    let service = setup(&dir).await;
    for i in 0..30 {
        service
            .create_task(NewExternalTask::new("topic", "process", format!("pi-{}", i), "act"))
            .await
            .unwrap();
    }

    let mut handles = Vec::new();
    for w in 0..6 {
        let service = service.clone();
        handles.push(tokio::spawn(async move {
            let request = FetchRequest::builder(format!("worker-{}", w), 10)
                .topic("topic", 60_000)
                .build()
                .unwrap();
            service.fetch_and_lock(&request).await.unwrap()
        }));
    }

    let mut seen: HashSet<TaskId> = HashSet::new();
    for handle in handles {
        for locked in handle.await.unwrap() {
            let worker = locked.task.worker_id().unwrap().to_string();
            assert!(seen.insert(locked.task.id.clone()), "task handed out twice");
            // The stored holder matches the worker the task was returned to.
            let stored = service.get_task(&locked.task.id).await.unwrap().unwrap();
            assert_eq!(stored.worker_id(), Some(worker.as_str()));
        }
    }

    // Whatever lost a race is still available afterwards.
    let request = FetchRequest::builder("sweeper", 100)
        .topic("topic", 60_000)
        .build()
        .unwrap();
    for locked in service.fetch_and_lock(&request).await.unwrap() {
        assert!(seen.insert(locked.task.id));
    }
    assert_eq!(seen.len(), 30);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_lock_has_one_winner() {
    let dir = TempDir::new().unwrap();
    let service = setup(&dir).await;
    let task = service
        .create_task(NewExternalTask::new("topic", "process", "pi-1", "act"))
        .await
        .unwrap();

    let mut handles = Vec::new();
    for w in 0..8 {
        let service = service.clone();
        let id = task.id.clone();
        handles.push(tokio::spawn(async move {
            service.lock(&id, &format!("worker-{}", w), 60_000).await
        }));
    }

    let mut winners = Vec::new();
    for handle in handles {
        match handle.await.unwrap() {
            Ok(lease) => winners.push(lease.worker_id),
            Err(e) => assert_eq!(e.kind(), ErrorKind::Conflict),
        }
    }
    assert_eq!(winners.len(), 1);

    let stored = service.get_task(&task.id).await.unwrap().unwrap();
    assert_eq!(stored.worker_id(), Some(winners[0].as_str()));
}
