//! Long-poll fetches parked on the wake condition.
//!
//! One background task owns the [`WakeConsumer`] and every pending request.
//! Each new request is tried at once. Requests that found nothing are retried
//! whenever the condition fires and answered empty when their deadline passes.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, warn};

use crate::dispatch::Dispatcher;
use crate::error::TaskError;
use crate::fetch::FetchRequest;
use crate::task::LockedExternalTask;
use crate::wake::{WakeCondition, WakeConsumer};

type Reply = oneshot::Sender<Result<Vec<LockedExternalTask>, TaskError>>;

struct PendingFetch {
    request: FetchRequest,
    deadline: Instant,
    reply: Reply,
}

/// Handle to the long-poll background task.
pub struct LongPollHandler {
    sender: mpsc::Sender<PendingFetch>,
    handle: JoinHandle<()>,
    max_timeout: Duration,
}

impl LongPollHandler {
    /// Register as the wake condition's consumer and start the background task.
    pub fn spawn(
        dispatcher: Arc<Dispatcher>,
        wake: &Arc<WakeCondition>,
        max_timeout: Duration,
    ) -> Result<Self, TaskError> {
        let consumer = wake.register().ok_or_else(|| {
            TaskError::validation("the wake condition already has a registered consumer")
        })?;
        let (sender, receiver) = mpsc::channel(64);
        let handle = tokio::spawn(run(dispatcher, consumer, receiver));
        Ok(Self {
            sender,
            handle,
            max_timeout,
        })
    }

    /// Fetch, waiting up to `timeout` for work to appear if none is available.
    pub async fn fetch_and_lock(
        &self,
        request: FetchRequest,
        timeout: Duration,
    ) -> Result<Vec<LockedExternalTask>, TaskError> {
        request.validate()?;
        let (reply, response) = oneshot::channel();
        let pending = PendingFetch {
            request,
            deadline: Instant::now() + timeout.min(self.max_timeout),
            reply,
        };
        if self.sender.send(pending).await.is_err() {
            return Ok(Vec::new());
        }
        // A dropped reply means the handler shut down; nothing was leased.
        response.await.unwrap_or_else(|_| Ok(Vec::new()))
    }
}

impl Drop for LongPollHandler {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn run(
    dispatcher: Arc<Dispatcher>,
    consumer: WakeConsumer,
    mut receiver: mpsc::Receiver<PendingFetch>,
) {
    let mut pending: Vec<PendingFetch> = Vec::new();

    loop {
        let next_deadline = pending.iter().map(|p| p.deadline).min();

        tokio::select! {
            incoming = receiver.recv() => {
                let Some(fetch) = incoming else { break };
                if fetch.reply.is_closed() {
                    continue;
                }
                if let Some(fetch) = attempt(&dispatcher, fetch).await {
                    pending.push(fetch);
                }
            }
            signalled = consumer.wait_until(next_deadline.unwrap_or_else(Instant::now)),
                if next_deadline.is_some() =>
            {
                let now = Instant::now();
                let mut still_waiting = Vec::with_capacity(pending.len());
                for fetch in pending.drain(..) {
                    // The caller gave up; leasing on its behalf would strand tasks.
                    if fetch.reply.is_closed() {
                        debug!(worker = %fetch.request.worker_id, "dropping abandoned long-poll");
                        continue;
                    }
                    let fetch = if signalled {
                        match attempt(&dispatcher, fetch).await {
                            Some(fetch) => fetch,
                            None => continue,
                        }
                    } else {
                        fetch
                    };
                    if fetch.deadline <= now {
                        let _ = fetch.reply.send(Ok(Vec::new()));
                    } else {
                        still_waiting.push(fetch);
                    }
                }
                pending = still_waiting;
            }
        }
    }

    for fetch in pending {
        let _ = fetch.reply.send(Ok(Vec::new()));
    }
}

/// Try a pending fetch once. Returns it back if nothing was leased.
async fn attempt(dispatcher: &Dispatcher, fetch: PendingFetch) -> Option<PendingFetch> {
    match dispatcher.fetch_and_lock(&fetch.request).await {
        Ok(tasks) if tasks.is_empty() && fetch.deadline > Instant::now() => {
            debug!(worker = %fetch.request.worker_id, "no tasks yet; parking long-poll");
            Some(fetch)
        }
        Ok(tasks) => {
            let worker_id = fetch.request.worker_id;
            if let Err(Ok(tasks)) = fetch.reply.send(Ok(tasks)) {
                warn!(worker = %worker_id, count = tasks.len(), "long-poll caller gone; releasing tasks");
                dispatcher.release(&tasks, &worker_id).await;
            }
            None
        }
        Err(e) => {
            error!(worker = %fetch.request.worker_id, error = %e, "long-poll fetch failed");
            let _ = fetch.reply.send(Err(e));
            None
        }
    }
}
