//! Edge-triggered wakeup for long-poll fetches.
//!
//! Producers of new dispatchable work call [`WakeCondition::signal`]. A single
//! registered [`WakeConsumer`] waits for the next signal or a deadline.
//! A signal sent while nobody waits is kept as one pending wakeup, and any
//! further signals collapse into it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;

/// Shared notifier; construct one per service and pass it around.
#[derive(Debug, Default)]
pub struct WakeCondition {
    notify: Notify,
    registered: AtomicBool,
}

impl WakeCondition {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Wake the consumer. Never blocks.
    pub fn signal(&self) {
        // notify_one stores at most one permit when nobody is waiting.
        self.notify.notify_one();
    }

    /// Register the single consumer. Returns `None` while another is registered.
    pub fn register(self: &Arc<Self>) -> Option<WakeConsumer> {
        if self
            .registered
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return None;
        }
        Some(WakeConsumer {
            condition: Arc::clone(self),
        })
    }

    pub fn has_consumer(&self) -> bool {
        self.registered.load(Ordering::Acquire)
    }
}

/// The registered waiter. Dropping it deregisters.
#[derive(Debug)]
pub struct WakeConsumer {
    condition: Arc<WakeCondition>,
}

impl WakeConsumer {
    /// Wait for a signal until `deadline`. Returns `true` if signalled.
    pub async fn wait_until(&self, deadline: Instant) -> bool {
        tokio::time::timeout_at(deadline, self.condition.notify.notified())
            .await
            .is_ok()
    }

    /// Wait for a signal for at most `timeout`.
    pub async fn wait(&self, timeout: Duration) -> bool {
        self.wait_until(Instant::now() + timeout).await
    }
}

impl Drop for WakeConsumer {
    fn drop(&mut self) {
        self.condition.registered.store(false, Ordering::Release);
    }
}
