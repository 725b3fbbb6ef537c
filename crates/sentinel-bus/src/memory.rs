//! In-process bus: a broadcast channel fronted by a capped history deque.

use crate::{EventBus, Subscription, HISTORY_CAPACITY, SUBSCRIBER_QUEUE_CAPACITY};
use async_trait::async_trait;
use sentinel_types::SentinelEvent;
use std::collections::VecDeque;
use std::sync::Mutex;
use tokio::sync::broadcast;

/// Single-process fan-out bus. Cheap to clone via `Arc`; publish is
/// lock-light and never waits on a subscriber.
pub struct MemoryBus {
    tx: broadcast::Sender<SentinelEvent>,
    history: Mutex<VecDeque<SentinelEvent>>,
}

impl MemoryBus {
    #[must_use]
    pub fn new() -> Self {
        Self::with_queue_capacity(SUBSCRIBER_QUEUE_CAPACITY)
    }

    /// Test hook: shrink the per-subscriber queue to force lag behavior.
    #[must_use]
    pub fn with_queue_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self {
            tx,
            history: Mutex::new(VecDeque::with_capacity(HISTORY_CAPACITY)),
        }
    }
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventBus for MemoryBus {
    async fn publish(&self, event: SentinelEvent) {
        {
            let mut history = self.history.lock().expect("history lock poisoned");
            history.push_front(event.clone());
            history.truncate(HISTORY_CAPACITY);
        }
        // Err here just means nobody is listening right now.
        let _ = self.tx.send(event);
    }

    fn subscribe(&self) -> Subscription {
        Subscription::new(self.tx.subscribe())
    }

    async fn history(&self, limit: usize) -> Vec<SentinelEvent> {
        let history = self.history.lock().expect("history lock poisoned");
        history.iter().take(limit).cloned().collect()
    }
}
