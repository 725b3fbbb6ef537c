//! Fan-out event bus.
//!
//! Two implementations share one contract: publishing never blocks on (or
//! fails because of) subscribers, each subscriber sees events in publish
//! order, a slow subscriber loses its own oldest events and nobody else's,
//! and a bounded newest-first history is kept for late joiners to read
//! explicitly.
//!
//! [`MemoryBus`] is the in-process variant used by tests and single-node
//! deployments. [`RedisBus`] layers the same semantics over Redis pub/sub
//! plus a capped list, so events survive the process and other consumers can
//! tail them.

mod memory;
mod redis_bus;

pub use memory::MemoryBus;
pub use redis_bus::RedisBus;

use async_trait::async_trait;
use sentinel_types::SentinelEvent;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::warn;

/// Failures establishing the durable bus backing. Publishing and reading
/// never surface errors to callers; only connecting can fail.
#[derive(Debug, Error)]
pub enum BusError {
    #[error("invalid Redis URL for {address}")]
    InvalidUrl {
        address: String,
        #[source]
        source: redis::RedisError,
    },
    #[error("failed to connect to Redis at {address}")]
    Connect {
        address: String,
        #[source]
        source: redis::RedisError,
    },
    #[error("Redis did not answer PING")]
    Ping(#[source] redis::RedisError),
}

/// How many events a single subscriber may have in flight before its oldest
/// are dropped.
pub const SUBSCRIBER_QUEUE_CAPACITY: usize = 256;

/// Maximum number of events retained in history, newest first.
pub const HISTORY_CAPACITY: usize = 1000;

/// Pub/sub channel name used by the Redis backing store.
pub const EVENT_CHANNEL: &str = "sre-sentinel-events";

/// Redis key holding the capped history list.
pub const EVENT_HISTORY_KEY: &str = "sre-sentinel-events-history";

/// The bus contract shared by all backings.
#[async_trait]
pub trait EventBus: Send + Sync {
    /// Broadcast `event` to all current subscribers and append it to
    /// history. Returns without awaiting any subscriber; delivery problems
    /// are the subscriber's, not the publisher's.
    async fn publish(&self, event: SentinelEvent);

    /// Attach a new subscriber. It observes every event published after this
    /// call and nothing earlier; history is a separate read.
    fn subscribe(&self) -> Subscription;

    /// Up to `limit` most recent events, newest first.
    async fn history(&self, limit: usize) -> Vec<SentinelEvent>;
}

/// Live event stream handle returned by [`EventBus::subscribe`].
pub struct Subscription {
    rx: broadcast::Receiver<SentinelEvent>,
    closed: bool,
}

impl Subscription {
    pub(crate) fn new(rx: broadcast::Receiver<SentinelEvent>) -> Self {
        Self { rx, closed: false }
    }

    /// Next event in publish order, or `None` once the subscription is
    /// closed (locally via [`close`](Self::close) or because the bus went
    /// away). Falling behind drops this subscriber's oldest events and keeps
    /// going.
    pub async fn next(&mut self) -> Option<SentinelEvent> {
        if self.closed {
            return None;
        }
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(dropped)) => {
                    warn!(dropped, "subscriber lagging, oldest events dropped");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Terminate the stream. Subsequent `next()` calls return `None`.
    pub fn close(&mut self) {
        self.closed = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn log_event(n: usize) -> SentinelEvent {
        SentinelEvent::Log {
            container: "api".into(),
            timestamp: format!("2025-01-01T00:00:{:02}Z", n % 60),
            message: format!("line {n}"),
        }
    }

    fn message_of(event: &SentinelEvent) -> String {
        match event {
            SentinelEvent::Log { message, .. } => message.clone(),
            other => panic!("expected log event, got {}", other.kind()),
        }
    }

    #[tokio::test]
    async fn test_subscriber_sees_publish_order() {
        let bus = MemoryBus::new();
        let mut sub = bus.subscribe();
        for n in 0..10 {
            bus.publish(log_event(n)).await;
        }
        for n in 0..10 {
            let event = sub.next().await.unwrap();
            assert_eq!(message_of(&event), format!("line {n}"));
        }
    }

    #[tokio::test]
    async fn test_late_subscriber_misses_earlier_events() {
        let bus = MemoryBus::new();
        bus.publish(log_event(0)).await;
        let mut sub = bus.subscribe();
        bus.publish(log_event(1)).await;
        let event = sub.next().await.unwrap();
        assert_eq!(message_of(&event), "line 1");
    }

    #[tokio::test]
    async fn test_slow_subscriber_drops_oldest_only_for_itself() {
        let bus = MemoryBus::with_queue_capacity(4);
        let mut slow = bus.subscribe();
        let mut fast = bus.subscribe();

        bus.publish(log_event(0)).await;
        bus.publish(log_event(1)).await;
        // Fast consumer keeps up.
        assert_eq!(message_of(&fast.next().await.unwrap()), "line 0");
        assert_eq!(message_of(&fast.next().await.unwrap()), "line 1");

        // The fast consumer keeps draining while the slow one stalls.
        for n in 2..8 {
            bus.publish(log_event(n)).await;
            assert_eq!(message_of(&fast.next().await.unwrap()), format!("line {n}"));
        }

        // The slow consumer lost its oldest events but resumes in order.
        let first_after_lag = message_of(&slow.next().await.unwrap());
        assert_eq!(first_after_lag, "line 4");
        assert_eq!(message_of(&slow.next().await.unwrap()), "line 5");
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_fine() {
        let bus = MemoryBus::new();
        bus.publish(log_event(0)).await;
        assert_eq!(bus.history(10).await.len(), 1);
    }

    #[tokio::test]
    async fn test_history_is_newest_first_and_capped() {
        let bus = MemoryBus::new();
        for n in 0..(HISTORY_CAPACITY + 5) {
            bus.publish(log_event(n)).await;
        }
        let history = bus.history(HISTORY_CAPACITY + 100).await;
        assert_eq!(history.len(), HISTORY_CAPACITY);
        assert_eq!(message_of(&history[0]), format!("line {}", HISTORY_CAPACITY + 4));

        let recent = bus.history(3).await;
        assert_eq!(recent.len(), 3);
        assert_eq!(message_of(&recent[2]), format!("line {}", HISTORY_CAPACITY + 2));
    }

    #[tokio::test]
    async fn test_closed_subscription_terminates_cleanly() {
        let bus = MemoryBus::new();
        let mut sub = bus.subscribe();
        bus.publish(log_event(0)).await;
        sub.close();
        assert!(sub.next().await.is_none());
        assert!(sub.next().await.is_none());
    }
}
