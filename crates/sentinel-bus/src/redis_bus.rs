//! Redis-backed bus: PUBLISH for fan-out, a capped LPUSH list for history.
//!
//! A single background task owns the pub/sub connection and re-broadcasts
//! incoming messages onto an in-process channel, so local subscriptions are
//! identical to [`MemoryBus`](crate::MemoryBus) ones. If the pub/sub
//! connection dies it is re-established with a short backoff; subscribers
//! simply see a gap, never an error.

use crate::{
    BusError, EventBus, Subscription, EVENT_CHANNEL, EVENT_HISTORY_KEY, HISTORY_CAPACITY,
    SUBSCRIBER_QUEUE_CAPACITY,
};
use async_trait::async_trait;
use futures::StreamExt;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use sentinel_config::RedisSettings;
use sentinel_types::SentinelEvent;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Durable bus over Redis pub/sub with a capped history list.
pub struct RedisBus {
    manager: ConnectionManager,
    tx: broadcast::Sender<SentinelEvent>,
    pump: JoinHandle<()>,
}

impl RedisBus {
    /// Connect, verify the server responds, and start the subscription pump.
    pub async fn connect(settings: &RedisSettings) -> Result<Self, BusError> {
        let address = format!("{}:{}", settings.host, settings.port);

        let client = redis::Client::open(settings.url()).map_err(|source| BusError::InvalidUrl {
            address: address.clone(),
            source,
        })?;

        let mut manager =
            client
                .get_connection_manager()
                .await
                .map_err(|source| BusError::Connect {
                    address: address.clone(),
                    source,
                })?;

        redis::cmd("PING")
            .query_async::<()>(&mut manager)
            .await
            .map_err(BusError::Ping)?;

        info!(host = %settings.host, port = settings.port, "connected to Redis event bus");

        let (tx, _) = broadcast::channel(SUBSCRIBER_QUEUE_CAPACITY);
        let pump = tokio::spawn(run_subscription_pump(client, tx.clone()));

        Ok(Self { manager, tx, pump })
    }

    /// Stop the subscription pump. Pending local subscriptions terminate.
    pub fn shutdown(&self) {
        self.pump.abort();
    }
}

impl Drop for RedisBus {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

#[async_trait]
impl EventBus for RedisBus {
    async fn publish(&self, event: SentinelEvent) {
        let payload = match serde_json::to_string(&event) {
            Ok(payload) => payload,
            Err(err) => {
                warn!(error = %err, kind = event.kind(), "failed to serialize event, dropping");
                return;
            }
        };

        let mut manager = self.manager.clone();
        let mut pipe = redis::pipe();
        pipe.publish(EVENT_CHANNEL, &payload).ignore();
        pipe.lpush(EVENT_HISTORY_KEY, &payload).ignore();
        pipe.ltrim(EVENT_HISTORY_KEY, 0, (HISTORY_CAPACITY as isize) - 1).ignore();

        if let Err(err) = pipe.query_async::<()>(&mut manager).await {
            // A publish failure is the bus's problem, never the publisher's.
            warn!(error = %err, kind = event.kind(), "failed to publish event to Redis");
        }
    }

    fn subscribe(&self) -> Subscription {
        Subscription::new(self.tx.subscribe())
    }

    async fn history(&self, limit: usize) -> Vec<SentinelEvent> {
        if limit == 0 {
            return Vec::new();
        }
        let mut manager = self.manager.clone();
        let stop = (limit as isize) - 1;
        let raw: Vec<String> = match manager.lrange(EVENT_HISTORY_KEY, 0, stop).await {
            Ok(raw) => raw,
            Err(err) => {
                warn!(error = %err, "failed to read event history from Redis");
                return Vec::new();
            }
        };

        raw.iter()
            .filter_map(|entry| match serde_json::from_str(entry) {
                Ok(event) => Some(event),
                Err(err) => {
                    debug!(error = %err, "skipping malformed history entry");
                    None
                }
            })
            .collect()
    }
}

/// Own the pub/sub connection for the life of the bus, re-broadcasting
/// messages locally and reconnecting on failure.
async fn run_subscription_pump(client: redis::Client, tx: broadcast::Sender<SentinelEvent>) {
    loop {
        let mut pubsub = match client.get_async_pubsub().await {
            Ok(pubsub) => pubsub,
            Err(err) => {
                warn!(error = %err, "Redis pub/sub connection failed, retrying");
                tokio::time::sleep(RECONNECT_DELAY).await;
                continue;
            }
        };

        if let Err(err) = pubsub.subscribe(EVENT_CHANNEL).await {
            warn!(error = %err, "failed to subscribe to event channel, retrying");
            tokio::time::sleep(RECONNECT_DELAY).await;
            continue;
        }

        debug!(channel = EVENT_CHANNEL, "Redis subscription established");

        let mut stream = pubsub.on_message();
        while let Some(msg) = stream.next().await {
            let payload: String = match msg.get_payload() {
                Ok(payload) => payload,
                Err(err) => {
                    warn!(error = %err, "unreadable pub/sub payload");
                    continue;
                }
            };
            match serde_json::from_str::<SentinelEvent>(&payload) {
                Ok(event) => {
                    let _ = tx.send(event);
                }
                Err(err) => warn!(error = %err, "skipping malformed event payload"),
            }
        }

        warn!("Redis pub/sub stream ended, reconnecting");
        tokio::time::sleep(RECONNECT_DELAY).await;
    }
}
