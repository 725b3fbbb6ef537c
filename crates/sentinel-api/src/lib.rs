//! Read-only telemetry surface: REST snapshots and a live WebSocket feed.
//!
//! The surface never owns state. It reads snapshots through the
//! [`SentinelSnapshot`] trait (implemented in the binary over observer and
//! pipeline state) and replays the bus to WebSocket subscribers. Operator
//! dashboards are served from arbitrary hosts, so CORS mirrors any origin
//! with credentials allowed.

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use sentinel_bus::EventBus;
use sentinel_types::{ContainerState, Incident, SentinelEvent};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{AllowHeaders, AllowMethods, AllowOrigin, CorsLayer};
use tracing::{debug, info, warn};

/// Bound on the WebSocket handshake bootstrap and on every event send.
const SEND_TIMEOUT: Duration = Duration::from_secs(10);

/// Close code for a server-side timeout.
const CLOSE_TRY_AGAIN_LATER: u16 = 1013;
/// Close code for an internal server error.
const CLOSE_INTERNAL_ERROR: u16 = 1011;

/// Snapshot access to the world the sentinel tracks. The observer and the
/// pipeline both stay unaware of this surface; the binary wires them in.
pub trait SentinelSnapshot: Send + Sync {
    fn snapshot_containers(&self) -> Vec<ContainerState>;
    fn snapshot_incidents(&self) -> Vec<Incident>;
}

/// Shared state behind every handler.
pub struct ApiState {
    pub snapshot: Arc<dyn SentinelSnapshot>,
    pub bus: Arc<dyn EventBus>,
}

/// Default and maximum page sizes for the event-history read.
const DEFAULT_HISTORY_LIMIT: usize = 100;
const MAX_HISTORY_LIMIT: usize = 1000;

/// Build the telemetry router.
pub fn build_router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/containers", get(list_containers))
        .route("/incidents", get(list_incidents))
        .route("/events", get(list_events))
        .route("/ws", get(ws_upgrade))
        .layer(
            CorsLayer::new()
                .allow_origin(AllowOrigin::mirror_request())
                .allow_methods(AllowMethods::mirror_request())
                .allow_headers(AllowHeaders::mirror_request())
                .allow_credentials(true),
        )
        .with_state(state)
}

async fn healthz() -> impl IntoResponse {
    Json(json!({"status": "ok"}))
}

async fn list_containers(State(state): State<Arc<ApiState>>) -> impl IntoResponse {
    Json(state.snapshot.snapshot_containers())
}

async fn list_incidents(State(state): State<Arc<ApiState>>) -> impl IntoResponse {
    Json(state.snapshot.snapshot_incidents())
}

#[derive(serde::Deserialize)]
struct HistoryQuery {
    limit: Option<usize>,
}

/// Recent bus events, newest first. Late-joining dashboards use this to
/// backfill what the live feed will not replay.
async fn list_events(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<HistoryQuery>,
) -> impl IntoResponse {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_HISTORY_LIMIT)
        .min(MAX_HISTORY_LIMIT);
    Json(state.bus.history(limit).await)
}

async fn ws_upgrade(ws: WebSocketUpgrade, State(state): State<Arc<ApiState>>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

enum SendOutcome {
    Sent,
    TimedOut,
    Disconnected,
}

async fn send_event(socket: &mut WebSocket, event: &SentinelEvent) -> SendOutcome {
    let Ok(text) = serde_json::to_string(event) else {
        return SendOutcome::Disconnected;
    };
    match tokio::time::timeout(SEND_TIMEOUT, socket.send(Message::Text(text.into()))).await {
        Ok(Ok(())) => SendOutcome::Sent,
        Ok(Err(_)) => SendOutcome::Disconnected,
        Err(_) => SendOutcome::TimedOut,
    }
}

async fn close_with(socket: &mut WebSocket, code: u16, reason: &'static str) {
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: reason.into(),
        })))
        .await;
}

/// One client's feed: bootstrap frame first, then every bus event, each
/// bounded by [`SEND_TIMEOUT`]. A timed-out event send is skipped; a
/// timed-out bootstrap gives up on the connection.
async fn handle_socket(mut socket: WebSocket, state: Arc<ApiState>) {
    info!("websocket client connected");

    let bootstrap = SentinelEvent::Bootstrap {
        containers: state.snapshot.snapshot_containers(),
        incidents: state.snapshot.snapshot_incidents(),
    };
    match send_event(&mut socket, &bootstrap).await {
        SendOutcome::Sent => {}
        SendOutcome::TimedOut => {
            warn!("bootstrap send timed out");
            close_with(&mut socket, CLOSE_TRY_AGAIN_LATER, "Server timeout").await;
            return;
        }
        SendOutcome::Disconnected => {
            close_with(&mut socket, CLOSE_INTERNAL_ERROR, "Internal server error").await;
            return;
        }
    }

    let mut subscription = state.bus.subscribe();

    loop {
        tokio::select! {
            event = subscription.next() => {
                let Some(event) = event else {
                    debug!("event bus subscription ended");
                    break;
                };
                match send_event(&mut socket, &event).await {
                    SendOutcome::Sent => {}
                    SendOutcome::TimedOut => {
                        // One slow frame is not fatal; the client just
                        // misses that event.
                        warn!(kind = event.kind(), "event send timed out, skipping");
                    }
                    SendOutcome::Disconnected => {
                        debug!("websocket client disconnected during send");
                        break;
                    }
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    // Inbound frames are ignored; this feed is one-way.
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => {
                        debug!("websocket client disconnected");
                        break;
                    }
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    subscription.close();
    info!("websocket client loop finished");
}
