//! WebSocket handler streaming change notifications to a client session
//!
//! The first message carries the session id the client must send as
//! `x-session-id` (or as a subscription `eventKey`). When the socket closes,
//! the session's subscriptions and locks are released.

use super::handlers::FeatherState;
use crate::events::SessionEvent;
use axum::{
    extract::{
        ws::{Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::{interval, Duration};
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct WsQuery {
    /// Resume an existing session instead of starting a new one
    pub session_id: Option<String>,
}

/// WebSocket upgrade handler for `/ws/events`
pub async fn ws_events(
    ws: WebSocketUpgrade,
    State(state): State<FeatherState>,
    Query(query): Query<WsQuery>,
) -> impl IntoResponse {
    let session_id = query
        .session_id
        .filter(|s| !s.trim().is_empty())
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    ws.on_upgrade(move |socket| handle_ws(socket, state, session_id))
}

fn is_addressed_to(event: &SessionEvent, session_id: &str) -> bool {
    event.event_key == session_id
}

async fn handle_ws(socket: WebSocket, state: FeatherState, session_id: String) {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let mut event_rx = state.event_bus.subscribe();

    let hello = json!({ "sessionId": session_id }).to_string();
    if ws_sender.send(Message::Text(hello.into())).await.is_err() {
        debug!(session = %session_id, "WebSocket closed before handshake");
        return;
    }

    // Ping interval (30s)
    let mut ping_interval = interval(Duration::from_secs(30));
    ping_interval.tick().await;

    debug!(session = %session_id, "WebSocket events client connected");

    loop {
        tokio::select! {
            result = event_rx.recv() => {
                match result {
                    Ok(event) => {
                        if !is_addressed_to(&event, &session_id) {
                            continue;
                        }
                        match serde_json::to_string(&event) {
                            Ok(json) => {
                                if ws_sender.send(Message::Text(json.into())).await.is_err() {
                                    debug!("WebSocket send failed, client disconnected");
                                    break;
                                }
                            }
                            Err(e) => warn!("Failed to serialize SessionEvent: {}", e),
                        }
                    }
                    Err(RecvError::Lagged(n)) => {
                        warn!(skipped = n, session = %session_id, "WebSocket client lagged, skipping events");
                    }
                    Err(RecvError::Closed) => {
                        debug!("Event bus closed, shutting down WebSocket");
                        break;
                    }
                }
            }

            // Send periodic pings to detect dead clients
            _ = ping_interval.tick() => {
                if ws_sender.send(Message::Ping(vec![].into())).await.is_err() {
                    debug!("Ping failed, client disconnected");
                    break;
                }
            }

            msg = ws_receiver.next() => {
                match msg {
                    Some(Ok(Message::Close(_))) | None => {
                        debug!(session = %session_id, "WebSocket client disconnected");
                        break;
                    }
                    Some(Err(e)) => {
                        debug!("WebSocket error: {}", e);
                        break;
                    }
                    _ => {}
                }
            }
        }
    }

    if let Err(e) = state.datasource.release_session(&session_id).await {
        warn!(session = %session_id, error = %e, "Failed to release session");
    }
}
