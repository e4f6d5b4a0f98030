//! WebSocket event fan-out
//!
//! Subscribes to the engine bus and forwards every lifecycle event as a
//! `{type, data, timestamp}` envelope. Clients get a `connected` frame on
//! upgrade, a `heartbeat` every 30 seconds, and a `pong` for every
//! `{"type":"ping"}` they send. Delivery is best-effort; a lagging client
//! skips events rather than stalling the bus.

use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use chrono::Utc;
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::AppState;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

pub async fn ws_handler(State(state): State<AppState>, upgrade: WebSocketUpgrade) -> Response {
    upgrade.on_upgrade(move |socket| handle_socket(socket, state))
}

fn frame(kind: &str, data: Value) -> Message {
    Message::Text(
        json!({
            "type": kind,
            "data": data,
            "timestamp": Utc::now(),
        })
        .to_string(),
    )
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut sender, mut receiver) = socket.split();
    let mut bus_rx = state.manager.bus().subscribe();

    if sender.send(frame("connected", json!({}))).await.is_err() {
        return;
    }

    let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
    heartbeat.tick().await; // first tick is immediate

    loop {
        tokio::select! {
            _ = heartbeat.tick() => {
                if sender.send(frame("heartbeat", json!({}))).await.is_err() {
                    break;
                }
            }

            event = bus_rx.recv() => match event {
                Ok(event) => {
                    let envelope = event.envelope();
                    let text = match serde_json::to_string(&envelope) {
                        Ok(text) => text,
                        Err(e) => {
                            warn!(error = %e, "failed to serialize event envelope");
                            continue;
                        }
                    };
                    if sender.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(skipped, "websocket client lagged, events skipped");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },

            incoming = receiver.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    let is_ping = serde_json::from_str::<Value>(&text)
                        .ok()
                        .and_then(|v| v.get("type").and_then(Value::as_str).map(|t| t == "ping"))
                        .unwrap_or(false);
                    if is_ping && sender.send(frame("pong", json!({}))).await.is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(error = %e, "websocket receive error");
                    break;
                }
            },
        }
    }
}
