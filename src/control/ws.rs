//! WebSocket relay for operator UIs.
//!
//! On connect the client receives an `init` snapshot (pending requests,
//! recent history, config, rules). After that, queue lifecycle events
//! and rule changes are relayed as they happen, and the client may send
//! `approve`/`deny` commands that run the same flows as the REST
//! endpoints, including the filesystem apply-before-approve step.
//!
//! Sends are best-effort: a failed send ends the writer task and the
//! connection's event relay with it; nothing upstream blocks on a slow
//! client.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};

use super::state::{AppState, ApproveError, ServerEvent};
use crate::queue::{QueueEvent, ResolvedBy, DEFAULT_RECENT_LIMIT};

pub async fn ws_handler(
    State(state): State<Arc<AppState>>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ClientCommand {
    #[serde(rename = "type")]
    kind: String,
    id: Option<String>,
    resolved_by: Option<String>,
    #[serde(default)]
    always_allow: bool,
    #[serde(default)]
    always_deny: bool,
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    debug!("WebSocket client connected");

    let (ws_sender, mut ws_receiver) = socket.split();
    let (tx, rx) = mpsc::channel::<String>(64);
    let writer_task = tokio::spawn(write_outbound(ws_sender, rx));

    // Subscribe before snapshotting so nothing falls between the init
    // payload and the event stream (a duplicate is harmless, a gap is
    // not).
    let mut queue_events = state.queue.subscribe();
    let mut server_events = state.events.subscribe();

    let init = json!({
        "type": "init",
        "data": {
            "pending": state.queue.pending(),
            "recent": state.queue.recent(DEFAULT_RECENT_LIMIT),
            "config": state.config.get(),
            "rules": state.config.rules(),
        }
    });
    if tx.send(init.to_string()).await.is_err() {
        return;
    }

    loop {
        tokio::select! {
            inbound = ws_receiver.next() => {
                let text = match inbound {
                    Some(Ok(Message::Text(text))) => text.to_string(),
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(_)) => break,
                    _ => continue,
                };
                if let Some(reply) = handle_command(&state, &text) {
                    if tx.send(reply).await.is_err() {
                        break;
                    }
                }
            }
            event = queue_events.recv() => {
                match event {
                    Ok(QueueEvent::Request(request)) => {
                        let msg = json!({"type": "request", "data": request});
                        if tx.send(msg.to_string()).await.is_err() {
                            break;
                        }
                    }
                    Ok(QueueEvent::Resolve(request)) => {
                        let msg = json!({"type": "resolve", "data": request});
                        if tx.send(msg.to_string()).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("WebSocket relay lagged, skipped {} events", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            event = server_events.recv() => {
                match event {
                    Ok(ServerEvent::Rules(rules)) => {
                        let msg = json!({"type": "rules", "data": rules});
                        if tx.send(msg.to_string()).await.is_err() {
                            break;
                        }
                    }
                    Ok(ServerEvent::Shutdown { reason }) => {
                        let msg = json!({"type": "shutdown", "data": {"reason": reason}});
                        let _ = tx.send(msg.to_string()).await;
                        break;
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }

    drop(tx);
    let _ = writer_task.await;
    debug!("WebSocket client disconnected");
}

/// Run one client command. Returns an error frame to send back, if any.
fn handle_command(state: &AppState, text: &str) -> Option<String> {
    let command: ClientCommand = match serde_json::from_str(text) {
        Ok(command) => command,
        Err(e) => {
            return Some(json!({"type": "error", "data": {"error": format!("invalid message: {}", e)}}).to_string());
        }
    };

    let Some(id) = command.id else {
        return Some(json!({"type": "error", "data": {"error": "missing id"}}).to_string());
    };
    let resolved_by = command
        .resolved_by
        .as_deref()
        .and_then(|v| v.parse().ok())
        .unwrap_or(ResolvedBy::Web);

    match command.kind.as_str() {
        "approve" => match state.approve(&id, resolved_by, command.always_allow) {
            Ok(()) => None,
            Err(ApproveError::NotPending) => Some(
                json!({"type": "error", "data": {"id": id, "error": "no pending request"}})
                    .to_string(),
            ),
            Err(ApproveError::Conflict(error)) => Some(
                json!({"type": "error", "data": {"id": id, "error": error}}).to_string(),
            ),
        },
        "deny" => {
            if state.deny(&id, resolved_by, command.always_deny) {
                None
            } else {
                Some(
                    json!({"type": "error", "data": {"id": id, "error": "no pending request"}})
                        .to_string(),
                )
            }
        }
        other => Some(
            json!({"type": "error", "data": {"error": format!("unknown command: {}", other)}})
                .to_string(),
        ),
    }
}

async fn write_outbound(
    mut ws_sender: SplitSink<WebSocket, Message>,
    mut rx: mpsc::Receiver<String>,
) {
    while let Some(message) = rx.recv().await {
        if ws_sender.send(Message::text(message)).await.is_err() {
            break;
        }
    }
}
