//! Live log streaming over WebSocket.
//!
//! One socket per repository. The client receives JSON-encoded log entries
//! produced after it attached; history is served by the HTTP endpoint. A
//! slow client lags and loses the oldest entries rather than slowing the
//! process whose output is being captured.

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Path, State, WebSocketUpgrade};
use axum::response::Response;
use futures::{SinkExt, StreamExt};
use log::{debug, warn};
use serde_json::json;
use tokio::sync::broadcast;

use super::error::ApiError;
use super::state::AppState;

/// GET /repositories/{id}/logs/ws
pub async fn logs_ws(
    State(state): State<AppState>,
    Path(id): Path<String>,
    ws: WebSocketUpgrade,
) -> Result<Response, ApiError> {
    // The sink outlives sessions, so attaching before the first spawn or
    // between restarts is fine.
    let sink = state
        .manager
        .logs()
        .sink_for(&id)
        .await
        .map_err(|e| ApiError::internal(e.to_string()))?;

    let rx = sink.subscribe();
    Ok(ws.on_upgrade(move |socket| stream_logs(socket, id, rx)))
}

async fn stream_logs(
    socket: WebSocket,
    repository_id: String,
    mut rx: broadcast::Receiver<crate::runtime::LogEntry>,
) {
    debug!("Log subscriber attached for repository {}", repository_id);
    let (mut sender, mut receiver) = socket.split();

    loop {
        tokio::select! {
            entry = rx.recv() => {
                let text = match entry {
                    Ok(entry) => match serde_json::to_string(&entry) {
                        Ok(json) => json,
                        Err(e) => {
                            warn!("Failed to serialize log entry: {}", e);
                            continue;
                        }
                    },
                    Err(broadcast::error::RecvError::Lagged(dropped)) => {
                        // Keep streaming; tell the client what it missed.
                        json!({
                            "stream": "system",
                            "line": format!("{} log entries dropped (slow consumer)", dropped),
                        })
                        .to_string()
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                if sender.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    // Inbound content is ignored; this stream is one-way.
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    debug!("Log subscriber detached for repository {}", repository_id);
}
