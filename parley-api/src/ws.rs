//! WebSocket Event Streaming
//!
//! `GET /ws/sessions/{id}` upgrades to a WebSocket that carries the
//! session's live events as JSON frames. Only the session owner may
//! subscribe. Late subscribers receive only future events; a client
//! that lags more than the per-subscriber buffer is disconnected so it
//! cannot stall the producer. Disconnecting does NOT cancel an
//! in-flight turn — reconnecting clients catch up via history.

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Path, State, WebSocketUpgrade,
    },
    response::Response,
};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::{
    auth::{require_session_owner, AuthContext},
    error::ApiResult,
    state::AppState,
};
use parley_core::SessionId;
use parley_runtime::SessionEvent;

/// WebSocket upgrade handler for `/ws/sessions/{id}`.
pub async fn session_stream(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    auth: AuthContext,
    Path(id): Path<String>,
) -> ApiResult<Response> {
    let session_id = require_session_owner(&auth, &id)?;
    // Subscribe before upgrading so a missing session is an HTTP 404,
    // not a silently closed socket.
    let rx = state.orchestrator.subscribe(&session_id).await?;

    info!(session_id = %session_id, "websocket subscription");
    Ok(ws.on_upgrade(move |socket| handle_socket(socket, session_id, rx)))
}

async fn handle_socket(
    socket: WebSocket,
    session_id: SessionId,
    mut rx: broadcast::Receiver<SessionEvent>,
) {
    let (mut sender, mut receiver) = socket.split();

    // Drain client frames so pings are answered and closes observed.
    let mut recv_task = tokio::spawn(async move {
        while let Some(frame) = receiver.next().await {
            match frame {
                Ok(Message::Close(_)) | Err(_) => break,
                Ok(_) => {}
            }
        }
    });

    loop {
        tokio::select! {
            event = rx.recv() => match event {
                Ok(event) => {
                    let frame = match serde_json::to_string(&event) {
                        Ok(json) => json,
                        Err(e) => {
                            warn!(session_id = %session_id, error = %e, "event serialization failed");
                            continue;
                        }
                    };
                    if sender.send(Message::Text(frame)).await.is_err() {
                        debug!(session_id = %session_id, "client went away");
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    // Slow consumer: drop it rather than stall others.
                    warn!(session_id = %session_id, skipped, "subscriber lagged, disconnecting");
                    let _ = sender.send(Message::Close(None)).await;
                    break;
                }
                Err(broadcast::error::RecvError::Closed) => {
                    // Session closed or evicted; end the stream.
                    debug!(session_id = %session_id, "event bus closed");
                    let _ = sender.send(Message::Close(None)).await;
                    break;
                }
            },
            _ = &mut recv_task => {
                debug!(session_id = %session_id, "client disconnected");
                break;
            }
        }
    }

    recv_task.abort();
    info!(session_id = %session_id, "websocket closed");
}
