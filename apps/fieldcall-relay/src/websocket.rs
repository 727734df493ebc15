use std::borrow::Cow;
use std::sync::Arc;

use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message, WebSocket},
        Path, Query, State, WebSocketUpgrade,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::relay::{Forwarded, Relay, RelayError};

#[derive(Clone)]
pub struct AppState {
    pub relay: Relay,
    pub token: Option<Arc<str>>,
}

#[derive(Debug, Deserialize)]
pub struct ConnectQuery {
    token: Option<String>,
}

/// `GET /ws/:session_id[?token=...]`
pub async fn websocket_handler(
    ws: WebSocketUpgrade,
    Path(session_id): Path<String>,
    Query(query): Query<ConnectQuery>,
    State(state): State<AppState>,
) -> Response {
    if let Some(expected) = &state.token {
        if query.token.as_deref() != Some(expected.as_ref()) {
            warn!(target: "fieldcall_relay::ws", session_id = %session_id, "rejected connection without a valid token");
            return StatusCode::UNAUTHORIZED.into_response();
        }
    }
    ws.on_upgrade(move |socket| handle_socket(socket, session_id, state.relay))
}

pub async fn health_check() -> &'static str {
    "ok"
}

async fn handle_socket(mut socket: WebSocket, session_id: String, relay: Relay) {
    let (peer_id, mut rx) = match relay.admit(&session_id) {
        Ok(admitted) => admitted,
        Err(err) => {
            info!(target: "fieldcall_relay::ws", session_id = %session_id, error = %err, "turning connection away");
            let _ = socket
                .send(Message::Close(Some(CloseFrame {
                    code: close_code::POLICY,
                    reason: Cow::Owned(err.to_string()),
                })))
                .await;
            return;
        }
    };
    let (mut sender, mut receiver) = socket.split();

    let writer_peer = peer_id.clone();
    let writer = tokio::spawn(async move {
        while let Some(text) = rx.recv().await {
            if sender.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
        let _ = sender.close().await;
        debug!(target: "fieldcall_relay::ws", peer_id = %writer_peer, "writer finished");
    });

    while let Some(frame) = receiver.next().await {
        let text = match frame {
            Ok(Message::Text(text)) => text,
            Ok(Message::Binary(data)) => match String::from_utf8(data) {
                Ok(text) => text,
                Err(_) => {
                    debug!(target: "fieldcall_relay::ws", peer_id = %peer_id, "ignoring non-utf8 binary frame");
                    continue;
                }
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(err) => {
                debug!(target: "fieldcall_relay::ws", peer_id = %peer_id, error = %err, "websocket error");
                break;
            }
        };
        match relay.forward(&session_id, &peer_id, &text) {
            Ok(Forwarded::Delivered) => {}
            Ok(Forwarded::Held) => {
                debug!(target: "fieldcall_relay::ws", session_id = %session_id, "holding message until a peer joins");
            }
            Err(RelayError::UnknownPeer(_)) => break,
            Err(err) => {
                warn!(
                    target: "fieldcall_relay::ws",
                    session_id = %session_id,
                    peer_id = %peer_id,
                    error = %err,
                    "message not forwarded"
                );
            }
        }
    }

    relay.leave(&session_id, &peer_id);
    // leave dropped our sender half; the writer drains and exits
    let _ = writer.await;
    debug!(target: "fieldcall_relay::ws", peer_id = %peer_id, session_id = %session_id, "connection closed");
}
