//! Signaling transport: a message-oriented link to the relay, scoped to one
//! session id.
//!
//! Transports never queue outbound messages on behalf of the caller. `send`
//! before `connect` resolves fails with [`TransportError::NotConnected`]; any
//! buffering policy belongs to the session controller.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use fieldcall_proto::SignalingMessage;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::config::SessionConfig;

pub mod memory;
pub mod websocket;

pub use memory::{MemoryRelay, MemoryTransport};
pub use websocket::{WebSocketTransport, WebSocketTransportFactory};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("signaling handshake timed out after {0:?}")]
    Timeout(Duration),
    #[error("signaling handshake failed: {0}")]
    Handshake(String),
    #[error("signaling transport is not connected")]
    NotConnected,
    #[error("signaling transport already connected to session {0}")]
    AlreadyConnected(String),
    #[error("signaling transport closed")]
    Closed,
    #[error("message handler already registered")]
    HandlerRegistered,
    #[error("failed to encode signaling message: {0}")]
    Encode(String),
    #[error("signaling transport did not close cleanly: {0}")]
    CloseIncomplete(String),
}

/// What a registered handler observes, in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Message(SignalingMessage),
    /// The relay link went away without a local `close()`.
    Disconnected { reason: String },
}

pub type MessageHandler = Box<dyn FnMut(TransportEvent) + Send + 'static>;

#[async_trait]
pub trait SignalingTransport: Send + Sync {
    /// Opens the relay link for `session_id`.
    async fn connect(&self, session_id: &str) -> Result<(), TransportError>;

    /// Transmits immediately; fails rather than buffering when not connected.
    fn send(&self, message: &SignalingMessage) -> Result<(), TransportError>;

    /// Registers the single dispatcher for inbound traffic. Messages that
    /// arrived earlier are delivered first.
    fn on_message(&self, handler: MessageHandler) -> Result<(), TransportError>;

    /// Idempotent.
    async fn close(&self) -> Result<(), TransportError>;

    fn is_connected(&self) -> bool;
}

/// Creates one transport per session.
pub trait TransportFactory: Send + Sync {
    fn create(&self, config: &SessionConfig) -> Arc<dyn SignalingTransport>;
}

/// Drains `rx` into `handler` on a dedicated task so the handler runs once
/// per event, never concurrently with itself.
pub(crate) fn spawn_dispatcher(
    mut rx: mpsc::UnboundedReceiver<TransportEvent>,
    mut handler: MessageHandler,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            handler(event);
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use fieldcall_proto::EndNotice;

    #[tokio::test]
    async fn dispatcher_preserves_arrival_order() {
        let (tx, rx) = mpsc::unbounded_channel();
        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
        for n in 0..4 {
            tx.send(TransportEvent::Message(SignalingMessage::SessionEnded {
                session_id: format!("s{n}"),
                payload: EndNotice::default(),
            }))
            .expect("queue");
        }
        drop(tx);
        let handle = spawn_dispatcher(
            rx,
            Box::new(move |event| {
                if let TransportEvent::Message(message) = event {
                    let _ = seen_tx.send(message.session_id().to_string());
                }
            }),
        );
        handle.await.expect("dispatcher");
        let mut seen = Vec::new();
        while let Ok(id) = seen_rx.try_recv() {
            seen.push(id);
        }
        assert_eq!(seen, vec!["s0", "s1", "s2", "s3"]);
    }
}
