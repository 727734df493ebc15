use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use fieldcall_proto::SignalingMessage;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{Error as WsError, Message, error::ProtocolError},
};
use url::Url;

use super::{
    MessageHandler, SignalingTransport, TransportError, TransportEvent, TransportFactory,
    spawn_dispatcher,
};
use crate::config::SessionConfig;

const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

/// Relay link over a WebSocket at `{relay}/ws/{session_id}`.
pub struct WebSocketTransport {
    relay_url: Url,
    token: Option<String>,
    connect_timeout: Duration,
    connected: AtomicBool,
    closed: Arc<AtomicBool>,
    link: Mutex<Link>,
}

#[derive(Default)]
struct Link {
    session_id: Option<String>,
    outbound: Option<mpsc::UnboundedSender<Message>>,
    inbound: Option<mpsc::UnboundedReceiver<TransportEvent>>,
    handler_registered: bool,
    tasks: Vec<JoinHandle<()>>,
}

impl WebSocketTransport {
    pub fn new(relay_url: Url, token: Option<String>, connect_timeout: Duration) -> Self {
        Self {
            relay_url,
            token,
            connect_timeout,
            connected: AtomicBool::new(false),
            closed: Arc::new(AtomicBool::new(false)),
            link: Mutex::new(Link::default()),
        }
    }

    pub fn session_url(&self, session_id: &str) -> Result<Url, TransportError> {
        session_url(&self.relay_url, session_id, self.token.as_deref())
    }
}

pub(crate) fn session_url(
    relay_url: &Url,
    session_id: &str,
    token: Option<&str>,
) -> Result<Url, TransportError> {
    let mut url = relay_url.clone();
    match url.scheme() {
        "ws" | "wss" => {}
        "http" => {
            let _ = url.set_scheme("ws");
        }
        "https" => {
            let _ = url.set_scheme("wss");
        }
        other => {
            return Err(TransportError::Handshake(format!(
                "unsupported relay scheme {other}"
            )));
        }
    }
    {
        let mut segments = url
            .path_segments_mut()
            .map_err(|_| TransportError::Handshake("relay url cannot carry a path".into()))?;
        segments.pop_if_empty();
        segments.push("ws");
        segments.push(session_id);
    }
    if let Some(token) = token {
        url.query_pairs_mut().append_pair("token", token);
    }
    Ok(url)
}

#[async_trait]
impl SignalingTransport for WebSocketTransport {
    async fn connect(&self, session_id: &str) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        if let Some(existing) = self.link.lock().session_id.clone() {
            return Err(TransportError::AlreadyConnected(existing));
        }

        let url = self.session_url(session_id)?;
        let (ws_stream, _) = match tokio::time::timeout(
            self.connect_timeout,
            connect_async(url.as_str()),
        )
        .await
        {
            Ok(Ok(pair)) => pair,
            Ok(Err(err)) => {
                return Err(TransportError::Handshake(format!(
                    "websocket connect failed: {err}"
                )));
            }
            Err(_) => return Err(TransportError::Timeout(self.connect_timeout)),
        };
        tracing::debug!(
            target: "fieldcall::transport",
            session_id,
            relay = %self.relay_url,
            "signaling websocket connected"
        );

        let (mut ws_write, mut ws_read) = ws_stream.split();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();
        let (in_tx, in_rx) = mpsc::unbounded_channel::<TransportEvent>();

        let writer = tokio::spawn(async move {
            let mut keepalive = tokio::time::interval(KEEPALIVE_INTERVAL);
            keepalive.tick().await;
            loop {
                tokio::select! {
                    next = out_rx.recv() => {
                        let Some(message) = next else { break };
                        let closing = matches!(message, Message::Close(_));
                        if ws_write.send(message).await.is_err() || closing {
                            break;
                        }
                    }
                    _ = keepalive.tick() => {
                        if ws_write.send(Message::Ping(Vec::new())).await.is_err() {
                            break;
                        }
                    }
                }
            }
            let _ = ws_write.close().await;
        });

        let expected_session = session_id.to_string();
        let closed = Arc::clone(&self.closed);
        let reader = tokio::spawn(async move {
            let reason = loop {
                let Some(frame) = ws_read.next().await else {
                    break "relay stream ended".to_string();
                };
                let text = match frame {
                    Ok(Message::Text(text)) => text,
                    Ok(Message::Binary(data)) => match String::from_utf8(data) {
                        Ok(text) => text,
                        Err(_) => {
                            tracing::warn!(
                                target: "fieldcall::transport",
                                "dropping non-utf8 binary frame"
                            );
                            continue;
                        }
                    },
                    Ok(Message::Close(frame)) => {
                        break frame
                            .map(|f| f.reason.to_string())
                            .filter(|reason| !reason.is_empty())
                            .unwrap_or_else(|| "relay closed the connection".to_string());
                    }
                    Ok(_) => continue,
                    Err(err) => {
                        match &err {
                            WsError::ConnectionClosed
                            | WsError::AlreadyClosed
                            | WsError::Protocol(ProtocolError::ResetWithoutClosingHandshake) => {
                                tracing::debug!(
                                    target: "fieldcall::transport",
                                    "signaling websocket closed: {err}"
                                );
                            }
                            _ => {
                                tracing::warn!(
                                    target: "fieldcall::transport",
                                    "signaling websocket error: {err}"
                                );
                            }
                        }
                        break err.to_string();
                    }
                };
                tracing::trace!(
                    target: "fieldcall::transport",
                    event = "ws_in",
                    len = text.len()
                );
                match SignalingMessage::from_json(&text) {
                    Ok(message) if message.session_id() == expected_session => {
                        if in_tx.send(TransportEvent::Message(message)).is_err() {
                            return;
                        }
                    }
                    Ok(message) => {
                        tracing::warn!(
                            target: "fieldcall::transport",
                            expected = %expected_session,
                            got = %message.session_id(),
                            kind = message.kind(),
                            "dropping message for another session"
                        );
                    }
                    Err(err) => {
                        tracing::warn!(
                            target: "fieldcall::transport",
                            error = %err,
                            "dropping malformed signaling frame"
                        );
                    }
                }
            };
            if !closed.load(Ordering::SeqCst) {
                let _ = in_tx.send(TransportEvent::Disconnected { reason });
            }
        });

        let mut link = self.link.lock();
        if self.closed.load(Ordering::SeqCst) {
            writer.abort();
            reader.abort();
            return Err(TransportError::Closed);
        }
        // a concurrent connect finished its handshake first
        if let Some(existing) = link.session_id.clone() {
            writer.abort();
            reader.abort();
            return Err(TransportError::AlreadyConnected(existing));
        }
        link.session_id = Some(session_id.to_string());
        link.outbound = Some(out_tx);
        link.inbound = Some(in_rx);
        link.tasks.push(writer);
        link.tasks.push(reader);
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn send(&self, message: &SignalingMessage) -> Result<(), TransportError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(TransportError::NotConnected);
        }
        let text = message
            .to_json()
            .map_err(|err| TransportError::Encode(err.to_string()))?;
        let link = self.link.lock();
        let outbound = link.outbound.as_ref().ok_or(TransportError::NotConnected)?;
        outbound
            .send(Message::Text(text))
            .map_err(|_| TransportError::Closed)?;
        tracing::trace!(
            target: "fieldcall::transport",
            event = "ws_out",
            kind = message.kind()
        );
        Ok(())
    }

    fn on_message(&self, handler: MessageHandler) -> Result<(), TransportError> {
        let mut link = self.link.lock();
        if link.handler_registered {
            return Err(TransportError::HandlerRegistered);
        }
        let inbound = link.inbound.take().ok_or(TransportError::NotConnected)?;
        link.handler_registered = true;
        let pump = spawn_dispatcher(inbound, handler);
        link.tasks.push(pump);
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.connected.store(false, Ordering::SeqCst);
        let (outbound, tasks) = {
            let mut link = self.link.lock();
            (link.outbound.take(), std::mem::take(&mut link.tasks))
        };
        let mut writer_done = None;
        if let Some(outbound) = outbound {
            let _ = outbound.send(Message::Close(None));
        }
        for (index, task) in tasks.into_iter().enumerate() {
            // writer is always the first task; let it flush the close frame
            if index == 0 {
                writer_done = Some(task);
            } else {
                task.abort();
            }
        }
        if let Some(writer) = writer_done {
            let abort = writer.abort_handle();
            if tokio::time::timeout(Duration::from_secs(1), writer).await.is_err() {
                abort.abort();
                tracing::debug!(
                    target: "fieldcall::transport",
                    "writer did not finish close handshake in time"
                );
                return Err(TransportError::CloseIncomplete(
                    "close handshake timed out".into(),
                ));
            }
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

impl Drop for WebSocketTransport {
    fn drop(&mut self) {
        for task in self.link.get_mut().tasks.drain(..) {
            task.abort();
        }
    }
}

/// Builds a [`WebSocketTransport`] per session against one relay.
#[derive(Debug, Clone)]
pub struct WebSocketTransportFactory {
    relay_url: Url,
    token: Option<String>,
}

impl WebSocketTransportFactory {
    pub fn new(relay_url: Url) -> Self {
        Self {
            relay_url,
            token: None,
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }
}

impl TransportFactory for WebSocketTransportFactory {
    fn create(&self, config: &SessionConfig) -> Arc<dyn SignalingTransport> {
        Arc::new(WebSocketTransport::new(
            self.relay_url.clone(),
            self.token.clone(),
            config.connect_timeout,
        ))
    }
}
