//! In-process relay with the same room semantics as `fieldcall-relay`, for
//! tests and demos that should not open sockets.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use fieldcall_proto::{Participant, SignalingMessage};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::{
    MessageHandler, SignalingTransport, TransportError, TransportEvent, TransportFactory,
    spawn_dispatcher,
};
use crate::config::SessionConfig;

const ROOM_CAPACITY: usize = 2;
const DEFAULT_BACKLOG: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnectMode {
    Accept,
    Refuse,
    Stall,
}

#[derive(Clone)]
pub struct MemoryRelay {
    inner: Arc<Mutex<RelayState>>,
}

struct RelayState {
    rooms: HashMap<String, Room>,
    mode: ConnectMode,
    fail_close: bool,
    backlog_limit: usize,
    next_peer: u64,
    history: HashMap<String, Vec<SignalingMessage>>,
}

#[derive(Default)]
struct Room {
    members: Vec<Member>,
    backlog: VecDeque<SignalingMessage>,
}

struct Member {
    peer_id: String,
    tx: mpsc::UnboundedSender<TransportEvent>,
}

impl Default for MemoryRelay {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRelay {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(RelayState {
                rooms: HashMap::new(),
                mode: ConnectMode::Accept,
                fail_close: false,
                backlog_limit: DEFAULT_BACKLOG,
                next_peer: 0,
                history: HashMap::new(),
            })),
        }
    }

    pub fn with_backlog_limit(self, limit: usize) -> Self {
        self.inner.lock().backlog_limit = limit;
        self
    }

    /// Subsequent connects fail the handshake.
    pub fn refuse_connections(&self) {
        self.inner.lock().mode = ConnectMode::Refuse;
    }

    /// Subsequent connects never complete on their own.
    pub fn stall_connections(&self) {
        self.inner.lock().mode = ConnectMode::Stall;
    }

    pub fn accept_connections(&self) {
        self.inner.lock().mode = ConnectMode::Accept;
    }

    /// Transports still leave their room on `close`, but report the close
    /// as incomplete.
    pub fn fail_closes(&self) {
        self.inner.lock().fail_close = true;
    }

    pub fn transport(&self, connect_timeout: Duration) -> MemoryTransport {
        MemoryTransport {
            relay: self.clone(),
            connect_timeout,
            connected: AtomicBool::new(false),
            closed: Arc::new(AtomicBool::new(false)),
            link: Mutex::new(MemoryLink::default()),
        }
    }

    pub fn participants(&self, session_id: &str) -> usize {
        self.inner
            .lock()
            .rooms
            .get(session_id)
            .map(|room| room.members.len())
            .unwrap_or(0)
    }

    /// Every message the relay accepted for `session_id`, in order.
    pub fn forwarded(&self, session_id: &str) -> Vec<SignalingMessage> {
        self.inner
            .lock()
            .history
            .get(session_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Simulates the relay dropping one participant's connection.
    pub fn drop_peer(&self, session_id: &str, peer_id: &str) {
        let dropped = {
            let mut state = self.inner.lock();
            state.rooms.get_mut(session_id).and_then(|room| {
                let index = room.members.iter().position(|m| m.peer_id == peer_id)?;
                Some(room.members.remove(index))
            })
        };
        if let Some(member) = dropped {
            let _ = member.tx.send(TransportEvent::Disconnected {
                reason: "relay dropped the connection".to_string(),
            });
            self.leave(session_id, peer_id);
        }
    }

    fn join(
        &self,
        session_id: &str,
    ) -> Result<(String, mpsc::UnboundedReceiver<TransportEvent>), TransportError> {
        let mut state = self.inner.lock();
        match state.mode {
            ConnectMode::Refuse => {
                return Err(TransportError::Handshake("relay refused connection".into()));
            }
            ConnectMode::Stall => {
                return Err(TransportError::Handshake("relay is not accepting".into()));
            }
            ConnectMode::Accept => {}
        }
        state.next_peer += 1;
        let peer_id = format!("peer-{}", state.next_peer);
        let room = state.rooms.entry(session_id.to_string()).or_default();
        if room.members.len() >= ROOM_CAPACITY {
            return Err(TransportError::Handshake("session full".into()));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        for existing in &room.members {
            let _ = existing.tx.send(TransportEvent::Message(SignalingMessage::UserJoined {
                session_id: session_id.to_string(),
                payload: Participant {
                    peer_id: peer_id.clone(),
                    role: None,
                },
            }));
            let _ = tx.send(TransportEvent::Message(SignalingMessage::UserJoined {
                session_id: session_id.to_string(),
                payload: Participant {
                    peer_id: existing.peer_id.clone(),
                    role: None,
                },
            }));
        }
        for held in room.backlog.drain(..) {
            let _ = tx.send(TransportEvent::Message(held));
        }
        room.members.push(Member {
            peer_id: peer_id.clone(),
            tx,
        });
        Ok((peer_id, rx))
    }

    fn forward(&self, session_id: &str, from: &str, message: SignalingMessage) {
        let mut guard = self.inner.lock();
        let state = &mut *guard;
        let Some(room) = state.rooms.get_mut(session_id) else {
            return;
        };
        state
            .history
            .entry(session_id.to_string())
            .or_default()
            .push(message.clone());
        let mut delivered = false;
        for member in room.members.iter().filter(|m| m.peer_id != from) {
            delivered |= member
                .tx
                .send(TransportEvent::Message(message.clone()))
                .is_ok();
        }
        if !delivered {
            if room.backlog.len() >= state.backlog_limit {
                room.backlog.pop_front();
                tracing::warn!(
                    target: "fieldcall::transport",
                    session_id,
                    "memory relay backlog full; dropping oldest message"
                );
            }
            room.backlog.push_back(message);
        }
    }

    fn leave(&self, session_id: &str, peer_id: &str) {
        let mut state = self.inner.lock();
        let Some(room) = state.rooms.get_mut(session_id) else {
            return;
        };
        room.members.retain(|m| m.peer_id != peer_id);
        for member in &room.members {
            let _ = member.tx.send(TransportEvent::Message(SignalingMessage::UserLeft {
                session_id: session_id.to_string(),
                payload: Participant {
                    peer_id: peer_id.to_string(),
                    role: None,
                },
            }));
        }
        if room.members.is_empty() {
            state.rooms.remove(session_id);
        }
    }

    fn is_member(&self, session_id: &str, peer_id: &str) -> bool {
        self.inner
            .lock()
            .rooms
            .get(session_id)
            .is_some_and(|room| room.members.iter().any(|m| m.peer_id == peer_id))
    }

    fn mode(&self) -> ConnectMode {
        self.inner.lock().mode
    }
}

impl TransportFactory for MemoryRelay {
    fn create(&self, config: &SessionConfig) -> Arc<dyn SignalingTransport> {
        Arc::new(self.transport(config.connect_timeout))
    }
}

#[derive(Default)]
struct MemoryLink {
    session_id: Option<String>,
    peer_id: Option<String>,
    inbound: Option<mpsc::UnboundedReceiver<TransportEvent>>,
    handler_registered: bool,
    pump: Option<JoinHandle<()>>,
}

pub struct MemoryTransport {
    relay: MemoryRelay,
    connect_timeout: Duration,
    connected: AtomicBool,
    closed: Arc<AtomicBool>,
    link: Mutex<MemoryLink>,
}

impl MemoryTransport {
    pub fn peer_id(&self) -> Option<String> {
        self.link.lock().peer_id.clone()
    }
}

impl std::fmt::Debug for MemoryTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryTransport")
            .field("connected", &self.connected.load(Ordering::SeqCst))
            .finish()
    }
}

#[async_trait]
impl SignalingTransport for MemoryTransport {
    async fn connect(&self, session_id: &str) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        if let Some(existing) = self.link.lock().session_id.clone() {
            return Err(TransportError::AlreadyConnected(existing));
        }
        if self.relay.mode() == ConnectMode::Stall {
            tokio::time::sleep(self.connect_timeout).await;
            return Err(TransportError::Timeout(self.connect_timeout));
        }

        let (peer_id, rx) = self.relay.join(session_id)?;
        let mut link = self.link.lock();
        if self.closed.load(Ordering::SeqCst) {
            drop(link);
            self.relay.leave(session_id, &peer_id);
            return Err(TransportError::Closed);
        }
        if let Some(existing) = link.session_id.clone() {
            drop(link);
            self.relay.leave(session_id, &peer_id);
            return Err(TransportError::AlreadyConnected(existing));
        }
        link.session_id = Some(session_id.to_string());
        link.peer_id = Some(peer_id);
        link.inbound = Some(rx);
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn send(&self, message: &SignalingMessage) -> Result<(), TransportError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(TransportError::NotConnected);
        }
        let (session_id, peer_id) = {
            let link = self.link.lock();
            match (link.session_id.clone(), link.peer_id.clone()) {
                (Some(session_id), Some(peer_id)) => (session_id, peer_id),
                _ => return Err(TransportError::NotConnected),
            }
        };
        if !self.relay.is_member(&session_id, &peer_id) {
            self.connected.store(false, Ordering::SeqCst);
            return Err(TransportError::Closed);
        }
        self.relay.forward(&session_id, &peer_id, message.clone());
        Ok(())
    }

    fn on_message(&self, handler: MessageHandler) -> Result<(), TransportError> {
        let mut link = self.link.lock();
        if link.handler_registered {
            return Err(TransportError::HandlerRegistered);
        }
        let inbound = link.inbound.take().ok_or(TransportError::NotConnected)?;
        link.handler_registered = true;
        link.pump = Some(spawn_dispatcher(inbound, handler));
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.connected.store(false, Ordering::SeqCst);
        let (session_id, peer_id, pump) = {
            let mut link = self.link.lock();
            (link.session_id.clone(), link.peer_id.clone(), link.pump.take())
        };
        if let Some(pump) = pump {
            pump.abort();
        }
        if let (Some(session_id), Some(peer_id)) = (session_id, peer_id) {
            self.relay.leave(&session_id, &peer_id);
        }
        if self.relay.inner.lock().fail_close {
            return Err(TransportError::CloseIncomplete(
                "relay did not acknowledge close".into(),
            ));
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fieldcall_proto::{IceCandidate, SessionDescription};

    fn collect(transport: &MemoryTransport) -> mpsc::UnboundedReceiver<TransportEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        transport
            .on_message(Box::new(move |event| {
                let _ = tx.send(event);
            }))
            .expect("handler");
        rx
    }

    async fn next_message(rx: &mut mpsc::UnboundedReceiver<TransportEvent>) -> SignalingMessage {
        match tokio::time::timeout(Duration::from_secs(1), rx.recv()).await {
            Ok(Some(TransportEvent::Message(message))) => message,
            other => panic!("expected a message, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn backlog_is_delivered_in_order_when_peer_joins() {
        let relay = MemoryRelay::new();
        let first = relay.transport(Duration::from_secs(1));
        first.connect("s1").await.expect("connect");

        let offer = SignalingMessage::description("s1", SessionDescription::offer("v=0\r\n"));
        let candidate = SignalingMessage::candidate("s1", IceCandidate::new("candidate:1"));
        first.send(&offer).expect("send offer");
        first.send(&candidate).expect("send candidate");

        let second = relay.transport(Duration::from_secs(1));
        second.connect("s1").await.expect("connect");
        let mut rx = collect(&second);

        assert!(matches!(next_message(&mut rx).await, SignalingMessage::UserJoined { .. }));
        assert_eq!(next_message(&mut rx).await, offer);
        assert_eq!(next_message(&mut rx).await, candidate);
    }

    #[tokio::test]
    async fn third_participant_is_turned_away() {
        let relay = MemoryRelay::new();
        let a = relay.transport(Duration::from_secs(1));
        let b = relay.transport(Duration::from_secs(1));
        let c = relay.transport(Duration::from_secs(1));
        a.connect("s1").await.expect("a");
        b.connect("s1").await.expect("b");
        assert_eq!(
            c.connect("s1").await,
            Err(TransportError::Handshake("session full".into()))
        );
        assert_eq!(relay.participants("s1"), 2);
    }

    #[tokio::test]
    async fn close_notifies_remaining_peer_and_is_idempotent() {
        let relay = MemoryRelay::new();
        let a = relay.transport(Duration::from_secs(1));
        let b = relay.transport(Duration::from_secs(1));
        a.connect("s1").await.expect("a");
        b.connect("s1").await.expect("b");
        let mut rx = collect(&b);
        assert!(matches!(next_message(&mut rx).await, SignalingMessage::UserJoined { .. }));

        a.close().await.expect("close");
        a.close().await.expect("close again");
        assert!(matches!(next_message(&mut rx).await, SignalingMessage::UserLeft { .. }));
        assert_eq!(
            a.send(&SignalingMessage::ended("s1", None)),
            Err(TransportError::NotConnected)
        );
    }

    #[tokio::test]
    async fn stalled_connect_times_out() {
        let relay = MemoryRelay::new();
        relay.stall_connections();
        let transport = relay.transport(Duration::from_millis(50));
        assert_eq!(
            transport.connect("s1").await,
            Err(TransportError::Timeout(Duration::from_millis(50)))
        );
    }

    #[tokio::test]
    async fn concurrent_connects_admit_one_link() {
        let relay = MemoryRelay::new();
        let transport = relay.transport(Duration::from_secs(1));
        let (first, second) = tokio::join!(transport.connect("s1"), transport.connect("s1"));
        let results = [first, second];
        assert_eq!(results.iter().filter(|result| result.is_ok()).count(), 1);
        assert!(results.contains(&Err(TransportError::AlreadyConnected("s1".into()))));
        assert_eq!(relay.participants("s1"), 1);
    }

    #[tokio::test]
    async fn failing_close_still_leaves_the_room() {
        let relay = MemoryRelay::new();
        relay.fail_closes();
        let transport = relay.transport(Duration::from_secs(1));
        transport.connect("s1").await.expect("connect");
        assert!(matches!(
            transport.close().await,
            Err(TransportError::CloseIncomplete(_))
        ));
        assert_eq!(relay.participants("s1"), 0);
        assert!(!transport.is_connected());
    }

    #[tokio::test]
    async fn dropped_peer_sees_disconnect() {
        let relay = MemoryRelay::new();
        let a = relay.transport(Duration::from_secs(1));
        a.connect("s1").await.expect("a");
        let peer_id = a.peer_id().expect("peer id");
        let mut rx = collect(&a);
        relay.drop_peer("s1", &peer_id);
        match tokio::time::timeout(Duration::from_secs(1), rx.recv()).await {
            Ok(Some(TransportEvent::Disconnected { .. })) => {}
            other => panic!("expected disconnect, got {other:?}"),
        }
    }
}
