use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use event_bus::{Bus, LocalBus, Subscription};
use fieldcall_proto::{ChatMessage, Participant, Role, SignalingMessage};
use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, mpsc, watch};
use tokio::task::JoinHandle;

use super::chat::ChatChannel;
use super::media::MediaPipeline;
use super::negotiator::SessionNegotiator;
use super::{Session, SessionState};
use crate::backend::ConsultationBackend;
use crate::config::SessionConfig;
use crate::error::SessionError;
use crate::peer::{IceConnectionState, MediaCapturePrimitive, PeerEvent, PeerFactory, TrackKind};
use crate::transport::{SignalingTransport, TransportError, TransportEvent, TransportFactory};

/// Outcome of one cleanup step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    Completed,
    Failed(String),
}

impl StepOutcome {
    fn from_result<E: std::fmt::Display>(step: &'static str, result: Result<(), E>) -> Self {
        match result {
            Ok(()) => StepOutcome::Completed,
            Err(err) => {
                tracing::warn!(target: "fieldcall::session", step, error = %err, "cleanup step failed");
                StepOutcome::Failed(err.to_string())
            }
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, StepOutcome::Completed)
    }
}

/// What teardown did with each resource. Every step runs even when an
/// earlier one fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TeardownReport {
    pub session_id: Option<String>,
    /// Releasing tracks cannot fail, so this is always `Completed`;
    /// `tracks_stopped` says how much it did.
    pub media: StepOutcome,
    pub tracks_stopped: usize,
    pub chat: StepOutcome,
    pub negotiator: StepOutcome,
    pub transport: StepOutcome,
}

impl TeardownReport {
    pub fn is_clean(&self) -> bool {
        self.media.is_completed()
            && self.chat.is_completed()
            && self.negotiator.is_completed()
            && self.transport.is_completed()
    }
}

#[derive(Debug, Clone)]
pub enum SessionEvent {
    StateChanged {
        from: SessionState,
        to: SessionState,
    },
    Error(SessionError),
    PeerJoined(Participant),
    PeerLeft(Participant),
    RemoteTrack {
        kind: TrackKind,
        track_id: String,
    },
    TornDown(TeardownReport),
}

/// External collaborators a controller is built from.
pub struct Collaborators {
    pub transports: Arc<dyn TransportFactory>,
    pub peers: Arc<dyn PeerFactory>,
    pub capture: Arc<dyn MediaCapturePrimitive>,
    pub backend: Option<Arc<dyn ConsultationBackend>>,
}

/// Why a setup step stopped early.
enum Abort {
    Cancelled,
    Failed(SessionError),
}

impl From<SessionError> for Abort {
    fn from(err: SessionError) -> Self {
        Abort::Failed(err)
    }
}

/// Orchestrates one consultation at a time: transport, negotiation, media,
/// chat and teardown.
///
/// Cheap to clone; clones drive the same session.
#[derive(Clone)]
pub struct SessionController {
    inner: Arc<Inner>,
}

struct Inner {
    config: SessionConfig,
    transports: Arc<dyn TransportFactory>,
    peers: Arc<dyn PeerFactory>,
    backend: Option<Arc<dyn ConsultationBackend>>,
    media: AsyncMutex<MediaPipeline>,
    chat: ChatChannel,
    state: watch::Sender<SessionState>,
    events: LocalBus<SessionEvent>,
    /// Bumped on every start and every teardown; work tagged with an older
    /// value is stale and must not touch the session.
    generation: AtomicU64,
    negotiator: AsyncMutex<Option<SessionNegotiator>>,
    control: Mutex<Control>,
    last_teardown: Mutex<Option<TeardownReport>>,
}

#[derive(Default)]
struct Control {
    session: Option<Session>,
    cancel: Option<watch::Sender<bool>>,
    transport: Option<Arc<dyn SignalingTransport>>,
    tasks: Vec<JoinHandle<()>>,
}

impl SessionController {
    pub fn new(config: SessionConfig, collaborators: Collaborators) -> Self {
        let media = MediaPipeline::new(collaborators.capture, config.media);
        let (state, _) = watch::channel(SessionState::Idle);
        Self {
            inner: Arc::new(Inner {
                config,
                transports: collaborators.transports,
                peers: collaborators.peers,
                backend: collaborators.backend,
                media: AsyncMutex::new(media),
                chat: ChatChannel::new(Role::Initiator),
                state,
                events: LocalBus::new(),
                generation: AtomicU64::new(0),
                negotiator: AsyncMutex::new(None),
                control: Mutex::new(Control::default()),
                last_teardown: Mutex::new(None),
            }),
        }
    }

    pub fn state(&self) -> SessionState {
        *self.inner.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.inner.state.subscribe()
    }

    /// Resolves once the state satisfies `pred`, or `None` after `timeout`.
    pub async fn wait_for_state<F>(&self, timeout: Duration, pred: F) -> Option<SessionState>
    where
        F: FnMut(&SessionState) -> bool,
    {
        let mut rx = self.watch_state();
        match tokio::time::timeout(timeout, rx.wait_for(pred)).await {
            Ok(Ok(state)) => Some(*state),
            _ => None,
        }
    }

    pub fn subscribe(&self) -> Subscription<SessionEvent> {
        self.inner.events.subscribe()
    }

    pub fn session(&self) -> Option<Session> {
        self.inner.control.lock().session.clone()
    }

    pub fn last_teardown(&self) -> Option<TeardownReport> {
        self.inner.last_teardown.lock().clone()
    }

    /// Runs `handler` for every error the session reports from now on.
    pub fn on_error<F>(&self, mut handler: F) -> JoinHandle<()>
    where
        F: FnMut(SessionError) + Send + 'static,
    {
        let mut events = self.subscribe();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if let SessionEvent::Error(err) = event {
                    handler(err);
                }
            }
        })
    }

    /// Registers the single inbound chat handler.
    pub fn on_chat_message<F>(&self, handler: F)
    where
        F: FnMut(ChatMessage) + Send + 'static,
    {
        self.inner.chat.on_message(handler);
    }

    /// `false` when the data channel is not open; nothing is queued.
    pub async fn send_chat(&self, text: impl Into<String>) -> bool {
        self.inner.chat.send(text).await
    }

    pub async fn try_send_chat(&self, text: impl Into<String>) -> Result<(), SessionError> {
        let message = ChatMessage::new(text, self.inner.chat.role());
        self.inner.chat.try_send(&message).await
    }

    pub fn chat_open(&self) -> bool {
        self.inner.chat.is_open()
    }

    pub async fn toggle_video(&self) -> Option<bool> {
        self.inner.media.lock().await.toggle_video()
    }

    pub async fn toggle_audio(&self) -> Option<bool> {
        self.inner.media.lock().await.toggle_audio()
    }

    /// Remote candidates still waiting for the remote description.
    pub async fn queued_candidates(&self) -> usize {
        self.inner
            .negotiator
            .lock()
            .await
            .as_ref()
            .map_or(0, SessionNegotiator::queued_candidates)
    }

    /// Connects to the relay, prepares the peer connection and local media,
    /// and (as initiator) sends the offer. Returns once negotiation is under
    /// way; `active` follows when connectivity is established.
    ///
    /// If the session is ended while this is in progress, setup stops and
    /// this returns `Ok(())` with the controller in `closed`.
    pub async fn start_session(&self, session_id: &str, role: Role) -> Result<(), SessionError> {
        let (generation, cancel) = {
            let mut control = self.inner.control.lock();
            let mut from = SessionState::Idle;
            let moved = self.inner.state.send_if_modified(|state| {
                from = *state;
                if state.can_start() {
                    *state = SessionState::Connecting;
                    true
                } else {
                    false
                }
            });
            if !moved {
                return Err(SessionError::in_state("start_session", from));
            }
            let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
            let (cancel_tx, cancel_rx) = watch::channel(false);
            control.session = Some(Session::new(session_id, role));
            control.cancel = Some(cancel_tx);
            control.transport = None;
            control.tasks.clear();
            self.inner.chat.reopen(role);
            self.publish_transition(from, SessionState::Connecting);
            (generation, cancel_rx)
        };
        tracing::info!(
            target: "fieldcall::session",
            session_id,
            role = role.as_str(),
            "starting session"
        );

        match self.establish(generation, session_id, role, cancel).await {
            Ok(()) => Ok(()),
            Err(Abort::Cancelled) => {
                tracing::debug!(target: "fieldcall::session", session_id, "setup cancelled");
                Ok(())
            }
            Err(Abort::Failed(err)) => {
                if !self.is_current(generation) {
                    return Ok(());
                }
                self.fail(generation, err.clone()).await;
                Err(err)
            }
        }
    }

    /// Ends the session locally. A no-op when there is nothing to end.
    pub async fn end_session(&self) -> Result<(), SessionError> {
        let from = self.state();
        if !from.is_live() {
            return Ok(());
        }
        let generation = self.inner.generation.load(Ordering::SeqCst);
        let Some(settling) = self.claim(generation) else {
            return Ok(());
        };
        if !self.advance(settling, SessionState::Ending) {
            return Ok(());
        }
        if from != SessionState::Connecting {
            self.notify_remote(None);
        }
        self.teardown(settling, SessionState::Closed).await;
        Ok(())
    }

    async fn establish(
        &self,
        generation: u64,
        session_id: &str,
        role: Role,
        mut cancel: watch::Receiver<bool>,
    ) -> Result<(), Abort> {
        let config = &self.inner.config;

        let transport = self.inner.transports.create(config);
        {
            let mut control = self.inner.control.lock();
            if *cancel.borrow() {
                return Err(Abort::Cancelled);
            }
            control.transport = Some(Arc::clone(&transport));
        }

        let connected = cancellable(
            &mut cancel,
            tokio::time::timeout(config.connect_timeout, transport.connect(session_id)),
        )
        .await?;
        match connected {
            Ok(Ok(())) => {}
            Ok(Err(err)) => return Err(SessionError::from(err).into()),
            Err(_) => {
                let err = TransportError::Timeout(config.connect_timeout);
                return Err(SessionError::from(err).into());
            }
        }
        if !self.advance(generation, SessionState::Negotiating) {
            return Err(Abort::Cancelled);
        }

        let peer = cancellable(&mut cancel, self.inner.peers.create(&config.ice_servers))
            .await?
            .map_err(SessionError::from)?;
        let peer_events = peer.subscribe();
        {
            let mut slot = self.inner.negotiator.lock().await;
            if *cancel.borrow() {
                drop(slot);
                let _ = peer.close().await;
                return Err(Abort::Cancelled);
            }
            *slot = Some(SessionNegotiator::new(
                session_id,
                role,
                Arc::clone(&peer),
                Arc::clone(&transport),
            ));
        }
        let pump = self.spawn_peer_pump(
            generation,
            peer_events,
            Arc::clone(&transport),
            cancel.clone(),
        );
        self.track_task(pump);

        {
            let mut media = self.inner.media.lock().await;
            let handle = cancellable(
                &mut cancel,
                media.acquire(config.send_video, config.send_audio),
            )
            .await??;
            if *cancel.borrow() {
                media.release(&handle);
                return Err(Abort::Cancelled);
            }
            cancellable(&mut cancel, media.attach_to_session(peer.as_ref(), &handle)).await??;
        }

        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        transport
            .on_message(Box::new(move |event| {
                let _ = inbound_tx.send(event);
            }))
            .map_err(SessionError::from)?;
        let inbound = self.spawn_inbound(generation, inbound_rx, cancel.clone());
        self.track_task(inbound);

        if role == Role::Initiator {
            let channel = cancellable(
                &mut cancel,
                peer.create_data_channel(&config.data_channel_label),
            )
            .await?
            .map_err(SessionError::from)?;
            self.inner.chat.attach(channel).await;

            let mut slot = cancellable(&mut cancel, self.inner.negotiator.lock()).await?;
            let negotiator = slot.as_mut().ok_or(Abort::Cancelled)?;
            match cancellable(&mut cancel, negotiator.create_offer()).await? {
                Ok(_) => {}
                Err(SessionError::Negotiation(reason)) => {
                    tracing::warn!(
                        target: "fieldcall::session",
                        session_id,
                        %reason,
                        "offer failed; retrying once with a fresh offer"
                    );
                    negotiator.reset();
                    cancellable(&mut cancel, negotiator.create_offer()).await??;
                }
                Err(err) => return Err(err.into()),
            }
        }

        tracing::debug!(
            target: "fieldcall::session",
            session_id,
            role = role.as_str(),
            "negotiation under way"
        );
        Ok(())
    }

    fn spawn_peer_pump(
        &self,
        generation: u64,
        mut events: Subscription<PeerEvent>,
        transport: Arc<dyn SignalingTransport>,
        mut cancel: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let controller = self.clone();
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    biased;
                    _ = cancelled(&mut cancel) => break,
                    event = events.recv() => match event {
                        Some(event) => event,
                        None => break,
                    },
                };
                if !controller.is_current(generation) {
                    break;
                }
                controller.on_peer_event(generation, event, transport.as_ref()).await;
            }
        })
    }

    async fn on_peer_event(
        &self,
        generation: u64,
        event: PeerEvent,
        transport: &dyn SignalingTransport,
    ) {
        match event {
            PeerEvent::LocalCandidate(candidate) => {
                let Some(session_id) = self.session().map(|session| session.id) else {
                    return;
                };
                if let Err(err) = transport.send(&SignalingMessage::candidate(session_id, candidate)) {
                    tracing::warn!(target: "fieldcall::ice", error = %err, "failed to send local candidate");
                }
            }
            PeerEvent::GatheringComplete => {
                tracing::debug!(target: "fieldcall::ice", "local candidate gathering complete");
            }
            PeerEvent::IceConnectionState(state) => {
                tracing::debug!(target: "fieldcall::ice", state = ?state, "ice connection state");
                if state.is_established() {
                    if self.state() == SessionState::Negotiating
                        && self.advance(generation, SessionState::Active)
                    {
                        tracing::info!(target: "fieldcall::session", "session active");
                    }
                } else if state == IceConnectionState::Failed {
                    self.spawn_fail(
                        generation,
                        SessionError::Connection("ice connectivity failed".into()),
                    );
                } else if state == IceConnectionState::Disconnected {
                    tracing::warn!(target: "fieldcall::ice", "ice connectivity interrupted");
                }
            }
            PeerEvent::RemoteTrack { kind, track_id } => {
                let _ = self
                    .inner
                    .events
                    .publish(SessionEvent::RemoteTrack { kind, track_id });
            }
            PeerEvent::DataChannel(channel) => {
                self.inner.chat.attach(channel).await;
            }
        }
    }

    fn spawn_inbound(
        &self,
        generation: u64,
        mut inbound: mpsc::UnboundedReceiver<TransportEvent>,
        mut cancel: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let controller = self.clone();
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    biased;
                    _ = cancelled(&mut cancel) => break,
                    event = inbound.recv() => match event {
                        Some(event) => event,
                        None => break,
                    },
                };
                if !controller.is_current(generation) {
                    break;
                }
                tokio::select! {
                    biased;
                    _ = cancelled(&mut cancel) => break,
                    _ = controller.on_transport_event(generation, event) => {}
                }
            }
        })
    }

    async fn on_transport_event(&self, generation: u64, event: TransportEvent) {
        let message = match event {
            TransportEvent::Message(message) => message,
            TransportEvent::Disconnected { reason } => {
                if self.state().is_live() {
                    self.spawn_fail(generation, SessionError::Connection(reason));
                }
                return;
            }
        };
        tracing::trace!(target: "fieldcall::session", kind = message.kind(), "signaling message");

        match message {
            SignalingMessage::Offer { payload, .. } => {
                let result = {
                    let mut slot = self.inner.negotiator.lock().await;
                    match slot.as_mut() {
                        Some(negotiator) => negotiator.handle_offer(payload).await.map(|_| ()),
                        None => return,
                    }
                };
                self.negotiation_result("offer", generation, result);
            }
            SignalingMessage::Answer { payload, .. } => {
                let result = {
                    let mut slot = self.inner.negotiator.lock().await;
                    match slot.as_mut() {
                        Some(negotiator) => negotiator.handle_answer(payload).await,
                        None => return,
                    }
                };
                self.negotiation_result("answer", generation, result);
            }
            SignalingMessage::IceCandidate { payload, .. } => {
                let mut slot = self.inner.negotiator.lock().await;
                if let Some(negotiator) = slot.as_mut() {
                    if let Err(err) = negotiator.handle_candidate(payload).await {
                        tracing::warn!(target: "fieldcall::ice", error = %err, "remote candidate rejected");
                    }
                }
            }
            SignalingMessage::UserJoined { payload, .. } => {
                tracing::info!(target: "fieldcall::session", peer_id = %payload.peer_id, "peer joined");
                let _ = self.inner.events.publish(SessionEvent::PeerJoined(payload));
            }
            SignalingMessage::UserLeft { payload, .. } => {
                tracing::info!(target: "fieldcall::session", peer_id = %payload.peer_id, "peer left");
                let _ = self.inner.events.publish(SessionEvent::PeerLeft(payload));
            }
            SignalingMessage::SessionEnded { payload, .. } => {
                tracing::info!(
                    target: "fieldcall::session",
                    reason = payload.reason.as_deref().unwrap_or("none"),
                    "remote ended the session"
                );
                let controller = self.clone();
                tokio::spawn(async move {
                    let Some(settling) = controller.claim(generation) else {
                        return;
                    };
                    if controller.advance(settling, SessionState::Ending) {
                        controller.teardown(settling, SessionState::Closed).await;
                    }
                });
            }
        }
    }

    /// Negotiation errors before `active` are fatal; later ones (a failed
    /// renegotiation) leave the established session alone.
    fn negotiation_result(
        &self,
        step: &'static str,
        generation: u64,
        result: Result<(), SessionError>,
    ) {
        let Err(err) = result else { return };
        if self.state() == SessionState::Negotiating {
            self.spawn_fail(generation, err);
        } else {
            tracing::warn!(target: "fieldcall::session", step, error = %err, "renegotiation failed");
            let _ = self.inner.events.publish(SessionEvent::Error(err));
        }
    }

    /// Background tasks never tear down inline: teardown cancels them.
    fn spawn_fail(&self, generation: u64, err: SessionError) {
        let controller = self.clone();
        tokio::spawn(async move { controller.fail(generation, err).await });
    }

    /// Cleans up first and only then settles in `failed`, so anyone who sees
    /// the terminal state also sees the resources released.
    async fn fail(&self, generation: u64, err: SessionError) {
        let from = self.state();
        let Some(settling) = self.claim(generation) else {
            tracing::debug!(target: "fieldcall::session", error = %err, "error after session settled");
            return;
        };
        tracing::error!(
            target: "fieldcall::session",
            kind = err.kind(),
            error = %err,
            from = from.as_str(),
            "session failed"
        );
        let _ = self.inner.events.publish(SessionEvent::Error(err.clone()));
        if from != SessionState::Connecting {
            self.notify_remote(Some(err.to_string()));
        }
        self.teardown(settling, SessionState::Failed).await;
    }

    /// Takes ownership of settling the session tagged `generation`: cancels
    /// its setup and background work and retires the generation, so only the
    /// caller can move the state on. Returns the generation to settle under,
    /// or `None` when the session is already settling or gone.
    fn claim(&self, generation: u64) -> Option<u64> {
        let mut control = self.inner.control.lock();
        if !self.state().is_live() || !self.is_current(generation) {
            return None;
        }
        let cancel = control.cancel.take()?;
        cancel.send_replace(true);
        Some(self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1)
    }

    fn notify_remote(&self, reason: Option<String>) {
        let (session, transport) = {
            let control = self.inner.control.lock();
            (control.session.clone(), control.transport.clone())
        };
        let (Some(session), Some(transport)) = (session, transport) else {
            return;
        };
        if !transport.is_connected() {
            return;
        }
        if let Err(err) = transport.send(&SignalingMessage::ended(session.id, reason)) {
            tracing::debug!(target: "fieldcall::session", error = %err, "session-ended not delivered");
        }
    }

    /// Releases media, closes chat, shuts the negotiator down and closes the
    /// transport, then settles in `settled`. Each step is isolated from the
    /// others' failures. Callers must hold a [`claim`](Self::claim).
    async fn teardown(&self, settling: u64, settled: SessionState) {
        let (session, transport, tasks) = {
            let mut control = self.inner.control.lock();
            (
                control.session.clone(),
                control.transport.take(),
                std::mem::take(&mut control.tasks),
            )
        };

        let tracks_stopped = self.inner.media.lock().await.release_all();
        let chat = StepOutcome::from_result("chat", self.inner.chat.close().await);
        let negotiator = self.inner.negotiator.lock().await.take();
        let negotiator = match negotiator {
            Some(mut negotiator) => {
                StepOutcome::from_result("negotiator", negotiator.shutdown().await)
            }
            None => StepOutcome::Completed,
        };
        let transport = match transport {
            Some(transport) => StepOutcome::from_result("transport", transport.close().await),
            None => StepOutcome::Completed,
        };
        for task in tasks {
            task.abort();
        }

        let report = TeardownReport {
            session_id: session.as_ref().map(|session| session.id.clone()),
            media: StepOutcome::Completed,
            tracks_stopped,
            chat,
            negotiator,
            transport,
        };
        tracing::info!(
            target: "fieldcall::session",
            session_id = report.session_id.as_deref().unwrap_or(""),
            clean = report.is_clean(),
            tracks_stopped,
            "session torn down"
        );
        *self.inner.last_teardown.lock() = Some(report.clone());
        let _ = self.inner.events.publish(SessionEvent::TornDown(report));

        if !self.advance(settling, settled) || settled != SessionState::Closed {
            return;
        }

        if let (Some(backend), Some(session)) = (&self.inner.backend, session) {
            if let Err(err) = backend.end_consultation(&session.id).await {
                tracing::warn!(
                    target: "fieldcall::backend",
                    session_id = %session.id,
                    error = %err,
                    "failed to report consultation end"
                );
            }
        }
    }

    fn is_current(&self, generation: u64) -> bool {
        self.inner.generation.load(Ordering::SeqCst) == generation
    }

    /// Moves to `to` if the transition is legal and `generation` is still
    /// the live one. Publishes the change.
    fn advance(&self, generation: u64, to: SessionState) -> bool {
        let mut from = to;
        let moved = self.inner.state.send_if_modified(|state| {
            from = *state;
            if self.inner.generation.load(Ordering::SeqCst) == generation && state.can_transition(to) {
                *state = to;
                true
            } else {
                false
            }
        });
        if moved {
            self.publish_transition(from, to);
        }
        moved
    }

    fn publish_transition(&self, from: SessionState, to: SessionState) {
        tracing::debug!(
            target: "fieldcall::session",
            from = from.as_str(),
            to = to.as_str(),
            "state changed"
        );
        let _ = self
            .inner
            .events
            .publish(SessionEvent::StateChanged { from, to });
    }

    fn track_task(&self, task: JoinHandle<()>) {
        let mut control = self.inner.control.lock();
        if control.cancel.is_some() {
            control.tasks.push(task);
        } else {
            task.abort();
        }
    }
}

/// Resolves once the session is cancelled; a dropped sender counts.
async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    let _ = cancel.wait_for(|cancelled| *cancelled).await;
}

/// Races `fut` against the session's cancel signal.
async fn cancellable<F: Future>(
    cancel: &mut watch::Receiver<bool>,
    fut: F,
) -> Result<F::Output, Abort> {
    tokio::select! {
        biased;
        _ = cancelled(cancel) => Err(Abort::Cancelled),
        output = fut => Ok(output),
    }
}
