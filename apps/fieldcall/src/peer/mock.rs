//! In-memory doubles for the peer primitives. A [`FakeNetwork`] links the
//! peers created by its factories so two session controllers can negotiate
//! with each other without sockets, codecs or devices.

use std::any::Any;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use event_bus::{Bus, LocalBus, Subscription};
use fieldcall_proto::{IceCandidate, SdpType, SessionDescription};
use parking_lot::Mutex;

use super::{
    CaptureError, DataChannelEvent, DataChannelPrimitive, IceConnectionState, MediaCapturePrimitive,
    MediaTrack, PeerError, PeerEvent, PeerFactory, PeerSessionPrimitive, TrackKind,
};
use crate::config::{IceServer, MediaConstraints};

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

fn next_id() -> u64 {
    NEXT_ID.fetch_add(1, Ordering::Relaxed)
}

/// Shared medium between fake peers.
#[derive(Clone, Default)]
pub struct FakeNetwork {
    inner: Arc<Mutex<NetworkState>>,
}

#[derive(Default)]
struct NetworkState {
    peers: Vec<Arc<FakePeer>>,
    /// Remote halves of channels, keyed by the id of the peer that opened them.
    unclaimed_channels: Vec<(u64, Arc<FakeDataChannel>)>,
}

impl FakeNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn factory(&self) -> FakePeerFactory {
        FakePeerFactory {
            network: Some(self.clone()),
            ..FakePeerFactory::default()
        }
    }

    pub fn peers(&self) -> Vec<Arc<FakePeer>> {
        self.inner.lock().peers.clone()
    }

    /// Reports connectivity on every live peer and opens every channel.
    pub fn establish(&self) {
        for peer in self.peers() {
            if peer.is_closed() {
                continue;
            }
            peer.simulate_ice_state(IceConnectionState::Checking);
            peer.simulate_ice_state(IceConnectionState::Connected);
            peer.open_channels();
        }
    }

    fn register(&self, peer: Arc<FakePeer>) {
        self.inner.lock().peers.push(peer);
    }

    fn park_channel(&self, owner: u64, remote: Arc<FakeDataChannel>) {
        self.inner.lock().unclaimed_channels.push((owner, remote));
    }

    /// Hands channels opened by other peers to `receiver`, as an offer
    /// carrying an application section would.
    fn deliver_channels(&self, receiver: &Arc<FakePeer>) {
        let claimed: Vec<Arc<FakeDataChannel>> = {
            let mut state = self.inner.lock();
            let (mine, rest): (Vec<_>, Vec<_>) = state
                .unclaimed_channels
                .drain(..)
                .partition(|(owner, _)| *owner != receiver.id);
            state.unclaimed_channels = rest;
            mine.into_iter().map(|(_, channel)| channel).collect()
        };
        for channel in claimed {
            receiver.state.lock().channels.push(Arc::clone(&channel));
            let _ = receiver
                .events
                .publish(PeerEvent::DataChannel(channel as Arc<dyn DataChannelPrimitive>));
        }
    }
}

#[derive(Default)]
pub struct FakePeerFactory {
    network: Option<FakeNetwork>,
    fail_create: AtomicBool,
    offer_failures: AtomicUsize,
    created: Mutex<Vec<Arc<FakePeer>>>,
}

impl FakePeerFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_create(&self) {
        self.fail_create.store(true, Ordering::SeqCst);
    }

    /// The next `count` offers created by peers from this factory fail.
    pub fn fail_offers(&self, count: usize) {
        self.offer_failures.store(count, Ordering::SeqCst);
    }

    pub fn created(&self) -> Vec<Arc<FakePeer>> {
        self.created.lock().clone()
    }

    pub fn last(&self) -> Option<Arc<FakePeer>> {
        self.created.lock().last().cloned()
    }
}

#[async_trait]
impl PeerFactory for FakePeerFactory {
    async fn create(
        &self,
        ice_servers: &[IceServer],
    ) -> Result<Arc<dyn PeerSessionPrimitive>, PeerError> {
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(PeerError::Platform("peer connection unavailable".into()));
        }
        let peer = fake_peer(self.network.clone());
        {
            let mut state = peer.state.lock();
            state.ice_servers = ice_servers.to_vec();
            state.offer_failures = self.offer_failures.swap(0, Ordering::SeqCst);
        }
        self.created.lock().push(Arc::clone(&peer));
        Ok(peer)
    }
}

#[derive(Default)]
struct FakePeerState {
    ice_servers: Vec<IceServer>,
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    applied: Vec<IceCandidate>,
    tracks: Vec<Arc<dyn MediaTrack>>,
    channels: Vec<Arc<FakeDataChannel>>,
    offers_created: u32,
    offer_failures: usize,
    closed: bool,
}

pub struct FakePeer {
    id: u64,
    network: Option<FakeNetwork>,
    state: Mutex<FakePeerState>,
    events: LocalBus<PeerEvent>,
    // weak self so channel delivery can hand out Arc<FakePeer>
    this: Mutex<Weak<FakePeer>>,
}

impl FakePeer {
    fn new(network: Option<FakeNetwork>) -> Self {
        Self {
            id: next_id(),
            network,
            state: Mutex::new(FakePeerState::default()),
            events: LocalBus::new(),
            this: Mutex::new(Weak::new()),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Candidates handed to the connectivity layer, in application order.
    pub fn applied_candidates(&self) -> Vec<IceCandidate> {
        self.state.lock().applied.clone()
    }

    pub fn local_description(&self) -> Option<SessionDescription> {
        self.state.lock().local.clone()
    }

    pub fn remote_description(&self) -> Option<SessionDescription> {
        self.state.lock().remote.clone()
    }

    pub fn track_ids(&self) -> Vec<String> {
        self.state
            .lock()
            .tracks
            .iter()
            .map(|track| track.id().to_string())
            .collect()
    }

    pub fn ice_servers(&self) -> Vec<IceServer> {
        self.state.lock().ice_servers.clone()
    }

    pub fn channels(&self) -> Vec<Arc<FakeDataChannel>> {
        self.state.lock().channels.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn simulate_ice_state(&self, state: IceConnectionState) {
        let _ = self.events.publish(PeerEvent::IceConnectionState(state));
    }

    pub fn emit_local_candidate(&self, candidate: IceCandidate) {
        let _ = self.events.publish(PeerEvent::LocalCandidate(candidate));
    }

    pub fn emit_remote_track(&self, kind: TrackKind, track_id: &str) {
        let _ = self.events.publish(PeerEvent::RemoteTrack {
            kind,
            track_id: track_id.to_string(),
        });
    }

    fn open_channels(&self) {
        for channel in self.channels() {
            channel.open();
        }
    }

    fn fake_sdp(&self, kind: SdpType, version: u32) -> String {
        let state = self.state.lock();
        let mut sdp = format!(
            "v=0\r\no=- {} {} IN IP4 127.0.0.1\r\ns=fieldcall-fake-{}\r\nt=0 0\r\n",
            self.id,
            version,
            kind.as_str()
        );
        for track in &state.tracks {
            sdp.push_str(&format!("m={} 9 UDP/TLS/RTP/SAVPF 96\r\n", track.kind().as_str()));
        }
        if !state.channels.is_empty() {
            sdp.push_str("m=application 9 UDP/DTLS/SCTP webrtc-datachannel\r\n");
        }
        sdp
    }

    fn ensure_open(&self) -> Result<(), PeerError> {
        if self.state.lock().closed {
            Err(PeerError::Closed)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl PeerSessionPrimitive for FakePeer {
    async fn create_offer(&self) -> Result<SessionDescription, PeerError> {
        self.ensure_open()?;
        let version = {
            let mut state = self.state.lock();
            if state.offer_failures > 0 {
                state.offer_failures -= 1;
                return Err(PeerError::Platform("offer generation failed".into()));
            }
            state.offers_created += 1;
            state.offers_created
        };
        Ok(SessionDescription::offer(
            self.fake_sdp(SdpType::Offer, version),
        ))
    }

    async fn create_answer(&self) -> Result<SessionDescription, PeerError> {
        self.ensure_open()?;
        let has_offer = matches!(
            self.state.lock().remote.as_ref().map(|d| d.kind),
            Some(SdpType::Offer)
        );
        if !has_offer {
            return Err(PeerError::InvalidDescription(
                "answer requested without a remote offer".into(),
            ));
        }
        Ok(SessionDescription::answer(self.fake_sdp(SdpType::Answer, 1)))
    }

    async fn set_local_description(
        &self,
        description: &SessionDescription,
    ) -> Result<(), PeerError> {
        self.ensure_open()?;
        description
            .validate()
            .map_err(|err| PeerError::InvalidDescription(err.to_string()))?;
        self.state.lock().local = Some(description.clone());
        Ok(())
    }

    async fn set_remote_description(
        &self,
        description: &SessionDescription,
    ) -> Result<(), PeerError> {
        self.ensure_open()?;
        description
            .validate()
            .map_err(|err| PeerError::InvalidDescription(err.to_string()))?;
        self.state.lock().remote = Some(description.clone());
        if description.kind == SdpType::Offer {
            let this = self.this.lock().upgrade();
            if let (Some(network), Some(this)) = (&self.network, this) {
                network.deliver_channels(&this);
            }
        }
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), PeerError> {
        self.ensure_open()?;
        let mut state = self.state.lock();
        if state.remote.is_none() {
            return Err(PeerError::CandidateRejected(
                "remote description not set".into(),
            ));
        }
        state.applied.push(candidate.clone());
        Ok(())
    }

    async fn add_track(&self, track: Arc<dyn MediaTrack>) -> Result<(), PeerError> {
        self.ensure_open()?;
        self.state.lock().tracks.push(track);
        Ok(())
    }

    async fn create_data_channel(
        &self,
        label: &str,
    ) -> Result<Arc<dyn DataChannelPrimitive>, PeerError> {
        self.ensure_open()?;
        let (local, remote) = FakeDataChannel::pair(label);
        self.state.lock().channels.push(Arc::clone(&local));
        if let Some(network) = &self.network {
            network.park_channel(self.id, remote);
        }
        Ok(local)
    }

    fn subscribe(&self) -> Subscription<PeerEvent> {
        self.events.subscribe()
    }

    async fn close(&self) -> Result<(), PeerError> {
        let channels = {
            let mut state = self.state.lock();
            if state.closed {
                return Ok(());
            }
            state.closed = true;
            std::mem::take(&mut state.channels)
        };
        for channel in channels {
            let _ = channel.close().await;
        }
        let _ = self
            .events
            .publish(PeerEvent::IceConnectionState(IceConnectionState::Closed));
        self.events.close();
        Ok(())
    }
}

/// Builds a fake peer wired to `network`, keeping the self reference the
/// network needs for channel delivery.
pub fn fake_peer(network: Option<FakeNetwork>) -> Arc<FakePeer> {
    let peer = Arc::new(FakePeer::new(network.clone()));
    *peer.this.lock() = Arc::downgrade(&peer);
    if let Some(network) = network {
        network.register(Arc::clone(&peer));
    }
    peer
}

pub struct FakeDataChannel {
    label: String,
    open: AtomicBool,
    closed: AtomicBool,
    events: LocalBus<DataChannelEvent>,
    remote: Mutex<Weak<FakeDataChannel>>,
    sent: Mutex<Vec<String>>,
}

impl std::fmt::Debug for FakeDataChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FakeDataChannel")
            .field("label", &self.label)
            .field("open", &self.open.load(Ordering::SeqCst))
            .finish()
    }
}

impl FakeDataChannel {
    fn new(label: &str) -> Self {
        Self {
            label: label.to_string(),
            open: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            events: LocalBus::buffered(),
            remote: Mutex::new(Weak::new()),
            sent: Mutex::new(Vec::new()),
        }
    }

    /// Two connected ends; text sent on one arrives on the other.
    pub fn pair(label: &str) -> (Arc<FakeDataChannel>, Arc<FakeDataChannel>) {
        let local = Arc::new(Self::new(label));
        let remote = Arc::new(Self::new(label));
        *local.remote.lock() = Arc::downgrade(&remote);
        *remote.remote.lock() = Arc::downgrade(&local);
        (local, remote)
    }

    /// Transitions to open and notifies subscribers.
    pub fn open(&self) {
        if self.closed.load(Ordering::SeqCst) || self.open.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.events.publish(DataChannelEvent::Open);
    }

    pub fn sent(&self) -> Vec<String> {
        self.sent.lock().clone()
    }

    fn receive(&self, text: String) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        let _ = self.events.publish(DataChannelEvent::Message(text));
    }
}

#[async_trait]
impl DataChannelPrimitive for FakeDataChannel {
    fn label(&self) -> &str {
        &self.label
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst) && !self.closed.load(Ordering::SeqCst)
    }

    async fn send_text(&self, text: &str) -> Result<(), PeerError> {
        if !self.is_open() {
            return Err(PeerError::DataChannel(format!(
                "channel {} is not open",
                self.label
            )));
        }
        self.sent.lock().push(text.to_string());
        if let Some(remote) = self.remote.lock().upgrade() {
            remote.receive(text.to_string());
        }
        Ok(())
    }

    fn subscribe(&self) -> Subscription<DataChannelEvent> {
        self.events.subscribe()
    }

    async fn close(&self) -> Result<(), PeerError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.open.store(false, Ordering::SeqCst);
        let _ = self.events.publish(DataChannelEvent::Closed);
        self.events.close();
        Ok(())
    }
}

#[derive(Debug)]
pub struct FakeTrack {
    id: String,
    kind: TrackKind,
    enabled: AtomicBool,
    stopped: AtomicBool,
}

impl FakeTrack {
    pub fn new(kind: TrackKind) -> Self {
        Self {
            id: format!("fake-{}-{}", kind.as_str(), next_id()),
            kind,
            enabled: AtomicBool::new(true),
            stopped: AtomicBool::new(false),
        }
    }
}

impl MediaTrack for FakeTrack {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> TrackKind {
        self.kind
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    fn stop(&self) -> bool {
        !self.stopped.swap(true, Ordering::SeqCst)
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Camera/microphone double with configurable devices and permission.
pub struct FakeCapture {
    has_camera: bool,
    has_microphone: bool,
    denied: AtomicBool,
    captures: AtomicUsize,
    issued: Mutex<Vec<Arc<FakeTrack>>>,
}

impl Default for FakeCapture {
    fn default() -> Self {
        Self::new(true, true)
    }
}

impl FakeCapture {
    pub fn new(has_camera: bool, has_microphone: bool) -> Self {
        Self {
            has_camera,
            has_microphone,
            denied: AtomicBool::new(false),
            captures: AtomicUsize::new(0),
            issued: Mutex::new(Vec::new()),
        }
    }

    pub fn deny_permission(&self) {
        self.denied.store(true, Ordering::SeqCst);
    }

    pub fn capture_count(&self) -> usize {
        self.captures.load(Ordering::SeqCst)
    }

    /// Every track handed out so far.
    pub fn issued(&self) -> Vec<Arc<FakeTrack>> {
        self.issued.lock().clone()
    }
}

#[async_trait]
impl MediaCapturePrimitive for FakeCapture {
    async fn capture(
        &self,
        constraints: &MediaConstraints,
    ) -> Result<Vec<Arc<dyn MediaTrack>>, CaptureError> {
        self.captures.fetch_add(1, Ordering::SeqCst);
        if self.denied.load(Ordering::SeqCst) {
            return Err(CaptureError::PermissionDenied("camera and microphone".into()));
        }
        let mut tracks = Vec::new();
        if constraints.video.is_some() {
            if !self.has_camera {
                return Err(CaptureError::NoDevice("camera".into()));
            }
            tracks.push(Arc::new(FakeTrack::new(TrackKind::Video)));
        }
        if constraints.audio.is_some() {
            if !self.has_microphone {
                return Err(CaptureError::NoDevice("microphone".into()));
            }
            tracks.push(Arc::new(FakeTrack::new(TrackKind::Audio)));
        }
        self.issued.lock().extend(tracks.iter().cloned());
        Ok(tracks
            .into_iter()
            .map(|track| track as Arc<dyn MediaTrack>)
            .collect())
    }
}
