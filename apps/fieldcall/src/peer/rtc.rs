//! webrtc-rs bindings for the peer primitives.

use std::any::Any;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use event_bus::{Bus, LocalBus, Subscription};
use fieldcall_proto::{IceCandidate, SdpType, SessionDescription};
use webrtc::api::APIBuilder;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8, MediaEngine};
use webrtc::data_channel::RTCDataChannel;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::media::Sample;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

use super::{
    CaptureError, DataChannelEvent, DataChannelPrimitive, IceConnectionState, MediaCapturePrimitive,
    MediaTrack, PeerError, PeerEvent, PeerFactory, PeerSessionPrimitive, TrackKind,
};
use crate::config::{IceServer, MediaConstraints};

const STREAM_ID: &str = "fieldcall";

fn platform(err: webrtc::Error) -> PeerError {
    PeerError::Platform(err.to_string())
}

fn to_rtc_ice_server(server: &IceServer) -> RTCIceServer {
    RTCIceServer {
        urls: server.urls.clone(),
        username: server.username.clone().unwrap_or_default(),
        credential: server.credential.clone().unwrap_or_default(),
        ..Default::default()
    }
}

fn map_ice_state(state: RTCIceConnectionState) -> IceConnectionState {
    match state {
        RTCIceConnectionState::Checking => IceConnectionState::Checking,
        RTCIceConnectionState::Connected => IceConnectionState::Connected,
        RTCIceConnectionState::Completed => IceConnectionState::Completed,
        RTCIceConnectionState::Disconnected => IceConnectionState::Disconnected,
        RTCIceConnectionState::Failed => IceConnectionState::Failed,
        RTCIceConnectionState::Closed => IceConnectionState::Closed,
        _ => IceConnectionState::New,
    }
}

fn to_rtc_description(description: &SessionDescription) -> Result<RTCSessionDescription, PeerError> {
    let result = match description.kind {
        SdpType::Offer => RTCSessionDescription::offer(description.sdp.clone()),
        SdpType::Answer => RTCSessionDescription::answer(description.sdp.clone()),
    };
    result.map_err(|err| PeerError::InvalidDescription(err.to_string()))
}

fn from_rtc_description(
    kind: SdpType,
    description: RTCSessionDescription,
) -> SessionDescription {
    match kind {
        SdpType::Offer => SessionDescription::offer(description.sdp),
        SdpType::Answer => SessionDescription::answer(description.sdp),
    }
}

/// Creates webrtc-rs peer connections with the default codecs and
/// interceptors registered.
#[derive(Debug, Default, Clone)]
pub struct RtcPeerFactory;

impl RtcPeerFactory {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl PeerFactory for RtcPeerFactory {
    async fn create(
        &self,
        ice_servers: &[IceServer],
    ) -> Result<Arc<dyn PeerSessionPrimitive>, PeerError> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs().map_err(platform)?;
        let registry =
            register_default_interceptors(Registry::new(), &mut media_engine).map_err(platform)?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let rtc_config = RTCConfiguration {
            ice_servers: ice_servers.iter().map(to_rtc_ice_server).collect(),
            ..Default::default()
        };
        let peer_connection = Arc::new(api.new_peer_connection(rtc_config).await.map_err(platform)?);
        Ok(Arc::new(RtcPeerSession::wire(peer_connection)))
    }
}

/// One webrtc-rs peer connection whose callbacks feed a [`LocalBus`].
pub struct RtcPeerSession {
    peer_connection: Arc<RTCPeerConnection>,
    events: Arc<LocalBus<PeerEvent>>,
    closed: AtomicBool,
}

impl RtcPeerSession {
    fn wire(peer_connection: Arc<RTCPeerConnection>) -> Self {
        let events = Arc::new(LocalBus::new());

        let bus = Arc::clone(&events);
        peer_connection.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let bus = Arc::clone(&bus);
            Box::pin(async move {
                let event = match candidate {
                    Some(candidate) => match candidate.to_json() {
                        Ok(init) => PeerEvent::LocalCandidate(IceCandidate {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_mline_index: init.sdp_mline_index,
                            username_fragment: init.username_fragment,
                        }),
                        Err(err) => {
                            tracing::warn!(
                                target: "fieldcall::peer",
                                error = %err,
                                "failed to serialize local candidate"
                            );
                            return;
                        }
                    },
                    None => PeerEvent::GatheringComplete,
                };
                let _ = bus.publish(event);
            })
        }));

        let bus = Arc::clone(&events);
        peer_connection.on_ice_connection_state_change(Box::new(
            move |state: RTCIceConnectionState| {
                let bus = Arc::clone(&bus);
                Box::pin(async move {
                    tracing::debug!(
                        target: "fieldcall::peer",
                        state = %state,
                        "ice connection state changed"
                    );
                    let _ = bus.publish(PeerEvent::IceConnectionState(map_ice_state(state)));
                })
            },
        ));

        let bus = Arc::clone(&events);
        peer_connection.on_track(Box::new(move |track, _receiver, _transceiver| {
            let bus = Arc::clone(&bus);
            Box::pin(async move {
                let kind = match track.kind() {
                    RTPCodecType::Audio => TrackKind::Audio,
                    RTPCodecType::Video => TrackKind::Video,
                    _ => return,
                };
                let _ = bus.publish(PeerEvent::RemoteTrack {
                    kind,
                    track_id: track.id(),
                });
            })
        }));

        let bus = Arc::clone(&events);
        peer_connection.on_data_channel(Box::new(move |channel: Arc<RTCDataChannel>| {
            let bus = Arc::clone(&bus);
            Box::pin(async move {
                tracing::debug!(
                    target: "fieldcall::peer",
                    label = channel.label(),
                    "remote data channel announced"
                );
                let channel: Arc<dyn DataChannelPrimitive> = Arc::new(RtcDataChannel::wire(channel));
                let _ = bus.publish(PeerEvent::DataChannel(channel));
            })
        }));

        Self {
            peer_connection,
            events,
            closed: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl PeerSessionPrimitive for RtcPeerSession {
    async fn create_offer(&self) -> Result<SessionDescription, PeerError> {
        let offer = self.peer_connection.create_offer(None).await.map_err(platform)?;
        Ok(from_rtc_description(SdpType::Offer, offer))
    }

    async fn create_answer(&self) -> Result<SessionDescription, PeerError> {
        let answer = self
            .peer_connection
            .create_answer(None)
            .await
            .map_err(platform)?;
        Ok(from_rtc_description(SdpType::Answer, answer))
    }

    async fn set_local_description(
        &self,
        description: &SessionDescription,
    ) -> Result<(), PeerError> {
        let description = to_rtc_description(description)?;
        self.peer_connection
            .set_local_description(description)
            .await
            .map_err(|err| PeerError::InvalidDescription(err.to_string()))
    }

    async fn set_remote_description(
        &self,
        description: &SessionDescription,
    ) -> Result<(), PeerError> {
        let description = to_rtc_description(description)?;
        self.peer_connection
            .set_remote_description(description)
            .await
            .map_err(|err| PeerError::InvalidDescription(err.to_string()))
    }

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), PeerError> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate.clone(),
            sdp_mid: candidate.sdp_mid.clone(),
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment.clone(),
        };
        self.peer_connection
            .add_ice_candidate(init)
            .await
            .map_err(|err| PeerError::CandidateRejected(err.to_string()))
    }

    async fn add_track(&self, track: Arc<dyn MediaTrack>) -> Result<(), PeerError> {
        let Some(sample) = track.as_any().downcast_ref::<SampleTrack>() else {
            return Err(PeerError::TrackRejected(format!(
                "track {} was not produced by the sample capture",
                track.id()
            )));
        };
        let local: Arc<dyn TrackLocal + Send + Sync> = sample.local_track();
        let sender = self
            .peer_connection
            .add_track(local)
            .await
            .map_err(|err| PeerError::TrackRejected(err.to_string()))?;

        // RTCP has to be drained for interceptors to make progress.
        tokio::spawn(async move {
            let mut buf = vec![0u8; 1500];
            while sender.read(&mut buf).await.is_ok() {}
        });
        Ok(())
    }

    async fn create_data_channel(
        &self,
        label: &str,
    ) -> Result<Arc<dyn DataChannelPrimitive>, PeerError> {
        let init = RTCDataChannelInit {
            ordered: Some(true),
            ..Default::default()
        };
        let channel = self
            .peer_connection
            .create_data_channel(label, Some(init))
            .await
            .map_err(|err| PeerError::DataChannel(err.to_string()))?;
        Ok(Arc::new(RtcDataChannel::wire(channel)))
    }

    fn subscribe(&self) -> Subscription<PeerEvent> {
        self.events.subscribe()
    }

    async fn close(&self) -> Result<(), PeerError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let result = self.peer_connection.close().await.map_err(platform);
        self.events.close();
        result
    }
}

pub struct RtcDataChannel {
    channel: Arc<RTCDataChannel>,
    events: Arc<LocalBus<DataChannelEvent>>,
}

impl RtcDataChannel {
    fn wire(channel: Arc<RTCDataChannel>) -> Self {
        let events = Arc::new(LocalBus::buffered());

        let bus = Arc::clone(&events);
        channel.on_open(Box::new(move || {
            let bus = Arc::clone(&bus);
            Box::pin(async move {
                let _ = bus.publish(DataChannelEvent::Open);
            })
        }));

        let bus = Arc::clone(&events);
        channel.on_message(Box::new(move |message: DataChannelMessage| {
            let bus = Arc::clone(&bus);
            Box::pin(async move {
                match String::from_utf8(message.data.to_vec()) {
                    Ok(text) => {
                        let _ = bus.publish(DataChannelEvent::Message(text));
                    }
                    Err(_) => tracing::warn!(
                        target: "fieldcall::peer",
                        len = message.data.len(),
                        "dropping non-utf8 data channel message"
                    ),
                }
            })
        }));

        let bus = Arc::clone(&events);
        channel.on_close(Box::new(move || {
            let bus = Arc::clone(&bus);
            Box::pin(async move {
                let _ = bus.publish(DataChannelEvent::Closed);
                bus.close();
            })
        }));

        Self { channel, events }
    }
}

#[async_trait]
impl DataChannelPrimitive for RtcDataChannel {
    fn label(&self) -> &str {
        self.channel.label()
    }

    fn is_open(&self) -> bool {
        self.channel.ready_state() == RTCDataChannelState::Open
    }

    async fn send_text(&self, text: &str) -> Result<(), PeerError> {
        self.channel
            .send_text(text.to_string())
            .await
            .map(|_| ())
            .map_err(|err| PeerError::DataChannel(err.to_string()))
    }

    fn subscribe(&self) -> Subscription<DataChannelEvent> {
        self.events.subscribe()
    }

    async fn close(&self) -> Result<(), PeerError> {
        self.channel
            .close()
            .await
            .map_err(|err| PeerError::DataChannel(err.to_string()))
    }
}

/// Local track fed with already-encoded samples (VP8 video, Opus audio).
#[derive(Debug)]
pub struct SampleTrack {
    id: String,
    kind: TrackKind,
    local: Arc<TrackLocalStaticSample>,
    enabled: AtomicBool,
    stopped: AtomicBool,
}

impl SampleTrack {
    pub fn new(kind: TrackKind) -> Self {
        let id = format!("{}-{}", kind.as_str(), uuid::Uuid::new_v4());
        let mime_type = match kind {
            TrackKind::Video => MIME_TYPE_VP8,
            TrackKind::Audio => MIME_TYPE_OPUS,
        };
        let local = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: mime_type.to_owned(),
                ..Default::default()
            },
            id.clone(),
            STREAM_ID.to_owned(),
        ));
        Self {
            id,
            kind,
            local,
            enabled: AtomicBool::new(true),
            stopped: AtomicBool::new(false),
        }
    }

    pub fn local_track(&self) -> Arc<TrackLocalStaticSample> {
        Arc::clone(&self.local)
    }

    /// Writes one encoded frame. Muted or stopped tracks drop the sample and
    /// report `false`.
    pub async fn write_sample(&self, data: Bytes, duration: Duration) -> Result<bool, PeerError> {
        if !self.is_enabled() || self.is_stopped() {
            return Ok(false);
        }
        self.local
            .write_sample(&Sample {
                data,
                duration,
                ..Default::default()
            })
            .await
            .map_err(platform)?;
        Ok(true)
    }
}

impl MediaTrack for SampleTrack {
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

/// Capture source that exposes [`SampleTrack`]s for an external encoder.
#[derive(Debug, Clone)]
pub struct SampleCapture {
    has_video: bool,
    has_audio: bool,
}

impl Default for SampleCapture {
    fn default() -> Self {
        Self::new(true, true)
    }
}

impl SampleCapture {
    pub fn new(has_video: bool, has_audio: bool) -> Self {
        Self {
            has_video,
            has_audio,
        }
    }
}

#[async_trait]
impl MediaCapturePrimitive for SampleCapture {
    async fn capture(
        &self,
        constraints: &MediaConstraints,
    ) -> Result<Vec<Arc<dyn MediaTrack>>, CaptureError> {
        let mut tracks: Vec<Arc<dyn MediaTrack>> = Vec::new();
        if constraints.video.is_some() {
            if !self.has_video {
                return Err(CaptureError::NoDevice("camera".into()));
            }
            tracks.push(Arc::new(SampleTrack::new(TrackKind::Video)));
        }
        if constraints.audio.is_some() {
            if !self.has_audio {
                return Err(CaptureError::NoDevice("microphone".into()));
            }
            tracks.push(Arc::new(SampleTrack::new(TrackKind::Audio)));
        }
        Ok(tracks)
    }
}
