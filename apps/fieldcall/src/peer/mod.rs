//! Narrow seams over the platform's peer-connection, media-capture and
//! data-channel primitives. The session core only talks to these traits;
//! [`rtc`] binds them to webrtc-rs and [`mock`] provides in-memory doubles.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use event_bus::Subscription;
use fieldcall_proto::{IceCandidate, SessionDescription};
use thiserror::Error;

use crate::config::{IceServer, MediaConstraints};

pub mod mock;
pub mod rtc;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PeerError {
    #[error("invalid session description: {0}")]
    InvalidDescription(String),
    #[error("ice candidate rejected: {0}")]
    CandidateRejected(String),
    #[error("track rejected: {0}")]
    TrackRejected(String),
    #[error("data channel error: {0}")]
    DataChannel(String),
    #[error("peer connection closed")]
    Closed,
    #[error("peer connection error: {0}")]
    Platform(String),
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CaptureError {
    #[error("permission denied for {0}")]
    PermissionDenied(String),
    #[error("no {0} device present")]
    NoDevice(String),
    #[error("capture failed: {0}")]
    Platform(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackKind {
    Audio,
    Video,
}

impl TrackKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TrackKind::Audio => "audio",
            TrackKind::Video => "video",
        }
    }
}

/// Connectivity progress reported by the peer connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IceConnectionState {
    New,
    Checking,
    Connected,
    Completed,
    Disconnected,
    Failed,
    Closed,
}

impl IceConnectionState {
    /// `connected` or `completed`: media and data can flow.
    pub fn is_established(self) -> bool {
        matches!(
            self,
            IceConnectionState::Connected | IceConnectionState::Completed
        )
    }
}

/// Everything the peer connection announces. Published on an event bus so
/// several components can observe the same event.
#[derive(Clone)]
pub enum PeerEvent {
    LocalCandidate(IceCandidate),
    GatheringComplete,
    IceConnectionState(IceConnectionState),
    RemoteTrack { kind: TrackKind, track_id: String },
    /// A channel opened by the remote side.
    DataChannel(Arc<dyn DataChannelPrimitive>),
}

impl fmt::Debug for PeerEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerEvent::LocalCandidate(candidate) => {
                f.debug_tuple("LocalCandidate").field(candidate).finish()
            }
            PeerEvent::GatheringComplete => f.write_str("GatheringComplete"),
            PeerEvent::IceConnectionState(state) => {
                f.debug_tuple("IceConnectionState").field(state).finish()
            }
            PeerEvent::RemoteTrack { kind, track_id } => f
                .debug_struct("RemoteTrack")
                .field("kind", kind)
                .field("track_id", track_id)
                .finish(),
            PeerEvent::DataChannel(channel) => {
                f.debug_tuple("DataChannel").field(&channel.label()).finish()
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataChannelEvent {
    Open,
    Message(String),
    Closed,
}

/// One peer connection: offer/answer, candidates, tracks and channels.
#[async_trait]
pub trait PeerSessionPrimitive: Send + Sync {
    async fn create_offer(&self) -> Result<SessionDescription, PeerError>;
    async fn create_answer(&self) -> Result<SessionDescription, PeerError>;
    async fn set_local_description(
        &self,
        description: &SessionDescription,
    ) -> Result<(), PeerError>;
    async fn set_remote_description(
        &self,
        description: &SessionDescription,
    ) -> Result<(), PeerError>;
    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), PeerError>;
    async fn add_track(&self, track: Arc<dyn MediaTrack>) -> Result<(), PeerError>;
    /// Opens an ordered, reliable channel.
    async fn create_data_channel(
        &self,
        label: &str,
    ) -> Result<Arc<dyn DataChannelPrimitive>, PeerError>;
    fn subscribe(&self) -> Subscription<PeerEvent>;
    async fn close(&self) -> Result<(), PeerError>;
}

#[async_trait]
pub trait PeerFactory: Send + Sync {
    async fn create(
        &self,
        ice_servers: &[IceServer],
    ) -> Result<Arc<dyn PeerSessionPrimitive>, PeerError>;
}

/// A local audio or video track.
pub trait MediaTrack: Send + Sync + fmt::Debug {
    fn id(&self) -> &str;
    fn kind(&self) -> TrackKind;
    fn is_enabled(&self) -> bool;
    fn set_enabled(&self, enabled: bool);
    /// Idempotent; returns `true` only for the call that actually stopped it.
    fn stop(&self) -> bool;
    fn is_stopped(&self) -> bool;
    /// Lets a platform binding recover its concrete track type.
    fn as_any(&self) -> &dyn Any;
}

#[async_trait]
pub trait MediaCapturePrimitive: Send + Sync {
    async fn capture(
        &self,
        constraints: &MediaConstraints,
    ) -> Result<Vec<Arc<dyn MediaTrack>>, CaptureError>;
}

#[async_trait]
pub trait DataChannelPrimitive: Send + Sync {
    fn label(&self) -> &str;
    fn is_open(&self) -> bool;
    async fn send_text(&self, text: &str) -> Result<(), PeerError>;
    /// The first subscriber also receives everything that arrived before it.
    fn subscribe(&self) -> Subscription<DataChannelEvent>;
    async fn close(&self) -> Result<(), PeerError>;
}
