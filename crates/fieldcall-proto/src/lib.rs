//! Message shapes exchanged over the fieldcall signaling relay and the chat
//! data channel. Clients and the relay both depend on this crate so the JSON
//! layout never drifts between them.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::OffsetDateTime;

mod chat;

pub use chat::ChatMessage;

/// Which side of a consultation a peer plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Initiator,
    Responder,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Initiator => "initiator",
            Role::Responder => "responder",
        }
    }

    pub fn opposite(self) -> Role {
        match self {
            Role::Initiator => Role::Responder,
            Role::Responder => Role::Initiator,
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Role {
    type Err = ProtocolError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "initiator" => Ok(Role::Initiator),
            "responder" => Ok(Role::Responder),
            other => Err(ProtocolError::UnknownRole(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
}

impl SdpType {
    pub fn as_str(self) -> &'static str {
        match self {
            SdpType::Offer => "offer",
            SdpType::Answer => "answer",
        }
    }
}

/// An SDP blob tagged with its role in the offer/answer exchange.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpType::Answer,
            sdp: sdp.into(),
        }
    }

    /// Cheap structural check: an SDP body always opens with the `v=` line.
    pub fn validate(&self) -> Result<(), ProtocolError> {
        let body = self.sdp.trim_start();
        if body.is_empty() {
            return Err(ProtocolError::MalformedDescription(
                "empty sdp body".to_string(),
            ));
        }
        if !body.starts_with("v=") {
            return Err(ProtocolError::MalformedDescription(format!(
                "{} sdp does not start with a version line",
                self.kind.as_str()
            )));
        }
        Ok(())
    }
}

/// A trickled connectivity candidate, laid out like the browser's
/// `RTCIceCandidateInit`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(
        rename = "sdpMLineIndex",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_mline_index: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_mline_index: None,
            username_fragment: None,
        }
    }

    pub fn with_mid(mut self, sdp_mid: impl Into<String>, sdp_mline_index: u16) -> Self {
        self.sdp_mid = Some(sdp_mid.into());
        self.sdp_mline_index = Some(sdp_mline_index);
        self
    }
}

/// Presence notice synthesized by the relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    pub peer_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<Role>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndNotice {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Everything that travels over the relay, keyed by session id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    rename_all = "kebab-case",
    rename_all_fields = "camelCase"
)]
pub enum SignalingMessage {
    Offer {
        session_id: String,
        payload: SessionDescription,
    },
    Answer {
        session_id: String,
        payload: SessionDescription,
    },
    IceCandidate {
        session_id: String,
        payload: IceCandidate,
    },
    UserJoined {
        session_id: String,
        payload: Participant,
    },
    UserLeft {
        session_id: String,
        payload: Participant,
    },
    SessionEnded {
        session_id: String,
        #[serde(default)]
        payload: EndNotice,
    },
}

impl SignalingMessage {
    /// Wraps a local description in the matching offer/answer envelope.
    pub fn description(session_id: impl Into<String>, description: SessionDescription) -> Self {
        let session_id = session_id.into();
        match description.kind {
            SdpType::Offer => SignalingMessage::Offer {
                session_id,
                payload: description,
            },
            SdpType::Answer => SignalingMessage::Answer {
                session_id,
                payload: description,
            },
        }
    }

    pub fn candidate(session_id: impl Into<String>, candidate: IceCandidate) -> Self {
        SignalingMessage::IceCandidate {
            session_id: session_id.into(),
            payload: candidate,
        }
    }

    pub fn ended(session_id: impl Into<String>, reason: Option<String>) -> Self {
        SignalingMessage::SessionEnded {
            session_id: session_id.into(),
            payload: EndNotice { reason },
        }
    }

    pub fn session_id(&self) -> &str {
        match self {
            SignalingMessage::Offer { session_id, .. }
            | SignalingMessage::Answer { session_id, .. }
            | SignalingMessage::IceCandidate { session_id, .. }
            | SignalingMessage::UserJoined { session_id, .. }
            | SignalingMessage::UserLeft { session_id, .. }
            | SignalingMessage::SessionEnded { session_id, .. } => session_id,
        }
    }

    /// The wire tag, handy for log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            SignalingMessage::Offer { .. } => "offer",
            SignalingMessage::Answer { .. } => "answer",
            SignalingMessage::IceCandidate { .. } => "ice-candidate",
            SignalingMessage::UserJoined { .. } => "user-joined",
            SignalingMessage::UserLeft { .. } => "user-left",
            SignalingMessage::SessionEnded { .. } => "session-ended",
        }
    }

    pub fn to_json(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(ProtocolError::Encode)
    }

    pub fn from_json(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(ProtocolError::Decode)
    }
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("failed to encode message: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("failed to decode message: {0}")]
    Decode(#[source] serde_json::Error),
    #[error("malformed session description: {0}")]
    MalformedDescription(String),
    #[error("unknown role {0:?}")]
    UnknownRole(String),
}

/// Milliseconds since the unix epoch, the timestamp unit used on the wire.
pub fn now_millis() -> i64 {
    let now = OffsetDateTime::now_utc();
    (now.unix_timestamp_nanos() / 1_000_000) as i64
}
