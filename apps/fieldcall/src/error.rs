use thiserror::Error;

use crate::peer::{CaptureError, PeerError};
use crate::session::SessionState;
use crate::transport::TransportError;

/// Errors surfaced by the session core to its caller.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SessionError {
    /// Signaling relay unreachable, handshake refused, timed out or dropped.
    #[error("signaling connection failed: {0}")]
    Connection(String),
    /// Malformed or rejected session description.
    #[error("session negotiation failed: {0}")]
    Negotiation(String),
    /// Camera or microphone unavailable.
    #[error("media access failed: {0}")]
    MediaAccess(String),
    #[error("{operation} is not allowed while {state}")]
    InvalidState {
        operation: &'static str,
        state: String,
    },
    /// Chat send attempted while the data channel is not open.
    #[error("chat channel unavailable: {0}")]
    Channel(String),
}

impl SessionError {
    pub fn invalid_state(operation: &'static str, state: impl std::fmt::Display) -> Self {
        SessionError::InvalidState {
            operation,
            state: state.to_string(),
        }
    }

    pub(crate) fn in_state(operation: &'static str, state: SessionState) -> Self {
        Self::invalid_state(operation, state.as_str())
    }

    /// Short machine-friendly label used in log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            SessionError::Connection(_) => "connection",
            SessionError::Negotiation(_) => "negotiation",
            SessionError::MediaAccess(_) => "media_access",
            SessionError::InvalidState { .. } => "invalid_state",
            SessionError::Channel(_) => "channel",
        }
    }
}

impl From<TransportError> for SessionError {
    fn from(err: TransportError) -> Self {
        SessionError::Connection(err.to_string())
    }
}

impl From<PeerError> for SessionError {
    fn from(err: PeerError) -> Self {
        SessionError::Negotiation(err.to_string())
    }
}

impl From<CaptureError> for SessionError {
    fn from(err: CaptureError) -> Self {
        SessionError::MediaAccess(err.to_string())
    }
}

impl From<fieldcall_proto::ProtocolError> for SessionError {
    fn from(err: fieldcall_proto::ProtocolError) -> Self {
        SessionError::Negotiation(err.to_string())
    }
}
