use serde::{Deserialize, Serialize};

use crate::{now_millis, ProtocolError, Role};

/// A line of text chat carried over the session's data channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub text: String,
    /// Milliseconds since the unix epoch, stamped by the sender.
    pub timestamp: i64,
    pub sender_role: Role,
}

impl ChatMessage {
    pub fn new(text: impl Into<String>, sender_role: Role) -> Self {
        Self {
            text: text.into(),
            timestamp: now_millis(),
            sender_role,
        }
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(ProtocolError::Encode)
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(ProtocolError::Decode)
    }
}
