//! Session rooms: admission, forwarding, backlog and presence notices.

use std::collections::VecDeque;
use std::sync::Arc;

use dashmap::DashMap;
use fieldcall_proto::{Participant, SignalingMessage};
use thiserror::Error;
use tokio::sync::mpsc;

pub const ROOM_CAPACITY: usize = 2;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RelayError {
    #[error("session full")]
    SessionFull,
    #[error("invalid signaling message: {0}")]
    Malformed(String),
    #[error("message for session {got} sent on session {expected}")]
    SessionMismatch { expected: String, got: String },
    #[error("{0} notices are issued by the relay")]
    Reserved(&'static str),
    #[error("peer {0} is not in the session")]
    UnknownPeer(String),
}

/// Where a forwarded message ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Forwarded {
    Delivered,
    /// No one else is connected; held for the next participant.
    Held,
}

struct Member {
    peer_id: String,
    tx: mpsc::UnboundedSender<String>,
}

#[derive(Default)]
struct Room {
    members: Vec<Member>,
    backlog: VecDeque<String>,
}

/// Shared relay state. Clones see the same rooms.
#[derive(Clone)]
pub struct Relay {
    rooms: Arc<DashMap<String, Room>>,
    backlog_limit: usize,
}

impl Relay {
    pub fn new(backlog_limit: usize) -> Self {
        Self {
            rooms: Arc::new(DashMap::new()),
            backlog_limit,
        }
    }

    /// Adds a participant to `session_id` and returns its peer id and the
    /// queue of frames to write to it. The other participant (if any) learns
    /// about the newcomer and vice versa; held messages follow.
    pub fn admit(
        &self,
        session_id: &str,
    ) -> Result<(String, mpsc::UnboundedReceiver<String>), RelayError> {
        let mut room = self.rooms.entry(session_id.to_string()).or_default();
        if room.members.len() >= ROOM_CAPACITY {
            return Err(RelayError::SessionFull);
        }

        let peer_id = uuid::Uuid::new_v4().to_string();
        let (tx, rx) = mpsc::unbounded_channel();
        for existing in &room.members {
            send_notice(&existing.tx, joined(session_id, &peer_id));
            send_notice(&tx, joined(session_id, &existing.peer_id));
        }
        let held = room.backlog.len();
        for frame in room.backlog.drain(..) {
            let _ = tx.send(frame);
        }
        room.members.push(Member {
            peer_id: peer_id.clone(),
            tx,
        });
        tracing::info!(
            target: "fieldcall_relay::room",
            session_id,
            peer_id = %peer_id,
            participants = room.members.len(),
            held,
            "participant joined"
        );
        Ok((peer_id, rx))
    }

    /// Validates `text` and passes it on unchanged to the other participant.
    pub fn forward(&self, session_id: &str, from: &str, text: &str) -> Result<Forwarded, RelayError> {
        let message =
            SignalingMessage::from_json(text).map_err(|err| RelayError::Malformed(err.to_string()))?;
        if message.session_id() != session_id {
            return Err(RelayError::SessionMismatch {
                expected: session_id.to_string(),
                got: message.session_id().to_string(),
            });
        }
        if matches!(
            message,
            SignalingMessage::UserJoined { .. } | SignalingMessage::UserLeft { .. }
        ) {
            return Err(RelayError::Reserved(message.kind()));
        }

        let mut room = self
            .rooms
            .get_mut(session_id)
            .ok_or_else(|| RelayError::UnknownPeer(from.to_string()))?;
        if !room.members.iter().any(|m| m.peer_id == from) {
            return Err(RelayError::UnknownPeer(from.to_string()));
        }

        let mut delivered = false;
        for member in room.members.iter().filter(|m| m.peer_id != from) {
            delivered |= member.tx.send(text.to_string()).is_ok();
        }
        if delivered {
            return Ok(Forwarded::Delivered);
        }
        if room.backlog.len() >= self.backlog_limit {
            room.backlog.pop_front();
            tracing::warn!(
                target: "fieldcall_relay::room",
                session_id,
                limit = self.backlog_limit,
                "backlog full; dropping oldest message"
            );
        }
        room.backlog.push_back(text.to_string());
        Ok(Forwarded::Held)
    }

    /// Removes a participant, tells the remaining one, and drops the room
    /// once it is empty.
    pub fn leave(&self, session_id: &str, peer_id: &str) {
        let empty = match self.rooms.get_mut(session_id) {
            Some(mut room) => {
                let before = room.members.len();
                room.members.retain(|m| m.peer_id != peer_id);
                if room.members.len() != before {
                    for member in &room.members {
                        send_notice(&member.tx, left(session_id, peer_id));
                    }
                    tracing::info!(
                        target: "fieldcall_relay::room",
                        session_id,
                        peer_id,
                        "participant left"
                    );
                }
                room.members.is_empty()
            }
            None => false,
        };
        if empty {
            self.rooms.remove_if(session_id, |_, room| room.members.is_empty());
        }
    }

    pub fn participants(&self, session_id: &str) -> usize {
        self.rooms
            .get(session_id)
            .map(|room| room.members.len())
            .unwrap_or(0)
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }
}

fn joined(session_id: &str, peer_id: &str) -> SignalingMessage {
    SignalingMessage::UserJoined {
        session_id: session_id.to_string(),
        payload: Participant {
            peer_id: peer_id.to_string(),
            role: None,
        },
    }
}

fn left(session_id: &str, peer_id: &str) -> SignalingMessage {
    SignalingMessage::UserLeft {
        session_id: session_id.to_string(),
        payload: Participant {
            peer_id: peer_id.to_string(),
            role: None,
        },
    }
}

fn send_notice(tx: &mpsc::UnboundedSender<String>, notice: SignalingMessage) {
    match notice.to_json() {
        Ok(text) => {
            let _ = tx.send(text);
        }
        Err(err) => {
            tracing::error!(target: "fieldcall_relay::room", error = %err, "failed to encode notice")
        }
    }
}
