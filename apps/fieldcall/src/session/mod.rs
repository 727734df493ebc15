//! The session core: negotiation, candidate ordering, local media, chat and
//! the lifecycle controller that ties them together.

use fieldcall_proto::{Role, now_millis};

pub mod chat;
pub mod controller;
pub mod ice;
pub mod media;
pub mod negotiator;
mod state;

pub use chat::ChatChannel;
pub use controller::{Collaborators, SessionController, SessionEvent, StepOutcome, TeardownReport};
pub use ice::{CandidateDisposition, IceCandidateManager};
pub use media::{MediaPipeline, MediaStreamHandle};
pub use negotiator::SessionNegotiator;
pub use state::SessionState;

/// One consultation as seen by this side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub id: String,
    pub role: Role,
    /// Milliseconds since the unix epoch.
    pub created_at: i64,
}

impl Session {
    pub fn new(id: impl Into<String>, role: Role) -> Self {
        Self {
            id: id.into(),
            role,
            created_at: now_millis(),
        }
    }

    /// The role the other participant plays.
    pub fn remote_role(&self) -> Role {
        self.role.opposite()
    }
}
