use std::fmt;

/// Lifecycle of one consultation session.
///
/// ```text
/// idle -> connecting -> negotiating -> active -> ending -> closed
///             \______________\____________\-----> failed
/// ```
/// `closed` may start again; `failed` is terminal for the controller that
/// reached it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Idle,
    Connecting,
    Negotiating,
    Active,
    Ending,
    Closed,
    Failed,
}

impl SessionState {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::Connecting => "connecting",
            SessionState::Negotiating => "negotiating",
            SessionState::Active => "active",
            SessionState::Ending => "ending",
            SessionState::Closed => "closed",
            SessionState::Failed => "failed",
        }
    }

    pub fn can_start(self) -> bool {
        matches!(self, SessionState::Idle | SessionState::Closed)
    }

    /// A session exists and owns resources that teardown must release.
    pub fn is_live(self) -> bool {
        matches!(
            self,
            SessionState::Connecting | SessionState::Negotiating | SessionState::Active
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Closed | SessionState::Failed)
    }

    pub fn can_transition(self, to: SessionState) -> bool {
        use SessionState::*;
        match (self, to) {
            (Idle | Closed, Connecting) => true,
            (Connecting, Negotiating) => true,
            (Negotiating, Active) => true,
            (Connecting | Negotiating | Active, Ending) => true,
            (Connecting | Negotiating | Active, Failed) => true,
            (Ending, Closed) => true,
            _ => false,
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
