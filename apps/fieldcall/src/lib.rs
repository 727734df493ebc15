pub mod backend;
pub mod config;
pub mod error;
pub mod peer;
pub mod session;
pub mod telemetry;
pub mod transport;

pub use config::{IceServer, SessionConfig, SessionConfigBuilder};
pub use error::SessionError;
pub use session::{Collaborators, SessionController, SessionEvent, SessionState, TeardownReport};
