use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use fieldcall_core::telemetry::LogLevel;
use fieldcall_proto::Role;

#[derive(Debug, Parser)]
#[command(
    name = "fieldcall",
    author,
    version,
    about = "Peer-to-peer video consultation with a remote agronomist"
)]
pub struct Cli {
    #[arg(long, value_enum, default_value_t = LogLevel::Warn, global = true)]
    pub log_level: LogLevel,

    /// Write logs to this file instead of stderr.
    #[arg(long, env = "FIELDCALL_LOG_FILE", global = true)]
    pub log_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Join (or open) a consultation and chat from the terminal.
    Join(JoinArgs),
}

#[derive(Debug, Args)]
pub struct JoinArgs {
    /// Consultation / session identifier shared by both participants.
    #[arg(long)]
    pub session: String,

    /// `initiator` sends the offer; `responder` answers it.
    #[arg(long)]
    pub role: Role,

    /// Signaling relay base url, used when no backend is given.
    #[arg(long, env = "FIELDCALL_RELAY_URL", default_value = "ws://127.0.0.1:8787")]
    pub relay: String,

    /// Relay authorization token, used when no backend is given.
    #[arg(long, env = "FIELDCALL_SIGNALING_TOKEN")]
    pub token: Option<String>,

    /// Consultation backend that issues signaling grants.
    #[arg(long, env = "FIELDCALL_BACKEND_URL")]
    pub backend: Option<String>,

    /// Bearer token presented to the backend.
    #[arg(long, env = "FIELDCALL_BACKEND_TOKEN")]
    pub backend_token: Option<String>,

    #[arg(long, default_value_t = false)]
    pub no_video: bool,

    #[arg(long, default_value_t = false)]
    pub no_audio: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_join_flags() {
        let cli = Cli::try_parse_from([
            "fieldcall",
            "--log-level",
            "debug",
            "join",
            "--session",
            "consult-3",
            "--role",
            "responder",
            "--relay",
            "wss://relay.example.org",
            "--no-video",
        ])
        .expect("parse");
        assert_eq!(cli.log_level, LogLevel::Debug);
        let Command::Join(join) = cli.command;
        assert_eq!(join.session, "consult-3");
        assert_eq!(join.role, Role::Responder);
        assert_eq!(join.relay, "wss://relay.example.org");
        assert!(join.no_video);
        assert!(!join.no_audio);
    }

    #[test]
    fn rejects_unknown_role() {
        let err = Cli::try_parse_from([
            "fieldcall", "join", "--session", "s", "--role", "observer",
        ])
        .expect_err("unknown role");
        assert_eq!(err.kind(), clap::error::ErrorKind::ValueValidation);
    }
}
