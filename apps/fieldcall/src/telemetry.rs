//! Logging setup shared by the `fieldcall` binaries.

use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::OnceLock;

use clap::ValueEnum;
use thiserror::Error;
use tracing::level_filters::LevelFilter;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

use crate::config::env_truthy;

pub const FILTER_ENV: &str = "FIELDCALL_LOG_FILTER";
const TRACE_DEPS_ENV: &str = "FIELDCALL_TRACE_DEPS";

#[derive(Clone, Copy, Debug, Default, ValueEnum, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Error,
    #[default]
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }

    pub fn to_filter(self) -> LevelFilter {
        match self {
            LogLevel::Error => LevelFilter::ERROR,
            LogLevel::Warn => LevelFilter::WARN,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Trace => LevelFilter::TRACE,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct LogConfig {
    pub level: LogLevel,
    /// Append to this file instead of writing to stderr.
    pub file: Option<PathBuf>,
}

#[derive(Debug, Error)]
pub enum InitError {
    #[error("failed to open log file {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to install logger: {0}")]
    Install(String),
}

// Keeps the non-blocking writer flushing until the process exits.
static GUARD: OnceLock<WorkerGuard> = OnceLock::new();

/// Installs the global subscriber. Later calls are no-ops.
pub fn init(config: &LogConfig) -> Result<(), InitError> {
    if GUARD.get().is_some() {
        return Ok(());
    }

    let (writer, guard) = match &config.file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|source| InitError::Io {
                    path: path.clone(),
                    source,
                })?;
            tracing_appender::non_blocking(file)
        }
        None => tracing_appender::non_blocking(std::io::stderr()),
    };

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(env_filter(config.level))
        .with_target(config.level >= LogLevel::Debug)
        .with_thread_names(config.level >= LogLevel::Trace)
        .with_ansi(config.file.is_none())
        .with_writer(writer)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .map_err(|err| InitError::Install(err.to_string()))?;

    let _ = GUARD.set(guard);
    Ok(())
}

fn env_filter(level: LogLevel) -> EnvFilter {
    match std::env::var(FILTER_ENV) {
        Ok(filter) => EnvFilter::new(filter),
        Err(_) => EnvFilter::new(default_directives(level, env_truthy(TRACE_DEPS_ENV))),
    }
}

// The webrtc stack is extremely chatty below info.
const NOISY_TARGETS: &[&str] = &[
    "webrtc",
    "webrtc_ice",
    "webrtc_dtls",
    "webrtc_sctp",
    "webrtc_srtp",
    "webrtc_mdns",
    "interceptor",
    "tungstenite",
    "tokio_tungstenite",
    "reqwest",
    "hyper",
];

fn default_directives(level: LogLevel, include_deps: bool) -> String {
    let mut directives = match level {
        LogLevel::Debug | LogLevel::Trace => {
            format!("info,fieldcall={0},fieldcall_core={0},fieldcall_relay={0}", level.as_str())
        }
        other => other.as_str().to_string(),
    };
    if level >= LogLevel::Debug && !include_deps {
        for target in NOISY_TARGETS {
            directives.push(',');
            directives.push_str(target);
            directives.push_str("=warn");
        }
    }
    directives
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quiet_levels_use_a_single_directive() {
        assert_eq!(default_directives(LogLevel::Warn, false), "warn");
        assert_eq!(default_directives(LogLevel::Info, false), "info");
    }

    #[test]
    fn verbose_levels_mute_the_webrtc_stack() {
        let directives = default_directives(LogLevel::Debug, false);
        assert!(directives.starts_with("info,fieldcall=debug,fieldcall_core=debug"));
        assert!(directives.contains("webrtc_ice=warn"));

        let directives = default_directives(LogLevel::Trace, true);
        assert!(!directives.contains("webrtc_ice"));
    }
}
