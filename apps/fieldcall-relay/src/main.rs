mod relay;
mod websocket;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use axum::{routing::get, Router};
use clap::Parser;
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::relay::Relay;
use crate::websocket::{health_check, websocket_handler, AppState};

const FILTER_ENV: &str = "FIELDCALL_LOG_FILTER";

#[derive(Debug, Parser)]
#[command(name = "fieldcall-relay", version, about = "Signaling relay for fieldcall sessions")]
struct Cli {
    /// Address to listen on
    #[arg(long, env = "FIELDCALL_RELAY_LISTEN_ADDR", default_value = "127.0.0.1:8787")]
    listen: SocketAddr,

    /// Messages held per session while the other participant is absent
    #[arg(long, env = "FIELDCALL_RELAY_BACKLOG", default_value_t = 64)]
    backlog: usize,

    /// Shared token clients must present as `?token=`
    #[arg(long, env = "FIELDCALL_RELAY_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Log level used when FIELDCALL_LOG_FILTER is unset
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[derive(Debug, Clone)]
struct RelayConfig {
    listen: SocketAddr,
    backlog_limit: usize,
    token: Option<String>,
}

impl TryFrom<Cli> for RelayConfig {
    type Error = anyhow::Error;

    fn try_from(cli: Cli) -> Result<Self> {
        if cli.backlog == 0 {
            bail!("--backlog must be at least 1");
        }
        let token = cli.token.filter(|token| !token.trim().is_empty());
        Ok(Self {
            listen: cli.listen,
            backlog_limit: cli.backlog,
            token,
        })
    }
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/ws/:session_id", get(websocket_handler))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let filter = EnvFilter::try_from_env(FILTER_ENV)
        .or_else(|_| EnvFilter::try_new(&cli.log_level))
        .context("invalid log filter")?;
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = RelayConfig::try_from(cli)?;
    let state = AppState {
        relay: Relay::new(config.backlog_limit),
        token: config.token.map(Arc::from),
    };

    let listener = tokio::net::TcpListener::bind(config.listen)
        .await
        .with_context(|| format!("failed to bind {}", config.listen))?;
    info!(
        target: "fieldcall_relay",
        addr = %config.listen,
        backlog = config.backlog_limit,
        token_required = state.token.is_some(),
        "relay listening"
    );

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await
        .context("relay server failed")?;
    info!(target: "fieldcall_relay", "relay stopped");
    Ok(())
}
