mod cli;

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use fieldcall_core::backend::{ConsultationBackend, HttpConsultationBackend};
use fieldcall_core::peer::rtc::{RtcPeerFactory, SampleCapture};
use fieldcall_core::telemetry::{self, LogConfig};
use fieldcall_core::transport::WebSocketTransportFactory;
use fieldcall_core::{Collaborators, SessionConfig, SessionController, SessionEvent};
use tokio::io::{AsyncBufReadExt, BufReader};
use url::Url;

use cli::{Cli, Command, JoinArgs};

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    telemetry::init(&LogConfig {
        level: cli.log_level,
        file: cli.log_file.clone(),
    })
    .context("failed to initialise logging")?;

    match cli.command {
        Command::Join(args) => join(args).await,
    }
}

async fn join(args: JoinArgs) -> Result<()> {
    let backend: Option<Arc<dyn ConsultationBackend>> = match &args.backend {
        Some(base) => {
            let mut client = HttpConsultationBackend::new(base)
                .with_context(|| format!("invalid backend url {base}"))?;
            if let Some(bearer) = &args.backend_token {
                client = client.with_bearer(bearer.clone());
            }
            let client: Arc<dyn ConsultationBackend> = Arc::new(client);
            Some(client)
        }
        None => None,
    };

    let (relay, token) = match &backend {
        Some(backend) => {
            let grant = backend
                .signaling_token(&args.session)
                .await
                .context("failed to obtain a signaling grant")?;
            (grant.relay_url, Some(grant.token))
        }
        None => (args.relay.clone(), args.token.clone()),
    };
    let relay = Url::parse(&relay).with_context(|| format!("invalid relay url {relay}"))?;
    let mut transports = WebSocketTransportFactory::new(relay);
    if let Some(token) = token {
        transports = transports.with_token(token);
    }

    let mut config = SessionConfig::from_env().context("invalid session configuration")?;
    config.send_video = !args.no_video;
    config.send_audio = !args.no_audio;

    let controller = SessionController::new(
        config,
        Collaborators {
            transports: Arc::new(transports),
            peers: Arc::new(RtcPeerFactory::new()),
            capture: Arc::new(SampleCapture::default()),
            backend,
        },
    );

    controller.on_chat_message(|message| {
        println!("[{}] {}", message.sender_role, message.text);
    });
    let mut events = controller.subscribe();
    let printer = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                SessionEvent::StateChanged { to, .. } => println!("* session {to}"),
                SessionEvent::Error(err) => eprintln!("! {err}"),
                SessionEvent::PeerJoined(peer) => println!("* {} joined", peer.peer_id),
                SessionEvent::PeerLeft(peer) => println!("* {} left", peer.peer_id),
                SessionEvent::RemoteTrack { kind, .. } => {
                    println!("* receiving remote {}", kind.as_str())
                }
                SessionEvent::TornDown(report) if !report.is_clean() => {
                    eprintln!("! teardown incomplete: {report:?}")
                }
                SessionEvent::TornDown(_) => {}
            }
        }
    });

    controller
        .start_session(&args.session, args.role)
        .await
        .with_context(|| format!("failed to start session {}", args.session))?;
    println!("joined {} as {}; type to chat, /video, /audio, /quit", args.session, args.role);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut state = controller.watch_state();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = state.wait_for(|state| state.is_terminal()) => break,
            line = lines.next_line() => {
                let Some(line) = line.context("failed to read stdin")? else { break };
                match line.trim() {
                    "" => {}
                    "/quit" => break,
                    "/video" => match controller.toggle_video().await {
                        Some(enabled) => println!("* video {}", if enabled { "on" } else { "off" }),
                        None => println!("* no local video track"),
                    },
                    "/audio" => match controller.toggle_audio().await {
                        Some(enabled) => println!("* audio {}", if enabled { "on" } else { "off" }),
                        None => println!("* no local audio track"),
                    },
                    text => {
                        if !controller.send_chat(text).await {
                            println!("* not delivered: chat is not connected yet");
                        }
                    }
                }
            }
        }
    }

    controller.end_session().await?;
    printer.abort();
    Ok(())
}
