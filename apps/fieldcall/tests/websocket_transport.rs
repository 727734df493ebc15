use std::borrow::Cow;
use std::collections::HashMap;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use axum::extract::{Path, Query, WebSocketUpgrade};
use axum::routing::get;
use axum::Router;
use fieldcall_core::transport::{
    SignalingTransport, TransportError, TransportEvent, WebSocketTransport,
};
use fieldcall_proto::{IceCandidate, Participant, SignalingMessage};
use tokio::sync::mpsc;
use url::Url;

const WAIT: Duration = Duration::from_secs(2);

/// Greets with `user-joined` (peer id = presented token), sends one frame for
/// a different session, echoes everything else and hangs up on
/// `session-ended`.
async fn scripted_relay(mut socket: WebSocket, session_id: String, token: Option<String>) {
    let greeting = SignalingMessage::UserJoined {
        session_id: session_id.clone(),
        payload: Participant {
            peer_id: token.unwrap_or_else(|| "anonymous".into()),
            role: None,
        },
    };
    let stray = SignalingMessage::ended("some-other-session", None);
    for message in [greeting, stray] {
        let text = message.to_json().expect("encode");
        if socket.send(Message::Text(text)).await.is_err() {
            return;
        }
    }

    while let Some(Ok(frame)) = socket.recv().await {
        let Message::Text(text) = frame else { continue };
        match SignalingMessage::from_json(&text) {
            Ok(SignalingMessage::SessionEnded { .. }) => {
                let _ = socket
                    .send(Message::Close(Some(CloseFrame {
                        code: 1000,
                        reason: Cow::Borrowed("bye"),
                    })))
                    .await;
                return;
            }
            _ => {
                if socket.send(Message::Text(text)).await.is_err() {
                    return;
                }
            }
        }
    }
}

async fn spawn_scripted_relay() -> Url {
    let app = Router::new().route(
        "/ws/:session_id",
        get(
            |ws: WebSocketUpgrade,
             Path(session_id): Path<String>,
             Query(query): Query<HashMap<String, String>>| async move {
                let token = query.get("token").cloned();
                ws.on_upgrade(move |socket| scripted_relay(socket, session_id, token))
            },
        ),
    );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    Url::parse(&format!("ws://{addr}")).expect("relay url")
}

async fn next_event(rx: &mut mpsc::UnboundedReceiver<TransportEvent>) -> TransportEvent {
    tokio::time::timeout(WAIT, rx.recv())
        .await
        .expect("event in time")
        .expect("dispatcher alive")
}

#[tokio::test]
async fn exchanges_messages_and_reports_remote_close() {
    let relay = spawn_scripted_relay().await;
    let transport = WebSocketTransport::new(relay, Some("tok-1".into()), WAIT);
    transport.connect("s1").await.expect("connect");
    assert!(transport.is_connected());
    assert_eq!(
        transport.connect("s1").await,
        Err(TransportError::AlreadyConnected("s1".into()))
    );

    let (tx, mut rx) = mpsc::unbounded_channel();
    transport
        .on_message(Box::new(move |event| {
            let _ = tx.send(event);
        }))
        .expect("handler");
    assert_eq!(
        transport.on_message(Box::new(|_event: TransportEvent| {})),
        Err(TransportError::HandlerRegistered)
    );

    match next_event(&mut rx).await {
        TransportEvent::Message(SignalingMessage::UserJoined { payload, .. }) => {
            assert_eq!(payload.peer_id, "tok-1");
        }
        other => panic!("expected user-joined, got {other:?}"),
    }

    let candidate = SignalingMessage::candidate(
        "s1",
        IceCandidate::new("candidate:2 1 udp 1686052607 203.0.113.9 61000 typ srflx"),
    );
    transport.send(&candidate).expect("send");
    // the frame for another session was dropped, so the echo comes next
    assert_eq!(next_event(&mut rx).await, TransportEvent::Message(candidate));

    transport
        .send(&SignalingMessage::ended("s1", None))
        .expect("send end");
    match next_event(&mut rx).await {
        TransportEvent::Disconnected { reason } => assert_eq!(reason, "bye"),
        other => panic!("expected disconnect, got {other:?}"),
    }

    transport.close().await.expect("close");
    transport.close().await.expect("close is idempotent");
    assert!(!transport.is_connected());
}

#[tokio::test]
async fn unreachable_relay_fails_the_handshake() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("addr");
    drop(listener);

    let relay = Url::parse(&format!("ws://{addr}")).expect("url");
    let transport = WebSocketTransport::new(relay, None, WAIT);
    match transport.connect("s1").await {
        Err(TransportError::Handshake(_)) => {}
        other => panic!("expected handshake failure, got {other:?}"),
    }
    assert!(!transport.is_connected());
}

#[tokio::test]
async fn concurrent_connects_keep_a_single_link() {
    let relay = spawn_scripted_relay().await;
    let transport = WebSocketTransport::new(relay, Some("tok-2".into()), WAIT);
    let (first, second) = tokio::join!(transport.connect("s1"), transport.connect("s1"));
    let results = [first, second];
    assert_eq!(results.iter().filter(|result| result.is_ok()).count(), 1);
    assert!(results.contains(&Err(TransportError::AlreadyConnected("s1".into()))));

    let (tx, mut rx) = mpsc::unbounded_channel();
    transport
        .on_message(Box::new(move |event| {
            let _ = tx.send(event);
        }))
        .expect("handler");
    match next_event(&mut rx).await {
        TransportEvent::Message(SignalingMessage::UserJoined { payload, .. }) => {
            assert_eq!(payload.peer_id, "tok-2");
        }
        other => panic!("expected user-joined, got {other:?}"),
    }
    transport.close().await.expect("close");
}
