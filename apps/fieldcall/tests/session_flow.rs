use std::sync::Arc;
use std::time::Duration;

use event_bus::Subscription;
use fieldcall_core::peer::mock::{FakeCapture, FakeNetwork, FakePeerFactory};
use fieldcall_core::peer::{MediaTrack, TrackKind};
use fieldcall_core::session::StepOutcome;
use fieldcall_core::transport::{MemoryRelay, MemoryTransport, SignalingTransport, TransportEvent};
use fieldcall_core::{
    Collaborators, SessionConfig, SessionController, SessionError, SessionEvent, SessionState,
};
use fieldcall_proto::{IceCandidate, Role, SessionDescription, SignalingMessage};
use tokio::sync::mpsc;

const WAIT: Duration = Duration::from_secs(2);
const ANSWER_SDP: &str = "v=0\r\no=- 7 1 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\n";

struct Side {
    controller: SessionController,
    capture: Arc<FakeCapture>,
    peers: Arc<FakePeerFactory>,
}

fn side(relay: &MemoryRelay, peers: FakePeerFactory) -> Side {
    side_with(relay, peers, SessionConfig::localhost())
}

fn side_with(relay: &MemoryRelay, peers: FakePeerFactory, config: SessionConfig) -> Side {
    let capture = Arc::new(FakeCapture::default());
    let peers = Arc::new(peers);
    let controller = SessionController::new(
        config,
        Collaborators {
            transports: Arc::new(relay.clone()),
            peers: peers.clone(),
            capture: capture.clone(),
            backend: None,
        },
    );
    Side {
        controller,
        capture,
        peers,
    }
}

async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + WAIT;
    while !check() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {what}"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

async fn reaches(controller: &SessionController, state: SessionState) {
    let reached = controller.wait_for_state(WAIT, |s| *s == state).await;
    assert_eq!(reached, Some(state), "controller never reached {state}");
}

/// Collects events up to and including the move into a terminal state.
async fn until_settled(events: &mut Subscription<SessionEvent>) -> Vec<SessionEvent> {
    let mut seen = Vec::new();
    loop {
        match tokio::time::timeout(WAIT, events.recv()).await {
            Ok(Some(event)) => {
                let settled =
                    matches!(event, SessionEvent::StateChanged { to, .. } if to.is_terminal());
                seen.push(event);
                if settled {
                    return seen;
                }
            }
            other => panic!("session never settled: {other:?}"),
        }
    }
}

async fn next_error(events: &mut Subscription<SessionEvent>) -> SessionError {
    loop {
        match tokio::time::timeout(WAIT, events.recv()).await {
            Ok(Some(SessionEvent::Error(err))) => return err,
            Ok(Some(_)) => continue,
            other => panic!("no error event: {other:?}"),
        }
    }
}

/// A hand-driven remote participant on the relay.
async fn manual_remote(
    relay: &MemoryRelay,
    session_id: &str,
) -> (MemoryTransport, mpsc::UnboundedReceiver<TransportEvent>) {
    let transport = relay.transport(WAIT);
    transport.connect(session_id).await.expect("remote connect");
    let (tx, rx) = mpsc::unbounded_channel();
    transport
        .on_message(Box::new(move |event| {
            let _ = tx.send(event);
        }))
        .expect("remote handler");
    (transport, rx)
}

async fn next_offer(rx: &mut mpsc::UnboundedReceiver<TransportEvent>) -> SessionDescription {
    loop {
        match tokio::time::timeout(WAIT, rx.recv()).await {
            Ok(Some(TransportEvent::Message(SignalingMessage::Offer { payload, .. }))) => {
                return payload;
            }
            Ok(Some(_)) => continue,
            other => panic!("no offer: {other:?}"),
        }
    }
}

#[tokio::test]
async fn two_controllers_connect_chat_and_hang_up() {
    let relay = MemoryRelay::new();
    let network = FakeNetwork::new();
    let vet = side(&relay, network.factory());
    let farmer = side(&relay, network.factory());

    vet.controller
        .start_session("c-1", Role::Initiator)
        .await
        .expect("initiator starts");
    assert_eq!(vet.controller.state(), SessionState::Negotiating);
    farmer
        .controller
        .start_session("c-1", Role::Responder)
        .await
        .expect("responder starts");

    let vet_peer = vet.peers.last().expect("initiator peer");
    eventually("answer applied", || vet_peer.remote_description().is_some()).await;
    network.establish();
    reaches(&vet.controller, SessionState::Active).await;
    reaches(&farmer.controller, SessionState::Active).await;

    eventually("responder chat open", || farmer.controller.chat_open()).await;
    let (tx, mut rx) = mpsc::unbounded_channel();
    farmer.controller.on_chat_message(move |message| {
        let _ = tx.send(message);
    });
    assert!(vet.controller.send_chat("how many animals are coughing?").await);
    let message = tokio::time::timeout(WAIT, rx.recv())
        .await
        .expect("chat delivered in time")
        .expect("chat message");
    assert_eq!(message.text, "how many animals are coughing?");
    assert_eq!(message.sender_role, Role::Initiator);

    assert_eq!(vet.controller.toggle_video().await, Some(false));
    let video = vet
        .capture
        .issued()
        .into_iter()
        .find(|track| track.kind() == TrackKind::Video)
        .expect("video track");
    assert!(!video.is_enabled());

    vet.controller.end_session().await.expect("end");
    assert_eq!(vet.controller.state(), SessionState::Closed);
    reaches(&farmer.controller, SessionState::Closed).await;

    let report = vet.controller.last_teardown().expect("teardown report");
    assert!(report.is_clean());
    assert_eq!(report.tracks_stopped, 2);
    assert!(vet.capture.issued().iter().all(|track| track.is_stopped()));
    assert!(vet_peer.is_closed());
    assert!(!vet.controller.send_chat("still there?").await);
    assert_eq!(relay.participants("c-1"), 0);
}

#[tokio::test]
async fn candidates_before_the_answer_wait_for_it() {
    let relay = MemoryRelay::new();
    let vet = side(&relay, FakePeerFactory::new());
    vet.controller
        .start_session("c-2", Role::Initiator)
        .await
        .expect("start");
    let (remote, mut inbound) = manual_remote(&relay, "c-2").await;
    next_offer(&mut inbound).await;

    let candidate = IceCandidate::new("candidate:1 1 udp 2122260223 10.0.0.7 50000 typ host")
        .with_mid("0", 0);
    remote
        .send(&SignalingMessage::candidate("c-2", candidate.clone()))
        .expect("send candidate");
    let peer = vet.peers.last().expect("peer");
    for _ in 0..100 {
        if vet.controller.queued_candidates().await == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(vet.controller.queued_candidates().await, 1);
    assert!(peer.applied_candidates().is_empty());

    remote
        .send(&SignalingMessage::description(
            "c-2",
            SessionDescription::answer(ANSWER_SDP),
        ))
        .expect("send answer");
    eventually("queued candidate applied", || peer.applied_candidates().len() == 1).await;
    assert_eq!(peer.applied_candidates(), vec![candidate]);
    assert_eq!(vet.controller.queued_candidates().await, 0);
}

#[tokio::test]
async fn failed_offer_is_retried_once() {
    let relay = MemoryRelay::new();
    let peers = FakePeerFactory::new();
    peers.fail_offers(1);
    let vet = side(&relay, peers);
    vet.controller
        .start_session("c-3", Role::Initiator)
        .await
        .expect("start despite one failed offer");

    let offers = relay
        .forwarded("c-3")
        .into_iter()
        .filter(|message| matches!(message, SignalingMessage::Offer { .. }))
        .count();
    assert_eq!(offers, 1);
    assert!(vet.peers.last().expect("peer").local_description().is_some());
}

#[tokio::test]
async fn relay_drop_fails_the_session() {
    let relay = MemoryRelay::new();
    let vet = side(&relay, FakePeerFactory::new());
    let mut events = vet.controller.subscribe();
    vet.controller
        .start_session("c-4", Role::Initiator)
        .await
        .expect("start");

    relay.drop_peer("c-4", "peer-1");
    let err = next_error(&mut events).await;
    assert_eq!(err.kind(), "connection");
    let settled = until_settled(&mut events).await;
    assert!(
        settled
            .iter()
            .any(|event| matches!(event, SessionEvent::TornDown(_))),
        "failed was announced before cleanup finished: {settled:?}"
    );
    assert_eq!(vet.controller.state(), SessionState::Failed);
    assert!(vet.controller.last_teardown().is_some());
    assert!(vet.peers.last().expect("peer").is_closed());

    let err = vet
        .controller
        .start_session("c-4", Role::Initiator)
        .await
        .expect_err("failed controller does not restart");
    assert_eq!(err.kind(), "invalid_state");
}

#[tokio::test]
async fn remote_hang_up_closes_the_session() {
    let relay = MemoryRelay::new();
    let vet = side(&relay, FakePeerFactory::new());
    vet.controller
        .start_session("c-5", Role::Initiator)
        .await
        .expect("start");
    let (remote, mut inbound) = manual_remote(&relay, "c-5").await;
    next_offer(&mut inbound).await;

    remote
        .send(&SignalingMessage::ended("c-5", Some("farmer hung up".into())))
        .expect("send end");
    reaches(&vet.controller, SessionState::Closed).await;
    eventually("teardown recorded", || vet.controller.last_teardown().is_some()).await;
    assert!(vet.controller.last_teardown().expect("report").is_clean());
}

#[tokio::test]
async fn second_start_is_rejected() {
    let relay = MemoryRelay::new();
    let vet = side(&relay, FakePeerFactory::new());
    vet.controller
        .start_session("c-6", Role::Initiator)
        .await
        .expect("start");
    let err = vet
        .controller
        .start_session("c-7", Role::Initiator)
        .await
        .expect_err("already running");
    assert_eq!(err.kind(), "invalid_state");
    assert_eq!(vet.controller.session().expect("session").id, "c-6");
    assert_eq!(vet.controller.state(), SessionState::Negotiating);
}

#[tokio::test]
async fn denied_media_fails_and_releases_everything() {
    let relay = MemoryRelay::new();
    let vet = side(&relay, FakePeerFactory::new());
    vet.capture.deny_permission();
    let mut events = vet.controller.subscribe();

    let err = vet
        .controller
        .start_session("c-8", Role::Initiator)
        .await
        .expect_err("media denied");
    assert_eq!(err.kind(), "media_access");
    assert_eq!(vet.controller.state(), SessionState::Failed);
    assert_eq!(next_error(&mut events).await, err);
    assert!(vet.peers.last().expect("peer").is_closed());
    assert_eq!(relay.participants("c-8"), 0);
    assert!(vet.controller.last_teardown().is_some());
}

#[tokio::test]
async fn ending_while_connecting_cancels_setup() {
    let relay = MemoryRelay::new();
    relay.stall_connections();
    let vet = side(&relay, FakePeerFactory::new());

    let starter = vet.controller.clone();
    let start = tokio::spawn(async move { starter.start_session("c-9", Role::Responder).await });
    reaches(&vet.controller, SessionState::Connecting).await;

    vet.controller.end_session().await.expect("end");
    assert_eq!(vet.controller.state(), SessionState::Closed);
    let outcome = tokio::time::timeout(WAIT, start)
        .await
        .expect("start returns promptly")
        .expect("start task");
    assert_eq!(outcome, Ok(()));

    let report = vet.controller.last_teardown().expect("teardown ran");
    assert!(report.media.is_completed());
    assert_eq!(report.tracks_stopped, 0);
    assert_eq!(vet.capture.capture_count(), 0);
    assert!(vet.peers.created().is_empty());
    assert!(relay.forwarded("c-9").is_empty());
}

#[tokio::test]
async fn ending_an_idle_controller_is_a_no_op() {
    let relay = MemoryRelay::new();
    let vet = side(&relay, FakePeerFactory::new());
    vet.controller.end_session().await.expect("no-op");
    assert_eq!(vet.controller.state(), SessionState::Idle);
    assert!(vet.controller.last_teardown().is_none());
}

#[tokio::test]
async fn refused_handshake_fails_and_reports_the_error() {
    let relay = MemoryRelay::new();
    relay.refuse_connections();
    let vet = side(&relay, FakePeerFactory::new());
    let (tx, mut errors) = mpsc::unbounded_channel();
    let _watcher = vet.controller.on_error(move |err| {
        let _ = tx.send(err);
    });

    let err = vet
        .controller
        .start_session("c-10", Role::Initiator)
        .await
        .expect_err("relay refused");
    assert_eq!(err.kind(), "connection");
    assert_eq!(vet.controller.state(), SessionState::Failed);
    let reported = tokio::time::timeout(WAIT, errors.recv())
        .await
        .expect("error handler called in time")
        .expect("error");
    assert_eq!(reported, err);

    let report = vet.controller.last_teardown().expect("teardown ran");
    assert_eq!(report.session_id.as_deref(), Some("c-10"));
    assert!(vet.peers.created().is_empty());
    assert_eq!(vet.capture.capture_count(), 0);
}

#[tokio::test]
async fn stalled_relay_times_out_as_a_connection_error() {
    let relay = MemoryRelay::new();
    relay.stall_connections();
    let config = SessionConfig::builder()
        .localhost_only()
        .connect_timeout(Duration::from_millis(50))
        .build()
        .expect("config");
    let farmer = side_with(&relay, FakePeerFactory::new(), config);

    let err = farmer
        .controller
        .start_session("c-11", Role::Responder)
        .await
        .expect_err("handshake never completes");
    assert_eq!(err.kind(), "connection");
    assert!(err.to_string().contains("timed out"), "{err}");
    assert_eq!(farmer.controller.state(), SessionState::Failed);
    assert!(farmer.controller.last_teardown().is_some());
}

#[tokio::test]
async fn peer_creation_failure_fails_and_leaves_the_relay() {
    let relay = MemoryRelay::new();
    let peers = FakePeerFactory::new();
    peers.fail_create();
    let vet = side(&relay, peers);

    let err = vet
        .controller
        .start_session("c-12", Role::Initiator)
        .await
        .expect_err("no peer connection");
    assert_eq!(err.kind(), "negotiation");
    assert_eq!(vet.controller.state(), SessionState::Failed);
    assert_eq!(relay.participants("c-12"), 0);
    assert!(vet.controller.last_teardown().expect("report").is_clean());
}

#[tokio::test]
async fn failing_transport_close_does_not_stop_other_cleanup() {
    let relay = MemoryRelay::new();
    relay.fail_closes();
    let vet = side(&relay, FakePeerFactory::new());
    vet.controller
        .start_session("c-13", Role::Initiator)
        .await
        .expect("start");
    let peer = vet.peers.last().expect("peer");

    vet.controller.end_session().await.expect("end");
    assert_eq!(vet.controller.state(), SessionState::Closed);

    let report = vet.controller.last_teardown().expect("teardown report");
    assert!(matches!(report.transport, StepOutcome::Failed(_)));
    assert_eq!(report.media, StepOutcome::Completed);
    assert_eq!(report.chat, StepOutcome::Completed);
    assert_eq!(report.negotiator, StepOutcome::Completed);
    assert!(!report.is_clean());
    assert_eq!(report.tracks_stopped, 2);
    assert!(vet.capture.issued().iter().all(|track| track.is_stopped()));
    assert!(peer.is_closed());
    assert_eq!(relay.participants("c-13"), 0);
}
