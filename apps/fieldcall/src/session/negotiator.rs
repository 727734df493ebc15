use std::sync::Arc;

use fieldcall_proto::{IceCandidate, Role, SdpType, SessionDescription, SignalingMessage};

use super::ice::{CandidateDisposition, IceCandidateManager};
use crate::error::SessionError;
use crate::peer::{PeerError, PeerSessionPrimitive};
use crate::transport::SignalingTransport;

/// Offer/answer bookkeeping for one peer connection.
///
/// Every negotiation step takes `&mut self`; the owner keeps the negotiator
/// behind a single lock, so at most one step is in flight and two remote
/// descriptions can never be applied concurrently.
pub struct SessionNegotiator {
    session_id: String,
    role: Role,
    peer: Arc<dyn PeerSessionPrimitive>,
    transport: Arc<dyn SignalingTransport>,
    ice: IceCandidateManager,
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    offered: bool,
}

impl SessionNegotiator {
    pub fn new(
        session_id: impl Into<String>,
        role: Role,
        peer: Arc<dyn PeerSessionPrimitive>,
        transport: Arc<dyn SignalingTransport>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            role,
            peer,
            transport,
            ice: IceCandidateManager::new(),
            local: None,
            remote: None,
            offered: false,
        }
    }

    pub fn peer(&self) -> &Arc<dyn PeerSessionPrimitive> {
        &self.peer
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn local_description(&self) -> Option<&SessionDescription> {
        self.local.as_ref()
    }

    pub fn remote_description(&self) -> Option<&SessionDescription> {
        self.remote.as_ref()
    }

    pub fn queued_candidates(&self) -> usize {
        self.ice.queued()
    }

    /// Creates the initial offer, installs it locally and sends it to the
    /// relay. Initiator only, and only once per negotiation cycle.
    pub async fn create_offer(&mut self) -> Result<SessionDescription, SessionError> {
        if self.role != Role::Initiator {
            return Err(SessionError::invalid_state(
                "create_offer",
                "acting as responder",
            ));
        }
        if self.local.is_some() {
            return Err(SessionError::invalid_state(
                "create_offer",
                "a local description exists",
            ));
        }

        let offer = self.peer.create_offer().await?;
        offer.validate()?;
        self.peer.set_local_description(&offer).await?;
        self.local = Some(offer.clone());
        self.offered = true;
        tracing::debug!(
            target: "fieldcall::negotiator",
            session_id = %self.session_id,
            sdp_len = offer.sdp.len(),
            "local offer installed"
        );
        self.transport
            .send(&SignalingMessage::description(&self.session_id, offer.clone()))?;
        Ok(offer)
    }

    /// Applies a remote offer and answers it. Valid for the responder, and
    /// for the initiator only as a renegotiation of a completed exchange.
    pub async fn handle_offer(
        &mut self,
        offer: SessionDescription,
    ) -> Result<SessionDescription, SessionError> {
        if offer.kind != SdpType::Offer {
            return Err(SessionError::Negotiation(format!(
                "expected an offer, got {}",
                offer.kind.as_str()
            )));
        }
        let renegotiating = self.local.is_some() && self.remote.is_some();
        if self.role == Role::Initiator && !renegotiating {
            return Err(SessionError::invalid_state(
                "handle_offer",
                "acting as initiator with an exchange in progress",
            ));
        }
        offer.validate()?;

        self.peer.set_remote_description(&offer).await?;
        self.remote = Some(offer);
        self.ice.flush(self.peer.as_ref()).await;

        let answer = self.peer.create_answer().await?;
        answer.validate()?;
        self.peer.set_local_description(&answer).await?;
        self.local = Some(answer.clone());
        tracing::debug!(
            target: "fieldcall::negotiator",
            session_id = %self.session_id,
            renegotiating,
            "answer installed"
        );
        self.transport
            .send(&SignalingMessage::description(&self.session_id, answer.clone()))?;
        Ok(answer)
    }

    /// Applies the remote answer to an offer this side created.
    pub async fn handle_answer(&mut self, answer: SessionDescription) -> Result<(), SessionError> {
        if answer.kind != SdpType::Answer {
            return Err(SessionError::Negotiation(format!(
                "expected an answer, got {}",
                answer.kind.as_str()
            )));
        }
        if !self.offered {
            return Err(SessionError::invalid_state(
                "handle_answer",
                "no offer has been created",
            ));
        }
        if self.remote.is_some() {
            return Err(SessionError::invalid_state(
                "handle_answer",
                "an answer is already applied",
            ));
        }
        answer.validate()?;

        self.peer.set_remote_description(&answer).await?;
        self.remote = Some(answer);
        self.ice.flush(self.peer.as_ref()).await;
        tracing::debug!(
            target: "fieldcall::negotiator",
            session_id = %self.session_id,
            "remote answer applied"
        );
        Ok(())
    }

    pub async fn handle_candidate(
        &mut self,
        candidate: IceCandidate,
    ) -> Result<CandidateDisposition, PeerError> {
        self.ice.handle_candidate(self.peer.as_ref(), candidate).await
    }

    /// Forgets both descriptions and any queued candidates.
    pub fn reset(&mut self) {
        self.ice.reset();
        self.local = None;
        self.remote = None;
        self.offered = false;
    }

    /// Resets and closes the underlying peer connection.
    pub async fn shutdown(&mut self) -> Result<(), PeerError> {
        self.reset();
        self.peer.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::mock::{FakePeer, fake_peer};
    use crate::transport::MemoryRelay;
    use std::time::Duration;

    struct Pair {
        relay: MemoryRelay,
        initiator: SessionNegotiator,
        initiator_peer: Arc<FakePeer>,
        responder: SessionNegotiator,
        responder_peer: Arc<FakePeer>,
    }

    async fn pair() -> Pair {
        let relay = MemoryRelay::new();
        let a = Arc::new(relay.transport(Duration::from_secs(1)));
        let b = Arc::new(relay.transport(Duration::from_secs(1)));
        a.connect("s1").await.expect("connect a");
        b.connect("s1").await.expect("connect b");
        let initiator_peer = fake_peer(None);
        let responder_peer = fake_peer(None);
        Pair {
            initiator: SessionNegotiator::new("s1", Role::Initiator, initiator_peer.clone(), a),
            responder: SessionNegotiator::new("s1", Role::Responder, responder_peer.clone(), b),
            relay,
            initiator_peer,
            responder_peer,
        }
    }

    #[tokio::test]
    async fn offer_answer_exchange() {
        let mut p = pair().await;
        let offer = p.initiator.create_offer().await.expect("offer");
        assert_eq!(offer.kind, SdpType::Offer);
        assert_eq!(p.initiator_peer.local_description(), Some(offer.clone()));

        let answer = p.responder.handle_offer(offer.clone()).await.expect("answer");
        assert_eq!(answer.kind, SdpType::Answer);
        assert_eq!(p.responder_peer.remote_description(), Some(offer));

        p.initiator.handle_answer(answer.clone()).await.expect("apply answer");
        assert_eq!(p.initiator.remote_description(), Some(&answer));

        let kinds: Vec<_> = p
            .relay
            .forwarded("s1")
            .iter()
            .map(|message| message.kind())
            .collect();
        assert_eq!(kinds, vec!["offer", "answer"]);
    }

    #[tokio::test]
    async fn second_offer_without_reset_is_rejected() {
        let mut p = pair().await;
        p.initiator.create_offer().await.expect("offer");
        let err = p.initiator.create_offer().await.expect_err("guarded");
        assert!(matches!(err, SessionError::InvalidState { operation: "create_offer", .. }));

        p.initiator.reset();
        p.initiator.create_offer().await.expect("offer after reset");
    }

    #[tokio::test]
    async fn role_and_order_guards() {
        let mut p = pair().await;
        let err = p.responder.create_offer().await.expect_err("responder");
        assert_eq!(err.kind(), "invalid_state");

        let err = p
            .initiator
            .handle_answer(SessionDescription::answer("v=0\r\n"))
            .await
            .expect_err("no offer yet");
        assert_eq!(err.kind(), "invalid_state");

        let err = p
            .initiator
            .handle_offer(SessionDescription::offer("v=0\r\n"))
            .await
            .expect_err("initiator mid-exchange");
        assert_eq!(err.kind(), "invalid_state");
    }

    #[tokio::test]
    async fn malformed_offer_is_a_negotiation_error() {
        let mut p = pair().await;
        let err = p
            .responder
            .handle_offer(SessionDescription::offer("not sdp"))
            .await
            .expect_err("malformed");
        assert_eq!(err.kind(), "negotiation");
        assert!(p.responder.remote_description().is_none());
    }

    #[tokio::test]
    async fn candidates_before_answer_are_applied_once_after_it() {
        let mut p = pair().await;
        let offer = p.initiator.create_offer().await.expect("offer");
        let early = IceCandidate::new("candidate:7 1 udp 2122260223 192.168.1.7 50000 typ host");
        let disposition = p
            .initiator
            .handle_candidate(early.clone())
            .await
            .expect("queue");
        assert_eq!(disposition, CandidateDisposition::Queued);
        assert_eq!(p.initiator.queued_candidates(), 1);

        let answer = p.responder.handle_offer(offer).await.expect("answer");
        p.initiator.handle_answer(answer).await.expect("apply answer");
        assert_eq!(p.initiator.queued_candidates(), 0);
        assert_eq!(p.initiator_peer.applied_candidates(), vec![early]);
    }

    #[tokio::test]
    async fn shutdown_closes_peer() {
        let mut p = pair().await;
        p.initiator.create_offer().await.expect("offer");
        p.initiator.shutdown().await.expect("shutdown");
        assert!(p.initiator_peer.is_closed());
        assert!(p.initiator.local_description().is_none());
    }
}
