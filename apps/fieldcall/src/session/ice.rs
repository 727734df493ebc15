use std::collections::VecDeque;

use fieldcall_proto::IceCandidate;

use crate::peer::{PeerError, PeerSessionPrimitive};

/// What happened to an inbound candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateDisposition {
    Applied,
    Queued,
}

/// Holds remote candidates until the remote description is in place, then
/// applies them in arrival order.
///
/// Mutation goes through `&mut self`, so `handle_candidate` and `flush` can
/// never interleave on one manager.
#[derive(Debug, Default)]
pub struct IceCandidateManager {
    queue: VecDeque<IceCandidate>,
    remote_description_set: bool,
    applied: usize,
}

impl IceCandidateManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn handle_candidate(
        &mut self,
        peer: &dyn PeerSessionPrimitive,
        candidate: IceCandidate,
    ) -> Result<CandidateDisposition, PeerError> {
        if !self.remote_description_set {
            tracing::trace!(
                target: "fieldcall::ice",
                queued = self.queue.len() + 1,
                "remote description pending; queueing candidate"
            );
            self.queue.push_back(candidate);
            return Ok(CandidateDisposition::Queued);
        }
        peer.add_ice_candidate(&candidate).await?;
        self.applied += 1;
        Ok(CandidateDisposition::Applied)
    }

    /// Marks the remote description as set and applies the queue front to
    /// back. A candidate the peer rejects is logged and skipped; the rest are
    /// still applied. Returns how many were applied.
    pub async fn flush(&mut self, peer: &dyn PeerSessionPrimitive) -> usize {
        self.remote_description_set = true;
        let mut applied = 0;
        while let Some(candidate) = self.queue.pop_front() {
            match peer.add_ice_candidate(&candidate).await {
                Ok(()) => applied += 1,
                Err(err) => {
                    tracing::warn!(
                        target: "fieldcall::ice",
                        error = %err,
                        candidate = %candidate.candidate,
                        "queued candidate rejected"
                    );
                }
            }
        }
        self.applied += applied;
        if applied > 0 {
            tracing::debug!(target: "fieldcall::ice", applied, "flushed queued candidates");
        }
        applied
    }

    pub fn reset(&mut self) {
        self.queue.clear();
        self.remote_description_set = false;
        self.applied = 0;
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    pub fn applied(&self) -> usize {
        self.applied
    }

    pub fn is_remote_description_set(&self) -> bool {
        self.remote_description_set
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::mock::fake_peer;
    use fieldcall_proto::SessionDescription;

    fn candidate(n: u16) -> IceCandidate {
        IceCandidate::new(format!("candidate:{n} 1 udp 2122260223 10.0.0.{n} 5000 typ host"))
            .with_mid("0", 0)
    }

    #[tokio::test]
    async fn early_candidates_flush_in_arrival_order() {
        let peer = fake_peer(None);
        let mut ice = IceCandidateManager::new();
        for n in 1..=5 {
            let disposition = ice
                .handle_candidate(peer.as_ref(), candidate(n))
                .await
                .expect("queue");
            assert_eq!(disposition, CandidateDisposition::Queued);
        }
        assert_eq!(ice.queued(), 5);
        assert!(peer.applied_candidates().is_empty());

        peer.set_remote_description(&SessionDescription::offer("v=0\r\n"))
            .await
            .expect("remote");
        assert_eq!(ice.flush(peer.as_ref()).await, 5);
        assert_eq!(ice.queued(), 0);
        let applied: Vec<_> = peer.applied_candidates();
        assert_eq!(applied, (1..=5).map(candidate).collect::<Vec<_>>());

        let disposition = ice
            .handle_candidate(peer.as_ref(), candidate(6))
            .await
            .expect("apply");
        assert_eq!(disposition, CandidateDisposition::Applied);
        assert_eq!(ice.applied(), 6);
    }

    #[tokio::test]
    async fn flush_skips_rejected_candidates() {
        // remote description never set on the peer, so every apply fails
        let peer = fake_peer(None);
        let mut ice = IceCandidateManager::new();
        ice.handle_candidate(peer.as_ref(), candidate(1))
            .await
            .expect("queue");
        assert_eq!(ice.flush(peer.as_ref()).await, 0);
        assert_eq!(ice.queued(), 0);
        assert!(ice.is_remote_description_set());

        ice.reset();
        assert!(!ice.is_remote_description_set());
    }
}
