//! Negotiation state of one peer connection.

use crate::error::Result;
use crate::link::{PeerId, PeerLink, SdpKind};
use crate::session::state::SessionState;
use huddle_signaling::IceCandidateInit;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// One negotiation of a peer connection
///
/// Candidates that arrive before the remote description is applied are
/// queued and flushed, in arrival order, right after it is.
pub struct PeerSession {
    peer_id: PeerId,
    link: Arc<dyn PeerLink>,
    pending_candidates: VecDeque<IceCandidateInit>,
    remote_applied: bool,
    negotiating: bool,
    state: SessionState,
    connect_deadline: Instant,
}

impl PeerSession {
    /// Create a session around a fresh link
    pub fn new(
        peer_id: impl Into<PeerId>,
        link: Arc<dyn PeerLink>,
        connect_timeout: Duration,
    ) -> Self {
        Self {
            peer_id: peer_id.into(),
            link,
            pending_candidates: VecDeque::new(),
            remote_applied: false,
            negotiating: false,
            state: SessionState::Connecting,
            connect_deadline: Instant::now() + connect_timeout,
        }
    }

    /// Remote peer
    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    /// Underlying link
    pub fn link(&self) -> &Arc<dyn PeerLink> {
        &self.link
    }

    /// Current state
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Update the state
    pub fn set_state(&mut self, state: SessionState) {
        self.state = state;
    }

    /// Whether a local offer awaits its answer
    pub fn is_negotiating(&self) -> bool {
        self.negotiating
    }

    /// Whether a remote description has been applied
    pub fn remote_applied(&self) -> bool {
        self.remote_applied
    }

    /// Number of queued candidates
    pub fn pending_candidates(&self) -> usize {
        self.pending_candidates.len()
    }

    /// Instant by which the session must reach `connected`
    pub fn connect_deadline(&self) -> Instant {
        self.connect_deadline
    }

    /// Create a local offer; the session is negotiating until the answer lands
    pub async fn start_offer(&mut self, ice_restart: bool) -> Result<String> {
        let sdp = self.link.create_offer(ice_restart).await?;
        self.negotiating = true;
        if self.state == SessionState::Connected {
            self.state = SessionState::Renegotiating;
        }
        Ok(sdp)
    }

    /// Apply a remote offer and produce the answer
    pub async fn accept_offer(&mut self, sdp: &str) -> Result<String> {
        self.apply_remote(SdpKind::Offer, sdp).await?;
        let answer = self.link.create_answer().await?;
        self.finish_negotiation();
        Ok(answer)
    }

    /// Apply the remote answer to our offer
    pub async fn accept_answer(&mut self, sdp: &str) -> Result<()> {
        self.apply_remote(SdpKind::Answer, sdp).await?;
        self.finish_negotiation();
        Ok(())
    }

    /// Apply a candidate now, or queue it until the remote description exists
    ///
    /// Returns `true` if the candidate was applied immediately.
    pub async fn add_candidate(&mut self, candidate: IceCandidateInit) -> Result<bool> {
        if !self.remote_applied {
            self.pending_candidates.push_back(candidate);
            return Ok(false);
        }
        self.link.add_ice_candidate(candidate).await?;
        Ok(true)
    }

    /// Queue candidates received before this session existed
    pub fn adopt_candidates(&mut self, candidates: impl IntoIterator<Item = IceCandidateInit>) {
        self.pending_candidates.extend(candidates);
    }

    /// Hand back queued candidates (used when the session is replaced)
    pub fn take_pending(&mut self) -> Vec<IceCandidateInit> {
        self.pending_candidates.drain(..).collect()
    }

    /// Close the link
    pub async fn close(&mut self) {
        self.state = SessionState::Closed;
        self.link.close().await;
    }

    fn finish_negotiation(&mut self) {
        self.negotiating = false;
        if self.state == SessionState::Renegotiating {
            self.state = SessionState::Connected;
        }
    }

    async fn apply_remote(&mut self, kind: SdpKind, sdp: &str) -> Result<()> {
        self.link.set_remote_description(kind, sdp).await?;
        self.remote_applied = true;

        let queued = self.pending_candidates.len();
        while let Some(candidate) = self.pending_candidates.pop_front() {
            if let Err(e) = self.link.add_ice_candidate(candidate).await {
                tracing::warn!("Queued candidate for {} rejected: {}", self.peer_id, e);
            }
        }
        if queued > 0 {
            tracing::debug!("Flushed {} queued candidates for {}", queued, self.peer_id);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::PeerConnector;
    use crate::memory::MemoryNetwork;
    use tokio::sync::mpsc;

    fn candidate(n: u32) -> IceCandidateInit {
        IceCandidateInit {
            candidate: format!("candidate:{n} 1 udp 1 10.0.0.{n} 5000 typ host"),
            sdp_m_line_index: Some(0),
            sdp_mid: Some("0".to_string()),
        }
    }

    async fn sessions(network: &MemoryNetwork) -> (PeerSession, PeerSession) {
        let (tx, _) = mpsc::unbounded_channel();
        let a = network.create_link("a", "b", tx.clone()).await.unwrap();
        let b = network.create_link("b", "a", tx).await.unwrap();
        (
            PeerSession::new("b", a, Duration::from_secs(30)),
            PeerSession::new("a", b, Duration::from_secs(30)),
        )
    }

    #[tokio::test]
    async fn test_early_candidates_flushed_in_order() {
        let network = MemoryNetwork::new();
        let (mut offerer, mut answerer) = sessions(&network).await;

        assert!(!answerer.add_candidate(candidate(1)).await.unwrap());
        assert!(!answerer.add_candidate(candidate(2)).await.unwrap());
        assert!(!answerer.add_candidate(candidate(3)).await.unwrap());
        assert_eq!(answerer.pending_candidates(), 3);

        let offer = offerer.start_offer(false).await.unwrap();
        assert!(offerer.is_negotiating());
        let answer = answerer.accept_offer(&offer).await.unwrap();
        offerer.accept_answer(&answer).await.unwrap();
        assert!(!offerer.is_negotiating());

        assert_eq!(answerer.pending_candidates(), 0);
        let applied = network.applied_candidates("b", "a");
        assert_eq!(
            applied,
            vec![candidate(1).candidate, candidate(2).candidate, candidate(3).candidate]
        );

        assert!(answerer.add_candidate(candidate(4)).await.unwrap());
        assert_eq!(network.applied_candidates("b", "a").len(), 4);
    }

    #[tokio::test]
    async fn test_renegotiation_returns_to_connected() {
        let network = MemoryNetwork::new();
        let (mut offerer, mut answerer) = sessions(&network).await;

        let offer = offerer.start_offer(false).await.unwrap();
        let answer = answerer.accept_offer(&offer).await.unwrap();
        offerer.accept_answer(&answer).await.unwrap();
        offerer.set_state(SessionState::Connected);

        let offer = offerer.start_offer(false).await.unwrap();
        assert_eq!(offerer.state(), SessionState::Renegotiating);
        let answer = answerer.accept_offer(&offer).await.unwrap();
        offerer.accept_answer(&answer).await.unwrap();

        assert_eq!(offerer.state(), SessionState::Connected);
        assert_eq!(network.remote_descriptions("b", "a").len(), 2);
    }

    #[tokio::test]
    async fn test_take_pending_hands_back_queue() {
        let network = MemoryNetwork::new();
        let (_, mut answerer) = sessions(&network).await;
        answerer.adopt_candidates([candidate(7), candidate(8)]);
        let pending = answerer.take_pending();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0], candidate(7));
        assert_eq!(answerer.pending_candidates(), 0);
    }
}
