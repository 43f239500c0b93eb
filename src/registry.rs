//! Owned store of peer links.
//!
//! The registry is the only place that maps a participant id to a live
//! connection handle. Every connection it creates gets a fresh generation
//! number; transport events carry that number, which is how events from a
//! replaced or closed connection are told apart from current ones.

use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::connection::LinkStatus;
use crate::error::{Error, Result};
use crate::events::EventQueue;
use crate::transport::{PeerConnection, PeerConnector, TransportEventSink, TransportState};
use crate::types::{IceCandidate, MediaKind, ParticipantId};

/// Early candidates kept per peer; the oldest are dropped beyond this.
const MAX_EARLY_CANDIDATES: usize = 64;

// Shared by every registry in the process so a rejoin never reuses a
// generation that may still have events in flight.
static NEXT_GENERATION: AtomicU64 = AtomicU64::new(1);

/// Per-link negotiation progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NegotiationState {
    Idle,
    OfferSent,
    OfferReceived,
    AnswerSent,
    Connected,
    /// Terminal. The transport state on the link says why.
    Closed,
}

impl fmt::Display for NegotiationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NegotiationState::Idle => "IDLE",
            NegotiationState::OfferSent => "OFFER_SENT",
            NegotiationState::OfferReceived => "OFFER_RECEIVED",
            NegotiationState::AnswerSent => "ANSWER_SENT",
            NegotiationState::Connected => "CONNECTED",
            NegotiationState::Closed => "CLOSED",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkRole {
    Initiator,
    Answerer,
}

pub struct PeerLink {
    pub peer: ParticipantId,
    pub connection: Arc<dyn PeerConnection>,
    pub generation: u64,
    pub role: LinkRole,
    pub state: NegotiationState,
    pub transport: TransportState,
    /// Current offer/answer round.
    pub negotiation_id: u64,
    /// Every round negotiated on this connection; candidates tagged with any
    /// of them belong here.
    pub rounds: HashSet<u64>,
    pub remote_description_set: bool,
    /// Our offer for the current round has not been answered yet.
    pub awaiting_answer: bool,
    /// A sender was added while the link was mid-negotiation.
    pub needs_renegotiation: bool,
    /// Track id bound to the outgoing sender of each kind.
    pub bound_tracks: HashMap<MediaKind, String>,
    pub started_at: Instant,
    pending_candidates: Vec<IceCandidate>,
}

impl PeerLink {
    pub fn is_live(&self) -> bool {
        self.state != NegotiationState::Closed
    }

    /// Descriptions on both sides agree; a new offer may be made.
    pub fn is_stable(&self) -> bool {
        self.is_live() && self.remote_description_set && !self.awaiting_answer
    }

    pub fn owns_round(&self, negotiation_id: u64) -> bool {
        self.rounds.contains(&negotiation_id)
    }

    pub fn start_round(&mut self, negotiation_id: u64) {
        self.negotiation_id = negotiation_id;
        self.rounds.insert(negotiation_id);
    }

    pub fn buffer_candidate(&mut self, candidate: IceCandidate) {
        self.pending_candidates.push(candidate);
    }

    /// Buffered candidates in arrival order. Leaves the buffer empty.
    pub fn take_pending(&mut self) -> Vec<IceCandidate> {
        std::mem::take(&mut self.pending_candidates)
    }

    pub fn pending_len(&self) -> usize {
        self.pending_candidates.len()
    }

    pub fn status(&self) -> LinkStatus {
        LinkStatus {
            state: self.state,
            transport: self.transport,
            role: self.role,
        }
    }
}

impl fmt::Debug for PeerLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerLink")
            .field("peer", &self.peer)
            .field("generation", &self.generation)
            .field("role", &self.role)
            .field("state", &self.state)
            .field("transport", &self.transport)
            .field("negotiation_id", &self.negotiation_id)
            .field("pending_candidates", &self.pending_candidates.len())
            .finish()
    }
}

pub struct ConnectionRegistry {
    local: ParticipantId,
    connector: Arc<dyn PeerConnector>,
    events: EventQueue,
    links: HashMap<ParticipantId, PeerLink>,
    /// Candidates that arrived before the link of their round existed.
    early: HashMap<ParticipantId, Vec<(u64, IceCandidate)>>,
}

impl ConnectionRegistry {
    pub fn new(
        local: ParticipantId,
        connector: Arc<dyn PeerConnector>,
        events: EventQueue,
    ) -> Self {
        Self {
            local,
            connector,
            events,
            links: HashMap::new(),
            early: HashMap::new(),
        }
    }

    pub fn local(&self) -> &ParticipantId {
        &self.local
    }

    pub fn get(&self, peer: &ParticipantId) -> Option<&PeerLink> {
        self.links.get(peer)
    }

    pub fn get_mut(&mut self, peer: &ParticipantId) -> Option<&mut PeerLink> {
        self.links.get_mut(peer)
    }

    pub fn peers(&self) -> Vec<ParticipantId> {
        self.links.keys().cloned().collect()
    }

    pub fn links(&self) -> impl Iterator<Item = &PeerLink> {
        self.links.values()
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    /// True when `generation` is the connection currently held for `peer`.
    pub fn is_current(&self, peer: &ParticipantId, generation: u64) -> bool {
        self.links
            .get(peer)
            .map(|link| link.generation == generation)
            .unwrap_or(false)
    }

    /// Opens a new connection to `peer` for round `negotiation_id`, closing
    /// and replacing whatever was there before.
    pub async fn create(
        &mut self,
        peer: &ParticipantId,
        role: LinkRole,
        negotiation_id: u64,
    ) -> Result<&mut PeerLink> {
        if peer == &self.local {
            return Err(Error::SelfConnection(peer.clone()));
        }

        if let Some(previous) = self.links.remove(peer) {
            debug!(
                "replacing link to {} (generation {}, {})",
                peer, previous.generation, previous.state
            );
            if let Err(e) = previous.connection.close().await {
                warn!("closing replaced connection to {} failed: {}", peer, e);
            }
        }

        let generation = NEXT_GENERATION.fetch_add(1, Ordering::Relaxed);
        let sink = TransportEventSink::new(peer.clone(), generation, self.events.clone());
        let connection = self.connector.connect(&self.local, peer, sink).await?;

        let mut link = PeerLink {
            peer: peer.clone(),
            connection,
            generation,
            role,
            state: NegotiationState::Idle,
            transport: TransportState::New,
            negotiation_id,
            rounds: HashSet::from([negotiation_id]),
            remote_description_set: false,
            awaiting_answer: false,
            needs_renegotiation: false,
            bound_tracks: HashMap::new(),
            started_at: Instant::now(),
            pending_candidates: Vec::new(),
        };
        for candidate in self.take_early(peer, negotiation_id) {
            link.buffer_candidate(candidate);
        }

        debug!("created link to {} (generation {}, {:?})", peer, generation, role);
        Ok(self.links.entry(peer.clone()).or_insert(link))
    }

    /// Releases the connection to `peer` and forgets everything queued for it.
    pub async fn close(&mut self, peer: &ParticipantId) -> Option<PeerLink> {
        self.early.remove(peer);
        let mut link = self.links.remove(peer)?;
        link.pending_candidates.clear();
        if let Err(e) = link.connection.close().await {
            warn!("closing connection to {} failed: {}", peer, e);
        }
        debug!("closed link to {} (generation {})", peer, link.generation);
        Some(link)
    }

    pub async fn close_all(&mut self) -> Vec<ParticipantId> {
        let peers = self.peers();
        for peer in &peers {
            self.close(peer).await;
        }
        self.early.clear();
        peers
    }

    /// Holds a candidate for a round no link owns yet.
    pub fn stash_early(
        &mut self,
        peer: &ParticipantId,
        negotiation_id: u64,
        candidate: IceCandidate,
    ) {
        let stash = self.early.entry(peer.clone()).or_default();
        if stash.len() >= MAX_EARLY_CANDIDATES {
            let (dropped, _) = stash.remove(0);
            debug!("early candidate stash for {} full, dropped round {:016x}", peer, dropped);
        }
        stash.push((negotiation_id, candidate));
    }

    /// Removes the stash for `peer`, returning the candidates of round
    /// `negotiation_id` in arrival order. Other rounds are discarded.
    pub fn take_early(
        &mut self,
        peer: &ParticipantId,
        negotiation_id: u64,
    ) -> Vec<IceCandidate> {
        self.early
            .remove(peer)
            .unwrap_or_default()
            .into_iter()
            .filter(|(id, _)| *id == negotiation_id)
            .map(|(_, candidate)| candidate)
            .collect()
    }

    pub fn early_len(&self, peer: &ParticipantId) -> usize {
        self.early.get(peer).map(Vec::len).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::event_queue;
    use crate::mock::MockNetwork;

    fn registry(network: &MockNetwork) -> (ConnectionRegistry, crate::events::EventReceiver) {
        let (queue, rx) = event_queue();
        let connector = Arc::new(network.connector());
        let registry = ConnectionRegistry::new("1".into(), connector, queue);
        (registry, rx)
    }

    #[tokio::test]
    async fn create_rejects_self() {
        let network = MockNetwork::new();
        let (mut registry, _rx) = registry(&network);
        let err = registry
            .create(&"1".into(), LinkRole::Initiator, 1)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::SelfConnection(_)));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn create_replaces_and_closes_previous() {
        let network = MockNetwork::new();
        let (mut registry, _rx) = registry(&network);
        let peer = ParticipantId::from("2");

        let first = registry.create(&peer, LinkRole::Initiator, 1).await.unwrap().generation;
        let old = network.connection_between(&"1".into(), &peer).unwrap();
        let second = registry.create(&peer, LinkRole::Answerer, 2).await.unwrap().generation;

        assert_ne!(first, second);
        assert!(old.is_closed());
        assert_eq!(registry.len(), 1);
        assert!(!registry.is_current(&peer, first));
        assert!(registry.is_current(&peer, second));
        assert_eq!(registry.get(&peer).unwrap().role, LinkRole::Answerer);
    }

    #[tokio::test]
    async fn early_candidates_adopted_by_matching_round_only() {
        let network = MockNetwork::new();
        let (mut registry, _rx) = registry(&network);
        let peer = ParticipantId::from("2");

        registry.stash_early(&peer, 7, IceCandidate::new("a"));
        registry.stash_early(&peer, 6, IceCandidate::new("stale"));
        registry.stash_early(&peer, 7, IceCandidate::new("b"));

        let link = registry.create(&peer, LinkRole::Answerer, 7).await.unwrap();
        let pending: Vec<String> = link.take_pending().into_iter().map(|c| c.candidate).collect();
        assert_eq!(pending, vec!["a", "b"]);
        assert_eq!(registry.early_len(&peer), 0);
    }

    #[tokio::test]
    async fn early_stash_keeps_newest_candidates() {
        let network = MockNetwork::new();
        let (mut registry, _rx) = registry(&network);
        let peer = ParticipantId::from("2");

        registry.stash_early(&peer, 3, IceCandidate::new("oldest"));
        for n in 1..MAX_EARLY_CANDIDATES {
            registry.stash_early(&peer, 4, IceCandidate::new(format!("c{n}")));
        }
        registry.stash_early(&peer, 4, IceCandidate::new("newest"));
        assert_eq!(registry.early_len(&peer), MAX_EARLY_CANDIDATES);

        let adopted = registry.take_early(&peer, 4);
        assert_eq!(adopted.len(), MAX_EARLY_CANDIDATES);
        assert_eq!(adopted[0].candidate, "c1");
        assert_eq!(adopted[MAX_EARLY_CANDIDATES - 1].candidate, "newest");
        assert!(registry.take_early(&peer, 3).is_empty());
    }

    #[tokio::test]
    async fn close_discards_buffers() {
        let network = MockNetwork::new();
        let (mut registry, _rx) = registry(&network);
        let peer = ParticipantId::from("2");

        registry
            .create(&peer, LinkRole::Initiator, 1)
            .await
            .unwrap()
            .buffer_candidate(IceCandidate::new("x"));
        registry.stash_early(&peer, 2, IceCandidate::new("y"));

        let link = registry.close(&peer).await.unwrap();
        assert_eq!(link.pending_len(), 0);
        assert_eq!(registry.early_len(&peer), 0);
        assert!(registry.get(&peer).is_none());
        assert!(registry.close(&peer).await.is_none());
        assert!(network.connection_between(&"1".into(), &peer).unwrap().is_closed());
    }
}
