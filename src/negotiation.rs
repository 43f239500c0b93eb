//! Offer/answer/candidate state machine for mesh links.
//!
//! One engine per session. It is driven entirely from the session's event
//! queue, so every transition for every pair happens on one logical thread;
//! the awaits inside a handler are transport and store calls only.
//!
//! Stale input is recognised by two stamps: the negotiation id carried by
//! every call and candidate record, and the registry generation carried by
//! every transport event. Anything that does not match the current link is
//! dropped without touching it.

use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::connection::{ConnectionMonitor, LinkStatus};
use crate::error::{Error, Result};
use crate::media::{LocalTrack, MediaTrackManager};
use crate::metrics::NegotiationMetrics;
use crate::registry::{ConnectionRegistry, LinkRole, NegotiationState, PeerLink};
use crate::signaling::{CallRecord, CandidateRecord, SignalingChannel};
use crate::topology::TopologyContext;
use crate::transport::{
    PeerConnection, ReplaceOutcome, TransportEvent, TransportEventKind, TransportState,
};
use crate::types::{should_initiate, MediaKind, ParticipantId, RoomId, SessionDescription};

/// Link transitions the roster layer cares about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkChange {
    Connected(ParticipantId),
    Terminated(ParticipantId),
}

enum CandidateRoute {
    Stash,
    Stale,
    Buffer,
    Apply(Arc<dyn PeerConnection>),
}

pub struct NegotiationEngine {
    local: ParticipantId,
    room_id: RoomId,
    signaling: Arc<dyn SignalingChannel>,
    registry: ConnectionRegistry,
    media: MediaTrackManager,
    monitor: ConnectionMonitor,
    metrics: NegotiationMetrics,
    shut_down: bool,
}

impl NegotiationEngine {
    pub fn new(ctx: &TopologyContext) -> Self {
        Self {
            local: ctx.local.clone(),
            room_id: ctx.room_id.clone(),
            signaling: ctx.signaling.clone(),
            registry: ConnectionRegistry::new(
                ctx.local.clone(),
                ctx.connector.clone(),
                ctx.queue.clone(),
            ),
            media: MediaTrackManager::new(ctx.devices.clone(), ctx.config.start_muted),
            monitor: ctx.monitor.clone(),
            metrics: ctx.metrics.clone(),
            shut_down: false,
        }
    }

    pub fn local(&self) -> &ParticipantId {
        &self.local
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    pub fn media(&self) -> &MediaTrackManager {
        &self.media
    }

    pub fn media_mut(&mut self) -> &mut MediaTrackManager {
        &mut self.media
    }

    pub fn metrics(&self) -> &NegotiationMetrics {
        &self.metrics
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down
    }

    pub fn link_status(&self, peer: &ParticipantId) -> Option<LinkStatus> {
        self.registry.get(peer).map(PeerLink::status)
    }

    /// A link exists and has not reached a terminal state.
    pub fn has_live_link(&self, peer: &ParticipantId) -> bool {
        self.registry.get(peer).map(PeerLink::is_live).unwrap_or(false)
    }

    /// Opens a fresh link to `peer` and sends the first offer.
    pub async fn initiate(&mut self, peer: &ParticipantId) -> Result<()> {
        if self.shut_down {
            return Ok(());
        }
        let negotiation_id = rand::random::<u64>();
        self.open_link(peer, LinkRole::Initiator, negotiation_id).await?;
        info!("{} initiating with {} (round {:016x})", self.local, peer, negotiation_id);

        if let Err(e) = self.send_offer(peer, negotiation_id, false).await {
            warn!("offer to {} failed: {}", peer, e);
            self.discard(peer).await;
            return Err(e);
        }
        Ok(())
    }

    /// Routes a call record addressed to us: answers go to the waiting
    /// link, offers are answered unless they lose the tie-break.
    pub async fn handle_call_record(&mut self, record: CallRecord) -> Result<()> {
        if self.shut_down || record.to != self.local || record.from == self.local {
            return Ok(());
        }
        if record.answer.is_some() {
            return self.apply_answer(record).await;
        }
        if record.offer.is_none() {
            debug!("call record from {} carries no description", record.from);
            return Ok(());
        }

        let peer = record.from.clone();
        match self.registry.get(&peer) {
            Some(link) if link.owns_round(record.negotiation_id) => {
                debug!(
                    "ignoring replayed offer from {} (round {:016x})",
                    peer, record.negotiation_id
                );
                self.metrics.stale_ignored();
                return Ok(());
            }
            Some(link) if link.is_live() && record.renegotiation => {
                return self.answer_in_place(record).await;
            }
            Some(link)
                if link.is_live()
                    && link.role == LinkRole::Initiator
                    && should_initiate(&self.local, &peer) =>
            {
                debug!("ignoring offer from {}: this side initiates the pair", peer);
                self.metrics.stale_ignored();
                return Ok(());
            }
            Some(_) | None if record.renegotiation => {
                debug!("ignoring renegotiation from {} without a live link", peer);
                self.metrics.stale_ignored();
                return Ok(());
            }
            _ => {}
        }

        self.answer_call(record).await
    }

    /// Answers `record.offer` on a brand-new connection. Any existing link to
    /// the sender is replaced through the registry, never reused.
    pub async fn answer_call(&mut self, record: CallRecord) -> Result<()> {
        if self.shut_down {
            return Ok(());
        }
        let peer = record.from.clone();
        let negotiation_id = record.negotiation_id;
        let offer = record
            .offer
            .ok_or_else(|| Error::InvalidState(format!("call from {peer} has no offer")))?;

        self.open_link(&peer, LinkRole::Answerer, negotiation_id).await?;
        info!("{} answering {} (round {:016x})", self.local, peer, negotiation_id);

        if let Err(e) = self.send_answer(&peer, negotiation_id, offer, true).await {
            warn!("answer to {} failed: {}", peer, e);
            self.discard(&peer).await;
            return Err(e);
        }
        Ok(())
    }

    /// Offer made on a connection that is already up.
    async fn answer_in_place(&mut self, record: CallRecord) -> Result<()> {
        let peer = record.from.clone();
        let negotiation_id = record.negotiation_id;
        let Some(offer) = record.offer else {
            return Ok(());
        };
        let Some(link) = self.registry.get_mut(&peer) else {
            return Ok(());
        };

        if link.awaiting_answer {
            // Both sides offered on the same connection. The tie-break
            // initiator keeps its offer; the other side rolls back and
            // repeats its own once this round is done.
            if should_initiate(&self.local, &peer) {
                debug!("renegotiation collision with {}: keeping our offer", peer);
                self.metrics.stale_ignored();
                return Ok(());
            }
            debug!("renegotiation collision with {}: rolling back", peer);
            link.connection.rollback().await?;
            link.awaiting_answer = false;
            link.needs_renegotiation = true;
        }

        link.start_round(negotiation_id);
        for candidate in self.registry.take_early(&peer, negotiation_id) {
            if let Some(link) = self.registry.get_mut(&peer) {
                link.buffer_candidate(candidate);
            }
        }
        self.metrics.renegotiations();
        self.send_answer(&peer, negotiation_id, offer, false).await?;
        self.settle(&peer).await
    }

    async fn send_offer(
        &mut self,
        peer: &ParticipantId,
        negotiation_id: u64,
        renegotiation: bool,
    ) -> Result<()> {
        if !renegotiation {
            self.attach_media(peer, true).await?;
        }
        let connection = self.connection(peer)?;
        let offer = connection.create_offer().await?;
        connection.set_local_description(offer.clone()).await?;

        if let Some(link) = self.registry.get_mut(peer) {
            link.start_round(negotiation_id);
            link.state = NegotiationState::OfferSent;
            link.awaiting_answer = true;
            link.needs_renegotiation = false;
        }
        self.publish_status(peer);

        let record = CallRecord::offer(
            self.local.clone(),
            peer.clone(),
            negotiation_id,
            offer,
            renegotiation,
        );
        if self.write_call(record).await {
            self.metrics.offers_sent();
        }
        Ok(())
    }

    async fn send_answer(
        &mut self,
        peer: &ParticipantId,
        negotiation_id: u64,
        offer: SessionDescription,
        fresh: bool,
    ) -> Result<()> {
        let connection = self.connection(peer)?;
        if let Some(link) = self.registry.get_mut(peer) {
            link.state = NegotiationState::OfferReceived;
        }

        connection.set_remote_description(offer).await?;
        if let Some(link) = self.registry.get_mut(peer) {
            link.remote_description_set = true;
        }
        self.flush_candidates(peer).await;

        // The offer's media sections already give us receiving transceivers,
        // so only senders are added here.
        if fresh {
            self.attach_media(peer, false).await?;
        }

        let answer = connection.create_answer().await?;
        connection.set_local_description(answer.clone()).await?;

        if let Some(link) = self.registry.get_mut(peer) {
            link.state = if link.transport == TransportState::Connected {
                NegotiationState::Connected
            } else {
                NegotiationState::AnswerSent
            };
        }
        self.publish_status(peer);

        let record = CallRecord::answer(self.local.clone(), peer.clone(), negotiation_id, answer);
        if self.write_call(record).await {
            self.metrics.answers_sent();
        }
        Ok(())
    }

    /// Applies an answer only while our offer for that exact round is
    /// outstanding. Duplicates and answers to superseded rounds are dropped.
    async fn apply_answer(&mut self, record: CallRecord) -> Result<()> {
        let peer = record.from.clone();
        let Some(answer) = record.answer else {
            return Ok(());
        };
        let connection = match self.registry.get(&peer) {
            Some(link)
                if link.state == NegotiationState::OfferSent
                    && link.awaiting_answer
                    && link.negotiation_id == record.negotiation_id =>
            {
                link.connection.clone()
            }
            Some(link) => {
                debug!(
                    "ignoring answer from {} for round {:016x} (link {} round {:016x})",
                    peer, record.negotiation_id, link.state, link.negotiation_id
                );
                self.metrics.stale_ignored();
                return Ok(());
            }
            None => {
                debug!("ignoring answer from {} with no link", peer);
                self.metrics.stale_ignored();
                return Ok(());
            }
        };

        connection.set_remote_description(answer).await?;
        self.metrics.answers_applied();
        if let Some(link) = self.registry.get_mut(&peer) {
            link.awaiting_answer = false;
            link.remote_description_set = true;
            if link.transport == TransportState::Connected {
                link.state = NegotiationState::Connected;
            }
        }
        debug!("applied answer from {}", peer);

        self.flush_candidates(&peer).await;
        self.publish_status(&peer);
        self.settle(&peer).await
    }

    /// Remote candidates: applied once the remote description is in place,
    /// buffered in arrival order before that.
    pub async fn handle_remote_candidate(&mut self, record: CandidateRecord) -> Result<()> {
        if self.shut_down || record.to != self.local || record.from == self.local {
            return Ok(());
        }
        let peer = record.from;
        let route = match self.registry.get(&peer) {
            None => CandidateRoute::Stash,
            // May belong to an offer that has not been processed yet, even
            // when the link it would replace has already ended.
            Some(link) if !link.owns_round(record.negotiation_id) => CandidateRoute::Stash,
            Some(link) if !link.is_live() => CandidateRoute::Stale,
            Some(link) if !link.remote_description_set => CandidateRoute::Buffer,
            Some(link) => CandidateRoute::Apply(link.connection.clone()),
        };

        match route {
            CandidateRoute::Stash => {
                self.registry
                    .stash_early(&peer, record.negotiation_id, record.candidate);
                self.metrics.candidates_buffered();
            }
            CandidateRoute::Stale => {
                debug!("ignoring candidate from {} for closed link", peer);
                self.metrics.stale_ignored();
            }
            CandidateRoute::Buffer => {
                if let Some(link) = self.registry.get_mut(&peer) {
                    link.buffer_candidate(record.candidate);
                }
                self.metrics.candidates_buffered();
            }
            CandidateRoute::Apply(connection) => {
                connection.add_ice_candidate(record.candidate).await?;
                self.metrics.candidates_applied();
            }
        }
        Ok(())
    }

    pub async fn handle_transport_event(
        &mut self,
        event: TransportEvent,
    ) -> Result<Option<LinkChange>> {
        if self.shut_down {
            return Ok(None);
        }
        let peer = event.peer;
        if !self.registry.is_current(&peer, event.generation) {
            debug!(
                "dropping event from superseded connection to {} (generation {})",
                peer, event.generation
            );
            self.metrics.stale_ignored();
            return Ok(None);
        }

        match event.kind {
            TransportEventKind::LocalCandidate(candidate) => {
                let Some(link) = self.registry.get(&peer) else {
                    return Ok(None);
                };
                if !link.is_live() {
                    return Ok(None);
                }
                let negotiation_id = link.negotiation_id;
                match self
                    .signaling
                    .append_candidate(&self.room_id, &self.local, &peer, negotiation_id, candidate)
                    .await
                {
                    Ok(()) => self.metrics.candidates_sent(),
                    Err(e) => {
                        warn!("failed to publish candidate for {}: {}", peer, e);
                        self.metrics.signaling_write_failures();
                    }
                }
                Ok(None)
            }
            TransportEventKind::RemoteTrack(track) => {
                if self.has_live_link(&peer) {
                    self.media.ingest_remote_track(&peer, track);
                }
                Ok(None)
            }
            TransportEventKind::RemoteTrackEnded { track_id } => {
                self.media.remove_remote_track(&peer, &track_id);
                Ok(None)
            }
            TransportEventKind::StateChanged(state) if state.is_terminal() => {
                Ok(self.terminate(&peer, state).await)
            }
            TransportEventKind::StateChanged(state) => {
                let mut connected = false;
                if let Some(link) = self.registry.get_mut(&peer) {
                    link.transport = state;
                    let ready = match link.state {
                        NegotiationState::OfferSent => !link.awaiting_answer,
                        NegotiationState::AnswerSent => true,
                        _ => false,
                    };
                    if state == TransportState::Connected && ready {
                        link.state = NegotiationState::Connected;
                        connected = true;
                    }
                }
                self.publish_status(&peer);
                if !connected {
                    return Ok(None);
                }
                info!("{} connected to {}", self.local, peer);
                self.metrics.links_connected();
                self.settle(&peer).await?;
                Ok(Some(LinkChange::Connected(peer)))
            }
        }
    }

    /// Starts a new offer/answer round on the existing connection, or marks
    /// the link so one starts as soon as the current round completes.
    pub async fn renegotiate(&mut self, peer: &ParticipantId) -> Result<()> {
        if self.shut_down {
            return Ok(());
        }
        let Some(link) = self.registry.get_mut(peer) else {
            return Ok(());
        };
        if !link.is_live() {
            return Ok(());
        }
        if !link.is_stable() {
            link.needs_renegotiation = true;
            return Ok(());
        }

        let negotiation_id = rand::random::<u64>();
        info!("renegotiating with {} (round {:016x})", peer, negotiation_id);
        self.metrics.renegotiations();
        self.send_offer(peer, negotiation_id, true).await
    }

    /// Swaps the outgoing track of `kind` on every live link. Links whose
    /// transport had no sender to swap get a new one and are renegotiated;
    /// the peers concerned are returned.
    pub async fn replace_track(
        &mut self,
        kind: MediaKind,
        track: &LocalTrack,
    ) -> Result<Vec<ParticipantId>> {
        let mut renegotiate = Vec::new();
        for peer in self.registry.peers() {
            let connection = match self.registry.get(&peer) {
                Some(link) if link.is_live() => link.connection.clone(),
                _ => continue,
            };
            match connection.replace_track(kind, track).await {
                Ok(outcome) => {
                    if let Some(link) = self.registry.get_mut(&peer) {
                        link.bound_tracks.insert(kind, track.id().to_owned());
                    }
                    if outcome == ReplaceOutcome::NeedsRenegotiation {
                        renegotiate.push(peer);
                    }
                }
                Err(e) => warn!("replacing {} track for {} failed: {}", kind, peer, e),
            }
        }

        for peer in &renegotiate {
            if let Err(e) = self.renegotiate(peer).await {
                warn!("renegotiation with {} failed: {}", peer, e);
            }
        }
        Ok(renegotiate)
    }

    /// Closes the link to `peer`, drops its media and clears the records we
    /// wrote for the pair so they cannot revive it.
    pub async fn close_peer(&mut self, peer: &ParticipantId) {
        let closed = self.registry.close(peer).await.is_some();
        self.media.drop_bundle(peer);
        self.monitor.remove_link(peer);
        if closed {
            self.clear_pair(peer).await;
        }
    }

    /// Closes every link and stops local media. Afterwards every handler is
    /// a no-op. Safe to call more than once.
    pub async fn teardown(&mut self) {
        if self.shut_down {
            return;
        }
        self.shut_down = true;
        for peer in self.registry.close_all().await {
            self.clear_pair(&peer).await;
        }
        self.media.stop_all();
        self.monitor.clear_links();
        info!("{} tore down all links", self.local);
    }

    async fn terminate(
        &mut self,
        peer: &ParticipantId,
        transport: TransportState,
    ) -> Option<LinkChange> {
        let link = self.registry.get_mut(peer)?;
        if !link.is_live() {
            link.transport = transport;
            return None;
        }
        link.state = NegotiationState::Closed;
        link.transport = transport;
        link.awaiting_answer = false;
        link.needs_renegotiation = false;
        link.take_pending();
        let connection = link.connection.clone();

        warn!("link from {} to {} ended: {}", self.local, peer, transport);
        if transport != TransportState::Closed {
            self.metrics.links_failed();
        }
        if let Err(e) = connection.close().await {
            debug!("closing ended connection to {}: {}", peer, e);
        }
        self.media.drop_bundle(peer);
        self.publish_status(peer);
        Some(LinkChange::Terminated(peer.clone()))
    }

    /// Binds local tracks to a new connection. Missing kinds become
    /// receive-only when `receive_only_missing` is set.
    async fn attach_media(
        &mut self,
        peer: &ParticipantId,
        receive_only_missing: bool,
    ) -> Result<()> {
        let connection = self.connection(peer)?;
        for kind in [MediaKind::Audio, MediaKind::Video] {
            match self.media.outgoing(kind) {
                Some(track) => {
                    connection.add_track(&track).await?;
                    if let Some(link) = self.registry.get_mut(peer) {
                        link.bound_tracks.insert(kind, track.id().to_owned());
                    }
                }
                None if receive_only_missing => connection.add_receive_only(kind).await?,
                None => {}
            }
        }
        Ok(())
    }

    async fn flush_candidates(&mut self, peer: &ParticipantId) {
        let Some(link) = self.registry.get_mut(peer) else {
            return;
        };
        let pending = link.take_pending();
        if pending.is_empty() {
            return;
        }
        let connection = link.connection.clone();
        let count = pending.len();
        for candidate in pending {
            if let Err(e) = connection.add_ice_candidate(candidate).await {
                warn!("buffered candidate from {} rejected: {}", peer, e);
            }
        }
        debug!("flushed {} buffered candidates from {}", count, peer);
        self.metrics.candidates_flushed(count);
    }

    /// Runs a renegotiation that was deferred while the link was busy.
    async fn settle(&mut self, peer: &ParticipantId) -> Result<()> {
        let due = self
            .registry
            .get(peer)
            .map(|link| link.needs_renegotiation && link.is_stable())
            .unwrap_or(false);
        if due {
            self.renegotiate(peer).await?;
        }
        Ok(())
    }

    fn connection(&self, peer: &ParticipantId) -> Result<Arc<dyn PeerConnection>> {
        self.registry
            .get(peer)
            .map(|link| link.connection.clone())
            .ok_or_else(|| Error::InvalidState(format!("no link to {peer}")))
    }

    /// Creates the link for a new round. Media received over a link it
    /// replaces goes with that link.
    async fn open_link(
        &mut self,
        peer: &ParticipantId,
        role: LinkRole,
        negotiation_id: u64,
    ) -> Result<()> {
        if self.registry.get(peer).is_some() {
            self.media.drop_bundle(peer);
            self.monitor.remove_link(peer);
        }
        self.registry.create(peer, role, negotiation_id).await?;
        Ok(())
    }

    async fn discard(&mut self, peer: &ParticipantId) {
        self.registry.close(peer).await;
        self.media.drop_bundle(peer);
        self.monitor.remove_link(peer);
    }

    /// Store write failures are logged and dropped; the next roster or
    /// candidate event drives the pair again.
    async fn write_call(&self, record: CallRecord) -> bool {
        let to = record.to.clone();
        match self.signaling.put_call(&self.room_id, record).await {
            Ok(()) => true,
            Err(e) => {
                warn!("failed to write call record for {}: {}", to, e);
                self.metrics.signaling_write_failures();
                false
            }
        }
    }

    async fn clear_pair(&self, peer: &ParticipantId) {
        if let Err(e) = self
            .signaling
            .clear_pair(&self.room_id, &self.local, peer)
            .await
        {
            warn!("failed to clear signaling records for {}: {}", peer, e);
            self.metrics.signaling_write_failures();
        }
    }

    fn publish_status(&self, peer: &ParticipantId) {
        if let Some(link) = self.registry.get(peer) {
            self.monitor.update_link(peer, link.status());
        }
    }
}
