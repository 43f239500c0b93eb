//! Turns roster changes into link operations.
//!
//! Only the tie-break initiator of a pair ever starts a link; the other side
//! waits for the offer. Offers from senders not (yet) in the roster are held
//! until they appear, so a stale record of a departed participant cannot
//! open a connection.

use std::collections::{BTreeSet, HashMap};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::ReconnectPolicy;
use crate::error::Result;
use crate::negotiation::{LinkChange, NegotiationEngine};
use crate::registry::NegotiationState;
use crate::signaling::{CallRecord, RosterChange};
use crate::transport::TransportState;
use crate::types::{should_initiate, ParticipantId};

#[derive(Debug, Clone, Copy)]
struct RetryState {
    attempts: u32,
    next_attempt: Instant,
}

pub struct RosterReconciler {
    local: ParticipantId,
    members: BTreeSet<ParticipantId>,
    pending_offers: HashMap<ParticipantId, CallRecord>,
    policy: ReconnectPolicy,
    retries: HashMap<ParticipantId, RetryState>,
}

impl RosterReconciler {
    pub fn new(local: ParticipantId, policy: ReconnectPolicy) -> Self {
        Self {
            local,
            members: BTreeSet::new(),
            pending_offers: HashMap::new(),
            policy,
            retries: HashMap::new(),
        }
    }

    /// Remote participants currently in the roster.
    pub fn members(&self) -> impl Iterator<Item = &ParticipantId> {
        self.members.iter()
    }

    pub fn is_member(&self, id: &ParticipantId) -> bool {
        self.members.contains(id)
    }

    pub fn has_pending_offer(&self, id: &ParticipantId) -> bool {
        self.pending_offers.contains_key(id)
    }

    pub async fn apply(
        &mut self,
        change: RosterChange,
        engine: &mut NegotiationEngine,
    ) -> Result<()> {
        let id = change.participant_id().clone();
        if id == self.local {
            return Ok(());
        }

        match change {
            RosterChange::Added(record) | RosterChange::Modified(record) if record.is_active() => {
                if self.members.insert(id.clone()) {
                    info!("{} joined the roster", id);
                }
                if let Some(offer) = self.pending_offers.remove(&id) {
                    debug!("replaying held offer from {}", id);
                    engine.handle_call_record(offer).await?;
                }
                self.ensure_link(&id, engine).await?;
            }
            _ => self.remove(&id, engine).await,
        }
        Ok(())
    }

    /// Starts a link to `peer` if this side initiates the pair and no live
    /// link exists. Returns whether an offer was started.
    pub async fn ensure_link(
        &mut self,
        peer: &ParticipantId,
        engine: &mut NegotiationEngine,
    ) -> Result<bool> {
        if !should_initiate(&self.local, peer) || engine.has_live_link(peer) {
            return Ok(false);
        }
        engine.initiate(peer).await?;
        Ok(true)
    }

    pub async fn handle_call(
        &mut self,
        record: CallRecord,
        engine: &mut NegotiationEngine,
    ) -> Result<()> {
        let is_offer = record.offer.is_some() && record.answer.is_none();
        if is_offer && record.from != self.local && !self.members.contains(&record.from) {
            debug!("holding offer from {} until it joins the roster", record.from);
            self.pending_offers.insert(record.from.clone(), record);
            return Ok(());
        }
        engine.handle_call_record(record).await
    }

    pub async fn handle_link_change(
        &mut self,
        change: LinkChange,
        engine: &mut NegotiationEngine,
    ) -> Result<()> {
        match change {
            LinkChange::Connected(peer) => {
                self.retries.remove(&peer);
                Ok(())
            }
            LinkChange::Terminated(peer) => {
                if !self.members.contains(&peer) || !self.policy.reinitiate_on_failure {
                    return Ok(());
                }
                // With a watchdog the next tick retries with backoff.
                if self.policy.watchdog.is_some() {
                    return Ok(());
                }
                self.ensure_link(&peer, engine).await.map(|_| ())
            }
        }
    }

    /// Re-initiates links this side is responsible for that went terminal
    /// or never connected within the timeout. No-op without a watchdog.
    pub async fn tick(&mut self, now: Instant, engine: &mut NegotiationEngine) -> Result<()> {
        let Some(watchdog) = self.policy.watchdog.clone() else {
            return Ok(());
        };

        let candidates: Vec<ParticipantId> = self
            .members
            .iter()
            .filter(|peer| should_initiate(&self.local, peer))
            .cloned()
            .collect();

        for peer in candidates {
            let stalled = match engine.registry().get(&peer) {
                None => true,
                Some(link) if !link.is_live() => true,
                Some(link) => {
                    link.state != NegotiationState::Connected
                        && link.transport != TransportState::Connected
                        && now.saturating_duration_since(link.started_at)
                            >= watchdog.connect_timeout
                }
            };
            if !stalled {
                continue;
            }

            let retry = self.retries.entry(peer.clone()).or_insert(RetryState {
                attempts: 0,
                next_attempt: now,
            });
            if retry.attempts >= watchdog.max_attempts || now < retry.next_attempt {
                continue;
            }
            retry.attempts += 1;
            retry.next_attempt = now + watchdog.backoff(retry.attempts);
            warn!(
                "re-initiating link to {} (attempt {}/{})",
                peer, retry.attempts, watchdog.max_attempts
            );
            if let Err(e) = engine.initiate(&peer).await {
                warn!("re-initiation to {} failed: {}", peer, e);
            }
        }
        Ok(())
    }

    async fn remove(&mut self, id: &ParticipantId, engine: &mut NegotiationEngine) {
        if self.members.remove(id) {
            info!("{} left the roster", id);
        }
        self.pending_offers.remove(id);
        self.retries.remove(id);
        engine.close_peer(id).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WatchdogConfig;
    use crate::events::event_queue;
    use crate::media::MediaConstraints;
    use crate::mock::{MockMediaDevices, MockNetwork};
    use crate::room::{ParticipantRecord, Role};
    use crate::signaling::MemorySignaling;
    use crate::topology::TopologyContext;
    use crate::types::SessionDescription;
    use std::sync::Arc;
    use std::time::Duration;

    async fn engine(id: &str, network: &MockNetwork) -> NegotiationEngine {
        let (queue, _rx) = event_queue();
        let ctx = TopologyContext::new(
            id.into(),
            "room".into(),
            Arc::new(MemorySignaling::new()),
            Arc::new(network.connector()),
            Arc::new(MockMediaDevices::new()),
            queue,
        );
        let mut engine = NegotiationEngine::new(&ctx);
        engine
            .media_mut()
            .acquire_local_media(MediaConstraints::audio_only())
            .await;
        engine
    }

    fn added(id: &str) -> RosterChange {
        RosterChange::Added(ParticipantRecord::new(id.into(), id, Role::Regular))
    }

    #[tokio::test]
    async fn only_lesser_id_initiates() {
        let network = MockNetwork::new();
        let mut low = engine("1", &network).await;
        let mut high = engine("2", &network).await;
        let mut low_roster = RosterReconciler::new("1".into(), ReconnectPolicy::default());
        let mut high_roster = RosterReconciler::new("2".into(), ReconnectPolicy::default());

        low_roster.apply(added("2"), &mut low).await.unwrap();
        high_roster.apply(added("1"), &mut high).await.unwrap();

        assert!(low.has_live_link(&"2".into()));
        assert!(!high.has_live_link(&"1".into()));
        assert_eq!(network.connection_count(&"1".into(), &"2".into()), 1);

        // A roster update for the same peer does not start a second link.
        low_roster.apply(added("2"), &mut low).await.unwrap();
        assert_eq!(network.connection_count(&"1".into(), &"2".into()), 1);
    }

    #[tokio::test]
    async fn self_and_removed_records() {
        let network = MockNetwork::new();
        let mut low = engine("1", &network).await;
        let mut roster = RosterReconciler::new("1".into(), ReconnectPolicy::default());

        roster.apply(added("1"), &mut low).await.unwrap();
        assert!(!roster.is_member(&"1".into()));

        roster.apply(added("3"), &mut low).await.unwrap();
        let mut gone = ParticipantRecord::new("3".into(), "3", Role::Regular);
        gone.removed = true;
        roster
            .apply(RosterChange::Modified(gone), &mut low)
            .await
            .unwrap();
        assert!(!roster.is_member(&"3".into()));
        assert!(low.registry().get(&"3".into()).is_none());
    }

    #[tokio::test]
    async fn offers_from_unknown_senders_wait_for_roster() {
        let network = MockNetwork::new();
        let mut high = engine("2", &network).await;
        let mut roster = RosterReconciler::new("2".into(), ReconnectPolicy::default());

        let offer = CallRecord::offer(
            "1".into(),
            "2".into(),
            3,
            SessionDescription::offer("o"),
            false,
        );
        roster.handle_call(offer, &mut high).await.unwrap();
        assert!(roster.has_pending_offer(&"1".into()));
        assert!(high.registry().is_empty());

        roster.apply(added("1"), &mut high).await.unwrap();
        assert!(!roster.has_pending_offer(&"1".into()));
        assert!(high.has_live_link(&"1".into()));
    }

    #[tokio::test]
    async fn terminated_link_reinitiated_when_enabled() {
        let network = MockNetwork::new();
        let mut low = engine("1", &network).await;
        let policy = ReconnectPolicy {
            reinitiate_on_failure: true,
            watchdog: None,
        };
        let mut roster = RosterReconciler::new("1".into(), policy);
        roster.apply(added("2"), &mut low).await.unwrap();

        roster
            .handle_link_change(LinkChange::Terminated("2".into()), &mut low)
            .await
            .unwrap();
        // The link was still live, so nothing new was started.
        assert_eq!(network.connection_count(&"1".into(), &"2".into()), 1);

        low.close_peer(&"2".into()).await;
        roster
            .handle_link_change(LinkChange::Terminated("2".into()), &mut low)
            .await
            .unwrap();
        assert_eq!(network.connection_count(&"1".into(), &"2".into()), 2);
    }

    #[tokio::test]
    async fn watchdog_retries_with_backoff_then_gives_up() {
        let network = MockNetwork::new();
        let mut low = engine("1", &network).await;
        let watchdog = WatchdogConfig {
            connect_timeout: Duration::from_secs(10),
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(4),
            max_attempts: 2,
        };
        let policy = ReconnectPolicy {
            reinitiate_on_failure: false,
            watchdog: Some(watchdog),
        };
        let mut roster = RosterReconciler::new("1".into(), policy);
        roster.apply(added("2"), &mut low).await.unwrap();
        let peer = ParticipantId::from("2");
        let start = low.registry().get(&peer).unwrap().started_at;

        roster
            .tick(start + Duration::from_secs(5), &mut low)
            .await
            .unwrap();
        assert_eq!(network.connection_count(&"1".into(), &peer), 1);

        let first = start + Duration::from_secs(11);
        roster.tick(first, &mut low).await.unwrap();
        assert_eq!(network.connection_count(&"1".into(), &peer), 2);

        // The fresh link restarts the timeout clock.
        let restarted = low.registry().get(&peer).unwrap().started_at;
        let second = restarted.max(first) + Duration::from_secs(11);
        roster.tick(second, &mut low).await.unwrap();
        assert_eq!(network.connection_count(&"1".into(), &peer), 3);

        let started = low.registry().get(&peer).unwrap().started_at;
        let later = started.max(second) + Duration::from_secs(60);
        roster.tick(later, &mut low).await.unwrap();
        assert_eq!(network.connection_count(&"1".into(), &peer), 3);
    }
}
