use async_trait::async_trait;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::{Topology, TopologyContext};
use crate::connection::LinkStatus;
use crate::error::Result;
use crate::events::SessionEvent;
use crate::media::{LocalMedia, LocalTrack, MediaConstraints, MediaTrackManager};
use crate::negotiation::NegotiationEngine;
use crate::room::TopologyMode;
use crate::roster::RosterReconciler;
use crate::signaling::{RosterChange, SignalingEvent};
use crate::types::{MediaKind, ParticipantId, TrackSource};

/// Direct links to every other participant.
pub struct MeshTopology {
    engine: NegotiationEngine,
    roster: RosterReconciler,
}

impl MeshTopology {
    pub fn new(ctx: TopologyContext) -> Self {
        let roster = RosterReconciler::new(ctx.local.clone(), ctx.config.reconnect.clone());
        Self {
            engine: NegotiationEngine::new(&ctx),
            roster,
        }
    }

    pub fn engine(&self) -> &NegotiationEngine {
        &self.engine
    }

    pub fn roster(&self) -> &RosterReconciler {
        &self.roster
    }
}

#[async_trait]
impl Topology for MeshTopology {
    fn mode(&self) -> TopologyMode {
        TopologyMode::Mesh
    }

    async fn init_local_media(&mut self, constraints: MediaConstraints) -> LocalMedia {
        self.engine.media_mut().acquire_local_media(constraints).await
    }

    // Links are driven by roster events as they arrive.
    async fn connect(&mut self) -> Result<()> {
        Ok(())
    }

    async fn publish(&mut self, track: LocalTrack) -> Result<()> {
        let kind = track.kind();
        if track.source() == TrackSource::Screen {
            if let Some(previous) = self.engine.media_mut().set_screen(track.clone()) {
                previous.stop();
            }
        } else {
            self.engine.media_mut().set_local_track(track.clone());
        }
        let Some(outgoing) = self.engine.media().outgoing(kind) else {
            return Ok(());
        };
        self.engine.replace_track(kind, &outgoing).await?;
        Ok(())
    }

    async fn unpublish(&mut self, source: TrackSource) -> Result<()> {
        match source {
            TrackSource::Screen => {
                if !self.engine.media().is_screen_sharing() {
                    return Ok(());
                }
                // Without a camera the remote side keeps a stopped sender.
                if let Some(camera) = self.engine.media_mut().clear_screen() {
                    self.engine.replace_track(MediaKind::Video, &camera).await?;
                }
            }
            other => {
                self.engine.media_mut().set_track_enabled(other.kind(), false);
            }
        }
        Ok(())
    }

    async fn subscribe_to_peer(&mut self, change: RosterChange) -> Result<()> {
        self.roster.apply(change, &mut self.engine).await
    }

    async fn handle_event(&mut self, event: SessionEvent) -> Result<()> {
        match event {
            SessionEvent::Signaling(SignalingEvent::Call(record)) => {
                self.roster.handle_call(record, &mut self.engine).await
            }
            SessionEvent::Signaling(SignalingEvent::Candidate(record)) => {
                self.engine.handle_remote_candidate(record).await
            }
            SessionEvent::Signaling(SignalingEvent::Roster(change)) => {
                self.subscribe_to_peer(change).await
            }
            SessionEvent::Signaling(SignalingEvent::Room(_)) => Ok(()),
            SessionEvent::Transport(event) => {
                if let Some(change) = self.engine.handle_transport_event(event).await? {
                    self.roster.handle_link_change(change, &mut self.engine).await?;
                }
                Ok(())
            }
            SessionEvent::Router(event) => {
                warn!("router event in a mesh room: {:?}", event);
                Ok(())
            }
        }
    }

    async fn tick(&mut self, now: Instant) -> Result<()> {
        self.roster.tick(now, &mut self.engine).await
    }

    async fn teardown(&mut self) {
        debug!("tearing down mesh");
        self.engine.teardown().await;
    }

    fn media(&self) -> &MediaTrackManager {
        self.engine.media()
    }

    fn media_mut(&mut self) -> &mut MediaTrackManager {
        self.engine.media_mut()
    }

    fn link_status(&self, peer: &ParticipantId) -> Option<LinkStatus> {
        self.engine.link_status(peer)
    }
}
