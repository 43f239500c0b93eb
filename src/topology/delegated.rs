use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::{Topology, TopologyContext};
use crate::connection::LinkStatus;
use crate::error::Result;
use crate::events::{EventQueue, SessionEvent};
use crate::media::{LocalMedia, LocalTrack, MediaConstraints, MediaTrackManager, RemoteTrack};
use crate::room::TopologyMode;
use crate::signaling::RosterChange;
use crate::types::{MediaKind, ParticipantId, RoomId, TrackSource};

/// Notifications from the external router, delivered on the session queue.
#[derive(Debug, Clone)]
pub enum RouterEvent {
    TrackSubscribed {
        participant: ParticipantId,
        track: RemoteTrack,
    },
    TrackUnsubscribed {
        participant: ParticipantId,
        track_id: String,
    },
    ParticipantDisconnected(ParticipantId),
    /// The uplink itself went away.
    Disconnected,
}

/// Client side of an external media router. The router library does the
/// negotiation; this crate only publishes and consumes tracks.
#[async_trait]
pub trait RouterUplink: Send + Sync {
    async fn connect(
        &self,
        room_id: &str,
        identity: &ParticipantId,
        events: EventQueue,
    ) -> Result<()>;

    async fn publish(&self, track: &LocalTrack) -> Result<()>;

    async fn unpublish(&self, track_id: &str) -> Result<()>;

    async fn disconnect(&self) -> Result<()>;
}

pub struct DelegatedTopology {
    local: ParticipantId,
    room_id: RoomId,
    router: Arc<dyn RouterUplink>,
    queue: EventQueue,
    media: MediaTrackManager,
    published: HashMap<MediaKind, String>,
    connected: bool,
}

impl DelegatedTopology {
    pub fn new(ctx: TopologyContext, router: Arc<dyn RouterUplink>) -> Self {
        Self {
            media: MediaTrackManager::new(ctx.devices.clone(), ctx.config.start_muted),
            local: ctx.local,
            room_id: ctx.room_id,
            router,
            queue: ctx.queue,
            published: HashMap::new(),
            connected: false,
        }
    }

    async fn send(&mut self, track: &LocalTrack) -> Result<()> {
        let kind = track.kind();
        if self.published.get(&kind).map(String::as_str) == Some(track.id()) {
            return Ok(());
        }
        if let Some(previous) = self.published.remove(&kind) {
            self.router.unpublish(&previous).await?;
        }
        self.router.publish(track).await?;
        self.published.insert(kind, track.id().to_owned());
        Ok(())
    }
}

#[async_trait]
impl Topology for DelegatedTopology {
    fn mode(&self) -> TopologyMode {
        TopologyMode::Delegated
    }

    async fn init_local_media(&mut self, constraints: MediaConstraints) -> LocalMedia {
        self.media.acquire_local_media(constraints).await
    }

    async fn connect(&mut self) -> Result<()> {
        if self.connected {
            return Ok(());
        }
        self.router
            .connect(&self.room_id, &self.local, self.queue.clone())
            .await?;
        self.connected = true;
        info!("{} connected to router for room {}", self.local, self.room_id);

        for kind in [MediaKind::Audio, MediaKind::Video] {
            if let Some(track) = self.media.outgoing(kind) {
                self.send(&track).await?;
            }
        }
        Ok(())
    }

    async fn publish(&mut self, track: LocalTrack) -> Result<()> {
        if track.source() == TrackSource::Screen {
            if let Some(previous) = self.media.set_screen(track.clone()) {
                previous.stop();
            }
        } else {
            self.media.set_local_track(track.clone());
        }
        let Some(outgoing) = self.media.outgoing(track.kind()) else {
            return Ok(());
        };
        if self.connected {
            self.send(&outgoing).await?;
        }
        Ok(())
    }

    async fn unpublish(&mut self, source: TrackSource) -> Result<()> {
        match source {
            TrackSource::Screen => {
                if !self.media.is_screen_sharing() {
                    return Ok(());
                }
                let camera = self.media.clear_screen();
                if !self.connected {
                    return Ok(());
                }
                match camera {
                    Some(camera) => self.send(&camera).await?,
                    None => {
                        if let Some(screen) = self.published.remove(&MediaKind::Video) {
                            self.router.unpublish(&screen).await?;
                        }
                    }
                }
            }
            other => {
                self.media.set_track_enabled(other.kind(), false);
            }
        }
        Ok(())
    }

    // Membership is the router's business; only departures matter here.
    async fn subscribe_to_peer(&mut self, change: RosterChange) -> Result<()> {
        let removed = match &change {
            RosterChange::Removed(_) => true,
            RosterChange::Added(record) | RosterChange::Modified(record) => !record.is_active(),
        };
        if removed {
            self.media.drop_bundle(change.participant_id());
        }
        Ok(())
    }

    async fn handle_event(&mut self, event: SessionEvent) -> Result<()> {
        match event {
            SessionEvent::Router(RouterEvent::TrackSubscribed { participant, track }) => {
                if participant != self.local {
                    self.media.ingest_remote_track(&participant, track);
                }
            }
            SessionEvent::Router(RouterEvent::TrackUnsubscribed {
                participant,
                track_id,
            }) => {
                self.media.remove_remote_track(&participant, &track_id);
            }
            SessionEvent::Router(RouterEvent::ParticipantDisconnected(participant)) => {
                self.media.drop_bundle(&participant);
            }
            SessionEvent::Router(RouterEvent::Disconnected) => {
                warn!("router uplink for room {} disconnected", self.room_id);
                self.connected = false;
                self.published.clear();
                let peers: Vec<ParticipantId> = self.media.bundles().keys().cloned().collect();
                for peer in peers {
                    self.media.drop_bundle(&peer);
                }
            }
            other => debug!("ignoring event in delegated room: {:?}", other),
        }
        Ok(())
    }

    async fn tick(&mut self, _now: Instant) -> Result<()> {
        Ok(())
    }

    async fn teardown(&mut self) {
        if self.connected {
            if let Err(e) = self.router.disconnect().await {
                warn!("router disconnect failed: {}", e);
            }
            self.connected = false;
        }
        self.published.clear();
        self.media.stop_all();
    }

    fn media(&self) -> &MediaTrackManager {
        &self.media
    }

    fn media_mut(&mut self) -> &mut MediaTrackManager {
        &mut self.media
    }

    fn link_status(&self, _peer: &ParticipantId) -> Option<LinkStatus> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::event_queue;
    use crate::mock::{MockMediaDevices, MockNetwork, MockRouter};
    use crate::signaling::MemorySignaling;
    use crate::topology::create_topology;

    fn context(router: Option<MockRouter>) -> (TopologyContext, crate::events::EventReceiver) {
        let (queue, rx) = event_queue();
        let mut ctx = TopologyContext::new(
            "1".into(),
            "room".into(),
            Arc::new(MemorySignaling::new()),
            Arc::new(MockNetwork::new().connector()),
            Arc::new(MockMediaDevices::new()),
            queue,
        );
        if let Some(router) = router {
            ctx = ctx.with_router(Arc::new(router));
        }
        (ctx, rx)
    }

    #[test]
    fn delegated_mode_requires_router() {
        let (ctx, _rx) = context(None);
        assert!(create_topology(TopologyMode::Delegated, ctx).is_err());
    }

    #[tokio::test]
    async fn connect_publishes_local_tracks() {
        let router = MockRouter::new();
        let (ctx, _rx) = context(Some(router.clone()));
        let mut topology = create_topology(TopologyMode::Delegated, ctx).unwrap();
        assert_eq!(topology.mode(), TopologyMode::Delegated);

        let local = topology.init_local_media(MediaConstraints::full()).await;
        topology.connect().await.unwrap();
        assert!(router.is_connected());
        let mut published = router.published();
        published.sort();
        let mut expected = vec![
            local.audio.unwrap().id().to_owned(),
            local.video.unwrap().id().to_owned(),
        ];
        expected.sort();
        assert_eq!(published, expected);
    }

    #[tokio::test]
    async fn screen_share_swaps_published_video() {
        let router = MockRouter::new();
        let (ctx, _rx) = context(Some(router.clone()));
        let mut topology = create_topology(TopologyMode::Delegated, ctx).unwrap();
        let local = topology.init_local_media(MediaConstraints::full()).await;
        topology.connect().await.unwrap();
        let camera = local.video.unwrap();

        let screen = LocalTrack::new(TrackSource::Screen);
        topology.publish(screen.clone()).await.unwrap();
        assert!(router.published().contains(&screen.id().to_owned()));
        assert!(!router.published().contains(&camera.id().to_owned()));

        topology.unpublish(TrackSource::Screen).await.unwrap();
        assert!(!router.published().contains(&screen.id().to_owned()));
        assert!(router.published().contains(&camera.id().to_owned()));
    }

    #[tokio::test]
    async fn router_events_feed_bundles() {
        let router = MockRouter::new();
        let (ctx, mut rx) = context(Some(router.clone()));
        let mut topology = create_topology(TopologyMode::Delegated, ctx).unwrap();
        topology.init_local_media(MediaConstraints::full()).await;
        topology.connect().await.unwrap();

        router.deliver(RouterEvent::TrackSubscribed {
            participant: "2".into(),
            track: RemoteTrack::new("a2", MediaKind::Audio, "2"),
        });
        router.deliver(RouterEvent::TrackSubscribed {
            participant: "2".into(),
            track: RemoteTrack::new("v2", MediaKind::Video, "2"),
        });
        router.deliver(RouterEvent::TrackUnsubscribed {
            participant: "2".into(),
            track_id: "a2".into(),
        });
        while let Ok(event) = rx.try_recv() {
            topology.handle_event(event).await.unwrap();
        }
        let bundle = topology.media().bundle(&"2".into()).unwrap();
        assert_eq!(bundle.tracks().len(), 1);
        assert!(bundle.video().is_some());

        topology
            .subscribe_to_peer(RosterChange::Removed("2".into()))
            .await
            .unwrap();
        assert!(topology.media().bundle(&"2".into()).is_none());

        topology.teardown().await;
        assert!(!router.is_connected());
    }
}
