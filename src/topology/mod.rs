//! Mode selection.
//!
//! A room is either a mesh (one negotiated link per remote participant) or
//! delegated to an external router (one uplink, the router forwards media).
//! The session only talks to the `Topology` trait and never knows which.

mod delegated;
mod mesh;

pub use delegated::{DelegatedTopology, RouterEvent, RouterUplink};
pub use mesh::MeshTopology;

use async_trait::async_trait;
use std::sync::Arc;
use tokio::time::Instant;

use crate::config::ClientConfig;
use crate::connection::{ConnectionMonitor, LinkStatus};
use crate::error::{Error, Result};
use crate::events::{EventQueue, SessionEvent};
use crate::media::{LocalMedia, LocalTrack, MediaConstraints, MediaDevices, MediaTrackManager};
use crate::metrics::NegotiationMetrics;
use crate::room::TopologyMode;
use crate::signaling::{RosterChange, SignalingChannel};
use crate::transport::PeerConnector;
use crate::types::{ParticipantId, RoomId, TrackSource};

/// Everything a topology needs from its session.
#[derive(Clone)]
pub struct TopologyContext {
    pub local: ParticipantId,
    pub room_id: RoomId,
    pub signaling: Arc<dyn SignalingChannel>,
    pub connector: Arc<dyn PeerConnector>,
    pub devices: Arc<dyn MediaDevices>,
    pub router: Option<Arc<dyn RouterUplink>>,
    pub queue: EventQueue,
    pub config: ClientConfig,
    pub monitor: ConnectionMonitor,
    pub metrics: NegotiationMetrics,
}

impl TopologyContext {
    pub fn new(
        local: ParticipantId,
        room_id: RoomId,
        signaling: Arc<dyn SignalingChannel>,
        connector: Arc<dyn PeerConnector>,
        devices: Arc<dyn MediaDevices>,
        queue: EventQueue,
    ) -> Self {
        Self {
            local,
            room_id,
            signaling,
            connector,
            devices,
            router: None,
            queue,
            config: ClientConfig::default(),
            monitor: ConnectionMonitor::new(),
            metrics: NegotiationMetrics::new(),
        }
    }

    pub fn with_config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_router(mut self, router: Arc<dyn RouterUplink>) -> Self {
        self.router = Some(router);
        self
    }
}

#[async_trait]
pub trait Topology: Send {
    fn mode(&self) -> TopologyMode;

    /// Opens local capture, degrading instead of failing.
    async fn init_local_media(&mut self, constraints: MediaConstraints) -> LocalMedia;

    /// Brings the topology up once local media is known.
    async fn connect(&mut self) -> Result<()>;

    /// Starts sending `track`. A screen track takes over outgoing video.
    async fn publish(&mut self, track: LocalTrack) -> Result<()>;

    /// Stops sending the track from `source`.
    async fn unpublish(&mut self, source: TrackSource) -> Result<()>;

    /// Reacts to a roster change about another participant.
    async fn subscribe_to_peer(&mut self, change: RosterChange) -> Result<()>;

    /// Call, candidate, transport and router events.
    async fn handle_event(&mut self, event: SessionEvent) -> Result<()>;

    /// Periodic housekeeping.
    async fn tick(&mut self, now: Instant) -> Result<()>;

    /// Releases everything. Idempotent.
    async fn teardown(&mut self);

    fn media(&self) -> &MediaTrackManager;

    fn media_mut(&mut self) -> &mut MediaTrackManager;

    fn link_status(&self, peer: &ParticipantId) -> Option<LinkStatus>;
}

pub fn create_topology(mode: TopologyMode, ctx: TopologyContext) -> Result<Box<dyn Topology>> {
    match mode {
        TopologyMode::Mesh => Ok(Box::new(MeshTopology::new(ctx))),
        TopologyMode::Delegated => {
            let router = ctx.router.clone().ok_or_else(|| {
                Error::InvalidState("delegated room but no router uplink configured".into())
            })?;
            Ok(Box::new(DelegatedTopology::new(ctx, router)))
        }
    }
}
