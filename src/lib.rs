//! Negotiation and media-routing core of a multi-party video meeting client.
//!
//! A [`MeetingSession`] joins a room through a [`SignalingChannel`], picks a
//! topology from the room's mode and keeps one negotiated link per remote
//! participant (mesh) or a single router uplink (delegated).

pub mod config;
pub mod connection;
pub mod error;
pub mod events;
pub mod media;
pub mod metrics;
pub mod mock;
pub mod negotiation;
pub mod registry;
pub mod room;
pub mod roster;
pub mod session;
pub mod signaling;
pub mod topology;
pub mod transport;
pub mod types;

pub use config::{ClientConfig, ReconnectPolicy, WatchdogConfig};
pub use connection::{ConnectionMonitor, ConnectionState, ConnectionStatus, LinkStatus};
pub use error::{Error, MediaError, Result};
pub use events::{EventQueue, SessionEvent};
pub use media::{
    LocalMedia, LocalTrack, MediaConstraints, MediaDevices, MediaTrackManager, RemoteMediaBundle,
    RemoteTrack, SystemMediaDevices,
};
pub use metrics::{MetricsSnapshot, NegotiationMetrics};
pub use negotiation::NegotiationEngine;
pub use registry::{ConnectionRegistry, LinkRole, NegotiationState};
pub use room::{ParticipantRecord, PermissionUpdate, Role, RoomRecord, RoomSettings, TopologyMode};
pub use session::{Lifecycle, MeetingSession, SessionCommand, SessionContext};
pub use signaling::{MemorySignaling, SignalingChannel, WsSignaling};
pub use topology::{RouterEvent, RouterUplink, Topology};
pub use transport::{PeerConnection, PeerConnector, RtcConnector, TransportState};
pub use types::{MediaKind, ParticipantId, RoomId, TrackSource};
