//! Real-time transport abstraction.
//!
//! `PeerConnector` opens one connection per remote participant; the returned
//! `PeerConnection` exposes the handful of operations negotiation needs.
//! Callbacks from the underlying stack are turned into `TransportEvent`s on
//! the session queue, stamped with the registry generation of the connection
//! that produced them.

mod rtc;

pub use rtc::{RtcConnection, RtcConnector};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use crate::error::Result;
use crate::events::EventQueue;
use crate::media::{LocalTrack, RemoteTrack};
use crate::types::{IceCandidate, MediaKind, ParticipantId, SessionDescription};

/// Connectivity as reported by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl TransportState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TransportState::Disconnected | TransportState::Failed | TransportState::Closed
        )
    }
}

impl fmt::Display for TransportState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransportState::New => "new",
            TransportState::Connecting => "connecting",
            TransportState::Connected => "connected",
            TransportState::Disconnected => "disconnected",
            TransportState::Failed => "failed",
            TransportState::Closed => "closed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone)]
pub enum TransportEventKind {
    LocalCandidate(IceCandidate),
    RemoteTrack(RemoteTrack),
    RemoteTrackEnded { track_id: String },
    StateChanged(TransportState),
}

#[derive(Debug, Clone)]
pub struct TransportEvent {
    pub peer: ParticipantId,
    pub generation: u64,
    pub kind: TransportEventKind,
}

/// Handed to a connection at creation; everything it reports goes here.
#[derive(Debug, Clone)]
pub struct TransportEventSink {
    peer: ParticipantId,
    generation: u64,
    queue: EventQueue,
}

impl TransportEventSink {
    pub fn new(peer: ParticipantId, generation: u64, queue: EventQueue) -> Self {
        Self {
            peer,
            generation,
            queue,
        }
    }

    pub fn peer(&self) -> &ParticipantId {
        &self.peer
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn emit(&self, kind: TransportEventKind) -> bool {
        self.queue.push(TransportEvent {
            peer: self.peer.clone(),
            generation: self.generation,
            kind,
        })
    }
}

/// Result of swapping the outgoing track of one kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplaceOutcome {
    /// Swapped on the existing sender, no signaling needed.
    Replaced,
    /// A new sender was added; the link needs a fresh offer/answer round.
    NeedsRenegotiation,
}

#[async_trait]
pub trait PeerConnector: Send + Sync {
    async fn connect(
        &self,
        local: &ParticipantId,
        remote: &ParticipantId,
        events: TransportEventSink,
    ) -> Result<Arc<dyn PeerConnection>>;
}

#[async_trait]
pub trait PeerConnection: Send + Sync {
    /// Sends `track` on this connection.
    async fn add_track(&self, track: &LocalTrack) -> Result<()>;

    /// Declares interest in receiving `kind` without sending it.
    async fn add_receive_only(&self, kind: MediaKind) -> Result<()>;

    async fn create_offer(&self) -> Result<SessionDescription>;

    async fn create_answer(&self) -> Result<SessionDescription>;

    async fn set_local_description(&self, description: SessionDescription) -> Result<()>;

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()>;

    /// Withdraws an unanswered local offer, returning to the last stable
    /// descriptions.
    async fn rollback(&self) -> Result<()>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()>;

    async fn replace_track(&self, kind: MediaKind, track: &LocalTrack) -> Result<ReplaceOutcome>;

    async fn close(&self) -> Result<()>;
}
