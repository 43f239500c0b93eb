//! In-memory stand-ins for the transport, capture devices and router.
//!
//! `MockNetwork` pairs connections by the id written into their session
//! descriptions, so two engines negotiating through any signaling store end
//! up with connected mock transports that announce each other's tracks.

use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::error::{Error, MediaError, Result};
use crate::events::EventQueue;
use crate::media::{LocalTrack, MediaConstraints, MediaDevices, RemoteTrack};
use crate::topology::{RouterEvent, RouterUplink};
use crate::transport::{
    PeerConnection, PeerConnector, ReplaceOutcome, TransportEventKind, TransportEventSink,
    TransportState,
};
use crate::types::{
    IceCandidate, MediaKind, ParticipantId, SdpType, SessionDescription, TrackSource,
};

const SDP_PREFIX: &str = "mock";

/// Host candidates emitted by each connection on its first local description.
const LOCAL_CANDIDATES: usize = 2;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ============================================================================
// Mock Network
// ============================================================================

struct MockSender {
    id: String,
    kind: MediaKind,
    track: LocalTrack,
}

struct ConnectionState {
    local: ParticipantId,
    remote: ParticipantId,
    sink: TransportEventSink,
    senders: Vec<MockSender>,
    receive_only: Vec<MediaKind>,
    local_description: Option<SessionDescription>,
    stable_local: Option<SessionDescription>,
    remote_description: Option<SessionDescription>,
    partner: Option<usize>,
    have_local_offer: bool,
    have_remote_offer: bool,
    candidates_emitted: bool,
    applied: Vec<String>,
    announced: HashSet<String>,
    offers_created: usize,
    answers_created: usize,
    connected: bool,
    closed: bool,
}

impl ConnectionState {
    fn is_stable(&self) -> bool {
        !self.closed
            && self.local_description.is_some()
            && self.remote_description.is_some()
            && !self.have_local_offer
            && !self.have_remote_offer
    }
}

struct NetworkState {
    connections: Vec<ConnectionState>,
    replace_supported: bool,
}

impl NetworkState {
    /// Marks a pair connected once both sides hold matching stable
    /// descriptions, then announces every sender the other side has not
    /// seen yet.
    fn settle(&mut self, index: usize) {
        let Some(partner) = self.connections[index].partner else {
            return;
        };
        if partner >= self.connections.len() || self.connections[partner].partner != Some(index) {
            return;
        }
        if !self.connections[index].is_stable() || !self.connections[partner].is_stable() {
            return;
        }

        for (this, other) in [(index, partner), (partner, index)] {
            if !self.connections[this].connected {
                self.connections[this].connected = true;
                self.connections[this]
                    .sink
                    .emit(TransportEventKind::StateChanged(TransportState::Connected));
            }
            let stream_id = self.connections[other].local.to_string();
            let fresh: Vec<RemoteTrack> = self.connections[other]
                .senders
                .iter()
                .filter(|sender| !self.connections[this].announced.contains(&sender.id))
                .map(|sender| RemoteTrack::new(sender.id.clone(), sender.kind, stream_id.clone()))
                .collect();
            let conn = &mut self.connections[this];
            for track in fresh {
                conn.announced.insert(track.id.clone());
                conn.sink.emit(TransportEventKind::RemoteTrack(track));
            }
        }
    }
}

/// Shared fake network. Clones see the same connections.
#[derive(Clone)]
pub struct MockNetwork {
    state: Arc<Mutex<NetworkState>>,
}

impl MockNetwork {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(NetworkState {
                connections: Vec::new(),
                replace_supported: true,
            })),
        }
    }

    pub fn connector(&self) -> MockConnector {
        MockConnector {
            network: self.clone(),
        }
    }

    /// When false, `replace_track` always adds a new sender and asks for
    /// renegotiation.
    pub fn set_replace_supported(&self, supported: bool) {
        self.lock().replace_supported = supported;
    }

    /// Most recent connection opened by `local` towards `remote`.
    pub fn connection_between(
        &self,
        local: &ParticipantId,
        remote: &ParticipantId,
    ) -> Option<MockConnection> {
        let state = self.lock();
        state
            .connections
            .iter()
            .rposition(|c| &c.local == local && &c.remote == remote)
            .map(|index| MockConnection {
                network: self.clone(),
                index,
            })
    }

    /// How many connections `local` ever opened towards `remote`.
    pub fn connection_count(&self, local: &ParticipantId, remote: &ParticipantId) -> usize {
        self.lock()
            .connections
            .iter()
            .filter(|c| &c.local == local && &c.remote == remote)
            .count()
    }

    fn lock(&self) -> MutexGuard<'_, NetworkState> {
        lock(&self.state)
    }
}

impl Default for MockNetwork {
    fn default() -> Self {
        Self::new()
    }
}

pub struct MockConnector {
    network: MockNetwork,
}

#[async_trait]
impl PeerConnector for MockConnector {
    async fn connect(
        &self,
        local: &ParticipantId,
        remote: &ParticipantId,
        events: TransportEventSink,
    ) -> Result<Arc<dyn PeerConnection>> {
        let mut state = self.network.lock();
        state.connections.push(ConnectionState {
            local: local.clone(),
            remote: remote.clone(),
            sink: events,
            senders: Vec::new(),
            receive_only: Vec::new(),
            local_description: None,
            stable_local: None,
            remote_description: None,
            partner: None,
            have_local_offer: false,
            have_remote_offer: false,
            candidates_emitted: false,
            applied: Vec::new(),
            announced: HashSet::new(),
            offers_created: 0,
            answers_created: 0,
            connected: false,
            closed: false,
        });
        let index = state.connections.len() - 1;
        Ok(Arc::new(MockConnection {
            network: self.network.clone(),
            index,
        }))
    }
}

/// Handle to one mock connection, usable both as the transport and as a
/// test probe.
#[derive(Clone)]
pub struct MockConnection {
    network: MockNetwork,
    index: usize,
}

impl MockConnection {
    /// Remote candidates applied so far, in order.
    pub fn applied_candidates(&self) -> Vec<String> {
        self.network.lock().connections[self.index].applied.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.network.lock().connections[self.index].closed
    }

    /// Pushes a transport state change as if the network reported it.
    pub fn emit_state(&self, state: TransportState) {
        self.network.lock().connections[self.index]
            .sink
            .emit(TransportEventKind::StateChanged(state));
    }

    /// Reports the remote track `track_id` as ended, as a transport does
    /// when the remote stops sending it.
    pub fn end_remote_track(&self, track_id: &str) {
        self.network.lock().connections[self.index]
            .sink
            .emit(TransportEventKind::RemoteTrackEnded {
                track_id: track_id.to_owned(),
            });
    }

    /// Track currently sent for `kind`, newest sender first.
    pub fn sender_track(&self, kind: MediaKind) -> Option<LocalTrack> {
        self.network.lock().connections[self.index]
            .senders
            .iter()
            .rev()
            .find(|sender| sender.kind == kind)
            .map(|sender| sender.track.clone())
    }

    pub fn receive_only(&self) -> Vec<MediaKind> {
        self.network.lock().connections[self.index].receive_only.clone()
    }

    pub fn offers_created(&self) -> usize {
        self.network.lock().connections[self.index].offers_created
    }

    fn with_open<T>(&self, f: impl FnOnce(&mut NetworkState) -> Result<T>) -> Result<T> {
        let mut state = self.network.lock();
        if state.connections[self.index].closed {
            return Err(Error::Transport("connection closed".into()));
        }
        f(&mut *state)
    }
}

fn parse_partner(description: &SessionDescription) -> Option<usize> {
    let mut parts = description.sdp.split(':');
    if parts.next()? != SDP_PREFIX {
        return None;
    }
    parts.next()?.parse().ok()
}

#[async_trait]
impl PeerConnection for MockConnection {
    async fn add_track(&self, track: &LocalTrack) -> Result<()> {
        self.with_open(|state| {
            state.connections[self.index].senders.push(MockSender {
                id: track.id().to_owned(),
                kind: track.kind(),
                track: track.clone(),
            });
            Ok(())
        })
    }

    async fn add_receive_only(&self, kind: MediaKind) -> Result<()> {
        self.with_open(|state| {
            state.connections[self.index].receive_only.push(kind);
            Ok(())
        })
    }

    async fn create_offer(&self) -> Result<SessionDescription> {
        self.with_open(|state| {
            let conn = &mut state.connections[self.index];
            conn.offers_created += 1;
            Ok(SessionDescription::offer(format!(
                "{SDP_PREFIX}:{}:offer:{}",
                self.index, conn.offers_created
            )))
        })
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        self.with_open(|state| {
            let conn = &mut state.connections[self.index];
            if !conn.have_remote_offer {
                return Err(Error::Transport("no remote offer to answer".into()));
            }
            conn.answers_created += 1;
            Ok(SessionDescription::answer(format!(
                "{SDP_PREFIX}:{}:answer:{}",
                self.index, conn.answers_created
            )))
        })
    }

    async fn set_local_description(&self, description: SessionDescription) -> Result<()> {
        self.with_open(|state| {
            let conn = &mut state.connections[self.index];
            match description.sdp_type {
                SdpType::Offer => {
                    conn.stable_local = conn.local_description.clone();
                    conn.have_local_offer = true;
                }
                SdpType::Answer => conn.have_remote_offer = false,
            }
            conn.local_description = Some(description);

            if !conn.candidates_emitted {
                conn.candidates_emitted = true;
                for n in 0..LOCAL_CANDIDATES {
                    let candidate = IceCandidate {
                        candidate: format!(
                            "candidate:{} 1 udp 2130706431 127.0.0.1 {} typ host",
                            self.index,
                            50000 + n
                        ),
                        sdp_mid: Some(n.to_string()),
                        sdp_mline_index: Some(n as u16),
                    };
                    conn.sink.emit(TransportEventKind::LocalCandidate(candidate));
                }
            }
            state.settle(self.index);
            Ok(())
        })
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()> {
        self.with_open(|state| {
            let conn = &mut state.connections[self.index];
            match description.sdp_type {
                SdpType::Offer => conn.have_remote_offer = true,
                SdpType::Answer => conn.have_local_offer = false,
            }
            if let Some(partner) = parse_partner(&description) {
                conn.partner = Some(partner);
            }
            conn.remote_description = Some(description);
            state.settle(self.index);
            Ok(())
        })
    }

    async fn rollback(&self) -> Result<()> {
        self.with_open(|state| {
            let conn = &mut state.connections[self.index];
            if conn.have_local_offer {
                conn.have_local_offer = false;
                conn.local_description = conn.stable_local.take();
            }
            Ok(())
        })
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        self.with_open(|state| {
            let conn = &mut state.connections[self.index];
            if conn.remote_description.is_none() {
                return Err(Error::Transport("remote description not set".into()));
            }
            conn.applied.push(candidate.candidate);
            Ok(())
        })
    }

    async fn replace_track(&self, kind: MediaKind, track: &LocalTrack) -> Result<ReplaceOutcome> {
        self.with_open(|state| {
            let replace_supported = state.replace_supported;
            let conn = &mut state.connections[self.index];
            if replace_supported {
                if let Some(sender) = conn.senders.iter_mut().rev().find(|s| s.kind == kind) {
                    sender.track = track.clone();
                    return Ok(ReplaceOutcome::Replaced);
                }
            }
            conn.senders.push(MockSender {
                id: track.id().to_owned(),
                kind,
                track: track.clone(),
            });
            Ok(ReplaceOutcome::NeedsRenegotiation)
        })
    }

    async fn close(&self) -> Result<()> {
        let mut state = self.network.lock();
        let conn = &mut state.connections[self.index];
        if conn.closed {
            return Ok(());
        }
        conn.closed = true;
        conn.sink
            .emit(TransportEventKind::StateChanged(TransportState::Closed));
        let (connected, partner) = (conn.connected, conn.partner);

        if let Some(partner) = partner.filter(|_| connected) {
            if let Some(other) = state.connections.get(partner) {
                if !other.closed && other.partner == Some(self.index) {
                    other
                        .sink
                        .emit(TransportEventKind::StateChanged(TransportState::Disconnected));
                }
            }
        }
        Ok(())
    }
}

// ============================================================================
// Mock Media Devices
// ============================================================================

struct DeviceState {
    audio: bool,
    video: bool,
    requests: Vec<MediaConstraints>,
}

/// Capture backend with a switchable microphone and camera. Clones share
/// state, so a test can keep one to inspect the requests made.
#[derive(Clone)]
pub struct MockMediaDevices {
    state: Arc<Mutex<DeviceState>>,
}

impl MockMediaDevices {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(DeviceState {
                audio: true,
                video: true,
                requests: Vec::new(),
            })),
        }
    }

    pub fn without_audio(self) -> Self {
        lock(&self.state).audio = false;
        self
    }

    pub fn without_video(self) -> Self {
        lock(&self.state).video = false;
        self
    }

    /// Every constraint set passed to `get_user_media`, in order.
    pub fn requests(&self) -> Vec<MediaConstraints> {
        lock(&self.state).requests.clone()
    }
}

impl Default for MockMediaDevices {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MediaDevices for MockMediaDevices {
    async fn get_user_media(
        &self,
        constraints: &MediaConstraints,
    ) -> std::result::Result<Vec<LocalTrack>, MediaError> {
        let mut state = lock(&self.state);
        state.requests.push(*constraints);
        if constraints.audio && !state.audio {
            return Err(MediaError::NotFound("microphone".into()));
        }
        if constraints.video && !state.video {
            return Err(MediaError::NotFound("camera".into()));
        }

        let mut tracks = Vec::new();
        if constraints.audio {
            tracks.push(LocalTrack::new(TrackSource::Microphone));
        }
        if constraints.video {
            tracks.push(LocalTrack::new(TrackSource::Camera));
        }
        Ok(tracks)
    }
}

// ============================================================================
// Mock Router
// ============================================================================

#[derive(Default)]
struct RouterState {
    events: Option<EventQueue>,
    published: Vec<String>,
}

/// Router uplink that records publications and lets a test inject events.
#[derive(Clone, Default)]
pub struct MockRouter {
    state: Arc<Mutex<RouterState>>,
}

impl MockRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pushes `event` as if the router sent it. False when not connected.
    pub fn deliver(&self, event: RouterEvent) -> bool {
        match &lock(&self.state).events {
            Some(queue) => queue.push(event),
            None => false,
        }
    }

    /// Ids of the tracks currently published.
    pub fn published(&self) -> Vec<String> {
        lock(&self.state).published.clone()
    }

    pub fn is_connected(&self) -> bool {
        lock(&self.state).events.is_some()
    }
}

#[async_trait]
impl RouterUplink for MockRouter {
    async fn connect(
        &self,
        _room_id: &str,
        _identity: &ParticipantId,
        events: EventQueue,
    ) -> Result<()> {
        lock(&self.state).events = Some(events);
        Ok(())
    }

    async fn publish(&self, track: &LocalTrack) -> Result<()> {
        let mut state = lock(&self.state);
        if state.events.is_none() {
            return Err(Error::Transport("router not connected".into()));
        }
        state.published.push(track.id().to_owned());
        Ok(())
    }

    async fn unpublish(&self, track_id: &str) -> Result<()> {
        lock(&self.state).published.retain(|id| id != track_id);
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        let mut state = lock(&self.state);
        state.events = None;
        state.published.clear();
        Ok(())
    }
}
