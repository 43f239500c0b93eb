//! One participant's presence in one meeting.
//!
//! The session owns the event queue and the active topology. Every state
//! change, whether it comes from the signaling store, a transport callback,
//! the router or the local user, is applied by the session on one logical
//! thread, and only while the lifecycle allows it.

use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, Interval};
use tracing::{debug, info, warn};

use crate::config::ClientConfig;
use crate::connection::{ConnectionMonitor, ConnectionState, LinkStatus};
use crate::error::{Error, Result};
use crate::events::{event_queue, EventQueue, EventReceiver, SessionEvent};
use crate::media::{LocalTrack, MediaConstraints, MediaDevices, MediaTrackManager};
use crate::metrics::NegotiationMetrics;
use crate::room::{
    ActiveView, ParticipantRecord, PermissionUpdate, Role, RoomRecord, RoomSettings, TopologyMode,
};
use crate::signaling::{RosterChange, SignalingChannel, SignalingEvent, Subscription, Topic};
use crate::topology::{create_topology, RouterUplink, Topology, TopologyContext};
use crate::transport::PeerConnector;
use crate::types::{MediaKind, ParticipantId, RoomId, TrackSource};

/// Length of generated room ids.
const ROOM_ID_LEN: usize = 10;

/// Collaborators a session is built from.
#[derive(Clone)]
pub struct SessionContext {
    pub config: ClientConfig,
    pub signaling: Arc<dyn SignalingChannel>,
    pub connector: Arc<dyn PeerConnector>,
    pub devices: Arc<dyn MediaDevices>,
    /// Required for delegated rooms only.
    pub router: Option<Arc<dyn RouterUplink>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Unattached,
    Joining,
    Active,
    Leaving,
}

impl fmt::Display for Lifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Lifecycle::Unattached => write!(f, "unattached"),
            Lifecycle::Joining => write!(f, "joining"),
            Lifecycle::Active => write!(f, "active"),
            Lifecycle::Leaving => write!(f, "leaving"),
        }
    }
}

/// User actions fed to `MeetingSession::run`.
#[derive(Debug)]
pub enum SessionCommand {
    ToggleTrack(MediaKind),
    StartScreenShare(LocalTrack),
    StopScreenShare,
    Leave(Option<oneshot::Sender<()>>),
}

enum Step {
    Command(SessionCommand),
    Event(SessionEvent),
    Tick(Instant),
    Closed,
}

pub struct MeetingSession {
    ctx: SessionContext,
    queue: EventQueue,
    events: EventReceiver,
    lifecycle: Lifecycle,
    room: Option<RoomRecord>,
    me: Option<ParticipantRecord>,
    topology: Option<Box<dyn Topology>>,
    subscriptions: Vec<Subscription>,
    participants: BTreeMap<ParticipantId, ParticipantRecord>,
    monitor: ConnectionMonitor,
    metrics: NegotiationMetrics,
}

impl MeetingSession {
    pub fn new(ctx: SessionContext) -> Self {
        let (queue, events) = event_queue();
        Self {
            ctx,
            queue,
            events,
            lifecycle: Lifecycle::Unattached,
            room: None,
            me: None,
            topology: None,
            subscriptions: Vec::new(),
            participants: BTreeMap::new(),
            monitor: ConnectionMonitor::new(),
            metrics: NegotiationMetrics::new(),
        }
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.lifecycle
    }

    pub fn room(&self) -> Option<&RoomRecord> {
        self.room.as_ref()
    }

    /// Our own roster record as last written or observed.
    pub fn me(&self) -> Option<&ParticipantRecord> {
        self.me.as_ref()
    }

    /// Everyone in the roster, ourselves included.
    pub fn participants(&self) -> &BTreeMap<ParticipantId, ParticipantRecord> {
        &self.participants
    }

    pub fn mode(&self) -> Option<TopologyMode> {
        self.topology.as_ref().map(|topology| topology.mode())
    }

    pub fn media(&self) -> Option<&MediaTrackManager> {
        self.topology.as_ref().map(|topology| topology.media())
    }

    pub fn link_status(&self, peer: &ParticipantId) -> Option<LinkStatus> {
        self.topology.as_ref()?.link_status(peer)
    }

    pub fn monitor(&self) -> &ConnectionMonitor {
        &self.monitor
    }

    pub fn metrics(&self) -> &NegotiationMetrics {
        &self.metrics
    }

    /// Creates a room owned by `user` and joins it as admin. Returns the
    /// generated room id.
    pub async fn create_meeting(
        &mut self,
        user: ParticipantId,
        display_name: &str,
        mode: TopologyMode,
    ) -> Result<RoomId> {
        self.require_lifecycle(Lifecycle::Unattached, "create a meeting")?;
        let room_id: RoomId = uuid::Uuid::new_v4()
            .simple()
            .to_string()
            .chars()
            .take(ROOM_ID_LEN)
            .collect();

        let room = RoomRecord::new(room_id.clone(), user.clone(), mode);
        self.ctx.signaling.create_room(room).await?;
        info!("{} created {} room {}", user, mode_label(mode), room_id);

        self.join_meeting(&room_id, user, display_name).await?;
        Ok(room_id)
    }

    /// Reads the room, adopts its mode and writes our roster entry. The
    /// creator joins as admin.
    pub async fn join_meeting(
        &mut self,
        room_id: &str,
        user: ParticipantId,
        display_name: &str,
    ) -> Result<()> {
        self.require_lifecycle(Lifecycle::Unattached, "join a meeting")?;
        let room = self
            .ctx
            .signaling
            .get_room(room_id)
            .await?
            .ok_or_else(|| Error::RoomNotFound(room_id.to_owned()))?;

        self.lifecycle = Lifecycle::Joining;
        self.monitor.update_state(ConnectionState::Joining);

        match self.attach(room, user, display_name).await {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!("joining {} failed: {}", room_id, e);
                self.monitor.set_error(e.to_string());
                self.reset();
                Err(e)
            }
        }
    }

    async fn attach(
        &mut self,
        room: RoomRecord,
        user: ParticipantId,
        display_name: &str,
    ) -> Result<()> {
        let role = if room.creator_id == user {
            Role::Admin
        } else {
            Role::Regular
        };

        let mut topology_ctx = TopologyContext::new(
            user.clone(),
            room.id.clone(),
            self.ctx.signaling.clone(),
            self.ctx.connector.clone(),
            self.ctx.devices.clone(),
            self.queue.clone(),
        )
        .with_config(self.ctx.config.clone());
        topology_ctx.monitor = self.monitor.clone();
        topology_ctx.metrics = self.metrics.clone();
        if let Some(router) = &self.ctx.router {
            topology_ctx = topology_ctx.with_router(router.clone());
        }
        let topology = create_topology(room.mode, topology_ctx)?;

        let record = ParticipantRecord::new(user.clone(), display_name, role);
        self.ctx.signaling.put_participant(&room.id, record.clone()).await?;
        info!("{} joined room {} as {:?}", user, room.id, role);

        self.participants.insert(user, record.clone());
        self.me = Some(record);
        self.room = Some(room);
        self.topology = Some(topology);
        Ok(())
    }

    /// Opens local media, subscribes to the room and brings the topology
    /// up. Links follow from the roster as it streams in.
    pub async fn start(&mut self) -> Result<()> {
        self.require_lifecycle(Lifecycle::Joining, "start")?;
        match self.open().await {
            Ok(()) => {
                self.lifecycle = Lifecycle::Active;
                self.monitor.update_state(ConnectionState::Connected);
                Ok(())
            }
            Err(e) => {
                warn!("starting session failed: {}", e);
                self.monitor.set_error(e.to_string());
                self.leave().await;
                Err(e)
            }
        }
    }

    async fn open(&mut self) -> Result<()> {
        let (room_id, me) = self.identity()?;
        let constraints = MediaConstraints {
            audio: true,
            video: self.ctx.config.request_video,
        };
        let topology = self.topology_mut()?;
        let local = topology.init_local_media(constraints).await;
        let mic_on = local.audio.as_ref().map(LocalTrack::is_enabled).unwrap_or(false);
        let camera_on = local.video.as_ref().map(LocalTrack::is_enabled).unwrap_or(false);

        if let Some(record) = self.me.as_mut() {
            if record.mic_on != mic_on || record.camera_on != camera_on {
                record.mic_on = mic_on;
                record.camera_on = camera_on;
                self.write_me().await;
            }
        }

        for topic in [
            Topic::Room,
            Topic::Roster,
            Topic::CallsTo(me.clone()),
            Topic::CandidatesTo(me),
        ] {
            let subscription = self
                .ctx
                .signaling
                .subscribe(&room_id, topic, self.queue.clone())
                .await?;
            self.subscriptions.push(subscription);
        }

        self.topology_mut()?.connect().await
    }

    /// Leaves the meeting from any state: unsubscribes, closes every link,
    /// stops local media and removes our roster entry. Safe to repeat.
    pub async fn leave(&mut self) {
        if self.lifecycle == Lifecycle::Unattached || self.lifecycle == Lifecycle::Leaving {
            return;
        }
        self.lifecycle = Lifecycle::Leaving;
        self.monitor.update_state(ConnectionState::Leaving);

        self.subscriptions.clear();
        if let Some(mut topology) = self.topology.take() {
            topology.teardown().await;
        }
        if let (Some(room), Some(me)) = (&self.room, &self.me) {
            if let Err(e) = self.ctx.signaling.remove_participant(&room.id, &me.id).await {
                warn!("failed to remove roster entry for {}: {}", me.id, e);
            }
            info!("{} left room {}", me.id, room.id);
        }

        let mut dropped = 0;
        while self.events.try_recv().is_ok() {
            dropped += 1;
        }
        if dropped > 0 {
            debug!("discarded {} queued events on leave", dropped);
        }
        self.reset();
    }

    fn reset(&mut self) {
        self.subscriptions.clear();
        self.topology = None;
        self.room = None;
        self.me = None;
        self.participants.clear();
        self.lifecycle = Lifecycle::Unattached;
        self.monitor.clear_links();
        self.monitor.update_state(ConnectionState::Idle);
    }

    /// Applies one queued event. Ignored unless the session is active.
    pub async fn handle_event(&mut self, event: SessionEvent) -> Result<()> {
        if self.lifecycle != Lifecycle::Active {
            debug!("ignoring event while {}", self.lifecycle);
            return Ok(());
        }

        match event {
            SessionEvent::Signaling(SignalingEvent::Room(room)) => {
                if self.room.as_ref().map(|r| r.id == room.id).unwrap_or(false) {
                    self.room = Some(room);
                }
                Ok(())
            }
            SessionEvent::Signaling(SignalingEvent::Roster(change)) => {
                self.apply_roster(change).await
            }
            other => self.topology_mut()?.handle_event(other).await,
        }
    }

    async fn apply_roster(&mut self, change: RosterChange) -> Result<()> {
        let id = change.participant_id().clone();
        match &change {
            RosterChange::Added(record) | RosterChange::Modified(record) => {
                self.participants.insert(id.clone(), record.clone());
            }
            RosterChange::Removed(_) => {
                self.participants.remove(&id);
            }
        }

        if self.me.as_ref().map(|me| me.id == id).unwrap_or(false) {
            return self.apply_own_record(change).await;
        }
        self.topology_mut()?.subscribe_to_peer(change).await
    }

    /// Reacts to what others did to our roster entry.
    async fn apply_own_record(&mut self, change: RosterChange) -> Result<()> {
        let record = match change {
            RosterChange::Removed(_) => {
                info!("our roster entry was deleted; leaving");
                self.leave().await;
                return Ok(());
            }
            RosterChange::Added(record) | RosterChange::Modified(record) => record,
        };
        if record.removed {
            info!("removed from the meeting by an admin");
            self.leave().await;
            return Ok(());
        }

        let sharing = self
            .media()
            .map(MediaTrackManager::is_screen_sharing)
            .unwrap_or(false);
        let media = self.topology_mut()?.media_mut();
        if (record.force_muted || !record.mic_allowed) && media.is_track_enabled(MediaKind::Audio) {
            info!("microphone disabled by an admin");
            media.set_track_enabled(MediaKind::Audio, false);
        }
        if !record.video_allowed && media.is_track_enabled(MediaKind::Video) {
            info!("camera disabled by an admin");
            media.set_track_enabled(MediaKind::Video, false);
        }
        self.me = Some(record.clone());

        if !record.screen_share_allowed && sharing {
            info!("screen sharing revoked by an admin");
            self.stop_screen_share().await?;
        }
        Ok(())
    }

    /// Drains the queue without waiting. Returns how many events were seen.
    pub async fn process_pending(&mut self) -> usize {
        let mut handled = 0;
        while let Ok(event) = self.events.try_recv() {
            handled += 1;
            if let Err(e) = self.handle_event(event).await {
                warn!("event handling failed: {}", e);
            }
        }
        handled
    }

    /// Watchdog pass over the topology.
    pub async fn tick(&mut self, now: Instant) -> Result<()> {
        if self.lifecycle != Lifecycle::Active {
            return Ok(());
        }
        self.topology_mut()?.tick(now).await
    }

    /// Actor loop: applies commands, queued events and watchdog ticks until
    /// a `Leave` command arrives or the command channel closes.
    pub async fn run(&mut self, mut commands: mpsc::Receiver<SessionCommand>) {
        let mut ticker = self
            .ctx
            .config
            .reconnect
            .watchdog
            .as_ref()
            .map(|watchdog| tokio::time::interval(watchdog.tick_interval()));

        loop {
            let step = tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => Step::Command(command),
                    None => Step::Closed,
                },
                Some(event) = self.events.recv() => Step::Event(event),
                now = next_tick(&mut ticker) => Step::Tick(now),
                else => Step::Closed,
            };

            let result = match step {
                Step::Command(SessionCommand::ToggleTrack(kind)) => {
                    self.toggle_track(kind).await.map(|enabled| {
                        info!("{} {}", kind, if enabled { "on" } else { "off" });
                    })
                }
                Step::Command(SessionCommand::StartScreenShare(track)) => {
                    self.start_screen_share(track).await
                }
                Step::Command(SessionCommand::StopScreenShare) => self.stop_screen_share().await,
                Step::Command(SessionCommand::Leave(reply)) => {
                    self.leave().await;
                    if let Some(reply) = reply {
                        let _ = reply.send(());
                    }
                    return;
                }
                Step::Event(event) => self.handle_event(event).await,
                Step::Tick(now) => self.tick(now).await,
                Step::Closed => {
                    self.leave().await;
                    return;
                }
            };
            if let Err(e) = result {
                warn!("session step failed: {}", e);
                self.monitor.set_error(e.to_string());
            }
            if self.lifecycle == Lifecycle::Unattached {
                return;
            }
        }
    }

    /// Flips our microphone or camera and mirrors it in the roster.
    /// Unmuting clears a forced mute.
    pub async fn toggle_track(&mut self, kind: MediaKind) -> Result<bool> {
        self.require_lifecycle(Lifecycle::Active, "toggle a track")?;
        let enabling = !self
            .media()
            .map(|media| media.is_track_enabled(kind))
            .unwrap_or(false);
        if enabling {
            self.check_capability(kind)?;
        }

        let enabled = self
            .topology_mut()?
            .media_mut()
            .toggle_track(kind)
            .ok_or_else(|| Error::InvalidState(format!("no local {kind} track")))?;

        if let Some(me) = self.me.as_mut() {
            match kind {
                MediaKind::Audio => {
                    me.mic_on = enabled;
                    if enabled {
                        me.force_muted = false;
                    }
                }
                MediaKind::Video => me.camera_on = enabled,
            }
        }
        self.write_me().await;
        Ok(enabled)
    }

    pub async fn start_screen_share(&mut self, track: LocalTrack) -> Result<()> {
        self.require_lifecycle(Lifecycle::Active, "share the screen")?;
        if track.source() != TrackSource::Screen {
            return Err(Error::InvalidState(format!("{} is not a screen track", track.id())));
        }
        let (me, room) = (self.me_record()?, self.room_record()?);
        if !me.screen_share_allowed || (!me.is_admin() && !room.settings.allow_participant_screen) {
            return Err(Error::PermissionDenied("screen sharing is not allowed".into()));
        }

        self.topology_mut()?.publish(track).await?;
        if let Some(me) = self.me.as_mut() {
            me.screen_sharing = true;
        }
        self.write_me().await;
        Ok(())
    }

    pub async fn stop_screen_share(&mut self) -> Result<()> {
        self.require_lifecycle(Lifecycle::Active, "stop sharing")?;
        self.topology_mut()?.unpublish(TrackSource::Screen).await?;
        if let Some(me) = self.me.as_mut() {
            if !me.screen_sharing {
                return Ok(());
            }
            me.screen_sharing = false;
        }
        self.write_me().await;
        Ok(())
    }

    pub async fn update_settings(&mut self, settings: RoomSettings) -> Result<()> {
        self.require_admin()?;
        let mut room = self.room_record()?.clone();
        room.settings = settings;
        self.write_room(room).await
    }

    pub async fn set_active_view(&mut self, view: ActiveView) -> Result<()> {
        self.require_admin()?;
        let mut room = self.room_record()?.clone();
        room.active_view = view;
        self.write_room(room).await
    }

    /// Whiteboard and code blobs. Open to every participant.
    pub async fn update_shared_state(
        &mut self,
        key: impl Into<String>,
        value: Value,
    ) -> Result<()> {
        self.require_lifecycle(Lifecycle::Active, "update shared state")?;
        let mut room = self.room_record()?.clone();
        room.shared_state.insert(key.into(), value);
        self.write_room(room).await
    }

    /// Forces `id`'s microphone off until they unmute themselves.
    pub async fn mute_participant(&mut self, id: &ParticipantId) -> Result<()> {
        self.update_participant(id, |record| {
            record.mic_on = false;
            record.force_muted = true;
        })
        .await
    }

    pub async fn set_permissions(
        &mut self,
        id: &ParticipantId,
        update: PermissionUpdate,
    ) -> Result<()> {
        self.update_participant(id, |record| update.apply(record)).await
    }

    /// Marks `id` removed; their session leaves when it sees the change.
    pub async fn remove_participant(&mut self, id: &ParticipantId) -> Result<()> {
        if self.me.as_ref().map(|me| &me.id == id).unwrap_or(false) {
            return Err(Error::InvalidState("cannot remove yourself; leave instead".into()));
        }
        self.update_participant(id, |record| record.removed = true).await
    }

    async fn update_participant(
        &mut self,
        id: &ParticipantId,
        change: impl FnOnce(&mut ParticipantRecord),
    ) -> Result<()> {
        self.require_admin()?;
        let room_id = self.room_record()?.id.clone();
        let mut record = self
            .ctx
            .signaling
            .get_participant(&room_id, id)
            .await?
            .ok_or_else(|| Error::InvalidState(format!("{id} is not in room {room_id}")))?;
        change(&mut record);
        self.ctx.signaling.put_participant(&room_id, record).await
    }

    async fn write_room(&mut self, room: RoomRecord) -> Result<()> {
        self.ctx.signaling.update_room(room.clone()).await?;
        self.room = Some(room);
        Ok(())
    }

    /// Own-flag updates are best effort, like every other store write.
    async fn write_me(&self) {
        let (Some(room), Some(me)) = (&self.room, &self.me) else {
            return;
        };
        if let Err(e) = self.ctx.signaling.put_participant(&room.id, me.clone()).await {
            warn!("failed to publish own roster flags: {}", e);
            self.metrics.signaling_write_failures();
        }
    }

    fn check_capability(&self, kind: MediaKind) -> Result<()> {
        let (me, room) = (self.me_record()?, self.room_record()?);
        let allowed = match kind {
            MediaKind::Audio => {
                me.mic_allowed && (me.is_admin() || room.settings.allow_participant_mic)
            }
            MediaKind::Video => me.video_allowed,
        };
        if allowed {
            Ok(())
        } else {
            Err(Error::PermissionDenied(format!("{kind} is not allowed")))
        }
    }

    fn require_admin(&self) -> Result<()> {
        self.require_lifecycle(Lifecycle::Active, "moderate")?;
        if self.me_record()?.is_admin() {
            Ok(())
        } else {
            Err(Error::PermissionDenied("admin only".into()))
        }
    }

    fn require_lifecycle(&self, lifecycle: Lifecycle, action: &str) -> Result<()> {
        if self.lifecycle == lifecycle {
            Ok(())
        } else {
            Err(Error::InvalidState(format!(
                "cannot {action} while {}",
                self.lifecycle
            )))
        }
    }

    fn identity(&self) -> Result<(RoomId, ParticipantId)> {
        Ok((self.room_record()?.id.clone(), self.me_record()?.id.clone()))
    }

    fn me_record(&self) -> Result<&ParticipantRecord> {
        self.me
            .as_ref()
            .ok_or_else(|| Error::InvalidState("not in a meeting".into()))
    }

    fn room_record(&self) -> Result<&RoomRecord> {
        self.room
            .as_ref()
            .ok_or_else(|| Error::InvalidState("not in a meeting".into()))
    }

    fn topology_mut(&mut self) -> Result<&mut Box<dyn Topology>> {
        self.topology
            .as_mut()
            .ok_or_else(|| Error::InvalidState("no active topology".into()))
    }
}

async fn next_tick(ticker: &mut Option<Interval>) -> Instant {
    match ticker {
        Some(interval) => interval.tick().await,
        None => std::future::pending().await,
    }
}

fn mode_label(mode: TopologyMode) -> &'static str {
    match mode {
        TopologyMode::Mesh => "mesh",
        TopologyMode::Delegated => "delegated",
    }
}
