//! Local capture and remote media bookkeeping.
//!
//! `MediaTrackManager` is the only owner of local tracks and of the
//! per-participant remote bundles. Binding tracks to connections is done by
//! the negotiation engine, which asks the manager what to send.

mod capture;
mod track;

pub use capture::SystemMediaDevices;
pub use track::{LocalTrack, RemoteMediaBundle, RemoteTrack};

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::error::MediaError;
use crate::types::{MediaKind, ParticipantId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaConstraints {
    pub audio: bool,
    pub video: bool,
}

impl MediaConstraints {
    pub fn full() -> Self {
        Self {
            audio: true,
            video: true,
        }
    }

    pub fn audio_only() -> Self {
        Self {
            audio: true,
            video: false,
        }
    }
}

/// Capture backend.
#[async_trait]
pub trait MediaDevices: Send + Sync {
    async fn get_user_media(
        &self,
        constraints: &MediaConstraints,
    ) -> Result<Vec<LocalTrack>, MediaError>;
}

/// Tracks obtained by `acquire_local_media`. Either may be missing.
#[derive(Debug, Clone, Default)]
pub struct LocalMedia {
    pub audio: Option<LocalTrack>,
    pub video: Option<LocalTrack>,
}

impl LocalMedia {
    pub fn is_empty(&self) -> bool {
        self.audio.is_none() && self.video.is_none()
    }

    pub fn track(&self, kind: MediaKind) -> Option<&LocalTrack> {
        match kind {
            MediaKind::Audio => self.audio.as_ref(),
            MediaKind::Video => self.video.as_ref(),
        }
    }

    fn from_tracks(tracks: Vec<LocalTrack>) -> Self {
        let mut media = LocalMedia::default();
        for track in tracks {
            match track.kind() {
                MediaKind::Audio if media.audio.is_none() => media.audio = Some(track),
                MediaKind::Video if media.video.is_none() => media.video = Some(track),
                _ => track.stop(),
            }
        }
        media
    }
}

pub type RemoteBundles = BTreeMap<ParticipantId, RemoteMediaBundle>;

pub struct MediaTrackManager {
    devices: Arc<dyn MediaDevices>,
    start_muted: bool,
    local: LocalMedia,
    screen: Option<LocalTrack>,
    bundles: RemoteBundles,
    bundles_tx: watch::Sender<RemoteBundles>,
}

impl MediaTrackManager {
    pub fn new(devices: Arc<dyn MediaDevices>, start_muted: bool) -> Self {
        let (bundles_tx, _) = watch::channel(RemoteBundles::new());
        Self {
            devices,
            start_muted,
            local: LocalMedia::default(),
            screen: None,
            bundles: RemoteBundles::new(),
            bundles_tx,
        }
    }

    /// Opens local capture, stepping down from the requested constraints to
    /// audio-only and finally to nothing. Never fails: a participant without
    /// devices still joins and receives.
    pub async fn acquire_local_media(&mut self, constraints: MediaConstraints) -> LocalMedia {
        let mut attempts = vec![constraints];
        if constraints.video && constraints.audio {
            attempts.push(MediaConstraints::audio_only());
        }

        let mut media = LocalMedia::default();
        for attempt in attempts {
            match self.devices.get_user_media(&attempt).await {
                Ok(tracks) => {
                    media = LocalMedia::from_tracks(tracks);
                    break;
                }
                Err(e) => warn!("media capture failed for {:?}: {}", attempt, e),
            }
        }

        if media.is_empty() {
            info!("continuing without local media");
        }
        for track in media.audio.iter().chain(media.video.iter()) {
            track.set_enabled(!self.start_muted);
        }

        self.release_local();
        self.local = media.clone();
        media
    }

    pub fn local_media(&self) -> &LocalMedia {
        &self.local
    }

    /// Track currently sent for `kind`. A screen share takes over video.
    pub fn outgoing(&self, kind: MediaKind) -> Option<LocalTrack> {
        match kind {
            MediaKind::Audio => self.local.audio.clone(),
            MediaKind::Video => self.screen.clone().or_else(|| self.local.video.clone()),
        }
    }

    /// Flips the enabled flag of the capture track of `kind` and returns the
    /// new value, or `None` when there is no such track.
    pub fn toggle_track(&mut self, kind: MediaKind) -> Option<bool> {
        let track = self.local.track(kind)?;
        let enabled = !track.is_enabled();
        track.set_enabled(enabled);
        debug!("{} track {} enabled={}", kind, track.id(), enabled);
        Some(enabled)
    }

    pub fn set_track_enabled(&mut self, kind: MediaKind, enabled: bool) -> Option<bool> {
        let track = self.local.track(kind)?;
        track.set_enabled(enabled);
        Some(enabled)
    }

    pub fn is_track_enabled(&self, kind: MediaKind) -> bool {
        self.local
            .track(kind)
            .map(LocalTrack::is_enabled)
            .unwrap_or(false)
    }

    /// Swaps the microphone or camera track. The old capture is stopped.
    pub fn set_local_track(&mut self, track: LocalTrack) {
        let slot = match track.kind() {
            MediaKind::Audio => &mut self.local.audio,
            MediaKind::Video => &mut self.local.video,
        };
        if let Some(previous) = slot.replace(track) {
            previous.stop();
        }
    }

    pub fn is_screen_sharing(&self) -> bool {
        self.screen.is_some()
    }

    /// Makes `track` the outgoing video. Returns the screen track it
    /// displaced, if one was already being shared.
    pub fn set_screen(&mut self, track: LocalTrack) -> Option<LocalTrack> {
        self.screen.replace(track)
    }

    /// Ends the screen share and returns the camera track to restore, if any.
    pub fn clear_screen(&mut self) -> Option<LocalTrack> {
        if let Some(screen) = self.screen.take() {
            screen.stop();
        }
        self.local.video.clone()
    }

    pub fn ingest_remote_track(&mut self, participant: &ParticipantId, track: RemoteTrack) {
        debug!("{} track {} from {}", track.kind, track.id, participant);
        self.bundles
            .entry(participant.clone())
            .or_insert_with(|| RemoteMediaBundle::new(participant.clone()))
            .insert(track);
        self.publish();
    }

    /// Drops one track; the bundle goes away with its last track.
    pub fn remove_remote_track(&mut self, participant: &ParticipantId, track_id: &str) {
        let Some(bundle) = self.bundles.get_mut(participant) else {
            return;
        };
        if !bundle.remove(track_id) {
            return;
        }
        if bundle.is_empty() {
            self.bundles.remove(participant);
        }
        self.publish();
    }

    pub fn drop_bundle(&mut self, participant: &ParticipantId) -> bool {
        let removed = self.bundles.remove(participant).is_some();
        if removed {
            debug!("dropped media bundle for {}", participant);
            self.publish();
        }
        removed
    }

    pub fn bundle(&self, participant: &ParticipantId) -> Option<&RemoteMediaBundle> {
        self.bundles.get(participant)
    }

    pub fn bundles(&self) -> &RemoteBundles {
        &self.bundles
    }

    /// Live view of the remote bundles for the presentation layer.
    pub fn subscribe_bundles(&self) -> watch::Receiver<RemoteBundles> {
        self.bundles_tx.subscribe()
    }

    /// Stops every local track and forgets every remote bundle.
    pub fn stop_all(&mut self) {
        self.release_local();
        if let Some(screen) = self.screen.take() {
            screen.stop();
        }
        if !self.bundles.is_empty() {
            self.bundles.clear();
            self.publish();
        }
    }

    fn release_local(&mut self) {
        let local = std::mem::take(&mut self.local);
        for track in local.audio.iter().chain(local.video.iter()) {
            track.stop();
        }
    }

    fn publish(&self) {
        self.bundles_tx.send_replace(self.bundles.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockMediaDevices;

    fn manager(devices: MockMediaDevices) -> MediaTrackManager {
        MediaTrackManager::new(Arc::new(devices), true)
    }

    #[tokio::test]
    async fn full_capture_starts_disabled() {
        let mut media = manager(MockMediaDevices::new());
        let local = media.acquire_local_media(MediaConstraints::full()).await;
        let audio = local.audio.unwrap();
        let video = local.video.unwrap();
        assert!(!audio.is_enabled());
        assert!(!video.is_enabled());
    }

    #[tokio::test]
    async fn camera_failure_degrades_to_audio_only() {
        let devices = MockMediaDevices::new().without_video();
        let mut media = manager(devices.clone());
        let local = media.acquire_local_media(MediaConstraints::full()).await;
        assert!(local.audio.is_some());
        assert!(local.video.is_none());
        assert_eq!(devices.requests().len(), 2);
    }

    #[tokio::test]
    async fn total_failure_yields_no_media() {
        let mut media = manager(MockMediaDevices::new().without_audio().without_video());
        let local = media.acquire_local_media(MediaConstraints::full()).await;
        assert!(local.is_empty());
        assert!(media.outgoing(MediaKind::Audio).is_none());
        assert_eq!(media.toggle_track(MediaKind::Audio), None);
    }

    #[tokio::test]
    async fn toggle_flips_enabled() {
        let mut media = manager(MockMediaDevices::new());
        media.acquire_local_media(MediaConstraints::full()).await;
        assert_eq!(media.toggle_track(MediaKind::Audio), Some(true));
        assert!(media.is_track_enabled(MediaKind::Audio));
        assert_eq!(media.toggle_track(MediaKind::Audio), Some(false));
        assert!(!media.is_track_enabled(MediaKind::Video));
    }

    #[tokio::test]
    async fn screen_overrides_camera_until_cleared() {
        let mut media = manager(MockMediaDevices::new());
        let local = media.acquire_local_media(MediaConstraints::full()).await;
        let camera = local.video.unwrap();
        let screen = LocalTrack::new(crate::types::TrackSource::Screen);

        assert!(media.set_screen(screen.clone()).is_none());
        assert!(media.outgoing(MediaKind::Video).unwrap().same_track(&screen));

        let restored = media.clear_screen().unwrap();
        assert!(restored.same_track(&camera));
        assert!(screen.is_stopped());
        assert!(!media.is_screen_sharing());
    }

    #[test]
    fn bundle_removed_only_with_last_track() {
        let mut media = manager(MockMediaDevices::new());
        let peer = ParticipantId::from("2");
        let watcher = media.subscribe_bundles();

        media.ingest_remote_track(&peer, RemoteTrack::new("v", MediaKind::Video, "s"));
        media.ingest_remote_track(&peer, RemoteTrack::new("a", MediaKind::Audio, "s"));
        assert_eq!(media.bundle(&peer).unwrap().tracks().len(), 2);

        media.remove_remote_track(&peer, "v");
        assert!(media.bundle(&peer).is_some());
        media.remove_remote_track(&peer, "a");
        assert!(media.bundle(&peer).is_none());
        assert!(watcher.borrow().is_empty());
    }

    #[tokio::test]
    async fn stop_all_releases_everything() {
        let mut media = manager(MockMediaDevices::new());
        let local = media.acquire_local_media(MediaConstraints::full()).await;
        media.ingest_remote_track(&"2".into(), RemoteTrack::new("a", MediaKind::Audio, "s"));

        media.stop_all();
        assert!(local.audio.unwrap().is_stopped());
        assert!(local.video.unwrap().is_stopped());
        assert!(media.bundles().is_empty());
        assert!(media.local_media().is_empty());
    }
}
