use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use tokio::sync::broadcast;
use webrtc::rtp::packet::Packet;

use crate::types::{MediaKind, ParticipantId, TrackSource};

const LOCAL_STREAM_ID: &str = "local";

struct LocalTrackInner {
    id: String,
    source: TrackSource,
    enabled: AtomicBool,
    stopped: AtomicBool,
    rtc: Arc<TrackLocalStaticSample>,
}

/// One captured local track. Clones share the same capture, so one track is
/// fanned out to every outgoing connection.
#[derive(Clone)]
pub struct LocalTrack {
    inner: Arc<LocalTrackInner>,
}

impl LocalTrack {
    pub fn new(source: TrackSource) -> Self {
        let id = format!("{}-{}", source_label(source), uuid::Uuid::new_v4());
        Self::with_id(id, source)
    }

    pub fn with_id(id: impl Into<String>, source: TrackSource) -> Self {
        let id = id.into();
        let mime_type = match source.kind() {
            MediaKind::Audio => MIME_TYPE_OPUS,
            MediaKind::Video => MIME_TYPE_VP8,
        };
        let rtc = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: mime_type.to_owned(),
                ..Default::default()
            },
            id.clone(),
            LOCAL_STREAM_ID.to_owned(),
        ));
        Self {
            inner: Arc::new(LocalTrackInner {
                id,
                source,
                enabled: AtomicBool::new(true),
                stopped: AtomicBool::new(false),
                rtc,
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn source(&self) -> TrackSource {
        self.inner.source
    }

    pub fn kind(&self) -> MediaKind {
        self.inner.source.kind()
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::SeqCst)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.inner.enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::SeqCst)
    }

    /// Ends the capture. A stopped track is also disabled.
    pub fn stop(&self) {
        self.inner.enabled.store(false, Ordering::SeqCst);
        self.inner.stopped.store(true, Ordering::SeqCst);
    }

    pub fn rtc_track(&self) -> Arc<TrackLocalStaticSample> {
        self.inner.rtc.clone()
    }

    pub fn same_track(&self, other: &LocalTrack) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for LocalTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalTrack")
            .field("id", &self.inner.id)
            .field("source", &self.inner.source)
            .field("enabled", &self.is_enabled())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

fn source_label(source: TrackSource) -> &'static str {
    match source {
        TrackSource::Microphone => "mic",
        TrackSource::Camera => "camera",
        TrackSource::Screen => "screen",
    }
}

/// Inbound track from one remote participant.
#[derive(Clone)]
pub struct RemoteTrack {
    pub id: String,
    pub kind: MediaKind,
    pub stream_id: String,
    packets: Option<broadcast::Sender<Packet>>,
}

impl RemoteTrack {
    pub fn new(id: impl Into<String>, kind: MediaKind, stream_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind,
            stream_id: stream_id.into(),
            packets: None,
        }
    }

    /// Track fed by a transport that forwards its RTP packets to `packets`.
    pub fn with_packets(
        id: impl Into<String>,
        kind: MediaKind,
        stream_id: impl Into<String>,
        packets: broadcast::Sender<Packet>,
    ) -> Self {
        Self {
            packets: Some(packets),
            ..Self::new(id, kind, stream_id)
        }
    }

    /// Receives the RTP packets of this track from now on. None when the
    /// transport carries no media.
    pub fn subscribe_rtp(&self) -> Option<broadcast::Receiver<Packet>> {
        self.packets.as_ref().map(broadcast::Sender::subscribe)
    }
}

impl fmt::Debug for RemoteTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteTrack")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("stream_id", &self.stream_id)
            .field("has_rtp", &self.packets.is_some())
            .finish()
    }
}

/// Everything currently received from one participant, merged into one
/// playable unit regardless of which track arrived first.
#[derive(Debug, Clone)]
pub struct RemoteMediaBundle {
    pub participant: ParticipantId,
    tracks: Vec<RemoteTrack>,
}

impl RemoteMediaBundle {
    pub fn new(participant: ParticipantId) -> Self {
        Self {
            participant,
            tracks: Vec::new(),
        }
    }

    /// Adds `track`, replacing a previous track with the same id.
    pub fn insert(&mut self, track: RemoteTrack) {
        match self.tracks.iter_mut().find(|t| t.id == track.id) {
            Some(existing) => *existing = track,
            None => self.tracks.push(track),
        }
    }

    pub fn remove(&mut self, track_id: &str) -> bool {
        let before = self.tracks.len();
        self.tracks.retain(|t| t.id != track_id);
        self.tracks.len() != before
    }

    pub fn tracks(&self) -> &[RemoteTrack] {
        &self.tracks
    }

    pub fn audio(&self) -> Option<&RemoteTrack> {
        self.tracks.iter().find(|t| t.kind == MediaKind::Audio)
    }

    pub fn video(&self) -> Option<&RemoteTrack> {
        self.tracks.iter().find(|t| t.kind == MediaKind::Video)
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_enabled_state() {
        let track = LocalTrack::new(TrackSource::Microphone);
        let fanned_out = track.clone();
        track.set_enabled(false);
        assert!(!fanned_out.is_enabled());
        assert!(track.same_track(&fanned_out));
        assert_eq!(fanned_out.kind(), MediaKind::Audio);
    }

    #[test]
    fn stop_disables() {
        let track = LocalTrack::new(TrackSource::Screen);
        track.stop();
        assert!(track.is_stopped());
        assert!(!track.is_enabled());
        assert_eq!(track.kind(), MediaKind::Video);
    }

    #[test]
    fn bundle_merges_by_track_id() {
        let mut bundle = RemoteMediaBundle::new("2".into());
        bundle.insert(RemoteTrack::new("v", MediaKind::Video, "s"));
        bundle.insert(RemoteTrack::new("a", MediaKind::Audio, "s"));
        bundle.insert(RemoteTrack::new("v", MediaKind::Video, "s2"));
        assert_eq!(bundle.tracks().len(), 2);
        assert_eq!(bundle.video().map(|t| t.stream_id.as_str()), Some("s2"));

        assert!(bundle.remove("a"));
        assert!(!bundle.remove("a"));
        assert!(!bundle.is_empty());
        assert!(bundle.remove("v"));
        assert!(bundle.is_empty());
    }

    #[test]
    fn rtp_reaches_every_subscriber() {
        let (packets, _) = broadcast::channel(4);
        let track = RemoteTrack::with_packets("v", MediaKind::Video, "s", packets.clone());
        let mut first = track.subscribe_rtp().unwrap();
        let mut second = track.clone().subscribe_rtp().unwrap();

        let mut packet = Packet::default();
        packet.header.sequence_number = 7;
        packets.send(packet).unwrap();

        assert_eq!(first.try_recv().unwrap().header.sequence_number, 7);
        assert_eq!(second.try_recv().unwrap().header.sequence_number, 7);
        assert!(RemoteTrack::new("a", MediaKind::Audio, "s").subscribe_rtp().is_none());
    }
}
