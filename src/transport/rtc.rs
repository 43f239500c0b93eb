use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp::packet::Packet;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::{RTCRtpTransceiver, RTCRtpTransceiverInit};
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use super::{
    PeerConnection, PeerConnector, ReplaceOutcome, TransportEventKind, TransportEventSink,
    TransportState,
};
use crate::error::{Error, Result};
use crate::media::{LocalTrack, RemoteTrack};
use crate::types::{IceCandidate, MediaKind, ParticipantId, SdpType, SessionDescription};

/// Packets buffered per remote track for slow subscribers.
const RTP_BUFFER: usize = 256;

/// Opens webrtc-rs peer connections sharing one configured API instance.
pub struct RtcConnector {
    api: API,
    config: RTCConfiguration,
}

impl RtcConnector {
    pub fn new(ice_servers: &[String]) -> Result<Self> {
        // Create a MediaEngine object to configure the supported codecs
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: vec![RTCIceServer {
                urls: ice_servers.to_vec(),
                ..Default::default()
            }],
            ..Default::default()
        };

        Ok(Self { api, config })
    }
}

#[async_trait]
impl PeerConnector for RtcConnector {
    async fn connect(
        &self,
        local: &ParticipantId,
        remote: &ParticipantId,
        events: TransportEventSink,
    ) -> Result<Arc<dyn PeerConnection>> {
        let peer_connection = Arc::new(self.api.new_peer_connection(self.config.clone()).await?);
        debug!("{} opened peer connection to {}", local, remote);
        let connection = RtcConnection::wire(peer_connection, events);
        Ok(Arc::new(connection))
    }
}

pub struct RtcConnection {
    peer_connection: Arc<RTCPeerConnection>,
    senders: Mutex<HashMap<MediaKind, Arc<RTCRtpSender>>>,
}

impl RtcConnection {
    fn wire(peer_connection: Arc<RTCPeerConnection>, events: TransportEventSink) -> Self {
        let sink = events.clone();
        peer_connection.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let sink = sink.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => {
                        sink.emit(TransportEventKind::LocalCandidate(IceCandidate {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_mline_index: init.sdp_mline_index,
                        }));
                    }
                    Err(e) => warn!("failed to serialize local candidate: {}", e),
                }
            })
        }));

        let sink = events.clone();
        peer_connection.on_track(Box::new(
            move |track: Arc<TrackRemote>,
                  _receiver: Arc<RTCRtpReceiver>,
                  _transceiver: Arc<RTCRtpTransceiver>| {
                let sink = sink.clone();
                Box::pin(async move {
                    let kind = match track.kind() {
                        RTPCodecType::Audio => MediaKind::Audio,
                        RTPCodecType::Video => MediaKind::Video,
                        _ => return,
                    };
                    info!("remote {} track {} from {}", kind, track.id(), sink.peer());
                    let (packets, _) = broadcast::channel(RTP_BUFFER);
                    let remote = RemoteTrack::with_packets(
                        track.id(),
                        kind,
                        track.stream_id(),
                        packets.clone(),
                    );
                    sink.emit(TransportEventKind::RemoteTrack(remote));
                    tokio::spawn(forward_rtp(track, packets, sink));
                })
            },
        ));

        let sink = events.clone();
        peer_connection.on_peer_connection_state_change(Box::new(
            move |s: RTCPeerConnectionState| {
                let sink = sink.clone();
                Box::pin(async move {
                    debug!("peer connection with {} is {}", sink.peer(), s);
                    let state = match s {
                        RTCPeerConnectionState::Connecting => TransportState::Connecting,
                        RTCPeerConnectionState::Connected => TransportState::Connected,
                        RTCPeerConnectionState::Disconnected => TransportState::Disconnected,
                        RTCPeerConnectionState::Failed => TransportState::Failed,
                        RTCPeerConnectionState::Closed => TransportState::Closed,
                        _ => TransportState::New,
                    };
                    sink.emit(TransportEventKind::StateChanged(state));
                })
            },
        ));

        let peer = events.peer().clone();
        peer_connection.on_ice_connection_state_change(Box::new(
            move |s: RTCIceConnectionState| {
                debug!("ICE connection with {} is {}", peer, s);
                Box::pin(async {})
            },
        ));

        Self {
            peer_connection,
            senders: Mutex::new(HashMap::new()),
        }
    }

    async fn attach(&self, kind: MediaKind, track: &LocalTrack) -> Result<()> {
        let sender = self
            .peer_connection
            .add_track(track.rtc_track() as Arc<dyn TrackLocal + Send + Sync>)
            .await?;

        // RTCP has to be drained for interceptors (NACK, reports) to work.
        let rtcp_sender = sender.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; 1500];
            while rtcp_sender.read(&mut buf).await.is_ok() {}
        });

        self.senders.lock().await.insert(kind, sender);
        Ok(())
    }
}

/// Reads RTP until the track ends, then reports the track gone.
async fn forward_rtp(
    track: Arc<TrackRemote>,
    packets: broadcast::Sender<Packet>,
    sink: TransportEventSink,
) {
    let track_id = track.id();
    while let Ok((packet, _)) = track.read_rtp().await {
        // No subscribers is fine; the packet is dropped.
        let _ = packets.send(packet);
    }
    debug!("remote track {} from {} ended", track_id, sink.peer());
    sink.emit(TransportEventKind::RemoteTrackEnded { track_id });
}

fn to_rtc(description: SessionDescription) -> Result<RTCSessionDescription> {
    let description = match description.sdp_type {
        SdpType::Offer => RTCSessionDescription::offer(description.sdp)?,
        SdpType::Answer => RTCSessionDescription::answer(description.sdp)?,
    };
    Ok(description)
}

fn from_rtc(description: RTCSessionDescription) -> Result<SessionDescription> {
    match description.sdp_type {
        RTCSdpType::Offer => Ok(SessionDescription::offer(description.sdp)),
        RTCSdpType::Answer => Ok(SessionDescription::answer(description.sdp)),
        other => Err(Error::Transport(format!(
            "unexpected description type {}",
            other
        ))),
    }
}

fn codec_type(kind: MediaKind) -> RTPCodecType {
    match kind {
        MediaKind::Audio => RTPCodecType::Audio,
        MediaKind::Video => RTPCodecType::Video,
    }
}

#[async_trait]
impl PeerConnection for RtcConnection {
    async fn add_track(&self, track: &LocalTrack) -> Result<()> {
        self.attach(track.kind(), track).await
    }

    async fn add_receive_only(&self, kind: MediaKind) -> Result<()> {
        let init = RTCRtpTransceiverInit {
            direction: RTCRtpTransceiverDirection::Recvonly,
            send_encodings: vec![],
        };
        self.peer_connection
            .add_transceiver_from_kind(codec_type(kind), Some(init))
            .await?;
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription> {
        let offer = self.peer_connection.create_offer(None).await?;
        from_rtc(offer)
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let answer = self.peer_connection.create_answer(None).await?;
        from_rtc(answer)
    }

    async fn set_local_description(&self, description: SessionDescription) -> Result<()> {
        self.peer_connection
            .set_local_description(to_rtc(description)?)
            .await?;
        Ok(())
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()> {
        self.peer_connection
            .set_remote_description(to_rtc(description)?)
            .await?;
        Ok(())
    }

    async fn rollback(&self) -> Result<()> {
        let mut rollback = RTCSessionDescription::default();
        rollback.sdp_type = RTCSdpType::Rollback;
        self.peer_connection.set_local_description(rollback).await?;
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: None,
        };
        self.peer_connection.add_ice_candidate(init).await?;
        Ok(())
    }

    async fn replace_track(&self, kind: MediaKind, track: &LocalTrack) -> Result<ReplaceOutcome> {
        let existing = self.senders.lock().await.get(&kind).cloned();
        match existing {
            Some(sender) => {
                sender
                    .replace_track(Some(track.rtc_track() as Arc<dyn TrackLocal + Send + Sync>))
                    .await?;
                Ok(ReplaceOutcome::Replaced)
            }
            None => {
                self.attach(kind, track).await?;
                Ok(ReplaceOutcome::NeedsRenegotiation)
            }
        }
    }

    async fn close(&self) -> Result<()> {
        self.senders.lock().await.clear();
        self.peer_connection.close().await?;
        Ok(())
    }
}
