use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use webrtc_meeting::mock::{MockMediaDevices, MockNetwork, MockRouter};
use webrtc_meeting::room::ActiveView;
use webrtc_meeting::topology::RouterEvent;
use webrtc_meeting::{
    ClientConfig, Error, Lifecycle, LinkRole, LocalTrack, MediaKind, MeetingSession,
    MemorySignaling, NegotiationState, ParticipantId, PermissionUpdate, ReconnectPolicy,
    RemoteTrack, SessionContext, SignalingChannel, TopologyMode, TrackSource, WatchdogConfig,
};

struct Harness {
    signaling: MemorySignaling,
    network: MockNetwork,
    router: MockRouter,
}

impl Harness {
    fn new() -> Self {
        Self {
            signaling: MemorySignaling::new(),
            network: MockNetwork::new(),
            router: MockRouter::new(),
        }
    }

    fn session(&self) -> MeetingSession {
        self.session_with(ClientConfig::default(), MockMediaDevices::new())
    }

    fn session_with(&self, config: ClientConfig, devices: MockMediaDevices) -> MeetingSession {
        MeetingSession::new(SessionContext {
            config,
            signaling: Arc::new(self.signaling.clone()),
            connector: Arc::new(self.network.connector()),
            devices: Arc::new(devices),
            router: Some(Arc::new(self.router.clone())),
        })
    }
}

async fn join(session: &mut MeetingSession, room_id: &str, id: &str) {
    session
        .join_meeting(room_id, id.into(), &format!("user {id}"))
        .await
        .unwrap();
    session.start().await.unwrap();
}

/// Drains every session until none of them has anything left to do.
async fn settle(sessions: &mut [&mut MeetingSession]) {
    for _ in 0..100 {
        let mut handled = 0;
        for session in sessions.iter_mut() {
            handled += session.process_pending().await;
        }
        if handled == 0 {
            return;
        }
    }
    panic!("sessions did not settle");
}

fn pid(id: &str) -> ParticipantId {
    ParticipantId::from(id)
}

fn state(session: &MeetingSession, peer: &str) -> Option<NegotiationState> {
    session.link_status(&pid(peer)).map(|status| status.state)
}

#[tokio::test]
async fn three_participants_form_a_full_mesh() {
    let h = Harness::new();
    let mut a = h.session();
    let mut b = h.session();
    let mut c = h.session();

    let room_id = a
        .create_meeting(pid("1"), "Ada", TopologyMode::Mesh)
        .await
        .unwrap();
    a.start().await.unwrap();
    join(&mut b, &room_id, "2").await;
    join(&mut c, &room_id, "3").await;
    settle(&mut [&mut a, &mut b, &mut c]).await;

    for (session, peers) in [(&a, ["2", "3"]), (&b, ["1", "3"]), (&c, ["1", "2"])] {
        for peer in peers {
            assert_eq!(state(session, peer), Some(NegotiationState::Connected));
            let bundle = session.media().unwrap().bundle(&pid(peer)).unwrap();
            assert!(bundle.audio().is_some() && bundle.video().is_some());
        }
    }

    // Exactly one connection per side per pair, opened by the lesser id.
    for (low, high) in [("1", "2"), ("1", "3"), ("2", "3")] {
        assert_eq!(h.network.connection_count(&pid(low), &pid(high)), 1);
        assert_eq!(h.network.connection_count(&pid(high), &pid(low)), 1);
    }
    assert_eq!(a.link_status(&pid("2")).unwrap().role, LinkRole::Initiator);
    assert_eq!(b.link_status(&pid("1")).unwrap().role, LinkRole::Answerer);
    assert_eq!(c.link_status(&pid("2")).unwrap().role, LinkRole::Answerer);
}

#[tokio::test]
async fn removing_a_participant_keeps_other_links() {
    let h = Harness::new();
    let mut a = h.session();
    let mut b = h.session();
    let mut c = h.session();

    let room_id = a
        .create_meeting(pid("1"), "Ada", TopologyMode::Mesh)
        .await
        .unwrap();
    a.start().await.unwrap();
    join(&mut b, &room_id, "2").await;
    join(&mut c, &room_id, "3").await;
    settle(&mut [&mut a, &mut b, &mut c]).await;

    b.leave().await;
    settle(&mut [&mut a, &mut b, &mut c]).await;

    assert_eq!(b.lifecycle(), Lifecycle::Unattached);
    assert!(a.media().unwrap().bundle(&pid("2")).is_none());
    assert!(c.media().unwrap().bundle(&pid("2")).is_none());
    assert!(a.link_status(&pid("2")).is_none());
    assert!(c.link_status(&pid("2")).is_none());
    assert_eq!(state(&a, "3"), Some(NegotiationState::Connected));
    assert_eq!(state(&c, "1"), Some(NegotiationState::Connected));
    assert!(!a.participants().contains_key(&pid("2")));
}

#[tokio::test]
async fn screen_share_replaces_in_place() {
    let h = Harness::new();
    let mut a = h.session();
    let mut b = h.session();
    let mut c = h.session();

    let room_id = a
        .create_meeting(pid("1"), "Ada", TopologyMode::Mesh)
        .await
        .unwrap();
    a.start().await.unwrap();
    join(&mut b, &room_id, "2").await;
    join(&mut c, &room_id, "3").await;
    settle(&mut [&mut a, &mut b, &mut c]).await;

    let screen = LocalTrack::new(TrackSource::Screen);
    a.start_screen_share(screen.clone()).await.unwrap();
    settle(&mut [&mut a, &mut b, &mut c]).await;

    for peer in ["2", "3"] {
        let conn = h.network.connection_between(&pid("1"), &pid(peer)).unwrap();
        assert!(conn.sender_track(MediaKind::Video).unwrap().same_track(&screen));
        assert_eq!(conn.offers_created(), 1);
        assert_eq!(state(&a, peer), Some(NegotiationState::Connected));
    }
    assert_eq!(state(&b, "1"), Some(NegotiationState::Connected));
    assert!(a.me().unwrap().screen_sharing);
    assert!(b.participants()[&pid("1")].screen_sharing);

    a.stop_screen_share().await.unwrap();
    assert!(screen.is_stopped());
    let camera = a.media().unwrap().local_media().video.clone().unwrap();
    let conn = h.network.connection_between(&pid("1"), &pid("2")).unwrap();
    assert!(conn.sender_track(MediaKind::Video).unwrap().same_track(&camera));
    assert!(!a.me().unwrap().screen_sharing);
}

#[tokio::test]
async fn participants_without_devices_still_receive() {
    let h = Harness::new();
    let mut a = h.session();
    let mut b = h.session_with(ClientConfig::default(), MockMediaDevices::new().without_video());
    let mut c = h.session_with(
        ClientConfig::default(),
        MockMediaDevices::new().without_audio().without_video(),
    );

    let room_id = a
        .create_meeting(pid("1"), "Ada", TopologyMode::Mesh)
        .await
        .unwrap();
    a.start().await.unwrap();
    join(&mut b, &room_id, "2").await;
    join(&mut c, &room_id, "3").await;
    settle(&mut [&mut a, &mut b, &mut c]).await;

    assert_eq!(c.lifecycle(), Lifecycle::Active);
    assert!(c.media().unwrap().local_media().is_empty());
    assert_eq!(state(&a, "3"), Some(NegotiationState::Connected));
    assert_eq!(state(&c, "2"), Some(NegotiationState::Connected));

    let from_b = a.media().unwrap().bundle(&pid("2")).unwrap();
    assert!(from_b.audio().is_some());
    assert!(from_b.video().is_none());
    assert!(a.media().unwrap().bundle(&pid("3")).is_none());
    assert_eq!(c.media().unwrap().bundle(&pid("1")).unwrap().tracks().len(), 2);
}

#[tokio::test]
async fn leaving_mid_negotiation_is_clean() {
    let h = Harness::new();
    let mut a = h.session();
    let mut b = h.session();

    let room_id = a
        .create_meeting(pid("1"), "Ada", TopologyMode::Mesh)
        .await
        .unwrap();
    a.start().await.unwrap();
    join(&mut b, &room_id, "2").await;

    // The offer goes out, then the initiator leaves before any answer.
    a.process_pending().await;
    assert_eq!(state(&a, "2"), Some(NegotiationState::OfferSent));
    a.leave().await;
    a.leave().await;

    assert_eq!(a.lifecycle(), Lifecycle::Unattached);
    assert!(h.network.connection_between(&pid("1"), &pid("2")).unwrap().is_closed());
    assert!(h
        .signaling
        .get_call(&room_id, &pid("1"), &pid("2"))
        .await
        .unwrap()
        .is_none());

    settle(&mut [&mut a, &mut b]).await;
    assert!(b.link_status(&pid("1")).is_none());
    assert!(b.media().unwrap().bundles().is_empty());
    assert!(a.link_status(&pid("2")).is_none());
}

#[tokio::test]
async fn watchdog_recovers_from_lost_offer() {
    let h = Harness::new();
    let config = ClientConfig {
        reconnect: ReconnectPolicy {
            reinitiate_on_failure: true,
            watchdog: Some(WatchdogConfig {
                connect_timeout: Duration::from_secs(10),
                ..WatchdogConfig::default()
            }),
        },
        ..ClientConfig::default()
    };
    let mut a = h.session_with(config, MockMediaDevices::new());
    let mut b = h.session();

    let room_id = a
        .create_meeting(pid("1"), "Ada", TopologyMode::Mesh)
        .await
        .unwrap();
    a.start().await.unwrap();
    join(&mut b, &room_id, "2").await;

    h.signaling.fail_next_writes(1);
    settle(&mut [&mut a, &mut b]).await;
    assert_eq!(a.metrics().snapshot().signaling_write_failures, 1);
    assert_eq!(state(&a, "2"), Some(NegotiationState::OfferSent));
    assert!(b.link_status(&pid("1")).is_none());

    a
        .tick(Instant::now() + Duration::from_secs(11))
        .await
        .unwrap();
    settle(&mut [&mut a, &mut b]).await;
    assert_eq!(state(&a, "2"), Some(NegotiationState::Connected));
    assert_eq!(state(&b, "1"), Some(NegotiationState::Connected));
    assert_eq!(h.network.connection_count(&pid("1"), &pid("2")), 2);
}

#[tokio::test]
async fn moderation_reaches_the_target_session() {
    let h = Harness::new();
    let mut a = h.session();
    let mut b = h.session();

    let room_id = a
        .create_meeting(pid("1"), "Ada", TopologyMode::Mesh)
        .await
        .unwrap();
    a.start().await.unwrap();
    join(&mut b, &room_id, "2").await;
    settle(&mut [&mut a, &mut b]).await;

    assert!(matches!(
        b.mute_participant(&pid("1")).await,
        Err(Error::PermissionDenied(_))
    ));
    assert!(matches!(
        b.set_active_view(ActiveView::Whiteboard).await,
        Err(Error::PermissionDenied(_))
    ));
    b.update_shared_state("whiteboard", serde_json::json!({"strokes": 3}))
        .await
        .unwrap();

    assert!(b.toggle_track(MediaKind::Audio).await.unwrap());
    settle(&mut [&mut a, &mut b]).await;
    assert!(a.participants()[&pid("2")].mic_on);

    a.mute_participant(&pid("2")).await.unwrap();
    settle(&mut [&mut a, &mut b]).await;
    assert!(!b.media().unwrap().is_track_enabled(MediaKind::Audio));
    assert!(b.me().unwrap().force_muted);

    b
        .start_screen_share(LocalTrack::new(TrackSource::Screen))
        .await
        .unwrap();
    a.set_permissions(&pid("2"), PermissionUpdate::ScreenShare(false))
        .await
        .unwrap();
    settle(&mut [&mut a, &mut b]).await;
    assert!(!b.media().unwrap().is_screen_sharing());
    assert!(matches!(
        b.start_screen_share(LocalTrack::new(TrackSource::Screen)).await,
        Err(Error::PermissionDenied(_))
    ));

    a.set_active_view(ActiveView::Code).await.unwrap();
    settle(&mut [&mut a, &mut b]).await;
    let room = b.room().unwrap();
    assert_eq!(room.active_view, ActiveView::Code);
    assert_eq!(room.shared_state["whiteboard"]["strokes"], 3);

    assert!(matches!(
        a.remove_participant(&pid("1")).await,
        Err(Error::InvalidState(_))
    ));
    a.remove_participant(&pid("2")).await.unwrap();
    settle(&mut [&mut a, &mut b]).await;
    assert_eq!(b.lifecycle(), Lifecycle::Unattached);
    assert!(a.link_status(&pid("2")).is_none());
    assert!(h
        .signaling
        .get_participant(&room_id, &pid("2"))
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn delegated_room_uses_the_router() {
    let h = Harness::new();
    let mut a = h.session();

    let _room_id = a
        .create_meeting(pid("1"), "Ada", TopologyMode::Delegated)
        .await
        .unwrap();
    a.start().await.unwrap();
    assert_eq!(a.mode(), Some(TopologyMode::Delegated));
    assert!(h.router.is_connected());
    assert_eq!(h.router.published().len(), 2);

    h.router.deliver(RouterEvent::TrackSubscribed {
        participant: pid("2"),
        track: RemoteTrack::new("v2", MediaKind::Video, "2"),
    });
    a.process_pending().await;
    assert!(a.media().unwrap().bundle(&pid("2")).is_some());
    assert!(a.link_status(&pid("2")).is_none());

    h.router.deliver(RouterEvent::ParticipantDisconnected(pid("2")));
    a.process_pending().await;
    assert!(a.media().unwrap().bundle(&pid("2")).is_none());

    a.leave().await;
    assert!(!h.router.is_connected());
    assert_eq!(h.network.connection_count(&pid("1"), &pid("2")), 0);
}
