// End-to-end flows through RoomServer against real mediasoup workers.

use super::*;
use crate::media::{MediaConfig, WorkerConfig};
use crate::metrics::ServerMetrics;
use crate::signaling::protocol::{Direction, ErrorCode, ExistingProducer, ServerEvent};
use mediasoup::prelude::*;
use std::num::{NonZeroU32, NonZeroU8};
use std::sync::Arc;
use tokio::sync::mpsc;

async fn test_server() -> Arc<RoomServer> {
    let config = MediaConfig {
        worker: WorkerConfig {
            num_workers: 1,
            ..WorkerConfig::default()
        },
        ..MediaConfig::default()
    };
    Arc::new(RoomServer::new(config, ServerMetrics::new()).await.unwrap())
}

struct TestPeer {
    id: String,
    rx: mpsc::Receiver<Arc<String>>,
}

fn connect_peer(server: &RoomServer, id: &str) -> TestPeer {
    let (tx, rx) = mpsc::channel(64);
    server.register_peer(id, tx);
    TestPeer {
        id: id.to_string(),
        rx,
    }
}

impl TestPeer {
    /// Next event already enqueued on this peer's outbox. All server sends
    /// are synchronous try_sends, so anything an awaited op emitted is here.
    fn next_event(&mut self) -> ServerEvent {
        let json = self.rx.try_recv().expect("expected a pending event");
        serde_json::from_str(&json).expect("server events must deserialize")
    }

    fn drain(&mut self) -> Vec<ServerEvent> {
        let mut events = Vec::new();
        while let Ok(json) = self.rx.try_recv() {
            events.push(serde_json::from_str(&json).expect("server events must deserialize"));
        }
        events
    }
}

fn client_dtls_parameters() -> DtlsParameters {
    DtlsParameters {
        role: DtlsRole::Client,
        fingerprints: vec![DtlsFingerprint::Sha256 {
            value: [
                0x82, 0x5A, 0x68, 0x3D, 0x36, 0xC3, 0x0A, 0xDE, 0xAF, 0xE7, 0x32, 0x43, 0xD2,
                0x88, 0x83, 0x57, 0xAC, 0x2D, 0x65, 0xE5, 0x80, 0xC4, 0xB6, 0xFB, 0xAF, 0x1A,
                0xA0, 0x21, 0x9F, 0x6D, 0x0C, 0xAD,
            ],
        }],
    }
}

fn audio_rtp_parameters(ssrc: u32) -> RtpParameters {
    RtpParameters {
        mid: Some("AUDIO".to_string()),
        codecs: vec![RtpCodecParameters::Audio {
            mime_type: MimeTypeAudio::Opus,
            payload_type: 111,
            clock_rate: NonZeroU32::new(48000).unwrap(),
            channels: NonZeroU8::new(2).unwrap(),
            parameters: RtpCodecParametersParameters::from([("useinbandfec", 1_u32.into())]),
            rtcp_feedback: vec![],
        }],
        header_extensions: vec![],
        encodings: vec![RtpEncodingParameters {
            ssrc: Some(ssrc),
            ..RtpEncodingParameters::default()
        }],
        rtcp: RtcpParameters::default(),
    }
}

fn audio_consumer_capabilities() -> RtpCapabilities {
    RtpCapabilities {
        codecs: vec![RtpCodecCapability::Audio {
            mime_type: MimeTypeAudio::Opus,
            preferred_payload_type: Some(100),
            clock_rate: NonZeroU32::new(48000).unwrap(),
            channels: NonZeroU8::new(2).unwrap(),
            parameters: RtpCodecParametersParameters::default(),
            rtcp_feedback: vec![],
        }],
        header_extensions: vec![],
    }
}

async fn create_and_connect(
    server: &RoomServer,
    peer: &TestPeer,
    room_id: &str,
    direction: Direction,
) -> TransportId {
    let event = server
        .create_transport(&peer.id, room_id, direction)
        .await
        .unwrap();
    let ServerEvent::TransportCreated {
        transport_params, ..
    } = event
    else {
        panic!("expected transport-created");
    };
    server
        .connect_transport(&peer.id, transport_params.id, client_dtls_parameters())
        .await
        .unwrap();
    transport_params.id
}

/// Joins and sets up connected send + recv transports, draining the join
/// reply along the way.
async fn join_with_transports(
    server: &RoomServer,
    peer: &mut TestPeer,
    room_id: &str,
) -> (TransportId, TransportId) {
    server.join(&peer.id, room_id).await.unwrap();
    let joined = peer.next_event();
    assert!(matches!(joined, ServerEvent::VideoRoomJoined { .. }));
    let send = create_and_connect(server, peer, room_id, Direction::Send).await;
    let recv = create_and_connect(server, peer, room_id, Direction::Recv).await;
    (send, recv)
}

#[tokio::test]
async fn join_empty_room_advertises_nothing() {
    let server = test_server().await;
    let mut p1 = connect_peer(&server, "p1");

    server.join("p1", "room-a").await.unwrap();

    let ServerEvent::VideoRoomJoined {
        router_capabilities,
        existing_producers,
    } = p1.next_event()
    else {
        panic!("expected video-room-joined");
    };
    assert!(existing_producers.is_empty());
    assert!(!router_capabilities.codecs.is_empty());
    assert_eq!(server.room_count(), 1);
}

#[tokio::test]
async fn double_join_and_double_leave_are_protocol_errors() {
    let server = test_server().await;
    let mut p1 = connect_peer(&server, "p1");

    server.join("p1", "room-a").await.unwrap();
    let _ = p1.next_event();

    let err = server.join("p1", "room-b").await.unwrap_err();
    assert_eq!(err.code, ErrorCode::AlreadyJoined);

    server.leave("p1", "room-a").await.unwrap();
    let err = server.leave("p1", "room-a").await.unwrap_err();
    assert_eq!(err.code, ErrorCode::NotJoined);
}

#[tokio::test]
async fn second_join_notifies_existing_members_only() {
    let server = test_server().await;
    let mut p1 = connect_peer(&server, "p1");
    let mut p2 = connect_peer(&server, "p2");

    server.join("p1", "room-a").await.unwrap();
    let _ = p1.next_event();
    server.join("p2", "room-a").await.unwrap();
    let _ = p2.next_event();

    let p1_events = p1.drain();
    assert!(p1_events
        .iter()
        .any(|e| matches!(e, ServerEvent::NewPeerJoined { peer_id } if peer_id == "p2")));
    // The joiner never sees its own join fan-out
    assert!(p2.drain().is_empty());
}

#[tokio::test]
async fn two_party_audio_session() {
    let server = test_server().await;
    let mut p1 = connect_peer(&server, "p1");
    let mut p2 = connect_peer(&server, "p2");

    let (p1_send, _) = join_with_transports(&server, &mut p1, "room-a").await;
    let (_, p2_recv) = join_with_transports(&server, &mut p2, "room-a").await;
    let _ = p1.drain(); // new-peer-joined for p2

    // p1 produces audio
    let event = server
        .create_producer("p1", "room-a", p1_send, MediaKind::Audio, audio_rtp_parameters(1111))
        .await
        .unwrap();
    let ServerEvent::ProducerCreated { id: producer_id, kind } = event else {
        panic!("expected producer-created");
    };
    assert_eq!(kind, MediaKind::Audio);

    // p2 is told, p1 never sees its own fan-out
    let p2_events = p2.drain();
    assert!(p2_events.iter().any(|e| matches!(
        e,
        ServerEvent::NewProducerAvailable { peer_id, producer_id: pid, kind: MediaKind::Audio }
            if peer_id == "p1" && *pid == producer_id
    )));
    assert!(p1.drain().is_empty());

    // p2 consumes it, paused, then resumes
    let event = server
        .create_consumer("p2", p2_recv, producer_id, audio_consumer_capabilities())
        .await
        .unwrap();
    let ServerEvent::ConsumerCreated {
        id: consumer_id,
        producer_id: advertised,
        kind,
        ..
    } = event
    else {
        panic!("expected consumer-created");
    };
    assert_eq!(advertised, producer_id);
    assert_eq!(kind, MediaKind::Audio);

    let event = server.resume_consumer("p2", consumer_id).await.unwrap();
    assert!(matches!(event, ServerEvent::ConsumerResumed { consumer_id: id } if id == consumer_id));

    // Resuming a resumed consumer is a state violation
    let err = server.resume_consumer("p2", consumer_id).await.unwrap_err();
    assert_eq!(err.code, ErrorCode::AlreadyResumed);

    // Pause flips it back exactly once
    let event = server.pause_consumer("p2", consumer_id).await.unwrap();
    assert!(matches!(event, ServerEvent::ConsumerPaused { .. }));
    let err = server.pause_consumer("p2", consumer_id).await.unwrap_err();
    assert_eq!(err.code, ErrorCode::AlreadyPaused);
}

#[tokio::test]
async fn produce_before_connect_is_rejected_without_side_effects() {
    let server = test_server().await;
    let mut p1 = connect_peer(&server, "p1");
    let mut p2 = connect_peer(&server, "p2");

    server.join("p1", "room-a").await.unwrap();
    let _ = p1.next_event();
    server.join("p2", "room-a").await.unwrap();
    let _ = p2.next_event();
    let _ = p1.drain();

    let event = server
        .create_transport("p1", "room-a", Direction::Send)
        .await
        .unwrap();
    let ServerEvent::TransportCreated {
        transport_params, ..
    } = event
    else {
        panic!("expected transport-created");
    };

    let err = server
        .create_producer(
            "p1",
            "room-a",
            transport_params.id,
            MediaKind::Audio,
            audio_rtp_parameters(2222),
        )
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::NotConnected);

    // No advertisement reached the room, no record remains
    assert!(p2.drain().is_empty());
    let room_arc = server.rooms.read().unwrap().get("room-a").cloned().unwrap();
    assert!(room_arc.lock().await.producers.is_empty());
}

#[tokio::test]
async fn transport_preconditions_are_enforced() {
    let server = test_server().await;
    let mut p1 = connect_peer(&server, "p1");

    server.join("p1", "room-a").await.unwrap();
    let _ = p1.next_event();

    // One transport per direction per peer
    let event = server
        .create_transport("p1", "room-a", Direction::Send)
        .await
        .unwrap();
    let ServerEvent::TransportCreated {
        transport_params, ..
    } = event
    else {
        panic!("expected transport-created");
    };
    let err = server
        .create_transport("p1", "room-a", Direction::Send)
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::DuplicateTransport);

    // connect flips exactly once; the retry is answered, not re-run
    server
        .connect_transport("p1", transport_params.id, client_dtls_parameters())
        .await
        .unwrap();
    let err = server
        .connect_transport("p1", transport_params.id, client_dtls_parameters())
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::AlreadyConnected);

    // Producing requires a send transport
    let recv_id = create_and_connect(&server, &p1, "room-a", Direction::Recv).await;
    let err = server
        .create_producer("p1", "room-a", recv_id, MediaKind::Audio, audio_rtp_parameters(3333))
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::WrongDirection);
}

#[tokio::test]
async fn late_joiner_sees_existing_producers_in_join_payload() {
    let server = test_server().await;
    let mut p1 = connect_peer(&server, "p1");
    let mut p3 = connect_peer(&server, "p3");

    let (p1_send, _) = join_with_transports(&server, &mut p1, "room-a").await;
    server
        .create_producer("p1", "room-a", p1_send, MediaKind::Audio, audio_rtp_parameters(4444))
        .await
        .unwrap();

    server.join("p3", "room-a").await.unwrap();
    let ServerEvent::VideoRoomJoined {
        existing_producers, ..
    } = p3.next_event()
    else {
        panic!("expected video-room-joined");
    };
    assert_eq!(existing_producers.len(), 1);
    assert!(matches!(
        &existing_producers[0],
        ExistingProducer { peer_id, kind: MediaKind::Audio, .. } if peer_id == "p1"
    ));

    // Advertised exactly once: inside the join payload, never as a fan-out
    assert!(!p3
        .drain()
        .iter()
        .any(|e| matches!(e, ServerEvent::NewProducerAvailable { .. })));

    let p1_events = p1.drain();
    assert_eq!(
        p1_events
            .iter()
            .filter(|e| matches!(e, ServerEvent::NewPeerJoined { peer_id } if peer_id == "p3"))
            .count(),
        1
    );
}

#[tokio::test]
async fn graceful_leave_reclaims_producers_and_notifies_room() {
    let server = test_server().await;
    let mut p1 = connect_peer(&server, "p1");
    let mut p2 = connect_peer(&server, "p2");

    let (p1_send, _) = join_with_transports(&server, &mut p1, "room-a").await;
    let (_, p2_recv) = join_with_transports(&server, &mut p2, "room-a").await;
    let _ = p1.drain();

    let event = server
        .create_producer("p1", "room-a", p1_send, MediaKind::Audio, audio_rtp_parameters(5555))
        .await
        .unwrap();
    let ServerEvent::ProducerCreated { id: producer_id, .. } = event else {
        panic!("expected producer-created");
    };
    let _ = p2.drain();

    // p2 consumes so the leave also has a downstream consumer to reap
    server
        .create_consumer("p2", p2_recv, producer_id, audio_consumer_capabilities())
        .await
        .unwrap();

    let event = server.leave("p1", "room-a").await.unwrap();
    assert!(matches!(event, ServerEvent::VideoRoomLeft { room_id } if room_id == "room-a"));

    let p2_events = p2.drain();
    assert_eq!(
        p2_events
            .iter()
            .filter(|e| matches!(
                e,
                ServerEvent::ProducerClosed { peer_id: Some(p), producer_id: pid }
                    if p == "p1" && *pid == producer_id
            ))
            .count(),
        1
    );
    assert_eq!(
        p2_events
            .iter()
            .filter(|e| matches!(e, ServerEvent::PeerLeft { peer_id } if peer_id == "p1"))
            .count(),
        1
    );

    // p1's tables are empty; p2's consumer of the dead producer is gone too
    let room_arc = server.rooms.read().unwrap().get("room-a").cloned().unwrap();
    let room = room_arc.lock().await;
    assert!(room.producers.is_empty());
    assert!(room.consumers.is_empty());
    assert!(room.transports.values().all(|t| t.peer_id != "p1"));
    assert!(!room.members.contains_key("p1"));
}

#[tokio::test]
async fn abrupt_disconnect_looks_like_a_leave_to_the_room() {
    let server = test_server().await;
    let mut p1 = connect_peer(&server, "p1");
    let mut p3 = connect_peer(&server, "p3");

    join_with_transports(&server, &mut p1, "room-a").await;
    let (p3_send, _) = join_with_transports(&server, &mut p3, "room-a").await;
    server
        .create_producer("p3", "room-a", p3_send, MediaKind::Audio, audio_rtp_parameters(6666))
        .await
        .unwrap();
    let _ = p1.drain();

    server.disconnect_peer("p3").await;

    let p1_events = p1.drain();
    assert!(p1_events
        .iter()
        .any(|e| matches!(e, ServerEvent::ProducerClosed { peer_id: Some(p), .. } if p == "p3")));
    assert!(p1_events
        .iter()
        .any(|e| matches!(e, ServerEvent::PeerLeft { peer_id } if peer_id == "p3")));

    // Repeated close signals are the recovery path, not an error
    server.disconnect_peer("p3").await;
    assert_eq!(server.peer_count(), 1);
}

#[tokio::test]
async fn empty_room_teardown_yields_a_fresh_router() {
    let server = test_server().await;
    let mut p1 = connect_peer(&server, "p1");

    server.join("p1", "room-a").await.unwrap();
    let _ = p1.next_event();
    let first_router = {
        let room_arc = server.rooms.read().unwrap().get("room-a").cloned().unwrap();
        let room = room_arc.lock().await;
        room.router.id()
    };

    server.leave("p1", "room-a").await.unwrap();
    assert_eq!(server.room_count(), 0);

    server.join("p1", "room-a").await.unwrap();
    let _ = p1.next_event();
    let second_router = {
        let room_arc = server.rooms.read().unwrap().get("room-a").cloned().unwrap();
        let room = room_arc.lock().await;
        room.router.id()
    };
    assert_ne!(first_router, second_router);
}

#[tokio::test]
async fn consume_rules_unknown_foreign_and_own() {
    let server = test_server().await;
    let mut p1 = connect_peer(&server, "p1");
    let mut p2 = connect_peer(&server, "p2");

    let (p1_send, p1_recv) = join_with_transports(&server, &mut p1, "room-a").await;
    let (_, p2_recv) = join_with_transports(&server, &mut p2, "room-a").await;
    let _ = p1.drain();

    // A producer that closed between advertisement and consume
    let vanished: ProducerId = "9f0b53b2-6b38-4e1e-8c3f-0a6a01c2d6ef".parse().unwrap();
    let err = server
        .create_consumer("p2", p2_recv, vanished, audio_consumer_capabilities())
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::UnknownProducer);

    let event = server
        .create_producer("p1", "room-a", p1_send, MediaKind::Audio, audio_rtp_parameters(7777))
        .await
        .unwrap();
    let ServerEvent::ProducerCreated { id: producer_id, .. } = event else {
        panic!("expected producer-created");
    };

    // A peer cannot consume its own uplink
    let err = server
        .create_consumer("p1", p1_recv, producer_id, audio_consumer_capabilities())
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::CannotConsume);

    // No stray consumer records from the failed attempts
    let room_arc = server.rooms.read().unwrap().get("room-a").cloned().unwrap();
    assert!(room_arc.lock().await.consumers.is_empty());
}

#[tokio::test]
async fn session_phase_follows_the_records() {
    let server = test_server().await;
    let mut p1 = connect_peer(&server, "p1");

    server.join("p1", "room-a").await.unwrap();
    let _ = p1.next_event();

    let room_arc = server.rooms.read().unwrap().get("room-a").cloned().unwrap();
    assert_eq!(room_arc.lock().await.peer_phase("p1"), state::SessionPhase::Joined);
    assert_eq!(
        room_arc.lock().await.peer_phase("ghost"),
        state::SessionPhase::Connected
    );

    let send_id = create_and_connect(&server, &p1, "room-a", Direction::Send).await;
    assert_eq!(
        room_arc.lock().await.peer_phase("p1"),
        state::SessionPhase::TransportsReadySend
    );

    server
        .create_producer("p1", "room-a", send_id, MediaKind::Audio, audio_rtp_parameters(8888))
        .await
        .unwrap();
    assert_eq!(
        room_arc.lock().await.peer_phase("p1"),
        state::SessionPhase::Producing
    );
}

#[tokio::test]
async fn ownership_is_checked_before_any_mutation() {
    let server = test_server().await;
    let mut p1 = connect_peer(&server, "p1");
    let mut p2 = connect_peer(&server, "p2");

    let (p1_send, _) = join_with_transports(&server, &mut p1, "room-a").await;
    join_with_transports(&server, &mut p2, "room-a").await;
    let _ = p1.drain();

    // p2 may not connect or produce on p1's transport
    let err = server
        .connect_transport("p2", p1_send, client_dtls_parameters())
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::NotOwner);

    let event = server
        .create_producer("p1", "room-a", p1_send, MediaKind::Audio, audio_rtp_parameters(9999))
        .await
        .unwrap();
    let ServerEvent::ProducerCreated { id: producer_id, .. } = event else {
        panic!("expected producer-created");
    };
    let _ = p2.drain();

    let err = server.close_producer("p2", "room-a", producer_id).await.unwrap_err();
    assert_eq!(err.code, ErrorCode::NotOwner);

    // The rightful owner can, and gets both a reply and a fan-out
    let event = server.close_producer("p1", "room-a", producer_id).await.unwrap();
    assert!(matches!(
        event,
        ServerEvent::ProducerClosed { peer_id: None, producer_id: pid } if pid == producer_id
    ));
    let p2_events = p2.drain();
    assert_eq!(
        p2_events
            .iter()
            .filter(|e| matches!(e, ServerEvent::ProducerClosed { peer_id: Some(p), .. } if p == "p1"))
            .count(),
        1
    );
}

#[tokio::test]
async fn duplicate_kind_is_rejected_until_the_first_closes() {
    let server = test_server().await;
    let mut p1 = connect_peer(&server, "p1");

    let (p1_send, _) = join_with_transports(&server, &mut p1, "room-a").await;
    let event = server
        .create_producer("p1", "room-a", p1_send, MediaKind::Audio, audio_rtp_parameters(1212))
        .await
        .unwrap();
    let ServerEvent::ProducerCreated { id: first, .. } = event else {
        panic!("expected producer-created");
    };

    let err = server
        .create_producer("p1", "room-a", p1_send, MediaKind::Audio, audio_rtp_parameters(1313))
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::DuplicateKind);

    server.close_producer("p1", "room-a", first).await.unwrap();
    server
        .create_producer("p1", "room-a", p1_send, MediaKind::Audio, audio_rtp_parameters(1414))
        .await
        .unwrap();
}
