#![forbid(unsafe_code)]

// Signaling protocol - event types carried over the WebSocket.
// Every event is a {"name": ..., "payload": ...} pair; names are kebab-case,
// payload fields camelCase.

use crate::media::TransportParams;
use mediasoup::prelude::*;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Which way media flows over a transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Send,
    Recv,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Send => f.write_str("send"),
            Direction::Recv => f.write_str("recv"),
        }
    }
}

/// Client-to-server events
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "name", content = "payload", rename_all = "kebab-case")]
pub enum ClientEvent {
    /// Join a room, creating it if needed
    #[serde(rename_all = "camelCase")]
    JoinVideoRoom { room_id: String },
    /// Leave the room and release everything owned in it
    #[serde(rename_all = "camelCase")]
    LeaveVideoRoom { room_id: String },
    /// Create one WebRTC transport in the given direction
    #[serde(rename_all = "camelCase")]
    CreateTransport {
        room_id: String,
        direction: Direction,
    },
    /// Finish the DTLS handshake for a transport
    #[serde(rename_all = "camelCase")]
    ConnectTransport {
        transport_id: TransportId,
        dtls_parameters: DtlsParameters,
    },
    /// Start uploading a track on the send transport
    #[serde(rename_all = "camelCase")]
    CreateProducer {
        transport_id: TransportId,
        room_id: String,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    },
    /// Start receiving another peer's track on the recv transport
    #[serde(rename_all = "camelCase")]
    CreateConsumer {
        transport_id: TransportId,
        producer_id: ProducerId,
        rtp_capabilities: RtpCapabilities,
    },
    /// Unpause a consumer once the client-side track is wired up
    #[serde(rename_all = "camelCase")]
    ResumeConsumer { consumer_id: ConsumerId },
    /// Pause a consumer without closing it
    #[serde(rename_all = "camelCase")]
    PauseConsumer { consumer_id: ConsumerId },
    /// Stop uploading a track
    #[serde(rename_all = "camelCase")]
    CloseProducer {
        producer_id: ProducerId,
        room_id: String,
    },
}

/// A producer that already existed when a peer joined, advertised inside
/// the join reply rather than via `new-producer-available`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExistingProducer {
    pub id: ProducerId,
    pub peer_id: String,
    pub kind: MediaKind,
}

/// Server-to-client events: replies, fan-outs, and errors
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "name", content = "payload", rename_all = "kebab-case")]
pub enum ServerEvent {
    #[serde(rename_all = "camelCase")]
    VideoRoomJoined {
        router_capabilities: RtpCapabilitiesFinalized,
        existing_producers: Vec<ExistingProducer>,
    },
    #[serde(rename_all = "camelCase")]
    VideoRoomLeft { room_id: String },
    #[serde(rename_all = "camelCase")]
    TransportCreated {
        direction: Direction,
        transport_params: TransportParams,
    },
    #[serde(rename_all = "camelCase")]
    TransportConnected { transport_id: TransportId },
    #[serde(rename_all = "camelCase")]
    ProducerCreated { id: ProducerId, kind: MediaKind },
    #[serde(rename_all = "camelCase")]
    ConsumerCreated {
        id: ConsumerId,
        producer_id: ProducerId,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    },
    #[serde(rename_all = "camelCase")]
    ConsumerResumed { consumer_id: ConsumerId },
    #[serde(rename_all = "camelCase")]
    ConsumerPaused { consumer_id: ConsumerId },
    /// Reply to the closing peer (no peerId) and fan-out to the rest of the
    /// room (with peerId), under one event name
    #[serde(rename_all = "camelCase")]
    ProducerClosed {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        peer_id: Option<String>,
        producer_id: ProducerId,
    },
    #[serde(rename_all = "camelCase")]
    NewPeerJoined { peer_id: String },
    #[serde(rename_all = "camelCase")]
    NewProducerAvailable {
        peer_id: String,
        producer_id: ProducerId,
        kind: MediaKind,
    },
    #[serde(rename_all = "camelCase")]
    PeerLeft { peer_id: String },
    VideoRoomError { error: ErrorCode, details: String },
    TransportError { error: ErrorCode, details: String },
    ProducerError { error: ErrorCode, details: String },
    ConsumerError { error: ErrorCode, details: String },
}

/// Machine-readable error codes carried in every error event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorCode {
    NotJoined,
    AlreadyJoined,
    UnknownRoom,
    UnknownTransport,
    UnknownProducer,
    UnknownConsumer,
    WrongDirection,
    NotConnected,
    AlreadyConnected,
    DuplicateKind,
    DuplicateTransport,
    CannotConsume,
    NotOwner,
    AlreadyResumed,
    AlreadyPaused,
    EngineFailure,
    Timeout,
    BadRequest,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::NotJoined => "not-joined",
            ErrorCode::AlreadyJoined => "already-joined",
            ErrorCode::UnknownRoom => "unknown-room",
            ErrorCode::UnknownTransport => "unknown-transport",
            ErrorCode::UnknownProducer => "unknown-producer",
            ErrorCode::UnknownConsumer => "unknown-consumer",
            ErrorCode::WrongDirection => "wrong-direction",
            ErrorCode::NotConnected => "not-connected",
            ErrorCode::AlreadyConnected => "already-connected",
            ErrorCode::DuplicateKind => "duplicate-kind",
            ErrorCode::DuplicateTransport => "duplicate-transport",
            ErrorCode::CannotConsume => "cannot-consume",
            ErrorCode::NotOwner => "not-owner",
            ErrorCode::AlreadyResumed => "already-resumed",
            ErrorCode::AlreadyPaused => "already-paused",
            ErrorCode::EngineFailure => "engine-failure",
            ErrorCode::Timeout => "timeout",
            ErrorCode::BadRequest => "bad-request",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn client_events_use_kebab_case_names() {
        let event: ClientEvent = serde_json::from_value(json!({
            "name": "join-video-room",
            "payload": { "roomId": "standup" }
        }))
        .unwrap();
        assert!(matches!(event, ClientEvent::JoinVideoRoom { room_id } if room_id == "standup"));

        let event: ClientEvent = serde_json::from_value(json!({
            "name": "create-transport",
            "payload": { "roomId": "standup", "direction": "recv" }
        }))
        .unwrap();
        assert!(matches!(
            event,
            ClientEvent::CreateTransport {
                direction: Direction::Recv,
                ..
            }
        ));
    }

    #[test]
    fn fan_out_events_serialize_with_payload_envelope() {
        let json = serde_json::to_value(&ServerEvent::NewPeerJoined {
            peer_id: "p2".to_string(),
        })
        .unwrap();
        assert_eq!(json["name"], "new-peer-joined");
        assert_eq!(json["payload"]["peerId"], "p2");
    }

    #[test]
    fn producer_closed_reply_omits_peer_id() {
        let producer_id: ProducerId = "8c2af0a6-3c39-4ce2-a2a2-10c2d5e72f19".parse().unwrap();

        let reply = serde_json::to_value(&ServerEvent::ProducerClosed {
            peer_id: None,
            producer_id,
        })
        .unwrap();
        assert_eq!(reply["name"], "producer-closed");
        assert!(reply["payload"].get("peerId").is_none());

        let fan_out = serde_json::to_value(&ServerEvent::ProducerClosed {
            peer_id: Some("p2".to_string()),
            producer_id,
        })
        .unwrap();
        assert_eq!(fan_out["payload"]["peerId"], "p2");
    }

    #[test]
    fn error_codes_match_wire_spelling() {
        for code in [
            ErrorCode::NotJoined,
            ErrorCode::AlreadyConnected,
            ErrorCode::DuplicateKind,
            ErrorCode::CannotConsume,
            ErrorCode::EngineFailure,
        ] {
            let wire = serde_json::to_value(code).unwrap();
            assert_eq!(wire, code.as_str());
        }
    }
}
