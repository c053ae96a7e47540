#![forbid(unsafe_code)]

// WebSocket connection handler: one ordered event loop per peer.

use super::protocol::{ClientEvent, ErrorCode, ServerEvent};
use crate::metrics::{Counter, ServerMetrics};
use crate::rooms::{RoomServer, SignalError};
use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::sync::OwnedSemaphorePermit;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Depth of each peer's outbox. Replies and fan-outs share it; at the
/// inbound flood limit a full outbox is ~640ms of backlog, which is already
/// stale for signaling, so older events are dropped rather than queued.
const OUTBOX_DEPTH: usize = 64;

/// A socket with no inbound traffic for this long is presumed dead and
/// closed, so it cannot sit on a connection permit forever.
const SOCKET_IDLE_LIMIT: Duration = Duration::from_secs(300);

/// Inbound flood control: a peer may burst this many events, refilled at
/// the steady per-second rate below.
const INBOUND_BURST: u32 = 100;
const INBOUND_EVENTS_PER_SEC: u32 = 100;

const MAX_ROOM_ID_LEN: usize = 128;

/// Credit ledger for inbound events. Credits refill in whole units and the
/// refill instant only advances when at least one credit is earned, so
/// fractional accrual is never thrown away.
struct FloodGate {
    credits: u32,
    refilled_at: Instant,
    notified: bool,
}

impl FloodGate {
    fn new(now: Instant) -> Self {
        Self {
            credits: INBOUND_BURST,
            refilled_at: now,
            notified: false,
        }
    }

    /// Spends one credit if the peer has any; false while it is flooding.
    fn admit(&mut self, now: Instant) -> bool {
        let earned = (now.duration_since(self.refilled_at).as_millis() as u64
            * u64::from(INBOUND_EVENTS_PER_SEC)
            / 1000)
            .min(u64::from(INBOUND_BURST)) as u32;
        if earned > 0 {
            self.credits = (self.credits + earned).min(INBOUND_BURST);
            self.refilled_at = now;
        }
        if self.credits > 0 {
            self.credits -= 1;
            self.notified = false;
            true
        } else {
            false
        }
    }

    /// True exactly once per flood episode, so the peer is told it is over
    /// the limit without being spammed about it.
    fn first_rejection(&mut self) -> bool {
        !std::mem::replace(&mut self.notified, true)
    }
}

/// Serialize a ServerEvent and enqueue it as pre-serialized JSON.
fn send_json(sender: &mpsc::Sender<Arc<String>>, event: &ServerEvent) -> anyhow::Result<()> {
    let json = Arc::new(serde_json::to_string(event)?);
    sender.try_send(json).map_err(|e| anyhow::anyhow!("{e}"))?;
    Ok(())
}

/// Handles a single signaling connection. The connection id is the peer id.
pub async fn handle_connection(
    socket: WebSocket,
    server: Arc<RoomServer>,
    metrics: ServerMetrics,
    _permit: OwnedSemaphorePermit,
) {
    let peer_id = Uuid::new_v4().to_string();
    info!("new signaling connection: {}", peer_id);

    metrics.bump(Counter::ConnectionsOpened);
    let _conn_token = metrics.track_connection();

    let (mut ws_sender, mut ws_receiver) = socket.split();

    // Bounded outbox: replies and fan-outs both flow through here, so a
    // peer observes a single total order of events
    let (tx, mut rx) = mpsc::channel::<Arc<String>>(OUTBOX_DEPTH);
    server.register_peer(&peer_id, tx.clone());

    let send_task = tokio::spawn({
        let peer_id = peer_id.clone();
        let metrics = metrics.clone();
        async move {
            while let Some(json) = rx.recv().await {
                metrics.bump(Counter::EventsOut);
                if ws_sender
                    .send(Message::Text((*json).clone().into()))
                    .await
                    .is_err()
                {
                    break;
                }
            }
            debug!("send task finished for peer: {}", peer_id);
        }
    });

    let mut flood = FloodGate::new(Instant::now());

    loop {
        // A socket that stays quiet past SOCKET_IDLE_LIMIT gets closed
        let frame = match tokio::time::timeout(SOCKET_IDLE_LIMIT, ws_receiver.next()).await {
            Ok(Some(Ok(frame))) => frame,
            Ok(Some(Err(_))) | Ok(None) => break, // Stream error or closed
            Err(_) => {
                warn!("closing idle connection of peer {}", peer_id);
                break;
            }
        };

        match frame {
            Message::Text(text) => {
                metrics.bump(Counter::EventsIn);

                if !flood.admit(Instant::now()) {
                    if flood.first_rejection() {
                        warn!("peer {} exceeded the inbound event rate", peer_id);
                        let _ = send_json(
                            &tx,
                            &ServerEvent::VideoRoomError {
                                error: ErrorCode::BadRequest,
                                details: format!(
                                    "flooding: at most {INBOUND_EVENTS_PER_SEC} events per second"
                                ),
                            },
                        );
                    }
                    continue;
                }

                match serde_json::from_str::<ClientEvent>(&text) {
                    Ok(event) => {
                        let start = Instant::now();
                        let result = dispatch(&event, &peer_id, &server).await;
                        metrics.record_dispatch(start.elapsed());

                        match result {
                            Ok(Some(reply)) => {
                                let _ = send_json(&tx, &reply);
                            }
                            Ok(None) => {} // op already enqueued its reply
                            Err(err) => {
                                metrics.bump(Counter::EventErrors);
                                debug!("event from peer {} rejected: {}", peer_id, err);
                                // If the outbox is closed, the send task has exited
                                if tx.is_closed() {
                                    break;
                                }
                                let _ = send_json(&tx, &error_event_for(&event, err));
                            }
                        }
                    }
                    Err(e) => {
                        warn!("invalid event from peer {}: {}", peer_id, e);
                        metrics.bump(Counter::EventErrors);
                        let _ = send_json(
                            &tx,
                            &ServerEvent::VideoRoomError {
                                error: ErrorCode::BadRequest,
                                details: format!("invalid event format: {e}"),
                            },
                        );
                    }
                }
            }
            Message::Close(_) => {
                info!("peer {} closed connection", peer_id);
                break;
            }
            Message::Ping(_) | Message::Pong(_) => {
                // WebSocket ping/pong handled automatically
            }
            _ => {
                warn!("unexpected message type from peer {}", peer_id);
            }
        }
    }

    // Voluntary close and abrupt drop converge here: reclaim everything the
    // peer owns and tell the rest of its room. Idempotent with an earlier
    // explicit leave-video-room.
    server.disconnect_peer(&peer_id).await;

    // _conn_token dropped here → connections_open gauge paid back
    // _permit dropped here → release semaphore

    drop(tx);
    let _ = send_task.await;

    info!("connection handler finished for peer: {}", peer_id);
}

/// Routes one client event to the corresponding room-server operation.
/// `Ok(None)` means the operation enqueued its own reply (join does, so the
/// reply cannot be overtaken by a fan-out that postdates it).
async fn dispatch(
    event: &ClientEvent,
    peer_id: &str,
    server: &Arc<RoomServer>,
) -> Result<Option<ServerEvent>, SignalError> {
    match event {
        ClientEvent::JoinVideoRoom { room_id } => {
            validate_room_id(room_id)?;
            server.join(peer_id, room_id).await?;
            Ok(None)
        }
        ClientEvent::LeaveVideoRoom { room_id } => {
            server.leave(peer_id, room_id).await.map(Some)
        }
        ClientEvent::CreateTransport { room_id, direction } => server
            .create_transport(peer_id, room_id, *direction)
            .await
            .map(Some),
        ClientEvent::ConnectTransport {
            transport_id,
            dtls_parameters,
        } => server
            .connect_transport(peer_id, *transport_id, dtls_parameters.clone())
            .await
            .map(Some),
        ClientEvent::CreateProducer {
            transport_id,
            room_id,
            kind,
            rtp_parameters,
        } => server
            .create_producer(peer_id, room_id, *transport_id, *kind, rtp_parameters.clone())
            .await
            .map(Some),
        ClientEvent::CreateConsumer {
            transport_id,
            producer_id,
            rtp_capabilities,
        } => server
            .create_consumer(peer_id, *transport_id, *producer_id, rtp_capabilities.clone())
            .await
            .map(Some),
        ClientEvent::ResumeConsumer { consumer_id } => {
            server.resume_consumer(peer_id, *consumer_id).await.map(Some)
        }
        ClientEvent::PauseConsumer { consumer_id } => {
            server.pause_consumer(peer_id, *consumer_id).await.map(Some)
        }
        ClientEvent::CloseProducer {
            producer_id,
            room_id,
        } => server
            .close_producer(peer_id, room_id, *producer_id)
            .await
            .map(Some),
    }
}

fn validate_room_id(room_id: &str) -> Result<(), SignalError> {
    if room_id.is_empty() || room_id.len() > MAX_ROOM_ID_LEN {
        return Err(SignalError::new(
            ErrorCode::BadRequest,
            format!("roomId must be 1-{MAX_ROOM_ID_LEN} characters"),
        ));
    }
    Ok(())
}

/// Picks the error event family matching the failed request.
fn error_event_for(event: &ClientEvent, err: SignalError) -> ServerEvent {
    let (error, details) = (err.code, err.details);
    match event {
        ClientEvent::JoinVideoRoom { .. } | ClientEvent::LeaveVideoRoom { .. } => {
            ServerEvent::VideoRoomError { error, details }
        }
        ClientEvent::CreateTransport { .. } | ClientEvent::ConnectTransport { .. } => {
            ServerEvent::TransportError { error, details }
        }
        ClientEvent::CreateProducer { .. } | ClientEvent::CloseProducer { .. } => {
            ServerEvent::ProducerError { error, details }
        }
        ClientEvent::CreateConsumer { .. }
        | ClientEvent::ResumeConsumer { .. }
        | ClientEvent::PauseConsumer { .. } => ServerEvent::ConsumerError { error, details },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flood_gate_denies_past_the_burst_and_refills_over_time() {
        let start = Instant::now();
        let mut gate = FloodGate::new(start);

        for _ in 0..INBOUND_BURST {
            assert!(gate.admit(start));
        }
        assert!(!gate.admit(start));
        assert!(gate.first_rejection());
        assert!(!gate.first_rejection()); // only told once per episode

        // 50ms at 100/s earns five credits back
        let later = start + Duration::from_millis(50);
        for _ in 0..5 {
            assert!(gate.admit(later));
        }
        assert!(!gate.admit(later));
    }

    #[test]
    fn flood_gate_never_accrues_past_the_burst() {
        let start = Instant::now();
        let mut gate = FloodGate::new(start);

        // A long-idle peer still gets at most one burst worth of credits
        let much_later = start + Duration::from_secs(3600);
        for _ in 0..INBOUND_BURST {
            assert!(gate.admit(much_later));
        }
        assert!(!gate.admit(much_later));
    }

    #[test]
    fn error_family_follows_request_type() {
        let err = || SignalError::new(ErrorCode::NotJoined, "nope");

        let event = ClientEvent::JoinVideoRoom {
            room_id: "r".into(),
        };
        assert!(matches!(
            error_event_for(&event, err()),
            ServerEvent::VideoRoomError { .. }
        ));

        let event = ClientEvent::CreateTransport {
            room_id: "r".into(),
            direction: crate::signaling::protocol::Direction::Send,
        };
        assert!(matches!(
            error_event_for(&event, err()),
            ServerEvent::TransportError { .. }
        ));

        let consumer_id = "11b076f9-9627-42cf-9d91-7c1e23f30b25".parse().unwrap();
        let event = ClientEvent::ResumeConsumer { consumer_id };
        assert!(matches!(
            error_event_for(&event, err()),
            ServerEvent::ConsumerError { .. }
        ));
    }

    #[test]
    fn room_id_length_is_validated() {
        assert!(validate_room_id("standup").is_ok());
        assert!(validate_room_id("").is_err());
        assert!(validate_room_id(&"x".repeat(MAX_ROOM_ID_LEN + 1)).is_err());
    }
}
