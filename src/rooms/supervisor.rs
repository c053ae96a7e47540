#![forbid(unsafe_code)]

// Lifecycle supervisor: reclaims everything a departing peer owns, and
// reacts to engine notifications (transport DTLS close, worker death).

use crate::media::EngineEvent;
use crate::rooms::state::{Room, RoomId};
use crate::rooms::{fan_out, RoomServer};
use crate::signaling::protocol::{Direction, ErrorCode, ServerEvent};
use mediasoup::prelude::*;
use mediasoup::worker::WorkerId;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex as TokioMutex};
use tracing::{debug, error, info, warn};

impl RoomServer {
    /// Spawns the engine-notification listener. Returns None if it was
    /// already started.
    pub fn start(self: &Arc<Self>) -> Option<tokio::task::JoinHandle<()>> {
        let receiver = self
            .engine_events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()?;
        let server = Arc::clone(self);
        Some(tokio::spawn(async move {
            server.run_engine_listener(receiver).await;
        }))
    }

    async fn run_engine_listener(&self, mut events: mpsc::UnboundedReceiver<EngineEvent>) {
        while let Some(event) = events.recv().await {
            match event {
                EngineEvent::TransportDtlsClosed(transport_id) => {
                    self.reclaim_transport(transport_id).await;
                }
                EngineEvent::WorkerDied(worker_id) => {
                    self.handle_worker_death(worker_id).await;
                }
            }
        }
        debug!("engine event listener finished");
    }

    /// Unregisters a peer whose signaling connection closed (or never
    /// joined). Safe to call repeatedly; the first call wins.
    pub async fn disconnect_peer(&self, peer_id: &str) {
        let entry = {
            let mut peers = self.peers.write().unwrap_or_else(|e| e.into_inner());
            peers.remove(peer_id)
        };
        let Some(entry) = entry else {
            return;
        };
        if let Some(room_id) = entry.room {
            info!("peer {} disconnected from room {}", peer_id, room_id);
            self.cleanup_peer(&room_id, peer_id).await;
        }
        debug!("peer {} unregistered", peer_id);
    }

    /// Removes a peer from a room by server decision. The peer stays
    /// registered and may join another room.
    pub async fn evict_peer(&self, room_id: &str, peer_id: &str) {
        info!("evicting peer {} from room {}", peer_id, room_id);
        self.cleanup_peer(room_id, peer_id).await;
        let mut peers = self.peers.write().unwrap_or_else(|e| e.into_inner());
        if let Some(entry) = peers.get_mut(peer_id) {
            if entry.room.as_deref() == Some(room_id) {
                entry.room = None;
            }
        }
    }

    /// Reclaims everything a peer owns in a room, in dependency order:
    /// producers (with fan-out, closing downstream consumers server-side),
    /// then the peer's own consumers, then transports, then membership.
    /// An emptied room is closed and removed in the same critical section.
    /// Idempotent: a second invocation finds no member and returns.
    pub(crate) async fn cleanup_peer(&self, room_id: &str, peer_id: &str) {
        let room_arc = {
            let rooms = self.rooms.read().unwrap_or_else(|e| e.into_inner());
            rooms.get(room_id).cloned()
        };
        let Some(room_arc) = room_arc else {
            return;
        };

        let mut room = room_arc.lock().await;
        let Some(member) = room.members.get_mut(peer_id) else {
            return;
        };
        member.leaving = true;
        debug!(
            "peer {} leaving room {} from phase {:?}",
            peer_id,
            room_id,
            room.peer_phase(peer_id)
        );

        let mut closures = Vec::new();
        let producer_ids: Vec<ProducerId> = room
            .producers
            .values()
            .filter(|p| p.peer_id == peer_id)
            .map(|p| p.id)
            .collect();
        for producer_id in producer_ids {
            room.producers.remove(&producer_id);
            room.consumers.retain(|_, c| c.producer_id != producer_id);
            closures.push(ServerEvent::ProducerClosed {
                peer_id: Some(peer_id.to_string()),
                producer_id,
            });
        }

        // The peer's own consumers disappear silently; only a producer's
        // disappearance is news to the rest of the room
        room.consumers.retain(|_, c| c.peer_id != peer_id);

        let transport_ids: Vec<TransportId> = room
            .transports
            .values()
            .filter(|t| t.peer_id == peer_id)
            .map(|t| t.id)
            .collect();
        if !transport_ids.is_empty() {
            let mut index = self
                .transport_index
                .write()
                .unwrap_or_else(|e| e.into_inner());
            for transport_id in &transport_ids {
                index.remove(transport_id);
            }
        }
        for transport_id in &transport_ids {
            room.transports.remove(transport_id);
        }

        room.members.remove(peer_id);
        let recipients = room.snapshot_other_members(peer_id);

        if room.members.is_empty() {
            room.closed = true;
            {
                let mut rooms = self.rooms.write().unwrap_or_else(|e| e.into_inner());
                rooms.remove(room_id);
            }
            info!(
                "room {} empty after {:?}, closing router",
                room_id,
                room.created_at.elapsed()
            );
        }
        drop(room);

        for closure in &closures {
            fan_out(room_id, &recipients, closure);
        }
        fan_out(
            room_id,
            &recipients,
            &ServerEvent::PeerLeft {
                peer_id: peer_id.to_string(),
            },
        );

        info!("peer {} left room {}", peer_id, room_id);
    }

    /// An engine transport died underneath its owner (DTLS closed). The
    /// transport and everything riding on it is reclaimed; producers fan
    /// out closure notices exactly as on a graceful close.
    async fn reclaim_transport(&self, transport_id: TransportId) {
        let owner = {
            let index = self.transport_index.read().unwrap_or_else(|e| e.into_inner());
            index.get(&transport_id).cloned()
        };
        let Some((room_id, peer_id)) = owner else {
            return;
        };
        let room_arc = {
            let rooms = self.rooms.read().unwrap_or_else(|e| e.into_inner());
            rooms.get(&room_id).cloned()
        };
        let Some(room_arc) = room_arc else {
            return;
        };

        let mut room = room_arc.lock().await;
        let Some(record) = room.transports.remove(&transport_id) else {
            return;
        };
        {
            let mut index = self
                .transport_index
                .write()
                .unwrap_or_else(|e| e.into_inner());
            index.remove(&transport_id);
        }
        warn!(
            "transport {} of peer {} in room {} closed by engine, reclaiming",
            transport_id, peer_id, room_id
        );

        let mut closures = Vec::new();
        match record.direction {
            Direction::Send => {
                let producer_ids: Vec<ProducerId> = room
                    .producers
                    .values()
                    .filter(|p| p.peer_id == peer_id)
                    .map(|p| p.id)
                    .collect();
                for producer_id in producer_ids {
                    room.producers.remove(&producer_id);
                    room.consumers.retain(|_, c| c.producer_id != producer_id);
                    closures.push(ServerEvent::ProducerClosed {
                        peer_id: Some(peer_id.clone()),
                        producer_id,
                    });
                }
            }
            Direction::Recv => {
                room.consumers.retain(|_, c| c.peer_id != peer_id);
            }
        }

        let recipients = room.snapshot_other_members(&peer_id);
        drop(room);

        for closure in &closures {
            fan_out(&room_id, &recipients, closure);
        }
    }

    /// A worker died: every room it hosted is unrecoverable. Members are
    /// told once via `video-room-error`, then the fatal flag is raised so
    /// the process can exit after its grace period.
    async fn handle_worker_death(&self, worker_id: WorkerId) {
        error!(
            "media worker {} died; notifying affected rooms and shutting down",
            worker_id
        );

        let room_arcs: Vec<(RoomId, Arc<TokioMutex<Room>>)> = {
            let rooms = self.rooms.read().unwrap_or_else(|e| e.into_inner());
            rooms
                .iter()
                .map(|(id, arc)| (id.clone(), Arc::clone(arc)))
                .collect()
        };

        let notice = ServerEvent::VideoRoomError {
            error: ErrorCode::EngineFailure,
            details: "media worker died".to_string(),
        };
        for (room_id, room_arc) in room_arcs {
            let room = room_arc.lock().await;
            if room.router.worker_id() != worker_id {
                continue;
            }
            let recipients = room.snapshot_members();
            drop(room);
            fan_out(&room_id, &recipients, &notice);
        }

        let _ = self.fatal.send(true);
    }
}
