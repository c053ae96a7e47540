#![forbid(unsafe_code)]

// Room state: membership plus the id-keyed transport/producer/consumer
// tables. Records own their engine handles, so removing a record from its
// table is what closes the engine-side object.

use crate::media::{ConsumerHandle, ProducerHandle, RouterHandle, TransportHandle};
use crate::signaling::protocol::{Direction, ExistingProducer};
use mediasoup::prelude::*;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;

pub type PeerId = String;
pub type RoomId = String;

/// Outbox for one peer's signaling connection: pre-serialized JSON events
pub type Outbox = mpsc::Sender<Arc<String>>;

/// Observable point a peer's session has reached, derived from its records
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Connected,
    Joined,
    TransportsReadySend,
    TransportsReadyRecv,
    Producing,
    Consuming,
    Leaving,
}

/// One member of a room
pub struct Member {
    pub outbox: Outbox,
    pub leaving: bool,
}

pub struct TransportRecord {
    pub id: TransportId,
    pub peer_id: PeerId,
    pub room_id: RoomId,
    pub direction: Direction,
    pub connected: bool,
    pub handle: TransportHandle,
}

pub struct ProducerRecord {
    pub id: ProducerId,
    pub peer_id: PeerId,
    pub room_id: RoomId,
    pub kind: MediaKind,
    pub handle: ProducerHandle,
}

pub struct ConsumerRecord {
    pub id: ConsumerId,
    pub peer_id: PeerId,
    pub room_id: RoomId,
    pub producer_id: ProducerId,
    pub kind: MediaKind,
    pub paused: bool,
    pub handle: ConsumerHandle,
}

/// One live room: its router, members, and everything they own.
/// Guarded by a room-scoped mutex in `RoomServer`; all cross-entity
/// references are ids, so teardown is a straight table sweep.
pub struct Room {
    pub id: RoomId,
    pub router: RouterHandle,
    pub members: HashMap<PeerId, Member>,
    pub transports: HashMap<TransportId, TransportRecord>,
    pub producers: HashMap<ProducerId, ProducerRecord>,
    pub consumers: HashMap<ConsumerId, ConsumerRecord>,
    /// Set when the room is torn down; ops holding a stale Arc must treat
    /// the room as gone
    pub closed: bool,
    pub created_at: Instant,
}

impl Room {
    pub fn new(id: RoomId, router: RouterHandle) -> Self {
        Self {
            id,
            router,
            members: HashMap::new(),
            transports: HashMap::new(),
            producers: HashMap::new(),
            consumers: HashMap::new(),
            closed: false,
            created_at: Instant::now(),
        }
    }

    /// The peer's transport in the given direction, if created
    pub fn transport_of(&self, peer_id: &str, direction: Direction) -> Option<&TransportRecord> {
        self.transports
            .values()
            .find(|t| t.peer_id == peer_id && t.direction == direction)
    }

    /// The peer's live producer of the given kind, if any
    pub fn producer_of_kind(&self, peer_id: &str, kind: MediaKind) -> Option<&ProducerRecord> {
        self.producers
            .values()
            .find(|p| p.peer_id == peer_id && p.kind == kind)
    }

    /// All live producers, for the `existingProducers` list in a join reply
    pub fn existing_producers(&self) -> Vec<ExistingProducer> {
        self.producers
            .values()
            .map(|p| ExistingProducer {
                id: p.id,
                peer_id: p.peer_id.clone(),
                kind: p.kind,
            })
            .collect()
    }

    /// Snapshot of every member except `peer_id`, for fan-out after the
    /// room lock is released
    pub fn snapshot_other_members(&self, peer_id: &str) -> Vec<(PeerId, Outbox)> {
        self.members
            .iter()
            .filter(|(id, _)| id.as_str() != peer_id)
            .map(|(id, m)| (id.clone(), m.outbox.clone()))
            .collect()
    }

    /// Snapshot of every member, for room-wide notifications
    pub fn snapshot_members(&self) -> Vec<(PeerId, Outbox)> {
        self.members
            .iter()
            .map(|(id, m)| (id.clone(), m.outbox.clone()))
            .collect()
    }

    pub fn peer_phase(&self, peer_id: &str) -> SessionPhase {
        let Some(member) = self.members.get(peer_id) else {
            return SessionPhase::Connected;
        };
        if member.leaving {
            return SessionPhase::Leaving;
        }
        if self.consumers.values().any(|c| c.peer_id == peer_id) {
            return SessionPhase::Consuming;
        }
        if self.producers.values().any(|p| p.peer_id == peer_id) {
            return SessionPhase::Producing;
        }
        if self.transport_of(peer_id, Direction::Recv).is_some() {
            return SessionPhase::TransportsReadyRecv;
        }
        if self.transport_of(peer_id, Direction::Send).is_some() {
            return SessionPhase::TransportsReadySend;
        }
        SessionPhase::Joined
    }
}
