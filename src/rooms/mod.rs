#![forbid(unsafe_code)]

// Rooms module - room/peer registries, the per-room id tables, and the
// event operations that mutate them.
//
// Locking layout: the outer registries are std::sync::RwLock maps held only
// for brief lookups and inserts, never across await points. Each room is an
// Arc<tokio::sync::Mutex<Room>>; the room lock serializes every mutation
// touching that room (membership and the transport/producer/consumer tables
// of its members) and may be held across the short per-room engine calls.
// Fan-out goes through bounded try_send from snapshots taken under the room
// lock and sent after it is released.

pub mod error;
pub mod state;
mod supervisor;

#[cfg(test)]
mod tests;

pub use error::SignalError;

use crate::media::{EngineEvent, MediaConfig, MediaEngine};
use crate::metrics::{Counter, ServerMetrics};
use crate::signaling::protocol::{Direction, ErrorCode, ServerEvent};
use mediasoup::prelude::*;
use state::{
    ConsumerRecord, Member, Outbox, PeerId, ProducerRecord, Room, RoomId, TransportRecord,
};
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock};
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex as TokioMutex};
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Deadline for the client-driven engine handshakes (connect, produce,
/// consume). On expiry the client sees `timeout` and may retry.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// A signaling connection known to the server. `room` is the peer's current
/// room, if joined; the outbox feeds its WebSocket send task.
pub struct PeerEntry {
    pub room: Option<RoomId>,
    pub outbox: Outbox,
}

/// The control-plane state for the whole process. Components receive it by
/// parameter; there are no ambient globals.
pub struct RoomServer {
    rooms: StdRwLock<HashMap<RoomId, Arc<TokioMutex<Room>>>>,
    peers: StdRwLock<HashMap<PeerId, PeerEntry>>,
    /// Transport ownership index for engine notifications that carry only a
    /// transport id
    transport_index: StdRwLock<HashMap<TransportId, (RoomId, PeerId)>>,
    engine: MediaEngine,
    engine_events: StdMutex<Option<mpsc::UnboundedReceiver<EngineEvent>>>,
    fatal: watch::Sender<bool>,
    config: Arc<MediaConfig>,
    metrics: ServerMetrics,
}

impl RoomServer {
    /// Boots the media engine worker pool and an empty set of registries.
    ///
    /// # Errors
    /// Returns an error if worker creation fails; that is fatal at startup.
    pub async fn new(config: MediaConfig, metrics: ServerMetrics) -> anyhow::Result<Self> {
        let config = Arc::new(config);
        let (engine, engine_events) = MediaEngine::new(Arc::clone(&config)).await?;
        let (fatal, _) = watch::channel(false);

        Ok(Self {
            rooms: StdRwLock::new(HashMap::new()),
            peers: StdRwLock::new(HashMap::new()),
            transport_index: StdRwLock::new(HashMap::new()),
            engine,
            engine_events: StdMutex::new(Some(engine_events)),
            fatal,
            config,
            metrics,
        })
    }

    /// Resolves true once a media worker has died and the process should
    /// exit after its grace period.
    pub fn fatal_flag(&self) -> watch::Receiver<bool> {
        self.fatal.subscribe()
    }

    /// Registers a peer on signaling-connection accept.
    pub fn register_peer(&self, peer_id: &str, outbox: Outbox) {
        let mut peers = self.peers.write().unwrap_or_else(|e| e.into_inner());
        peers.insert(
            peer_id.to_string(),
            PeerEntry {
                room: None,
                outbox,
            },
        );
        debug!("peer {} registered", peer_id);
    }

    /// Joins a peer into a room, creating the room (and its router) lazily.
    ///
    /// Replies with `video-room-joined` itself, under the room lock: the
    /// payload carries the producers present at the instant of join, and
    /// enqueuing the reply before the lock is released guarantees no later
    /// `new-producer-available` fan-out can overtake it.
    pub async fn join(&self, peer_id: &str, room_id: &str) -> Result<(), SignalError> {
        let outbox = {
            let peers = self.peers.read().unwrap_or_else(|e| e.into_inner());
            let entry = peers.get(peer_id).ok_or_else(|| {
                SignalError::new(ErrorCode::NotJoined, "connection is not registered")
            })?;
            if let Some(current) = &entry.room {
                return Err(SignalError::new(
                    ErrorCode::AlreadyJoined,
                    format!("already a member of room {current}"),
                ));
            }
            entry.outbox.clone()
        };

        loop {
            let room_arc = self.get_or_create_room(room_id).await?;
            let mut room = room_arc.lock().await;
            if room.closed {
                // Lost a race against empty-room teardown; create a fresh room
                drop(room);
                continue;
            }

            let existing_producers = room.existing_producers();
            room.members.insert(
                peer_id.to_string(),
                Member {
                    outbox: outbox.clone(),
                    leaving: false,
                },
            );
            {
                let mut peers = self.peers.write().unwrap_or_else(|e| e.into_inner());
                if let Some(entry) = peers.get_mut(peer_id) {
                    entry.room = Some(room_id.to_string());
                }
            }

            let joined = ServerEvent::VideoRoomJoined {
                router_capabilities: room.router.rtp_capabilities().clone(),
                existing_producers,
            };
            send_event(peer_id, &outbox, &joined);

            let recipients = room.snapshot_other_members(peer_id);
            drop(room);

            fan_out(
                room_id,
                &recipients,
                &ServerEvent::NewPeerJoined {
                    peer_id: peer_id.to_string(),
                },
            );

            self.metrics.bump(Counter::Joins);
            info!("peer {} joined room {}", peer_id, room_id);
            return Ok(());
        }
    }

    /// Leaves a room, reclaiming everything the peer owned in it.
    pub async fn leave(&self, peer_id: &str, room_id: &str) -> Result<ServerEvent, SignalError> {
        let joined = {
            let peers = self.peers.read().unwrap_or_else(|e| e.into_inner());
            peers
                .get(peer_id)
                .is_some_and(|p| p.room.as_deref() == Some(room_id))
        };
        if !joined {
            return Err(SignalError::new(
                ErrorCode::NotJoined,
                format!("not a member of room {room_id}"),
            ));
        }

        self.cleanup_peer(room_id, peer_id).await;

        {
            let mut peers = self.peers.write().unwrap_or_else(|e| e.into_inner());
            if let Some(entry) = peers.get_mut(peer_id) {
                entry.room = None;
            }
        }

        self.metrics.bump(Counter::Leaves);
        Ok(ServerEvent::VideoRoomLeft {
            room_id: room_id.to_string(),
        })
    }

    /// Creates the peer's transport in the given direction (one per
    /// direction per peer).
    pub async fn create_transport(
        &self,
        peer_id: &str,
        room_id: &str,
        direction: Direction,
    ) -> Result<ServerEvent, SignalError> {
        let room_arc = self.member_room(peer_id, room_id)?;
        let mut room = room_arc.lock().await;
        if room.closed || !room.members.contains_key(peer_id) {
            return Err(SignalError::new(
                ErrorCode::NotJoined,
                format!("not a member of room {room_id}"),
            ));
        }
        if room.transport_of(peer_id, direction).is_some() {
            return Err(SignalError::new(
                ErrorCode::DuplicateTransport,
                format!("{direction} transport already exists"),
            ));
        }

        let handle = room
            .router
            .create_webrtc_transport(&self.config.transport)
            .await?;
        let transport_id = handle.id();
        let transport_params = handle.params();

        room.transports.insert(
            transport_id,
            TransportRecord {
                id: transport_id,
                peer_id: peer_id.to_string(),
                room_id: room_id.to_string(),
                direction,
                connected: false,
                handle,
            },
        );
        {
            let mut index = self
                .transport_index
                .write()
                .unwrap_or_else(|e| e.into_inner());
            index.insert(transport_id, (room_id.to_string(), peer_id.to_string()));
        }
        drop(room);

        debug!(
            "created {} transport {} for peer {} in room {}",
            direction, transport_id, peer_id, room_id
        );
        Ok(ServerEvent::TransportCreated {
            direction,
            transport_params,
        })
    }

    /// Completes a transport's DTLS handshake. `connected` flips true
    /// exactly once; retries see `already-connected`.
    pub async fn connect_transport(
        &self,
        peer_id: &str,
        transport_id: TransportId,
        dtls_parameters: DtlsParameters,
    ) -> Result<ServerEvent, SignalError> {
        let (_, room_arc) = self.current_room(peer_id)?;
        let mut room = room_arc.lock().await;

        {
            let record = room.transports.get(&transport_id).ok_or_else(|| {
                SignalError::new(
                    ErrorCode::UnknownTransport,
                    format!("no such transport: {transport_id}"),
                )
            })?;
            if record.peer_id != peer_id {
                return Err(SignalError::new(
                    ErrorCode::NotOwner,
                    format!("transport {transport_id} belongs to another peer"),
                ));
            }
            if record.connected {
                return Err(SignalError::new(
                    ErrorCode::AlreadyConnected,
                    format!("transport {transport_id} is already connected"),
                ));
            }
            timeout(HANDSHAKE_TIMEOUT, record.handle.connect(dtls_parameters)).await??;
        }

        if let Some(record) = room.transports.get_mut(&transport_id) {
            record.connected = true;
        }
        drop(room);

        debug!("connected transport {} for peer {}", transport_id, peer_id);
        Ok(ServerEvent::TransportConnected { transport_id })
    }

    /// Starts a producer on the peer's connected send transport and
    /// advertises it to the rest of the room.
    pub async fn create_producer(
        &self,
        peer_id: &str,
        room_id: &str,
        transport_id: TransportId,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> Result<ServerEvent, SignalError> {
        let room_arc = self.member_room(peer_id, room_id)?;
        let mut room = room_arc.lock().await;

        let handle = {
            let record = room.transports.get(&transport_id).ok_or_else(|| {
                SignalError::new(
                    ErrorCode::UnknownTransport,
                    format!("no such transport: {transport_id}"),
                )
            })?;
            if record.peer_id != peer_id {
                return Err(SignalError::new(
                    ErrorCode::NotOwner,
                    format!("transport {transport_id} belongs to another peer"),
                ));
            }
            if record.direction != Direction::Send {
                return Err(SignalError::new(
                    ErrorCode::WrongDirection,
                    "producers require a send transport",
                ));
            }
            if !record.connected {
                return Err(SignalError::new(
                    ErrorCode::NotConnected,
                    format!("transport {transport_id} is not connected"),
                ));
            }
            if room.producer_of_kind(peer_id, kind).is_some() {
                return Err(SignalError::new(
                    ErrorCode::DuplicateKind,
                    format!("peer already has a live {kind:?} producer"),
                ));
            }
            timeout(HANDSHAKE_TIMEOUT, record.handle.produce(kind, rtp_parameters)).await??
        };

        let producer_id = handle.id();
        room.producers.insert(
            producer_id,
            ProducerRecord {
                id: producer_id,
                peer_id: peer_id.to_string(),
                room_id: room_id.to_string(),
                kind,
                handle,
            },
        );
        let recipients = room.snapshot_other_members(peer_id);
        drop(room);

        fan_out(
            room_id,
            &recipients,
            &ServerEvent::NewProducerAvailable {
                peer_id: peer_id.to_string(),
                producer_id,
                kind,
            },
        );

        self.metrics.bump(Counter::ProducersStarted);
        info!(
            "created {:?} producer {} for peer {} in room {}",
            kind, producer_id, peer_id, room_id
        );
        Ok(ServerEvent::ProducerCreated {
            id: producer_id,
            kind,
        })
    }

    /// Starts a paused consumer for another peer's producer on the peer's
    /// connected recv transport.
    pub async fn create_consumer(
        &self,
        peer_id: &str,
        transport_id: TransportId,
        producer_id: ProducerId,
        rtp_capabilities: RtpCapabilities,
    ) -> Result<ServerEvent, SignalError> {
        let (room_id, room_arc) = self.current_room(peer_id)?;
        let mut room = room_arc.lock().await;

        let handle = {
            let record = room.transports.get(&transport_id).ok_or_else(|| {
                SignalError::new(
                    ErrorCode::UnknownTransport,
                    format!("no such transport: {transport_id}"),
                )
            })?;
            if record.peer_id != peer_id {
                return Err(SignalError::new(
                    ErrorCode::NotOwner,
                    format!("transport {transport_id} belongs to another peer"),
                ));
            }
            if record.direction != Direction::Recv {
                return Err(SignalError::new(
                    ErrorCode::WrongDirection,
                    "consumers require a recv transport",
                ));
            }
            if !record.connected {
                return Err(SignalError::new(
                    ErrorCode::NotConnected,
                    format!("transport {transport_id} is not connected"),
                ));
            }

            let producer = room.producers.get(&producer_id).ok_or_else(|| {
                SignalError::new(
                    ErrorCode::UnknownProducer,
                    format!("no such producer: {producer_id}"),
                )
            })?;
            if producer.peer_id == peer_id {
                return Err(SignalError::new(
                    ErrorCode::CannotConsume,
                    "cannot consume your own producer",
                ));
            }
            if !room.router.can_consume(&producer_id, &rtp_capabilities) {
                return Err(SignalError::new(
                    ErrorCode::CannotConsume,
                    format!("capabilities cannot consume producer {producer_id}"),
                ));
            }
            timeout(
                HANDSHAKE_TIMEOUT,
                record.handle.consume(producer_id, rtp_capabilities),
            )
            .await??
        };

        let consumer_id = handle.id();
        let kind = handle.kind();
        let rtp_parameters = handle.rtp_parameters();
        room.consumers.insert(
            consumer_id,
            ConsumerRecord {
                id: consumer_id,
                peer_id: peer_id.to_string(),
                room_id: room_id.clone(),
                producer_id,
                kind,
                paused: true,
                handle,
            },
        );
        drop(room);

        self.metrics.bump(Counter::ConsumersStarted);
        debug!(
            "created consumer {} (producer {}) for peer {} in room {}",
            consumer_id, producer_id, peer_id, room_id
        );
        Ok(ServerEvent::ConsumerCreated {
            id: consumer_id,
            producer_id,
            kind,
            rtp_parameters,
        })
    }

    /// Unpauses a consumer. A consumer transitions to resumed exactly once
    /// per request; resuming a resumed consumer is an error.
    pub async fn resume_consumer(
        &self,
        peer_id: &str,
        consumer_id: ConsumerId,
    ) -> Result<ServerEvent, SignalError> {
        let (_, room_arc) = self.current_room(peer_id)?;
        let mut room = room_arc.lock().await;

        {
            let record = room.consumers.get(&consumer_id).ok_or_else(|| {
                SignalError::new(
                    ErrorCode::UnknownConsumer,
                    format!("no such consumer: {consumer_id}"),
                )
            })?;
            if record.peer_id != peer_id {
                return Err(SignalError::new(
                    ErrorCode::NotOwner,
                    format!("consumer {consumer_id} belongs to another peer"),
                ));
            }
            if !record.paused {
                return Err(SignalError::new(
                    ErrorCode::AlreadyResumed,
                    format!("consumer {consumer_id} is not paused"),
                ));
            }
            record.handle.resume().await?;
        }

        if let Some(record) = room.consumers.get_mut(&consumer_id) {
            record.paused = false;
        }
        drop(room);

        debug!("resumed consumer {} for peer {}", consumer_id, peer_id);
        Ok(ServerEvent::ConsumerResumed { consumer_id })
    }

    /// Pauses a resumed consumer without closing it.
    pub async fn pause_consumer(
        &self,
        peer_id: &str,
        consumer_id: ConsumerId,
    ) -> Result<ServerEvent, SignalError> {
        let (_, room_arc) = self.current_room(peer_id)?;
        let mut room = room_arc.lock().await;

        {
            let record = room.consumers.get(&consumer_id).ok_or_else(|| {
                SignalError::new(
                    ErrorCode::UnknownConsumer,
                    format!("no such consumer: {consumer_id}"),
                )
            })?;
            if record.peer_id != peer_id {
                return Err(SignalError::new(
                    ErrorCode::NotOwner,
                    format!("consumer {consumer_id} belongs to another peer"),
                ));
            }
            if record.paused {
                return Err(SignalError::new(
                    ErrorCode::AlreadyPaused,
                    format!("consumer {consumer_id} is already paused"),
                ));
            }
            record.handle.pause().await?;
        }

        if let Some(record) = room.consumers.get_mut(&consumer_id) {
            record.paused = true;
        }
        drop(room);

        debug!("paused consumer {} for peer {}", consumer_id, peer_id);
        Ok(ServerEvent::ConsumerPaused { consumer_id })
    }

    /// Closes one of the peer's producers. Downstream consumers are closed
    /// server-side; the rest of the room is told via fan-out.
    pub async fn close_producer(
        &self,
        peer_id: &str,
        room_id: &str,
        producer_id: ProducerId,
    ) -> Result<ServerEvent, SignalError> {
        let room_arc = self.member_room(peer_id, room_id)?;
        let mut room = room_arc.lock().await;

        {
            let record = room.producers.get(&producer_id).ok_or_else(|| {
                SignalError::new(
                    ErrorCode::UnknownProducer,
                    format!("no such producer: {producer_id}"),
                )
            })?;
            if record.peer_id != peer_id {
                return Err(SignalError::new(
                    ErrorCode::NotOwner,
                    format!("producer {producer_id} belongs to another peer"),
                ));
            }
        }

        // Dropping the records closes the engine objects
        room.producers.remove(&producer_id);
        room.consumers.retain(|_, c| c.producer_id != producer_id);

        let recipients = room.snapshot_other_members(peer_id);
        drop(room);

        fan_out(
            room_id,
            &recipients,
            &ServerEvent::ProducerClosed {
                peer_id: Some(peer_id.to_string()),
                producer_id,
            },
        );

        info!(
            "closed producer {} for peer {} in room {}",
            producer_id, peer_id, room_id
        );
        Ok(ServerEvent::ProducerClosed {
            peer_id: None,
            producer_id,
        })
    }

    /// Gets or creates a room. The router is created outside any lock; a
    /// racing creator's router is simply dropped (closed) again.
    async fn get_or_create_room(
        &self,
        room_id: &str,
    ) -> Result<Arc<TokioMutex<Room>>, SignalError> {
        {
            let rooms = self.rooms.read().unwrap_or_else(|e| e.into_inner());
            if let Some(room) = rooms.get(room_id) {
                return Ok(Arc::clone(room));
            }
        }

        info!("creating room {}", room_id);
        let router = self.engine.create_router().await?;

        let mut rooms = self.rooms.write().unwrap_or_else(|e| e.into_inner());
        let room = match rooms.entry(room_id.to_string()) {
            Entry::Occupied(existing) => Arc::clone(existing.get()),
            Entry::Vacant(slot) => {
                self.metrics.bump(Counter::RoomsOpened);
                Arc::clone(slot.insert(Arc::new(TokioMutex::new(Room::new(
                    room_id.to_string(),
                    router,
                )))))
            }
        };
        Ok(room)
    }

    /// Room lookup for events that carry an explicit roomId.
    fn member_room(
        &self,
        peer_id: &str,
        room_id: &str,
    ) -> Result<Arc<TokioMutex<Room>>, SignalError> {
        let room = {
            let rooms = self.rooms.read().unwrap_or_else(|e| e.into_inner());
            rooms.get(room_id).cloned()
        }
        .ok_or_else(|| {
            SignalError::new(ErrorCode::UnknownRoom, format!("no such room: {room_id}"))
        })?;

        let joined = {
            let peers = self.peers.read().unwrap_or_else(|e| e.into_inner());
            peers
                .get(peer_id)
                .is_some_and(|p| p.room.as_deref() == Some(room_id))
        };
        if !joined {
            return Err(SignalError::new(
                ErrorCode::NotJoined,
                format!("not a member of room {room_id}"),
            ));
        }
        Ok(room)
    }

    /// Room lookup for events that reference the peer's current room only.
    fn current_room(&self, peer_id: &str) -> Result<(RoomId, Arc<TokioMutex<Room>>), SignalError> {
        let room_id = {
            let peers = self.peers.read().unwrap_or_else(|e| e.into_inner());
            peers.get(peer_id).and_then(|p| p.room.clone())
        }
        .ok_or_else(|| SignalError::new(ErrorCode::NotJoined, "not in a room"))?;

        let room = {
            let rooms = self.rooms.read().unwrap_or_else(|e| e.into_inner());
            rooms.get(&room_id).cloned()
        }
        .ok_or_else(|| {
            SignalError::new(ErrorCode::UnknownRoom, format!("no such room: {room_id}"))
        })?;

        Ok((room_id, room))
    }

    /// Gracefully shuts down all rooms and drops every engine handle.
    pub async fn shutdown(&self) {
        info!("shutting down all rooms...");

        let all_rooms: Vec<(RoomId, Arc<TokioMutex<Room>>)> = {
            let mut rooms = self.rooms.write().unwrap_or_else(|e| e.into_inner());
            rooms.drain().collect()
        };

        for (room_id, room_arc) in &all_rooms {
            let mut room = room_arc.lock().await;
            room.closed = true;
            let member_count = room.members.len();
            room.consumers.clear();
            room.producers.clear();
            room.transports.clear();
            room.members.clear();
            info!("shut down room {} ({} peers)", room_id, member_count);
        }

        self.transport_index
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        self.peers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .clear();

        info!("all rooms shut down ({} total)", all_rooms.len());
    }

    /// Current room count
    pub fn room_count(&self) -> usize {
        self.rooms.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Current registered peer count
    pub fn peer_count(&self) -> usize {
        self.peers.read().unwrap_or_else(|e| e.into_inner()).len()
    }
}

/// Serialize once, then try_send to every recipient. Fan-out failures are
/// logged and never affect the originating request.
pub(crate) fn fan_out(room_id: &str, recipients: &[(PeerId, Outbox)], event: &ServerEvent) {
    let json = match serde_json::to_string(event) {
        Ok(j) => Arc::new(j),
        Err(e) => {
            warn!("failed to serialize fan-out event: {}", e);
            return;
        }
    };
    for (peer_id, outbox) in recipients {
        match outbox.try_send(Arc::clone(&json)) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(
                    "outbox full for peer {} in room {}, dropping event",
                    peer_id, room_id
                );
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(
                    "outbox closed for peer {} in room {} (disconnected)",
                    peer_id, room_id
                );
            }
        }
    }
}

/// Enqueue a single event on one peer's outbox.
pub(crate) fn send_event(peer_id: &str, outbox: &Outbox, event: &ServerEvent) {
    let json = match serde_json::to_string(event) {
        Ok(j) => Arc::new(j),
        Err(e) => {
            warn!("failed to serialize event for peer {}: {}", peer_id, e);
            return;
        }
    };
    if let Err(e) = outbox.try_send(json) {
        warn!("failed to enqueue event for peer {}: {}", peer_id, e);
    }
}
