#![forbid(unsafe_code)]

// Media engine adapter: worker pool plus opaque handles for routers,
// transports, producers and consumers. The rest of the crate talks to
// mediasoup exclusively through this module.

use crate::media::config::{MediaConfig, TransportConfig};
use crate::media::types::{MediaError, MediaResult, TransportParams};
use mediasoup::prelude::*;
use mediasoup::worker::WorkerId;
use mediasoup::worker_manager::WorkerManager;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock as StdRwLock};
use tokio::sync::mpsc;
use tracing::{debug, error, info};

/// Notifications pushed up from the engine outside the request/response path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineEvent {
    /// A transport's DTLS association closed underneath us
    TransportDtlsClosed(TransportId),
    /// A worker process died; everything it hosted is gone
    WorkerDied(WorkerId),
}

type WorkerLoadMap = Arc<StdRwLock<HashMap<WorkerId, usize>>>;

/// Fixed pool of mediasoup workers plus router placement.
///
/// Created once at boot; worker creation failure is fatal. Worker death is
/// reported on the engine event channel and treated as fatal upstream.
pub struct MediaEngine {
    workers: Vec<Worker>,
    worker_load: WorkerLoadMap,
    next_worker_idx: AtomicUsize,
    config: Arc<MediaConfig>,
    events: mpsc::UnboundedSender<EngineEvent>,
    // Workers are owned by the manager's channel; keep it alive with the pool
    _manager: WorkerManager,
}

impl MediaEngine {
    /// Starts the worker pool. Returns the engine together with the receiver
    /// for async engine notifications.
    pub async fn new(
        config: Arc<MediaConfig>,
    ) -> MediaResult<(Self, mpsc::UnboundedReceiver<EngineEvent>)> {
        let num_workers = config.worker.num_workers.max(1);
        info!("starting media engine with {} workers", num_workers);

        let manager = WorkerManager::new();
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let mut workers = Vec::with_capacity(num_workers);
        let mut worker_load = HashMap::new();

        for idx in 0..num_workers {
            let worker = manager
                .create_worker(config.worker.to_worker_settings())
                .await
                .map_err(|e| MediaError::Worker(format!("failed to create worker: {e}")))?;
            let worker_id = worker.id();
            debug!("created worker {} (index {})", worker_id, idx);

            worker
                .on_dead({
                    let events = events_tx.clone();
                    move |reason| {
                        error!("worker {} died: {:?}", worker_id, reason);
                        let _ = events.send(EngineEvent::WorkerDied(worker_id));
                    }
                })
                .detach();

            worker_load.insert(worker_id, 0);
            workers.push(worker);
        }

        Ok((
            Self {
                workers,
                worker_load: Arc::new(StdRwLock::new(worker_load)),
                next_worker_idx: AtomicUsize::new(0),
                config,
                events: events_tx,
            },
            events_rx,
        ))
    }

    /// Creates a router on the least loaded worker. One router per room.
    pub async fn create_router(&self) -> MediaResult<RouterHandle> {
        let worker = self.pick_worker()?;
        let worker_id = worker.id();

        let router = worker
            .create_router(self.config.router.to_router_options())
            .await
            .map_err(|e| MediaError::Router(format!("failed to create router: {e}")))?;

        {
            let mut load = self.worker_load.write().unwrap_or_else(|e| e.into_inner());
            if let Some(count) = load.get_mut(&worker_id) {
                *count += 1;
            }
        }
        debug!("created router {} on worker {}", router.id(), worker_id);

        Ok(RouterHandle {
            router,
            worker_id,
            events: self.events.clone(),
            worker_load: Arc::clone(&self.worker_load),
        })
    }

    /// Round-robin worker selection with a load counter per worker.
    /// Relaxed ordering is fine; occasional duplicates only skew placement.
    fn pick_worker(&self) -> MediaResult<&Worker> {
        if self.workers.is_empty() {
            return Err(MediaError::Worker("no workers available".to_string()));
        }
        let idx = self.next_worker_idx.fetch_add(1, Ordering::Relaxed) % self.workers.len();
        Ok(&self.workers[idx])
    }

    /// True while every worker in the pool is still running
    pub fn all_workers_alive(&self) -> bool {
        self.workers.iter().all(|w| !w.closed())
    }
}

/// Per-room router handle. Dropping it closes the engine router.
pub struct RouterHandle {
    router: Router,
    worker_id: WorkerId,
    events: mpsc::UnboundedSender<EngineEvent>,
    worker_load: WorkerLoadMap,
}

impl RouterHandle {
    pub fn id(&self) -> RouterId {
        self.router.id()
    }

    pub fn worker_id(&self) -> WorkerId {
        self.worker_id
    }

    pub fn rtp_capabilities(&self) -> &RtpCapabilitiesFinalized {
        self.router.rtp_capabilities()
    }

    /// Checks codec compatibility before a consume attempt
    pub fn can_consume(&self, producer_id: &ProducerId, rtp_capabilities: &RtpCapabilities) -> bool {
        self.router.can_consume(producer_id, rtp_capabilities)
    }

    /// Creates a WebRTC transport on this router
    pub async fn create_webrtc_transport(
        &self,
        config: &TransportConfig,
    ) -> MediaResult<TransportHandle> {
        let mut options = WebRtcTransportOptions::new(config.listen_infos());
        options.initial_available_outgoing_bitrate = config.initial_available_outgoing_bitrate;

        let transport = self
            .router
            .create_webrtc_transport(options)
            .await
            .map_err(|e| MediaError::Transport(format!("failed to create transport: {e}")))?;

        let transport_id = transport.id();

        transport
            .on_ice_state_change(move |ice_state| {
                debug!("ICE state {:?} on transport {}", ice_state, transport_id);
            })
            .detach();

        transport
            .on_dtls_state_change({
                let events = self.events.clone();
                move |dtls_state| {
                    debug!("DTLS state {:?} on transport {}", dtls_state, transport_id);
                    if dtls_state == DtlsState::Closed {
                        let _ = events.send(EngineEvent::TransportDtlsClosed(transport_id));
                    }
                }
            })
            .detach();

        Ok(TransportHandle { transport })
    }
}

impl Drop for RouterHandle {
    fn drop(&mut self) {
        let mut load = self.worker_load.write().unwrap_or_else(|e| e.into_inner());
        if let Some(count) = load.get_mut(&self.worker_id) {
            *count = count.saturating_sub(1);
        }
        debug!("router {} dropped, closing", self.router.id());
    }
}

/// Handle to one WebRTC transport. Dropping it closes the transport and
/// everything produced or consumed over it.
pub struct TransportHandle {
    transport: WebRtcTransport,
}

impl TransportHandle {
    pub fn id(&self) -> TransportId {
        self.transport.id()
    }

    /// ICE/DTLS parameters the client needs for its side of the handshake
    pub fn params(&self) -> TransportParams {
        TransportParams {
            id: self.transport.id(),
            ice_parameters: self.transport.ice_parameters().clone(),
            ice_candidates: self.transport.ice_candidates().clone(),
            dtls_parameters: self.transport.dtls_parameters(),
        }
    }

    /// Completes the DTLS handshake with the client's parameters
    pub async fn connect(&self, dtls_parameters: DtlsParameters) -> MediaResult<()> {
        self.transport
            .connect(WebRtcTransportRemoteParameters { dtls_parameters })
            .await
            .map_err(|e| MediaError::Transport(format!("failed to connect transport: {e}")))
    }

    /// Starts receiving one media track from the client
    pub async fn produce(
        &self,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> MediaResult<ProducerHandle> {
        let producer = self
            .transport
            .produce(ProducerOptions::new(kind, rtp_parameters))
            .await
            .map_err(|e| MediaError::Producer(format!("failed to produce: {e}")))?;

        let producer_id = producer.id();
        producer
            .on_close(move || {
                debug!("producer {} closed", producer_id);
            })
            .detach();

        Ok(ProducerHandle { producer })
    }

    /// Starts forwarding a producer's track to the client. Consumers are
    /// always created paused; the client resumes once its track is wired up.
    pub async fn consume(
        &self,
        producer_id: ProducerId,
        rtp_capabilities: RtpCapabilities,
    ) -> MediaResult<ConsumerHandle> {
        let mut options = ConsumerOptions::new(producer_id, rtp_capabilities);
        options.paused = true;

        let consumer = self
            .transport
            .consume(options)
            .await
            .map_err(|e| MediaError::Consumer(format!("failed to consume: {e}")))?;

        let consumer_id = consumer.id();
        consumer
            .on_close(move || {
                debug!("consumer {} closed", consumer_id);
            })
            .detach();

        Ok(ConsumerHandle { consumer })
    }
}

/// Handle to one uplink track. Dropping it closes the engine producer.
pub struct ProducerHandle {
    producer: Producer,
}

impl ProducerHandle {
    pub fn id(&self) -> ProducerId {
        self.producer.id()
    }

    pub fn kind(&self) -> MediaKind {
        self.producer.kind()
    }
}

/// Handle to one downlink track. Dropping it closes the engine consumer.
pub struct ConsumerHandle {
    consumer: Consumer,
}

impl ConsumerHandle {
    pub fn id(&self) -> ConsumerId {
        self.consumer.id()
    }

    pub fn producer_id(&self) -> ProducerId {
        self.consumer.producer_id()
    }

    pub fn kind(&self) -> MediaKind {
        self.consumer.kind()
    }

    pub fn rtp_parameters(&self) -> RtpParameters {
        self.consumer.rtp_parameters().clone()
    }

    pub async fn pause(&self) -> MediaResult<()> {
        self.consumer
            .pause()
            .await
            .map_err(|e| MediaError::Consumer(format!("failed to pause consumer: {e}")))
    }

    pub async fn resume(&self) -> MediaResult<()> {
        self.consumer
            .resume()
            .await
            .map_err(|e| MediaError::Consumer(format!("failed to resume consumer: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::config::WorkerConfig;

    fn single_worker_config() -> Arc<MediaConfig> {
        Arc::new(MediaConfig {
            worker: WorkerConfig {
                num_workers: 1,
                ..WorkerConfig::default()
            },
            ..MediaConfig::default()
        })
    }

    #[tokio::test]
    async fn router_lifecycle_tracks_worker_load() {
        let (engine, _events) = MediaEngine::new(single_worker_config()).await.unwrap();
        assert!(engine.all_workers_alive());

        let router = engine.create_router().await.unwrap();
        let worker_id = router.worker_id();
        assert_eq!(
            engine
                .worker_load
                .read()
                .unwrap()
                .get(&worker_id)
                .copied(),
            Some(1)
        );

        drop(router);
        assert_eq!(
            engine
                .worker_load
                .read()
                .unwrap()
                .get(&worker_id)
                .copied(),
            Some(0)
        );
    }

    #[tokio::test]
    async fn transport_params_carry_ice_and_dtls() {
        let (engine, _events) = MediaEngine::new(single_worker_config()).await.unwrap();
        let router = engine.create_router().await.unwrap();
        let transport = router
            .create_webrtc_transport(&engine.config.transport)
            .await
            .unwrap();

        let params = transport.params();
        assert_eq!(params.id, transport.id());
        assert!(!params.ice_candidates.is_empty());
        assert!(!params.dtls_parameters.fingerprints.is_empty());
    }
}
