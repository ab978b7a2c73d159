//! Media engine - room-scoped orchestration on top of a [`MediaBackend`]
//!
//! This module provides:
//! - Lazy creation of one routing context per room
//! - Transport, producer and consumer lifecycles with ownership checks
//! - Cascading teardown reports for client, transport and room closes
//! - A watcher that turns backend-initiated closes into [`MediaEvent`]s
//! - Fail-fast signalling when the media worker dies

use crate::backend::{BackendEvent, MediaBackend};
use crate::config::SfuConfig;
use crate::error::{Result, SfuError};
use crate::room::{
    ConsumerRecord, ConsumerState, ProducerInfo, ProducerRecord, RoomMedia, RoomMediaState,
    Teardown, TransportDirection, TransportRecord, TransportState,
};
use crate::rtp::{
    DtlsParameters, IceCandidate, IceParameters, MediaKind, RtpCapabilities, RtpParameters,
};
use crate::types::{ClientId, ConsumerId, ProducerId, RoomId, TransportId};
use chrono::Utc;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Weak};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const MEDIA_EVENT_CAPACITY: usize = 256;

/// Transport description handed back to the client that asked for it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportDescriptor {
    pub id: TransportId,
    pub direction: TransportDirection,
    pub ice_parameters: IceParameters,
    pub ice_candidates: Vec<IceCandidate>,
    pub dtls_parameters: DtlsParameters,
}

/// Result of a successful produce
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Produced {
    pub producer_id: ProducerId,
    /// Whether another client already had a producer in the room
    pub others_exist: bool,
}

/// Consumer description handed back to the subscribing client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerDescriptor {
    pub id: ConsumerId,
    pub producer_id: ProducerId,
    pub kind: MediaKind,
    pub rtp_parameters: RtpParameters,
    pub paused: bool,
}

/// Closes the engine learned about from the backend rather than a request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaEvent {
    Closed { room_id: RoomId, teardown: Teardown },
}

/// Engine-wide counters
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct EngineStats {
    pub rooms: usize,
    pub transports: usize,
    pub producers: usize,
    pub consumers: usize,
}

/// Media engine - owns every room's routing context and media objects
pub struct MediaEngine {
    backend: Arc<dyn MediaBackend>,
    config: Arc<SfuConfig>,

    /// Rooms with (or acquiring) a routing context
    rooms: DashMap<RoomId, Arc<RoomMedia>>,

    events: broadcast::Sender<MediaEvent>,

    /// Cancelled once the backend reports its worker is gone
    worker_failure: CancellationToken,
}

impl MediaEngine {
    /// Create a new engine and start watching backend events
    pub fn new(backend: Arc<dyn MediaBackend>, config: SfuConfig) -> Arc<Self> {
        let backend_events = backend.subscribe();
        let (events, _) = broadcast::channel(MEDIA_EVENT_CAPACITY);
        let engine = Arc::new(Self {
            backend,
            config: Arc::new(config),
            rooms: DashMap::new(),
            events,
            worker_failure: CancellationToken::new(),
        });

        info!(
            codecs = engine.config.media_codecs.len(),
            listen_ip = %engine.config.listen.ip,
            max_rooms = engine.config.max_rooms,
            "Media engine initialized"
        );

        tokio::spawn(Self::watch_backend(Arc::downgrade(&engine), backend_events));

        engine
    }

    /// Subscribe to closes initiated by the backend
    pub fn subscribe(&self) -> broadcast::Receiver<MediaEvent> {
        self.events.subscribe()
    }

    /// Token cancelled when the media worker dies
    #[must_use]
    pub fn worker_failure(&self) -> CancellationToken {
        self.worker_failure.clone()
    }

    /// Make sure `room_id` has a routing context, returning its capabilities
    pub async fn ensure_router(&self, room_id: &RoomId) -> Result<RtpCapabilities> {
        let room = self.room_or_insert(room_id)?;
        let mut state = room.lock().await;
        if state.closed {
            return Err(SfuError::RoomClosed(room_id.clone()));
        }
        if let Some(router) = &state.router {
            debug!(room_id = %room_id, "Routing context already exists");
            return Ok(router.rtp_capabilities.clone());
        }

        match self.backend.create_router(self.config.media_codecs.clone()).await {
            Ok(router) => {
                info!(room_id = %room_id, router_id = %router.id, "Created routing context");
                let caps = router.rtp_capabilities.clone();
                state.router = Some(router);
                Ok(caps)
            }
            Err(e) => {
                state.closed = true;
                drop(state);
                self.rooms.remove_if(room_id, |_, r| Arc::ptr_eq(r, &room));
                error!(room_id = %room_id, error = %e, "Failed to create routing context");
                Err(e)
            }
        }
    }

    pub async fn create_transport(
        &self,
        room_id: &RoomId,
        client_id: &ClientId,
        direction: TransportDirection,
    ) -> Result<TransportDescriptor> {
        let room = self.room(room_id)?;
        let mut state = room.lock().await;
        let router_id = state.router_id(room_id)?;

        let max = self.config.max_transports_per_client;
        if max > 0 && state.transport_count_for(client_id) >= max {
            warn!(
                room_id = %room_id,
                client_id = %client_id,
                max_transports = max,
                "Transport limit reached"
            );
            return Err(SfuError::LimitReached(format!(
                "at most {max} transports per client"
            )));
        }

        let params = self
            .backend
            .create_webrtc_transport(&router_id, &self.config.listen)
            .await?;
        state.transports.insert(
            params.id.clone(),
            TransportRecord {
                id: params.id.clone(),
                client_id: client_id.clone(),
                direction,
                state: TransportState::Created,
            },
        );

        debug!(
            room_id = %room_id,
            client_id = %client_id,
            transport_id = %params.id,
            ?direction,
            "Created transport"
        );

        Ok(TransportDescriptor {
            id: params.id,
            direction,
            ice_parameters: params.ice_parameters,
            ice_candidates: params.ice_candidates,
            dtls_parameters: params.dtls_parameters,
        })
    }

    pub async fn connect_transport(
        &self,
        room_id: &RoomId,
        client_id: &ClientId,
        transport_id: &TransportId,
        dtls_parameters: DtlsParameters,
    ) -> Result<()> {
        let room = self.room(room_id)?;
        let mut state = room.lock().await;
        state.router_id(room_id)?;
        if state.owned_transport(client_id, transport_id)?.state != TransportState::Created {
            return Err(SfuError::InvalidState(format!(
                "transport {transport_id} is already connected"
            )));
        }

        self.backend
            .connect_transport(transport_id, dtls_parameters)
            .await?;
        if let Some(transport) = state.transports.get_mut(transport_id) {
            transport.state = TransportState::Connected;
        }

        debug!(room_id = %room_id, transport_id = %transport_id, "Transport connected");
        Ok(())
    }

    pub async fn produce(
        &self,
        room_id: &RoomId,
        client_id: &ClientId,
        transport_id: &TransportId,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
        requested_id: Option<ProducerId>,
    ) -> Result<Produced> {
        let room = self.room(room_id)?;
        let mut state = room.lock().await;
        state.router_id(room_id)?;
        let transport = state.owned_transport(client_id, transport_id)?;
        require_usable(transport, TransportDirection::Publish)?;

        if let Some(id) = &requested_id {
            if id.as_str().is_empty() {
                return Err(SfuError::InvalidParameters(
                    "requested producer id is empty".to_string(),
                ));
            }
            if state.producers.contains_key(id) {
                return Err(SfuError::InvalidParameters(format!(
                    "producer id {id} already in use"
                )));
            }
        }

        let others_exist = state.producers.values().any(|p| &p.client_id != client_id);
        let producer_id = self
            .backend
            .produce(transport_id, kind, rtp_parameters, requested_id)
            .await?;
        state.producers.insert(
            producer_id.clone(),
            ProducerRecord {
                id: producer_id.clone(),
                client_id: client_id.clone(),
                transport_id: transport_id.clone(),
                kind,
            },
        );

        info!(
            room_id = %room_id,
            client_id = %client_id,
            producer_id = %producer_id,
            kind = kind.as_str(),
            "Producer created"
        );

        Ok(Produced {
            producer_id,
            others_exist,
        })
    }

    /// Create a paused consumer of `producer_id` on a subscribe transport
    pub async fn consume(
        &self,
        room_id: &RoomId,
        client_id: &ClientId,
        transport_id: &TransportId,
        producer_id: &ProducerId,
        rtp_capabilities: RtpCapabilities,
    ) -> Result<ConsumerDescriptor> {
        let room = self.room(room_id)?;
        let mut state = room.lock().await;
        let router_id = state.router_id(room_id)?;
        let transport = state.owned_transport(client_id, transport_id)?;
        require_usable(transport, TransportDirection::Subscribe)?;

        if !state.producers.contains_key(producer_id) {
            return Err(SfuError::ProducerNotFound(producer_id.clone()));
        }
        if !self
            .backend
            .can_consume(&router_id, producer_id, &rtp_capabilities)
        {
            debug!(
                room_id = %room_id,
                client_id = %client_id,
                producer_id = %producer_id,
                "Receiver cannot decode producer"
            );
            return Err(SfuError::CapabilityMismatch(producer_id.clone()));
        }

        let params = self
            .backend
            .consume(transport_id, producer_id, rtp_capabilities, true)
            .await?;
        state.consumers.insert(
            params.id.clone(),
            ConsumerRecord {
                id: params.id.clone(),
                client_id: client_id.clone(),
                transport_id: transport_id.clone(),
                producer_id: producer_id.clone(),
                state: ConsumerState::Paused,
            },
        );

        debug!(
            room_id = %room_id,
            client_id = %client_id,
            consumer_id = %params.id,
            producer_id = %producer_id,
            "Consumer created"
        );

        Ok(ConsumerDescriptor {
            id: params.id,
            producer_id: params.producer_id,
            kind: params.kind,
            rtp_parameters: params.rtp_parameters,
            paused: true,
        })
    }

    /// Start media flow on a paused consumer. Resuming twice is harmless.
    pub async fn resume_consumer(
        &self,
        room_id: &RoomId,
        client_id: &ClientId,
        consumer_id: &ConsumerId,
    ) -> Result<()> {
        let room = self.room(room_id)?;
        let mut state = room.lock().await;
        let consumer = state
            .consumers
            .get(consumer_id)
            .ok_or_else(|| SfuError::ConsumerNotFound(consumer_id.clone()))?;
        if &consumer.client_id != client_id {
            return Err(SfuError::NotOwner {
                client_id: client_id.clone(),
                transport_id: consumer.transport_id.clone(),
            });
        }
        if consumer.state == ConsumerState::Resumed {
            return Ok(());
        }

        self.backend.resume_consumer(consumer_id).await?;
        if let Some(consumer) = state.consumers.get_mut(consumer_id) {
            consumer.state = ConsumerState::Resumed;
        }
        debug!(room_id = %room_id, consumer_id = %consumer_id, "Consumer resumed");
        Ok(())
    }

    /// Close a producer owned by `client_id` together with its consumers.
    ///
    /// Unknown producers are a no-op.
    pub async fn close_producer(
        &self,
        room_id: &RoomId,
        client_id: &ClientId,
        producer_id: &ProducerId,
    ) -> Result<Teardown> {
        let Some(room) = self.existing_room(room_id) else {
            return Ok(Teardown::default());
        };
        let mut state = room.lock().await;
        let Some(producer) = state.producers.get(producer_id) else {
            return Ok(Teardown::default());
        };
        if &producer.client_id != client_id {
            return Err(SfuError::NotOwner {
                client_id: client_id.clone(),
                transport_id: producer.transport_id.clone(),
            });
        }

        self.backend.close_producer(producer_id).await;
        let mut teardown = Teardown::default();
        state.remove_producer(producer_id, &mut teardown);
        info!(room_id = %room_id, producer_id = %producer_id, "Producer closed");
        Ok(teardown)
    }

    /// Close one transport and everything riding on it. Unknown ids are a no-op.
    pub async fn close_transport(&self, room_id: &RoomId, transport_id: &TransportId) -> Teardown {
        let Some(room) = self.existing_room(room_id) else {
            return Teardown::default();
        };
        let mut state = room.lock().await;
        let mut teardown = Teardown::default();
        self.close_transport_locked(&mut state, transport_id, &mut teardown)
            .await;
        teardown
    }

    /// Close every transport a client holds in a room
    pub async fn close_client(&self, room_id: &RoomId, client_id: &ClientId) -> Teardown {
        let Some(room) = self.existing_room(room_id) else {
            return Teardown::default();
        };
        let mut state = room.lock().await;
        let mut teardown = Teardown::default();
        for transport_id in state.transports_of(client_id) {
            self.close_transport_locked(&mut state, &transport_id, &mut teardown)
                .await;
        }
        if !teardown.is_empty() {
            info!(
                room_id = %room_id,
                client_id = %client_id,
                transports = teardown.transports.len(),
                producers = teardown.producers.len(),
                "Closed client media"
            );
        }
        teardown
    }

    /// Tear down a room: transports first, then the routing context
    pub async fn close_room(&self, room_id: &RoomId) -> Teardown {
        let Some((_, room)) = self.rooms.remove(room_id) else {
            return Teardown::default();
        };
        let mut state = room.lock().await;
        state.closed = true;

        let mut teardown = Teardown::default();
        let transport_ids: Vec<TransportId> = state.transports.keys().cloned().collect();
        for transport_id in transport_ids {
            self.close_transport_locked(&mut state, &transport_id, &mut teardown)
                .await;
        }
        if let Some(router) = state.router.take() {
            self.backend.close_router(&router.id).await;
        }

        info!(
            room_id = %room_id,
            transports = teardown.transports.len(),
            lifetime_secs = (Utc::now() - room.created_at).num_seconds(),
            total_rooms = self.rooms.len(),
            "Closed routing context"
        );
        teardown
    }

    /// Producers currently live in a room
    pub async fn producers(&self, room_id: &RoomId) -> Vec<ProducerInfo> {
        match self.existing_room(room_id) {
            Some(room) => room.lock().await.producer_infos(),
            None => Vec::new(),
        }
    }

    pub async fn has_router(&self, room_id: &RoomId) -> bool {
        match self.existing_room(room_id) {
            Some(room) => room.get_stats().await.has_router,
            None => false,
        }
    }

    #[must_use]
    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    pub async fn get_stats(&self) -> EngineStats {
        let rooms: Vec<Arc<RoomMedia>> = self.rooms.iter().map(|r| Arc::clone(r.value())).collect();
        let mut stats = EngineStats {
            rooms: rooms.len(),
            ..Default::default()
        };
        for room in rooms {
            let room_stats = room.get_stats().await;
            stats.transports += room_stats.transports;
            stats.producers += room_stats.producers;
            stats.consumers += room_stats.consumers;
        }
        stats
    }

    async fn close_transport_locked(
        &self,
        state: &mut RoomMediaState,
        transport_id: &TransportId,
        teardown: &mut Teardown,
    ) {
        if !state.transports.contains_key(transport_id) {
            return;
        }
        self.backend.close_transport(transport_id).await;
        state.remove_transport(transport_id, teardown);
    }

    fn room(&self, room_id: &RoomId) -> Result<Arc<RoomMedia>> {
        self.existing_room(room_id)
            .ok_or_else(|| SfuError::RouterNotFound(room_id.clone()))
    }

    fn existing_room(&self, room_id: &RoomId) -> Option<Arc<RoomMedia>> {
        self.rooms.get(room_id).map(|r| Arc::clone(r.value()))
    }

    fn room_or_insert(&self, room_id: &RoomId) -> Result<Arc<RoomMedia>> {
        if let Some(room) = self.existing_room(room_id) {
            return Ok(room);
        }

        // Enforce room limit (0 = unlimited)
        let current = self.rooms.len();
        if self.config.max_rooms > 0 && current >= self.config.max_rooms {
            warn!(
                current_rooms = current,
                max_rooms = self.config.max_rooms,
                "Room limit reached"
            );
            return Err(SfuError::LimitReached(format!(
                "at most {} rooms",
                self.config.max_rooms
            )));
        }

        let room = self
            .rooms
            .entry(room_id.clone())
            .or_insert_with(|| Arc::new(RoomMedia::new(room_id.clone())));
        Ok(Arc::clone(room.value()))
    }

    async fn watch_backend(engine: Weak<Self>, mut events: broadcast::Receiver<BackendEvent>) {
        loop {
            let event = match events.recv().await {
                Ok(event) => event,
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Media engine lagged behind backend events");
                    continue;
                }
                Err(RecvError::Closed) => break,
            };
            let Some(engine) = engine.upgrade() else {
                break;
            };
            engine.handle_backend_event(event).await;
        }
        debug!("Backend event watcher stopped");
    }

    async fn handle_backend_event(&self, event: BackendEvent) {
        if let BackendEvent::WorkerDied { reason } = &event {
            error!(reason = %reason, "Media worker died");
            self.worker_failure.cancel();
            return;
        }

        let rooms: Vec<Arc<RoomMedia>> = self.rooms.iter().map(|r| Arc::clone(r.value())).collect();
        for room in rooms {
            let mut state = room.lock().await;
            let mut teardown = Teardown::default();
            match &event {
                BackendEvent::TransportClosed { transport_id } => {
                    state.remove_transport(transport_id, &mut teardown);
                }
                BackendEvent::ProducerClosed { producer_id } => {
                    state.remove_producer(producer_id, &mut teardown);
                }
                BackendEvent::ConsumerClosed { consumer_id, .. } => {
                    state.remove_consumer(consumer_id, &mut teardown);
                }
                BackendEvent::WorkerDied { .. } => {}
            }
            drop(state);

            if !teardown.is_empty() {
                debug!(room_id = %room.id, ?event, "Backend closed media objects");
                let _ = self.events.send(MediaEvent::Closed {
                    room_id: room.id.clone(),
                    teardown,
                });
                return;
            }
        }
    }
}

fn require_usable(transport: &TransportRecord, direction: TransportDirection) -> Result<()> {
    if transport.direction != direction {
        return Err(SfuError::InvalidState(format!(
            "transport {} is not a {direction:?} transport",
            transport.id
        )));
    }
    if transport.state != TransportState::Connected {
        return Err(SfuError::InvalidState(format!(
            "transport {} is not connected",
            transport.id
        )));
    }
    Ok(())
}
