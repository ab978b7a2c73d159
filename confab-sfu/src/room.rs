//! Per-room media bookkeeping
//!
//! One `RoomMedia` exists per room that has (or is getting) a routing
//! context. Its state sits behind a single async mutex so every media
//! operation on a room is serialized, including the time spent waiting on
//! the backend.

use crate::backend::RouterHandle;
use crate::error::{Result, SfuError};
use crate::rtp::MediaKind;
use crate::types::{ClientId, ConsumerId, ProducerId, RoomId, RouterId, TransportId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::{Mutex, MutexGuard};

/// Which way media flows on a transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportDirection {
    /// Client sends media to the SFU
    #[serde(alias = "send")]
    Publish,
    /// SFU sends media to the client
    #[serde(alias = "recv")]
    Subscribe,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportState {
    Created,
    Connected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsumerState {
    Paused,
    Resumed,
}

#[derive(Debug, Clone)]
pub struct TransportRecord {
    pub id: TransportId,
    pub client_id: ClientId,
    pub direction: TransportDirection,
    pub state: TransportState,
}

#[derive(Debug, Clone)]
pub struct ProducerRecord {
    pub id: ProducerId,
    pub client_id: ClientId,
    pub transport_id: TransportId,
    pub kind: MediaKind,
}

#[derive(Debug, Clone)]
pub struct ConsumerRecord {
    pub id: ConsumerId,
    pub client_id: ClientId,
    pub transport_id: TransportId,
    pub producer_id: ProducerId,
    pub state: ConsumerState,
}

/// A producer as advertised to room members
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProducerInfo {
    pub producer_id: ProducerId,
    pub client_id: ClientId,
    pub kind: MediaKind,
}

impl From<&ProducerRecord> for ProducerInfo {
    fn from(record: &ProducerRecord) -> Self {
        Self {
            producer_id: record.id.clone(),
            client_id: record.client_id.clone(),
            kind: record.kind,
        }
    }
}

/// A consumer that went away as part of a teardown
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClosedConsumer {
    pub consumer_id: ConsumerId,
    pub client_id: ClientId,
    pub producer_id: ProducerId,
}

/// Everything a close operation removed, so callers can notify clients
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Teardown {
    pub transports: Vec<TransportId>,
    pub producers: Vec<ProducerInfo>,
    pub consumers: Vec<ClosedConsumer>,
}

impl Teardown {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.transports.is_empty() && self.producers.is_empty() && self.consumers.is_empty()
    }
}

#[derive(Default)]
pub(crate) struct RoomMediaState {
    pub(crate) router: Option<RouterHandle>,
    pub(crate) closed: bool,
    pub(crate) transports: HashMap<TransportId, TransportRecord>,
    pub(crate) producers: HashMap<ProducerId, ProducerRecord>,
    pub(crate) consumers: HashMap<ConsumerId, ConsumerRecord>,
}

impl RoomMediaState {
    pub(crate) fn router_id(&self, room_id: &RoomId) -> Result<RouterId> {
        if self.closed {
            return Err(SfuError::RoomClosed(room_id.clone()));
        }
        self.router
            .as_ref()
            .map(|router| router.id.clone())
            .ok_or_else(|| SfuError::RouterNotFound(room_id.clone()))
    }

    /// Look up a transport and check that `client_id` owns it
    pub(crate) fn owned_transport(
        &self,
        client_id: &ClientId,
        transport_id: &TransportId,
    ) -> Result<&TransportRecord> {
        let transport = self
            .transports
            .get(transport_id)
            .ok_or_else(|| SfuError::TransportNotFound(transport_id.clone()))?;
        if &transport.client_id != client_id {
            return Err(SfuError::NotOwner {
                client_id: client_id.clone(),
                transport_id: transport_id.clone(),
            });
        }
        Ok(transport)
    }

    pub(crate) fn transport_count_for(&self, client_id: &ClientId) -> usize {
        self.transports
            .values()
            .filter(|t| &t.client_id == client_id)
            .count()
    }

    pub(crate) fn transports_of(&self, client_id: &ClientId) -> Vec<TransportId> {
        self.transports
            .values()
            .filter(|t| &t.client_id == client_id)
            .map(|t| t.id.clone())
            .collect()
    }

    pub(crate) fn remove_consumer(&mut self, consumer_id: &ConsumerId, teardown: &mut Teardown) {
        if let Some(consumer) = self.consumers.remove(consumer_id) {
            teardown.consumers.push(ClosedConsumer {
                consumer_id: consumer.id,
                client_id: consumer.client_id,
                producer_id: consumer.producer_id,
            });
        }
    }

    /// Drop a producer and every consumer sourced from it
    pub(crate) fn remove_producer(&mut self, producer_id: &ProducerId, teardown: &mut Teardown) {
        let Some(producer) = self.producers.remove(producer_id) else {
            return;
        };
        let fed: Vec<ConsumerId> = self
            .consumers
            .values()
            .filter(|c| &c.producer_id == producer_id)
            .map(|c| c.id.clone())
            .collect();
        for consumer_id in fed {
            self.remove_consumer(&consumer_id, teardown);
        }
        teardown.producers.push(ProducerInfo::from(&producer));
    }

    /// Drop a transport together with the producers and consumers on it
    pub(crate) fn remove_transport(&mut self, transport_id: &TransportId, teardown: &mut Teardown) {
        if self.transports.remove(transport_id).is_none() {
            return;
        }
        let producers: Vec<ProducerId> = self
            .producers
            .values()
            .filter(|p| &p.transport_id == transport_id)
            .map(|p| p.id.clone())
            .collect();
        for producer_id in producers {
            self.remove_producer(&producer_id, teardown);
        }
        let consumers: Vec<ConsumerId> = self
            .consumers
            .values()
            .filter(|c| &c.transport_id == transport_id)
            .map(|c| c.id.clone())
            .collect();
        for consumer_id in consumers {
            self.remove_consumer(&consumer_id, teardown);
        }
        teardown.transports.push(transport_id.clone());
    }

    pub(crate) fn producer_infos(&self) -> Vec<ProducerInfo> {
        let mut infos: Vec<ProducerInfo> = self.producers.values().map(ProducerInfo::from).collect();
        infos.sort_by(|a, b| a.producer_id.cmp(&b.producer_id));
        infos
    }
}

/// Media side of one room
pub struct RoomMedia {
    pub id: RoomId,
    pub created_at: DateTime<Utc>,
    state: Mutex<RoomMediaState>,
}

impl RoomMedia {
    pub(crate) fn new(id: RoomId) -> Self {
        Self {
            id,
            created_at: Utc::now(),
            state: Mutex::new(RoomMediaState::default()),
        }
    }

    pub(crate) async fn lock(&self) -> MutexGuard<'_, RoomMediaState> {
        self.state.lock().await
    }

    pub async fn get_stats(&self) -> RoomStats {
        let state = self.state.lock().await;
        RoomStats {
            has_router: state.router.is_some(),
            transports: state.transports.len(),
            producers: state.producers.len(),
            consumers: state.consumers.len(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RoomStats {
    pub has_router: bool,
    pub transports: usize,
    pub producers: usize,
    pub consumers: usize,
}
