//! Media backend abstraction
//!
//! The SFU orchestration never talks to a forwarding engine directly. It goes
//! through [`MediaBackend`], a narrow object-id based interface covering
//! routers, transports, producers and consumers, plus an explicit event
//! subscription for closes the backend initiates on its own (cascades,
//! worker death).
//!
//! Tests mock this trait instead of an engine's callback model.

mod local;

pub use local::{LocalBackend, LocalBackendConfig};

use crate::error::Result;
use crate::rtp::{
    DtlsParameters, IceCandidate, IceParameters, MediaKind, RtpCapabilities, RtpCodecCapability,
    RtpParameters, TransportListenConfig,
};
use crate::types::{ConsumerId, ProducerId, RouterId, TransportId};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// A routing context created by the backend
#[derive(Debug, Clone, PartialEq)]
pub struct RouterHandle {
    pub id: RouterId,
    pub rtp_capabilities: RtpCapabilities,
}

/// Server side of a freshly created WebRTC transport
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportParams {
    pub id: TransportId,
    pub ice_parameters: IceParameters,
    pub ice_candidates: Vec<IceCandidate>,
    pub dtls_parameters: DtlsParameters,
}

/// Server side of a freshly created consumer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerParams {
    pub id: ConsumerId,
    pub producer_id: ProducerId,
    pub kind: MediaKind,
    pub rtp_parameters: RtpParameters,
    pub paused: bool,
}

/// Why the backend closed a consumer on its own
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsumerCloseReason {
    TransportClosed,
    ProducerClosed,
}

/// Lifecycle events emitted by the backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendEvent {
    /// The process-wide media worker is gone; nothing can be recovered
    WorkerDied { reason: String },
    /// A transport closed because its router closed
    TransportClosed { transport_id: TransportId },
    /// A producer closed because its transport closed
    ProducerClosed { producer_id: ProducerId },
    /// A consumer closed because its transport or source producer closed
    ConsumerClosed {
        consumer_id: ConsumerId,
        reason: ConsumerCloseReason,
    },
}

/// Narrow interface onto a selective-forwarding media engine.
///
/// Close operations are idempotent: closing an unknown object is a no-op.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MediaBackend: Send + Sync {
    /// Create a routing context able to forward the given codecs
    async fn create_router(&self, media_codecs: Vec<RtpCodecCapability>) -> Result<RouterHandle>;

    async fn close_router(&self, router_id: &RouterId);

    async fn create_webrtc_transport(
        &self,
        router_id: &RouterId,
        listen: &TransportListenConfig,
    ) -> Result<TransportParams>;

    /// Finish the DTLS handshake setup of a transport
    async fn connect_transport(
        &self,
        transport_id: &TransportId,
        dtls_parameters: DtlsParameters,
    ) -> Result<()>;

    async fn close_transport(&self, transport_id: &TransportId);

    async fn produce(
        &self,
        transport_id: &TransportId,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
        requested_id: Option<ProducerId>,
    ) -> Result<ProducerId>;

    async fn close_producer(&self, producer_id: &ProducerId);

    /// Whether a receiver with `rtp_capabilities` can consume `producer_id`
    fn can_consume(
        &self,
        router_id: &RouterId,
        producer_id: &ProducerId,
        rtp_capabilities: &RtpCapabilities,
    ) -> bool;

    async fn consume(
        &self,
        transport_id: &TransportId,
        producer_id: &ProducerId,
        rtp_capabilities: RtpCapabilities,
        paused: bool,
    ) -> Result<ConsumerParams>;

    async fn resume_consumer(&self, consumer_id: &ConsumerId) -> Result<()>;

    /// Subscribe to backend-initiated lifecycle events
    fn subscribe(&self) -> broadcast::Receiver<BackendEvent>;
}
