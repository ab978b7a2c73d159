//! SFU error types

use crate::types::{ClientId, ConsumerId, ProducerId, RoomId, TransportId};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SfuError {
    #[error("Room {0} has no routing context")]
    RouterNotFound(RoomId),

    #[error("Transport {0} not found")]
    TransportNotFound(TransportId),

    #[error("Producer {0} not found")]
    ProducerNotFound(ProducerId),

    #[error("Consumer {0} not found")]
    ConsumerNotFound(ConsumerId),

    #[error("Client {client_id} does not own transport {transport_id}")]
    NotOwner {
        client_id: ClientId,
        transport_id: TransportId,
    },

    #[error("Receiver capabilities cannot consume producer {0}")]
    CapabilityMismatch(ProducerId),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),

    #[error("Limit reached: {0}")]
    LimitReached(String),

    #[error("Room {0} is closed")]
    RoomClosed(RoomId),

    #[error("Media backend error: {0}")]
    Backend(String),
}

impl SfuError {
    /// True for errors caused by referencing something that no longer exists
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::RouterNotFound(_)
                | Self::TransportNotFound(_)
                | Self::ProducerNotFound(_)
                | Self::ConsumerNotFound(_)
                | Self::RoomClosed(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, SfuError>;
