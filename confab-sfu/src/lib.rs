//! Confab SFU media orchestration
//!
//! Rooms get a routing context lazily. Clients attach WebRTC transports to
//! it, publish producers over send transports and pull consumers of other
//! participants' producers over receive transports. Actual packet
//! forwarding is the job of a [`MediaBackend`]; this crate owns the
//! bookkeeping around it.
//!
//! ## Architecture
//!
//! - **`MediaEngine`**: Per-room routing contexts, ownership and cascades
//! - **`MediaBackend`**: Object-id based interface onto a forwarding engine
//! - **`LocalBackend`**: In-process backend with port allocation and codec negotiation
//! - **`rtp`**: RTP capability / parameter types and codec matching
//!
//! ## Usage
//!
//! ```rust,ignore
//! use confab_sfu::{LocalBackend, MediaEngine, SfuConfig, TransportDirection};
//!
//! let backend = Arc::new(LocalBackend::new(Default::default()));
//! let engine = MediaEngine::new(backend, SfuConfig::default());
//! let caps = engine.ensure_router(&room_id).await?;
//! let transport = engine.create_transport(&room_id, &client_id, TransportDirection::Publish).await?;
//! ```

pub mod backend;
mod config;
mod engine;
mod error;
mod room;
pub mod rtp;
mod types;

pub use backend::{
    BackendEvent, ConsumerCloseReason, ConsumerParams, LocalBackend, LocalBackendConfig,
    MediaBackend, RouterHandle, TransportParams,
};
pub use config::SfuConfig;
pub use engine::{
    ConsumerDescriptor, EngineStats, MediaEngine, MediaEvent, Produced, TransportDescriptor,
};
pub use error::{Result, SfuError};
pub use room::{ClosedConsumer, ProducerInfo, RoomStats, Teardown, TransportDirection};
pub use rtp::{MediaKind, RtpCapabilities, RtpParameters};
pub use types::{ClientId, ConsumerId, ProducerId, RoomId, RouterId, TransportId, UserId};
