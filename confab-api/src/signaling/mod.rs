//! Signaling: wire protocol, request dispatch and the per-connection loop

pub mod auth;
mod connection;
pub mod protocol;
mod router;

pub use auth::{PublishAuthorizer, StaticPublishPolicy};
pub use connection::{ConnectionHandler, StreamMessage};
pub use protocol::{ClientRequest, ProtocolError, Role, ServerMessage};
pub use router::{SignalingError, SignalingRouter};
