//! Connection registry and room directory
//!
//! - `ConnectionRegistry`: live connections and their bounded outbound queues
//! - `SessionRegistry`: room membership, publisher sets and the room lifecycle
//!   coupled to the media engine's routing contexts

mod connection;
mod error;
mod session;

pub use connection::{ClientHandle, ConnectionRegistry};
pub use error::{RegistryError, Result};
pub use session::{Departure, Membership, RegistryStats, SessionRegistry};
