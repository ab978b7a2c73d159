//! Signaling layer of the confab SFU
//!
//! - `signaling`: wire protocol, request dispatch and the per-connection loop
//! - `registry`: live connections and room membership
//! - `http`: axum routes (WebSocket endpoint, health, stats)

pub mod http;
pub mod registry;
pub mod signaling;
