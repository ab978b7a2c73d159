//! SFU Configuration

use crate::rtp::{default_media_codecs, RtpCodecCapability, TransportListenConfig};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr};

/// SFU configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SfuConfig {
    /// Codecs every room router is created with
    pub media_codecs: Vec<RtpCodecCapability>,
    /// Address new transports listen on / announce
    pub listen: TransportListenConfig,
    /// Maximum number of concurrent rooms with a routing context (0 = unlimited)
    pub max_rooms: usize,
    /// Maximum open transports per client (0 = unlimited)
    pub max_transports_per_client: usize,
}

impl Default for SfuConfig {
    fn default() -> Self {
        Self {
            media_codecs: default_media_codecs(),
            listen: TransportListenConfig {
                ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
                announced_ip: None,
            },
            max_rooms: 0,
            max_transports_per_client: 4,
        }
    }
}
