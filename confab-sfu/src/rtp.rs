//! RTP, ICE and DTLS parameter model
//!
//! These types are what travels between clients and the media backend:
//! - Router capabilities (codecs a room can route)
//! - Receiver capabilities (codecs a subscriber can decode)
//! - Producer/consumer RTP parameters
//! - Transport handshake parameters (ICE + DTLS)
//!
//! Field names follow the usual WebRTC/ORTC camelCase JSON shape so that
//! browser SFU client libraries can exchange them unmodified.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::net::IpAddr;

/// Media kind of a track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

impl MediaKind {
    /// Media kind implied by a codec mime type ("audio/opus" -> audio)
    #[must_use]
    pub fn from_mime_type(mime_type: &str) -> Option<Self> {
        let (kind, _) = mime_type.split_once('/')?;
        match kind.to_ascii_lowercase().as_str() {
            "audio" => Some(Self::Audio),
            "video" => Some(Self::Video),
            _ => None,
        }
    }

    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Audio => "audio",
            Self::Video => "video",
        }
    }
}

/// RTCP feedback mechanism supported by a codec
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtcpFeedback {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub parameter: String,
}

/// A codec a router (or a receiver) is able to handle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpCodecCapability {
    pub kind: MediaKind,
    pub mime_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferred_payload_type: Option<u8>,
    pub clock_rate: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channels: Option<u8>,
    #[serde(default)]
    pub parameters: BTreeMap<String, Value>,
    #[serde(default)]
    pub rtcp_feedback: Vec<RtcpFeedback>,
}

/// RTP header extension advertised by a router
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpHeaderExtension {
    pub kind: MediaKind,
    pub uri: String,
    pub preferred_id: u8,
}

/// Capabilities of a router or of a receiving endpoint
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpCapabilities {
    #[serde(default)]
    pub codecs: Vec<RtpCodecCapability>,
    #[serde(default)]
    pub header_extensions: Vec<RtpHeaderExtension>,
}

/// A codec actually negotiated on a producer or consumer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpCodecParameters {
    pub mime_type: String,
    pub payload_type: u8,
    pub clock_rate: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channels: Option<u8>,
    #[serde(default)]
    pub parameters: BTreeMap<String, Value>,
    #[serde(default)]
    pub rtcp_feedback: Vec<RtcpFeedback>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpEncodingParameters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssrc: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_bitrate: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scalability_mode: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtcpParameters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cname: Option<String>,
    #[serde(default = "default_true")]
    pub reduced_size: bool,
}

const fn default_true() -> bool {
    true
}

/// RTP parameters of a producer (sent by the publisher) or a consumer
/// (computed for the subscriber)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpParameters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mid: Option<String>,
    pub codecs: Vec<RtpCodecParameters>,
    #[serde(default)]
    pub header_extensions: Vec<Value>,
    #[serde(default)]
    pub encodings: Vec<RtpEncodingParameters>,
    #[serde(default)]
    pub rtcp: RtcpParameters,
}

/// Whether two codec descriptions refer to the same codec configuration.
///
/// Mime type (case-insensitive), clock rate and channel count must agree.
/// H.264 additionally requires the same packetization mode.
#[must_use]
#[allow(clippy::too_many_arguments)]
pub fn codecs_match(
    mime_a: &str,
    clock_a: u32,
    channels_a: Option<u8>,
    params_a: &BTreeMap<String, Value>,
    mime_b: &str,
    clock_b: u32,
    channels_b: Option<u8>,
    params_b: &BTreeMap<String, Value>,
) -> bool {
    if !mime_a.eq_ignore_ascii_case(mime_b) || clock_a != clock_b {
        return false;
    }

    if MediaKind::from_mime_type(mime_a) == Some(MediaKind::Audio)
        && channels_a.unwrap_or(1) != channels_b.unwrap_or(1)
    {
        return false;
    }

    if mime_a.eq_ignore_ascii_case("video/h264") {
        let mode = |p: &BTreeMap<String, Value>| {
            p.get("packetization-mode").and_then(Value::as_u64).unwrap_or(0)
        };
        if mode(params_a) != mode(params_b) {
            return false;
        }
    }

    true
}

impl RtpCodecCapability {
    #[must_use]
    pub fn matches_parameters(&self, codec: &RtpCodecParameters) -> bool {
        codecs_match(
            &self.mime_type,
            self.clock_rate,
            self.channels,
            &self.parameters,
            &codec.mime_type,
            codec.clock_rate,
            codec.channels,
            &codec.parameters,
        )
    }

    #[must_use]
    pub fn matches_capability(&self, other: &Self) -> bool {
        codecs_match(
            &self.mime_type,
            self.clock_rate,
            self.channels,
            &self.parameters,
            &other.mime_type,
            other.clock_rate,
            other.channels,
            &other.parameters,
        )
    }
}

impl RtpCapabilities {
    /// Find the capability entry matching a negotiated codec
    #[must_use]
    pub fn find_codec(&self, codec: &RtpCodecParameters) -> Option<&RtpCodecCapability> {
        self.codecs.iter().find(|c| c.matches_parameters(codec))
    }
}

impl RtpParameters {
    /// First media codec, i.e. the one the stream is actually sent with
    #[must_use]
    pub fn primary_codec(&self) -> Option<&RtpCodecParameters> {
        self.codecs.first()
    }
}

/// Default codec set a router is created with
#[must_use]
pub fn default_media_codecs() -> Vec<RtpCodecCapability> {
    vec![
        RtpCodecCapability {
            kind: MediaKind::Audio,
            mime_type: "audio/opus".to_string(),
            preferred_payload_type: None,
            clock_rate: 48000,
            channels: Some(2),
            parameters: BTreeMap::new(),
            rtcp_feedback: vec![RtcpFeedback {
                kind: "transport-cc".to_string(),
                parameter: String::new(),
            }],
        },
        RtpCodecCapability {
            kind: MediaKind::Video,
            mime_type: "video/VP8".to_string(),
            preferred_payload_type: None,
            clock_rate: 90000,
            channels: None,
            parameters: BTreeMap::new(),
            rtcp_feedback: video_feedback(),
        },
        RtpCodecCapability {
            kind: MediaKind::Video,
            mime_type: "video/H264".to_string(),
            preferred_payload_type: None,
            clock_rate: 90000,
            channels: None,
            parameters: BTreeMap::from([
                ("packetization-mode".to_string(), Value::from(1)),
                ("profile-level-id".to_string(), Value::from("42e01f")),
                ("level-asymmetry-allowed".to_string(), Value::from(1)),
            ]),
            rtcp_feedback: video_feedback(),
        },
    ]
}

fn video_feedback() -> Vec<RtcpFeedback> {
    [("nack", ""), ("nack", "pli"), ("ccm", "fir"), ("goog-remb", ""), ("transport-cc", "")]
        .into_iter()
        .map(|(kind, parameter)| RtcpFeedback {
            kind: kind.to_string(),
            parameter: parameter.to_string(),
        })
        .collect()
}

/// ICE credentials of a server-side transport
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceParameters {
    pub username_fragment: String,
    pub password: String,
    pub ice_lite: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IceProtocol {
    Udp,
    Tcp,
}

/// A server-side ICE candidate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub foundation: String,
    pub priority: u32,
    pub ip: IpAddr,
    pub protocol: IceProtocol,
    pub port: u16,
    #[serde(rename = "type")]
    pub candidate_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tcp_type: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DtlsRole {
    #[default]
    Auto,
    Client,
    Server,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DtlsFingerprint {
    pub algorithm: String,
    pub value: String,
}

/// DTLS parameters exchanged during the transport handshake
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DtlsParameters {
    #[serde(default)]
    pub role: DtlsRole,
    pub fingerprints: Vec<DtlsFingerprint>,
}

/// Address configuration for new transports
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportListenConfig {
    pub ip: IpAddr,
    /// Address advertised in candidates when `ip` is not reachable (NAT)
    pub announced_ip: Option<IpAddr>,
}
