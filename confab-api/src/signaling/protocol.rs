//! JSON wire protocol
//!
//! Inbound frames are `{ type, roomId?, userId?, targetId?, data? }`
//! envelopes. They are decoded into a closed [`ClientRequest`] set; anything
//! that does not fit becomes a [`ProtocolError`] which the connection answers
//! with an `error` event instead of closing.
//!
//! Outbound frames are `{ type, data }` with one payload struct per type.

use confab_sfu::rtp::DtlsParameters;
use confab_sfu::{
    ClientId, ConsumerDescriptor, ConsumerId, MediaKind, ProducerId, ProducerInfo, RoomId,
    RtpCapabilities, RtpParameters, TransportDescriptor, TransportDirection, TransportId, UserId,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Role a client takes inside a room
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Publisher,
    #[default]
    Subscriber,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Malformed message: {0}")]
    Malformed(String),

    #[error("Unknown message type: {0}")]
    UnknownType(String),

    #[error("{request} requires {field}")]
    MissingField {
        request: &'static str,
        field: &'static str,
    },

    #[error("Invalid {request} payload: {reason}")]
    InvalidPayload {
        request: &'static str,
        reason: String,
    },
}

impl ProtocolError {
    /// The request type the error belongs to, when it could be determined
    #[must_use]
    pub fn request(&self) -> Option<&str> {
        match self {
            Self::Malformed(_) => None,
            Self::UnknownType(kind) => Some(kind),
            Self::MissingField { request, .. } | Self::InvalidPayload { request, .. } => {
                Some(request)
            }
        }
    }
}

/// Raw inbound envelope
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room_id: Option<RoomId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<UserId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_id: Option<ClientId>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub data: Value,
}

/// Every request a client may send
#[derive(Debug, Clone, PartialEq)]
pub enum ClientRequest {
    JoinRoom {
        room_id: RoomId,
        user_id: Option<UserId>,
        role: Role,
    },
    LeaveRoom,
    RelaySdp {
        target_id: ClientId,
        sdp: Value,
    },
    RelayIceCandidate {
        target_id: ClientId,
        candidate: Value,
    },
    GetRouterRtpCapabilities,
    CreateTransport {
        direction: TransportDirection,
    },
    ConnectTransport {
        transport_id: TransportId,
        dtls_parameters: DtlsParameters,
    },
    Produce {
        transport_id: TransportId,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
        producer_id: Option<ProducerId>,
    },
    Consume {
        transport_id: TransportId,
        producer_id: ProducerId,
        rtp_capabilities: RtpCapabilities,
    },
    ResumeConsumer {
        consumer_id: ConsumerId,
    },
    CloseProducer {
        producer_id: ProducerId,
    },
    GetProducers,
}

#[derive(Deserialize)]
struct JoinRoomData {
    #[serde(default)]
    role: Role,
}

#[derive(Deserialize)]
struct CreateTransportData {
    direction: TransportDirection,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConnectTransportData {
    transport_id: TransportId,
    dtls_parameters: DtlsParameters,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProduceData {
    transport_id: TransportId,
    kind: MediaKind,
    rtp_parameters: RtpParameters,
    #[serde(default)]
    producer_id: Option<ProducerId>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConsumeData {
    transport_id: TransportId,
    producer_id: ProducerId,
    rtp_capabilities: RtpCapabilities,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResumeConsumerData {
    consumer_id: ConsumerId,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CloseProducerData {
    producer_id: ProducerId,
}

/// Decode the `data` member; an absent payload reads as `{}`
fn payload<T: DeserializeOwned>(request: &'static str, data: Value) -> Result<T, ProtocolError> {
    let data = if data.is_null() {
        Value::Object(serde_json::Map::new())
    } else {
        data
    };
    serde_json::from_value(data).map_err(|e| ProtocolError::InvalidPayload {
        request,
        reason: e.to_string(),
    })
}

impl ClientRequest {
    /// Parse one text frame
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let envelope: Envelope =
            serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
        Self::from_envelope(envelope)
    }

    pub fn from_envelope(envelope: Envelope) -> Result<Self, ProtocolError> {
        let Envelope {
            kind,
            room_id,
            user_id,
            target_id,
            data,
        } = envelope;

        let request = match kind.as_str() {
            "joinRoom" => {
                let room_id = room_id
                    .filter(|id| !id.as_str().is_empty())
                    .ok_or(ProtocolError::MissingField {
                        request: "joinRoom",
                        field: "roomId",
                    })?;
                let JoinRoomData { role } = payload("joinRoom", data)?;
                Self::JoinRoom {
                    room_id,
                    user_id,
                    role,
                }
            }
            "leaveRoom" => Self::LeaveRoom,
            "relaySdp" => Self::RelaySdp {
                target_id: target_id.ok_or(ProtocolError::MissingField {
                    request: "relaySdp",
                    field: "targetId",
                })?,
                sdp: non_null("relaySdp", data)?,
            },
            "relayIceCandidate" => Self::RelayIceCandidate {
                target_id: target_id.ok_or(ProtocolError::MissingField {
                    request: "relayIceCandidate",
                    field: "targetId",
                })?,
                candidate: non_null("relayIceCandidate", data)?,
            },
            "getRouterRtpCapabilities" => Self::GetRouterRtpCapabilities,
            "createTransport" => {
                let CreateTransportData { direction } = payload("createTransport", data)?;
                Self::CreateTransport { direction }
            }
            "connectTransport" => {
                let d: ConnectTransportData = payload("connectTransport", data)?;
                Self::ConnectTransport {
                    transport_id: d.transport_id,
                    dtls_parameters: d.dtls_parameters,
                }
            }
            "produce" => {
                let d: ProduceData = payload("produce", data)?;
                if d.producer_id.as_ref().is_some_and(|id| id.as_str().is_empty()) {
                    return Err(ProtocolError::InvalidPayload {
                        request: "produce",
                        reason: "producerId must not be empty".to_string(),
                    });
                }
                Self::Produce {
                    transport_id: d.transport_id,
                    kind: d.kind,
                    rtp_parameters: d.rtp_parameters,
                    producer_id: d.producer_id,
                }
            }
            "consume" => {
                let d: ConsumeData = payload("consume", data)?;
                Self::Consume {
                    transport_id: d.transport_id,
                    producer_id: d.producer_id,
                    rtp_capabilities: d.rtp_capabilities,
                }
            }
            "resumeConsumer" => {
                let d: ResumeConsumerData = payload("resumeConsumer", data)?;
                Self::ResumeConsumer {
                    consumer_id: d.consumer_id,
                }
            }
            "closeProducer" => {
                let d: CloseProducerData = payload("closeProducer", data)?;
                Self::CloseProducer {
                    producer_id: d.producer_id,
                }
            }
            "getProducers" => Self::GetProducers,
            _ => return Err(ProtocolError::UnknownType(kind)),
        };
        Ok(request)
    }

    /// Wire name of the request type
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::JoinRoom { .. } => "joinRoom",
            Self::LeaveRoom => "leaveRoom",
            Self::RelaySdp { .. } => "relaySdp",
            Self::RelayIceCandidate { .. } => "relayIceCandidate",
            Self::GetRouterRtpCapabilities => "getRouterRtpCapabilities",
            Self::CreateTransport { .. } => "createTransport",
            Self::ConnectTransport { .. } => "connectTransport",
            Self::Produce { .. } => "produce",
            Self::Consume { .. } => "consume",
            Self::ResumeConsumer { .. } => "resumeConsumer",
            Self::CloseProducer { .. } => "closeProducer",
            Self::GetProducers => "getProducers",
        }
    }
}

fn non_null(request: &'static str, data: Value) -> Result<Value, ProtocolError> {
    if data.is_null() {
        Err(ProtocolError::MissingField {
            request,
            field: "data",
        })
    } else {
        Ok(data)
    }
}

// ------------------------------------------------------------------
// Outbound payloads
// ------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectedPayload {
    pub client_id: ClientId,
}

/// One room member as seen by other members
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemberInfo {
    pub client_id: ClientId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<UserId>,
    pub role: Role,
}

/// State of a room at the moment a client joined it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomSnapshot {
    pub room_id: RoomId,
    pub client_id: ClientId,
    pub role: Role,
    pub members: Vec<MemberInfo>,
    pub publishers: Vec<ClientId>,
    pub producers: Vec<ProducerInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientLeftPayload {
    pub client_id: ClientId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SdpPayload {
    pub from_id: ClientId,
    pub sdp: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidatePayload {
    pub from_id: ClientId,
    pub candidate: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouterCapabilitiesPayload {
    pub rtp_capabilities: RtpCapabilities,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportConnectedPayload {
    pub transport_id: TransportId,
    pub connected: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProduceSuccessPayload {
    pub producer_id: ProducerId,
    pub kind: MediaKind,
    pub others_exist: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerResumedPayload {
    pub consumer_id: ConsumerId,
    pub resumed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProducerClosedPayload {
    pub producer_id: ProducerId,
    pub client_id: ClientId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerClosedPayload {
    pub consumer_id: ConsumerId,
    pub producer_id: ProducerId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProducersPayload {
    pub producers: Vec<ProducerInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorPayload {
    /// Stable machine-readable error code
    pub code: String,
    pub message: String,
    /// Request type that caused the error
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request: Option<String>,
}

/// Every message the server sends
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "camelCase")]
pub enum ServerMessage {
    Connected(ConnectedPayload),
    RoomJoined(RoomSnapshot),
    ClientJoined(MemberInfo),
    ClientLeft(ClientLeftPayload),
    Sdp(SdpPayload),
    IceCandidate(IceCandidatePayload),
    RouterRtpCapabilities(RouterCapabilitiesPayload),
    TransportCreated(TransportDescriptor),
    TransportConnected(TransportConnectedPayload),
    ProduceSuccess(ProduceSuccessPayload),
    ProducerInfo(ProducerInfo),
    ConsumeSuccess(ConsumerDescriptor),
    ConsumerResumed(ConsumerResumedPayload),
    ProducerClosed(ProducerClosedPayload),
    ConsumerClosed(ConsumerClosedPayload),
    Producers(ProducersPayload),
    Error(ErrorPayload),
}

impl ServerMessage {
    pub fn error(
        code: impl Into<String>,
        message: impl Into<String>,
        request: Option<&str>,
    ) -> Self {
        Self::Error(ErrorPayload {
            code: code.into(),
            message: message.into(),
            request: request.map(str::to_string),
        })
    }

    /// Wire name of the message type
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Connected(_) => "connected",
            Self::RoomJoined(_) => "roomJoined",
            Self::ClientJoined(_) => "clientJoined",
            Self::ClientLeft(_) => "clientLeft",
            Self::Sdp(_) => "sdp",
            Self::IceCandidate(_) => "iceCandidate",
            Self::RouterRtpCapabilities(_) => "routerRtpCapabilities",
            Self::TransportCreated(_) => "transportCreated",
            Self::TransportConnected(_) => "transportConnected",
            Self::ProduceSuccess(_) => "produceSuccess",
            Self::ProducerInfo(_) => "producerInfo",
            Self::ConsumeSuccess(_) => "consumeSuccess",
            Self::ConsumerResumed(_) => "consumerResumed",
            Self::ProducerClosed(_) => "producerClosed",
            Self::ConsumerClosed(_) => "consumerClosed",
            Self::Producers(_) => "producers",
            Self::Error(_) => "error",
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
