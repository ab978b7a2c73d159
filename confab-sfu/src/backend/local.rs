//! In-process media backend
//!
//! Keeps router/transport/producer/consumer objects in memory and performs
//! the negotiation work of a forwarding engine: port allocation, ICE/DTLS
//! parameter generation, codec validation on produce, capability matching on
//! consume and cascading closes. It does not move RTP packets.

use super::{
    BackendEvent, ConsumerCloseReason, ConsumerParams, MediaBackend, RouterHandle, TransportParams,
};
use crate::error::{Result, SfuError};
use crate::rtp::{
    DtlsFingerprint, DtlsParameters, DtlsRole, IceCandidate, IceParameters, IceProtocol, MediaKind,
    RtcpParameters, RtpCapabilities, RtpCodecCapability, RtpCodecParameters, RtpEncodingParameters,
    RtpHeaderExtension, RtpParameters, TransportListenConfig,
};
use crate::types::{ConsumerId, ProducerId, RouterId, TransportId};
use async_trait::async_trait;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::collections::{BTreeSet, HashMap, HashSet};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

const ICE_ALPHABET: [char; 36] = [
    'a', 'b', 'c', 'd', 'e', 'f', 'g', 'h', 'i', 'j', 'k', 'l', 'm', 'n', 'o', 'p', 'q', 'r', 's',
    't', 'u', 'v', 'w', 'x', 'y', 'z', '0', '1', '2', '3', '4', '5', '6', '7', '8', '9',
];

/// First dynamic payload type handed out to codecs without a preference
const FIRST_DYNAMIC_PAYLOAD_TYPE: u8 = 100;

/// Capacity of the backend event channel
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Port range used for transport candidates
#[derive(Debug, Clone)]
pub struct LocalBackendConfig {
    pub rtc_min_port: u16,
    pub rtc_max_port: u16,
}

impl Default for LocalBackendConfig {
    fn default() -> Self {
        Self {
            rtc_min_port: 40000,
            rtc_max_port: 49999,
        }
    }
}

struct RouterEntry {
    rtp_capabilities: RtpCapabilities,
    transports: HashSet<TransportId>,
}

struct TransportEntry {
    router_id: RouterId,
    port: u16,
    connected: bool,
    producers: HashSet<ProducerId>,
    consumers: HashSet<ConsumerId>,
    next_mid: u32,
}

struct ProducerEntry {
    router_id: RouterId,
    transport_id: TransportId,
    kind: MediaKind,
    rtp_parameters: RtpParameters,
    consumers: HashSet<ConsumerId>,
}

struct ConsumerEntry {
    transport_id: TransportId,
    producer_id: ProducerId,
    paused: bool,
}

#[derive(Default)]
struct LocalState {
    routers: HashMap<RouterId, RouterEntry>,
    transports: HashMap<TransportId, TransportEntry>,
    producers: HashMap<ProducerId, ProducerEntry>,
    consumers: HashMap<ConsumerId, ConsumerEntry>,
    used_ports: BTreeSet<u16>,
    next_port: u16,
    dead: bool,
}

/// In-memory [`MediaBackend`] implementation
pub struct LocalBackend {
    config: LocalBackendConfig,
    state: Mutex<LocalState>,
    events: broadcast::Sender<BackendEvent>,
}

impl LocalBackend {
    #[must_use]
    pub fn new(config: LocalBackendConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let state = LocalState {
            next_port: config.rtc_min_port,
            ..Default::default()
        };
        info!(
            rtc_min_port = config.rtc_min_port,
            rtc_max_port = config.rtc_max_port,
            "Local media backend initialized"
        );
        Self {
            config,
            state: Mutex::new(state),
            events,
        }
    }

    /// Simulate an unrecoverable worker failure
    pub fn kill(&self, reason: impl Into<String>) {
        let reason = reason.into();
        self.state.lock().dead = true;
        warn!(reason = %reason, "Media worker died");
        let _ = self.events.send(BackendEvent::WorkerDied { reason });
    }

    /// Simulate a transport failing underneath its owner (ICE or DTLS loss)
    pub fn fail_transport(&self, transport_id: &TransportId) {
        let mut cascaded = Vec::new();
        if !Self::remove_transport(&mut self.state.lock(), transport_id, &mut cascaded) {
            return;
        }
        warn!(transport_id = %transport_id, "Transport failed");
        self.emit(BackendEvent::TransportClosed {
            transport_id: transport_id.clone(),
        });
        for event in cascaded {
            self.emit(event);
        }
    }

    fn emit(&self, event: BackendEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    fn ensure_alive(state: &LocalState) -> Result<()> {
        if state.dead {
            return Err(SfuError::Backend("media worker is not running".to_string()));
        }
        Ok(())
    }

    fn allocate_port(&self, state: &mut LocalState) -> Result<u16> {
        let min = self.config.rtc_min_port;
        let max = self.config.rtc_max_port;
        let span = u32::from(max.saturating_sub(min)) + 1;
        let mut candidate = state.next_port;

        for _ in 0..span {
            if candidate < min || candidate > max {
                candidate = min;
            }
            if state.used_ports.insert(candidate) {
                state.next_port = if candidate == max { min } else { candidate + 1 };
                return Ok(candidate);
            }
            candidate = if candidate == max { min } else { candidate + 1 };
        }

        Err(SfuError::Backend(format!("no free RTC port in {min}-{max}")))
    }

    /// Remove a consumer; returns it if it existed
    fn remove_consumer(state: &mut LocalState, consumer_id: &ConsumerId) -> Option<ConsumerEntry> {
        let consumer = state.consumers.remove(consumer_id)?;
        if let Some(transport) = state.transports.get_mut(&consumer.transport_id) {
            transport.consumers.remove(consumer_id);
        }
        if let Some(producer) = state.producers.get_mut(&consumer.producer_id) {
            producer.consumers.remove(consumer_id);
        }
        Some(consumer)
    }

    /// Remove a producer and every consumer fed by it
    fn remove_producer(
        state: &mut LocalState,
        producer_id: &ProducerId,
        cascaded: &mut Vec<BackendEvent>,
    ) -> bool {
        let Some(producer) = state.producers.remove(producer_id) else {
            return false;
        };
        if let Some(transport) = state.transports.get_mut(&producer.transport_id) {
            transport.producers.remove(producer_id);
        }
        for consumer_id in producer.consumers {
            if Self::remove_consumer(state, &consumer_id).is_some() {
                cascaded.push(BackendEvent::ConsumerClosed {
                    consumer_id,
                    reason: ConsumerCloseReason::ProducerClosed,
                });
            }
        }
        true
    }

    /// Remove a transport with its producers and consumers
    fn remove_transport(
        state: &mut LocalState,
        transport_id: &TransportId,
        cascaded: &mut Vec<BackendEvent>,
    ) -> bool {
        let Some(transport) = state.transports.remove(transport_id) else {
            return false;
        };
        state.used_ports.remove(&transport.port);
        if let Some(router) = state.routers.get_mut(&transport.router_id) {
            router.transports.remove(transport_id);
        }
        for producer_id in transport.producers {
            if Self::remove_producer(state, &producer_id, cascaded) {
                cascaded.push(BackendEvent::ProducerClosed { producer_id });
            }
        }
        for consumer_id in transport.consumers {
            if Self::remove_consumer(state, &consumer_id).is_some() {
                cascaded.push(BackendEvent::ConsumerClosed {
                    consumer_id,
                    reason: ConsumerCloseReason::TransportClosed,
                });
            }
        }
        true
    }

    fn random_fingerprint() -> String {
        let digest = Sha256::digest(uuid::Uuid::new_v4().as_bytes());
        digest
            .iter()
            .map(|b| format!("{b:02X}"))
            .collect::<Vec<_>>()
            .join(":")
    }

    fn random_ssrc() -> u32 {
        let bytes = uuid::Uuid::new_v4().into_bytes();
        u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]).max(1)
    }
}

/// Build router capabilities from the configured codecs, assigning dynamic
/// payload types to codecs that do not ask for one
fn router_capabilities(media_codecs: Vec<RtpCodecCapability>) -> Result<RtpCapabilities> {
    if media_codecs.is_empty() {
        return Err(SfuError::InvalidParameters("router needs at least one codec".to_string()));
    }

    let mut taken: HashSet<u8> = media_codecs
        .iter()
        .filter_map(|c| c.preferred_payload_type)
        .collect();
    let mut next_pt = FIRST_DYNAMIC_PAYLOAD_TYPE;

    let mut codecs = Vec::with_capacity(media_codecs.len());
    for mut codec in media_codecs {
        if MediaKind::from_mime_type(&codec.mime_type) != Some(codec.kind) {
            return Err(SfuError::InvalidParameters(format!(
                "codec {} does not match kind {}",
                codec.mime_type,
                codec.kind.as_str()
            )));
        }
        if codec.preferred_payload_type.is_none() {
            while taken.contains(&next_pt) {
                next_pt = next_pt
                    .checked_add(1)
                    .filter(|pt| *pt <= 127)
                    .ok_or_else(|| SfuError::InvalidParameters("out of payload types".to_string()))?;
            }
            taken.insert(next_pt);
            codec.preferred_payload_type = Some(next_pt);
        }
        codecs.push(codec);
    }

    let header_extensions = vec![
        RtpHeaderExtension {
            kind: MediaKind::Audio,
            uri: "urn:ietf:params:rtp-hdrext:sdes:mid".to_string(),
            preferred_id: 1,
        },
        RtpHeaderExtension {
            kind: MediaKind::Video,
            uri: "urn:ietf:params:rtp-hdrext:sdes:mid".to_string(),
            preferred_id: 1,
        },
        RtpHeaderExtension {
            kind: MediaKind::Video,
            uri: "http://www.webrtc.org/experiments/rtp-hdrext/abs-send-time".to_string(),
            preferred_id: 4,
        },
    ];

    Ok(RtpCapabilities {
        codecs,
        header_extensions,
    })
}

/// Consumable codecs of a producer for a given receiver, rewritten to the
/// receiver's payload types. Empty when the receiver cannot decode the
/// producer's primary codec.
fn consumer_codecs(
    producer: &RtpParameters,
    router_caps: &RtpCapabilities,
    receiver_caps: &RtpCapabilities,
) -> Vec<RtpCodecParameters> {
    let decodable = producer
        .primary_codec()
        .is_some_and(|primary| receiver_caps.find_codec(primary).is_some());
    if !decodable {
        return Vec::new();
    }

    producer
        .codecs
        .iter()
        .filter(|codec| router_caps.find_codec(codec).is_some())
        .filter_map(|codec| {
            let receiver_codec = receiver_caps.find_codec(codec)?;
            Some(RtpCodecParameters {
                payload_type: receiver_codec
                    .preferred_payload_type
                    .unwrap_or(codec.payload_type),
                rtcp_feedback: receiver_codec.rtcp_feedback.clone(),
                ..codec.clone()
            })
        })
        .collect()
}

#[async_trait]
impl MediaBackend for LocalBackend {
    async fn create_router(&self, media_codecs: Vec<RtpCodecCapability>) -> Result<RouterHandle> {
        let mut state = self.state.lock();
        Self::ensure_alive(&state)?;

        let rtp_capabilities = router_capabilities(media_codecs)?;
        let id = RouterId::generate();
        state.routers.insert(
            id.clone(),
            RouterEntry {
                rtp_capabilities: rtp_capabilities.clone(),
                transports: HashSet::new(),
            },
        );
        debug!(router_id = %id, "Router created");

        Ok(RouterHandle {
            id,
            rtp_capabilities,
        })
    }

    async fn close_router(&self, router_id: &RouterId) {
        let mut cascaded = Vec::new();
        {
            let mut state = self.state.lock();
            let Some(router) = state.routers.remove(router_id) else {
                return;
            };
            for transport_id in router.transports {
                if Self::remove_transport(&mut state, &transport_id, &mut cascaded) {
                    cascaded.push(BackendEvent::TransportClosed { transport_id });
                }
            }
        }
        debug!(router_id = %router_id, cascaded = cascaded.len(), "Router closed");
        for event in cascaded {
            self.emit(event);
        }
    }

    async fn create_webrtc_transport(
        &self,
        router_id: &RouterId,
        listen: &TransportListenConfig,
    ) -> Result<TransportParams> {
        let mut state = self.state.lock();
        Self::ensure_alive(&state)?;
        if !state.routers.contains_key(router_id) {
            return Err(SfuError::Backend(format!("router {router_id} not found")));
        }

        let port = self.allocate_port(&mut state)?;
        let id = TransportId::generate();
        let ip = listen.announced_ip.unwrap_or(listen.ip);

        if let Some(router) = state.routers.get_mut(router_id) {
            router.transports.insert(id.clone());
        }
        state.transports.insert(
            id.clone(),
            TransportEntry {
                router_id: router_id.clone(),
                port,
                connected: false,
                producers: HashSet::new(),
                consumers: HashSet::new(),
                next_mid: 0,
            },
        );
        debug!(transport_id = %id, port, "Transport created");

        Ok(TransportParams {
            id,
            ice_parameters: IceParameters {
                username_fragment: nanoid::nanoid!(16, &ICE_ALPHABET),
                password: nanoid::nanoid!(32, &ICE_ALPHABET),
                ice_lite: true,
            },
            ice_candidates: vec![
                IceCandidate {
                    foundation: "udpcandidate".to_string(),
                    priority: 1_076_302_079,
                    ip,
                    protocol: IceProtocol::Udp,
                    port,
                    candidate_type: "host".to_string(),
                    tcp_type: None,
                },
                IceCandidate {
                    foundation: "tcpcandidate".to_string(),
                    priority: 1_076_276_479,
                    ip,
                    protocol: IceProtocol::Tcp,
                    port,
                    candidate_type: "host".to_string(),
                    tcp_type: Some("passive".to_string()),
                },
            ],
            dtls_parameters: DtlsParameters {
                role: DtlsRole::Auto,
                fingerprints: vec![DtlsFingerprint {
                    algorithm: "sha-256".to_string(),
                    value: Self::random_fingerprint(),
                }],
            },
        })
    }

    async fn connect_transport(
        &self,
        transport_id: &TransportId,
        dtls_parameters: DtlsParameters,
    ) -> Result<()> {
        let mut state = self.state.lock();
        Self::ensure_alive(&state)?;
        let transport = state
            .transports
            .get_mut(transport_id)
            .ok_or_else(|| SfuError::TransportNotFound(transport_id.clone()))?;

        if transport.connected {
            return Err(SfuError::InvalidState("connect() already called".to_string()));
        }
        if dtls_parameters.fingerprints.is_empty() {
            return Err(SfuError::InvalidParameters("missing DTLS fingerprints".to_string()));
        }
        if dtls_parameters
            .fingerprints
            .iter()
            .any(|f| f.algorithm.is_empty() || f.value.is_empty())
        {
            return Err(SfuError::InvalidParameters("malformed DTLS fingerprint".to_string()));
        }

        transport.connected = true;
        debug!(transport_id = %transport_id, role = ?dtls_parameters.role, "Transport connected");
        Ok(())
    }

    async fn close_transport(&self, transport_id: &TransportId) {
        let mut cascaded = Vec::new();
        let removed = Self::remove_transport(&mut self.state.lock(), transport_id, &mut cascaded);
        if removed {
            debug!(transport_id = %transport_id, "Transport closed");
        }
        for event in cascaded {
            self.emit(event);
        }
    }

    async fn produce(
        &self,
        transport_id: &TransportId,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
        requested_id: Option<ProducerId>,
    ) -> Result<ProducerId> {
        let mut state = self.state.lock();
        Self::ensure_alive(&state)?;

        let transport = state
            .transports
            .get(transport_id)
            .ok_or_else(|| SfuError::TransportNotFound(transport_id.clone()))?;
        if !transport.connected {
            return Err(SfuError::InvalidState("transport not connected".to_string()));
        }
        let router_id = transport.router_id.clone();
        let router_caps = &state
            .routers
            .get(&router_id)
            .ok_or_else(|| SfuError::Backend(format!("router {router_id} not found")))?
            .rtp_capabilities;

        let primary = rtp_parameters
            .primary_codec()
            .ok_or_else(|| SfuError::InvalidParameters("rtpParameters has no codecs".to_string()))?;
        if MediaKind::from_mime_type(&primary.mime_type) != Some(kind) {
            return Err(SfuError::InvalidParameters(format!(
                "codec {} does not match kind {}",
                primary.mime_type,
                kind.as_str()
            )));
        }
        if let Some(unsupported) = rtp_parameters
            .codecs
            .iter()
            .find(|codec| router_caps.find_codec(codec).is_none())
        {
            return Err(SfuError::InvalidParameters(format!(
                "unsupported codec {}/{}",
                unsupported.mime_type, unsupported.clock_rate
            )));
        }

        let id = requested_id.unwrap_or_else(ProducerId::generate);
        if state.producers.contains_key(&id) {
            return Err(SfuError::InvalidParameters(format!("producer id {id} already in use")));
        }

        if let Some(transport) = state.transports.get_mut(transport_id) {
            transport.producers.insert(id.clone());
        }
        state.producers.insert(
            id.clone(),
            ProducerEntry {
                router_id,
                transport_id: transport_id.clone(),
                kind,
                rtp_parameters,
                consumers: HashSet::new(),
            },
        );
        debug!(producer_id = %id, kind = kind.as_str(), "Producer created");
        Ok(id)
    }

    async fn close_producer(&self, producer_id: &ProducerId) {
        let mut cascaded = Vec::new();
        Self::remove_producer(&mut self.state.lock(), producer_id, &mut cascaded);
        for event in cascaded {
            self.emit(event);
        }
    }

    fn can_consume(
        &self,
        router_id: &RouterId,
        producer_id: &ProducerId,
        rtp_capabilities: &RtpCapabilities,
    ) -> bool {
        let state = self.state.lock();
        let Some(producer) = state.producers.get(producer_id) else {
            return false;
        };
        if &producer.router_id != router_id {
            return false;
        }
        let Some(router) = state.routers.get(router_id) else {
            return false;
        };
        !consumer_codecs(&producer.rtp_parameters, &router.rtp_capabilities, rtp_capabilities)
            .is_empty()
    }

    async fn consume(
        &self,
        transport_id: &TransportId,
        producer_id: &ProducerId,
        rtp_capabilities: RtpCapabilities,
        paused: bool,
    ) -> Result<ConsumerParams> {
        let mut state = self.state.lock();
        Self::ensure_alive(&state)?;

        let transport = state
            .transports
            .get(transport_id)
            .ok_or_else(|| SfuError::TransportNotFound(transport_id.clone()))?;
        let producer = state
            .producers
            .get(producer_id)
            .ok_or_else(|| SfuError::ProducerNotFound(producer_id.clone()))?;
        if producer.router_id != transport.router_id {
            return Err(SfuError::ProducerNotFound(producer_id.clone()));
        }
        let router_caps = &state
            .routers
            .get(&transport.router_id)
            .ok_or_else(|| SfuError::Backend(format!("router {} not found", transport.router_id)))?
            .rtp_capabilities;

        let codecs = consumer_codecs(&producer.rtp_parameters, router_caps, &rtp_capabilities);
        if codecs.is_empty() {
            return Err(SfuError::CapabilityMismatch(producer_id.clone()));
        }

        let kind = producer.kind;
        let mid = transport.next_mid;
        let id = ConsumerId::generate();
        let rtp_parameters = RtpParameters {
            mid: Some(mid.to_string()),
            codecs,
            header_extensions: Vec::new(),
            encodings: vec![RtpEncodingParameters {
                ssrc: Some(Self::random_ssrc()),
                ..Default::default()
            }],
            rtcp: RtcpParameters {
                cname: producer.rtp_parameters.rtcp.cname.clone(),
                reduced_size: true,
            },
        };

        if let Some(transport) = state.transports.get_mut(transport_id) {
            transport.next_mid += 1;
            transport.consumers.insert(id.clone());
        }
        if let Some(producer) = state.producers.get_mut(producer_id) {
            producer.consumers.insert(id.clone());
        }
        state.consumers.insert(
            id.clone(),
            ConsumerEntry {
                transport_id: transport_id.clone(),
                producer_id: producer_id.clone(),
                paused,
            },
        );
        debug!(consumer_id = %id, producer_id = %producer_id, paused, "Consumer created");

        Ok(ConsumerParams {
            id,
            producer_id: producer_id.clone(),
            kind,
            rtp_parameters,
            paused,
        })
    }

    async fn resume_consumer(&self, consumer_id: &ConsumerId) -> Result<()> {
        let mut state = self.state.lock();
        Self::ensure_alive(&state)?;
        let consumer = state
            .consumers
            .get_mut(consumer_id)
            .ok_or_else(|| SfuError::ConsumerNotFound(consumer_id.clone()))?;
        if consumer.paused {
            consumer.paused = false;
            debug!(consumer_id = %consumer_id, "Consumer resumed");
        }
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<BackendEvent> {
        self.events.subscribe()
    }
}
