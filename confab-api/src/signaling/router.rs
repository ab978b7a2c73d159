//! Signaling router
//!
//! The single entry point for client messages. Room membership is always
//! resolved from the registry, never taken from the message, and every
//! failure is answered with an `error` event addressed to the requester.

use confab_sfu::{ClientId, MediaEngine, MediaEvent, ProducerInfo, RoomId, SfuError, UserId};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::auth::PublishAuthorizer;
use super::protocol::{
    ClientRequest, ConnectedPayload, ConsumerResumedPayload, IceCandidatePayload,
    ProduceSuccessPayload, ProducersPayload, ProtocolError, Role, RouterCapabilitiesPayload,
    SdpPayload, ServerMessage, TransportConnectedPayload,
};
use crate::registry::{Membership, RegistryError, SessionRegistry};

#[derive(Error, Debug)]
pub enum SignalingError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Media(#[from] SfuError),

    #[error("Join a room first")]
    NotInRoom,

    #[error("Only publishers may produce")]
    NotPublisher,

    #[error("Not allowed to publish in room {0}")]
    PublishDenied(RoomId),
}

impl SignalingError {
    /// Stable error code sent to clients
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Protocol(ProtocolError::UnknownType(_)) => "unknown_type",
            Self::Protocol(_) => "invalid_message",
            Self::Registry(RegistryError::Media(e)) | Self::Media(e) => media_code(e),
            Self::Registry(RegistryError::RoomFull(_)) => "room_full",
            Self::Registry(RegistryError::NotInRoom(_)) | Self::NotInRoom => "not_in_room",
            Self::Registry(RegistryError::NotInSameRoom(_)) => "target_not_in_room",
            Self::Registry(RegistryError::UnknownClient(_)) => "unknown_client",
            Self::NotPublisher => "not_publisher",
            Self::PublishDenied(_) => "publish_denied",
        }
    }
}

fn media_code(error: &SfuError) -> &'static str {
    match error {
        e if e.is_not_found() => "not_found",
        SfuError::CapabilityMismatch(_) => "cannot_consume",
        SfuError::NotOwner { .. } => "forbidden",
        SfuError::InvalidState(_) => "invalid_state",
        SfuError::InvalidParameters(_) => "invalid_parameters",
        SfuError::LimitReached(_) => "limit_reached",
        _ => "media_error",
    }
}

/// Dispatches requests onto the registry and the media engine
pub struct SignalingRouter {
    registry: Arc<SessionRegistry>,
    engine: Arc<MediaEngine>,
    authorizer: Arc<dyn PublishAuthorizer>,
}

impl SignalingRouter {
    pub fn new(
        registry: Arc<SessionRegistry>,
        engine: Arc<MediaEngine>,
        authorizer: Arc<dyn PublishAuthorizer>,
    ) -> Self {
        Self {
            registry,
            engine,
            authorizer,
        }
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    #[must_use]
    pub fn engine(&self) -> &Arc<MediaEngine> {
        &self.engine
    }

    /// Register a new connection and greet it with `connected`
    pub fn connect(
        &self,
        user_id: Option<UserId>,
        sender: mpsc::Sender<ServerMessage>,
    ) -> ClientId {
        let client_id = self.registry.register_client(user_id, sender);
        self.registry.send_to(
            &client_id,
            ServerMessage::Connected(ConnectedPayload {
                client_id: client_id.clone(),
            }),
        );
        client_id
    }

    /// Clean up everything a connection owns. Idempotent.
    pub async fn disconnect(&self, client_id: &ClientId) {
        if let Some(departure) = self.registry.disconnect(client_id).await {
            debug!(
                client_id = %client_id,
                room_id = %departure.room_id,
                room_closed = departure.room_closed,
                "Disconnected client left its room"
            );
        }
    }

    /// Handle one raw text frame from a client
    pub async fn handle_text(&self, client_id: &ClientId, text: &str) {
        match ClientRequest::parse(text) {
            Ok(request) => self.handle_request(client_id, request).await,
            Err(e) => {
                debug!(client_id = %client_id, error = %e, "Rejected client message");
                let request = e.request().map(str::to_string);
                let error = SignalingError::from(e);
                self.registry.send_to(
                    client_id,
                    ServerMessage::error(error.code(), error.to_string(), request.as_deref()),
                );
            }
        }
    }

    pub async fn handle_request(&self, client_id: &ClientId, request: ClientRequest) {
        let kind = request.kind();
        match self.dispatch(client_id, request).await {
            Ok(Some(reply)) => {
                self.registry.send_to(client_id, reply);
            }
            Ok(None) => {}
            Err(e) => {
                warn!(client_id = %client_id, request = kind, error = %e, "Request failed");
                self.registry.send_to(
                    client_id,
                    ServerMessage::error(e.code(), e.to_string(), Some(kind)),
                );
            }
        }
    }

    async fn dispatch(
        &self,
        client_id: &ClientId,
        request: ClientRequest,
    ) -> Result<Option<ServerMessage>, SignalingError> {
        match request {
            ClientRequest::JoinRoom {
                room_id,
                user_id,
                role,
            } => {
                // An identity already bound to the connection wins over the
                // one carried by the request
                let candidate = self
                    .registry
                    .connections()
                    .get(client_id)
                    .and_then(|c| c.user_id)
                    .or_else(|| user_id.clone());
                if role == Role::Publisher
                    && !self.authorizer.can_publish(candidate.as_ref(), &room_id)
                {
                    return Err(SignalingError::PublishDenied(room_id));
                }
                // The registry delivers roomJoined itself
                self.registry
                    .join_room(client_id, &room_id, role, user_id)
                    .await?;
                Ok(None)
            }

            ClientRequest::LeaveRoom => {
                self.registry
                    .leave_room(client_id)
                    .await
                    .ok_or(SignalingError::NotInRoom)?;
                Ok(None)
            }

            ClientRequest::RelaySdp { target_id, sdp } => {
                let message = ServerMessage::Sdp(SdpPayload {
                    from_id: client_id.clone(),
                    sdp,
                });
                self.registry.relay(client_id, &target_id, message).await?;
                Ok(None)
            }

            ClientRequest::RelayIceCandidate {
                target_id,
                candidate,
            } => {
                let message = ServerMessage::IceCandidate(IceCandidatePayload {
                    from_id: client_id.clone(),
                    candidate,
                });
                self.registry.relay(client_id, &target_id, message).await?;
                Ok(None)
            }

            ClientRequest::GetRouterRtpCapabilities => {
                let membership = self.membership(client_id).await?;
                let rtp_capabilities = self.engine.ensure_router(&membership.room_id).await?;
                Ok(Some(ServerMessage::RouterRtpCapabilities(
                    RouterCapabilitiesPayload { rtp_capabilities },
                )))
            }

            ClientRequest::CreateTransport { direction } => {
                let membership = self.membership(client_id).await?;
                let transport = self
                    .engine
                    .create_transport(&membership.room_id, client_id, direction)
                    .await?;
                Ok(Some(ServerMessage::TransportCreated(transport)))
            }

            ClientRequest::ConnectTransport {
                transport_id,
                dtls_parameters,
            } => {
                let membership = self.membership(client_id).await?;
                self.engine
                    .connect_transport(
                        &membership.room_id,
                        client_id,
                        &transport_id,
                        dtls_parameters,
                    )
                    .await?;
                Ok(Some(ServerMessage::TransportConnected(
                    TransportConnectedPayload {
                        transport_id,
                        connected: true,
                    },
                )))
            }

            ClientRequest::Produce {
                transport_id,
                kind,
                rtp_parameters,
                producer_id,
            } => {
                let membership = self.membership(client_id).await?;
                if membership.role != Role::Publisher {
                    return Err(SignalingError::NotPublisher);
                }
                let produced = self
                    .engine
                    .produce(
                        &membership.room_id,
                        client_id,
                        &transport_id,
                        kind,
                        rtp_parameters,
                        producer_id,
                    )
                    .await?;

                let info = ServerMessage::ProducerInfo(ProducerInfo {
                    producer_id: produced.producer_id.clone(),
                    client_id: client_id.clone(),
                    kind,
                });
                let notified = self
                    .registry
                    .broadcast(&membership.room_id, &info, Some(client_id))
                    .await;
                info!(
                    room_id = %membership.room_id,
                    producer_id = %produced.producer_id,
                    others_exist = produced.others_exist,
                    notified,
                    "New producer announced"
                );

                Ok(Some(ServerMessage::ProduceSuccess(ProduceSuccessPayload {
                    producer_id: produced.producer_id,
                    kind,
                    others_exist: produced.others_exist,
                })))
            }

            ClientRequest::Consume {
                transport_id,
                producer_id,
                rtp_capabilities,
            } => {
                let membership = self.membership(client_id).await?;
                let consumer = self
                    .engine
                    .consume(
                        &membership.room_id,
                        client_id,
                        &transport_id,
                        &producer_id,
                        rtp_capabilities,
                    )
                    .await?;
                Ok(Some(ServerMessage::ConsumeSuccess(consumer)))
            }

            ClientRequest::ResumeConsumer { consumer_id } => {
                let membership = self.membership(client_id).await?;
                self.engine
                    .resume_consumer(&membership.room_id, client_id, &consumer_id)
                    .await?;
                Ok(Some(ServerMessage::ConsumerResumed(ConsumerResumedPayload {
                    consumer_id,
                    resumed: true,
                })))
            }

            ClientRequest::CloseProducer { producer_id } => {
                let membership = self.membership(client_id).await?;
                let teardown = self
                    .engine
                    .close_producer(&membership.room_id, client_id, &producer_id)
                    .await?;
                self.registry
                    .publish_teardown(&membership.room_id, &teardown)
                    .await;
                Ok(None)
            }

            ClientRequest::GetProducers => {
                let membership = self.membership(client_id).await?;
                let producers = self.engine.producers(&membership.room_id).await;
                Ok(Some(ServerMessage::Producers(ProducersPayload { producers })))
            }
        }
    }

    async fn membership(&self, client_id: &ClientId) -> Result<Membership, SignalingError> {
        self.registry
            .membership(client_id)
            .await
            .ok_or(SignalingError::NotInRoom)
    }

    /// Forward closes initiated by the media backend to room members
    pub fn spawn_media_event_pump(&self) -> JoinHandle<()> {
        let mut events = self.engine.subscribe();
        let registry = Arc::clone(&self.registry);
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(MediaEvent::Closed { room_id, teardown }) => {
                        registry.publish_teardown(&room_id, &teardown).await;
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Media event pump lagged");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }
}
