use std::net::SocketAddr;
use std::sync::Arc;

use crate::error::{RelayError, Result};
use crate::protocol::header::MessageType;
use crate::protocol::nonce::NonceVerifier;
use crate::protocol::request::RegisterRequest;
use crate::protocol::response::{RegisterResponse, RejectReason};
use crate::server::ServerConfig;
use crate::session::{Session, SessionEvent, SessionRegistry, SessionState};
use crate::transport::{ChannelProvider, Endpoint};

/// Handles inbound registration datagrams.
///
/// Drives the two-step handshake:
///
/// 1. Unknown unit: provision a session, answer `NOT_AUTHORIZED`.
/// 2. Unregistered unit: check the nonce. A match registers the session
///    (`SUCCESS`); a mismatch destroys it (`WRONG_NONCE`).
/// 3. Registered unit: answer `SUCCESS` without touching state.
///
/// Safe to call concurrently, including for the same unit id: creation,
/// transitions and removal are serialized by the registry and the session.
pub struct RegistrationHandler {
    config: Arc<ServerConfig>,
    registry: SessionRegistry,
    channels: Arc<dyn ChannelProvider>,
    /// Endpoint responses are sent from.
    endpoint: Endpoint,
    nonce: NonceVerifier,
}

impl RegistrationHandler {
    pub fn new(
        config: Arc<ServerConfig>,
        registry: SessionRegistry,
        channels: Arc<dyn ChannelProvider>,
        endpoint: Endpoint,
    ) -> Self {
        let nonce = NonceVerifier::new(&config.realm, &config.hash_key);
        RegistrationHandler {
            config,
            registry,
            channels,
            endpoint,
            nonce,
        }
    }

    /// Handle one datagram from `peer` and send the response.
    ///
    /// Returns the response that was sent, or `None` when the datagram was
    /// dropped. Malformed input and internal errors are logged here and never
    /// propagate; a failed send is logged and does not undo state changes.
    pub fn handle(&self, datagram: &[u8], peer: SocketAddr) -> Option<RegisterResponse> {
        let request = match RegisterRequest::parse(datagram, self.config.magic_cookie) {
            Ok(request) => request,
            Err(e) => {
                tracing::warn!(%peer, len = datagram.len(), error = %e, "dropping datagram");
                return None;
            }
        };

        tracing::debug!(
            %peer,
            unit_id = %request.unit_id,
            message_type = %request.header.message_type,
            seq = request.header.sequence,
            "request"
        );

        let response = match self.process(&request) {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!(%peer, unit_id = %request.unit_id, error = %e, "dropping request");
                return None;
            }
        };

        // A unit that declares no listen port is answered where it sent from.
        let port = match request.listen_port {
            0 => peer.port(),
            port => port,
        };
        let dest = SocketAddr::new(peer.ip(), port);

        tracing::debug!(
            %dest,
            unit_id = %request.unit_id,
            status = %response.status,
            reason = response.reason.as_deref().unwrap_or(""),
            "response"
        );

        if let Err(e) = self
            .channels
            .send(&self.endpoint, dest, &response.serialize())
        {
            tracing::warn!(%dest, unit_id = %request.unit_id, error = %e, "failed to send response");
        }

        Some(response)
    }

    fn process(&self, request: &RegisterRequest) -> Result<RegisterResponse> {
        match request.header.message_type {
            MessageType::Register => self.register(request),
            MessageType::Unregister => self.unregister(request),
        }
    }

    fn register(&self, request: &RegisterRequest) -> Result<RegisterResponse> {
        let Some(session) = self.registry.get(&request.unit_id) else {
            return self.first_contact(request);
        };

        match session.state() {
            SessionState::Registered => self.keep_alive(request, &session),
            SessionState::Unregistered => self.authenticate(request, &session),
            // Closed between lookup and here; treat as a new unit.
            SessionState::Closed => self.first_contact(request),
        }
    }

    fn first_contact(&self, request: &RegisterRequest) -> Result<RegisterResponse> {
        match self
            .registry
            .create(&request.unit_id, self.config.control_addr())
        {
            Ok(session) => {
                tracing::info!(
                    unit_id = %request.unit_id,
                    session_id = %session.id,
                    "unit provisioned, awaiting nonce"
                );
            }
            Err(RelayError::SessionExists(_)) => {
                // The unit is retrying; keep its pending session from expiring.
                if let Some(existing) = self.registry.get(&request.unit_id) {
                    existing.touch();
                }
                tracing::debug!(unit_id = %request.unit_id, "concurrent first contact");
            }
            Err(RelayError::PortPoolExhausted) => {
                tracing::warn!(unit_id = %request.unit_id, "port pool exhausted, refusing unit");
                return Ok(self.reject(request, RejectReason::ResourceExhausted));
            }
            Err(e) => return Err(e),
        }
        Ok(self.reject(request, RejectReason::NotAuthorized))
    }

    fn authenticate(
        &self,
        request: &RegisterRequest,
        session: &Arc<Session>,
    ) -> Result<RegisterResponse> {
        if self.nonce.verify(&request.nonce) {
            return match session.transition(SessionEvent::NonceAccepted) {
                Ok(_) => {
                    session.touch();
                    tracing::info!(
                        unit_id = %request.unit_id,
                        session_id = %session.id,
                        "unit registered"
                    );
                    Ok(self.accept(request))
                }
                // A duplicate of this request won the race.
                Err(_) if session.is_registered() => Ok(self.accept(request)),
                Err(e) => Err(e),
            };
        }

        match self.registry.close(session, SessionEvent::NonceRejected) {
            Ok(_) => {
                tracing::warn!(
                    unit_id = %request.unit_id,
                    session_id = %session.id,
                    "wrong nonce, session closed"
                );
                Ok(self.reject(request, RejectReason::WrongNonce))
            }
            // Registered concurrently: registered units are not re-checked.
            Err(_) if session.is_registered() => Ok(self.accept(request)),
            Err(e) => Err(e),
        }
    }

    fn keep_alive(
        &self,
        request: &RegisterRequest,
        session: &Arc<Session>,
    ) -> Result<RegisterResponse> {
        match session.transition(SessionEvent::KeepAlive) {
            Ok(_) => {
                session.touch();
                tracing::trace!(unit_id = %request.unit_id, "keep-alive");
                Ok(self.accept(request))
            }
            Err(_) if session.is_closed() => self.first_contact(request),
            Err(e) => Err(e),
        }
    }

    fn unregister(&self, request: &RegisterRequest) -> Result<RegisterResponse> {
        let session = match self.registry.get(&request.unit_id) {
            Some(session) if session.is_registered() => session,
            _ => return Ok(self.reject(request, RejectReason::NotAuthorized)),
        };

        self.registry.close(&session, SessionEvent::Unregister)?;
        tracing::info!(
            unit_id = %request.unit_id,
            session_id = %session.id,
            "unit unregistered"
        );
        Ok(self.accept(request))
    }

    fn accept(&self, request: &RegisterRequest) -> RegisterResponse {
        RegisterResponse::success(request.header, &self.config.realm)
    }

    fn reject(&self, request: &RegisterRequest, reason: RejectReason) -> RegisterResponse {
        RegisterResponse::not_accepted(request.header, &self.config.realm, reason)
    }
}
