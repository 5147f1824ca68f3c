//! Per-server connection state machine
//!
//! One `Connection` record exists per KAS server with an outstanding connect
//! request, owned exclusively by the worker. The record walks
//! `Scheduled -> Connecting -> AwaitingRole -> Connected` and drops to
//! `Disconnected` from any state on error or explicit request, after which
//! it is purged once its disconnection notice has been queued.

use std::collections::VecDeque;
use std::fmt;

use futures::future::BoxFuture;
use tokio::io::Interest;
use tokio::net::TcpStream;

use kas_wire::{
    negotiated_minor, ProtocolMessage, TransportFactory, WireMessage, MIN_SUPPORTED_MINOR,
    PROTOCOL_MINOR,
};
use kas_wire::{FrameTransport, LinkRole};

use crate::broker::LinkNotice;
use crate::error::{LinkError, TunnelError};
use crate::server_id::ServerId;
use crate::tunnel::Tunnel;

/// Connection status for a server
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    /// Connect requested, tunnel not yet started
    Scheduled,
    /// Tunnel helper launched, waiting for the loopback accept
    Connecting,
    /// Tunnel up, role-selection command sent, waiting for the reply
    AwaitingRole,
    /// Role granted, traffic flowing
    Connected,
    /// Terminal; purged once the disconnection notice is queued
    Disconnected,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionStatus::Scheduled => write!(f, "scheduled"),
            ConnectionStatus::Connecting => write!(f, "connecting"),
            ConnectionStatus::AwaitingRole => write!(f, "awaiting-role"),
            ConnectionStatus::Connected => write!(f, "connected"),
            ConnectionStatus::Disconnected => write!(f, "disconnected"),
        }
    }
}

/// Activity observed while waiting on a connection
pub(crate) enum ConnEvent {
    /// Tunnel establishment resolved
    Established(Result<TcpStream, TunnelError>),
    /// The transport socket became ready
    SocketReady(std::io::Result<()>),
}

/// Worker-owned state for one server connection
pub(crate) struct Connection {
    server: ServerId,
    status: ConnectionStatus,
    tunnel: Option<Tunnel>,
    transport: Option<Box<dyn FrameTransport>>,
    outbound: VecDeque<ProtocolMessage>,
    negotiated_minor: Option<u16>,
    last_error: Option<String>,
}

impl Connection {
    pub(crate) fn new(server: ServerId) -> Self {
        Self {
            server,
            status: ConnectionStatus::Scheduled,
            tunnel: None,
            transport: None,
            outbound: VecDeque::new(),
            negotiated_minor: None,
            last_error: None,
        }
    }

    pub(crate) fn server(&self) -> &ServerId {
        &self.server
    }

    pub(crate) fn status(&self) -> ConnectionStatus {
        self.status
    }

    /// Whether role negotiation ever completed on this connection.
    ///
    /// Failures before this point count as failed connection attempts for
    /// the consumer's backoff policy.
    pub(crate) fn reached_connected(&self) -> bool {
        self.negotiated_minor.is_some()
    }

    pub(crate) fn outbound_len(&self) -> usize {
        self.outbound.len()
    }

    /// Adopt a freshly started tunnel: `Scheduled -> Connecting`.
    pub(crate) fn set_connecting(&mut self, tunnel: Tunnel) {
        self.tunnel = Some(tunnel);
        self.status = ConnectionStatus::Connecting;
    }

    /// Queue a message for transmission once the link is idle.
    pub(crate) fn enqueue(&mut self, msg: ProtocolMessage) {
        self.outbound.push_back(msg);
    }

    /// Bind the framed transport to the accepted socket and start role
    /// negotiation: `Connecting -> AwaitingRole`.
    pub(crate) fn establish(
        &mut self,
        stream: TcpStream,
        factory: &dyn TransportFactory,
        role: LinkRole,
    ) -> Result<(), LinkError> {
        let mut transport = factory.open(stream);
        transport.send(WireMessage::SelectRole {
            role,
            minor_version: PROTOCOL_MINOR,
        })?;
        transport.begin_receive();
        self.transport = Some(transport);
        self.status = ConnectionStatus::AwaitingRole;
        tracing::debug!("Negotiating {} role with {}", role, self.server);
        Ok(())
    }

    /// The future the worker folds into its readiness set for this
    /// connection, or `None` if there is nothing to wait on.
    ///
    /// Quench suppresses read interest on `Connected` links only: inbound
    /// delivery pauses, role negotiation and outbound sends do not.
    pub(crate) fn wait_activity(&mut self, quenched: bool) -> Option<BoxFuture<'_, ConnEvent>> {
        match self.status {
            ConnectionStatus::Connecting => {
                let tunnel = self.tunnel.as_mut()?;
                Some(Box::pin(async move {
                    ConnEvent::Established(tunnel.wait_established().await)
                }))
            }
            ConnectionStatus::AwaitingRole | ConnectionStatus::Connected => {
                let connected = self.status == ConnectionStatus::Connected;
                let transport = self.transport.as_ref()?;
                let want_write =
                    transport.is_sending() || (connected && !self.outbound.is_empty());
                let want_read = !(quenched && connected);
                let interest = match (want_read, want_write) {
                    (true, true) => Interest::READABLE | Interest::WRITABLE,
                    (true, false) => Interest::READABLE,
                    (false, true) => Interest::WRITABLE,
                    (false, false) => return None,
                };
                let ready = transport.ready(interest);
                Some(Box::pin(async move {
                    ConnEvent::SocketReady(ready.await.map(|_| ()))
                }))
            }
            ConnectionStatus::Scheduled | ConnectionStatus::Disconnected => None,
        }
    }

    /// Perform up to `burst` pump steps on a ready socket.
    ///
    /// Each step opportunistically starts the next queued send when idle,
    /// advances the transport, and dispatches a completed inbound message.
    /// Stops early once a step neither completed a send nor produced a
    /// message.
    pub(crate) fn pump(
        &mut self,
        burst: usize,
        notices: &mut Vec<LinkNotice>,
        inbound: &mut Vec<(ServerId, ProtocolMessage)>,
    ) -> Result<(), LinkError> {
        let Some(transport) = self.transport.as_mut() else {
            return Ok(());
        };

        for _ in 0..burst {
            let mut progressed = false;

            if self.status == ConnectionStatus::Connected && !transport.is_sending() {
                if let Some(msg) = self.outbound.pop_front() {
                    transport.send(WireMessage::Payload(msg))?;
                }
            }

            let was_sending = transport.is_sending();
            transport.pump_transfer()?;
            if was_sending && !transport.is_sending() {
                progressed = true;
            }

            if transport.receive_complete() {
                if let Some(msg) = transport.take_received() {
                    progressed = true;
                    match self.status {
                        ConnectionStatus::AwaitingRole => match msg {
                            WireMessage::RoleGranted { minor_version } => {
                                if minor_version < MIN_SUPPORTED_MINOR {
                                    return Err(LinkError::IncompatibleServer {
                                        server_minor: minor_version,
                                        min_supported: MIN_SUPPORTED_MINOR,
                                    });
                                }
                                let negotiated = negotiated_minor(minor_version);
                                self.negotiated_minor = Some(negotiated);
                                self.status = ConnectionStatus::Connected;
                                tracing::info!(
                                    "Connected to {} (minor version {})",
                                    self.server,
                                    negotiated
                                );
                                notices.push(LinkNotice::Connected {
                                    server: self.server.clone(),
                                    minor_version: negotiated,
                                });
                            }
                            WireMessage::RoleUpgradeRequired { server_minor } => {
                                return Err(LinkError::UpgradeRequired { server_minor });
                            }
                            WireMessage::RoleDenied { reason } => {
                                return Err(LinkError::RoleDenied(reason));
                            }
                            other => {
                                tracing::warn!(
                                    "Unexpected {} from {} during role negotiation",
                                    other.kind(),
                                    self.server
                                );
                                return Err(LinkError::UnexpectedMessage("role negotiation"));
                            }
                        },
                        ConnectionStatus::Connected => match msg {
                            WireMessage::Payload(p) => {
                                inbound.push((self.server.clone(), p));
                            }
                            other => {
                                tracing::warn!(
                                    "Unexpected {} from connected server {}",
                                    other.kind(),
                                    self.server
                                );
                                return Err(LinkError::UnexpectedMessage("connected session"));
                            }
                        },
                        _ => {}
                    }
                    transport.begin_receive();
                }
            }

            if !progressed {
                break;
            }
        }

        Ok(())
    }

    /// Record the cause of a failure before shutdown.
    pub(crate) fn record_failure(&mut self, err: &LinkError) {
        self.last_error = Some(err.to_string());
    }

    pub(crate) fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Tear the connection down: discard queued messages, drop the
    /// transport, terminate the tunnel, and mark `Disconnected`.
    pub(crate) fn shut_down(&mut self) {
        self.outbound.clear();
        self.transport = None;
        if let Some(tunnel) = self.tunnel.as_mut() {
            tunnel.terminate();
        }
        self.tunnel = None;
        self.status = ConnectionStatus::Disconnected;
    }
}
