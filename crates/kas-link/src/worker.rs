//! Connection worker: the single I/O loop driving every server connection
//!
//! One long-lived task owns all `Connection` records and multiplexes them
//! with a single readiness wait per iteration: the broker wake-up, the
//! cancellation token, the quench timer, every connecting tunnel's
//! establishment future, and every live transport's socket readiness are
//! folded into one `select_all`. Errors are connection-scoped and never
//! unwind the loop; only a mailbox failure is fatal.

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use futures::future::select_all;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use kas_wire::{ProtocolMessage, TransportFactory};

use crate::broker::{Broker, LinkNotice, LinkRequest, Quench};
use crate::config::LinkConfig;
use crate::connection::{ConnEvent, Connection, ConnectionStatus};
use crate::error::{LinkError, TunnelError, WorkerError};
use crate::server_id::ServerId;
use crate::tunnel::Tunnel;

/// Handles to a spawned connection worker
pub struct LinkRuntime {
    /// Mailbox shared with the worker; the consumer side of the core API
    pub broker: Arc<Broker>,
    /// Cancel to stop the worker
    pub cancel: CancellationToken,
    /// The worker task; resolves with the loop-fatal error, if any
    pub handle: JoinHandle<Result<(), WorkerError>>,
}

enum WorkerEvent {
    Wake,
    Cancelled,
    QuenchElapsed,
    TunnelOutcome(ServerId, Result<TcpStream, TunnelError>),
    Readiness(ServerId, std::io::Result<()>),
}

/// The I/O worker. Owns all per-connection state; communicates with the
/// consumer only through the injected broker.
pub struct ConnectionWorker {
    config: LinkConfig,
    factory: Arc<dyn TransportFactory>,
    broker: Arc<Broker>,
    cancel: CancellationToken,
    connections: BTreeMap<ServerId, Connection>,
    notices: Vec<LinkNotice>,
    inbound: Vec<(ServerId, ProtocolMessage)>,
    quench: Quench,
}

impl ConnectionWorker {
    /// Create a worker around an existing broker and cancellation token.
    pub fn new(
        config: LinkConfig,
        factory: Arc<dyn TransportFactory>,
        broker: Arc<Broker>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            config,
            factory,
            broker,
            cancel,
            connections: BTreeMap::new(),
            notices: Vec::new(),
            inbound: Vec::new(),
            quench: Quench::None,
        }
    }

    /// Spawn a worker task with a fresh broker, returning the consumer-side
    /// handles.
    pub fn spawn(config: LinkConfig, factory: Arc<dyn TransportFactory>) -> LinkRuntime {
        let broker = Arc::new(Broker::new(config.quench.clone()));
        let cancel = CancellationToken::new();
        let worker = Self::new(config, factory, Arc::clone(&broker), cancel.clone());
        let handle = tokio::spawn(worker.run());
        LinkRuntime {
            broker,
            cancel,
            handle,
        }
    }

    /// Run the loop until cancelled, the mailbox closes, or a fatal mailbox
    /// error occurs.
    pub async fn run(mut self) -> Result<(), WorkerError> {
        tracing::debug!("Connection worker started");
        loop {
            if self.cancel.is_cancelled() {
                self.shutdown_all();
                return Ok(());
            }

            let intake = self.broker.drain_for_worker()?;
            self.quench = intake.quench;
            if intake.closed {
                tracing::debug!("Mailbox closed, connection worker exiting");
                self.shutdown_all();
                return Ok(());
            }

            self.apply_requests(intake.requests);
            self.route_sends(intake.sends);
            self.start_scheduled().await;
            self.purge_disconnected();

            if self.flush()? {
                // Deliver before blocking so consumer-visible state matches
                // what the readiness set will wait on
                continue;
            }

            match self.next_event().await {
                WorkerEvent::Wake | WorkerEvent::QuenchElapsed | WorkerEvent::Cancelled => {}
                WorkerEvent::TunnelOutcome(server, outcome) => {
                    let result = match outcome {
                        Ok(stream) => match self.connections.get_mut(&server) {
                            Some(conn) => conn.establish(
                                stream,
                                self.factory.as_ref(),
                                self.config.local_role,
                            ),
                            None => Ok(()),
                        },
                        Err(e) => Err(LinkError::Tunnel(e)),
                    };
                    if let Err(err) = result {
                        self.fail_connection(&server, err);
                    }
                }
                WorkerEvent::Readiness(server, outcome) => {
                    let result = match outcome {
                        Ok(()) => match self.connections.get_mut(&server) {
                            Some(conn) => conn.pump(
                                self.config.pump_burst,
                                &mut self.notices,
                                &mut self.inbound,
                            ),
                            None => Ok(()),
                        },
                        Err(e) => Err(LinkError::Transport(e.into())),
                    };
                    if let Err(err) = result {
                        self.fail_connection(&server, err);
                    }
                }
            }
        }
    }

    fn apply_requests(&mut self, requests: Vec<LinkRequest>) {
        for request in requests {
            match request {
                LinkRequest::Connect(server) => {
                    // A record that is merely awaiting purge does not block a
                    // fresh connect cycle
                    if self
                        .connections
                        .get(&server)
                        .is_some_and(|c| c.status() != ConnectionStatus::Disconnected)
                    {
                        tracing::debug!("Connect request for {} already active", server);
                        continue;
                    }
                    tracing::info!("Connect requested for {}", server);
                    self.connections
                        .insert(server.clone(), Connection::new(server));
                }
                LinkRequest::Disconnect(server) => {
                    let Some(conn) = self.connections.get_mut(&server) else {
                        // Bad input never kills the loop
                        tracing::debug!("Disconnect request for unknown server {}", server);
                        continue;
                    };
                    if conn.status() == ConnectionStatus::Disconnected {
                        continue;
                    }
                    let dropped = conn.outbound_len();
                    conn.shut_down();
                    if dropped > 0 {
                        tracing::debug!("Discarded {} queued messages for {}", dropped, server);
                    }
                    tracing::info!("Disconnected from {} on request", server);
                    self.notices.push(LinkNotice::Disconnected {
                        server,
                        error: None,
                        during_connect: false,
                    });
                }
            }
        }
    }

    fn route_sends(&mut self, sends: Vec<(ServerId, ProtocolMessage)>) {
        for (server, msg) in sends {
            match self.connections.get_mut(&server) {
                Some(conn) if conn.status() == ConnectionStatus::Connected => {
                    conn.enqueue(msg);
                }
                _ => {
                    tracing::trace!("Dropping message {} for {}: not connected", msg.id, server);
                }
            }
        }
    }

    async fn start_scheduled(&mut self) {
        let mut failed = Vec::new();
        for (server, conn) in self.connections.iter_mut() {
            if conn.status() != ConnectionStatus::Scheduled {
                continue;
            }
            match Tunnel::begin_connect(server.clone(), &self.config.helper).await {
                Ok(tunnel) => conn.set_connecting(tunnel),
                Err(e) => failed.push((server.clone(), LinkError::Tunnel(e))),
            }
        }
        for (server, err) in failed {
            self.fail_connection(&server, err);
        }
    }

    fn fail_connection(&mut self, server: &ServerId, err: LinkError) {
        let Some(conn) = self.connections.get_mut(server) else {
            return;
        };
        if conn.status() == ConnectionStatus::Disconnected {
            return;
        }
        let during_connect = !conn.reached_connected();
        tracing::warn!("Connection to {} failed: {}", server, err);
        conn.record_failure(&err);
        conn.shut_down();
        self.notices.push(LinkNotice::Disconnected {
            server: server.clone(),
            error: Some(err),
            during_connect,
        });
    }

    fn purge_disconnected(&mut self) {
        self.connections.retain(|server, conn| {
            if conn.status() == ConnectionStatus::Disconnected {
                tracing::debug!(
                    "Purging connection record for {} ({})",
                    server,
                    conn.last_error().unwrap_or("no error")
                );
                false
            } else {
                true
            }
        });
    }

    /// Hand staged notices and data to the consumer. Returns whether
    /// anything was delivered.
    fn flush(&mut self) -> Result<bool, WorkerError> {
        if self.notices.is_empty() && self.inbound.is_empty() {
            return Ok(false);
        }
        let notices = std::mem::take(&mut self.notices);
        let data = std::mem::take(&mut self.inbound);
        self.quench = self.broker.deliver_from_worker(notices, data)?;
        Ok(true)
    }

    /// The single blocking point of the loop: one wait over every source of
    /// progress.
    async fn next_event(&mut self) -> WorkerEvent {
        let broker = Arc::clone(&self.broker);
        let cancel = self.cancel.clone();
        let quench = self.quench;
        let quenched = !matches!(quench, Quench::None);

        let mut waits: Vec<Pin<Box<dyn Future<Output = WorkerEvent> + Send + '_>>> = Vec::new();
        waits.push(Box::pin(async move {
            broker.worker_notified().await;
            WorkerEvent::Wake
        }));
        waits.push(Box::pin(async move {
            cancel.cancelled().await;
            WorkerEvent::Cancelled
        }));
        if let Quench::Until(deadline) = quench {
            waits.push(Box::pin(async move {
                tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)).await;
                WorkerEvent::QuenchElapsed
            }));
        }
        for (server, conn) in self.connections.iter_mut() {
            let server = server.clone();
            if let Some(activity) = conn.wait_activity(quenched) {
                waits.push(Box::pin(async move {
                    match activity.await {
                        ConnEvent::Established(outcome) => {
                            WorkerEvent::TunnelOutcome(server, outcome)
                        }
                        ConnEvent::SocketReady(outcome) => WorkerEvent::Readiness(server, outcome),
                    }
                }));
            }
        }

        let (event, _, _) = select_all(waits).await;
        event
    }

    fn shutdown_all(&mut self) {
        for (server, conn) in self.connections.iter_mut() {
            tracing::debug!("Shutting down connection to {}", server);
            conn.shut_down();
        }
        self.connections.clear();
    }
}
