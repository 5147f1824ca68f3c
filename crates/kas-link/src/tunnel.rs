//! Helper-process tunnel to a KAS server
//!
//! Transport security is not handled in-process: each connection attempt
//! spawns a helper executable that dials the server, terminates TLS, and
//! relays plaintext back to a loopback listener owned by the tunnel. The
//! accepted loopback socket is what the framed transport is bound to.
//!
//! Establishment is resolved through a single future that also watches the
//! helper process itself, so a helper that dies before connecting back
//! surfaces as [`TunnelError::HelperExited`] instead of a hang. The worker
//! merges this future into its one readiness wait per iteration.

use std::net::SocketAddr;
use std::process::Stdio;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::process::{Child, Command};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::config::HelperConfig;
use crate::error::TunnelError;
use crate::server_id::ServerId;

/// Result of a completed tunnel establishment: the accepted socket plus the
/// still-running helper that now relays for it.
struct Established {
    stream: TcpStream,
    child: Child,
}

enum TunnelStage {
    Connecting {
        established_rx: oneshot::Receiver<Result<Established, TunnelError>>,
    },
    Established {
        child: Child,
    },
    Closed,
}

/// A helper-process-mediated channel to one KAS server.
///
/// Created fresh for every connection attempt; yields exactly one socket.
pub struct Tunnel {
    server: ServerId,
    listen_addr: SocketAddr,
    stage: TunnelStage,
    cancel: CancellationToken,
}

impl Tunnel {
    /// Start connecting: bind a loopback listener on an ephemeral port and
    /// spawn the helper configured to dial `server` and connect back.
    ///
    /// Returns as soon as the helper is launched; completion is observed via
    /// [`wait_established`](Tunnel::wait_established) or
    /// [`check_connect`](Tunnel::check_connect).
    pub async fn begin_connect(
        server: ServerId,
        helper: &HelperConfig,
    ) -> Result<Self, TunnelError> {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await?;
        let listen_addr = listener.local_addr()?;

        let mut cmd = Command::new(&helper.program);
        cmd.arg(listen_addr.ip().to_string())
            .arg(listen_addr.port().to_string())
            .arg(&server.host)
            .arg(server.port.to_string());
        if let Some(relay) = &helper.relay {
            cmd.arg("-r").arg(relay);
        }
        if let Some(level) = &helper.log_level {
            cmd.arg("-l").arg(level);
        }
        if let Some(path) = &helper.log_path {
            cmd.arg("-L").arg(path);
        }
        cmd.stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|source| TunnelError::HelperSpawn {
            program: helper.program.clone(),
            source,
        })?;

        tracing::debug!(
            "Tunnel to {} listening on {}, helper pid {:?}",
            server,
            listen_addr,
            child.id()
        );

        let cancel = CancellationToken::new();
        let accept_cancel = cancel.clone();
        let (tx, established_rx) = oneshot::channel();

        tokio::spawn(async move {
            let accepted = tokio::select! {
                accepted = listener.accept() => accepted,
                status = child.wait() => {
                    let status = status.ok().and_then(|s| s.code());
                    let _ = tx.send(Err(TunnelError::HelperExited { status }));
                    return;
                }
                _ = accept_cancel.cancelled() => {
                    let _ = child.start_kill();
                    return;
                }
            };

            let result = match accepted {
                Ok((stream, _)) => {
                    let _ = stream.set_nodelay(true);
                    Ok(Established { stream, child })
                }
                Err(e) => Err(TunnelError::Io(e)),
            };
            let _ = tx.send(result);
        });

        Ok(Self {
            server,
            listen_addr,
            stage: TunnelStage::Connecting { established_rx },
            cancel,
        })
    }

    /// The loopback address the helper connects back to.
    pub fn listen_addr(&self) -> SocketAddr {
        self.listen_addr
    }

    /// The server this tunnel targets.
    pub fn server(&self) -> &ServerId {
        &self.server
    }

    /// Wait for the helper to connect back, yielding the accepted socket.
    ///
    /// Cancel-safe: dropping the future leaves the tunnel connecting.
    /// Yields the socket at most once; later calls return
    /// [`TunnelError::NotConnecting`].
    pub async fn wait_established(&mut self) -> Result<TcpStream, TunnelError> {
        let TunnelStage::Connecting { established_rx } = &mut self.stage else {
            return Err(TunnelError::NotConnecting);
        };

        match established_rx.await {
            Ok(Ok(established)) => {
                tracing::info!("Tunnel to {} established", self.server);
                self.stage = TunnelStage::Established {
                    child: established.child,
                };
                Ok(established.stream)
            }
            Ok(Err(e)) => {
                tracing::debug!("Tunnel to {} failed: {}", self.server, e);
                self.stage = TunnelStage::Closed;
                Err(e)
            }
            Err(_) => {
                // Accept task cancelled underneath us
                self.stage = TunnelStage::Closed;
                Err(TunnelError::NotConnecting)
            }
        }
    }

    /// Bounded poll for establishment.
    ///
    /// Returns `Ok(Some(stream))` once the loopback connection completed
    /// within `timeout`, `Ok(None)` if it has not yet.
    pub async fn check_connect(
        &mut self,
        timeout: Duration,
    ) -> Result<Option<TcpStream>, TunnelError> {
        match tokio::time::timeout(timeout, self.wait_established()).await {
            Ok(Ok(stream)) => Ok(Some(stream)),
            Ok(Err(e)) => Err(e),
            Err(_) => Ok(None),
        }
    }

    /// Stop any in-progress establishment. Idempotent.
    ///
    /// An established helper keeps relaying until the transport socket
    /// closes or [`terminate`](Tunnel::terminate) is called.
    pub fn disconnect(&mut self) {
        if matches!(self.stage, TunnelStage::Connecting { .. }) {
            self.cancel.cancel();
            self.stage = TunnelStage::Closed;
        }
    }

    /// Disconnect and forcibly stop the helper process.
    pub fn terminate(&mut self) {
        self.cancel.cancel();
        if let TunnelStage::Established { mut child } =
            std::mem::replace(&mut self.stage, TunnelStage::Closed)
        {
            let _ = child.start_kill();
        }
    }
}

impl Drop for Tunnel {
    fn drop(&mut self) {
        self.terminate();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // `yes` accepts the tunnel's positional args and runs until killed, so it
    // stands in for a helper that launched but has not finished dialing.
    fn live_helper() -> HelperConfig {
        HelperConfig {
            program: "yes".into(),
            ..HelperConfig::default()
        }
    }

    #[tokio::test]
    async fn test_establishes_on_loopback_connect() {
        let server = ServerId::new("kas.example.com", 8471);
        let mut tunnel = Tunnel::begin_connect(server, &live_helper()).await.unwrap();

        let _client = TcpStream::connect(tunnel.listen_addr()).await.unwrap();
        let stream = tunnel.wait_established().await.unwrap();
        assert!(stream.peer_addr().is_ok());

        // The socket is yielded exactly once
        assert!(matches!(
            tunnel.wait_established().await,
            Err(TunnelError::NotConnecting)
        ));

        tunnel.terminate();
    }

    #[tokio::test]
    async fn test_helper_death_surfaces_as_failure() {
        let server = ServerId::new("kas.example.com", 8471);
        let helper = HelperConfig {
            program: "false".into(),
            ..HelperConfig::default()
        };
        let mut tunnel = Tunnel::begin_connect(server, &helper).await.unwrap();

        match tunnel.wait_established().await {
            Err(TunnelError::HelperExited { status }) => assert_eq!(status, Some(1)),
            other => panic!("expected HelperExited, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn test_check_connect_times_out_while_pending() {
        let server = ServerId::new("kas.example.com", 8471);
        let mut tunnel = Tunnel::begin_connect(server, &live_helper()).await.unwrap();

        let polled = tunnel
            .check_connect(Duration::from_millis(50))
            .await
            .unwrap();
        assert!(polled.is_none());

        tunnel.disconnect();
        tunnel.disconnect(); // idempotent
        assert!(matches!(
            tunnel.wait_established().await,
            Err(TunnelError::NotConnecting)
        ));
    }

    #[tokio::test]
    async fn test_spawn_failure_is_immediate() {
        let server = ServerId::new("kas.example.com", 8471);
        let helper = HelperConfig {
            program: "/nonexistent/kas-helper".into(),
            ..HelperConfig::default()
        };
        assert!(matches!(
            Tunnel::begin_connect(server, &helper).await,
            Err(TunnelError::HelperSpawn { .. })
        ));
    }
}
