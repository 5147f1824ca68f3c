//! Error types for the KAS link core

use kas_wire::TransportError;
use std::path::PathBuf;
use thiserror::Error;

/// Connection-scoped failures.
///
/// Recorded on the transition to `Disconnected` and delivered to the
/// consumer inside the disconnection notice. Never fatal to the worker loop.
#[derive(Error, Debug)]
pub enum LinkError {
    /// Tunnel-level failure (helper process, loopback accept)
    #[error("Tunnel error: {0}")]
    Tunnel(#[from] TunnelError),

    /// Framed-transport failure
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Server requires a newer client build
    #[error("Server requires a client upgrade (server minor version {server_minor})")]
    UpgradeRequired {
        /// Minor version the server reported
        server_minor: u16,
    },

    /// Server refused the requested role
    #[error("Role denied by server: {0}")]
    RoleDenied(String),

    /// Server speaks a minor version older than we support
    #[error("Incompatible server: minor version {server_minor}, minimum supported {min_supported}")]
    IncompatibleServer {
        /// Minor version the server reported
        server_minor: u16,
        /// Oldest minor version this build accepts
        min_supported: u16,
    },

    /// The peer sent something the state machine cannot accept
    #[error("Unexpected message during {0}")]
    UnexpectedMessage(&'static str),
}

/// Tunnel-related errors
#[derive(Error, Debug)]
pub enum TunnelError {
    /// Failed to launch the helper process
    #[error("Failed to spawn helper {program}: {source}")]
    HelperSpawn {
        /// Program that failed to start
        program: PathBuf,
        /// Underlying spawn error
        source: std::io::Error,
    },

    /// The helper process died before the loopback connection completed
    #[error("Helper process exited before connecting (status {status:?})")]
    HelperExited {
        /// Exit code, if the process exited normally
        status: Option<i32>,
    },

    /// The tunnel is not in a connecting state
    #[error("Tunnel is not connecting")]
    NotConnecting,

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Broker mailbox errors
#[derive(Error, Debug)]
pub enum BrokerError {
    /// The mailbox mutex was poisoned by a panicking holder
    #[error("Broker mailbox poisoned")]
    Poisoned,
}

/// Loop-fatal worker errors.
///
/// Distinct from any single connection's failure: the worker cannot continue
/// and its owner must re-establish all connections from scratch.
#[derive(Error, Debug)]
pub enum WorkerError {
    /// The consumer-communication channel itself failed
    #[error("Mailbox failure: {0}")]
    Mailbox(#[from] BrokerError),
}

/// Configuration-related errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Config file not found
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    /// Invalid configuration
    #[error("Invalid config: {0}")]
    Invalid(String),

    /// TOML parse error
    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),

    /// TOML serialize error
    #[error("TOML serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),
}

/// Failure to parse a `host:port` server identifier
#[derive(Error, Debug)]
pub enum ServerIdParseError {
    /// No `:port` suffix present
    #[error("Missing port in server id: {0}")]
    MissingPort(String),

    /// Empty host component
    #[error("Missing host in server id: {0}")]
    MissingHost(String),

    /// Port is not a valid u16
    #[error("Invalid port: {0}")]
    InvalidPort(String),
}
