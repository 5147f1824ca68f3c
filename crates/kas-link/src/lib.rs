//! kas-link: KAS server-connection core
//!
//! Maintains persistent, authenticated channels to KAS collaboration
//! servers. A single I/O worker multiplexes every connection over one
//! readiness wait per iteration; a mutex-guarded broker mailbox decouples
//! the worker from the consuming side with wake-up coalescing and inbound
//! backpressure; the consumer side carries request/reply correlation and
//! the reconnect backoff policy.
//!
//! Transport security lives in a spawned helper process (see
//! [`tunnel::Tunnel`]); byte-level framing lives behind
//! [`kas_wire::FrameTransport`]. Neither is implemented here.

pub mod backoff;
pub mod broker;
pub mod config;
pub mod connection;
pub mod error;
pub mod pending;
pub mod server_id;
pub mod tunnel;
pub mod worker;

pub use backoff::{BackoffState, ReconnectTracker};
pub use broker::{Broker, LinkNotice, LinkRequest, Quench, WorkerIntake};
pub use config::{BackoffConfig, HelperConfig, LinkConfig, QuenchConfig};
pub use connection::ConnectionStatus;
pub use error::{BrokerError, ConfigError, LinkError, TunnelError, WorkerError};
pub use pending::PendingRequests;
pub use server_id::ServerId;
pub use tunnel::Tunnel;
pub use worker::{ConnectionWorker, LinkRuntime};
