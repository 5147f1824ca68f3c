//! Transport error types

use thiserror::Error;

/// Errors surfaced by a framed-message transport
#[derive(Error, Debug)]
pub enum TransportError {
    /// A send was started while another send is still in flight
    #[error("Send already in progress")]
    Busy,

    /// The peer closed the connection
    #[error("Transport closed by peer")]
    Closed,

    /// The peer violated the framing protocol
    #[error("Protocol violation: {0}")]
    Protocol(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
