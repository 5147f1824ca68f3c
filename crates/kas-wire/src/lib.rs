//! kas-wire: Wire message model for KAS server connections
//!
//! This crate defines the protocol messages exchanged with KAS collaboration
//! servers and the seam to the framed-message transport that carries them.
//! The byte-level framing codec itself lives outside this workspace; the
//! connection core only drives it through the [`FrameTransport`] trait.

pub mod error;
pub mod message;
pub mod transport;

pub use error::TransportError;
pub use message::{
    negotiated_minor, LinkRole, MessageId, ProtocolMessage, WireMessage, MIN_SUPPORTED_MINOR,
    PROTOCOL_MINOR,
};
pub use transport::{FrameTransport, TransportFactory};
