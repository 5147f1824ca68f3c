//! Framed-transport seam
//!
//! The link core never touches raw sockets: it drives an externally supplied
//! framed-message transport bound to the tunnel's accepted socket. The
//! transport is expected to be non-blocking; the worker waits on
//! [`FrameTransport::ready`] and then advances transfers with bounded
//! [`FrameTransport::pump_transfer`] bursts.

use async_trait::async_trait;
use std::io;
use tokio::io::{Interest, Ready};
use tokio::net::TcpStream;

use crate::error::TransportError;
use crate::message::WireMessage;

/// A non-blocking, message-boundary-preserving transport.
///
/// At most one outbound message is in flight at a time; callers check
/// [`is_sending`](FrameTransport::is_sending) before starting the next send.
/// Reception is armed with [`begin_receive`](FrameTransport::begin_receive)
/// and completed messages are claimed with
/// [`take_received`](FrameTransport::take_received).
#[async_trait]
pub trait FrameTransport: Send {
    /// Wait until the underlying socket is ready for the given interest.
    ///
    /// This is the single suspension point the connection worker multiplexes
    /// across all live connections.
    async fn ready(&self, interest: Interest) -> io::Result<Ready>;

    /// Arm reception of the next inbound message.
    fn begin_receive(&mut self);

    /// Advance in-flight transfers in both directions without blocking.
    fn pump_transfer(&mut self) -> Result<(), TransportError>;

    /// Start transmitting one message.
    ///
    /// Returns [`TransportError::Busy`] if a send is already in flight.
    fn send(&mut self, msg: WireMessage) -> Result<(), TransportError>;

    /// Whether an outbound message is still being transmitted.
    fn is_sending(&self) -> bool;

    /// Whether reception is armed and incomplete.
    fn is_receiving(&self) -> bool;

    /// Whether a full inbound message is waiting to be claimed.
    fn receive_complete(&self) -> bool;

    /// Claim the completed inbound message, if any.
    fn take_received(&mut self) -> Option<WireMessage>;
}

/// Binds the external framing codec to an accepted tunnel socket.
///
/// Exactly one transport is created per successfully connected tunnel.
pub trait TransportFactory: Send + Sync {
    /// Wrap the accepted loopback socket in a framed transport.
    fn open(&self, stream: TcpStream) -> Box<dyn FrameTransport>;
}
