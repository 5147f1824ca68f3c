//! Message types for the KAS link protocol
//!
//! Every connection starts with a role-selection exchange: the client sends
//! `SelectRole` immediately after the tunnel is accepted, and the server
//! answers with exactly one of `RoleGranted`, `RoleUpgradeRequired`, or
//! `RoleDenied`. Only after a grant do opaque `Payload` messages flow.
//!
//! # Protocol Version
//!
//! Minor versions are negotiated during role selection: the effective version
//! of a connection is the minimum of the server's reported minor and
//! [`PROTOCOL_MINOR`]. Servers older than [`MIN_SUPPORTED_MINOR`] are
//! rejected as incompatible.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Minor protocol version this build speaks.
pub const PROTOCOL_MINOR: u16 = 4;

/// Oldest server minor version this build can still talk to.
pub const MIN_SUPPORTED_MINOR: u16 = 2;

/// Effective minor version for a connection to a server reporting `server`.
pub fn negotiated_minor(server: u16) -> u16 {
    server.min(PROTOCOL_MINOR)
}

/// Unique identifier correlating a request to its reply
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MessageId(pub u32);

impl MessageId {
    /// Create a new message ID
    pub fn new(id: u32) -> Self {
        Self(id)
    }

    /// Get the raw ID value
    pub fn as_u32(&self) -> u32 {
        self.0
    }

    /// Reserved ID carried by the role-selection exchange.
    ///
    /// Never allocated to application requests and never present in a
    /// pending-request map.
    pub const ROLE_SELECT: MessageId = MessageId(0);
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "msg-{}", self.0)
    }
}

impl From<u32> for MessageId {
    fn from(id: u32) -> Self {
        Self(id)
    }
}

/// Operating mode a client requests during role selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinkRole {
    /// Full workspace participant: sends and receives collaboration traffic
    Workspace,
    /// Read-only observer of server state
    Monitor,
}

impl fmt::Display for LinkRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkRole::Workspace => write!(f, "workspace"),
            LinkRole::Monitor => write!(f, "monitor"),
        }
    }
}

/// An application-level message the link core routes without inspecting
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolMessage {
    /// Correlation ID (see [`MessageId`])
    pub id: MessageId,
    /// Opaque payload, interpreted only by the application layer
    pub payload: Bytes,
}

impl ProtocolMessage {
    /// Create a new message
    pub fn new(id: MessageId, payload: impl Into<Bytes>) -> Self {
        Self {
            id,
            payload: payload.into(),
        }
    }
}

/// Everything that crosses a framed transport
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WireMessage {
    /// Role-selection command, sent once per connection right after the
    /// tunnel accept. Carries [`MessageId::ROLE_SELECT`] on the wire.
    SelectRole {
        /// Requested operating mode
        role: LinkRole,
        /// Client's minor protocol version
        minor_version: u16,
    },

    /// Role selection succeeded
    RoleGranted {
        /// Server's minor protocol version
        minor_version: u16,
    },

    /// Server requires a newer client
    RoleUpgradeRequired {
        /// Minor version the server reported
        server_minor: u16,
    },

    /// Server refused the requested role
    RoleDenied {
        /// Human-readable reason supplied by the server
        reason: String,
    },

    /// Opaque application message
    Payload(ProtocolMessage),
}

impl WireMessage {
    /// Short name for logging
    pub fn kind(&self) -> &'static str {
        match self {
            WireMessage::SelectRole { .. } => "select-role",
            WireMessage::RoleGranted { .. } => "role-granted",
            WireMessage::RoleUpgradeRequired { .. } => "role-upgrade-required",
            WireMessage::RoleDenied { .. } => "role-denied",
            WireMessage::Payload(_) => "payload",
        }
    }
}
