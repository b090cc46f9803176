//! Frame types for the session protocol.
//!
//! Frames are the unit of transfer on a session. Each frame is serialized
//! with MessagePack and length-prefixed by the codec.

use crate::stanza::{Jid, Stanza};
use serde::{Deserialize, Serialize};

/// Protocol version spoken by this crate.
pub const PROTOCOL_VERSION: u8 = 1;

/// Error codes carried by [`Frame::Error`].
pub mod codes {
    pub const BAD_REQUEST: u16 = 400;
    pub const NOT_AUTHORIZED: u16 = 401;
    pub const FORBIDDEN: u16 = 403;
    pub const ITEM_NOT_FOUND: u16 = 404;
    pub const CONFLICT: u16 = 409;
    pub const INTERNAL: u16 = 500;
}

/// Frame type identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameType {
    Open = 0x01,
    Opened = 0x02,
    Auth = 0x03,
    AuthOk = 0x04,
    AuthFailed = 0x05,
    Stanza = 0x06,
    Register = 0x07,
    Unregister = 0x08,
    Ack = 0x09,
    Error = 0x0A,
    Ping = 0x0B,
    Pong = 0x0C,
    Close = 0x0D,
}

/// A protocol frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Frame {
    /// Client opens a stream towards a domain.
    #[serde(rename = "open")]
    Open {
        version: u8,
        domain: String,
        /// Ask the server to compress the stream.
        compression: bool,
    },

    /// Server accepted the stream.
    #[serde(rename = "opened")]
    Opened {
        stream_id: String,
        version: u8,
        /// Whether compression was negotiated.
        compression: bool,
    },

    /// Plain credential authentication.
    #[serde(rename = "auth")]
    Auth { username: String, password: String },

    /// Authentication succeeded; carries the bound address.
    #[serde(rename = "auth_ok")]
    AuthOk { jid: Jid },

    #[serde(rename = "auth_failed")]
    AuthFailed { reason: String },

    /// A message or chat-state notification.
    #[serde(rename = "stanza")]
    Stanza { stanza: Stanza },

    /// Administrative account creation.
    #[serde(rename = "register")]
    Register {
        id: u64,
        username: String,
        password: String,
    },

    /// Administrative account removal.
    #[serde(rename = "unregister")]
    Unregister { id: u64, username: String },

    /// Acknowledgment of an administrative request.
    #[serde(rename = "ack")]
    Ack { id: u64 },

    /// Error reply (id 0 if not tied to a request).
    #[serde(rename = "error")]
    Error { id: u64, code: u16, message: String },

    #[serde(rename = "ping")]
    Ping {
        #[serde(skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
    },

    #[serde(rename = "pong")]
    Pong {
        #[serde(skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
    },

    /// Orderly stream teardown.
    #[serde(rename = "close")]
    Close {
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
}

impl Frame {
    /// Get the frame type.
    #[must_use]
    pub fn frame_type(&self) -> FrameType {
        match self {
            Frame::Open { .. } => FrameType::Open,
            Frame::Opened { .. } => FrameType::Opened,
            Frame::Auth { .. } => FrameType::Auth,
            Frame::AuthOk { .. } => FrameType::AuthOk,
            Frame::AuthFailed { .. } => FrameType::AuthFailed,
            Frame::Stanza { .. } => FrameType::Stanza,
            Frame::Register { .. } => FrameType::Register,
            Frame::Unregister { .. } => FrameType::Unregister,
            Frame::Ack { .. } => FrameType::Ack,
            Frame::Error { .. } => FrameType::Error,
            Frame::Ping { .. } => FrameType::Ping,
            Frame::Pong { .. } => FrameType::Pong,
            Frame::Close { .. } => FrameType::Close,
        }
    }

    /// Create an Open frame for the current protocol version.
    #[must_use]
    pub fn open(domain: impl Into<String>, compression: bool) -> Self {
        Frame::Open {
            version: PROTOCOL_VERSION,
            domain: domain.into(),
            compression,
        }
    }

    #[must_use]
    pub fn auth(username: impl Into<String>, password: impl Into<String>) -> Self {
        Frame::Auth {
            username: username.into(),
            password: password.into(),
        }
    }

    #[must_use]
    pub fn stanza(stanza: Stanza) -> Self {
        Frame::Stanza { stanza }
    }

    #[must_use]
    pub fn register(id: u64, username: impl Into<String>, password: impl Into<String>) -> Self {
        Frame::Register {
            id,
            username: username.into(),
            password: password.into(),
        }
    }

    #[must_use]
    pub fn unregister(id: u64, username: impl Into<String>) -> Self {
        Frame::Unregister {
            id,
            username: username.into(),
        }
    }

    #[must_use]
    pub fn ack(id: u64) -> Self {
        Frame::Ack { id }
    }

    #[must_use]
    pub fn error(id: u64, code: u16, message: impl Into<String>) -> Self {
        Frame::Error {
            id,
            code,
            message: message.into(),
        }
    }

    #[must_use]
    pub fn pong(timestamp: Option<u64>) -> Self {
        Frame::Pong { timestamp }
    }

    #[must_use]
    pub fn close(reason: Option<String>) -> Self {
        Frame::Close { reason }
    }
}

/// Whether a peer speaking `version` can talk to this crate.
#[must_use]
pub fn is_compatible(version: u8) -> bool {
    version == PROTOCOL_VERSION
}
