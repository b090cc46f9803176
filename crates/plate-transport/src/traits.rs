//! Transport abstraction traits.
//!
//! The connection pool and the admin provisioner only ever see these traits,
//! which keeps them independent of the socket implementation.

use async_trait::async_trait;
use plate_protocol::{Jid, ProtocolError, Stanza};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Username and password presented during authentication.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    #[must_use]
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// What a session is used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionKind {
    /// Long-lived session owned by one principal. Reconnects when enabled
    /// and routes inbound stanzas to the inbound handler.
    Principal,
    /// Short-lived administrative session. Never reconnects.
    Admin,
}

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Connection timed out")]
    Timeout,

    #[error("Session is not live")]
    NotLive,

    /// Server refused to open the stream.
    #[error("Stream rejected: {0}")]
    StreamRejected(String),

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    /// Server answered a request with an error frame.
    #[error("Request rejected ({code}): {message}")]
    Rejected { code: u16, message: String },

    #[error("Unexpected frame: {0}")]
    UnexpectedFrame(String),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A live protocol session for exactly one identity.
#[async_trait]
pub trait Session: Send + Sync {
    /// The identity the session authenticated as.
    fn principal(&self) -> &str;

    /// Bound address reported by the server.
    fn jid(&self) -> &Jid;

    /// Creation time in Unix milliseconds.
    fn created_at(&self) -> u64;

    /// Whether the session can currently transmit.
    fn is_live(&self) -> bool;

    /// Transmit a stanza. Returns once the frame is written to the socket.
    async fn send(&self, stanza: Stanza) -> Result<(), TransportError>;

    /// Create a remote account. Only meaningful on admin sessions.
    async fn create_account(&self, username: &str, password: &str) -> Result<(), TransportError>;

    /// Remove a remote account. Only meaningful on admin sessions.
    async fn delete_account(&self, username: &str) -> Result<(), TransportError>;

    /// Close the session and stop any reconnection attempts.
    async fn disconnect(&self) -> Result<(), TransportError>;
}

/// Opens sessions against the remote server.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Install the handler receiving stanzas for principal sessions.
    ///
    /// Implementations hold the handler weakly so the handler may itself
    /// own the connector.
    fn set_inbound_handler(&self, handler: &Arc<dyn InboundHandler>);

    /// Connect and authenticate.
    async fn connect(
        &self,
        credentials: &Credentials,
        kind: SessionKind,
    ) -> Result<Arc<dyn Session>, TransportError>;
}

/// Receives stanzas delivered to principal sessions.
///
/// Implementations must not panic; there is nobody to report an error to.
#[async_trait]
pub trait InboundHandler: Send + Sync {
    /// Called for every stanza delivered to the session owned by `owner`.
    async fn on_stanza(&self, owner: &str, stanza: Stanza);
}
