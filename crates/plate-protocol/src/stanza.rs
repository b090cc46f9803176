//! Stanzas and the addresses they travel between.

use crate::codec::ProtocolError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Maximum length of the local part of an address.
pub const MAX_LOCAL_PART_LENGTH: usize = 1023;

static STANZA_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Generate a stanza identifier unique within this process.
///
/// The identifier is the creation time in nanoseconds followed by a
/// monotonically increasing counter, both hex encoded.
#[must_use]
pub fn generate_stanza_id() -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or_default();
    let counter = STANZA_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("{nanos:x}-{counter:x}")
}

/// A bare protocol address: `local@domain`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Jid {
    local: String,
    domain: String,
}

impl Jid {
    /// Create an address from its parts.
    #[must_use]
    pub fn new(local: impl Into<String>, domain: impl Into<String>) -> Self {
        Self {
            local: local.into(),
            domain: domain.into(),
        }
    }

    /// Parse `local@domain`. A trailing `/resource` is discarded.
    ///
    /// # Errors
    ///
    /// Returns an error if either part is missing or the local part is too long.
    pub fn parse(address: &str) -> Result<Self, ProtocolError> {
        let bare = address.split('/').next().unwrap_or_default();
        let (local, domain) = bare
            .split_once('@')
            .ok_or_else(|| ProtocolError::InvalidAddress(address.to_string()))?;

        if local.is_empty() || domain.is_empty() || local.len() > MAX_LOCAL_PART_LENGTH {
            return Err(ProtocolError::InvalidAddress(address.to_string()));
        }

        Ok(Self::new(local, domain))
    }

    /// The local part, which is the principal identifier.
    #[must_use]
    pub fn local(&self) -> &str {
        &self.local
    }

    /// The server domain.
    #[must_use]
    pub fn domain(&self) -> &str {
        &self.domain
    }
}

impl fmt::Display for Jid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.local, self.domain)
    }
}

impl TryFrom<String> for Jid {
    type Error = ProtocolError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Jid::parse(&value)
    }
}

impl From<Jid> for String {
    fn from(jid: Jid) -> String {
        jid.to_string()
    }
}

/// Chat-state notification attached to a stanza.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatStateSignal {
    Active,
    Composing,
    Paused,
    Inactive,
    Gone,
}

impl ChatStateSignal {
    /// Wire name of the signal.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            ChatStateSignal::Active => "active",
            ChatStateSignal::Composing => "composing",
            ChatStateSignal::Paused => "paused",
            ChatStateSignal::Inactive => "inactive",
            ChatStateSignal::Gone => "gone",
        }
    }
}

/// Kind of a message stanza.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StanzaKind {
    #[default]
    Chat,
    Normal,
}

/// One discrete message unit exchanged over a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stanza {
    /// Identifier assigned when the stanza is built.
    pub id: String,
    /// Sender address. Filled in by the server on delivery.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from: Option<Jid>,
    /// Recipient address.
    pub to: Jid,
    #[serde(default)]
    pub kind: StanzaKind,
    /// Text body, absent for pure chat-state notifications.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chat_state: Option<ChatStateSignal>,
}

impl Stanza {
    /// Build a chat message with a body.
    #[must_use]
    pub fn chat(to: Jid, body: impl Into<String>) -> Self {
        Self {
            id: generate_stanza_id(),
            from: None,
            to,
            kind: StanzaKind::Chat,
            body: Some(body.into()),
            chat_state: None,
        }
    }

    /// Build a body-less stanza carrying only a chat-state signal.
    #[must_use]
    pub fn chat_state(to: Jid, signal: ChatStateSignal) -> Self {
        Self {
            id: generate_stanza_id(),
            from: None,
            to,
            kind: StanzaKind::Chat,
            body: None,
            chat_state: Some(signal),
        }
    }

    /// Set the sender address.
    #[must_use]
    pub fn with_from(mut self, from: Jid) -> Self {
        self.from = Some(from);
        self
    }

    /// Whether the stanza carries message text.
    #[must_use]
    pub fn has_body(&self) -> bool {
        self.body.is_some()
    }
}
