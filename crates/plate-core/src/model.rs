//! Records, requests and responses shared across the gateway.
//!
//! JSON field names follow the local client API (`plateNumber`,
//! `chatWithPlate`, ...). All timestamps are Unix milliseconds.

use plate_protocol::ChatStateSignal;
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Message type used when a request does not name one.
pub const DEFAULT_MESSAGE_TYPE: &str = "TEXT";

/// Current time in Unix milliseconds.
#[must_use]
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// Topic carrying messages addressed to `principal`.
#[must_use]
pub fn message_topic(principal: &str) -> String {
    format!("messages/{principal}")
}

/// Topic carrying chat-state changes aimed at `principal`.
#[must_use]
pub fn chat_state_topic(principal: &str) -> String {
    format!("chat-state/{principal}")
}

/// Typing/presence indicator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChatState {
    Active,
    Composing,
    Paused,
    Inactive,
    Gone,
}

impl ChatState {
    /// Parse the upper-case name used by local clients.
    #[must_use]
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "ACTIVE" => Some(ChatState::Active),
            "COMPOSING" => Some(ChatState::Composing),
            "PAUSED" => Some(ChatState::Paused),
            "INACTIVE" => Some(ChatState::Inactive),
            "GONE" => Some(ChatState::Gone),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            ChatState::Active => "ACTIVE",
            ChatState::Composing => "COMPOSING",
            ChatState::Paused => "PAUSED",
            ChatState::Inactive => "INACTIVE",
            ChatState::Gone => "GONE",
        }
    }

    /// The protocol signal announcing this state.
    #[must_use]
    pub fn signal(&self) -> ChatStateSignal {
        match self {
            ChatState::Active => ChatStateSignal::Active,
            ChatState::Composing => ChatStateSignal::Composing,
            ChatState::Paused => ChatStateSignal::Paused,
            ChatState::Inactive => ChatStateSignal::Inactive,
            ChatState::Gone => ChatStateSignal::Gone,
        }
    }
}

/// A chat-state submission from a local client.
///
/// `state` stays a raw string: unknown values are still persisted and
/// broadcast, they just never reach the protocol.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatStateRequest {
    pub plate_number: String,
    pub chat_with_plate: String,
    pub state: String,
}

impl ChatStateRequest {
    #[must_use]
    pub fn new(
        plate_number: impl Into<String>,
        chat_with_plate: impl Into<String>,
        state: impl Into<String>,
    ) -> Self {
        Self {
            plate_number: plate_number.into(),
            chat_with_plate: chat_with_plate.into(),
            state: state.into(),
        }
    }

    /// Same pair, different state.
    #[must_use]
    pub fn with_state(&self, state: ChatState) -> Self {
        Self {
            state: state.as_str().to_string(),
            ..self.clone()
        }
    }
}

/// Last emitted chat state for an ordered (principal, peer) pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatStateRecord {
    pub id: u64,
    pub plate_number: String,
    pub chat_with_plate: String,
    pub state: String,
    pub timestamp: u64,
}

/// Outbound message request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageRequest {
    pub from_plate_number: String,
    pub to_plate_number: String,
    pub message_content: String,
    #[serde(default = "default_message_type")]
    pub message_type: String,
}

fn default_message_type() -> String {
    DEFAULT_MESSAGE_TYPE.to_string()
}

impl MessageRequest {
    #[must_use]
    pub fn text(
        from: impl Into<String>,
        to: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            from_plate_number: from.into(),
            to_plate_number: to.into(),
            message_content: content.into(),
            message_type: default_message_type(),
        }
    }
}

/// A message about to be persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMessage {
    pub from_plate_number: String,
    pub to_plate_number: String,
    pub message_content: String,
    pub message_type: String,
    pub timestamp: u64,
    pub is_delivered: bool,
    pub delivered_at: Option<u64>,
    pub stanza_id: Option<String>,
}

impl NewMessage {
    /// Attach a store id.
    #[must_use]
    pub fn into_record(self, id: u64) -> MessageRecord {
        MessageRecord {
            id,
            from_plate_number: self.from_plate_number,
            to_plate_number: self.to_plate_number,
            message_content: self.message_content,
            message_type: self.message_type,
            timestamp: self.timestamp,
            is_delivered: self.is_delivered,
            delivered_at: self.delivered_at,
            is_read: false,
            read_at: None,
            stanza_id: self.stanza_id,
        }
    }
}

/// A persisted message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageRecord {
    pub id: u64,
    pub from_plate_number: String,
    pub to_plate_number: String,
    pub message_content: String,
    pub message_type: String,
    pub timestamp: u64,
    pub is_delivered: bool,
    pub delivered_at: Option<u64>,
    pub is_read: bool,
    pub read_at: Option<u64>,
    /// Protocol-assigned stanza identifier.
    pub stanza_id: Option<String>,
}

/// Message as returned to callers and broadcast to subscribers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageResponse {
    /// Store id; `None` when the message was sent but could not be recorded.
    pub id: Option<u64>,
    pub from_plate_number: String,
    pub to_plate_number: String,
    pub message_content: String,
    pub message_type: String,
    pub timestamp: u64,
    pub is_delivered: bool,
    pub is_read: bool,
    pub delivered_at: Option<u64>,
    pub read_at: Option<u64>,
    pub stanza_id: Option<String>,
}

impl From<&MessageRecord> for MessageResponse {
    fn from(record: &MessageRecord) -> Self {
        Self {
            id: Some(record.id),
            from_plate_number: record.from_plate_number.clone(),
            to_plate_number: record.to_plate_number.clone(),
            message_content: record.message_content.clone(),
            message_type: record.message_type.clone(),
            timestamp: record.timestamp,
            is_delivered: record.is_delivered,
            is_read: record.is_read,
            delivered_at: record.delivered_at,
            read_at: record.read_at,
            stanza_id: record.stanza_id.clone(),
        }
    }
}

impl From<&NewMessage> for MessageResponse {
    fn from(message: &NewMessage) -> Self {
        Self {
            id: None,
            from_plate_number: message.from_plate_number.clone(),
            to_plate_number: message.to_plate_number.clone(),
            message_content: message.message_content.clone(),
            message_type: message.message_type.clone(),
            timestamp: message.timestamp,
            is_delivered: message.is_delivered,
            is_read: false,
            delivered_at: message.delivered_at,
            read_at: None,
            stanza_id: message.stanza_id.clone(),
        }
    }
}

/// A vehicle about to be registered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewVehicle {
    pub user_id: String,
    pub plate_number: String,
    pub xmpp_username: String,
}

/// A registered vehicle. The credential lives in the credential store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VehicleRecord {
    pub id: u64,
    pub user_id: String,
    pub plate_number: String,
    pub xmpp_username: String,
    pub is_active: bool,
    pub created_at: u64,
    pub updated_at: u64,
    pub last_connected_at: Option<u64>,
}
