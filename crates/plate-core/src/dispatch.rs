//! Message dispatch.
//!
//! Outbound: validate both vehicles, send from the sender's pooled
//! session, persist, then broadcast to `messages/<recipient>`. Nothing is
//! persisted unless the send went through.
//!
//! Inbound: stanzas pushed to any pooled session are persisted and
//! broadcast the same way. Stanza ids are unique in the store, so the echo
//! of a local send is recorded once whichever side gets there first.

use crate::fanout::{broadcast, Fanout};
use crate::model::{message_topic, now_millis, MessageRequest, MessageResponse, NewMessage,
    DEFAULT_MESSAGE_TYPE};
use crate::registry::VehicleRegistry;
use crate::store::{MessageStore, StoreError};
use async_trait::async_trait;
use futures_util::FutureExt;
use plate_protocol::{Jid, Stanza};
use plate_transport::InboundHandler;
use std::error::Error as StdError;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info, trace, warn};

/// Counter of messages recorded, labelled by `direction`.
pub const MESSAGES_METRIC: &str = "plategate_messages_total";

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("Sender vehicle not found: {0}")]
    SenderUnknown(String),

    #[error("Recipient vehicle not found: {0}")]
    RecipientUnknown(String),

    #[error("Vehicle not found: {0}")]
    UnknownPrincipal(String),

    /// Connecting, authenticating or transmitting failed.
    #[error("Protocol error: {0}")]
    Protocol(#[source] Box<dyn StdError + Send + Sync>),

    #[error("Message not found: {0}")]
    MessageNotFound(u64),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Outcome of persisting one message.
enum Recorded {
    Stored(MessageResponse),
    /// Another path already stored this stanza.
    Duplicate(MessageResponse),
    Unsaved(MessageResponse),
}

impl DispatchError {
    fn protocol(err: impl StdError + Send + Sync + 'static) -> Self {
        DispatchError::Protocol(Box::new(err))
    }
}

pub struct MessageDispatcher {
    registry: Arc<VehicleRegistry>,
    messages: Arc<dyn MessageStore>,
    fanout: Arc<dyn Fanout>,
    domain: String,
}

impl MessageDispatcher {
    #[must_use]
    pub fn new(
        registry: Arc<VehicleRegistry>,
        messages: Arc<dyn MessageStore>,
        fanout: Arc<dyn Fanout>,
        domain: impl Into<String>,
    ) -> Self {
        Self {
            registry,
            messages,
            fanout,
            domain: domain.into(),
        }
    }

    /// Send a message and record it.
    ///
    /// # Errors
    ///
    /// [`DispatchError::SenderUnknown`] or [`DispatchError::RecipientUnknown`]
    /// before anything is sent; [`DispatchError::Protocol`] if the sender's
    /// session cannot be obtained or the send fails.
    pub async fn send(&self, request: MessageRequest) -> Result<MessageResponse, DispatchError> {
        let from = request.from_plate_number.as_str();
        let to = request.to_plate_number.as_str();

        if !self.registry.exists(from).await? {
            return Err(DispatchError::SenderUnknown(from.to_string()));
        }
        if !self.registry.exists(to).await? {
            return Err(DispatchError::RecipientUnknown(to.to_string()));
        }

        let session = self
            .registry
            .session(from)
            .await
            .map_err(DispatchError::protocol)?;
        let stanza = Stanza::chat(
            Jid::new(to, self.domain.as_str()),
            request.message_content.as_str(),
        );
        let stanza_id = stanza.id.clone();
        session.send(stanza).await.map_err(DispatchError::protocol)?;

        let now = now_millis();
        let message = NewMessage {
            from_plate_number: from.to_string(),
            to_plate_number: to.to_string(),
            message_content: request.message_content,
            message_type: request.message_type,
            timestamp: now,
            is_delivered: true,
            delivered_at: Some(now),
            stanza_id: Some(stanza_id),
        };
        metrics::counter!(MESSAGES_METRIC, "direction" => "outbound").increment(1);

        let response = match self.record(message).await {
            Recorded::Stored(response) => response,
            Recorded::Duplicate(response) => {
                debug!(stanza_id = ?response.stanza_id, "Echo recorded before the send");
                return Ok(response);
            }
            Recorded::Unsaved(response) => {
                error!(
                    from = %response.from_plate_number,
                    to = %response.to_plate_number,
                    stanza_id = ?response.stanza_id,
                    "Message delivered but not recorded"
                );
                response
            }
        };

        broadcast(
            self.fanout.as_ref(),
            &message_topic(&response.to_plate_number),
            &response,
        );
        info!(from = %response.from_plate_number, to = %response.to_plate_number, "Message sent");
        Ok(response)
    }

    /// Persist, falling back to an unsaved response.
    async fn record(&self, message: NewMessage) -> Recorded {
        let err = match self.messages.insert_message(message.clone()).await {
            Ok(record) => return Recorded::Stored(MessageResponse::from(&record)),
            Err(e) => e,
        };
        if let (StoreError::Conflict(_), Some(stanza_id)) = (&err, &message.stanza_id) {
            match self.messages.find_by_stanza_id(stanza_id).await {
                Ok(Some(existing)) => return Recorded::Duplicate(MessageResponse::from(&existing)),
                Ok(None) => {}
                Err(e) => warn!(stanza_id = %stanza_id, error = %e, "Failed to load recorded stanza"),
            }
        }
        warn!(error = %err, "Failed to persist message");
        Recorded::Unsaved(MessageResponse::from(&message))
    }

    /// Record and broadcast a stanza delivered to `owner`'s session.
    pub async fn receive(&self, owner: &str, stanza: Stanza) {
        let Some(body) = stanza.body else {
            trace!(owner = %owner, "Ignoring stanza without body");
            return;
        };
        let Some(from) = stanza.from else {
            warn!(owner = %owner, stanza_id = %stanza.id, "Inbound stanza without sender");
            return;
        };

        match self.messages.find_by_stanza_id(&stanza.id).await {
            Ok(Some(_)) => {
                debug!(stanza_id = %stanza.id, "Stanza already recorded");
                return;
            }
            Ok(None) => {}
            Err(e) => warn!(stanza_id = %stanza.id, error = %e, "Duplicate check failed"),
        }

        let now = now_millis();
        let message = NewMessage {
            from_plate_number: from.local().to_string(),
            to_plate_number: stanza.to.local().to_string(),
            message_content: body,
            message_type: DEFAULT_MESSAGE_TYPE.to_string(),
            timestamp: now,
            is_delivered: true,
            delivered_at: Some(now),
            stanza_id: Some(stanza.id),
        };
        let response = match self.record(message).await {
            Recorded::Stored(response) | Recorded::Unsaved(response) => response,
            Recorded::Duplicate(response) => {
                debug!(stanza_id = ?response.stanza_id, "Stanza already recorded");
                return;
            }
        };
        metrics::counter!(MESSAGES_METRIC, "direction" => "inbound").increment(1);
        broadcast(
            self.fanout.as_ref(),
            &message_topic(&response.to_plate_number),
            &response,
        );
        debug!(
            from = %response.from_plate_number,
            to = %response.to_plate_number,
            "Message received"
        );
    }

    /// # Errors
    ///
    /// [`DispatchError::MessageNotFound`] for an unknown id.
    pub async fn mark_as_read(&self, id: u64) -> Result<MessageResponse, DispatchError> {
        let mut record = self
            .messages
            .find_message(id)
            .await?
            .ok_or(DispatchError::MessageNotFound(id))?;
        if !record.is_read {
            record.is_read = true;
            record.read_at = Some(now_millis());
            self.messages.update_message(&record).await?;
        }
        Ok(MessageResponse::from(&record))
    }

    /// Messages to or from `principal`, newest first.
    ///
    /// # Errors
    ///
    /// [`DispatchError::UnknownPrincipal`] if the vehicle is not registered.
    pub async fn history(&self, principal: &str) -> Result<Vec<MessageResponse>, DispatchError> {
        if !self.registry.exists(principal).await? {
            return Err(DispatchError::UnknownPrincipal(principal.to_string()));
        }
        let records = self.messages.messages_involving(principal).await?;
        Ok(records.iter().map(MessageResponse::from).collect())
    }

    /// Both directions between `a` and `b`, oldest first.
    pub async fn conversation(
        &self,
        a: &str,
        b: &str,
    ) -> Result<Vec<MessageResponse>, DispatchError> {
        let records = self.messages.conversation(a, b).await?;
        Ok(records.iter().map(MessageResponse::from).collect())
    }

    pub async fn unread_count(&self, principal: &str) -> Result<u64, DispatchError> {
        Ok(self.messages.count_unread(principal).await?)
    }
}

#[async_trait]
impl InboundHandler for MessageDispatcher {
    async fn on_stanza(&self, owner: &str, stanza: Stanza) {
        if AssertUnwindSafe(self.receive(owner, stanza))
            .catch_unwind()
            .await
            .is_err()
        {
            error!(owner = %owner, "Inbound stanza handling panicked");
        }
    }
}
