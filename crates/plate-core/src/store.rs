//! Persistence boundary.
//!
//! The gateway only depends on the traits here. [`MemoryStore`] implements
//! all of them in process and is what the server runs with.

use crate::model::{
    now_millis, ChatStateRecord, MessageRecord, NewMessage, NewVehicle, VehicleRecord,
};
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::trace;

/// Store errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A unique key is already taken.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// The record to update does not exist.
    #[error("Record not found: {0}")]
    NotFound(String),

    /// The backend could not serve the request.
    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Persist a message and return it with its assigned id.
    ///
    /// Stanza ids are unique: a second message carrying an id already
    /// stored fails with [`StoreError::Conflict`].
    async fn insert_message(&self, message: NewMessage) -> Result<MessageRecord, StoreError>;

    async fn update_message(&self, record: &MessageRecord) -> Result<(), StoreError>;

    async fn find_message(&self, id: u64) -> Result<Option<MessageRecord>, StoreError>;

    async fn find_by_stanza_id(&self, stanza_id: &str)
        -> Result<Option<MessageRecord>, StoreError>;

    /// Messages sent or received by `principal`, newest first.
    async fn messages_involving(&self, principal: &str) -> Result<Vec<MessageRecord>, StoreError>;

    /// Messages between two principals in either direction, oldest first.
    async fn conversation(&self, a: &str, b: &str) -> Result<Vec<MessageRecord>, StoreError>;

    /// Unread messages addressed to `principal`.
    async fn count_unread(&self, principal: &str) -> Result<u64, StoreError>;
}

#[async_trait]
pub trait ChatStateStore: Send + Sync {
    /// Insert or replace the state for the ordered pair.
    async fn upsert_chat_state(
        &self,
        principal: &str,
        peer: &str,
        state: &str,
        timestamp: u64,
    ) -> Result<ChatStateRecord, StoreError>;

    async fn find_chat_state(
        &self,
        principal: &str,
        peer: &str,
    ) -> Result<Option<ChatStateRecord>, StoreError>;
}

#[async_trait]
pub trait VehicleStore: Send + Sync {
    /// Insert a vehicle; fails with [`StoreError::Conflict`] if the plate exists.
    async fn insert_vehicle(&self, vehicle: NewVehicle) -> Result<VehicleRecord, StoreError>;

    async fn update_vehicle(&self, record: &VehicleRecord) -> Result<(), StoreError>;

    async fn find_vehicle(&self, plate: &str) -> Result<Option<VehicleRecord>, StoreError>;

    async fn list_vehicles(&self) -> Result<Vec<VehicleRecord>, StoreError>;

    /// Returns whether a record was removed.
    async fn delete_vehicle(&self, plate: &str) -> Result<bool, StoreError>;
}

/// Encrypted credentials keyed by principal. Ciphertext is opaque here.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn get_credential(&self, principal: &str) -> Result<Option<String>, StoreError>;

    async fn put_credential(&self, principal: &str, ciphertext: &str) -> Result<(), StoreError>;

    async fn delete_credential(&self, principal: &str) -> Result<(), StoreError>;
}

/// The set of stores a gateway runs against.
#[derive(Clone)]
pub struct Stores {
    pub messages: Arc<dyn MessageStore>,
    pub chat_states: Arc<dyn ChatStateStore>,
    pub vehicles: Arc<dyn VehicleStore>,
    pub credentials: Arc<dyn CredentialStore>,
}

impl Stores {
    /// Every store backed by one shared [`MemoryStore`].
    #[must_use]
    pub fn in_memory() -> Self {
        let store = Arc::new(MemoryStore::new());
        Self {
            messages: store.clone(),
            chat_states: store.clone(),
            vehicles: store.clone(),
            credentials: store,
        }
    }
}

/// In-process store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    messages: DashMap<u64, MessageRecord>,
    by_stanza_id: DashMap<String, u64>,
    next_message_id: AtomicU64,
    chat_states: DashMap<(String, String), ChatStateRecord>,
    next_chat_state_id: AtomicU64,
    vehicles: DashMap<String, VehicleRecord>,
    next_vehicle_id: AtomicU64,
    credentials: DashMap<String, String>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of persisted messages.
    #[must_use]
    pub fn message_count(&self) -> usize {
        self.messages.len()
    }

    fn store_message(&self, message: NewMessage) -> MessageRecord {
        let id = self.next_message_id.fetch_add(1, Ordering::Relaxed) + 1;
        let record = message.into_record(id);
        self.messages.insert(id, record.clone());
        trace!(id, "Stored message");
        record
    }

    fn collect_messages(&self, keep: impl Fn(&MessageRecord) -> bool) -> Vec<MessageRecord> {
        let mut found: Vec<MessageRecord> = self
            .messages
            .iter()
            .filter(|entry| keep(entry.value()))
            .map(|entry| entry.value().clone())
            .collect();
        // Ids break timestamp ties so insertion order wins within one millisecond.
        found.sort_by_key(|m| (m.timestamp, m.id));
        found
    }
}

#[async_trait]
impl MessageStore for MemoryStore {
    async fn insert_message(&self, message: NewMessage) -> Result<MessageRecord, StoreError> {
        let Some(stanza_id) = message.stanza_id.clone() else {
            return Ok(self.store_message(message));
        };
        // The vacant entry stays locked until the record is visible.
        match self.by_stanza_id.entry(stanza_id) {
            Entry::Occupied(existing) => Err(StoreError::Conflict(format!(
                "stanza {}",
                existing.key()
            ))),
            Entry::Vacant(slot) => {
                let record = self.store_message(message);
                slot.insert(record.id);
                Ok(record)
            }
        }
    }

    async fn update_message(&self, record: &MessageRecord) -> Result<(), StoreError> {
        match self.messages.get_mut(&record.id) {
            Some(mut existing) => {
                *existing = record.clone();
                Ok(())
            }
            None => Err(StoreError::NotFound(format!("message {}", record.id))),
        }
    }

    async fn find_message(&self, id: u64) -> Result<Option<MessageRecord>, StoreError> {
        Ok(self.messages.get(&id).map(|m| m.clone()))
    }

    async fn find_by_stanza_id(
        &self,
        stanza_id: &str,
    ) -> Result<Option<MessageRecord>, StoreError> {
        let Some(id) = self.by_stanza_id.get(stanza_id).map(|id| *id) else {
            return Ok(None);
        };
        Ok(self.messages.get(&id).map(|m| m.clone()))
    }

    async fn messages_involving(&self, principal: &str) -> Result<Vec<MessageRecord>, StoreError> {
        let mut found = self.collect_messages(|m| {
            m.from_plate_number == principal || m.to_plate_number == principal
        });
        found.reverse();
        Ok(found)
    }

    async fn conversation(&self, a: &str, b: &str) -> Result<Vec<MessageRecord>, StoreError> {
        Ok(self.collect_messages(|m| {
            (m.from_plate_number == a && m.to_plate_number == b)
                || (m.from_plate_number == b && m.to_plate_number == a)
        }))
    }

    async fn count_unread(&self, principal: &str) -> Result<u64, StoreError> {
        Ok(self
            .messages
            .iter()
            .filter(|m| m.to_plate_number == principal && !m.is_read)
            .count() as u64)
    }
}

#[async_trait]
impl ChatStateStore for MemoryStore {
    async fn upsert_chat_state(
        &self,
        principal: &str,
        peer: &str,
        state: &str,
        timestamp: u64,
    ) -> Result<ChatStateRecord, StoreError> {
        let key = (principal.to_string(), peer.to_string());
        let mut entry = self.chat_states.entry(key).or_insert_with(|| ChatStateRecord {
            id: self.next_chat_state_id.fetch_add(1, Ordering::Relaxed) + 1,
            plate_number: principal.to_string(),
            chat_with_plate: peer.to_string(),
            state: String::new(),
            timestamp,
        });
        entry.state = state.to_string();
        entry.timestamp = timestamp;
        Ok(entry.clone())
    }

    async fn find_chat_state(
        &self,
        principal: &str,
        peer: &str,
    ) -> Result<Option<ChatStateRecord>, StoreError> {
        let key = (principal.to_string(), peer.to_string());
        Ok(self.chat_states.get(&key).map(|s| s.clone()))
    }
}

#[async_trait]
impl VehicleStore for MemoryStore {
    async fn insert_vehicle(&self, vehicle: NewVehicle) -> Result<VehicleRecord, StoreError> {
        match self.vehicles.entry(vehicle.plate_number.clone()) {
            Entry::Occupied(_) => Err(StoreError::Conflict(format!(
                "vehicle {}",
                vehicle.plate_number
            ))),
            Entry::Vacant(slot) => {
                let now = now_millis();
                let record = VehicleRecord {
                    id: self.next_vehicle_id.fetch_add(1, Ordering::Relaxed) + 1,
                    user_id: vehicle.user_id,
                    plate_number: vehicle.plate_number,
                    xmpp_username: vehicle.xmpp_username,
                    is_active: true,
                    created_at: now,
                    updated_at: now,
                    last_connected_at: None,
                };
                slot.insert(record.clone());
                Ok(record)
            }
        }
    }

    async fn update_vehicle(&self, record: &VehicleRecord) -> Result<(), StoreError> {
        match self.vehicles.get_mut(&record.plate_number) {
            Some(mut existing) => {
                *existing = VehicleRecord {
                    updated_at: now_millis(),
                    ..record.clone()
                };
                Ok(())
            }
            None => Err(StoreError::NotFound(format!(
                "vehicle {}",
                record.plate_number
            ))),
        }
    }

    async fn find_vehicle(&self, plate: &str) -> Result<Option<VehicleRecord>, StoreError> {
        Ok(self.vehicles.get(plate).map(|v| v.clone()))
    }

    async fn list_vehicles(&self) -> Result<Vec<VehicleRecord>, StoreError> {
        let mut all: Vec<VehicleRecord> = self.vehicles.iter().map(|v| v.clone()).collect();
        all.sort_by_key(|v| v.id);
        Ok(all)
    }

    async fn delete_vehicle(&self, plate: &str) -> Result<bool, StoreError> {
        Ok(self.vehicles.remove(plate).is_some())
    }
}

#[async_trait]
impl CredentialStore for MemoryStore {
    async fn get_credential(&self, principal: &str) -> Result<Option<String>, StoreError> {
        Ok(self.credentials.get(principal).map(|c| c.clone()))
    }

    async fn put_credential(&self, principal: &str, ciphertext: &str) -> Result<(), StoreError> {
        self.credentials
            .insert(principal.to_string(), ciphertext.to_string());
        Ok(())
    }

    async fn delete_credential(&self, principal: &str) -> Result<(), StoreError> {
        self.credentials.remove(principal);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::DEFAULT_MESSAGE_TYPE;

    fn message(from: &str, to: &str, timestamp: u64) -> NewMessage {
        NewMessage {
            from_plate_number: from.to_string(),
            to_plate_number: to.to_string(),
            message_content: format!("{from}->{to}@{timestamp}"),
            message_type: DEFAULT_MESSAGE_TYPE.to_string(),
            timestamp,
            is_delivered: true,
            delivered_at: Some(timestamp),
            stanza_id: Some(format!("s-{timestamp}")),
        }
    }

    #[tokio::test]
    async fn test_message_orderings() {
        let store = MemoryStore::new();
        store.insert_message(message("A", "B", 30)).await.unwrap();
        store.insert_message(message("B", "A", 10)).await.unwrap();
        store.insert_message(message("A", "C", 20)).await.unwrap();
        store.insert_message(message("C", "B", 5)).await.unwrap();

        let history: Vec<u64> = store
            .messages_involving("A")
            .await
            .unwrap()
            .iter()
            .map(|m| m.timestamp)
            .collect();
        assert_eq!(history, vec![30, 20, 10]);

        let conversation: Vec<u64> = store
            .conversation("B", "A")
            .await
            .unwrap()
            .iter()
            .map(|m| m.timestamp)
            .collect();
        assert_eq!(conversation, vec![10, 30]);
    }

    #[tokio::test]
    async fn test_timestamp_ties_keep_insertion_order() {
        let store = MemoryStore::new();
        let first = store.insert_message(message("A", "B", 7)).await.unwrap();
        let reply = NewMessage {
            stanza_id: Some("s-7-reply".to_string()),
            ..message("B", "A", 7)
        };
        let second = store.insert_message(reply).await.unwrap();

        let conversation = store.conversation("A", "B").await.unwrap();
        assert_eq!(conversation[0].id, first.id);
        assert_eq!(conversation[1].id, second.id);
    }

    #[tokio::test]
    async fn test_unread_count_and_update() {
        let store = MemoryStore::new();
        let mut record = store.insert_message(message("A", "B", 1)).await.unwrap();
        store.insert_message(message("A", "B", 2)).await.unwrap();
        assert_eq!(store.count_unread("B").await.unwrap(), 2);
        assert_eq!(store.count_unread("A").await.unwrap(), 0);

        record.is_read = true;
        store.update_message(&record).await.unwrap();
        assert_eq!(store.count_unread("B").await.unwrap(), 1);

        let found = store.find_by_stanza_id("s-1").await.unwrap().unwrap();
        assert!(found.is_read);
    }

    #[tokio::test]
    async fn test_stanza_id_is_unique() {
        let store = MemoryStore::new();
        let first = store.insert_message(message("A", "B", 1)).await.unwrap();

        let err = store.insert_message(message("B", "A", 1)).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
        assert_eq!(store.message_count(), 1);
        assert_eq!(
            store.find_by_stanza_id("s-1").await.unwrap().unwrap().id,
            first.id
        );

        let anonymous = NewMessage {
            stanza_id: None,
            ..message("A", "B", 2)
        };
        store.insert_message(anonymous.clone()).await.unwrap();
        store.insert_message(anonymous).await.unwrap();
        assert_eq!(store.message_count(), 3);
    }

    #[tokio::test]
    async fn test_chat_state_upsert_is_directional() {
        let store = MemoryStore::new();
        let first = store
            .upsert_chat_state("A", "B", "COMPOSING", 1)
            .await
            .unwrap();
        let second = store.upsert_chat_state("A", "B", "PAUSED", 2).await.unwrap();
        store.upsert_chat_state("B", "A", "ACTIVE", 3).await.unwrap();

        assert_eq!(first.id, second.id);
        let current = store.find_chat_state("A", "B").await.unwrap().unwrap();
        assert_eq!(current.state, "PAUSED");
        assert_eq!(current.timestamp, 2);
        let reverse = store.find_chat_state("B", "A").await.unwrap().unwrap();
        assert_eq!(reverse.state, "ACTIVE");
    }

    #[tokio::test]
    async fn test_vehicle_plate_is_unique() {
        let store = MemoryStore::new();
        let vehicle = NewVehicle {
            user_id: "u-1".to_string(),
            plate_number: "34ABC123".to_string(),
            xmpp_username: "34ABC123".to_string(),
        };
        store.insert_vehicle(vehicle.clone()).await.unwrap();
        assert!(matches!(
            store.insert_vehicle(vehicle).await,
            Err(StoreError::Conflict(_))
        ));
        assert!(store.delete_vehicle("34ABC123").await.unwrap());
        assert!(!store.delete_vehicle("34ABC123").await.unwrap());
    }
}
