//! Local topic fan-out.
//!
//! Connected local clients subscribe to topics such as `messages/<plate>`
//! and receive every payload published there. Delivery is best effort:
//! a topic nobody listens to swallows the payload.

use bytes::Bytes;
use dashmap::{DashMap, DashSet};
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, info, trace, warn};

/// Maximum topic length.
pub const MAX_TOPIC_LENGTH: usize = 256;

/// Publishes payloads to local subscribers.
pub trait Fanout: Send + Sync {
    /// Returns the number of subscribers reached.
    fn publish(&self, topic: &str, payload: Bytes) -> usize;
}

/// Serialize `value` as JSON and publish it. Serialization failures are logged.
pub fn broadcast<T: Serialize>(fanout: &dyn Fanout, topic: &str, value: &T) -> usize {
    match serde_json::to_vec(value) {
        Ok(json) => fanout.publish(topic, Bytes::from(json)),
        Err(e) => {
            warn!(topic = %topic, error = %e, "Failed to serialize broadcast payload");
            0
        }
    }
}

/// One published payload as seen by subscribers.
#[derive(Debug, Clone)]
pub struct Publication {
    pub topic: String,
    pub payload: Bytes,
}

#[derive(Debug, Error)]
pub enum FanoutError {
    #[error("Invalid topic: {0}")]
    InvalidTopic(&'static str),

    #[error("Not subscribed to topic: {0}")]
    NotSubscribed(String),

    #[error("Already subscribed to topic: {0}")]
    AlreadySubscribed(String),

    #[error("Maximum subscriptions reached")]
    MaxSubscriptionsReached,
}

/// Validate a topic name.
///
/// # Errors
///
/// Returns a description of the first rule the name breaks.
pub fn validate_topic(topic: &str) -> Result<(), &'static str> {
    if topic.is_empty() {
        return Err("Topic cannot be empty");
    }
    if topic.len() > MAX_TOPIC_LENGTH {
        return Err("Topic too long");
    }
    if !topic.chars().all(|c| c.is_ascii() && !c.is_ascii_control()) {
        return Err("Topic contains invalid characters");
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct FanoutConfig {
    /// Buffered publications per topic before slow subscribers lag.
    pub channel_capacity: usize,
    pub max_subscriptions_per_connection: usize,
}

impl Default for FanoutConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 1024,
            max_subscriptions_per_connection: 100,
        }
    }
}

struct TopicEntry {
    sender: broadcast::Sender<Arc<Publication>>,
    subscribers: DashSet<String>,
}

/// Topic router backed by one broadcast channel per topic.
///
/// Topics are created on first subscribe and dropped with their last
/// subscriber.
pub struct TopicRouter {
    topics: DashMap<String, TopicEntry>,
    /// connection id -> subscribed topics
    subscriptions: DashMap<String, DashSet<String>>,
    config: FanoutConfig,
}

impl TopicRouter {
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(FanoutConfig::default())
    }

    #[must_use]
    pub fn with_config(config: FanoutConfig) -> Self {
        info!(?config, "Creating topic router");
        Self {
            topics: DashMap::new(),
            subscriptions: DashMap::new(),
            config,
        }
    }

    /// Subscribe a connection to a topic.
    ///
    /// # Errors
    ///
    /// Fails on an invalid topic, a duplicate subscription, or when the
    /// connection is at its subscription limit.
    pub fn subscribe(
        &self,
        connection_id: &str,
        topic: &str,
    ) -> Result<broadcast::Receiver<Arc<Publication>>, FanoutError> {
        validate_topic(topic).map_err(FanoutError::InvalidTopic)?;

        let conn_subs = self
            .subscriptions
            .entry(connection_id.to_string())
            .or_default();
        if conn_subs.len() >= self.config.max_subscriptions_per_connection {
            return Err(FanoutError::MaxSubscriptionsReached);
        }
        if conn_subs.contains(topic) {
            return Err(FanoutError::AlreadySubscribed(topic.to_string()));
        }

        let entry = self.topics.entry(topic.to_string()).or_insert_with(|| {
            debug!(topic = %topic, "Creating topic");
            TopicEntry {
                sender: broadcast::channel(self.config.channel_capacity).0,
                subscribers: DashSet::new(),
            }
        });
        entry.subscribers.insert(connection_id.to_string());
        conn_subs.insert(topic.to_string());

        debug!(
            topic = %topic,
            connection = %connection_id,
            subscribers = entry.subscribers.len(),
            "Subscribed"
        );
        Ok(entry.sender.subscribe())
    }

    /// # Errors
    ///
    /// Returns [`FanoutError::NotSubscribed`] if the connection was not subscribed.
    pub fn unsubscribe(&self, connection_id: &str, topic: &str) -> Result<(), FanoutError> {
        let removed = self
            .subscriptions
            .get(connection_id)
            .is_some_and(|subs| subs.remove(topic).is_some());
        if !removed {
            return Err(FanoutError::NotSubscribed(topic.to_string()));
        }
        self.leave_topic(connection_id, topic);
        debug!(topic = %topic, connection = %connection_id, "Unsubscribed");
        Ok(())
    }

    /// Drop every subscription held by a connection.
    pub fn unsubscribe_all(&self, connection_id: &str) {
        if let Some((_, topics)) = self.subscriptions.remove(connection_id) {
            for topic in topics.iter() {
                self.leave_topic(connection_id, topic.as_str());
            }
        }
        debug!(connection = %connection_id, "Unsubscribed from all topics");
    }

    fn leave_topic(&self, connection_id: &str, topic: &str) {
        let now_empty = match self.topics.get(topic) {
            Some(entry) => {
                entry.subscribers.remove(connection_id);
                entry.subscribers.is_empty()
            }
            None => false,
        };
        if now_empty {
            self.topics
                .remove_if(topic, |_, entry| entry.subscribers.is_empty());
            debug!(topic = %topic, "Dropped empty topic");
        }
    }

    #[must_use]
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics
            .get(topic)
            .map(|e| e.subscribers.len())
            .unwrap_or(0)
    }

    #[must_use]
    pub fn stats(&self) -> FanoutStats {
        FanoutStats {
            topic_count: self.topics.len(),
            connection_count: self.subscriptions.len(),
            total_subscriptions: self.subscriptions.iter().map(|s| s.len()).sum(),
        }
    }
}

impl Default for TopicRouter {
    fn default() -> Self {
        Self::new()
    }
}

impl Fanout for TopicRouter {
    fn publish(&self, topic: &str, payload: Bytes) -> usize {
        let Some(entry) = self.topics.get(topic) else {
            trace!(topic = %topic, "No subscribers, dropping publication");
            return 0;
        };
        let publication = Arc::new(Publication {
            topic: topic.to_string(),
            payload,
        });
        let count = entry.sender.send(publication).unwrap_or_default();
        trace!(topic = %topic, recipients = count, "Published");
        count
    }
}

#[derive(Debug, Clone)]
pub struct FanoutStats {
    pub topic_count: usize,
    pub connection_count: usize,
    pub total_subscriptions: usize,
}
