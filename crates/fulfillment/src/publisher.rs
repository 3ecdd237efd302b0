//! Message publisher trait and implementations.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use serde_json::Value;

use crate::error::PublishError;

/// Topic carrying work-queue messages for downstream order processing.
pub const TOPIC_ORDER_PROCESSING: &str = "orders.processing";

/// Topic carrying human-readable order notifications.
pub const TOPIC_ORDER_NOTIFICATIONS: &str = "orders.notifications";

/// A message handed to a publisher.
#[derive(Debug, Clone, PartialEq)]
pub struct PublishedMessage {
    pub topic: String,
    pub payload: Value,
}

/// Trait for publishing messages to a broker.
///
/// Delivery is at most once; callers never retry.
#[async_trait]
pub trait MessagePublisher: Send + Sync {
    async fn publish(&self, topic: &str, payload: Value) -> Result<(), PublishError>;
}

#[derive(Debug, Default)]
struct InMemoryPublisherState {
    messages: Vec<PublishedMessage>,
    fail_on_publish: bool,
}

/// In-memory publisher that records every message.
#[derive(Debug, Clone, Default)]
pub struct InMemoryPublisher {
    state: Arc<Mutex<InMemoryPublisherState>>,
}

impl InMemoryPublisher {
    /// Creates a new in-memory publisher.
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, InMemoryPublisherState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Configures the publisher to refuse every message.
    pub fn set_fail_on_publish(&self, fail: bool) {
        self.state().fail_on_publish = fail;
    }

    /// Returns every message published so far.
    pub fn messages(&self) -> Vec<PublishedMessage> {
        self.state().messages.clone()
    }

    /// Returns the messages published to `topic`.
    pub fn messages_on(&self, topic: &str) -> Vec<PublishedMessage> {
        self.state()
            .messages
            .iter()
            .filter(|message| message.topic == topic)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl MessagePublisher for InMemoryPublisher {
    async fn publish(&self, topic: &str, payload: Value) -> Result<(), PublishError> {
        let mut state = self.state();

        if state.fail_on_publish {
            return Err(PublishError::Transport("broker unavailable".to_string()));
        }

        state.messages.push(PublishedMessage {
            topic: topic.to_string(),
            payload,
        });
        Ok(())
    }
}

/// Publisher backed by a NATS connection.
#[derive(Debug, Clone)]
pub struct NatsPublisher {
    client: async_nats::Client,
}

impl NatsPublisher {
    /// Connects to the NATS server at `url`.
    pub async fn connect(url: &str) -> Result<Self, PublishError> {
        let client = async_nats::connect(url)
            .await
            .map_err(|e| PublishError::Transport(e.to_string()))?;
        tracing::info!(url, "Connected to NATS");
        Ok(Self { client })
    }

    pub fn from_client(client: async_nats::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl MessagePublisher for NatsPublisher {
    #[tracing::instrument(skip(self, payload))]
    async fn publish(&self, topic: &str, payload: Value) -> Result<(), PublishError> {
        let bytes = serde_json::to_vec(&payload)?;
        self.client
            .publish(topic.to_string(), bytes.into())
            .await
            .map_err(|e| PublishError::Transport(e.to_string()))?;
        tracing::debug!(topic, "Message published");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[tokio::test]
    async fn test_publish_records_messages() {
        let publisher = InMemoryPublisher::new();

        publisher
            .publish(TOPIC_ORDER_PROCESSING, json!({"order_id": "a"}))
            .await
            .unwrap();
        publisher
            .publish(TOPIC_ORDER_NOTIFICATIONS, json!({"subject": "Order Placed"}))
            .await
            .unwrap();

        assert_eq!(publisher.messages().len(), 2);
        let processing = publisher.messages_on(TOPIC_ORDER_PROCESSING);
        assert_eq!(processing.len(), 1);
        assert_eq!(processing[0].payload["order_id"], "a");
    }

    #[tokio::test]
    async fn test_fail_on_publish() {
        let publisher = InMemoryPublisher::new();
        publisher.set_fail_on_publish(true);

        let result = publisher.publish(TOPIC_ORDER_PROCESSING, json!({})).await;

        assert!(matches!(result, Err(PublishError::Transport(_))));
        assert!(publisher.messages().is_empty());
    }
}
