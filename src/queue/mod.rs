//! Queue service abstraction.
//!
//! The broker relies on an external queue service for durable topics and
//! subscriptions with at-least-once delivery. This module contains:
//! - `QueueService` trait: publish to a topic, open a subscription
//! - `Subscription` trait: receive messages one at a time
//! - `Delivery`: a received message that must be finished exactly once
//! - Implementations: in-process channel queue, Google Pub/Sub (feature `pubsub`)
//!
//! Redelivery timing after a nack belongs to the queue service (subscription
//! configuration), not to the data plane.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::info;

pub mod channel;
#[cfg(feature = "pubsub")]
pub mod pubsub;

pub use channel::{ChannelQueue, ChannelQueueConfig};
#[cfg(feature = "pubsub")]
pub use pubsub::PubSubQueue;

use crate::config::{QueueConfig, QueueType};

/// Result type for queue operations.
pub type Result<T> = std::result::Result<T, QueueError>;

/// Errors that can occur during queue operations.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    /// End of stream: the subscription was closed or deleted.
    #[error("Subscription closed")]
    Closed,

    #[error("Publish buffer full for topic {topic} ({limit} outstanding messages)")]
    BufferFull { topic: String, limit: usize },

    #[error("Publish buffer full for topic {topic} ({limit} outstanding bytes)")]
    BufferBytesFull { topic: String, limit: usize },

    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Publish failed: {0}")]
    Publish(String),

    #[error("Subscribe failed: {0}")]
    Subscribe(String),

    #[error("Receive failed: {0}")]
    Receive(String),
}

/// A raw queue message: opaque payload plus string attributes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueueMessage {
    /// Service-assigned message ID (empty before publish).
    pub id: String,
    pub data: Vec<u8>,
    pub attributes: HashMap<String, String>,
}

impl QueueMessage {
    /// Bytes counted against `max_outstanding_bytes`: payload plus attributes.
    pub fn size(&self) -> usize {
        self.data.len()
            + self
                .attributes
                .iter()
                .map(|(k, v)| k.len() + v.len())
                .sum::<usize>()
    }
}

/// How a delivery is finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Ack,
    Nack,
}

/// Backend hook that settles one received message.
#[async_trait]
pub trait Acker: Send {
    async fn finish(self: Box<Self>, outcome: Outcome);
}

/// A received message awaiting acknowledgement.
///
/// Finishing consumes the delivery, so a message can be acked or nacked at
/// most once. A delivery dropped without finishing is left to the queue
/// service's lease expiry.
pub struct Delivery {
    message: QueueMessage,
    acker: Box<dyn Acker>,
}

impl Delivery {
    pub fn new(message: QueueMessage, acker: Box<dyn Acker>) -> Self {
        Self { message, acker }
    }

    pub fn message(&self) -> &QueueMessage {
        &self.message
    }

    pub async fn finish(self, outcome: Outcome) {
        self.acker.finish(outcome).await;
    }

    pub async fn ack(self) {
        self.finish(Outcome::Ack).await;
    }

    pub async fn nack(self) {
        self.finish(Outcome::Nack).await;
    }
}

/// Batching and flow-control settings for publishing.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PublishSettings {
    /// Maximum messages buffered (unacknowledged) before publish fails.
    /// Zero means unlimited.
    pub max_outstanding_messages: usize,
    /// Maximum bytes buffered before publish fails. Zero means unlimited.
    pub max_outstanding_bytes: usize,
    /// How long the publisher waits to fill a batch.
    pub flush_interval_ms: u64,
    /// Maximum messages per batch.
    pub bundle_size: usize,
}

impl Default for PublishSettings {
    fn default() -> Self {
        Self {
            max_outstanding_messages: 10_000,
            max_outstanding_bytes: 100 * 1024 * 1024,
            flush_interval_ms: 100,
            bundle_size: 100,
        }
    }
}

/// One open subscription.
#[async_trait]
pub trait Subscription: Send + Sync {
    fn name(&self) -> &str;

    /// Wait for the next message. Returns `QueueError::Closed` at end of
    /// stream; any other error is transient.
    async fn receive(&self) -> Result<Delivery>;

    /// Whether the subscription can still deliver messages.
    fn is_open(&self) -> bool;
}

/// Durable topics and subscriptions with at-least-once delivery.
#[async_trait]
pub trait QueueService: Send + Sync {
    /// Publish a message, returning the assigned message ID.
    async fn publish(
        &self,
        topic: &str,
        message: QueueMessage,
        settings: &PublishSettings,
    ) -> Result<String>;

    /// Open (creating if needed) a subscription on a topic.
    async fn subscribe(&self, topic: &str, subscription: &str) -> Result<Arc<dyn Subscription>>;
}

/// Initialize the queue service selected by configuration.
///
/// Requires the corresponding feature to be enabled:
/// - Channel: always available
/// - Pub/Sub: `--features pubsub`
pub async fn init_queue_service(config: &QueueConfig) -> Result<Arc<dyn QueueService>> {
    match config.queue_type {
        QueueType::Channel => {
            let queue = ChannelQueue::new(ChannelQueueConfig::from(config));
            info!(queue_type = "channel", "Queue service initialized");
            Ok(Arc::new(queue))
        }
        QueueType::Pubsub => {
            #[cfg(feature = "pubsub")]
            {
                let queue = PubSubQueue::new(&config.project_id).await?;
                info!(queue_type = "pubsub", project_id = %config.project_id, "Queue service initialized");
                Ok(Arc::new(queue))
            }

            #[cfg(not(feature = "pubsub"))]
            {
                Err(QueueError::Connection(
                    "Pub/Sub support requires the 'pubsub' feature. Rebuild with --features pubsub"
                        .to_string(),
                ))
            }
        }
    }
}
