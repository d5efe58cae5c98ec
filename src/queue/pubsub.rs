//! Google Pub/Sub queue service.
//!
//! Topics and subscriptions map one-to-one onto Pub/Sub resources. Messages
//! are pulled in small batches and handed to consumers one at a time; ack
//! and nack go straight back to Pub/Sub, so redelivery timing follows the
//! subscription's own configuration.
//!
//! # Authentication
//!
//! Uses ADC (Application Default Credentials):
//! - Set `GOOGLE_APPLICATION_CREDENTIALS` to a service account JSON path
//! - For local testing: set `PUBSUB_EMULATOR_HOST` to the emulator address

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use backon::{BackoffBuilder, ExponentialBuilder};
use dashmap::DashMap;
use google_cloud_googleapis::pubsub::v1::PubsubMessage;
use google_cloud_pubsub::client::{Client, ClientConfig};
use google_cloud_pubsub::publisher::{Publisher, PublisherConfig};
use google_cloud_pubsub::subscriber::ReceivedMessage;
use google_cloud_pubsub::subscription::{Subscription as PubSubSubscription, SubscriptionConfig};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use super::{
    Acker, Delivery, Outcome, PublishSettings, QueueError, QueueMessage, QueueService, Result,
    Subscription,
};

/// Messages requested per pull.
const PULL_BATCH: i32 = 10;

struct TopicPublisher {
    publisher: Publisher,
    outstanding: AtomicUsize,
    outstanding_bytes: AtomicUsize,
}

impl TopicPublisher {
    fn release(&self, size: usize) {
        self.outstanding.fetch_sub(1, Ordering::SeqCst);
        self.outstanding_bytes.fetch_sub(size, Ordering::SeqCst);
    }
}

/// Google Pub/Sub queue service.
pub struct PubSubQueue {
    client: Client,
    project_id: String,
    publishers: DashMap<String, Arc<TopicPublisher>>,
}

impl PubSubQueue {
    /// Connect using Application Default Credentials.
    pub async fn new(project_id: &str) -> Result<Self> {
        let client_config = ClientConfig::default().with_auth().await.map_err(|e| {
            QueueError::Connection(format!("Failed to configure Pub/Sub auth: {}", e))
        })?;

        let client = Client::new(client_config).await.map_err(|e| {
            QueueError::Connection(format!("Failed to create Pub/Sub client: {}", e))
        })?;

        info!(project_id = %project_id, "Connected to Google Pub/Sub");

        Ok(Self {
            client,
            project_id: project_id.to_string(),
            publishers: DashMap::new(),
        })
    }

    /// Get or create the publisher for a topic. The first caller's batching
    /// settings apply for the lifetime of the publisher.
    async fn publisher(&self, topic: &str, settings: &PublishSettings) -> Result<Arc<TopicPublisher>> {
        if let Some(existing) = self.publishers.get(topic) {
            return Ok(existing.clone());
        }

        let handle = self.client.topic(topic);
        if !handle
            .exists(None)
            .await
            .map_err(|e| QueueError::Publish(format!("Failed to check topic existence: {}", e)))?
        {
            handle.create(None, None).await.map_err(|e| {
                QueueError::Publish(format!("Failed to create topic {}: {}", topic, e))
            })?;
            info!(topic = %topic, project_id = %self.project_id, "Created Pub/Sub topic");
        }

        let publisher = handle.new_publisher(Some(PublisherConfig {
            flush_interval: Duration::from_millis(settings.flush_interval_ms),
            bundle_size: settings.bundle_size,
            ..Default::default()
        }));

        let entry = self
            .publishers
            .entry(topic.to_string())
            .or_insert_with(|| {
                Arc::new(TopicPublisher {
                    publisher,
                    outstanding: AtomicUsize::new(0),
                    outstanding_bytes: AtomicUsize::new(0),
                })
            })
            .clone();
        Ok(entry)
    }
}

#[async_trait]
impl QueueService for PubSubQueue {
    #[tracing::instrument(name = "queue.publish", skip_all, fields(topic = %topic))]
    async fn publish(
        &self,
        topic: &str,
        message: QueueMessage,
        settings: &PublishSettings,
    ) -> Result<String> {
        let publisher = self.publisher(topic, settings).await?;

        let size = message.size();
        let limit = settings.max_outstanding_messages;
        let byte_limit = settings.max_outstanding_bytes;
        let in_flight = publisher.outstanding.fetch_add(1, Ordering::SeqCst);
        let in_flight_bytes = publisher.outstanding_bytes.fetch_add(size, Ordering::SeqCst);
        if limit > 0 && in_flight >= limit {
            publisher.release(size);
            return Err(QueueError::BufferFull {
                topic: topic.to_string(),
                limit,
            });
        }
        if byte_limit > 0 && in_flight_bytes >= byte_limit {
            publisher.release(size);
            return Err(QueueError::BufferBytesFull {
                topic: topic.to_string(),
                limit: byte_limit,
            });
        }

        let pubsub_message = PubsubMessage {
            data: message.data.into(),
            attributes: message.attributes,
            ..Default::default()
        };

        let awaiter = publisher.publisher.publish(pubsub_message).await;
        let result = awaiter.get().await;
        publisher.release(size);

        let id = result
            .map_err(|e| QueueError::Publish(format!("Failed to publish to Pub/Sub: {}", e)))?;
        debug!(message_id = %id, "Published message to Pub/Sub");
        Ok(id)
    }

    async fn subscribe(&self, topic: &str, subscription: &str) -> Result<Arc<dyn Subscription>> {
        let handle = self.client.subscription(subscription);

        if !handle.exists(None).await.map_err(|e| {
            QueueError::Subscribe(format!("Failed to check subscription existence: {}", e))
        })? {
            let topic_handle = self.client.topic(topic);
            handle
                .create(
                    topic_handle.fully_qualified_name(),
                    SubscriptionConfig::default(),
                    None,
                )
                .await
                .map_err(|e| {
                    QueueError::Subscribe(format!(
                        "Failed to create subscription {}: {}",
                        subscription, e
                    ))
                })?;
            info!(subscription = %subscription, topic = %topic, "Created Pub/Sub subscription");
        }

        Ok(Arc::new(PubSubConsumer {
            name: subscription.to_string(),
            subscription: handle,
            buffered: Mutex::new(VecDeque::new()),
            open: std::sync::atomic::AtomicBool::new(true),
        }))
    }
}

/// Pull-based consumer for one Pub/Sub subscription.
struct PubSubConsumer {
    name: String,
    subscription: PubSubSubscription,
    buffered: Mutex<VecDeque<ReceivedMessage>>,
    open: std::sync::atomic::AtomicBool,
}

impl PubSubConsumer {
    /// Whether the subscription still exists after a failed pull.
    async fn still_exists(&self) -> bool {
        match self.subscription.exists(None).await {
            Ok(exists) => exists,
            Err(e) => {
                debug!(subscription = %self.name, error = %e, "Existence check failed");
                true
            }
        }
    }
}

#[async_trait]
impl Subscription for PubSubConsumer {
    fn name(&self) -> &str {
        &self.name
    }

    async fn receive(&self) -> Result<Delivery> {
        let backoff_builder = ExponentialBuilder::default()
            .with_min_delay(Duration::from_millis(100))
            .with_max_delay(Duration::from_secs(10))
            .with_jitter();
        let mut backoff_iter = backoff_builder.build();

        let mut buffered = self.buffered.lock().await;
        loop {
            if !self.is_open() {
                return Err(QueueError::Closed);
            }
            if let Some(received) = buffered.pop_front() {
                let message = QueueMessage {
                    id: received.message.message_id.clone(),
                    data: received.message.data.to_vec(),
                    attributes: received.message.attributes.clone(),
                };
                return Ok(Delivery::new(message, Box::new(PubSubAcker { received })));
            }

            match self.subscription.pull(PULL_BATCH, None).await {
                Ok(messages) => {
                    backoff_iter = backoff_builder.build();
                    buffered.extend(messages);
                }
                Err(e) => {
                    if !self.still_exists().await {
                        self.open.store(false, Ordering::SeqCst);
                        info!(subscription = %self.name, "Pub/Sub subscription deleted");
                        return Err(QueueError::Closed);
                    }
                    let delay = backoff_iter.next().unwrap_or(Duration::from_secs(10));
                    warn!(
                        subscription = %self.name,
                        error = %e,
                        backoff_ms = %delay.as_millis(),
                        "Failed to pull messages from Pub/Sub, retrying after backoff"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}

struct PubSubAcker {
    received: ReceivedMessage,
}

#[async_trait]
impl Acker for PubSubAcker {
    async fn finish(self: Box<Self>, outcome: Outcome) {
        let result = match outcome {
            Outcome::Ack => self.received.ack().await,
            Outcome::Nack => self.received.nack().await,
        };
        if let Err(e) = result {
            error!(
                message_id = %self.received.message.message_id,
                outcome = ?outcome,
                error = %e,
                "Failed to settle Pub/Sub message"
            );
        }
    }
}
