//! In-memory channel-based queue service for standalone mode.
//!
//! Topics fan out to every attached subscription; each subscription is an
//! mpsc queue shared by all of its consumers. Messages are redelivered when
//! nacked or when a delivery is dropped without being finished, which gives
//! the same at-least-once contract as a real queue service without external
//! dependencies. Ideal for local development and testing.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::{
    Acker, Delivery, Outcome, PublishSettings, QueueError, QueueMessage, QueueService, Result,
    Subscription,
};
use crate::config::QueueConfig;

/// Configuration for the channel queue.
#[derive(Clone, Debug, Default)]
pub struct ChannelQueueConfig {
    /// Delay before a nacked or expired message is delivered again.
    pub redelivery_delay: Duration,
}

/// Most recent messages kept per topic for [`ChannelQueue::published`].
pub const PUBLISHED_LOG_CAPACITY: usize = 256;

impl From<&QueueConfig> for ChannelQueueConfig {
    fn from(config: &QueueConfig) -> Self {
        Self {
            redelivery_delay: Duration::from_millis(config.redelivery_delay_ms),
        }
    }
}

/// Delivery counters for one subscription.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubscriptionStats {
    pub delivered: usize,
    pub acked: usize,
    pub nacked: usize,
    pub expired: usize,
    pub outstanding: usize,
    pub outstanding_bytes: usize,
}

struct SubscriptionState {
    name: String,
    sender: mpsc::UnboundedSender<QueueMessage>,
    receiver: Mutex<mpsc::UnboundedReceiver<QueueMessage>>,
    closed: CancellationToken,
    outstanding: AtomicUsize,
    outstanding_bytes: AtomicUsize,
    delivered: AtomicUsize,
    acked: AtomicUsize,
    nacked: AtomicUsize,
    expired: AtomicUsize,
}

impl SubscriptionState {
    fn new(name: &str) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            name: name.to_string(),
            sender,
            receiver: Mutex::new(receiver),
            closed: CancellationToken::new(),
            outstanding: AtomicUsize::new(0),
            outstanding_bytes: AtomicUsize::new(0),
            delivered: AtomicUsize::new(0),
            acked: AtomicUsize::new(0),
            nacked: AtomicUsize::new(0),
            expired: AtomicUsize::new(0),
        }
    }

    fn enqueue(&self, message: QueueMessage) {
        self.outstanding.fetch_add(1, Ordering::SeqCst);
        self.outstanding_bytes
            .fetch_add(message.size(), Ordering::SeqCst);
        // The state owns a receiver, so the channel is never disconnected.
        let _ = self.sender.send(message);
    }

    fn redeliver(self: &Arc<Self>, message: QueueMessage, delay: Duration) {
        if self.closed.is_cancelled() {
            self.settle(&message);
            return;
        }
        if delay.is_zero() {
            let _ = self.sender.send(message);
            return;
        }
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let state = self.clone();
                handle.spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = state.sender.send(message);
                });
            }
            Err(_) => {
                let _ = self.sender.send(message);
            }
        }
    }

    /// Drop a message from the outstanding counters.
    fn settle(&self, message: &QueueMessage) {
        self.outstanding.fetch_sub(1, Ordering::SeqCst);
        self.outstanding_bytes
            .fetch_sub(message.size(), Ordering::SeqCst);
    }

    fn stats(&self) -> SubscriptionStats {
        SubscriptionStats {
            delivered: self.delivered.load(Ordering::SeqCst),
            acked: self.acked.load(Ordering::SeqCst),
            nacked: self.nacked.load(Ordering::SeqCst),
            expired: self.expired.load(Ordering::SeqCst),
            outstanding: self.outstanding.load(Ordering::SeqCst),
            outstanding_bytes: self.outstanding_bytes.load(Ordering::SeqCst),
        }
    }
}

#[derive(Default)]
struct Topic {
    subscriptions: DashMap<String, Arc<SubscriptionState>>,
    published: Mutex<VecDeque<QueueMessage>>,
}

/// In-memory queue service.
#[derive(Default)]
pub struct ChannelQueue {
    topics: DashMap<String, Arc<Topic>>,
    config: ChannelQueueConfig,
}

impl ChannelQueue {
    pub fn new(config: ChannelQueueConfig) -> Self {
        info!(
            redelivery_delay_ms = config.redelivery_delay.as_millis() as u64,
            "Channel queue initialized"
        );
        Self {
            topics: DashMap::new(),
            config,
        }
    }

    fn topic(&self, name: &str) -> Arc<Topic> {
        self.topics
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Topic::default()))
            .clone()
    }

    /// Close and delete a subscription. Its consumers see end of stream.
    pub fn close_subscription(&self, topic: &str, subscription: &str) {
        if let Some(topic) = self.topics.get(topic) {
            if let Some((_, state)) = topic.subscriptions.remove(subscription) {
                state.closed.cancel();
                info!(subscription = %subscription, "Channel subscription closed");
            }
        }
    }

    /// The last [`PUBLISHED_LOG_CAPACITY`] messages published to `topic`,
    /// oldest first.
    pub async fn published(&self, topic: &str) -> Vec<QueueMessage> {
        match self.topics.get(topic).map(|t| t.clone()) {
            Some(topic) => topic.published.lock().await.iter().cloned().collect(),
            None => Vec::new(),
        }
    }

    pub fn stats(&self, topic: &str, subscription: &str) -> Option<SubscriptionStats> {
        self.topics
            .get(topic)?
            .subscriptions
            .get(subscription)
            .map(|s| s.stats())
    }
}

#[async_trait]
impl QueueService for ChannelQueue {
    #[tracing::instrument(name = "queue.publish", skip_all, fields(topic = %topic))]
    async fn publish(
        &self,
        topic: &str,
        mut message: QueueMessage,
        settings: &PublishSettings,
    ) -> Result<String> {
        let state = self.topic(topic);
        let subscriptions: Vec<Arc<SubscriptionState>> = state
            .subscriptions
            .iter()
            .map(|entry| entry.value().clone())
            .collect();

        let limit = settings.max_outstanding_messages;
        if limit > 0
            && subscriptions
                .iter()
                .any(|s| s.outstanding.load(Ordering::SeqCst) >= limit)
        {
            return Err(QueueError::BufferFull {
                topic: topic.to_string(),
                limit,
            });
        }

        let byte_limit = settings.max_outstanding_bytes;
        if byte_limit > 0
            && subscriptions
                .iter()
                .any(|s| s.outstanding_bytes.load(Ordering::SeqCst) >= byte_limit)
        {
            return Err(QueueError::BufferBytesFull {
                topic: topic.to_string(),
                limit: byte_limit,
            });
        }

        if message.id.is_empty() {
            message.id = uuid::Uuid::new_v4().to_string();
        }
        for subscription in &subscriptions {
            subscription.enqueue(message.clone());
        }

        let id = message.id.clone();
        let mut log = state.published.lock().await;
        if log.len() == PUBLISHED_LOG_CAPACITY {
            log.pop_front();
        }
        log.push_back(message);
        drop(log);

        debug!(
            message_id = %id,
            receivers = subscriptions.len(),
            "Published message to channel topic"
        );
        Ok(id)
    }

    async fn subscribe(&self, topic: &str, subscription: &str) -> Result<Arc<dyn Subscription>> {
        let state = self
            .topic(topic)
            .subscriptions
            .entry(subscription.to_string())
            .or_insert_with(|| Arc::new(SubscriptionState::new(subscription)))
            .clone();

        debug!(topic = %topic, subscription = %subscription, "Opened channel subscription");

        Ok(Arc::new(ChannelSubscription {
            state,
            redelivery_delay: self.config.redelivery_delay,
        }))
    }
}

/// Consumer handle on a channel subscription.
pub struct ChannelSubscription {
    state: Arc<SubscriptionState>,
    redelivery_delay: Duration,
}

#[async_trait]
impl Subscription for ChannelSubscription {
    fn name(&self) -> &str {
        &self.state.name
    }

    async fn receive(&self) -> Result<Delivery> {
        let closed = &self.state.closed;
        if closed.is_cancelled() {
            return Err(QueueError::Closed);
        }

        let mut receiver = tokio::select! {
            _ = closed.cancelled() => return Err(QueueError::Closed),
            guard = self.state.receiver.lock() => guard,
        };
        let message = tokio::select! {
            _ = closed.cancelled() => return Err(QueueError::Closed),
            message = receiver.recv() => message.ok_or(QueueError::Closed)?,
        };
        drop(receiver);

        self.state.delivered.fetch_add(1, Ordering::SeqCst);
        let acker = ChannelAcker {
            message: Some(message.clone()),
            state: self.state.clone(),
            redelivery_delay: self.redelivery_delay,
        };
        Ok(Delivery::new(message, Box::new(acker)))
    }

    fn is_open(&self) -> bool {
        !self.state.closed.is_cancelled()
    }
}

struct ChannelAcker {
    /// Taken on finish; still present on drop means the lease expired.
    message: Option<QueueMessage>,
    state: Arc<SubscriptionState>,
    redelivery_delay: Duration,
}

#[async_trait]
impl Acker for ChannelAcker {
    async fn finish(mut self: Box<Self>, outcome: Outcome) {
        let Some(message) = self.message.take() else {
            return;
        };
        match outcome {
            Outcome::Ack => {
                self.state.acked.fetch_add(1, Ordering::SeqCst);
                self.state.settle(&message);
            }
            Outcome::Nack => {
                self.state.nacked.fetch_add(1, Ordering::SeqCst);
                self.state.redeliver(message, self.redelivery_delay);
            }
        }
    }
}

impl Drop for ChannelAcker {
    fn drop(&mut self) {
        if let Some(message) = self.message.take() {
            self.state.expired.fetch_add(1, Ordering::SeqCst);
            self.state.redeliver(message, self.redelivery_delay);
        }
    }
}
