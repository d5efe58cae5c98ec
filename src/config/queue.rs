//! Queue service configuration types.

use serde::Deserialize;

/// Queue backend discriminator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueType {
    /// In-process channel queue (no external service).
    #[default]
    Channel,
    /// Google Cloud Pub/Sub.
    Pubsub,
}

/// Queue service configuration (discriminated union).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Queue backend discriminator.
    #[serde(rename = "type")]
    pub queue_type: QueueType,
    /// GCP project ID (pubsub only).
    pub project_id: String,
    /// Delay before a nacked message is redelivered (channel only).
    pub redelivery_delay_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            queue_type: QueueType::Channel,
            project_id: String::new(),
            redelivery_delay_ms: 1_000,
        }
    }
}
