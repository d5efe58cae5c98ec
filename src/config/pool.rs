//! Snapshot source, pool and ingress configuration types.

use std::time::Duration;

use serde::Deserialize;

use crate::queue::PublishSettings;

/// Location of the mounted targets snapshot.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TargetsSourceConfig {
    /// Path of the binary snapshot file written by the control plane.
    pub path: String,
    /// How often the file is checked for changes.
    pub poll_interval_ms: u64,
}

impl Default for TargetsSourceConfig {
    fn default() -> Self {
        Self {
            path: "/etc/cellbroker/targets".to_string(),
            poll_interval_ms: 1_000,
        }
    }
}

impl TargetsSourceConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Settings shared by the fan-out and retry pools.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Workers per handler. Zero means one per available core.
    pub handler_concurrency: usize,
    /// Upper bound on processing one event. Zero disables the bound.
    pub timeout_per_event_ms: u64,
    /// Timeout of a single HTTP delivery attempt.
    pub delivery_timeout_ms: u64,
    /// Targets delivered in parallel for one event (fan-out pool only).
    pub max_concurrency_per_event: usize,
    /// Settings for publishing failed deliveries to retry topics.
    pub retry_publish: PublishSettings,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            handler_concurrency: 0,
            timeout_per_event_ms: 0,
            delivery_timeout_ms: 30_000,
            max_concurrency_per_event: 100,
            retry_publish: PublishSettings::default(),
        }
    }
}

impl PoolConfig {
    pub fn timeout_per_event(&self) -> Option<Duration> {
        (self.timeout_per_event_ms > 0).then(|| Duration::from_millis(self.timeout_per_event_ms))
    }

    pub fn delivery_timeout(&self) -> Duration {
        Duration::from_millis(self.delivery_timeout_ms)
    }
}

/// Decouple router settings.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct IngressConfig {
    /// Drop events that no target of the tenant would accept.
    pub enable_event_filtering: bool,
    /// Publish settings for decouple queues.
    pub publish: PublishSettings,
}
