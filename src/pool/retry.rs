//! Retry pool: one handler per target retry queue.

use std::sync::Arc;

use reqwest::Client;

use super::{PoolFlavor, SyncPool};
use crate::config::PoolConfig;
use crate::handler::HandlerOptions;
use crate::processors::{chain_processors, DeliverProcessor, FilterProcessor, ProcessRequest};
use crate::queue::QueueService;
use crate::targets::{Queue, TargetKey, TargetsCache, TargetsConfig};

/// Keys the pool by target and consumes each target's retry queue.
pub struct RetryFlavor;

impl PoolFlavor for RetryFlavor {
    type Key = TargetKey;

    fn name(&self) -> &'static str {
        "retry"
    }

    fn desired(&self, snapshot: &TargetsConfig) -> Vec<(TargetKey, Queue)> {
        snapshot
            .targets()
            .filter_map(|target| {
                let queue = target.retry_queue.as_ref()?;
                queue.is_consumable().then(|| (target.key(), queue.clone()))
            })
            .collect()
    }

    fn request(&self, key: &TargetKey) -> ProcessRequest {
        ProcessRequest::for_target(key.clone())
    }
}

/// Retry pool with the filter → deliver chain. A failed delivery nacks the
/// message, leaving redelivery to the retry queue.
pub fn retry_pool(
    targets: Arc<TargetsCache>,
    queue: Arc<dyn QueueService>,
    client: Client,
    config: &PoolConfig,
) -> SyncPool<RetryFlavor> {
    let chain = chain_processors(vec![
        Arc::new(FilterProcessor::new(targets.clone())),
        Arc::new(
            DeliverProcessor::new(client, targets.clone(), queue.clone())
                .with_delivery_timeout(config.delivery_timeout()),
        ),
    ]);

    SyncPool::new(
        RetryFlavor,
        targets,
        queue,
        chain,
        HandlerOptions {
            concurrency: config.handler_concurrency,
            timeout_per_event: config.timeout_per_event(),
        },
    )
}
