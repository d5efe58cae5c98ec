//! Fan-out pool: one handler per tenant decouple queue.

use std::sync::Arc;

use reqwest::Client;

use super::{PoolFlavor, SyncPool};
use crate::config::PoolConfig;
use crate::handler::HandlerOptions;
use crate::processors::{
    chain_processors, DeliverProcessor, FanoutProcessor, FilterProcessor, ProcessRequest,
};
use crate::queue::QueueService;
use crate::targets::{CellTenantKey, Queue, TargetsCache, TargetsConfig};

/// Keys the pool by tenant and consumes each tenant's decouple queue.
pub struct FanoutFlavor;

impl PoolFlavor for FanoutFlavor {
    type Key = CellTenantKey;

    fn name(&self) -> &'static str {
        "fanout"
    }

    fn desired(&self, snapshot: &TargetsConfig) -> Vec<(CellTenantKey, Queue)> {
        snapshot
            .tenants()
            .filter_map(|tenant| {
                let queue = tenant.usable_decouple_queue()?;
                queue
                    .is_consumable()
                    .then(|| (tenant.key(), queue.clone()))
            })
            .collect()
    }

    fn request(&self, key: &CellTenantKey) -> ProcessRequest {
        ProcessRequest::for_tenant(key.clone())
    }
}

/// Fan-out pool with the fanout → filter → deliver chain. Failed deliveries
/// go to the target's retry queue.
pub fn fanout_pool(
    targets: Arc<TargetsCache>,
    queue: Arc<dyn QueueService>,
    client: Client,
    config: &PoolConfig,
) -> SyncPool<FanoutFlavor> {
    let chain = chain_processors(vec![
        Arc::new(FanoutProcessor::new(
            targets.clone(),
            config.max_concurrency_per_event,
        )),
        Arc::new(FilterProcessor::new(targets.clone())),
        Arc::new(
            DeliverProcessor::new(client, targets.clone(), queue.clone())
                .with_retry_on_failure(true)
                .with_delivery_timeout(config.delivery_timeout())
                .with_retry_publish(config.retry_publish.clone()),
        ),
    ]);

    SyncPool::new(
        FanoutFlavor,
        targets,
        queue,
        chain,
        HandlerOptions {
            concurrency: config.handler_concurrency,
            timeout_per_event: config.timeout_per_event(),
        },
    )
}
