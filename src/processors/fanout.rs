//! Fans one tenant event out to each of the tenant's targets.

use std::sync::Arc;

use async_trait::async_trait;
use cloudevents::{AttributesReader, Event};
use futures::stream::{self, StreamExt};
use tracing::{debug, warn};

use super::{Link, ProcessError, ProcessRequest, Processor, Result};
use crate::targets::TargetsCache;

/// Runs the rest of the chain once per target of the request's tenant.
///
/// At most `max_concurrency` targets are in flight for one event. Every
/// target is attempted; the event fails if any target fails.
pub struct FanoutProcessor {
    link: Link,
    targets: Arc<TargetsCache>,
    max_concurrency: usize,
}

impl FanoutProcessor {
    pub fn new(targets: Arc<TargetsCache>, max_concurrency: usize) -> Self {
        Self {
            link: Link::default(),
            targets,
            max_concurrency: max_concurrency.max(1),
        }
    }
}

#[async_trait]
impl Processor for FanoutProcessor {
    fn name(&self) -> &'static str {
        "fanout"
    }

    fn link(&self) -> &Link {
        &self.link
    }

    async fn process(&self, request: &ProcessRequest, event: &Event) -> Result<()> {
        let snapshot = self.targets.load();
        let Some(tenant) = snapshot.tenant(&request.tenant) else {
            debug!(tenant = %request.tenant, "Tenant not found, skipping event");
            return Ok(());
        };

        let next = self.next();
        let requests: Vec<ProcessRequest> = tenant
            .targets
            .keys()
            .map(|name| request.with_target(name))
            .collect();
        let total = requests.len();

        let failed = stream::iter(requests)
            .map(|target_request| {
                let next = next.clone();
                async move {
                    let result = next.process(&target_request, event).await;
                    if let Err(e) = &result {
                        warn!(
                            target = ?target_request.target,
                            event_id = %event.id(),
                            error = %e,
                            "Target delivery failed"
                        );
                    }
                    result.is_err()
                }
            })
            .buffer_unordered(self.max_concurrency)
            .filter(|failed| futures::future::ready(*failed))
            .count()
            .await;

        if failed > 0 {
            return Err(ProcessError::Fanout { failed, total });
        }
        Ok(())
    }
}
