//! HTTP delivery to a target, reply forwarding and retry hand-off.
//!
//! Delivery outcome handling:
//! - 2xx, no reply event: success
//! - 2xx with a reply event: forward the reply to the tenant address with
//!   one hop less, or drop it when the original has no hops left
//! - non-2xx, transport error or failed forward: hand the original event to
//!   the target's retry queue when `retry_on_failure` is set, else fail

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use cloudevents::binding::reqwest::{response_to_event, RequestBuilderExt};
use cloudevents::{AttributesReader, Event};
use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, Response};
use tracing::{debug, error, warn};

use super::{Link, ProcessError, ProcessRequest, Processor, Result};
use crate::event::{
    delete_remaining_hops, encode_message, remaining_hops, set_remaining_hops, DEFAULT_HOPS,
};
use crate::queue::{PublishSettings, QueueService};
use crate::targets::{CellTenant, Target, TargetsCache};

/// Default timeout of one HTTP attempt.
pub const DEFAULT_DELIVERY_TIMEOUT: Duration = Duration::from_secs(30);

/// Delivers events to the request's target.
pub struct DeliverProcessor {
    link: Link,
    client: Client,
    targets: Arc<TargetsCache>,
    queue: Arc<dyn QueueService>,
    retry_on_failure: bool,
    delivery_timeout: Duration,
    retry_publish: PublishSettings,
}

impl DeliverProcessor {
    pub fn new(
        client: Client,
        targets: Arc<TargetsCache>,
        queue: Arc<dyn QueueService>,
    ) -> Self {
        Self {
            link: Link::default(),
            client,
            targets,
            queue,
            retry_on_failure: false,
            delivery_timeout: DEFAULT_DELIVERY_TIMEOUT,
            retry_publish: PublishSettings::default(),
        }
    }

    /// Hand failed deliveries to the target's retry queue instead of failing.
    pub fn with_retry_on_failure(mut self, retry: bool) -> Self {
        self.retry_on_failure = retry;
        self
    }

    pub fn with_delivery_timeout(mut self, timeout: Duration) -> Self {
        self.delivery_timeout = timeout;
        self
    }

    pub fn with_retry_publish(mut self, settings: PublishSettings) -> Self {
        self.retry_publish = settings;
        self
    }

    async fn post(&self, address: &str, event: Event) -> std::result::Result<Response, String> {
        let request = self
            .client
            .post(address)
            .timeout(self.delivery_timeout)
            .event(event)
            .map_err(|e| format!("failed to encode event: {e}"))?;

        let response = request.send().await.map_err(|e| e.to_string())?;
        let status = response.status();
        if !status.is_success() {
            return Err(format!("HTTP {status}"));
        }
        Ok(response)
    }

    /// Send to the target and forward any reply. `Err` carries the reason.
    async fn dispatch(
        &self,
        tenant: &CellTenant,
        target: &Target,
        event: &Event,
    ) -> std::result::Result<(), String> {
        let mut outbound = event.clone();
        delete_remaining_hops(&mut outbound);

        let response = self.post(&target.address, outbound).await?;
        if !carries_event(&response) {
            return Ok(());
        }

        let mut reply = response_to_event(response)
            .await
            .map_err(|e| format!("malformed reply event: {e}"))?;

        let hops = remaining_hops(event).unwrap_or(DEFAULT_HOPS);
        if hops <= 0 {
            debug!(
                target = %target.key(),
                event_id = %event.id(),
                "Reply dropped, no hops remaining"
            );
            return Ok(());
        }
        set_remaining_hops(&mut reply, hops - 1);

        self.post(&tenant.address, reply)
            .await
            .map(|_| ())
            .map_err(|e| format!("reply forwarding failed: {e}"))
    }

    async fn hand_off_to_retry(&self, target: &Target, event: &Event) -> Result<()> {
        let queue = target
            .retry_queue
            .as_ref()
            .filter(|q| !q.topic.is_empty())
            .ok_or_else(|| ProcessError::NoRetryQueue(target.key().to_string()))?;

        self.queue
            .publish(&queue.topic, encode_message(event), &self.retry_publish)
            .await
            .map_err(|source| {
                error!(
                    target = %target.key(),
                    topic = %queue.topic,
                    error = %source,
                    "Failed to publish to retry queue"
                );
                ProcessError::RetryPublish {
                    target: target.key().to_string(),
                    source,
                }
            })?;

        debug!(
            target = %target.key(),
            event_id = %event.id(),
            "Failed delivery handed to retry queue"
        );
        Ok(())
    }
}

/// Whether a response body holds a CloudEvent (binary or structured).
fn carries_event(response: &Response) -> bool {
    let headers = response.headers();
    headers.contains_key("ce-specversion")
        || headers
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.starts_with("application/cloudevents"))
}

#[async_trait]
impl Processor for DeliverProcessor {
    fn name(&self) -> &'static str {
        "deliver"
    }

    fn link(&self) -> &Link {
        &self.link
    }

    #[tracing::instrument(name = "deliver", skip_all, fields(target = ?request.target))]
    async fn process(&self, request: &ProcessRequest, event: &Event) -> Result<()> {
        let key = request
            .target
            .as_ref()
            .ok_or_else(|| ProcessError::MissingTarget(request.tenant.to_string()))?;

        let snapshot = self.targets.load();
        let Some(tenant) = snapshot.tenant(key.cell_tenant()) else {
            debug!(tenant = %key.cell_tenant(), "Tenant not found, skipping delivery");
            return Ok(());
        };
        let Some(target) = tenant.target(key.name()) else {
            debug!(target = %key, "Target not found, skipping delivery");
            return Ok(());
        };

        if let Err(reason) = self.dispatch(tenant, target, event).await {
            if self.retry_on_failure {
                warn!(
                    target = %key,
                    event_id = %event.id(),
                    reason = %reason,
                    "Delivery failed, handing off to retry queue"
                );
                return self.hand_off_to_retry(target, event).await;
            }
            return Err(ProcessError::Delivery {
                target: key.to_string(),
                reason,
            });
        }

        self.next().process(request, event).await
    }
}

#[cfg(test)]
mod tests;
