//! Decouple router.
//!
//! Picks the decouple queue of an inbound event's tenant from the current
//! snapshot and publishes the event there. Tenants that are not in the
//! snapshot yet, or whose queue is still being provisioned, are reported as
//! not found: during provisioning the two are indistinguishable.

use std::sync::Arc;

use cloudevents::{AttributesReader, Event};
use tracing::debug;

use crate::config::IngressConfig;
use crate::event::{encode_message, remaining_hops, set_remaining_hops, DEFAULT_HOPS};
use crate::queue::{PublishSettings, QueueError, QueueService};
use crate::targets::{CellTenantKey, State, TargetsCache};

/// Errors returned to the ingress caller.
#[derive(Debug, thiserror::Error)]
pub enum IngressError {
    #[error("Tenant {0} not found")]
    NotFound(String),

    #[error("Tenant {0} has no decouple queue yet")]
    Incomplete(String),

    #[error("Failed to publish to decouple queue of {tenant}: {source}")]
    Publish {
        tenant: String,
        #[source]
        source: QueueError,
    },
}

/// What happened to an accepted event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    /// Published with the queue-assigned message id.
    Published(String),
    /// Dropped because no target of the tenant wants it.
    Filtered,
}

/// Routes inbound events to their tenant's decouple queue.
pub struct DecoupleSink {
    targets: Arc<TargetsCache>,
    queue: Arc<dyn QueueService>,
    enable_filtering: bool,
    publish: PublishSettings,
}

impl DecoupleSink {
    pub fn new(
        targets: Arc<TargetsCache>,
        queue: Arc<dyn QueueService>,
        config: &IngressConfig,
    ) -> Self {
        Self {
            targets,
            queue,
            enable_filtering: config.enable_event_filtering,
            publish: config.publish.clone(),
        }
    }

    #[tracing::instrument(name = "ingress.send", skip_all, fields(tenant = %tenant))]
    pub async fn send(
        &self,
        tenant: &CellTenantKey,
        mut event: Event,
    ) -> Result<SendOutcome, IngressError> {
        let snapshot = self.targets.load();
        let Some(cell_tenant) = snapshot.tenant(tenant) else {
            debug!("Tenant not found");
            return Err(IngressError::NotFound(tenant.to_string()));
        };

        let Some(queue) = cell_tenant.usable_decouple_queue() else {
            debug!("Tenant has no usable decouple queue");
            return Err(IngressError::Incomplete(tenant.to_string()));
        };

        if queue.state() != State::Ready {
            debug!(state = ?queue.state(), "Decouple queue not ready");
            return Err(IngressError::NotFound(tenant.to_string()));
        }

        if self.enable_filtering && !cell_tenant.targets.values().any(|t| t.matches(&event)) {
            debug!(event_id = %event.id(), "No target accepts event, dropping");
            return Ok(SendOutcome::Filtered);
        }

        if remaining_hops(&event).is_none() {
            set_remaining_hops(&mut event, DEFAULT_HOPS);
        }

        let message_id = self
            .queue
            .publish(&queue.topic, encode_message(&event), &self.publish)
            .await
            .map_err(|source| IngressError::Publish {
                tenant: tenant.to_string(),
                source,
            })?;

        debug!(event_id = %event.id(), message_id = %message_id, "Event published");
        Ok(SendOutcome::Published(message_id))
    }
}
