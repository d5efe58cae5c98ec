//! Drops events the request's target does not subscribe to.

use std::sync::Arc;

use async_trait::async_trait;
use cloudevents::{AttributesReader, Event};
use tracing::debug;

use super::{Link, ProcessError, ProcessRequest, Processor, Result};
use crate::targets::TargetsCache;

/// Passes an event on only when the target exists and its filter matches.
pub struct FilterProcessor {
    link: Link,
    targets: Arc<TargetsCache>,
}

impl FilterProcessor {
    pub fn new(targets: Arc<TargetsCache>) -> Self {
        Self {
            link: Link::default(),
            targets,
        }
    }
}

#[async_trait]
impl Processor for FilterProcessor {
    fn name(&self) -> &'static str {
        "filter"
    }

    fn link(&self) -> &Link {
        &self.link
    }

    async fn process(&self, request: &ProcessRequest, event: &Event) -> Result<()> {
        let key = request
            .target
            .as_ref()
            .ok_or_else(|| ProcessError::MissingTarget(request.tenant.to_string()))?;

        let snapshot = self.targets.load();
        let Some(target) = snapshot.target(key) else {
            debug!(target = %key, "Target not found, skipping event");
            return Ok(());
        };

        if !target.matches(event) {
            debug!(target = %key, event_id = %event.id(), "Event filtered out");
            return Ok(());
        }

        self.next().process(request, event).await
    }
}
