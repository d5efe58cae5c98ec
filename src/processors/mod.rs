//! Processor chain.
//!
//! Every consumer drives events through a short linear pipeline
//! (fan-out → filter → deliver). Each stage receives an explicit
//! [`ProcessRequest`] naming the tenant and, once known, the target, does
//! its work and decides whether to call [`Processor::next`]. Not calling it
//! short-circuits the rest of the chain.

use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use cloudevents::Event;
use tracing::warn;

pub mod deliver;
pub mod fanout;
pub mod filter;

pub use deliver::DeliverProcessor;
pub use fanout::FanoutProcessor;
pub use filter::FilterProcessor;

use crate::queue::QueueError;
use crate::targets::{CellTenantKey, TargetKey};

/// Result type for processing.
pub type Result<T> = std::result::Result<T, ProcessError>;

/// Errors that fail processing of one event.
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("Processing timed out")]
    Timeout,

    #[error("Processing cancelled")]
    Cancelled,

    #[error("Delivery to {target} failed: {reason}")]
    Delivery { target: String, reason: String },

    #[error("Target {0} has no retry queue")]
    NoRetryQueue(String),

    #[error("Failed to publish to retry queue of {target}: {source}")]
    RetryPublish {
        target: String,
        #[source]
        source: QueueError,
    },

    #[error("Request for {0} is missing a target")]
    MissingTarget(String),

    #[error("{failed} of {total} target deliveries failed")]
    Fanout { failed: usize, total: usize },
}

/// Explicit identity of the unit of work an event is processed for.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProcessRequest {
    pub tenant: CellTenantKey,
    pub target: Option<TargetKey>,
}

impl ProcessRequest {
    pub fn for_tenant(tenant: CellTenantKey) -> Self {
        Self {
            tenant,
            target: None,
        }
    }

    pub fn for_target(target: TargetKey) -> Self {
        Self {
            tenant: target.cell_tenant().clone(),
            target: Some(target),
        }
    }

    /// Same tenant, narrowed to one of its targets.
    pub fn with_target(&self, name: &str) -> Self {
        Self::for_target(self.tenant.target_key(name))
    }
}

/// Link to the next processor. Unlinked processors get a no-op.
#[derive(Default)]
pub struct Link {
    next: OnceLock<Arc<dyn Processor>>,
}

impl Link {
    pub fn next(&self) -> Arc<dyn Processor> {
        self.next
            .get()
            .cloned()
            .unwrap_or_else(|| Arc::new(NoopProcessor::default()))
    }

    /// Set the next processor. Returns false if already linked.
    pub fn set(&self, next: Arc<dyn Processor>) -> bool {
        self.next.set(next).is_ok()
    }

    pub fn is_linked(&self) -> bool {
        self.next.get().is_some()
    }
}

/// One stage of the chain.
#[async_trait]
pub trait Processor: Send + Sync {
    fn name(&self) -> &'static str;

    fn link(&self) -> &Link;

    fn next(&self) -> Arc<dyn Processor> {
        self.link().next()
    }

    async fn process(&self, request: &ProcessRequest, event: &Event) -> Result<()>;
}

/// Terminal stage that does nothing.
#[derive(Default)]
pub struct NoopProcessor {
    link: Link,
}

#[async_trait]
impl Processor for NoopProcessor {
    fn name(&self) -> &'static str {
        "noop"
    }

    fn link(&self) -> &Link {
        &self.link
    }

    async fn process(&self, _request: &ProcessRequest, _event: &Event) -> Result<()> {
        Ok(())
    }
}

/// Link `processors` in order and return the head of the chain.
///
/// An empty list yields a no-op chain.
pub fn chain_processors(processors: Vec<Arc<dyn Processor>>) -> Arc<dyn Processor> {
    for pair in processors.windows(2) {
        if !pair[0].link().set(pair[1].clone()) {
            warn!(
                processor = pair[0].name(),
                "Processor already linked, keeping existing next"
            );
        }
    }
    processors
        .into_iter()
        .next()
        .unwrap_or_else(|| Arc::new(NoopProcessor::default()))
}
