//! Message pump: one subscription, N workers, one processor chain.
//!
//! Each worker loops: receive a message, decode it into an event, run the
//! chain under the per-event timeout, then ack on success or nack on any
//! failure. `Delivery` is consumed by ack/nack, so every message is finished
//! at most once. Messages that fail to decode are left unfinished and come
//! back through the queue service's lease expiry.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use backon::BackoffBuilder;
use cloudevents::AttributesReader;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::event::decode_message;
use crate::processors::{ProcessError, ProcessRequest, Processor};
use crate::queue::{Delivery, QueueError, Subscription};
use crate::utils::retry::receive_backoff;

static NEXT_HANDLER_ID: AtomicU64 = AtomicU64::new(1);

/// Reasons a handler stopped on its own.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("Subscription {0} closed")]
    SubscriptionClosed(String),

    #[error("Handler worker panicked: {0}")]
    WorkerPanicked(String),

    #[error("Handler already started")]
    AlreadyStarted,
}

/// Worker settings.
#[derive(Debug, Clone, Default)]
pub struct HandlerOptions {
    /// Number of workers. Zero means one per available core.
    pub concurrency: usize,
    /// Upper bound on one chain invocation. `None` disables the bound.
    pub timeout_per_event: Option<Duration>,
}

impl HandlerOptions {
    fn workers(&self) -> usize {
        if self.concurrency > 0 {
            return self.concurrency;
        }
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    }
}

/// Drives one subscription through one processor chain.
pub struct Handler {
    id: u64,
    subscription: Arc<dyn Subscription>,
    processor: Arc<dyn Processor>,
    request: ProcessRequest,
    options: HandlerOptions,
    cancel: CancellationToken,
    started: AtomicBool,
    alive: Arc<AtomicBool>,
}

impl Handler {
    pub fn new(
        subscription: Arc<dyn Subscription>,
        processor: Arc<dyn Processor>,
        request: ProcessRequest,
        options: HandlerOptions,
    ) -> Self {
        Self {
            id: NEXT_HANDLER_ID.fetch_add(1, Ordering::Relaxed),
            subscription,
            processor,
            request,
            options,
            cancel: CancellationToken::new(),
            started: AtomicBool::new(false),
            alive: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Process-unique generation id.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Spawn the workers. `done` runs exactly once when every worker has
    /// exited: with `None` after [`Handler::stop`], otherwise with the reason.
    pub fn start<F>(&self, done: F) -> Result<(), HandlerError>
    where
        F: FnOnce(Option<HandlerError>) + Send + 'static,
    {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(HandlerError::AlreadyStarted);
        }
        self.alive.store(true, Ordering::SeqCst);

        let workers = self.options.workers();
        let mut set = JoinSet::new();
        for _ in 0..workers {
            let worker = Worker {
                subscription: self.subscription.clone(),
                processor: self.processor.clone(),
                request: self.request.clone(),
                timeout: self.options.timeout_per_event,
                cancel: self.cancel.clone(),
            };
            set.spawn(worker.run());
        }

        info!(
            handler = self.id,
            subscription = %self.subscription.name(),
            workers,
            "Handler started"
        );

        let id = self.id;
        let alive = self.alive.clone();
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            let mut reason = None;
            while let Some(joined) = set.join_next().await {
                let outcome = match joined {
                    Ok(outcome) => outcome,
                    Err(e) => Err(HandlerError::WorkerPanicked(e.to_string())),
                };
                if let Err(e) = outcome {
                    // One worker ending takes the rest down with it.
                    cancel.cancel();
                    reason.get_or_insert(e);
                }
            }
            alive.store(false, Ordering::SeqCst);
            debug!(handler = id, reason = ?reason, "Handler exited");
            done(reason);
        });
        Ok(())
    }

    /// Ask every worker to exit. In-flight chains are cancelled and nacked.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst) && self.subscription.is_open()
    }
}

impl Drop for Handler {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

struct Worker {
    subscription: Arc<dyn Subscription>,
    processor: Arc<dyn Processor>,
    request: ProcessRequest,
    timeout: Option<Duration>,
    cancel: CancellationToken,
}

impl Worker {
    async fn run(self) -> Result<(), HandlerError> {
        let backoff = receive_backoff();
        let mut delays = backoff.build();
        let mut failing = false;

        loop {
            let received = tokio::select! {
                _ = self.cancel.cancelled() => return Ok(()),
                received = self.subscription.receive() => received,
            };

            let delivery = match received {
                Ok(delivery) => {
                    if failing {
                        failing = false;
                        delays = backoff.build();
                    }
                    delivery
                }
                Err(QueueError::Closed) => {
                    return Err(HandlerError::SubscriptionClosed(
                        self.subscription.name().to_string(),
                    ));
                }
                Err(e) => {
                    warn!(
                        subscription = %self.subscription.name(),
                        error = %e,
                        "Failed to receive message"
                    );
                    // First failure retries at once; a run of failures backs off.
                    if failing {
                        let delay = delays.next().unwrap_or(Duration::from_secs(1));
                        tokio::time::sleep(delay).await;
                    }
                    failing = true;
                    continue;
                }
            };

            self.handle(delivery).await;
        }
    }

    async fn handle(&self, delivery: Delivery) {
        let event = match decode_message(delivery.message()) {
            Ok(event) => event,
            Err(e) => {
                error!(
                    subscription = %self.subscription.name(),
                    message_id = %delivery.message().id,
                    error = %e,
                    "Failed to decode message, skipping"
                );
                return;
            }
        };

        let work = self.processor.process(&self.request, &event);
        let result = tokio::select! {
            _ = self.cancel.cancelled() => Err(ProcessError::Cancelled),
            result = async {
                match self.timeout {
                    Some(limit) => tokio::time::timeout(limit, work)
                        .await
                        .unwrap_or(Err(ProcessError::Timeout)),
                    None => work.await,
                }
            } => result,
        };

        match result {
            Ok(()) => delivery.ack().await,
            Err(e) => {
                warn!(
                    tenant = %self.request.tenant,
                    event_id = %event.id(),
                    error = %e,
                    "Event processing failed, nacking"
                );
                delivery.nack().await;
            }
        }
    }
}
