//! Handler pool reconciliation.
//!
//! A [`SyncPool`] keeps exactly one running [`Handler`] per desired key of
//! the current targets snapshot. What a key is (a tenant for fan-out, a
//! target for retry) and which queue it consumes comes from the pool's
//! [`PoolFlavor`].
//!
//! Reconciliation is level-triggered: every pass compares the running set
//! against the snapshot as a whole. Passes run on one task and are woken
//! through a [`Notify`], so any number of pending wake-ups collapse into a
//! single pass. A handler that exits on its own wakes the loop through a
//! separate notifier that is ignored while a backoff is pending, so a key
//! whose subscription keeps closing is restarted on the backoff schedule.

use std::collections::HashMap;
use std::fmt::Display;
use std::hash::Hash;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use backon::BackoffBuilder;
use dashmap::DashMap;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub mod fanout;
pub mod retry;

pub use fanout::{fanout_pool, FanoutFlavor};
pub use retry::{retry_pool, RetryFlavor};

use crate::handler::{Handler, HandlerOptions};
use crate::processors::{ProcessRequest, Processor};
use crate::queue::{QueueError, QueueService};
use crate::targets::{Queue, TargetsCache, TargetsConfig};
use crate::utils::retry::reconcile_backoff;

/// What a pool reconciles.
pub trait PoolFlavor: Send + Sync + 'static {
    type Key: Clone + Eq + Hash + Display + Send + Sync + 'static;

    /// Short name for logs.
    fn name(&self) -> &'static str;

    /// Every key that should have a running handler, with the queue it reads.
    fn desired(&self, snapshot: &TargetsConfig) -> Vec<(Self::Key, Queue)>;

    /// Request passed to the chain for events consumed under `key`.
    fn request(&self, key: &Self::Key) -> ProcessRequest;
}

/// Outcome of one reconciliation pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub started: usize,
    pub stopped: usize,
    pub errors: usize,
    /// Handlers that exited on their own since the previous pass.
    pub exited: usize,
    pub running: usize,
}

impl ReconcileReport {
    /// Whether the next pass should wait for a backoff.
    pub fn needs_backoff(&self) -> bool {
        self.errors > 0 || self.exited > 0
    }
}

/// Keeps one handler per desired key in sync with the snapshot.
pub struct SyncPool<F: PoolFlavor> {
    flavor: F,
    targets: Arc<TargetsCache>,
    queue: Arc<dyn QueueService>,
    processor: Arc<dyn Processor>,
    options: HandlerOptions,
    handlers: Arc<DashMap<F::Key, Arc<Handler>>>,
    signal: Arc<Notify>,
    exits: Arc<AtomicUsize>,
    exit_signal: Arc<Notify>,
}

impl<F: PoolFlavor> SyncPool<F> {
    pub fn new(
        flavor: F,
        targets: Arc<TargetsCache>,
        queue: Arc<dyn QueueService>,
        processor: Arc<dyn Processor>,
        options: HandlerOptions,
    ) -> Self {
        Self {
            flavor,
            targets,
            queue,
            processor,
            options,
            handlers: Arc::new(DashMap::new()),
            signal: Arc::new(Notify::new()),
            exits: Arc::new(AtomicUsize::new(0)),
            exit_signal: Arc::new(Notify::new()),
        }
    }

    /// Signal that wakes the reconcile loop. Hand it to the snapshot loader.
    pub fn signal(&self) -> Arc<Notify> {
        self.signal.clone()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    pub fn keys(&self) -> Vec<F::Key> {
        self.handlers.iter().map(|e| e.key().clone()).collect()
    }

    /// Generation id of the handler running for `key`.
    pub fn handler_id(&self, key: &F::Key) -> Option<u64> {
        self.handlers.get(key).map(|h| h.id())
    }

    /// Bring the running set in line with the current snapshot.
    pub async fn reconcile_once(&self) -> ReconcileReport {
        let snapshot = self.targets.load();
        let desired: HashMap<F::Key, Queue> = self.flavor.desired(&snapshot).into_iter().collect();
        let mut report = ReconcileReport {
            exited: self.exits.swap(0, Ordering::SeqCst),
            ..Default::default()
        };

        let stale: Vec<F::Key> = self
            .handlers
            .iter()
            .filter(|entry| !desired.contains_key(entry.key()))
            .map(|entry| entry.key().clone())
            .collect();
        for key in stale {
            if let Some((_, handler)) = self.handlers.remove(&key) {
                handler.stop();
                report.stopped += 1;
                debug!(pool = self.flavor.name(), key = %key, "Stopped handler");
            }
        }

        for (key, queue) in desired {
            if self.handlers.contains_key(&key) {
                continue;
            }
            match self.start_handler(&key, &queue).await {
                Ok(()) => report.started += 1,
                Err(e) => {
                    error!(
                        pool = self.flavor.name(),
                        key = %key,
                        topic = %queue.topic,
                        error = %e,
                        "Failed to start handler"
                    );
                    report.errors += 1;
                }
            }
        }

        report.running = self.handlers.len();
        if report.started > 0 || report.stopped > 0 || report.needs_backoff() {
            info!(
                pool = self.flavor.name(),
                started = report.started,
                stopped = report.stopped,
                errors = report.errors,
                exited = report.exited,
                running = report.running,
                "Reconciled handlers"
            );
        }
        report
    }

    async fn start_handler(&self, key: &F::Key, queue: &Queue) -> Result<(), QueueError> {
        let subscription = self
            .queue
            .subscribe(&queue.topic, &queue.subscription)
            .await?;

        let handler = Arc::new(Handler::new(
            subscription,
            self.processor.clone(),
            self.flavor.request(key),
            self.options.clone(),
        ));

        // Insert before starting so the exit callback always finds its entry.
        self.handlers.insert(key.clone(), handler.clone());

        let handlers = self.handlers.clone();
        let exits = self.exits.clone();
        let exit_signal = self.exit_signal.clone();
        let pool = self.flavor.name();
        let id = handler.id();
        let owned_key = key.clone();
        let started = handler.start(move |reason| {
            handlers.remove_if(&owned_key, |_, current| current.id() == id);
            if let Some(reason) = reason {
                warn!(pool, key = %owned_key, reason = %reason, "Handler exited");
                exits.fetch_add(1, Ordering::SeqCst);
                exit_signal.notify_one();
            }
        });

        if let Err(e) = started {
            self.handlers.remove_if(key, |_, current| current.id() == id);
            return Err(QueueError::Subscribe(e.to_string()));
        }
        Ok(())
    }

    /// Stop and forget every handler.
    pub fn stop_all(&self) {
        let keys = self.keys();
        for key in keys {
            if let Some((_, handler)) = self.handlers.remove(&key) {
                handler.stop();
            }
        }
    }

    /// Reconcile on every signal until cancelled, then stop all handlers.
    ///
    /// A pass with errors or self-exited handlers schedules another one with
    /// exponential backoff; a clean pass resets the backoff. Handler exits
    /// only wake the loop when no backoff is pending.
    pub async fn run(&self, cancel: CancellationToken) {
        let backoff = reconcile_backoff();
        let mut delays = backoff.build();
        let mut retry_at: Option<Instant> = None;

        info!(pool = self.flavor.name(), "Sync pool started");
        self.signal.notify_one();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = self.signal.notified() => {}
                _ = self.exit_signal.notified(), if retry_at.is_none() => {}
                _ = sleep_until(retry_at), if retry_at.is_some() => {}
            }

            let report = self.reconcile_once().await;
            if report.needs_backoff() {
                let delay = delays.next().unwrap_or(std::time::Duration::from_secs(30));
                debug!(
                    pool = self.flavor.name(),
                    backoff_ms = %delay.as_millis(),
                    "Reconcile had errors or exits, scheduling another pass"
                );
                retry_at = Some(Instant::now() + delay);
            } else {
                delays = backoff.build();
                retry_at = None;
            }
        }

        self.stop_all();
        info!(pool = self.flavor.name(), "Sync pool stopped");
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
