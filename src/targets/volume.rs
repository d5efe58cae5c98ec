//! Snapshot propagation from a mounted file.
//!
//! The control plane writes the binary snapshot into a config volume. The
//! loader polls that file, swaps changed snapshots into the cache and wakes
//! every registered reconcile signal. Unchanged bytes never wake anyone, so a
//! rewrite of the same content does not cascade into reconciliation.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{TargetsCache, TargetsConfig, TargetsError};

/// Default poll interval for the snapshot file.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Polls a snapshot file into a [`TargetsCache`].
pub struct VolumeLoader {
    path: PathBuf,
    cache: Arc<TargetsCache>,
    poll_interval: Duration,
    signals: Vec<Arc<Notify>>,
}

impl VolumeLoader {
    pub fn new(path: impl Into<PathBuf>, cache: Arc<TargetsCache>) -> Self {
        Self {
            path: path.into(),
            cache,
            poll_interval: DEFAULT_POLL_INTERVAL,
            signals: Vec::new(),
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Register a signal to wake whenever a new snapshot is stored.
    pub fn with_signal(mut self, signal: Arc<Notify>) -> Self {
        self.signals.push(signal);
        self
    }

    /// Read the file once. Returns `true` if a new snapshot was stored.
    pub async fn load_once(&self) -> Result<bool, TargetsError> {
        let bytes = tokio::fs::read(&self.path)
            .await
            .map_err(|source| TargetsError::Io {
                path: self.path.display().to_string(),
                source,
            })?;

        if self.cache.eq_bytes(&bytes) {
            return Ok(false);
        }

        let snapshot = TargetsConfig::from_bytes(&bytes)?;
        let tenants = snapshot.cell_tenants.len();
        self.cache.store(snapshot);
        for signal in &self.signals {
            signal.notify_one();
        }

        info!(
            path = %self.path.display(),
            tenants,
            "Loaded new targets snapshot"
        );
        Ok(true)
    }

    /// Poll until cancelled.
    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.poll_interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!(path = %self.path.display(), "Snapshot loader stopped");
                        return;
                    }
                    _ = ticker.tick() => {}
                }

                if let Err(e) = self.load_once().await {
                    // Keep serving the current snapshot.
                    warn!(
                        path = %self.path.display(),
                        error = %e,
                        "Failed to load targets snapshot"
                    );
                }
            }
        })
    }
}
