//! Lock-free holder for the current targets snapshot.

use std::sync::Arc;

use arc_swap::ArcSwap;
use tracing::debug;

use super::TargetsConfig;

/// Current-snapshot slot shared by every reader in the process.
///
/// `load` is a single atomic pointer load; `store` swaps in a whole new
/// snapshot. Readers keep the `Arc` they loaded, so an old snapshot is freed
/// once its last reader lets go. The slot always holds a snapshot (empty by
/// default), so there is no "loaded before stored" state.
pub struct TargetsCache {
    current: ArcSwap<TargetsConfig>,
}

impl TargetsCache {
    pub fn new(snapshot: TargetsConfig) -> Self {
        Self {
            current: ArcSwap::from_pointee(snapshot),
        }
    }

    pub fn empty() -> Self {
        Self::new(TargetsConfig::default())
    }

    /// Current snapshot. Callers must treat it as read-only.
    pub fn load(&self) -> Arc<TargetsConfig> {
        self.current.load_full()
    }

    /// Replace the current snapshot.
    pub fn store(&self, snapshot: TargetsConfig) {
        self.current.store(Arc::new(snapshot));
    }

    /// Machine form of the current snapshot.
    pub fn bytes(&self) -> Vec<u8> {
        self.current.load().to_bytes()
    }

    /// Text form of the current snapshot.
    pub fn debug_string(&self) -> String {
        self.current
            .load()
            .to_text()
            .unwrap_or_else(|e| format!("<unprintable snapshot: {e}>"))
    }

    /// Whether `bytes` encodes the currently loaded snapshot.
    ///
    /// Identical bytes short-circuit without decoding. Malformed input is
    /// reported as "not equal".
    pub fn eq_bytes(&self, bytes: &[u8]) -> bool {
        let current = self.current.load();
        if current.to_bytes() == bytes {
            return true;
        }
        match TargetsConfig::from_bytes(bytes) {
            Ok(candidate) => candidate == **current,
            Err(e) => {
                debug!(error = %e, "Candidate snapshot bytes are malformed");
                false
            }
        }
    }

    /// Whether `text` describes the currently loaded snapshot.
    pub fn eq_text(&self, text: &str) -> bool {
        match TargetsConfig::from_text(text) {
            Ok(candidate) => candidate == **self.current.load(),
            Err(e) => {
                debug!(error = %e, "Candidate snapshot text is malformed");
                false
            }
        }
    }
}

impl Default for TargetsCache {
    fn default() -> Self {
        Self::empty()
    }
}
