//! Retry utilities: backoff builders.
//!
//! Uses `backon` for exponential backoff with jitter.

use std::time::Duration;

use backon::ExponentialBuilder;

/// Backoff between reconciliation passes that reported errors.
///
/// - Min delay: 100ms
/// - Max delay: 30s
/// - Unlimited attempts (a clean pass resets the sequence)
/// - Jitter enabled
pub fn reconcile_backoff() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(100))
        .with_max_delay(Duration::from_secs(30))
        .without_max_times()
        .with_jitter()
}

/// Backoff after a transient receive error inside a handler worker.
///
/// - Min delay: 10ms
/// - Max delay: 1s
/// - Unlimited attempts
pub fn receive_backoff() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(10))
        .with_max_delay(Duration::from_secs(1))
        .without_max_times()
}

#[cfg(test)]
mod tests {
    use super::*;
    use backon::BackoffBuilder;

    #[test]
    fn test_reconcile_backoff_is_unbounded_and_capped() {
        let delays: Vec<Duration> = reconcile_backoff().build().take(50).collect();
        assert_eq!(delays.len(), 50);
        // Jitter adds at most one extra min-delay-sized share on top.
        assert!(delays.iter().all(|d| *d <= Duration::from_secs(60)));
        assert!(delays[0] >= Duration::from_millis(100));
    }

    #[test]
    fn test_receive_backoff_starts_small() {
        let first = receive_backoff().build().next().unwrap();
        assert_eq!(first, Duration::from_millis(10));
    }
}
