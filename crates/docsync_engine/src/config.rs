//! Configuration for the sync engine.

use rand::Rng;
use std::time::Duration;

/// Configuration for sync operations.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Quiet period after the last local edit before a document is queued.
    pub debounce: Duration,
    /// Failed attempts before a queued operation is given up on.
    pub max_retries: u32,
    /// Pause between items within one queue drain.
    pub item_delay: Duration,
    /// Maximum operations per batch request.
    pub batch_chunk_size: usize,
    /// Whether batch requests are all-or-nothing.
    pub batch_atomic: bool,
    /// Bound on a single connectivity probe.
    pub probe_timeout: Duration,
    /// Connection history window.
    pub history_limit: usize,
    /// Capacity of the sync event channel.
    pub event_capacity: usize,
    /// Connection backoff configuration.
    pub backoff: BackoffConfig,
}

impl SyncConfig {
    /// Creates a configuration with default values.
    pub fn new() -> Self {
        Self {
            debounce: Duration::from_secs(2),
            max_retries: 3,
            item_delay: Duration::from_millis(100),
            batch_chunk_size: docsync_protocol::MAX_BATCH_OPERATIONS,
            batch_atomic: false,
            probe_timeout: Duration::from_secs(5),
            history_limit: 50,
            event_capacity: 256,
            backoff: BackoffConfig::default(),
        }
    }

    /// Sets the debounce window.
    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }

    /// Sets the queue retry cap.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Sets the inter-item delay.
    pub fn with_item_delay(mut self, delay: Duration) -> Self {
        self.item_delay = delay;
        self
    }

    /// Sets the batch chunk size, clamped to `1..=MAX_BATCH_OPERATIONS`.
    pub fn with_batch_chunk_size(mut self, size: usize) -> Self {
        self.batch_chunk_size = size.clamp(1, docsync_protocol::MAX_BATCH_OPERATIONS);
        self
    }

    /// Sets the batch atomic flag.
    pub fn with_batch_atomic(mut self, atomic: bool) -> Self {
        self.batch_atomic = atomic;
        self
    }

    /// Sets the probe timeout.
    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    /// Sets the connection history window.
    pub fn with_history_limit(mut self, limit: usize) -> Self {
        self.history_limit = limit.max(1);
        self
    }

    /// Sets the backoff configuration.
    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Exponential backoff for connection retries.
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// Delay before the first retry.
    pub base: Duration,
    /// Upper bound on the nominal delay.
    pub cap: Duration,
    /// Errors tolerated before the connection goes fatal.
    pub max_retries: u32,
    /// Relative jitter applied around the nominal delay (0.2 = ±20%).
    pub jitter: f64,
}

impl BackoffConfig {
    /// Creates a backoff configuration.
    pub fn new(base: Duration, cap: Duration, max_retries: u32) -> Self {
        Self {
            base,
            cap,
            max_retries,
            jitter: 0.2,
        }
    }

    /// Sets the jitter ratio, clamped to `0.0..=1.0`.
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Sets the retry cap.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Nominal delay for a retry count: `min(base * 2^retry_count, cap)`.
    pub fn nominal_delay(&self, retry_count: u32) -> Duration {
        let factor = 2u32.checked_pow(retry_count).unwrap_or(u32::MAX);
        self.base
            .checked_mul(factor)
            .unwrap_or(self.cap)
            .min(self.cap)
    }

    /// Nominal delay with jitter applied.
    pub fn delay_for_attempt(&self, retry_count: u32) -> Duration {
        let nominal = self.nominal_delay(retry_count);
        if self.jitter == 0.0 {
            return nominal;
        }
        let factor = rand::thread_rng().gen_range(-self.jitter..=self.jitter);
        Duration::try_from_secs_f64(nominal.as_secs_f64() * (1.0 + factor)).unwrap_or(nominal)
    }
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(30), 5)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn sync_config_builder() {
        let config = SyncConfig::new()
            .with_debounce(Duration::from_millis(500))
            .with_max_retries(5)
            .with_item_delay(Duration::ZERO)
            .with_batch_chunk_size(1000)
            .with_batch_atomic(true);

        assert_eq!(config.debounce, Duration::from_millis(500));
        assert_eq!(config.max_retries, 5);
        assert_eq!(config.item_delay, Duration::ZERO);
        assert_eq!(config.batch_chunk_size, 100);
        assert!(config.batch_atomic);
    }

    #[test]
    fn defaults() {
        let config = SyncConfig::default();
        assert_eq!(config.debounce, Duration::from_secs(2));
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.item_delay, Duration::from_millis(100));
        assert_eq!(config.history_limit, 50);
        assert_eq!(config.probe_timeout, Duration::from_secs(5));
    }

    #[test]
    fn nominal_delay_doubles_then_caps() {
        let backoff = BackoffConfig::new(Duration::from_millis(100), Duration::from_secs(1), 5);
        assert_eq!(backoff.nominal_delay(0), Duration::from_millis(100));
        assert_eq!(backoff.nominal_delay(1), Duration::from_millis(200));
        assert_eq!(backoff.nominal_delay(3), Duration::from_millis(800));
        assert_eq!(backoff.nominal_delay(4), Duration::from_secs(1));
        assert_eq!(backoff.nominal_delay(40), Duration::from_secs(1));
    }

    #[test]
    fn zero_jitter_is_exact() {
        let backoff = BackoffConfig::default().with_jitter(0.0);
        assert_eq!(backoff.delay_for_attempt(2), Duration::from_secs(4));
    }

    proptest! {
        #[test]
        fn nominal_delay_is_monotonic(base_ms in 1u64..5_000, cap_ms in 1u64..120_000, n in 0u32..64) {
            let backoff = BackoffConfig::new(
                Duration::from_millis(base_ms),
                Duration::from_millis(cap_ms),
                5,
            );
            prop_assert!(backoff.nominal_delay(n) <= backoff.nominal_delay(n + 1));
            prop_assert!(backoff.nominal_delay(n) <= backoff.cap);
        }

        #[test]
        fn jittered_delay_stays_within_twenty_percent(base_ms in 1u64..5_000, n in 0u32..16) {
            let backoff = BackoffConfig::new(
                Duration::from_millis(base_ms),
                Duration::from_secs(60),
                5,
            );
            let nominal = backoff.nominal_delay(n).as_secs_f64();
            let actual = backoff.delay_for_attempt(n).as_secs_f64();
            prop_assert!(actual >= nominal * 0.8 - 1e-9);
            prop_assert!(actual <= nominal * 1.2 + 1e-9);
        }
    }
}
