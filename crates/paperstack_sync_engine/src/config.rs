//! Configuration for the sync engine.

use std::time::Duration;

/// Configuration for sync cycles.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Maximum number of concurrent remote calls during a cycle.
    pub max_parallel_remote_calls: usize,
    /// Maximum batch size when pulling remote changes.
    pub pull_batch_size: u32,
    /// Per-remote-call timeout; a timed-out call is a transient failure.
    pub remote_timeout: Duration,
    /// Retry configuration for remote calls.
    pub retry: RetryConfig,
}

impl SyncConfig {
    /// Creates a configuration with default values.
    pub fn new() -> Self {
        Self {
            max_parallel_remote_calls: 3,
            pull_batch_size: 100,
            remote_timeout: Duration::from_secs(30),
            retry: RetryConfig::default(),
        }
    }

    /// Sets the remote-call parallelism bound.
    pub fn with_max_parallel_remote_calls(mut self, limit: usize) -> Self {
        self.max_parallel_remote_calls = limit.max(1);
        self
    }

    /// Sets the pull batch size.
    pub fn with_pull_batch_size(mut self, size: u32) -> Self {
        self.pull_batch_size = size;
        self
    }

    /// Sets the per-call timeout.
    pub fn with_remote_timeout(mut self, timeout: Duration) -> Self {
        self.remote_timeout = timeout;
        self
    }

    /// Sets the retry configuration.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Configuration for retry behavior on transient failures.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retries after the initial attempt.
    pub max_retries: u32,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Upper bound on any single delay.
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
}

impl RetryConfig {
    /// Creates a retry configuration with the given retry count and the
    /// default 1s → 2s → 4s backoff ladder.
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
        }
    }

    /// Creates a configuration with no retries.
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
        }
    }

    /// Sets the initial delay.
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Sets the maximum delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Sets the backoff multiplier.
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Calculates the delay before retry `retry` (0-indexed).
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        let base = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(retry as i32);
        Duration::from_secs_f64(base.min(self.max_delay.as_secs_f64()))
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(3)
    }
}

/// Configuration for the entitlement gate.
#[derive(Debug, Clone)]
pub struct EntitlementConfig {
    /// How long a cached status stays fresh.
    pub ttl: Duration,
    /// Retry configuration for provider queries.
    pub retry: RetryConfig,
}

impl EntitlementConfig {
    /// Creates a configuration with the default 5-minute cache TTL.
    pub fn new() -> Self {
        Self {
            ttl: Duration::from_secs(5 * 60),
            retry: RetryConfig::default(),
        }
    }

    /// Sets the cache TTL.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Sets the provider retry configuration.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }
}

impl Default for EntitlementConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sync_config_builder() {
        let config = SyncConfig::new()
            .with_max_parallel_remote_calls(5)
            .with_pull_batch_size(50)
            .with_remote_timeout(Duration::from_secs(10));

        assert_eq!(config.max_parallel_remote_calls, 5);
        assert_eq!(config.pull_batch_size, 50);
        assert_eq!(config.remote_timeout, Duration::from_secs(10));
    }

    #[test]
    fn parallelism_is_at_least_one() {
        let config = SyncConfig::new().with_max_parallel_remote_calls(0);
        assert_eq!(config.max_parallel_remote_calls, 1);
    }

    #[test]
    fn backoff_ladder() {
        let retry = RetryConfig::new(3);
        assert_eq!(retry.delay_for_retry(0), Duration::from_secs(1));
        assert_eq!(retry.delay_for_retry(1), Duration::from_secs(2));
        assert_eq!(retry.delay_for_retry(2), Duration::from_secs(4));
    }

    #[test]
    fn backoff_respects_max() {
        let retry = RetryConfig::new(10).with_max_delay(Duration::from_secs(5));
        assert_eq!(retry.delay_for_retry(8), Duration::from_secs(5));
    }

    #[test]
    fn entitlement_defaults() {
        let config = EntitlementConfig::new();
        assert_eq!(config.ttl, Duration::from_secs(300));
        assert_eq!(config.retry.max_retries, 3);
    }
}
