//! Consumer and rebalancer configuration.
//!
//! Durations are stored in milliseconds so the structs deserialize directly
//! from TOML.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use shardline_core::{Limits, MAX_CONSECUTIVE_ERRORS, POISON_PILL_THRESHOLD, RENEWAL_ATTEMPTS};

/// Configuration for one shard consumer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsumerConfig {
    /// Hard deadline for one processor call.
    pub processor_timeout_ms: u64,
    /// Batch size used when no adaptive strategy is configured.
    pub default_batch_size: u32,
    /// Upper bound on any requested batch.
    pub max_batch_records: u32,
    /// Sleep after an empty fetch when no strategy is configured.
    pub idle_delay_ms: u64,
    /// Backoff after a counted error.
    pub base_backoff_ms: u64,
    /// Throttle backoff is at least `base_backoff * throttle_multiplier`.
    pub throttle_multiplier: u32,
    /// Consecutive counted errors before the consumer exits.
    pub max_consecutive_errors: u32,
    /// Unchanged leading positions before a batch is a poison pill.
    pub poison_pill_threshold: u32,
    /// Interval between lease renewals. Must be well under the lease TTL.
    pub renew_interval_ms: u64,
    /// Renewal attempts before the lease is considered lost.
    pub renew_attempts: u32,
    /// Delay between renewal attempts.
    pub renew_retry_delay_ms: u64,
    /// Hard ceiling on releasing the lease at exit.
    pub release_timeout_ms: u64,
    /// How long draining waits for an in-flight renewal.
    pub renewal_drain_ms: u64,
    /// Attempts to obtain the first iterator.
    pub iterator_attempts: u32,
}

impl ConsumerConfig {
    /// Creates a configuration for testing, with short timers.
    #[must_use]
    pub const fn for_testing() -> Self {
        Self {
            processor_timeout_ms: 1_000,
            default_batch_size: 100,
            max_batch_records: 10_000,
            idle_delay_ms: 50,
            base_backoff_ms: 100,
            throttle_multiplier: 4,
            max_consecutive_errors: MAX_CONSECUTIVE_ERRORS,
            poison_pill_threshold: POISON_PILL_THRESHOLD,
            renew_interval_ms: 500,
            renew_attempts: RENEWAL_ATTEMPTS,
            renew_retry_delay_ms: 100,
            release_timeout_ms: 500,
            renewal_drain_ms: 500,
            iterator_attempts: 3,
        }
    }

    /// Builder: set the processor deadline.
    #[must_use]
    pub const fn with_processor_timeout(mut self, timeout: Duration) -> Self {
        self.processor_timeout_ms = duration_ms(timeout);
        self
    }

    /// Builder: set the renewal interval.
    #[must_use]
    pub const fn with_renew_interval(mut self, interval: Duration) -> Self {
        self.renew_interval_ms = duration_ms(interval);
        self
    }

    /// Builder: set the fallback batch size.
    #[must_use]
    pub const fn with_default_batch_size(mut self, size: u32) -> Self {
        self.default_batch_size = size;
        self
    }

    /// Builder: set the consecutive error ceiling.
    #[must_use]
    pub const fn with_max_consecutive_errors(mut self, max: u32) -> Self {
        self.max_consecutive_errors = max;
        self
    }

    /// Processor deadline.
    #[must_use]
    pub const fn processor_timeout(&self) -> Duration {
        Duration::from_millis(self.processor_timeout_ms)
    }

    /// Idle delay.
    #[must_use]
    pub const fn idle_delay(&self) -> Duration {
        Duration::from_millis(self.idle_delay_ms)
    }

    /// Base error backoff.
    #[must_use]
    pub const fn base_backoff(&self) -> Duration {
        Duration::from_millis(self.base_backoff_ms)
    }

    /// Minimum backoff after a throttled fetch.
    #[must_use]
    pub fn throttle_backoff(&self) -> Duration {
        self.base_backoff() * self.throttle_multiplier.max(1)
    }

    /// Renewal interval.
    #[must_use]
    pub const fn renew_interval(&self) -> Duration {
        Duration::from_millis(self.renew_interval_ms)
    }

    /// Delay between renewal attempts.
    #[must_use]
    pub const fn renew_retry_delay(&self) -> Duration {
        Duration::from_millis(self.renew_retry_delay_ms)
    }

    /// Lease release ceiling.
    #[must_use]
    pub const fn release_timeout(&self) -> Duration {
        Duration::from_millis(self.release_timeout_ms)
    }

    /// Renewal drain wait.
    #[must_use]
    pub const fn renewal_drain(&self) -> Duration {
        Duration::from_millis(self.renewal_drain_ms)
    }

    /// Clamps a requested batch size to `[1, max_batch_records]`.
    #[must_use]
    pub fn clamp_batch(&self, requested: u32) -> u32 {
        requested.clamp(1, self.max_batch_records.max(1))
    }
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            processor_timeout_ms: 30_000,
            default_batch_size: 100,
            max_batch_records: Limits::new().max_batch_records,
            idle_delay_ms: 1_000,
            base_backoff_ms: 1_000,
            throttle_multiplier: 4,
            max_consecutive_errors: MAX_CONSECUTIVE_ERRORS,
            poison_pill_threshold: POISON_PILL_THRESHOLD,
            renew_interval_ms: 10_000,
            renew_attempts: RENEWAL_ATTEMPTS,
            renew_retry_delay_ms: 1_000,
            release_timeout_ms: 5_000,
            renewal_drain_ms: 5_000,
            iterator_attempts: 3,
        }
    }
}

/// Configuration for the shard rebalancer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RebalancerConfig {
    /// Interval between rebalance ticks.
    pub interval_ms: u64,
    /// Maximum shards this instance runs consumers for.
    pub max_held_shards: u32,
    /// Maximum instances considered in one assignment.
    pub max_instances: u32,
}

impl RebalancerConfig {
    /// Creates a configuration for testing.
    #[must_use]
    pub const fn for_testing() -> Self {
        Self {
            interval_ms: 200,
            max_held_shards: 64,
            max_instances: 16,
        }
    }

    /// Builder: set the tick interval.
    #[must_use]
    pub const fn with_interval(mut self, interval: Duration) -> Self {
        self.interval_ms = duration_ms(interval);
        self
    }

    /// Tick interval.
    #[must_use]
    pub const fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

impl Default for RebalancerConfig {
    fn default() -> Self {
        let limits = Limits::new();
        Self {
            interval_ms: 10_000,
            max_held_shards: limits.max_held_shards,
            max_instances: limits.max_instances,
        }
    }
}

#[allow(clippy::cast_possible_truncation)]
const fn duration_ms(duration: Duration) -> u64 {
    duration.as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_throttle_backoff_exceeds_base() {
        let config = ConsumerConfig::for_testing();
        assert_eq!(config.throttle_backoff(), Duration::from_millis(400));
        assert!(config.throttle_backoff() > config.base_backoff());
    }

    #[test]
    fn test_clamp_batch() {
        let config = ConsumerConfig {
            max_batch_records: 50,
            ..ConsumerConfig::for_testing()
        };
        assert_eq!(config.clamp_batch(0), 1);
        assert_eq!(config.clamp_batch(10), 10);
        assert_eq!(config.clamp_batch(500), 50);
    }

    #[test]
    fn test_partial_deserialize_keeps_defaults() {
        let config: ConsumerConfig =
            serde_json::from_str(r#"{"processor_timeout_ms": 250}"#).unwrap();
        assert_eq!(config.processor_timeout(), Duration::from_millis(250));
        assert_eq!(config.poison_pill_threshold, POISON_PILL_THRESHOLD);
    }

    #[test]
    fn test_builders() {
        let config = ConsumerConfig::default()
            .with_processor_timeout(Duration::from_secs(2))
            .with_renew_interval(Duration::from_secs(1));
        assert_eq!(config.processor_timeout_ms, 2_000);
        assert_eq!(config.renew_interval_ms, 1_000);

        let rebalancer = RebalancerConfig::default().with_interval(Duration::from_millis(750));
        assert_eq!(rebalancer.interval(), Duration::from_millis(750));
    }
}
