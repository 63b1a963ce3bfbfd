//! Queue configuration.
//!
//! Every section has defaults, so a TOML file only needs the fields it
//! changes:
//!
//! ```toml
//! stream = "orders"
//! instance = "node-a"
//!
//! [lease]
//! ttl_ms = 20000
//!
//! [consumer]
//! processor_timeout_ms = 10000
//! renew_interval_ms = 5000
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use shardline_consumer::{ConsumerConfig, RebalancerConfig};
use shardline_core::Limits;
use shardline_flow::AimdStrategyConfig;
use shardline_lease::LeaseConfig;

use crate::error::{QueueError, QueueResult};

/// Lease timings, in milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LeaseSection {
    /// Shard lease lifetime.
    pub ttl_ms: u64,
    /// Instance heartbeat lifetime.
    pub heartbeat_ttl_ms: u64,
    /// Interval between heartbeat writes.
    pub heartbeat_interval_ms: u64,
}

impl Default for LeaseSection {
    fn default() -> Self {
        Self {
            ttl_ms: 30_000,
            heartbeat_ttl_ms: 30_000,
            heartbeat_interval_ms: 10_000,
        }
    }
}

/// Complete configuration of one queue instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Stream to produce to and consume from.
    pub stream: String,
    /// Identity of this instance. Must be unique within the fleet.
    pub instance: String,
    /// Maximum records sent in one transport `put`.
    pub max_put_records: u32,
    /// Use the AIMD strategy for batch sizing and backoff.
    pub adaptive: bool,
    /// Lease timings.
    pub lease: LeaseSection,
    /// Shard consumer settings.
    pub consumer: ConsumerConfig,
    /// Rebalancer settings.
    pub rebalancer: RebalancerConfig,
    /// AIMD strategy settings, used when `adaptive` is set.
    pub flow: AimdStrategyConfig,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            stream: "default".to_string(),
            instance: "instance-0".to_string(),
            max_put_records: Limits::new().max_put_records,
            adaptive: true,
            lease: LeaseSection::default(),
            consumer: ConsumerConfig::default(),
            rebalancer: RebalancerConfig::default(),
            flow: AimdStrategyConfig::default(),
        }
    }
}

impl QueueConfig {
    /// Creates a configuration with short timers for tests.
    #[must_use]
    pub fn for_testing(stream: &str, instance: &str) -> Self {
        Self {
            stream: stream.to_string(),
            instance: instance.to_string(),
            max_put_records: Limits::new().max_put_records,
            adaptive: false,
            lease: LeaseSection {
                ttl_ms: 3_000,
                heartbeat_ttl_ms: 3_000,
                heartbeat_interval_ms: 1_000,
            },
            consumer: ConsumerConfig::for_testing(),
            rebalancer: RebalancerConfig::for_testing(),
            flow: AimdStrategyConfig::for_testing(),
        }
    }

    /// Loads a configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file<P: AsRef<Path>>(path: P) -> QueueResult<Self> {
        let contents = std::fs::read_to_string(path.as_ref()).map_err(|e| QueueError::Io {
            path: path.as_ref().display().to_string(),
            source: e,
        })?;
        Self::from_toml(&contents)
    }

    /// Parses a configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML cannot be parsed.
    pub fn from_toml(toml: &str) -> QueueResult<Self> {
        toml::from_str(toml).map_err(|e| QueueError::Parse {
            message: e.to_string(),
        })
    }

    /// Serializes the configuration to TOML.
    #[must_use]
    pub fn to_toml(&self) -> String {
        toml::to_string_pretty(self).unwrap_or_default()
    }

    /// Returns the leaser configuration.
    #[must_use]
    pub const fn lease_config(&self) -> LeaseConfig {
        LeaseConfig {
            ttl: Duration::from_millis(self.lease.ttl_ms),
            heartbeat_ttl: Duration::from_millis(self.lease.heartbeat_ttl_ms),
            heartbeat_interval: Duration::from_millis(self.lease.heartbeat_interval_ms),
        }
    }

    /// Checks the configuration for values that cannot work together.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` naming the first offending field.
    pub fn validate(&self) -> QueueResult<()> {
        let invalid = |field, reason| Err(QueueError::InvalidConfig { field, reason });

        if self.stream.is_empty() {
            return invalid("stream", "must not be empty");
        }
        if self.instance.is_empty() {
            return invalid("instance", "must not be empty");
        }
        if self.max_put_records == 0 {
            return invalid("max_put_records", "must be non-zero");
        }
        if self.lease.ttl_ms == 0 {
            return invalid("lease.ttl_ms", "must be non-zero");
        }
        if self.consumer.renew_interval_ms == 0 || self.consumer.renew_interval_ms >= self.lease.ttl_ms {
            return invalid("consumer.renew_interval_ms", "must be non-zero and below lease.ttl_ms");
        }
        if self.lease.heartbeat_interval_ms == 0
            || self.lease.heartbeat_interval_ms >= self.lease.heartbeat_ttl_ms
        {
            return invalid(
                "lease.heartbeat_interval_ms",
                "must be non-zero and below lease.heartbeat_ttl_ms",
            );
        }
        if self.consumer.processor_timeout_ms == 0 {
            return invalid("consumer.processor_timeout_ms", "must be non-zero");
        }
        if self.consumer.release_timeout_ms == 0 {
            return invalid("consumer.release_timeout_ms", "must be non-zero");
        }
        if self.consumer.default_batch_size == 0 || self.consumer.max_batch_records == 0 {
            return invalid("consumer.default_batch_size", "batch sizes must be non-zero");
        }
        if self.rebalancer.interval_ms == 0 {
            return invalid("rebalancer.interval_ms", "must be non-zero");
        }
        if self.rebalancer.max_held_shards == 0 || self.rebalancer.max_instances == 0 {
            return invalid("rebalancer.max_held_shards", "limits must be non-zero");
        }
        let aimd = &self.flow.aimd;
        if aimd.min_batch == 0 || aimd.min_batch > aimd.max_batch {
            return invalid("flow.aimd.min_batch", "must be non-zero and at most max_batch");
        }
        if !(aimd.multiplicative_decrease > 0.0 && aimd.multiplicative_decrease < 1.0) {
            return invalid("flow.aimd.multiplicative_decrease", "must be between 0 and 1");
        }
        Ok(())
    }
}
