//! Adaptive strategy: per-shard batch sizing and backoff.
//!
//! Shard consumers ask the strategy how many records to fetch and whether to
//! hold off, and report every batch outcome back. The strategy is shared by
//! all consumers of an instance, so state is kept per shard behind a mutex.

#![allow(clippy::significant_drop_tightening)]

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use shardline_core::ShardId;
use tokio::time::Instant;
use tracing::debug;

use crate::aimd::{AimdConfig, AimdController, AimdStats};

// -----------------------------------------------------------------------------
// Batch Result
// -----------------------------------------------------------------------------

/// Outcome of one fetch cycle, reported to the strategy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchResult {
    /// Shard the batch came from.
    pub shard_id: ShardId,
    /// Records in the batch.
    pub records: u32,
    /// Records handled successfully.
    pub successes: u32,
    /// Records that failed.
    pub failures: u32,
    /// Time spent in the processor.
    pub latency: Duration,
    /// The transport throttled the fetch.
    pub throttled: bool,
    /// The batch was skipped as a poison pill.
    pub poison_pill: bool,
}

impl BatchResult {
    /// A batch the processor handled.
    #[must_use]
    pub const fn success(shard_id: ShardId, records: u32, latency: Duration) -> Self {
        Self {
            shard_id,
            records,
            successes: records,
            failures: 0,
            latency,
            throttled: false,
            poison_pill: false,
        }
    }

    /// A batch the processor failed or timed out on.
    #[must_use]
    pub const fn failure(shard_id: ShardId, records: u32, latency: Duration) -> Self {
        Self {
            shard_id,
            records,
            successes: 0,
            failures: records,
            latency,
            throttled: false,
            poison_pill: false,
        }
    }

    /// A fetch the transport throttled.
    #[must_use]
    pub const fn throttled(shard_id: ShardId) -> Self {
        Self {
            shard_id,
            records: 0,
            successes: 0,
            failures: 0,
            latency: Duration::ZERO,
            throttled: true,
            poison_pill: false,
        }
    }

    /// A batch skipped as a poison pill.
    #[must_use]
    pub const fn poison_pill(shard_id: ShardId, records: u32) -> Self {
        Self {
            shard_id,
            records,
            successes: 0,
            failures: records,
            latency: Duration::ZERO,
            throttled: false,
            poison_pill: true,
        }
    }
}

// -----------------------------------------------------------------------------
// Strategy Trait
// -----------------------------------------------------------------------------

/// Pluggable policy controlling batch size and backoff.
///
/// Implementations must be cheap and non-blocking: every method is called
/// from a shard's fetch loop.
pub trait AdaptiveStrategy: Send + Sync {
    /// Returns true if the shard should pause instead of fetching.
    fn should_backoff(&self, shard_id: &ShardId) -> bool;

    /// Returns how long the shard should sleep when it backs off or idles.
    fn processing_delay(&self, shard_id: &ShardId) -> Duration;

    /// Returns how many records the shard should fetch next.
    fn batch_size(&self, shard_id: &ShardId) -> u32;

    /// Reports the outcome of a fetch cycle.
    fn record_batch_result(&self, result: &BatchResult);

    /// Drops any state for a shard this instance no longer consumes.
    fn forget(&self, _shard_id: &ShardId) {}
}

// -----------------------------------------------------------------------------
// AIMD Strategy
// -----------------------------------------------------------------------------

/// Configuration for [`AimdStrategy`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AimdStrategyConfig {
    /// Batch sizing parameters.
    pub aimd: AimdConfig,
    /// First backoff after a throttle or failure, in milliseconds.
    pub backoff_base_ms: u64,
    /// Backoff ceiling, in milliseconds.
    pub backoff_max_ms: u64,
    /// Delay between polls of an idle shard, in milliseconds.
    pub idle_delay_ms: u64,
}

impl AimdStrategyConfig {
    /// Creates a configuration for testing.
    #[must_use]
    pub const fn for_testing() -> Self {
        Self {
            aimd: AimdConfig::for_testing(),
            backoff_base_ms: 100,
            backoff_max_ms: 1_000,
            idle_delay_ms: 50,
        }
    }

    /// Backoff after `n` consecutive bad results (`n >= 1`).
    #[must_use]
    pub fn backoff_for(&self, n: u32) -> Duration {
        let shift = n.saturating_sub(1).min(16);
        let ms = self
            .backoff_base_ms
            .saturating_mul(1_u64 << shift)
            .min(self.backoff_max_ms);
        Duration::from_millis(ms)
    }
}

impl Default for AimdStrategyConfig {
    fn default() -> Self {
        Self {
            aimd: AimdConfig::default(),
            backoff_base_ms: 1_000,
            backoff_max_ms: 30_000,
            idle_delay_ms: 1_000,
        }
    }
}

/// Per-shard flow state.
#[derive(Debug)]
struct ShardFlow {
    controller: AimdController,
    backoff_until: Option<Instant>,
    consecutive_bad: u32,
}

/// AIMD-driven adaptive strategy.
///
/// Each shard gets its own [`AimdController`]. Throttling forces an
/// immediate decrease; throttles, failures and poison pills put the shard in
/// an exponential backoff that clears on the next success.
#[derive(Debug)]
pub struct AimdStrategy {
    config: AimdStrategyConfig,
    shards: Mutex<HashMap<ShardId, ShardFlow>>,
}

impl AimdStrategy {
    /// Creates a new strategy.
    #[must_use]
    pub fn new(config: AimdStrategyConfig) -> Self {
        Self {
            config,
            shards: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the configuration.
    #[must_use]
    pub const fn config(&self) -> &AimdStrategyConfig {
        &self.config
    }

    fn with_shard<R>(&self, shard_id: &ShardId, f: impl FnOnce(&mut ShardFlow) -> R) -> R {
        let mut shards = self.shards.lock().expect("flow lock poisoned");
        let flow = shards.entry(shard_id.clone()).or_insert_with(|| ShardFlow {
            controller: AimdController::new(self.config.aimd.clone()),
            backoff_until: None,
            consecutive_bad: 0,
        });
        f(flow)
    }

    /// Returns controller statistics for a shard.
    ///
    /// # Panics
    ///
    /// Panics if the flow mutex is poisoned.
    #[must_use]
    pub fn stats(&self, shard_id: &ShardId) -> Option<AimdStats> {
        let shards = self.shards.lock().expect("flow lock poisoned");
        shards.get(shard_id).map(|f| f.controller.stats())
    }
}

impl AdaptiveStrategy for AimdStrategy {
    fn should_backoff(&self, shard_id: &ShardId) -> bool {
        let now = Instant::now();
        self.with_shard(shard_id, |flow| flow.backoff_until.is_some_and(|t| now < t))
    }

    fn processing_delay(&self, shard_id: &ShardId) -> Duration {
        let now = Instant::now();
        let idle = Duration::from_millis(self.config.idle_delay_ms);
        self.with_shard(shard_id, |flow| match flow.backoff_until {
            Some(until) if now < until => until - now,
            _ => idle,
        })
    }

    fn batch_size(&self, shard_id: &ShardId) -> u32 {
        self.with_shard(shard_id, |flow| flow.controller.batch_size())
    }

    fn record_batch_result(&self, result: &BatchResult) {
        let now = Instant::now();
        self.with_shard(&result.shard_id, |flow| {
            if result.throttled {
                flow.controller.force_decrease();
            } else {
                #[allow(clippy::cast_possible_truncation)]
                let latency_ms = result.latency.as_millis() as u64;
                flow.controller.record_batch(
                    u64::from(result.successes),
                    u64::from(result.failures),
                    latency_ms,
                );
            }

            let bad = result.throttled || result.poison_pill || result.failures > 0;
            if bad {
                flow.consecutive_bad += 1;
                let delay = self.config.backoff_for(flow.consecutive_bad);
                flow.backoff_until = Some(now + delay);
                debug!(
                    shard = %result.shard_id,
                    delay_ms = delay.as_millis(),
                    throttled = result.throttled,
                    poison_pill = result.poison_pill,
                    "Shard backing off"
                );
            } else {
                flow.consecutive_bad = 0;
                flow.backoff_until = None;
            }
        });
    }

    fn forget(&self, shard_id: &ShardId) {
        self.shards.lock().expect("flow lock poisoned").remove(shard_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shard() -> ShardId {
        ShardId::new("shard-0")
    }

    #[tokio::test(start_paused = true)]
    async fn test_fresh_shard_uses_initial_batch() {
        let strategy = AimdStrategy::new(AimdStrategyConfig::for_testing());
        assert_eq!(strategy.batch_size(&shard()), 100);
        assert!(!strategy.should_backoff(&shard()));
        assert_eq!(strategy.processing_delay(&shard()), Duration::from_millis(50));
    }

    #[tokio::test(start_paused = true)]
    async fn test_throttle_shrinks_and_backs_off() {
        let strategy = AimdStrategy::new(AimdStrategyConfig::for_testing());

        strategy.record_batch_result(&BatchResult::throttled(shard()));
        assert_eq!(strategy.batch_size(&shard()), 50);
        assert!(strategy.should_backoff(&shard()));
        assert_eq!(strategy.processing_delay(&shard()), Duration::from_millis(100));

        strategy.record_batch_result(&BatchResult::throttled(shard()));
        assert_eq!(strategy.processing_delay(&shard()), Duration::from_millis(200));

        tokio::time::advance(Duration::from_millis(201)).await;
        assert!(!strategy.should_backoff(&shard()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_clears_backoff() {
        let strategy = AimdStrategy::new(AimdStrategyConfig::for_testing());

        strategy.record_batch_result(&BatchResult::failure(shard(), 10, Duration::from_millis(5)));
        assert!(strategy.should_backoff(&shard()));

        strategy.record_batch_result(&BatchResult::success(shard(), 10, Duration::from_millis(5)));
        assert!(!strategy.should_backoff(&shard()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_poison_pill_backs_off() {
        let strategy = AimdStrategy::new(AimdStrategyConfig::for_testing());
        strategy.record_batch_result(&BatchResult::poison_pill(shard(), 3));
        assert!(strategy.should_backoff(&shard()));
    }

    #[test]
    fn test_backoff_is_capped() {
        let config = AimdStrategyConfig::for_testing();
        assert_eq!(config.backoff_for(1), Duration::from_millis(100));
        assert_eq!(config.backoff_for(3), Duration::from_millis(400));
        assert_eq!(config.backoff_for(30), Duration::from_millis(1_000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shards_are_independent() {
        let strategy = AimdStrategy::new(AimdStrategyConfig::for_testing());
        let other = ShardId::new("shard-1");

        strategy.record_batch_result(&BatchResult::throttled(shard()));
        assert!(strategy.should_backoff(&shard()));
        assert!(!strategy.should_backoff(&other));
        assert_eq!(strategy.batch_size(&other), 100);

        strategy.forget(&shard());
        assert!(strategy.stats(&shard()).is_none());
    }
}
