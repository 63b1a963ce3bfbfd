//! AIMD (Additive Increase Multiplicative Decrease) batch sizing.
//!
//! The controller sizes fetches for one shard. It works the way TCP
//! congestion control does:
//!
//! 1. **Additive Increase**: while batches complete quickly and cleanly, grow
//!    the batch size linearly (e.g., +50 records per adjustment).
//! 2. **Multiplicative Decrease**: when a window shows slow processing or
//!    failures, or the transport throttles, shrink it multiplicatively
//!    (e.g., *0.5).
//!
//! Adjustments happen every `adjust_every` recorded batches rather than on a
//! wall-clock interval, so behavior depends only on the sequence of results.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Configuration for the AIMD controller.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AimdConfig {
    /// Initial batch size.
    pub initial_batch: u32,

    /// Minimum batch size (floor).
    pub min_batch: u32,

    /// Maximum batch size (ceiling).
    pub max_batch: u32,

    /// Additive increase per healthy window.
    pub additive_increase: u32,

    /// Multiplicative decrease factor (e.g., 0.5 halves the batch).
    /// Must be between 0.0 and 1.0.
    pub multiplicative_decrease: f64,

    /// Number of recorded batches per adjustment window.
    pub adjust_every: u32,

    /// Per-batch latency (milliseconds) above which the window is congested.
    pub latency_threshold_ms: u64,

    /// Failure ratio (0.0 to 1.0) above which the window is congested.
    pub error_rate_threshold: f64,
}

impl AimdConfig {
    /// Creates a new AIMD configuration.
    #[must_use]
    pub const fn new(initial_batch: u32, min_batch: u32, max_batch: u32) -> Self {
        Self {
            initial_batch,
            min_batch,
            max_batch,
            additive_increase: 50,
            multiplicative_decrease: 0.5,
            adjust_every: 4,
            latency_threshold_ms: 5_000,
            error_rate_threshold: 0.05,
        }
    }

    /// Sets the additive increase amount.
    #[must_use]
    pub const fn with_additive_increase(mut self, amount: u32) -> Self {
        self.additive_increase = amount;
        self
    }

    /// Sets the multiplicative decrease factor.
    #[must_use]
    pub const fn with_multiplicative_decrease(mut self, factor: f64) -> Self {
        self.multiplicative_decrease = factor;
        self
    }

    /// Sets the adjustment window length.
    #[must_use]
    pub const fn with_adjust_every(mut self, batches: u32) -> Self {
        self.adjust_every = batches;
        self
    }

    /// Sets the latency threshold.
    #[must_use]
    pub const fn with_latency_threshold(mut self, threshold: Duration) -> Self {
        #[allow(clippy::cast_possible_truncation)]
        let ms = threshold.as_millis() as u64;
        self.latency_threshold_ms = ms;
        self
    }

    /// Creates a configuration for testing.
    #[must_use]
    pub const fn for_testing() -> Self {
        Self {
            initial_batch: 100,
            min_batch: 10,
            max_batch: 1_000,
            additive_increase: 10,
            multiplicative_decrease: 0.5,
            adjust_every: 1,
            latency_threshold_ms: 50,
            error_rate_threshold: 0.1,
        }
    }
}

impl Default for AimdConfig {
    fn default() -> Self {
        Self::new(100, 10, 10_000)
    }
}

/// Metrics collected during one adjustment window.
#[derive(Debug, Clone, Default)]
pub struct WindowMetrics {
    /// Records processed successfully.
    pub success_count: u64,

    /// Records that failed processing.
    pub error_count: u64,

    /// Batches recorded in this window.
    pub batches: u32,

    /// Sum of batch latencies in milliseconds.
    pub latency_sum_ms: u64,

    /// Maximum batch latency observed in milliseconds.
    pub latency_max_ms: u64,
}

impl WindowMetrics {
    /// Creates new empty metrics.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            success_count: 0,
            error_count: 0,
            batches: 0,
            latency_sum_ms: 0,
            latency_max_ms: 0,
        }
    }

    /// Records one batch.
    pub fn record_batch(&mut self, successes: u64, failures: u64, latency_ms: u64) {
        self.success_count += successes;
        self.error_count += failures;
        self.batches += 1;
        self.latency_sum_ms = self.latency_sum_ms.saturating_add(latency_ms);
        self.latency_max_ms = self.latency_max_ms.max(latency_ms);
    }

    /// Returns the average batch latency, or 0 if no batches.
    #[must_use]
    pub const fn average_latency_ms(&self) -> u64 {
        if self.batches == 0 {
            0
        } else {
            self.latency_sum_ms / self.batches as u64
        }
    }

    /// Returns the failure ratio (0.0 to 1.0).
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn error_rate(&self) -> f64 {
        let total = self.success_count + self.error_count;
        if total == 0 {
            0.0
        } else {
            self.error_count as f64 / total as f64
        }
    }

    /// Resets all metrics.
    pub const fn reset(&mut self) {
        *self = Self::new();
    }
}

/// Phase of the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AimdState {
    /// Growing the batch (additive increase phase).
    Probing,
    /// Shrunk after congestion; waiting for healthy windows.
    Recovering,
    /// Several healthy windows in a row.
    Stable,
}

/// AIMD controller for one shard's batch size.
#[derive(Debug)]
pub struct AimdController {
    config: AimdConfig,
    batch_size: u32,
    state: AimdState,
    window: WindowMetrics,
    consecutive_healthy: u32,
    consecutive_congested: u32,
    total_increases: u64,
    total_decreases: u64,
}

impl AimdController {
    /// Creates a new controller.
    #[must_use]
    pub fn new(config: AimdConfig) -> Self {
        let batch_size = config.initial_batch.clamp(config.min_batch, config.max_batch);

        Self {
            config,
            batch_size,
            state: AimdState::Probing,
            window: WindowMetrics::new(),
            consecutive_healthy: 0,
            consecutive_congested: 0,
            total_increases: 0,
            total_decreases: 0,
        }
    }

    /// Returns the current batch size.
    #[must_use]
    pub const fn batch_size(&self) -> u32 {
        self.batch_size
    }

    /// Returns the current state.
    #[must_use]
    pub const fn state(&self) -> AimdState {
        self.state
    }

    /// Returns the number of consecutive congested windows.
    #[must_use]
    pub const fn consecutive_congested(&self) -> u32 {
        self.consecutive_congested
    }

    /// Returns the metrics of the open window.
    #[must_use]
    pub const fn window(&self) -> &WindowMetrics {
        &self.window
    }

    /// Records one batch and adjusts if the window is complete.
    ///
    /// Returns the new batch size if an adjustment was made.
    pub fn record_batch(&mut self, successes: u64, failures: u64, latency_ms: u64) -> Option<u32> {
        self.window.record_batch(successes, failures, latency_ms);
        if self.window.batches < self.config.adjust_every.max(1) {
            return None;
        }
        Some(self.adjust())
    }

    /// Closes the current window and adjusts the batch size.
    pub fn adjust(&mut self) -> u32 {
        if self.is_congested() {
            self.decrease();
            self.consecutive_healthy = 0;
            self.consecutive_congested += 1;
            self.state = AimdState::Recovering;
        } else {
            self.increase();
            self.consecutive_healthy += 1;
            self.consecutive_congested = 0;

            if self.consecutive_healthy >= 5 {
                self.state = AimdState::Stable;
            } else if self.state == AimdState::Recovering && self.consecutive_healthy >= 2 {
                self.state = AimdState::Probing;
            }
        }

        self.window.reset();
        self.batch_size
    }

    fn is_congested(&self) -> bool {
        if self.window.error_rate() > self.config.error_rate_threshold {
            return true;
        }
        self.window.latency_max_ms > self.config.latency_threshold_ms
            || self.window.average_latency_ms() > self.config.latency_threshold_ms
    }

    fn increase(&mut self) {
        let next = self.batch_size.saturating_add(self.config.additive_increase);
        self.batch_size = next.min(self.config.max_batch);
        self.total_increases += 1;
    }

    fn decrease(&mut self) {
        #[allow(
            clippy::cast_possible_truncation,
            clippy::cast_sign_loss,
            clippy::cast_precision_loss
        )]
        let next = (f64::from(self.batch_size) * self.config.multiplicative_decrease) as u32;
        self.batch_size = next.max(self.config.min_batch);
        self.total_decreases += 1;
    }

    /// Forces an immediate decrease on an explicit backpressure signal such
    /// as transport throttling.
    pub fn force_decrease(&mut self) {
        self.decrease();
        self.consecutive_healthy = 0;
        self.consecutive_congested += 1;
        self.state = AimdState::Recovering;
        self.window.reset();
    }

    /// Returns statistics about the controller.
    #[must_use]
    pub const fn stats(&self) -> AimdStats {
        AimdStats {
            batch_size: self.batch_size,
            state: self.state,
            consecutive_healthy: self.consecutive_healthy,
            consecutive_congested: self.consecutive_congested,
            total_increases: self.total_increases,
            total_decreases: self.total_decreases,
        }
    }
}

/// Statistics about an AIMD controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AimdStats {
    /// Current batch size.
    pub batch_size: u32,
    /// Current state.
    pub state: AimdState,
    /// Consecutive healthy windows.
    pub consecutive_healthy: u32,
    /// Consecutive congested windows.
    pub consecutive_congested: u32,
    /// Total increases performed.
    pub total_increases: u64,
    /// Total decreases performed.
    pub total_decreases: u64,
}
