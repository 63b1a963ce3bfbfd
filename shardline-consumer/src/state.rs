//! Consumer lifecycle phases, exit reasons and counters.

use std::sync::atomic::{AtomicU64, Ordering};

use shardline_core::ShardId;

/// Lifecycle phase of a shard consumer.
///
/// ```text
/// Initializing -> Running <-> Backoff -> Draining -> Stopped
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConsumerPhase {
    /// Reading the checkpoint and acquiring an iterator.
    Initializing,
    /// Fetching and processing.
    Running,
    /// Sleeping before the next fetch.
    Backoff,
    /// Stopping renewal and releasing the lease.
    Draining,
    /// Finished.
    Stopped,
}

impl ConsumerPhase {
    /// Returns true once the consumer has started shutting down.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Draining | Self::Stopped)
    }
}

/// Why a shard consumer stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExitReason {
    /// `stop()` was called or the parent was cancelled.
    Stopped,
    /// Lease renewal failed or another instance owns the shard.
    LockLost,
    /// The shard is closed and fully read.
    ShardClosed,
    /// The processor exceeded its deadline.
    ProcessorTimeout,
    /// Consecutive errors reached the ceiling.
    ErrorCeiling,
    /// No iterator could be obtained at startup.
    IteratorUnavailable,
}

impl ExitReason {
    /// Returns true if the shard must be reported lost to the rebalancer.
    #[must_use]
    pub const fn is_shard_lost(self) -> bool {
        !matches!(self, Self::Stopped)
    }

    /// Short static name for structured logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Stopped => "stopped",
            Self::LockLost => "lock_lost",
            Self::ShardClosed => "shard_closed",
            Self::ProcessorTimeout => "processor_timeout",
            Self::ErrorCeiling => "error_ceiling",
            Self::IteratorUnavailable => "iterator_unavailable",
        }
    }
}

impl std::fmt::Display for ExitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Sent to the rebalancer when a consumer exits on its own.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardLost {
    /// The shard.
    pub shard_id: ShardId,
    /// Why its consumer exited.
    pub reason: ExitReason,
}

/// Live counters of one consumer.
#[derive(Debug, Default)]
pub(crate) struct ConsumerCounters {
    pub batches: AtomicU64,
    pub records: AtomicU64,
    pub checkpoints: AtomicU64,
    pub poison_pills: AtomicU64,
    pub processing_failures: AtomicU64,
    pub transport_errors: AtomicU64,
    pub throttles: AtomicU64,
    pub resyncs: AtomicU64,
}

impl ConsumerCounters {
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ConsumerStats {
        ConsumerStats {
            batches: self.batches.load(Ordering::Relaxed),
            records: self.records.load(Ordering::Relaxed),
            checkpoints: self.checkpoints.load(Ordering::Relaxed),
            poison_pills: self.poison_pills.load(Ordering::Relaxed),
            processing_failures: self.processing_failures.load(Ordering::Relaxed),
            transport_errors: self.transport_errors.load(Ordering::Relaxed),
            throttles: self.throttles.load(Ordering::Relaxed),
            resyncs: self.resyncs.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of a consumer's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsumerStats {
    /// Non-empty batches fetched.
    pub batches: u64,
    /// Records handed to the processor successfully.
    pub records: u64,
    /// Checkpoints written.
    pub checkpoints: u64,
    /// Batches skipped as poison pills.
    pub poison_pills: u64,
    /// Processor failures and timeouts.
    pub processing_failures: u64,
    /// Non-throttle transport errors.
    pub transport_errors: u64,
    /// Throttled fetches.
    pub throttles: u64,
    /// Iterator resyncs after expiry.
    pub resyncs: u64,
}
