//! Lease records, key layout and leaser configuration.

use std::time::Duration;

use shardline_core::{InstanceId, ShardId, StreamId};
use tokio::time::Instant;

// -----------------------------------------------------------------------------
// Lease Record
// -----------------------------------------------------------------------------

/// A lease as stored: an owner and an expiry for an arbitrary key.
///
/// The store is keyed by plain strings so the same backend can hold shard
/// leases, checkpoints and instance heartbeats side by side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseRecord {
    /// Store key.
    pub key: String,
    /// Instance holding the lease.
    pub owner: InstanceId,
    /// When the lease was first acquired by this owner.
    pub acquired_at: Instant,
    /// When the lease lapses unless renewed.
    pub expires_at: Instant,
    /// Number of successful renewals by this owner.
    pub renewals: u64,
}

impl LeaseRecord {
    /// Creates a fresh record expiring `ttl` after `now`.
    #[must_use]
    pub fn new(key: impl Into<String>, owner: InstanceId, now: Instant, ttl: Duration) -> Self {
        Self {
            key: key.into(),
            owner,
            acquired_at: now,
            expires_at: now + ttl,
            renewals: 0,
        }
    }

    /// Returns true if the lease has expired at the given time.
    #[must_use]
    pub fn is_expired_at(&self, now: Instant) -> bool {
        now >= self.expires_at
    }

    /// Returns true if `instance` holds this lease at `now`.
    #[must_use]
    pub fn is_held_by(&self, instance: &InstanceId, now: Instant) -> bool {
        self.owner == *instance && !self.is_expired_at(now)
    }
}

// -----------------------------------------------------------------------------
// Shard Lease
// -----------------------------------------------------------------------------

/// Ownership claim over one shard of one stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    /// Stream the shard belongs to.
    pub stream_id: StreamId,
    /// The leased shard.
    pub shard_id: ShardId,
    /// Instance holding the lease.
    pub owner: InstanceId,
    /// When the lease lapses unless renewed.
    pub expires_at: Instant,
}

impl Lease {
    /// Returns true if the lease has expired at the given time.
    #[must_use]
    pub fn is_expired_at(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

// -----------------------------------------------------------------------------
// Key Layout
// -----------------------------------------------------------------------------

/// Store key for a shard lease.
#[must_use]
pub fn shard_lease_key(stream_id: &StreamId, shard_id: &ShardId) -> String {
    format!("{stream_id}/lease/{shard_id}")
}

/// Store key for a shard checkpoint.
#[must_use]
pub fn checkpoint_key(stream_id: &StreamId, shard_id: &ShardId) -> String {
    format!("{stream_id}/checkpoint/{shard_id}")
}

/// Prefix under which instance heartbeats for a stream live.
#[must_use]
pub fn heartbeat_prefix(stream_id: &StreamId) -> String {
    format!("{stream_id}/instance/")
}

/// Store key for an instance heartbeat.
#[must_use]
pub fn heartbeat_key(stream_id: &StreamId, instance_id: &InstanceId) -> String {
    format!("{}{instance_id}", heartbeat_prefix(stream_id))
}

// -----------------------------------------------------------------------------
// Configuration
// -----------------------------------------------------------------------------

/// Configuration for a [`ShardLeaser`](crate::ShardLeaser).
#[derive(Debug, Clone)]
pub struct LeaseConfig {
    /// Lifetime of a shard lease between renewals.
    pub ttl: Duration,
    /// Lifetime of an instance heartbeat.
    pub heartbeat_ttl: Duration,
    /// Interval between heartbeat writes.
    pub heartbeat_interval: Duration,
}

impl LeaseConfig {
    /// Creates a configuration for testing (short lifetimes).
    #[must_use]
    pub const fn for_testing() -> Self {
        Self {
            ttl: Duration::from_millis(3_000),
            heartbeat_ttl: Duration::from_millis(3_000),
            heartbeat_interval: Duration::from_millis(1_000),
        }
    }

    /// Sets the shard lease TTL.
    #[must_use]
    pub const fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Sets the heartbeat TTL and interval.
    #[must_use]
    pub const fn with_heartbeat(mut self, ttl: Duration, interval: Duration) -> Self {
        self.heartbeat_ttl = ttl;
        self.heartbeat_interval = interval;
        self
    }
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(30),
            heartbeat_ttl: Duration::from_secs(30),
            heartbeat_interval: Duration::from_secs(10),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_layout() {
        let stream = StreamId::new("orders");
        let shard = ShardId::new("shard-3");
        let instance = InstanceId::new("node-a");

        assert_eq!(shard_lease_key(&stream, &shard), "orders/lease/shard-3");
        assert_eq!(checkpoint_key(&stream, &shard), "orders/checkpoint/shard-3");
        assert_eq!(heartbeat_key(&stream, &instance), "orders/instance/node-a");
        assert!(heartbeat_key(&stream, &instance).starts_with(&heartbeat_prefix(&stream)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_record_expiry() {
        let now = Instant::now();
        let record = LeaseRecord::new("k", InstanceId::new("a"), now, Duration::from_secs(5));

        assert!(record.is_held_by(&InstanceId::new("a"), now));
        assert!(!record.is_held_by(&InstanceId::new("b"), now));
        assert!(!record.is_expired_at(now + Duration::from_millis(4_999)));
        assert!(record.is_expired_at(now + Duration::from_secs(5)));
    }
}
