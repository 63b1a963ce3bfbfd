//! System limits and fixed constants.
//!
//! Every queue, registry and retry loop in Shardline has an explicit bound.
//! The values that govern correctness (poison-pill threshold, error ceiling)
//! are constants; the rest live in [`Limits`] so deployments can tighten them.

use crate::error::{Error, Result};

/// Consecutive fetch cycles whose leading position does not advance before a
/// batch is treated as a poison pill.
pub const POISON_PILL_THRESHOLD: u32 = 3;

/// Consecutive counted errors after which a shard loop gives up.
pub const MAX_CONSECUTIVE_ERRORS: u32 = 10;

/// Attempts made by the renewal task before a lease is declared lost.
pub const RENEWAL_ATTEMPTS: u32 = 3;

/// Resource limits for one Shardline instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    /// Maximum records requested in one fetch.
    pub max_batch_records: u32,
    /// Maximum shards one instance will run consumers for.
    pub max_held_shards: u32,
    /// Maximum instances considered in one assignment.
    pub max_instances: u32,
    /// Maximum records accepted in one `put`.
    pub max_put_records: u32,
    /// Maximum payload size of a single record in bytes.
    pub max_record_bytes: u32,
}

impl Limits {
    /// Creates limits with safe defaults.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            max_batch_records: 10_000,
            max_held_shards: 1_024,
            max_instances: 1_024,
            max_put_records: 500,
            max_record_bytes: 1024 * 1024,
        }
    }

    /// Validates that every limit is non-zero.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` naming the first zero limit.
    pub const fn validate(&self) -> Result<()> {
        if self.max_batch_records == 0 {
            return Err(Error::InvalidArgument {
                name: "max_batch_records",
                reason: "must be non-zero",
            });
        }
        if self.max_held_shards == 0 {
            return Err(Error::InvalidArgument {
                name: "max_held_shards",
                reason: "must be non-zero",
            });
        }
        if self.max_instances == 0 {
            return Err(Error::InvalidArgument {
                name: "max_instances",
                reason: "must be non-zero",
            });
        }
        if self.max_put_records == 0 {
            return Err(Error::InvalidArgument {
                name: "max_put_records",
                reason: "must be non-zero",
            });
        }
        Ok(())
    }

    /// Clamps a requested batch size into `1..=max_batch_records`.
    #[must_use]
    pub const fn clamp_batch(&self, requested: u32) -> u32 {
        if requested == 0 {
            1
        } else if requested > self.max_batch_records {
            self.max_batch_records
        } else {
            requested
        }
    }
}

impl Default for Limits {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_limits_are_valid() {
        assert!(Limits::default().validate().is_ok());
    }

    #[test]
    fn test_zero_limit_rejected() {
        let limits = Limits {
            max_held_shards: 0,
            ..Limits::new()
        };
        assert_eq!(
            limits.validate(),
            Err(Error::InvalidArgument {
                name: "max_held_shards",
                reason: "must be non-zero",
            })
        );
    }

    #[test]
    fn test_clamp_batch() {
        let limits = Limits::new();
        assert_eq!(limits.clamp_batch(0), 1);
        assert_eq!(limits.clamp_batch(250), 250);
        assert_eq!(limits.clamp_batch(1_000_000), 10_000);
    }
}
