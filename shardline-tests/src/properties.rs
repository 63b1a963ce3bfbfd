//! Property definitions and checkers for Shardline simulation tests.
//!
//! Properties are invariants that must hold throughout a simulation. The
//! checkers take plain snapshots so they work the same for a single tick and
//! for a whole fleet run.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use shardline_consumer::compute_assignment;
use shardline_core::{InstanceId, ShardId};

// ============================================================================
// Property Violation Types
// ============================================================================

/// A violation of a Shardline safety or liveness property.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PropertyViolation {
    /// A shard was targeted at more than one instance.
    DoubleAssignment {
        /// The shard.
        shard: ShardId,
        /// Instances that were all given the shard.
        instances: Vec<InstanceId>,
    },
    /// A shard was targeted at no instance.
    UnassignedShard {
        /// The shard.
        shard: ShardId,
    },
    /// More than one instance was actively consuming a shard.
    ConcurrentConsumers {
        /// The shard.
        shard: ShardId,
        /// Instances with an active consumer on it.
        instances: Vec<InstanceId>,
    },
    /// A produced message was never delivered.
    Undelivered {
        /// Missing message numbers, smallest first.
        missing: Vec<u64>,
    },
}

impl std::fmt::Display for PropertyViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DoubleAssignment { shard, instances } => {
                write!(f, "Shard {shard} assigned to several instances: {instances:?}")
            }
            Self::UnassignedShard { shard } => write!(f, "Shard {shard} assigned to no instance"),
            Self::ConcurrentConsumers { shard, instances } => {
                write!(f, "Shard {shard} consumed concurrently by {instances:?}")
            }
            Self::Undelivered { missing } => {
                write!(f, "{} messages never delivered, first {:?}", missing.len(), missing.first())
            }
        }
    }
}

// ============================================================================
// Assignment
// ============================================================================

/// Checks that the targets of every roster member partition `shards`.
///
/// # Errors
///
/// Returns the first shard that is double-assigned or unassigned.
pub fn check_assignment_partition(
    shards: &[ShardId],
    roster: &[InstanceId],
) -> Result<(), PropertyViolation> {
    let mut owners: BTreeMap<ShardId, Vec<InstanceId>> = BTreeMap::new();
    for instance in roster {
        let assignment = compute_assignment(shards, roster, &BTreeSet::new(), instance);
        for shard in assignment.target_shards {
            owners.entry(shard).or_default().push(instance.clone());
        }
    }

    for shard in shards {
        match owners.get(shard) {
            None if !roster.is_empty() => {
                return Err(PropertyViolation::UnassignedShard { shard: shard.clone() });
            }
            Some(instances) if instances.len() > 1 => {
                return Err(PropertyViolation::DoubleAssignment {
                    shard: shard.clone(),
                    instances: instances.clone(),
                });
            }
            _ => {}
        }
    }
    Ok(())
}

// ============================================================================
// Exclusivity
// ============================================================================

/// Checks that no shard has an active consumer on more than one instance.
///
/// `active` lists, per instance, the shards whose consumers are fetching or
/// backing off.
///
/// # Errors
///
/// Returns the first shard with concurrent consumers.
pub fn check_exclusive_consumers(
    active: &[(InstanceId, Vec<ShardId>)],
) -> Result<(), PropertyViolation> {
    let mut owners: BTreeMap<&ShardId, Vec<InstanceId>> = BTreeMap::new();
    for (instance, shards) in active {
        for shard in shards {
            owners.entry(shard).or_default().push(instance.clone());
        }
    }
    match owners.into_iter().find(|(_, instances)| instances.len() > 1) {
        Some((shard, instances)) => Err(PropertyViolation::ConcurrentConsumers {
            shard: shard.clone(),
            instances,
        }),
        None => Ok(()),
    }
}

// ============================================================================
// Delivery
// ============================================================================

/// Checks at-least-once delivery of messages `0..produced`.
///
/// # Errors
///
/// Returns the missing message numbers.
pub fn check_delivered(produced: u64, delivered: &HashSet<u64>) -> Result<(), PropertyViolation> {
    let missing: Vec<u64> = (0..produced).filter(|n| !delivered.contains(n)).collect();
    if missing.is_empty() {
        Ok(())
    } else {
        Err(PropertyViolation::Undelivered { missing })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shards(n: usize) -> Vec<ShardId> {
        (0..n).map(|i| ShardId::new(format!("shard-{i:04}"))).collect()
    }

    #[test]
    fn test_exclusive_consumers_detects_overlap() {
        let a = InstanceId::new("a");
        let b = InstanceId::new("b");
        let s = shards(2);
        assert!(check_exclusive_consumers(&[(a.clone(), vec![s[0].clone()]), (b.clone(), vec![s[1].clone()])]).is_ok());

        let err = check_exclusive_consumers(&[(a, vec![s[0].clone()]), (b, vec![s[0].clone()])]).unwrap_err();
        assert!(matches!(err, PropertyViolation::ConcurrentConsumers { .. }));
    }

    #[test]
    fn test_delivered_reports_missing() {
        let delivered: HashSet<u64> = [0, 1, 3].into_iter().collect();
        assert_eq!(
            check_delivered(4, &delivered),
            Err(PropertyViolation::Undelivered { missing: vec![2] })
        );
        assert!(check_delivered(2, &delivered).is_ok());
    }
}
