//! Shard discovery and assignment.
//!
//! Assignment is computed independently on every instance, with no
//! coordination. It only stays disjoint because every instance sorts the same
//! shard list and the same roster before slicing it into blocks.

use std::collections::BTreeSet;
use std::sync::Arc;

use shardline_core::{InstanceId, ShardId, StreamId};

use crate::error::TransportResult;
use crate::transport::StreamTransport;

/// Result of an assignment computation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShardAssignment {
    /// Shards this instance should own, sorted.
    pub target_shards: Vec<ShardId>,
    /// Held shards that are no longer targeted, sorted.
    pub shards_to_release: Vec<ShardId>,
}

/// Lists shards and computes this instance's share of them.
#[derive(Clone)]
pub struct ShardManager {
    instance_id: InstanceId,
    transport: Arc<dyn StreamTransport>,
}

impl ShardManager {
    /// Creates a manager for `instance_id`.
    #[must_use]
    pub fn new(instance_id: InstanceId, transport: Arc<dyn StreamTransport>) -> Self {
        Self {
            instance_id,
            transport,
        }
    }

    /// Returns the instance this manager computes for.
    #[must_use]
    pub const fn instance_id(&self) -> &InstanceId {
        &self.instance_id
    }

    /// Lists the shards of a stream.
    ///
    /// # Errors
    ///
    /// Returns the transport error unchanged.
    pub async fn list_shards(&self, stream_id: &StreamId) -> TransportResult<Vec<ShardId>> {
        self.transport.list_shards(stream_id).await
    }

    /// Computes this instance's target shards and the held shards to release.
    #[must_use]
    pub fn calculate_shard_assignment(
        &self,
        available_shards: &[ShardId],
        active_instances: &[InstanceId],
        currently_held: &BTreeSet<ShardId>,
    ) -> ShardAssignment {
        compute_assignment(
            available_shards,
            active_instances,
            currently_held,
            &self.instance_id,
        )
    }
}

impl std::fmt::Debug for ShardManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardManager")
            .field("instance_id", &self.instance_id)
            .finish_non_exhaustive()
    }
}

/// Pure block assignment.
///
/// With `N` shards and `k` instances the block size is `ceil(N / k)`, and the
/// instance at roster index `i` owns `[i * block, min((i + 1) * block, N))`.
/// An instance missing from the roster owns nothing.
#[must_use]
pub fn compute_assignment(
    available_shards: &[ShardId],
    active_instances: &[InstanceId],
    currently_held: &BTreeSet<ShardId>,
    instance_id: &InstanceId,
) -> ShardAssignment {
    let shards: Vec<&ShardId> = available_shards
        .iter()
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();
    let roster: Vec<&InstanceId> = active_instances
        .iter()
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();

    let target_shards: Vec<ShardId> = match roster.iter().position(|i| *i == instance_id) {
        Some(index) if !shards.is_empty() => {
            let block = shards.len().div_ceil(roster.len());
            let start = (index * block).min(shards.len());
            let end = ((index + 1) * block).min(shards.len());
            shards[start..end].iter().map(|s| (*s).clone()).collect()
        }
        _ => Vec::new(),
    };

    let shards_to_release = currently_held
        .iter()
        .filter(|s| target_shards.binary_search(*s).is_err())
        .cloned()
        .collect();

    ShardAssignment {
        target_shards,
        shards_to_release,
    }
}
