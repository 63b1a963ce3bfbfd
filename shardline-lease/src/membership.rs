//! Fleet membership: who is in the roster the assignment is computed over.
//!
//! The roster must be returned in the same order on every instance, or two
//! instances can compute overlapping blocks. Both providers here sort.

use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use shardline_core::{InstanceId, StreamId};

use crate::error::LeaseResult;
use crate::storage::LeaseStore;
use crate::types::heartbeat_prefix;

/// Supplies the active-instance roster for a stream.
#[async_trait]
pub trait MembershipProvider: Send + Sync {
    /// Returns the active instances, sorted and deduplicated.
    async fn active_instances(&self, stream_id: &StreamId) -> LeaseResult<Vec<InstanceId>>;
}

// -----------------------------------------------------------------------------
// Static Membership
// -----------------------------------------------------------------------------

/// A roster held in memory and changed explicitly.
#[derive(Debug, Clone, Default)]
pub struct StaticMembership {
    roster: Arc<RwLock<Vec<InstanceId>>>,
}

impl StaticMembership {
    /// Creates a provider with the given roster.
    #[must_use]
    pub fn new(instances: impl IntoIterator<Item = InstanceId>) -> Self {
        let provider = Self::default();
        provider.set(instances);
        provider
    }

    /// Replaces the roster.
    ///
    /// # Panics
    ///
    /// Panics if the roster lock is poisoned.
    pub fn set(&self, instances: impl IntoIterator<Item = InstanceId>) {
        let mut roster: Vec<InstanceId> = instances.into_iter().collect();
        roster.sort();
        roster.dedup();
        *self.roster.write().expect("roster lock poisoned") = roster;
    }

    /// Adds an instance to the roster.
    ///
    /// # Panics
    ///
    /// Panics if the roster lock is poisoned.
    pub fn add(&self, instance: InstanceId) {
        let mut roster = self.roster.write().expect("roster lock poisoned");
        if let Err(pos) = roster.binary_search(&instance) {
            roster.insert(pos, instance);
        }
    }

    /// Removes an instance from the roster.
    ///
    /// # Panics
    ///
    /// Panics if the roster lock is poisoned.
    pub fn remove(&self, instance: &InstanceId) {
        let mut roster = self.roster.write().expect("roster lock poisoned");
        roster.retain(|i| i != instance);
    }

    /// Returns a snapshot of the roster.
    ///
    /// # Panics
    ///
    /// Panics if the roster lock is poisoned.
    #[must_use]
    pub fn snapshot(&self) -> Vec<InstanceId> {
        self.roster.read().expect("roster lock poisoned").clone()
    }
}

#[async_trait]
impl MembershipProvider for StaticMembership {
    async fn active_instances(&self, _stream_id: &StreamId) -> LeaseResult<Vec<InstanceId>> {
        Ok(self.snapshot())
    }
}

// -----------------------------------------------------------------------------
// Store Membership
// -----------------------------------------------------------------------------

/// Roster derived from live instance heartbeats in the lease store.
///
/// Instances appear once their leaser starts its heartbeat and disappear
/// when it is cleaned up or its heartbeat lapses.
#[derive(Clone)]
pub struct StoreMembership {
    store: Arc<dyn LeaseStore>,
}

impl StoreMembership {
    /// Creates a provider reading heartbeats from `store`.
    #[must_use]
    pub fn new(store: Arc<dyn LeaseStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl MembershipProvider for StoreMembership {
    async fn active_instances(&self, stream_id: &StreamId) -> LeaseResult<Vec<InstanceId>> {
        let records = self.store.scan_leases(&heartbeat_prefix(stream_id)).await?;
        let mut roster: Vec<InstanceId> = records.into_iter().map(|r| r.owner).collect();
        roster.sort();
        roster.dedup();
        Ok(roster)
    }
}

impl std::fmt::Debug for StoreMembership {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreMembership").finish_non_exhaustive()
    }
}
