//! Shard leasing and checkpoint persistence for Shardline.
//!
//! This crate wraps an external lock/checkpoint store with the per-shard
//! semantics the consumers need.
//!
//! # Overview
//!
//! - **Leases**: an instance acquires a time-bounded claim on a shard before
//!   consuming it and renews the claim while it works. Renewal checks current
//!   ownership, so an instance that lost its lease can never extend the new
//!   owner's claim.
//! - **Checkpoints**: the last fully handled position of each shard, written
//!   independently of lease state.
//! - **Membership**: instances publish heartbeats into the same store, which
//!   `StoreMembership` turns into the roster used for assignment.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use shardline_core::{InstanceId, ShardId, StreamId};
//! use shardline_lease::{LeaseConfig, ShardLeaser, SimulatedLeaseStore};
//!
//! let store = Arc::new(SimulatedLeaseStore::new(42));
//! let leaser = ShardLeaser::new(
//!     StreamId::new("orders"),
//!     InstanceId::new("node-a"),
//!     LeaseConfig::default(),
//!     store,
//! );
//!
//! let shard = ShardId::new("shard-0");
//! if leaser.acquire_or_renew_lock(&shard).await {
//!     let start = leaser.get_checkpoint(&shard).await?;
//!     // ... consume ...
//! }
//! ```
//!
//! # Testing
//!
//! [`SimulatedLeaseStore`] provides deterministic fault injection and
//! expires leases on tokio time, so paused-clock tests control expiry.

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

mod error;
mod leaser;
mod membership;
mod storage;
mod types;

pub use error::{LeaseError, LeaseResult};
pub use leaser::ShardLeaser;
pub use membership::{MembershipProvider, StaticMembership, StoreMembership};
pub use storage::{AcquireOutcome, LeaseStore, LeaseStoreFaultConfig, SimulatedLeaseStore};
pub use types::{
    checkpoint_key, heartbeat_key, heartbeat_prefix, shard_lease_key, Lease, LeaseConfig,
    LeaseRecord,
};
