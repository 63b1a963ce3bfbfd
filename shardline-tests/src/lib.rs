//! Shardline Tests - integration and simulation testing for Shardline.
//!
//! This crate contains the cross-crate tests for Shardline. Tests are
//! organized by component and type:
//!
//! ## Test Organization
//!
//! **DST Tests** (`*_dst.rs`): Deterministic simulation with fault injection
//! - `fleet_dst`: Several rebalancers sharing one stream and one lease store,
//!   with roster changes, ghost leases and transport/store faults
//!
//! **Integration Tests** (`*_tests.rs`): Multi-component integration
//! - `assignment_tests`: Assignment partitioning over many fleet shapes
//! - `consumer_tests`: Shard consumer scenarios end to end
//! - `leaser_tests`: Leases, checkpoints and heartbeats over the simulated store
//! - `rebalancer_tests`: Rebalancing across several instances
//! - `queue_tests`: The queue facade produce/consume/shutdown cycle
//!
//! **Support Modules**:
//! - `properties`: Property definitions (partitioning, exclusivity, delivery)
//! - `scenarios`: Recording doubles, a scripted transport and fixtures
//!
//! ## Naming Conventions
//!
//! - DST tests: `test_dst_<component>_<scenario>`
//! - Integration tests: `test_<component>_<scenario>`
//! - Unit tests: Inline in each crate under `#[cfg(test)]`

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

pub mod properties;
pub mod scenarios;

// DST test modules (deterministic simulation with fault injection).
#[cfg(test)]
mod fleet_dst;

// Integration test modules (multi-component tests).
#[cfg(test)]
mod assignment_tests;
#[cfg(test)]
mod leaser_tests;
