//! Shard assignment, per-shard consumption, and rebalancing for Shardline.
//!
//! This crate holds the coordination core: no central coordinator, just
//! instances that agree on a deterministic assignment and enforce it with
//! leases.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                        ShardRebalancer                       │
//! │  tick: list shards + roster -> assignment -> start / stop    │
//! │                                                              │
//! │   ┌───────────────┐   ┌───────────────┐   ┌───────────────┐  │
//! │   │ ShardConsumer │   │ ShardConsumer │   │ ShardConsumer │  │
//! │   │ fetch/process │   │ fetch/process │   │ fetch/process │  │
//! │   │ + renewal     │   │ + renewal     │   │ + renewal     │  │
//! │   └───────┬───────┘   └───────┬───────┘   └───────┬───────┘  │
//! └───────────┼───────────────────┼───────────────────┼──────────┘
//!             ▼                   ▼                   ▼
//!      StreamTransport      ShardLeaser (leases + checkpoints)
//! ```
//!
//! # Delivery
//!
//! Delivery is at-least-once. A checkpoint is written only after the
//! processor succeeds, or when a batch is skipped as a poison pill.
//!
//! # Testing
//!
//! [`MemoryTransport`] is a complete in-memory stream with deterministic
//! fault injection. Together with `shardline_lease::SimulatedLeaseStore` it
//! runs whole fleets on a paused tokio clock.

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

mod config;
mod consumer;
mod error;
mod listener;
mod manager;
mod processor;
mod rebalancer;
mod renewal;
mod state;
mod transport;

pub use config::{ConsumerConfig, RebalancerConfig};
pub use consumer::{ConsumerHandle, ShardConsumer};
pub use error::{ConsumerError, ConsumerResult, ProcessError, TransportError, TransportResult};
pub use listener::{ConsumerListener, NoopListener};
pub use manager::{compute_assignment, ShardAssignment, ShardManager};
pub use processor::{decode_batch, Message, MessageProcessor};
pub use rebalancer::{RebalanceOutcome, ShardRebalancer};
pub use state::{ConsumerPhase, ConsumerStats, ExitReason, ShardLost};
pub use transport::{
    FetchBatch, IteratorHandle, IteratorPosition, MemoryTransport, MemoryTransportFaultConfig,
    StreamTransport, ITERATOR_TTL_DEFAULT,
};
