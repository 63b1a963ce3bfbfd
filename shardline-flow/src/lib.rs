//! Flow control for Shardline shard consumers.
//!
//! Every shard consumer consults an [`AdaptiveStrategy`] before each fetch:
//! how many records to pull, and whether to hold off entirely. It reports the
//! outcome of each fetch cycle back as a [`BatchResult`].
//!
//! - **AIMD controller**: batch size grows additively while the shard is
//!   healthy and shrinks multiplicatively on high latency, errors, or throttling.
//! - **AIMD strategy**: one controller per shard plus an exponential backoff
//!   window after throttles, failures and poison pills.
//!
//! # Example
//!
//! ```rust
//! use shardline_core::ShardId;
//! use shardline_flow::{AdaptiveStrategy, AimdStrategy, AimdStrategyConfig};
//!
//! let strategy = AimdStrategy::new(AimdStrategyConfig::for_testing());
//! let shard = ShardId::new("shard-0");
//! assert_eq!(strategy.batch_size(&shard), 100);
//! ```
//!
//! # Deterministic Time
//!
//! Backoff deadlines are taken from `tokio::time::Instant`, so tests running
//! on a paused clock control when a shard leaves backoff.

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

mod aimd;
mod strategy;

pub use aimd::{AimdConfig, AimdController, AimdState, AimdStats, WindowMetrics};
pub use strategy::{AdaptiveStrategy, AimdStrategy, AimdStrategyConfig, BatchResult};
