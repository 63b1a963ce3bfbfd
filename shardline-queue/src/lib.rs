//! Queue facade for Shardline.
//!
//! [`Queue`] is the entry point applications use: `produce` writes JSON
//! messages routed by partition key, `consume` joins the consuming fleet
//! with a message processor, and `shutdown` hands every held shard back.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use shardline_consumer::MemoryTransport;
//! use shardline_lease::SimulatedLeaseStore;
//! use shardline_queue::{Queue, QueueConfig};
//!
//! let config = QueueConfig::from_file("shardline.toml")?;
//! let queue = Queue::new(config, Arc::new(transport), Arc::new(store))?;
//! queue.produce([("customer-7", order)]).await?;
//! queue.consume(Arc::new(OrderProcessor)).await?;
//! // ...
//! queue.shutdown().await;
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

mod config;
mod error;
mod queue;

pub use config::{LeaseSection, QueueConfig};
pub use error::{QueueError, QueueResult};
pub use queue::Queue;
