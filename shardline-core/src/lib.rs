//! Shardline Core - Strongly-typed identifiers, records and limits.
//!
//! This crate holds the vocabulary shared by every other Shardline crate.
//! It performs no I/O and owns no tasks.
//!
//! # Design Principles
//!
//! - **Strongly-typed IDs**: a `ShardId` cannot be passed as an `InstanceId`
//! - **Explicit limits**: every registry and batch has a bounded maximum
//! - **Closed error kinds**: failures are classified, never string-matched

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod error;
mod limits;
mod record;
mod types;

pub use error::{Classify, Error, ErrorKind, Result};
pub use limits::{Limits, MAX_CONSECUTIVE_ERRORS, POISON_PILL_THRESHOLD, RENEWAL_ATTEMPTS};
pub use record::{PutEntry, PutOutcome, StreamRecord};
pub use types::{InstanceId, PositionToken, ShardId, StreamId};
