//! Stream record types.
//!
//! A record is the unit the transport stores and returns: an opaque payload
//! plus the position the transport assigned to it. Shardline never looks
//! inside a position token except to compare two tokens for equality.

use bytes::Bytes;

use crate::types::PositionToken;

/// A record as fetched from a shard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamRecord {
    /// Position of this record within its shard.
    pub position: PositionToken,
    /// Partition key the producer supplied.
    pub partition_key: String,
    /// Raw payload bytes.
    pub payload: Bytes,
}

impl StreamRecord {
    /// Creates a new record.
    #[must_use]
    pub fn new(
        position: PositionToken,
        partition_key: impl Into<String>,
        payload: impl Into<Bytes>,
    ) -> Self {
        Self {
            position,
            partition_key: partition_key.into(),
            payload: payload.into(),
        }
    }

    /// Returns the payload size in bytes.
    #[must_use]
    pub fn size(&self) -> usize {
        self.payload.len()
    }
}

/// A record to be written to a stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PutEntry {
    /// Key used to route the record to a shard.
    pub partition_key: String,
    /// Raw payload bytes.
    pub payload: Bytes,
}

impl PutEntry {
    /// Creates a new put entry.
    #[must_use]
    pub fn new(partition_key: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            partition_key: partition_key.into(),
            payload: payload.into(),
        }
    }
}

/// Result of a `put`: which entries the transport rejected.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PutOutcome {
    /// Indexes into the submitted entries that were not written.
    pub failed_indexes: Vec<usize>,
}

impl PutOutcome {
    /// Returns true if every entry was written.
    #[must_use]
    pub fn all_succeeded(&self) -> bool {
        self.failed_indexes.is_empty()
    }
}
