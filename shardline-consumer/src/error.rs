//! Consumer error types.
//!
//! Transport and processor failures carry a [`ErrorKind`] so the shard loop
//! can decide between backing off, resyncing, counting, or exiting.

use shardline_core::{Classify, ErrorKind, ShardId, StreamId};
use shardline_lease::LeaseError;
use thiserror::Error;

/// Result type for transport operations.
pub type TransportResult<T> = Result<T, TransportError>;

/// Result type for consumer and rebalancer operations.
pub type ConsumerResult<T> = Result<T, ConsumerError>;

/// Errors raised by a stream transport.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// The transport is rate limiting the caller.
    #[error("throttled on shard {shard}")]
    Throttled {
        /// Shard the request targeted.
        shard: ShardId,
    },

    /// The iterator handle has expired and must be reacquired.
    #[error("iterator expired on shard {shard}")]
    IteratorExpired {
        /// Shard the iterator belonged to.
        shard: ShardId,
    },

    /// The stream does not exist.
    #[error("stream not found: {stream}")]
    StreamNotFound {
        /// The missing stream.
        stream: StreamId,
    },

    /// The shard does not exist in the stream.
    #[error("shard not found: {stream}/{shard}")]
    ShardNotFound {
        /// Stream searched.
        stream: StreamId,
        /// The missing shard.
        shard: ShardId,
    },

    /// The iterator handle is unknown to the transport.
    #[error("invalid iterator: {handle}")]
    InvalidIterator {
        /// The rejected handle.
        handle: String,
    },

    /// A put request carried too many records.
    #[error("put batch too large: {count} records exceeds max {max}")]
    BatchTooLarge {
        /// Records in the request.
        count: usize,
        /// Maximum allowed.
        max: u32,
    },

    /// The transport failed for another reason.
    #[error("transport unavailable during {operation}: {message}")]
    Unavailable {
        /// Operation that failed.
        operation: &'static str,
        /// Error message.
        message: String,
    },
}

impl Classify for TransportError {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::Throttled { .. } => ErrorKind::Throttled,
            Self::IteratorExpired { .. } => ErrorKind::IteratorExpired,
            Self::StreamNotFound { .. }
            | Self::ShardNotFound { .. }
            | Self::InvalidIterator { .. }
            | Self::BatchTooLarge { .. }
            | Self::Unavailable { .. } => ErrorKind::TransportFatal,
        }
    }
}

/// Errors raised by a message processor.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProcessError {
    /// The processor rejected the batch.
    #[error("processing failed: {message}")]
    Failed {
        /// Error message.
        message: String,
    },

    /// The processor did not finish before its deadline.
    #[error("processing timed out after {after_ms}ms")]
    Timeout {
        /// Deadline that elapsed, in milliseconds.
        after_ms: u64,
    },
}

impl ProcessError {
    /// Creates a processing failure.
    #[must_use]
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed {
            message: message.into(),
        }
    }
}

impl Classify for ProcessError {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::Failed { .. } => ErrorKind::ProcessingFailed,
            Self::Timeout { .. } => ErrorKind::ProcessingTimeout,
        }
    }
}

/// Errors raised by the consumer machinery.
#[derive(Debug, Error)]
pub enum ConsumerError {
    /// Transport failure.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Lease or checkpoint store failure.
    #[error("lease error: {0}")]
    Lease(#[from] LeaseError),

    /// Processor failure.
    #[error("process error: {0}")]
    Process(#[from] ProcessError),

    /// A consumer for the shard is already running.
    #[error("consumer already running for shard {shard}")]
    AlreadyRunning {
        /// The shard.
        shard: ShardId,
    },

    /// The consumer registry is full.
    #[error("consumer registry full: {max} shards")]
    RegistryFull {
        /// Registry capacity.
        max: u32,
    },
}

impl Classify for ConsumerError {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::Transport(e) => e.kind(),
            Self::Lease(e) => e.kind(),
            Self::Process(e) => e.kind(),
            Self::AlreadyRunning { .. } | Self::RegistryFull { .. } => ErrorKind::Contention,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_kinds() {
        let shard = ShardId::new("s-0");
        assert_eq!(
            TransportError::Throttled { shard: shard.clone() }.kind(),
            ErrorKind::Throttled
        );
        assert_eq!(
            TransportError::IteratorExpired { shard }.kind(),
            ErrorKind::IteratorExpired
        );
        assert_eq!(
            TransportError::InvalidIterator { handle: "x".into() }.kind(),
            ErrorKind::TransportFatal
        );
    }

    #[test]
    fn test_consumer_error_delegates_kind() {
        let err: ConsumerError = ProcessError::Timeout { after_ms: 10 }.into();
        assert_eq!(err.kind(), ErrorKind::ProcessingTimeout);
        assert!(err.kind().is_terminal());

        let err: ConsumerError = ProcessError::failed("bad row").into();
        assert_eq!(err.kind(), ErrorKind::ProcessingFailed);
        assert_eq!(err.to_string(), "process error: processing failed: bad row");
    }
}
