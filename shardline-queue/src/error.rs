//! Queue error types.

use shardline_consumer::{ConsumerError, TransportError};
use shardline_core::{Classify, ErrorKind};
use shardline_lease::LeaseError;
use thiserror::Error;

/// Result type for queue operations.
pub type QueueResult<T> = Result<T, QueueError>;

/// Errors raised by the queue facade and its configuration.
#[derive(Debug, Error)]
pub enum QueueError {
    /// I/O error reading a configuration file.
    #[error("failed to read config from {path}: {source}")]
    Io {
        /// File path.
        path: String,
        /// Underlying error.
        source: std::io::Error,
    },

    /// The configuration could not be parsed.
    #[error("failed to parse config: {message}")]
    Parse {
        /// Error message.
        message: String,
    },

    /// The configuration is inconsistent.
    #[error("invalid config '{field}': {reason}")]
    InvalidConfig {
        /// Offending field.
        field: &'static str,
        /// Why it is invalid.
        reason: &'static str,
    },

    /// A message could not be serialized.
    #[error("failed to encode message {index}: {source}")]
    Encode {
        /// Index of the message in the produce call.
        index: usize,
        /// Underlying error.
        source: serde_json::Error,
    },

    /// `consume` was called while a consumer is already running.
    #[error("queue is already consuming")]
    AlreadyConsuming,

    /// The queue has been shut down.
    #[error("queue is shut down")]
    ShutDown,

    /// Transport failure.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Lease store failure.
    #[error("lease error: {0}")]
    Lease(#[from] LeaseError),

    /// Consumer failure.
    #[error("consumer error: {0}")]
    Consumer(#[from] ConsumerError),
}

impl QueueError {
    /// Returns the failure category for errors that come from the stream or
    /// the store, and `None` for local misuse and configuration errors.
    #[must_use]
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            Self::Transport(e) => Some(e.kind()),
            Self::Lease(e) => Some(e.kind()),
            Self::Consumer(e) => Some(e.kind()),
            Self::Io { .. }
            | Self::Parse { .. }
            | Self::InvalidConfig { .. }
            | Self::Encode { .. }
            | Self::AlreadyConsuming
            | Self::ShutDown => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use shardline_core::ShardId;

    use super::*;

    #[test]
    fn test_kind_passes_through() {
        let err: QueueError = TransportError::Throttled {
            shard: ShardId::new("s"),
        }
        .into();
        assert_eq!(err.kind(), Some(ErrorKind::Throttled));
        assert_eq!(QueueError::AlreadyConsuming.kind(), None);
    }
}
