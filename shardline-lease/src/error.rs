//! Lease store error types.

use shardline_core::{Classify, ErrorKind, InstanceId};
use thiserror::Error;

/// Result type for lease and checkpoint operations.
pub type LeaseResult<T> = Result<T, LeaseError>;

/// Errors that can occur during lease and checkpoint operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LeaseError {
    /// A live lease on the key is held by another instance.
    #[error("lease {key} held by {owner}")]
    Held {
        /// The contended key.
        key: String,
        /// The current holder.
        owner: InstanceId,
    },

    /// The requester does not own the lease it tried to modify.
    #[error("lease {key} not owned by {requester}")]
    NotOwner {
        /// The key that was targeted.
        key: String,
        /// The instance that attempted the operation.
        requester: InstanceId,
    },

    /// The requested TTL is unusable.
    #[error("invalid lease ttl: {ttl_ms}ms")]
    InvalidTtl {
        /// The rejected TTL in milliseconds.
        ttl_ms: u64,
    },

    /// The store did not answer in time.
    #[error("store operation {operation} timed out after {waited_ms}ms")]
    Timeout {
        /// The operation that timed out.
        operation: &'static str,
        /// How long we waited.
        waited_ms: u64,
    },

    /// I/O error during a store operation.
    #[error("I/O error: {operation}: {message}")]
    Io {
        /// The operation that failed.
        operation: &'static str,
        /// Error message.
        message: String,
    },
}

impl Classify for LeaseError {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::Held { .. } | Self::NotOwner { .. } => ErrorKind::Contention,
            Self::InvalidTtl { .. } | Self::Timeout { .. } | Self::Io { .. } => {
                ErrorKind::TransportFatal
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = LeaseError::Held {
            key: "orders/lease/shard-1".into(),
            owner: InstanceId::new("node-b"),
        };
        assert!(err.to_string().contains("orders/lease/shard-1"));
        assert!(err.to_string().contains("node-b"));
    }

    #[test]
    fn test_error_kinds() {
        let held = LeaseError::NotOwner {
            key: "k".into(),
            requester: InstanceId::new("a"),
        };
        assert_eq!(held.kind(), ErrorKind::Contention);

        let io = LeaseError::Io {
            operation: "acquire",
            message: "connection reset".into(),
        };
        assert_eq!(io.kind(), ErrorKind::TransportFatal);
    }
}
