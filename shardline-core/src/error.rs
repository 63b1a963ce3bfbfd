//! Error kinds shared by every Shardline crate.
//!
//! Transport, store and processor errors are each defined in their own crate,
//! but all of them classify into the closed [`ErrorKind`] set. The shard
//! consumer branches on the kind, never on an error message.

use thiserror::Error;

/// The result type for core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Closed set of failure categories the consumer state machine reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// A lease could not be acquired or renewed because another instance
    /// holds it, or the store refused the conditional write.
    Contention,
    /// The transport asked the caller to slow down.
    Throttled,
    /// The iterator handle is no longer valid and must be reacquired.
    IteratorExpired,
    /// The message processor did not finish before its deadline.
    ProcessingTimeout,
    /// The message processor reported a failure.
    ProcessingFailed,
    /// Any other transport or store failure.
    TransportFatal,
}

impl ErrorKind {
    /// Returns true if this kind counts toward a consumer's
    /// consecutive-error ceiling.
    ///
    /// Throttling is backed off but never counted. Iterator expiry is only
    /// counted when the follow-up resync also fails, which the consumer
    /// reports as `TransportFatal`.
    #[must_use]
    pub const fn counts_toward_ceiling(self) -> bool {
        !matches!(self, Self::Throttled | Self::IteratorExpired)
    }

    /// Returns true if this kind ends the shard loop immediately.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::ProcessingTimeout)
    }

    /// Short static name for structured logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Contention => "contention",
            Self::Throttled => "throttled",
            Self::IteratorExpired => "iterator_expired",
            Self::ProcessingTimeout => "processing_timeout",
            Self::ProcessingFailed => "processing_failed",
            Self::TransportFatal => "transport_fatal",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Implemented by every boundary error so callers can branch on its kind.
pub trait Classify {
    /// Returns the category of this error.
    fn kind(&self) -> ErrorKind;
}

/// Errors raised by core validation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// An invalid argument was provided.
    #[error("invalid argument '{name}': {reason}")]
    InvalidArgument {
        /// The name of the argument.
        name: &'static str,
        /// Why it was invalid.
        reason: &'static str,
    },

    /// A resource limit was exceeded.
    #[error("limit exceeded: {limit} (max={max}, actual={actual})")]
    LimitExceeded {
        /// Which limit was exceeded.
        limit: &'static str,
        /// The maximum allowed value.
        max: u64,
        /// The actual value that exceeded the limit.
        actual: u64,
    },
}
