//! Strongly-typed identifiers for Shardline entities.
//!
//! Streams, shards and instances are all named by strings at the transport
//! and store boundary. Wrapping each in its own type keeps a `ShardId` from
//! being passed where an `InstanceId` is expected.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Macro to generate strongly-typed string identifiers.
///
/// Each ID wraps an `Arc<str>` so clones are cheap and IDs can be shared
/// freely between the rebalancer, consumers and their renewal tasks.
macro_rules! define_id {
    ($name:ident, $prefix:expr, $doc:expr) => {
        #[doc = $doc]
        #[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Arc<str>);

        impl $name {
            /// Creates a new ID from any string-like value.
            #[must_use]
            pub fn new(value: impl AsRef<str>) -> Self {
                Self(Arc::from(value.as_ref()))
            }

            /// Returns the raw string value.
            #[inline]
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", $prefix, self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self::new(value)
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(Arc::from(value))
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

define_id!(StreamId, "stream", "Identifier of a partitioned stream.");
define_id!(ShardId, "shard", "Identifier of a shard, scoped to its stream.");
define_id!(
    InstanceId,
    "instance",
    "Identifier of one cooperating consumer process."
);
define_id!(
    PositionToken,
    "pos",
    "Opaque position of a record within a shard, issued by the transport."
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_display() {
        let shard = ShardId::new("shard-0007");
        assert_eq!(format!("{shard}"), "shard-0007");
        assert_eq!(format!("{shard:?}"), "shard(shard-0007)");
    }

    #[test]
    fn test_id_ordering_is_lexical() {
        let a = InstanceId::new("a");
        let b = InstanceId::new("b");
        assert!(a < b);
        assert_eq!(a, InstanceId::from("a"));
    }

    #[test]
    fn test_id_from_string() {
        let token = PositionToken::from(String::from("00000000000000000042"));
        assert_eq!(token.as_str(), "00000000000000000042");

        let copy = token.clone();
        assert_eq!(copy, token);
    }

    #[test]
    fn test_id_serializes_as_plain_string() {
        let roster: Vec<InstanceId> = serde_json::from_str(r#"["node-b","node-a"]"#).unwrap();
        assert_eq!(roster, vec![InstanceId::new("node-b"), InstanceId::new("node-a")]);

        let json = serde_json::to_string(&ShardId::new("shard-0003")).unwrap();
        assert_eq!(json, r#""shard-0003""#);
    }
}
