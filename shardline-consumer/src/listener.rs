//! Lifecycle callbacks.
//!
//! Callbacks are fire-and-forget. They run on the consumer task, so they
//! must not block; a panicking callback is logged and otherwise ignored.

use std::panic::{catch_unwind, AssertUnwindSafe};

use shardline_core::{PositionToken, ShardId};
use tracing::warn;

use crate::state::ExitReason;

/// Observer of shard consumer lifecycle events. Every method defaults to a
/// no-op.
pub trait ConsumerListener: Send + Sync {
    /// The consumer has an iterator and is about to fetch.
    fn on_shard_connected(&self, _shard_id: &ShardId) {}

    /// The consumer stopped.
    fn on_shard_disconnected(&self, _shard_id: &ShardId, _reason: ExitReason) {}

    /// A checkpoint was written after `count` messages were processed.
    fn on_checkpoint(&self, _shard_id: &ShardId, _position: &PositionToken, _count: usize) {}

    /// The batch led by `position` was skipped as a poison pill after being
    /// fetched `repeats` times without progress.
    fn on_poison_pill(&self, _shard_id: &ShardId, _position: &PositionToken, _repeats: u32) {}
}

/// Listener that ignores every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopListener;

impl ConsumerListener for NoopListener {}

/// Invokes a callback, containing any panic.
pub(crate) fn notify(shard_id: &ShardId, event: &'static str, f: impl FnOnce()) {
    if catch_unwind(AssertUnwindSafe(f)).is_err() {
        warn!(shard = %shard_id, event, "Listener callback panicked");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    struct Panicky;

    impl ConsumerListener for Panicky {
        fn on_shard_connected(&self, _shard_id: &ShardId) {
            panic!("listener bug");
        }
    }

    #[test]
    fn test_panicking_callback_is_contained() {
        let shard = ShardId::new("s");
        let listener = Panicky;
        notify(&shard, "connected", || listener.on_shard_connected(&shard));

        let calls = AtomicUsize::new(0);
        notify(&shard, "checkpoint", || {
            calls.fetch_add(1, Ordering::Relaxed);
        });
        assert_eq!(calls.load(Ordering::Relaxed), 1);
    }
}
