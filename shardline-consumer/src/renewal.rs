//! Per-shard lease renewal task.
//!
//! Renewal runs on its own timer, independent of how long a batch takes to
//! process. It coordinates with the fetch loop only through [`RenewalFlags`]
//! and the loop's cancellation token.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use shardline_core::ShardId;
use shardline_lease::ShardLeaser;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::ConsumerConfig;

/// Flags shared between a shard loop and its renewal task.
#[derive(Debug, Default)]
pub(crate) struct RenewalFlags {
    /// Set once the consumer starts draining.
    pub shutting_down: AtomicBool,
    /// Set once renewal has given up on the lease.
    pub lock_lost: AtomicBool,
    /// Set while a renewal round is running.
    pub renewal_in_progress: AtomicBool,
}

impl RenewalFlags {
    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    pub fn is_lock_lost(&self) -> bool {
        self.lock_lost.load(Ordering::Acquire)
    }
}

/// Handle on a running renewal task.
#[derive(Debug)]
pub(crate) struct RenewalTask {
    cancel: CancellationToken,
    join: JoinHandle<()>,
}

impl RenewalTask {
    /// Starts renewing `shard_id` every `config.renew_interval()`.
    ///
    /// On lease loss the task sets `lock_lost`, cancels `loop_cancel` and
    /// exits.
    pub fn spawn(
        leaser: Arc<ShardLeaser>,
        shard_id: ShardId,
        config: &ConsumerConfig,
        flags: Arc<RenewalFlags>,
        loop_cancel: CancellationToken,
    ) -> Self {
        let cancel = CancellationToken::new();
        let join = tokio::spawn(renewal_loop(
            leaser,
            shard_id,
            config.renew_interval(),
            config.renew_attempts.max(1),
            config.renew_retry_delay(),
            flags,
            loop_cancel,
            cancel.clone(),
        ));
        Self { cancel, join }
    }

    /// Stops the task, waiting up to `wait` for an in-flight renewal.
    pub async fn stop(self, wait: Duration) {
        self.cancel.cancel();
        let abort = self.join.abort_handle();
        match tokio::time::timeout(wait, self.join).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "Renewal task ended abnormally"),
            Err(_) => {
                warn!(wait_ms = wait.as_millis(), "Renewal task did not drain, aborting");
                abort.abort();
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn renewal_loop(
    leaser: Arc<ShardLeaser>,
    shard_id: ShardId,
    interval: Duration,
    attempts: u32,
    retry_delay: Duration,
    flags: Arc<RenewalFlags>,
    loop_cancel: CancellationToken,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            () = cancel.cancelled() => {
                debug!(shard = %shard_id, "Renewal task stopping");
                break;
            }
            _ = ticker.tick() => {
                if flags.is_shutting_down() || flags.is_lock_lost() {
                    break;
                }
                if flags.renewal_in_progress.swap(true, Ordering::AcqRel) {
                    continue;
                }

                let renewed = renew_with_retries(&leaser, &shard_id, attempts, retry_delay, &cancel).await;
                flags.renewal_in_progress.store(false, Ordering::Release);

                if !renewed && !flags.is_shutting_down() && !cancel.is_cancelled() {
                    warn!(
                        stream = %leaser.stream_id(),
                        shard = %shard_id,
                        attempts,
                        "Lease renewal failed, lock lost"
                    );
                    flags.lock_lost.store(true, Ordering::Release);
                    loop_cancel.cancel();
                    break;
                }
            }
        }
    }
}

async fn renew_with_retries(
    leaser: &ShardLeaser,
    shard_id: &ShardId,
    attempts: u32,
    retry_delay: Duration,
    cancel: &CancellationToken,
) -> bool {
    for attempt in 1..=attempts {
        if leaser.renew_lock(shard_id).await {
            debug!(shard = %shard_id, attempt, "Lease renewed");
            return true;
        }
        if attempt < attempts {
            tokio::select! {
                () = cancel.cancelled() => return false,
                () = tokio::time::sleep(retry_delay) => {}
            }
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use shardline_core::{InstanceId, StreamId};
    use shardline_lease::{shard_lease_key, LeaseConfig, LeaseStore, SimulatedLeaseStore};

    use super::*;

    fn leaser(store: &SimulatedLeaseStore) -> Arc<ShardLeaser> {
        Arc::new(ShardLeaser::new(
            StreamId::new("s"),
            InstanceId::new("a"),
            LeaseConfig::for_testing(),
            Arc::new(store.clone()),
        ))
    }

    #[tokio::test(start_paused = true)]
    async fn test_renewal_keeps_lease_alive() {
        let store = SimulatedLeaseStore::new(1);
        let leaser = leaser(&store);
        let shard = ShardId::new("shard-0");
        assert!(leaser.acquire_or_renew_lock(&shard).await);

        let flags = Arc::new(RenewalFlags::default());
        let loop_cancel = CancellationToken::new();
        let task = RenewalTask::spawn(
            Arc::clone(&leaser),
            shard.clone(),
            &ConsumerConfig::for_testing(),
            Arc::clone(&flags),
            loop_cancel.clone(),
        );

        // Well past the 3s TTL.
        tokio::time::sleep(Duration::from_secs(10)).await;
        let key = shard_lease_key(&StreamId::new("s"), &shard);
        assert!(store.get_lease(&key).await.unwrap().is_some());
        assert!(!flags.is_lock_lost());
        assert!(!loop_cancel.is_cancelled());

        task.stop(Duration::from_secs(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_takeover_marks_lock_lost() {
        let store = SimulatedLeaseStore::new(1);
        let leaser = leaser(&store);
        let shard = ShardId::new("shard-0");
        assert!(leaser.acquire_or_renew_lock(&shard).await);

        let flags = Arc::new(RenewalFlags::default());
        let loop_cancel = CancellationToken::new();
        let task = RenewalTask::spawn(
            Arc::clone(&leaser),
            shard.clone(),
            &ConsumerConfig::for_testing(),
            Arc::clone(&flags),
            loop_cancel.clone(),
        );

        let key = shard_lease_key(&StreamId::new("s"), &shard);
        store.force_owner(&key, InstanceId::new("b"), Duration::from_secs(60));

        tokio::time::timeout(Duration::from_secs(5), loop_cancel.cancelled())
            .await
            .unwrap();
        assert!(flags.is_lock_lost());
        // The new owner's lease is untouched.
        assert_eq!(store.owner_of(&key), Some(InstanceId::new("b")));

        task.stop(Duration::from_secs(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_failure_is_retried() {
        let store = SimulatedLeaseStore::new(1);
        let leaser = leaser(&store);
        let shard = ShardId::new("shard-0");
        assert!(leaser.acquire_or_renew_lock(&shard).await);
        store.fault_config().force_renew_fail = true;

        let flags = Arc::new(RenewalFlags::default());
        let loop_cancel = CancellationToken::new();
        let task = RenewalTask::spawn(
            Arc::clone(&leaser),
            shard,
            &ConsumerConfig::for_testing(),
            Arc::clone(&flags),
            loop_cancel.clone(),
        );

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(!flags.is_lock_lost());
        task.stop(Duration::from_secs(1)).await;
    }
}
