//! Per-shard lease and checkpoint handle for one (stream, instance) pair.
//!
//! The `ShardLeaser` turns the key-value `LeaseStore` contract into shard
//! vocabulary: acquire, renew and release a shard, and read or write its
//! checkpoint. It also owns the instance heartbeat that store-backed
//! membership reads.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use shardline_core::{InstanceId, PositionToken, ShardId, StreamId};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::LeaseResult;
use crate::storage::{AcquireOutcome, LeaseStore};
use crate::types::{checkpoint_key, heartbeat_key, shard_lease_key, Lease, LeaseConfig};

/// Background heartbeat task and its cancellation handle.
struct Heartbeat {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Lease and checkpoint operations for one instance on one stream.
///
/// # Thread Safety
///
/// The leaser is `Send + Sync` and is shared by the rebalancer and every
/// shard consumer of the instance through an `Arc`.
pub struct ShardLeaser {
    stream_id: StreamId,
    instance_id: InstanceId,
    config: LeaseConfig,
    store: Arc<dyn LeaseStore>,
    heartbeat: Mutex<Option<Heartbeat>>,
}

impl ShardLeaser {
    /// Creates a new leaser.
    #[must_use]
    pub fn new(
        stream_id: StreamId,
        instance_id: InstanceId,
        config: LeaseConfig,
        store: Arc<dyn LeaseStore>,
    ) -> Self {
        Self {
            stream_id,
            instance_id,
            config,
            store,
            heartbeat: Mutex::new(None),
        }
    }

    /// Returns the stream this leaser works on.
    #[must_use]
    pub const fn stream_id(&self) -> &StreamId {
        &self.stream_id
    }

    /// Returns the instance this leaser acts for.
    #[must_use]
    pub const fn instance_id(&self) -> &InstanceId {
        &self.instance_id
    }

    /// Returns the lease TTL.
    #[must_use]
    pub const fn ttl(&self) -> Duration {
        self.config.ttl
    }

    /// Returns the underlying store.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn LeaseStore> {
        &self.store
    }

    // -------------------------------------------------------------------------
    // Shard Leases
    // -------------------------------------------------------------------------

    /// Acquires the shard lease, or extends it if this instance already
    /// holds it.
    ///
    /// Returns false on contention and on store errors.
    pub async fn acquire_or_renew_lock(&self, shard_id: &ShardId) -> bool {
        let key = shard_lease_key(&self.stream_id, shard_id);
        match self.store.acquire(&key, &self.instance_id, self.config.ttl).await {
            Ok(AcquireOutcome::Acquired(_)) => {
                debug!(stream = %self.stream_id, shard = %shard_id, "Acquired shard lease");
                true
            }
            Ok(AcquireOutcome::Held(record)) => {
                debug!(
                    stream = %self.stream_id,
                    shard = %shard_id,
                    owner = %record.owner,
                    "Shard lease held elsewhere"
                );
                false
            }
            Err(e) => {
                warn!(stream = %self.stream_id, shard = %shard_id, error = %e, "Lease acquire failed");
                false
            }
        }
    }

    /// Extends the shard lease only if this instance still owns it.
    ///
    /// Never extends a lease another instance has taken over.
    pub async fn renew_lock(&self, shard_id: &ShardId) -> bool {
        let key = shard_lease_key(&self.stream_id, shard_id);
        match self.store.renew(&key, &self.instance_id, self.config.ttl).await {
            Ok(Some(_)) => true,
            Ok(None) => {
                debug!(stream = %self.stream_id, shard = %shard_id, "Renewal refused, not owner");
                false
            }
            Err(e) => {
                warn!(stream = %self.stream_id, shard = %shard_id, error = %e, "Lease renew failed");
                false
            }
        }
    }

    /// Releases the shard lease. Absent or foreign leases are left alone.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub async fn release_lock(&self, shard_id: &ShardId) -> LeaseResult<()> {
        let key = shard_lease_key(&self.stream_id, shard_id);
        self.store.release(&key, &self.instance_id).await?;
        debug!(stream = %self.stream_id, shard = %shard_id, "Released shard lease");
        Ok(())
    }

    /// Returns the live lease on a shard, whoever holds it.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub async fn current_lease(&self, shard_id: &ShardId) -> LeaseResult<Option<Lease>> {
        let key = shard_lease_key(&self.stream_id, shard_id);
        let record = self.store.get_lease(&key).await?;
        Ok(record.map(|r| Lease {
            stream_id: self.stream_id.clone(),
            shard_id: shard_id.clone(),
            owner: r.owner,
            expires_at: r.expires_at,
        }))
    }

    // -------------------------------------------------------------------------
    // Checkpoints
    // -------------------------------------------------------------------------

    /// Reads the shard checkpoint.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub async fn get_checkpoint(&self, shard_id: &ShardId) -> LeaseResult<Option<PositionToken>> {
        let key = checkpoint_key(&self.stream_id, shard_id);
        self.store.get_checkpoint(&key).await
    }

    /// Writes the shard checkpoint. Does not require holding the lease.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub async fn set_checkpoint(&self, shard_id: &ShardId, token: &PositionToken) -> LeaseResult<()> {
        let key = checkpoint_key(&self.stream_id, shard_id);
        self.store.put_checkpoint(&key, token).await
    }

    // -------------------------------------------------------------------------
    // Heartbeat
    // -------------------------------------------------------------------------

    /// Starts the instance heartbeat if it is not already running.
    ///
    /// Writes the heartbeat once before returning so the instance is visible
    /// to store-backed membership immediately.
    ///
    /// # Panics
    ///
    /// Panics if the heartbeat mutex is poisoned.
    pub async fn start_heartbeat(self: &Arc<Self>) {
        if self.heartbeat.lock().expect("heartbeat lock poisoned").is_some() {
            return;
        }

        self.beat().await;

        let cancel = CancellationToken::new();
        let leaser = Arc::clone(self);
        let task_cancel = cancel.clone();
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(leaser.config.heartbeat_interval);
            interval.tick().await;
            loop {
                tokio::select! {
                    () = task_cancel.cancelled() => break,
                    _ = interval.tick() => leaser.beat().await,
                }
            }
        });

        let mut slot = self.heartbeat.lock().expect("heartbeat lock poisoned");
        if slot.is_some() {
            // Lost a race with a concurrent start.
            cancel.cancel();
            return;
        }
        *slot = Some(Heartbeat { cancel, handle });
        info!(stream = %self.stream_id, instance = %self.instance_id, "Heartbeat started");
    }

    async fn beat(&self) {
        let key = heartbeat_key(&self.stream_id, &self.instance_id);
        if let Err(e) = self
            .store
            .acquire(&key, &self.instance_id, self.config.heartbeat_ttl)
            .await
        {
            warn!(instance = %self.instance_id, error = %e, "Heartbeat write failed");
        }
    }

    /// Returns true if the heartbeat task is running.
    ///
    /// # Panics
    ///
    /// Panics if the heartbeat mutex is poisoned.
    #[must_use]
    pub fn heartbeat_running(&self) -> bool {
        self.heartbeat.lock().expect("heartbeat lock poisoned").is_some()
    }

    /// Stops background timers and withdraws the heartbeat. Idempotent.
    ///
    /// # Panics
    ///
    /// Panics if the heartbeat mutex is poisoned.
    pub async fn cleanup(&self) {
        let heartbeat = self.heartbeat.lock().expect("heartbeat lock poisoned").take();
        let Some(heartbeat) = heartbeat else {
            return;
        };

        heartbeat.cancel.cancel();
        if let Err(e) = heartbeat.handle.await {
            warn!(instance = %self.instance_id, error = %e, "Heartbeat task panicked");
        }

        let key = heartbeat_key(&self.stream_id, &self.instance_id);
        if let Err(e) = self.store.release(&key, &self.instance_id).await {
            warn!(instance = %self.instance_id, error = %e, "Heartbeat release failed");
        }
        info!(stream = %self.stream_id, instance = %self.instance_id, "Leaser cleaned up");
    }
}

impl std::fmt::Debug for ShardLeaser {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardLeaser")
            .field("stream_id", &self.stream_id)
            .field("instance_id", &self.instance_id)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
