//! Lease and checkpoint storage abstraction.
//!
//! Provides the `LeaseStore` trait for the external lock/checkpoint backend,
//! and `SimulatedLeaseStore` for deterministic simulation testing.

#![allow(clippy::significant_drop_tightening)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use shardline_core::{InstanceId, PositionToken};
use tokio::time::Instant;

use crate::error::{LeaseError, LeaseResult};
use crate::types::LeaseRecord;

// -----------------------------------------------------------------------------
// Lease Store Trait
// -----------------------------------------------------------------------------

/// Outcome of a conditional acquire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcquireOutcome {
    /// The caller now holds the lease (new, taken over after expiry, or
    /// extended because the caller already held it).
    Acquired(LeaseRecord),
    /// Another instance holds a live lease.
    Held(LeaseRecord),
}

/// Lock/checkpoint store trait.
///
/// Every lease mutation is conditional on the current owner, so no locking
/// outside the store is needed. Checkpoints are plain reads and writes and
/// are independent of lease state.
#[async_trait]
pub trait LeaseStore: Send + Sync {
    /// Acquires `key` for `owner` until `now + ttl`.
    ///
    /// Succeeds if no live lease exists or the live lease is already owned
    /// by `owner`. Contention is reported as `AcquireOutcome::Held`, not as
    /// an error.
    async fn acquire(
        &self,
        key: &str,
        owner: &InstanceId,
        ttl: Duration,
    ) -> LeaseResult<AcquireOutcome>;

    /// Extends `key` to `now + ttl` only if the stored record still names
    /// `owner`.
    ///
    /// Returns `None` if the record is absent or owned by someone else.
    async fn renew(
        &self,
        key: &str,
        owner: &InstanceId,
        ttl: Duration,
    ) -> LeaseResult<Option<LeaseRecord>>;

    /// Deletes `key` if it is owned by `owner`.
    ///
    /// No-op if the key is absent or owned by someone else.
    async fn release(&self, key: &str, owner: &InstanceId) -> LeaseResult<()>;

    /// Returns the live lease on `key`, if any.
    async fn get_lease(&self, key: &str) -> LeaseResult<Option<LeaseRecord>>;

    /// Returns every live lease whose key starts with `prefix`.
    async fn scan_leases(&self, prefix: &str) -> LeaseResult<Vec<LeaseRecord>>;

    /// Reads the checkpoint stored under `key`.
    async fn get_checkpoint(&self, key: &str) -> LeaseResult<Option<PositionToken>>;

    /// Writes the checkpoint stored under `key`.
    async fn put_checkpoint(&self, key: &str, token: &PositionToken) -> LeaseResult<()>;
}

// -----------------------------------------------------------------------------
// Fault Configuration
// -----------------------------------------------------------------------------

/// Fault configuration for the simulated lease store.
#[derive(Debug, Clone, Default)]
pub struct LeaseStoreFaultConfig {
    /// Probability of acquire operations failing (0.0 - 1.0).
    pub acquire_fail_rate: f64,
    /// Probability of renew operations failing (0.0 - 1.0).
    pub renew_fail_rate: f64,
    /// Probability of checkpoint reads or writes failing (0.0 - 1.0).
    pub checkpoint_fail_rate: f64,
    /// Force next renew to fail (one-shot).
    pub force_renew_fail: bool,
    /// Force next checkpoint write to fail (one-shot).
    pub force_checkpoint_fail: bool,
    /// Delay applied to every release, to model a wedged store.
    pub release_delay: Option<Duration>,
}

impl LeaseStoreFaultConfig {
    /// No faults (all operations succeed).
    #[must_use]
    pub const fn none() -> Self {
        Self {
            acquire_fail_rate: 0.0,
            renew_fail_rate: 0.0,
            checkpoint_fail_rate: 0.0,
            force_renew_fail: false,
            force_checkpoint_fail: false,
            release_delay: None,
        }
    }

    /// Flaky configuration for stress testing.
    #[must_use]
    pub const fn flaky() -> Self {
        Self {
            acquire_fail_rate: 0.05,
            renew_fail_rate: 0.05,
            checkpoint_fail_rate: 0.02,
            force_renew_fail: false,
            force_checkpoint_fail: false,
            release_delay: None,
        }
    }

    /// Builder: set acquire fail rate.
    #[must_use]
    pub const fn with_acquire_fail_rate(mut self, rate: f64) -> Self {
        self.acquire_fail_rate = rate;
        self
    }

    /// Builder: set renew fail rate.
    #[must_use]
    pub const fn with_renew_fail_rate(mut self, rate: f64) -> Self {
        self.renew_fail_rate = rate;
        self
    }

    /// Builder: set checkpoint fail rate.
    #[must_use]
    pub const fn with_checkpoint_fail_rate(mut self, rate: f64) -> Self {
        self.checkpoint_fail_rate = rate;
        self
    }

    /// Builder: delay every release.
    #[must_use]
    pub const fn with_release_delay(mut self, delay: Duration) -> Self {
        self.release_delay = Some(delay);
        self
    }
}

// -----------------------------------------------------------------------------
// Simulated Lease Store
// -----------------------------------------------------------------------------

/// In-memory simulated lease store for DST.
///
/// Clones share state via `Arc`, so several simulated instances can contend
/// on one store. Expiry follows tokio time, which makes paused-clock tests
/// deterministic.
#[derive(Debug, Clone)]
pub struct SimulatedLeaseStore {
    /// Leases by key.
    leases: Arc<Mutex<HashMap<String, LeaseRecord>>>,
    /// Checkpoints by key.
    checkpoints: Arc<Mutex<HashMap<String, PositionToken>>>,
    /// Every checkpoint write, in order, for assertions.
    checkpoint_log: Arc<Mutex<Vec<(String, PositionToken)>>>,
    /// Fault configuration.
    fault_config: Arc<Mutex<LeaseStoreFaultConfig>>,
    /// RNG seed for deterministic faults.
    seed: u64,
    /// Operation counter for deterministic RNG.
    counter: Arc<AtomicU64>,
}

impl SimulatedLeaseStore {
    /// Creates a new simulated store with no faults.
    #[must_use]
    pub fn new(seed: u64) -> Self {
        Self::with_faults(seed, LeaseStoreFaultConfig::none())
    }

    /// Creates a simulated store with fault injection.
    #[must_use]
    pub fn with_faults(seed: u64, config: LeaseStoreFaultConfig) -> Self {
        Self {
            leases: Arc::new(Mutex::new(HashMap::new())),
            checkpoints: Arc::new(Mutex::new(HashMap::new())),
            checkpoint_log: Arc::new(Mutex::new(Vec::new())),
            fault_config: Arc::new(Mutex::new(config)),
            seed,
            counter: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Returns fault config for modification.
    ///
    /// # Panics
    ///
    /// Panics if the mutex is poisoned.
    pub fn fault_config(&self) -> std::sync::MutexGuard<'_, LeaseStoreFaultConfig> {
        self.fault_config.lock().expect("fault config lock poisoned")
    }

    /// Deterministic fault decision using the `(seed + counter) * M` hash.
    fn should_inject_fault(&self, rate: f64) -> bool {
        if rate <= 0.0 {
            return false;
        }
        if rate >= 1.0 {
            return true;
        }
        let counter = self.counter.fetch_add(1, Ordering::Relaxed);
        let hash = self
            .seed
            .wrapping_add(counter)
            .wrapping_mul(0x9e37_79b9_7f4a_7c15);
        #[allow(clippy::cast_precision_loss)]
        let normalized = (hash as f64) / (u64::MAX as f64);
        normalized < rate
    }

    fn fail(operation: &'static str, why: &str) -> LeaseError {
        LeaseError::Io {
            operation,
            message: format!("simulated failure ({why})"),
        }
    }

    /// Returns the owner of `key` regardless of expiry (bypasses faults).
    ///
    /// # Panics
    ///
    /// Panics if the mutex is poisoned.
    #[must_use]
    pub fn owner_of(&self, key: &str) -> Option<InstanceId> {
        let leases = self.leases.lock().expect("leases lock poisoned");
        leases.get(key).map(|r| r.owner.clone())
    }

    /// Returns the raw record for `key`, expired or not (bypasses faults).
    ///
    /// # Panics
    ///
    /// Panics if the mutex is poisoned.
    #[must_use]
    pub fn raw_lease(&self, key: &str) -> Option<LeaseRecord> {
        let leases = self.leases.lock().expect("leases lock poisoned");
        leases.get(key).cloned()
    }

    /// Returns the checkpoint for `key` (bypasses faults).
    ///
    /// # Panics
    ///
    /// Panics if the mutex is poisoned.
    #[must_use]
    pub fn checkpoint(&self, key: &str) -> Option<PositionToken> {
        let checkpoints = self.checkpoints.lock().expect("checkpoints lock poisoned");
        checkpoints.get(key).cloned()
    }

    /// Returns every checkpoint write for `key`, oldest first.
    ///
    /// # Panics
    ///
    /// Panics if the mutex is poisoned.
    #[must_use]
    pub fn checkpoint_writes(&self, key: &str) -> Vec<PositionToken> {
        let log = self.checkpoint_log.lock().expect("checkpoint log lock poisoned");
        log.iter()
            .filter(|(k, _)| k == key)
            .map(|(_, t)| t.clone())
            .collect()
    }

    /// Seeds a checkpoint without recording it as a write.
    ///
    /// # Panics
    ///
    /// Panics if the mutex is poisoned.
    pub fn seed_checkpoint(&self, key: &str, token: PositionToken) {
        let mut checkpoints = self.checkpoints.lock().expect("checkpoints lock poisoned");
        checkpoints.insert(key.to_string(), token);
    }

    /// Overwrites the lease on `key` with a live lease for `owner`,
    /// simulating another instance taking over.
    ///
    /// # Panics
    ///
    /// Panics if the mutex is poisoned.
    pub fn force_owner(&self, key: &str, owner: InstanceId, ttl: Duration) {
        let mut leases = self.leases.lock().expect("leases lock poisoned");
        leases.insert(
            key.to_string(),
            LeaseRecord::new(key, owner, Instant::now(), ttl),
        );
    }

    /// Removes every lease (bypasses faults), simulating store data loss.
    ///
    /// # Panics
    ///
    /// Panics if the mutex is poisoned.
    pub fn clear_leases(&self) {
        let mut leases = self.leases.lock().expect("leases lock poisoned");
        leases.clear();
    }
}

#[async_trait]
impl LeaseStore for SimulatedLeaseStore {
    async fn acquire(
        &self,
        key: &str,
        owner: &InstanceId,
        ttl: Duration,
    ) -> LeaseResult<AcquireOutcome> {
        if ttl.is_zero() {
            return Err(LeaseError::InvalidTtl { ttl_ms: 0 });
        }

        let acquire_fail_rate = self.fault_config.lock().expect("lock").acquire_fail_rate;
        if self.should_inject_fault(acquire_fail_rate) {
            return Err(Self::fail("acquire", "random"));
        }

        let now = Instant::now();
        let mut leases = self.leases.lock().expect("leases lock poisoned");
        match leases.get_mut(key) {
            Some(existing) if !existing.is_expired_at(now) && existing.owner != *owner => {
                Ok(AcquireOutcome::Held(existing.clone()))
            }
            Some(existing) if existing.owner == *owner && !existing.is_expired_at(now) => {
                existing.expires_at = now + ttl;
                existing.renewals += 1;
                Ok(AcquireOutcome::Acquired(existing.clone()))
            }
            _ => {
                let record = LeaseRecord::new(key, owner.clone(), now, ttl);
                leases.insert(key.to_string(), record.clone());
                Ok(AcquireOutcome::Acquired(record))
            }
        }
    }

    async fn renew(
        &self,
        key: &str,
        owner: &InstanceId,
        ttl: Duration,
    ) -> LeaseResult<Option<LeaseRecord>> {
        {
            let mut config = self.fault_config.lock().expect("lock poisoned");
            if config.force_renew_fail {
                config.force_renew_fail = false;
                return Err(Self::fail("renew", "forced"));
            }
        }

        let renew_fail_rate = self.fault_config.lock().expect("lock").renew_fail_rate;
        if self.should_inject_fault(renew_fail_rate) {
            return Err(Self::fail("renew", "random"));
        }

        let now = Instant::now();
        let mut leases = self.leases.lock().expect("leases lock poisoned");
        match leases.get_mut(key) {
            Some(existing) if existing.owner == *owner => {
                existing.expires_at = now + ttl;
                existing.renewals += 1;
                Ok(Some(existing.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn release(&self, key: &str, owner: &InstanceId) -> LeaseResult<()> {
        let delay = self.fault_config.lock().expect("lock").release_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut leases = self.leases.lock().expect("leases lock poisoned");
        if leases.get(key).is_some_and(|r| r.owner == *owner) {
            leases.remove(key);
        }
        Ok(())
    }

    async fn get_lease(&self, key: &str) -> LeaseResult<Option<LeaseRecord>> {
        let now = Instant::now();
        let leases = self.leases.lock().expect("leases lock poisoned");
        Ok(leases.get(key).filter(|r| !r.is_expired_at(now)).cloned())
    }

    async fn scan_leases(&self, prefix: &str) -> LeaseResult<Vec<LeaseRecord>> {
        let now = Instant::now();
        let leases = self.leases.lock().expect("leases lock poisoned");
        let mut live: Vec<LeaseRecord> = leases
            .values()
            .filter(|r| r.key.starts_with(prefix) && !r.is_expired_at(now))
            .cloned()
            .collect();
        live.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(live)
    }

    async fn get_checkpoint(&self, key: &str) -> LeaseResult<Option<PositionToken>> {
        let checkpoint_fail_rate = self.fault_config.lock().expect("lock").checkpoint_fail_rate;
        if self.should_inject_fault(checkpoint_fail_rate) {
            return Err(Self::fail("get_checkpoint", "random"));
        }

        let checkpoints = self.checkpoints.lock().expect("checkpoints lock poisoned");
        Ok(checkpoints.get(key).cloned())
    }

    async fn put_checkpoint(&self, key: &str, token: &PositionToken) -> LeaseResult<()> {
        {
            let mut config = self.fault_config.lock().expect("lock poisoned");
            if config.force_checkpoint_fail {
                config.force_checkpoint_fail = false;
                return Err(Self::fail("put_checkpoint", "forced"));
            }
        }

        let checkpoint_fail_rate = self.fault_config.lock().expect("lock").checkpoint_fail_rate;
        if self.should_inject_fault(checkpoint_fail_rate) {
            return Err(Self::fail("put_checkpoint", "random"));
        }

        let mut checkpoints = self.checkpoints.lock().expect("checkpoints lock poisoned");
        checkpoints.insert(key.to_string(), token.clone());
        self.checkpoint_log
            .lock()
            .expect("checkpoint log lock poisoned")
            .push((key.to_string(), token.clone()));
        Ok(())
    }
}

// -----------------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------------
