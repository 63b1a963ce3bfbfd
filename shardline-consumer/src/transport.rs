//! Stream transport boundary.
//!
//! The transport is the partitioned stream itself: it lists shards, hands
//! out iterators, returns batches of records, and accepts writes. Shardline
//! only ever talks to it through [`StreamTransport`].
//!
//! [`MemoryTransport`] is a complete in-memory stream used by tests and the
//! demo binary. It mirrors the behavior consumers must cope with in
//! production: iterators expire, shards close, and fetches get throttled.

#![allow(clippy::significant_drop_tightening)]

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use shardline_core::{Limits, PositionToken, PutEntry, PutOutcome, ShardId, StreamId, StreamRecord};
use tokio::time::Instant;
use xxhash_rust::xxh3::xxh3_64;

use crate::error::{TransportError, TransportResult};

/// Default lifetime of an iterator handle.
pub const ITERATOR_TTL_DEFAULT: Duration = Duration::from_secs(300);

/// Iterator handles kept before expired ones are pruned.
const ITERATORS_PRUNE_THRESHOLD: usize = 4_096;

// -----------------------------------------------------------------------------
// Boundary Types
// -----------------------------------------------------------------------------

/// Where a new iterator starts reading.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IteratorPosition {
    /// The oldest record still retained in the shard.
    TrimHorizon,
    /// The record immediately after the given position.
    AfterPosition(PositionToken),
    /// Only records written after the iterator is created.
    Latest,
}

/// Opaque handle for reading a shard from some position.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct IteratorHandle(Arc<str>);

impl IteratorHandle {
    /// Wraps a transport-issued handle.
    #[must_use]
    pub fn new(value: impl AsRef<str>) -> Self {
        Self(Arc::from(value.as_ref()))
    }

    /// Returns the raw handle.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for IteratorHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "IteratorHandle({})", self.0)
    }
}

impl std::fmt::Display for IteratorHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// One fetch result.
#[derive(Debug, Clone, Default)]
pub struct FetchBatch {
    /// Records in shard order.
    pub records: Vec<StreamRecord>,
    /// Handle for the next fetch. `None` means the shard is closed and fully
    /// read.
    pub next_iterator: Option<IteratorHandle>,
}

impl FetchBatch {
    /// Position of the first record, if any.
    #[must_use]
    pub fn leading_position(&self) -> Option<&PositionToken> {
        self.records.first().map(|r| &r.position)
    }

    /// Position of the last record, if any.
    #[must_use]
    pub fn last_position(&self) -> Option<&PositionToken> {
        self.records.last().map(|r| &r.position)
    }
}

/// Partitioned stream transport.
///
/// A fetch must be repeatable: fetching twice with the same handle returns
/// the same records for as long as the handle is valid. The shard consumer
/// relies on this to retry a failed batch.
#[async_trait]
pub trait StreamTransport: Send + Sync {
    /// Lists the shards of a stream.
    async fn list_shards(&self, stream_id: &StreamId) -> TransportResult<Vec<ShardId>>;

    /// Creates an iterator on a shard.
    async fn get_iterator(
        &self,
        stream_id: &StreamId,
        shard_id: &ShardId,
        position: IteratorPosition,
    ) -> TransportResult<IteratorHandle>;

    /// Fetches up to `max_records` records from an iterator.
    async fn fetch(&self, iterator: &IteratorHandle, max_records: u32) -> TransportResult<FetchBatch>;

    /// Writes records, routing each by its partition key.
    async fn put(&self, stream_id: &StreamId, entries: Vec<PutEntry>) -> TransportResult<PutOutcome>;
}

// -----------------------------------------------------------------------------
// Fault Configuration
// -----------------------------------------------------------------------------

/// Fault configuration for the in-memory transport.
#[derive(Debug, Clone, Default)]
pub struct MemoryTransportFaultConfig {
    /// Probability of a fetch being throttled (0.0 - 1.0).
    pub throttle_rate: f64,
    /// Probability of a fetch failing outright (0.0 - 1.0).
    pub fetch_error_rate: f64,
    /// Probability of a single put entry failing (0.0 - 1.0).
    pub put_fail_rate: f64,
    /// Force the next fetch to be throttled (one-shot).
    pub force_throttle: bool,
    /// Force the next fetch to fail (one-shot).
    pub force_fetch_error: bool,
    /// Force the next fetch to report an expired iterator (one-shot).
    pub force_iterator_expired: bool,
    /// Force the next iterator request to fail (one-shot).
    pub force_get_iterator_error: bool,
}

impl MemoryTransportFaultConfig {
    /// No faults.
    #[must_use]
    pub const fn none() -> Self {
        Self {
            throttle_rate: 0.0,
            fetch_error_rate: 0.0,
            put_fail_rate: 0.0,
            force_throttle: false,
            force_fetch_error: false,
            force_iterator_expired: false,
            force_get_iterator_error: false,
        }
    }

    /// Flaky configuration for stress testing.
    #[must_use]
    pub const fn flaky() -> Self {
        Self {
            throttle_rate: 0.05,
            fetch_error_rate: 0.02,
            put_fail_rate: 0.01,
            ..Self::none()
        }
    }

    /// Builder: set throttle rate.
    #[must_use]
    pub const fn with_throttle_rate(mut self, rate: f64) -> Self {
        self.throttle_rate = rate;
        self
    }

    /// Builder: set fetch error rate.
    #[must_use]
    pub const fn with_fetch_error_rate(mut self, rate: f64) -> Self {
        self.fetch_error_rate = rate;
        self
    }

    /// Builder: set put failure rate.
    #[must_use]
    pub const fn with_put_fail_rate(mut self, rate: f64) -> Self {
        self.put_fail_rate = rate;
        self
    }
}

// -----------------------------------------------------------------------------
// Memory Transport
// -----------------------------------------------------------------------------

#[derive(Debug, Default)]
struct ShardLog {
    records: Vec<StreamRecord>,
    closed: bool,
}

#[derive(Debug)]
struct IteratorState {
    stream_id: StreamId,
    shard_id: ShardId,
    next_index: usize,
    issued_at: Instant,
}

#[derive(Debug, Default)]
struct TransportState {
    streams: HashMap<StreamId, BTreeMap<ShardId, ShardLog>>,
    iterators: HashMap<Arc<str>, IteratorState>,
    next_handle: u64,
}

impl TransportState {
    fn shard_mut(&mut self, stream_id: &StreamId, shard_id: &ShardId) -> TransportResult<&mut ShardLog> {
        self.streams
            .get_mut(stream_id)
            .ok_or_else(|| TransportError::StreamNotFound {
                stream: stream_id.clone(),
            })?
            .get_mut(shard_id)
            .ok_or_else(|| TransportError::ShardNotFound {
                stream: stream_id.clone(),
                shard: shard_id.clone(),
            })
    }

    fn issue(
        &mut self,
        stream_id: &StreamId,
        shard_id: &ShardId,
        next_index: usize,
        now: Instant,
        ttl: Duration,
    ) -> IteratorHandle {
        if self.iterators.len() >= ITERATORS_PRUNE_THRESHOLD {
            self.iterators
                .retain(|_, it| now.duration_since(it.issued_at) < ttl);
        }
        self.next_handle += 1;
        let raw: Arc<str> = Arc::from(format!("{stream_id}/{shard_id}/{}", self.next_handle));
        self.iterators.insert(
            Arc::clone(&raw),
            IteratorState {
                stream_id: stream_id.clone(),
                shard_id: shard_id.clone(),
                next_index,
                issued_at: now,
            },
        );
        IteratorHandle(raw)
    }
}

/// In-memory partitioned stream.
///
/// Positions are zero-padded record indexes, so they sort in shard order.
/// Clones share state. Faults are decided with the same deterministic
/// seed-and-counter hash as the simulated lease store.
#[derive(Debug, Clone)]
pub struct MemoryTransport {
    state: Arc<Mutex<TransportState>>,
    fault_config: Arc<Mutex<MemoryTransportFaultConfig>>,
    limits: Limits,
    iterator_ttl: Duration,
    seed: u64,
    counter: Arc<AtomicU64>,
    fetches: Arc<AtomicU64>,
}

impl MemoryTransport {
    /// Creates an empty transport with no faults.
    #[must_use]
    pub fn new(seed: u64) -> Self {
        Self::with_faults(seed, MemoryTransportFaultConfig::none())
    }

    /// Creates an empty transport with fault injection.
    #[must_use]
    pub fn with_faults(seed: u64, config: MemoryTransportFaultConfig) -> Self {
        Self {
            state: Arc::new(Mutex::new(TransportState::default())),
            fault_config: Arc::new(Mutex::new(config)),
            limits: Limits::new(),
            iterator_ttl: ITERATOR_TTL_DEFAULT,
            seed,
            counter: Arc::new(AtomicU64::new(0)),
            fetches: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Builder: set iterator lifetime.
    #[must_use]
    pub const fn with_iterator_ttl(mut self, ttl: Duration) -> Self {
        self.iterator_ttl = ttl;
        self
    }

    /// Builder: set limits.
    #[must_use]
    pub const fn with_limits(mut self, limits: Limits) -> Self {
        self.limits = limits;
        self
    }

    /// Returns fault config for modification.
    ///
    /// # Panics
    ///
    /// Panics if the mutex is poisoned.
    pub fn fault_config(&self) -> std::sync::MutexGuard<'_, MemoryTransportFaultConfig> {
        self.fault_config.lock().expect("fault config lock poisoned")
    }

    /// Position token of the record at `index` in a shard.
    #[must_use]
    pub fn position(index: u64) -> PositionToken {
        PositionToken::new(format!("{index:020}"))
    }

    fn parse_position(token: &PositionToken) -> Option<usize> {
        token.as_str().parse().ok()
    }

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

    fn lock(&self) -> std::sync::MutexGuard<'_, TransportState> {
        self.state.lock().expect("transport lock poisoned")
    }

    /// Creates a stream with `shard_count` open shards and returns their ids.
    ///
    /// Creating an existing stream leaves it untouched.
    ///
    /// # Panics
    ///
    /// Panics if the state mutex is poisoned.
    pub fn create_stream(&self, stream_id: &StreamId, shard_count: u32) -> Vec<ShardId> {
        let mut state = self.lock();
        let shards = state.streams.entry(stream_id.clone()).or_insert_with(|| {
            (0..shard_count)
                .map(|i| (ShardId::new(format!("shard-{i:04}")), ShardLog::default()))
                .collect()
        });
        shards.keys().cloned().collect()
    }

    /// Appends a record directly to a shard, bypassing routing and faults.
    ///
    /// # Errors
    ///
    /// Returns an error if the stream or shard does not exist.
    ///
    /// # Panics
    ///
    /// Panics if the state mutex is poisoned.
    pub fn append(
        &self,
        stream_id: &StreamId,
        shard_id: &ShardId,
        partition_key: impl Into<String>,
        payload: impl Into<bytes::Bytes>,
    ) -> TransportResult<PositionToken> {
        let mut state = self.lock();
        let log = state.shard_mut(stream_id, shard_id)?;
        let position = Self::position(log.records.len() as u64);
        log.records
            .push(StreamRecord::new(position.clone(), partition_key, payload));
        Ok(position)
    }

    /// Closes a shard. Readers drain what remains and then get no next
    /// iterator; writes are no longer routed to it.
    ///
    /// # Errors
    ///
    /// Returns an error if the stream or shard does not exist.
    ///
    /// # Panics
    ///
    /// Panics if the state mutex is poisoned.
    pub fn close_shard(&self, stream_id: &StreamId, shard_id: &ShardId) -> TransportResult<()> {
        self.lock().shard_mut(stream_id, shard_id)?.closed = true;
        Ok(())
    }

    /// Returns every record in a shard.
    ///
    /// # Panics
    ///
    /// Panics if the state mutex is poisoned.
    #[must_use]
    pub fn records(&self, stream_id: &StreamId, shard_id: &ShardId) -> Vec<StreamRecord> {
        self.lock()
            .streams
            .get(stream_id)
            .and_then(|s| s.get(shard_id))
            .map(|log| log.records.clone())
            .unwrap_or_default()
    }

    /// Total records across all shards of a stream.
    ///
    /// # Panics
    ///
    /// Panics if the state mutex is poisoned.
    #[must_use]
    pub fn record_count(&self, stream_id: &StreamId) -> usize {
        self.lock()
            .streams
            .get(stream_id)
            .map_or(0, |s| s.values().map(|log| log.records.len()).sum())
    }

    /// Number of fetch calls served, including failed ones.
    #[must_use]
    pub fn fetch_count(&self) -> u64 {
        self.fetches.load(Ordering::Relaxed)
    }

    /// Decides the injected fault for a fetch, if any.
    fn fetch_fault(&self, shard_id: &ShardId) -> Option<TransportError> {
        let mut faults = self.fault_config();
        if faults.force_iterator_expired {
            faults.force_iterator_expired = false;
            return Some(TransportError::IteratorExpired {
                shard: shard_id.clone(),
            });
        }
        if faults.force_throttle {
            faults.force_throttle = false;
            return Some(TransportError::Throttled {
                shard: shard_id.clone(),
            });
        }
        if faults.force_fetch_error {
            faults.force_fetch_error = false;
            return Some(TransportError::Unavailable {
                operation: "fetch",
                message: "simulated failure (forced)".into(),
            });
        }
        let (throttle_rate, error_rate) = (faults.throttle_rate, faults.fetch_error_rate);
        drop(faults);

        if self.should_inject_fault(throttle_rate) {
            return Some(TransportError::Throttled {
                shard: shard_id.clone(),
            });
        }
        if self.should_inject_fault(error_rate) {
            return Some(TransportError::Unavailable {
                operation: "fetch",
                message: "simulated failure (random)".into(),
            });
        }
        None
    }
}

#[async_trait]
impl StreamTransport for MemoryTransport {
    async fn list_shards(&self, stream_id: &StreamId) -> TransportResult<Vec<ShardId>> {
        let state = self.lock();
        let shards = state
            .streams
            .get(stream_id)
            .ok_or_else(|| TransportError::StreamNotFound {
                stream: stream_id.clone(),
            })?;
        Ok(shards.keys().cloned().collect())
    }

    async fn get_iterator(
        &self,
        stream_id: &StreamId,
        shard_id: &ShardId,
        position: IteratorPosition,
    ) -> TransportResult<IteratorHandle> {
        {
            let mut faults = self.fault_config();
            if faults.force_get_iterator_error {
                faults.force_get_iterator_error = false;
                return Err(TransportError::Unavailable {
                    operation: "get_iterator",
                    message: "simulated failure (forced)".into(),
                });
            }
        }

        let now = Instant::now();
        let ttl = self.iterator_ttl;
        let mut state = self.lock();
        let len = state.shard_mut(stream_id, shard_id)?.records.len();
        let next_index = match &position {
            IteratorPosition::TrimHorizon => 0,
            IteratorPosition::Latest => len,
            IteratorPosition::AfterPosition(token) => Self::parse_position(token)
                .map(|i| i + 1)
                .ok_or_else(|| TransportError::InvalidIterator {
                    handle: token.to_string(),
                })?,
        };
        Ok(state.issue(stream_id, shard_id, next_index, now, ttl))
    }

    async fn fetch(&self, iterator: &IteratorHandle, max_records: u32) -> TransportResult<FetchBatch> {
        self.fetches.fetch_add(1, Ordering::Relaxed);
        let now = Instant::now();
        let ttl = self.iterator_ttl;

        let (stream_id, shard_id, start) = {
            let state = self.lock();
            let it = state
                .iterators
                .get(iterator.as_str())
                .ok_or_else(|| TransportError::InvalidIterator {
                    handle: iterator.to_string(),
                })?;
            if now.duration_since(it.issued_at) >= ttl {
                return Err(TransportError::IteratorExpired {
                    shard: it.shard_id.clone(),
                });
            }
            (it.stream_id.clone(), it.shard_id.clone(), it.next_index)
        };

        if let Some(fault) = self.fetch_fault(&shard_id) {
            return Err(fault);
        }

        let mut state = self.lock();
        let log = state.shard_mut(&stream_id, &shard_id)?;
        let len = log.records.len();
        let begin = start.min(len);
        let end = begin.saturating_add(max_records.max(1) as usize).min(len);
        let records = log.records[begin..end].to_vec();
        let closed = log.closed;

        let next_iterator = if closed && end >= len {
            None
        } else {
            Some(state.issue(&stream_id, &shard_id, end, now, ttl))
        };
        Ok(FetchBatch {
            records,
            next_iterator,
        })
    }

    async fn put(&self, stream_id: &StreamId, entries: Vec<PutEntry>) -> TransportResult<PutOutcome> {
        if entries.len() > self.limits.max_put_records as usize {
            return Err(TransportError::BatchTooLarge {
                count: entries.len(),
                max: self.limits.max_put_records,
            });
        }
        let put_fail_rate = self.fault_config().put_fail_rate;

        let mut failed_indexes = Vec::new();
        let mut state = self.lock();
        let shards = state
            .streams
            .get_mut(stream_id)
            .ok_or_else(|| TransportError::StreamNotFound {
                stream: stream_id.clone(),
            })?;
        let mut open: Vec<&mut ShardLog> = shards.values_mut().filter(|log| !log.closed).collect();

        for (index, entry) in entries.into_iter().enumerate() {
            if open.is_empty()
                || entry.payload.len() > self.limits.max_record_bytes as usize
                || self.should_inject_fault(put_fail_rate)
            {
                failed_indexes.push(index);
                continue;
            }
            // Upper hash bits, as in key routing elsewhere.
            let hash = xxh3_64(entry.partition_key.as_bytes()) >> 32;
            #[allow(clippy::cast_possible_truncation)]
            let slot = (hash % open.len() as u64) as usize;
            let log = &mut open[slot];
            let position = Self::position(log.records.len() as u64);
            log.records.push(StreamRecord::new(
                position,
                entry.partition_key,
                entry.payload,
            ));
        }
        Ok(PutOutcome { failed_indexes })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup(shards: u32) -> (MemoryTransport, StreamId, Vec<ShardId>) {
        let transport = MemoryTransport::new(7);
        let stream = StreamId::new("orders");
        let ids = transport.create_stream(&stream, shards);
        (transport, stream, ids)
    }

    #[tokio::test]
    async fn test_trim_horizon_reads_in_order() {
        let (transport, stream, shards) = setup(1);
        for i in 0..5 {
            transport.append(&stream, &shards[0], "k", format!("{i}")).unwrap();
        }

        let it = transport
            .get_iterator(&stream, &shards[0], IteratorPosition::TrimHorizon)
            .await
            .unwrap();
        let batch = transport.fetch(&it, 3).await.unwrap();
        assert_eq!(batch.records.len(), 3);
        assert_eq!(batch.leading_position(), Some(&MemoryTransport::position(0)));

        let next = batch.next_iterator.unwrap();
        let batch = transport.fetch(&next, 10).await.unwrap();
        assert_eq!(batch.records.len(), 2);
        assert_eq!(batch.last_position(), Some(&MemoryTransport::position(4)));
    }

    #[tokio::test]
    async fn test_refetch_same_handle_repeats() {
        let (transport, stream, shards) = setup(1);
        transport.append(&stream, &shards[0], "k", "a").unwrap();
        let it = transport
            .get_iterator(&stream, &shards[0], IteratorPosition::TrimHorizon)
            .await
            .unwrap();

        let first = transport.fetch(&it, 10).await.unwrap();
        let second = transport.fetch(&it, 10).await.unwrap();
        assert_eq!(first.records, second.records);
    }

    #[tokio::test]
    async fn test_after_position_skips_checkpoint() {
        let (transport, stream, shards) = setup(1);
        for i in 0..4 {
            transport.append(&stream, &shards[0], "k", format!("{i}")).unwrap();
        }
        let it = transport
            .get_iterator(
                &stream,
                &shards[0],
                IteratorPosition::AfterPosition(MemoryTransport::position(1)),
            )
            .await
            .unwrap();
        let batch = transport.fetch(&it, 10).await.unwrap();
        assert_eq!(batch.leading_position(), Some(&MemoryTransport::position(2)));
    }

    #[tokio::test]
    async fn test_closed_shard_ends_iteration() {
        let (transport, stream, shards) = setup(1);
        transport.append(&stream, &shards[0], "k", "a").unwrap();
        transport.close_shard(&stream, &shards[0]).unwrap();

        let it = transport
            .get_iterator(&stream, &shards[0], IteratorPosition::TrimHorizon)
            .await
            .unwrap();
        let batch = transport.fetch(&it, 10).await.unwrap();
        assert_eq!(batch.records.len(), 1);
        assert!(batch.next_iterator.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_iterator_expires() {
        let (transport, stream, shards) = setup(1);
        let transport = transport.with_iterator_ttl(Duration::from_secs(5));
        let it = transport
            .get_iterator(&stream, &shards[0], IteratorPosition::TrimHorizon)
            .await
            .unwrap();

        tokio::time::advance(Duration::from_secs(6)).await;
        let err = transport.fetch(&it, 10).await.unwrap_err();
        assert!(matches!(err, TransportError::IteratorExpired { .. }));
    }

    #[tokio::test]
    async fn test_forced_throttle_is_one_shot() {
        let (transport, stream, shards) = setup(1);
        let it = transport
            .get_iterator(&stream, &shards[0], IteratorPosition::TrimHorizon)
            .await
            .unwrap();

        transport.fault_config().force_throttle = true;
        let err = transport.fetch(&it, 10).await.unwrap_err();
        assert!(matches!(err, TransportError::Throttled { .. }));
        assert!(transport.fetch(&it, 10).await.is_ok());
        assert_eq!(transport.fetch_count(), 2);
    }

    #[tokio::test]
    async fn test_put_routes_by_key() {
        let (transport, stream, shards) = setup(4);
        let entries: Vec<PutEntry> = (0..40)
            .map(|i| PutEntry::new(format!("key-{}", i % 5), format!("{i}")))
            .collect();
        let outcome = transport.put(&stream, entries).await.unwrap();
        assert!(outcome.all_succeeded());
        assert_eq!(transport.record_count(&stream), 40);

        // Same key always lands on the same shard.
        for shard in &shards {
            let records = transport.records(&stream, shard);
            for key in records.iter().map(|r| &r.partition_key) {
                for other in &shards {
                    if other != shard {
                        assert!(transport
                            .records(&stream, other)
                            .iter()
                            .all(|r| &r.partition_key != key));
                    }
                }
            }
        }
    }

    #[tokio::test]
    async fn test_put_rejects_oversized() {
        let (transport, stream, _) = setup(1);
        let transport = transport.with_limits(Limits {
            max_record_bytes: 4,
            ..Limits::new()
        });
        let outcome = transport
            .put(
                &stream,
                vec![PutEntry::new("a", "ok"), PutEntry::new("b", "too large")],
            )
            .await
            .unwrap();
        assert_eq!(outcome.failed_indexes, vec![1]);
    }

    #[tokio::test]
    async fn test_unknown_stream() {
        let transport = MemoryTransport::new(1);
        let err = transport.list_shards(&StreamId::new("missing")).await.unwrap_err();
        assert!(matches!(err, TransportError::StreamNotFound { .. }));
    }
}
