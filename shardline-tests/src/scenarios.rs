//! Reusable fixtures for Shardline tests.
//!
//! Recording doubles for the processor and the listener, a transport that
//! replays a fixed script of fetch results, and helpers that wire a leaser to
//! a simulated store.

#![allow(clippy::significant_drop_tightening)] // Test doubles lock briefly.
#![allow(clippy::missing_panics_doc)] // Poisoned locks only panic in tests.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use shardline_consumer::{
    ConsumerListener, ExitReason, FetchBatch, IteratorHandle, IteratorPosition, Message,
    MessageProcessor, ProcessError, StreamTransport, TransportError, TransportResult,
};
use shardline_core::{InstanceId, PositionToken, PutEntry, PutOutcome, ShardId, StreamId, StreamRecord};
use shardline_lease::{LeaseConfig, ShardLeaser, SimulatedLeaseStore};
use tokio_util::sync::CancellationToken;

/// Seeds for reproducible testing.
pub mod seeds {
    /// Seeds used by every simulation test.
    pub const REGRESSION_SEEDS: &[u64] = &[42, 12345, 0xDEAD_BEEF, 999, 7777, 0x1337, 1, 0];
}

// ============================================================================
// Messages
// ============================================================================

/// Body of every test message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    /// Sequence number, unique per produced message.
    pub n: u64,
}

/// JSON payload for an event.
#[must_use]
pub fn event_payload(n: u64) -> String {
    format!(r#"{{"n":{n}}}"#)
}

/// A record at `position` carrying event `n`.
#[must_use]
pub fn event_record(position: &str, n: u64) -> StreamRecord {
    StreamRecord::new(PositionToken::new(position), "k", event_payload(n))
}

// ============================================================================
// Leaser Fixture
// ============================================================================

/// Builds a leaser for `instance` over a shared store with test timings.
#[must_use]
pub fn leaser(stream: &StreamId, instance: &str, store: &SimulatedLeaseStore) -> Arc<ShardLeaser> {
    Arc::new(ShardLeaser::new(
        stream.clone(),
        InstanceId::new(instance),
        LeaseConfig::for_testing(),
        Arc::new(store.clone()),
    ))
}

// ============================================================================
// Recording Processor
// ============================================================================

/// How the recording processor behaves.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Behavior {
    /// Every call succeeds.
    #[default]
    Succeed,
    /// Calls whose batch contains this event fail.
    FailOn(u64),
    /// Calls never complete.
    Hang,
}

/// Processor that records every call.
#[derive(Debug, Default)]
pub struct RecordingProcessor {
    behavior: Behavior,
    calls: AtomicU64,
    batches: Mutex<Vec<Vec<u64>>>,
    delivered: Mutex<HashSet<u64>>,
    tokens: Mutex<Vec<CancellationToken>>,
}

impl RecordingProcessor {
    /// Creates a processor with the given behavior.
    #[must_use]
    pub fn new(behavior: Behavior) -> Self {
        Self {
            behavior,
            ..Self::default()
        }
    }

    /// Number of calls, including failed ones.
    #[must_use]
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    /// Event numbers of every call, in call order.
    #[must_use]
    pub fn batches(&self) -> Vec<Vec<u64>> {
        self.batches.lock().expect("batches lock poisoned").clone()
    }

    /// Events that were part of a successful call.
    #[must_use]
    pub fn delivered(&self) -> HashSet<u64> {
        self.delivered.lock().expect("delivered lock poisoned").clone()
    }

    /// Cancellation tokens handed to each call.
    #[must_use]
    pub fn tokens(&self) -> Vec<CancellationToken> {
        self.tokens.lock().expect("tokens lock poisoned").clone()
    }
}

#[async_trait]
impl MessageProcessor<Event> for RecordingProcessor {
    async fn process(
        &self,
        _consumer_tag: &str,
        messages: Vec<Message<Event>>,
        cancel: CancellationToken,
    ) -> Result<(), ProcessError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let events: Vec<u64> = messages.iter().map(|m| m.body.n).collect();
        self.batches
            .lock()
            .expect("batches lock poisoned")
            .push(events.clone());
        self.tokens.lock().expect("tokens lock poisoned").push(cancel);

        match self.behavior {
            Behavior::Succeed => {}
            Behavior::FailOn(n) if events.contains(&n) => {
                return Err(ProcessError::failed(format!("cannot handle event {n}")));
            }
            Behavior::FailOn(_) => {}
            Behavior::Hang => {
                std::future::pending::<()>().await;
            }
        }
        self.delivered
            .lock()
            .expect("delivered lock poisoned")
            .extend(events);
        Ok(())
    }
}

// ============================================================================
// Recording Listener
// ============================================================================

/// A lifecycle event as seen by the listener.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenerEvent {
    /// Consumer connected.
    Connected(ShardId),
    /// Consumer stopped.
    Disconnected(ShardId, ExitReason),
    /// Checkpoint written after processing.
    Checkpoint(ShardId, PositionToken, usize),
    /// Batch skipped as a poison pill.
    PoisonPill(ShardId, PositionToken, u32),
}

/// Listener that keeps every event.
#[derive(Debug, Default)]
pub struct RecordingListener {
    events: Mutex<Vec<ListenerEvent>>,
}

impl RecordingListener {
    /// Events in the order they fired.
    #[must_use]
    pub fn events(&self) -> Vec<ListenerEvent> {
        self.events.lock().expect("events lock poisoned").clone()
    }

    /// Poison pill events only.
    #[must_use]
    pub fn poison_pills(&self) -> Vec<ListenerEvent> {
        self.events()
            .into_iter()
            .filter(|e| matches!(e, ListenerEvent::PoisonPill(..)))
            .collect()
    }

    fn push(&self, event: ListenerEvent) {
        self.events.lock().expect("events lock poisoned").push(event);
    }
}

impl ConsumerListener for RecordingListener {
    fn on_shard_connected(&self, shard_id: &ShardId) {
        self.push(ListenerEvent::Connected(shard_id.clone()));
    }

    fn on_shard_disconnected(&self, shard_id: &ShardId, reason: ExitReason) {
        self.push(ListenerEvent::Disconnected(shard_id.clone(), reason));
    }

    fn on_checkpoint(&self, shard_id: &ShardId, position: &PositionToken, count: usize) {
        self.push(ListenerEvent::Checkpoint(shard_id.clone(), position.clone(), count));
    }

    fn on_poison_pill(&self, shard_id: &ShardId, position: &PositionToken, repeats: u32) {
        self.push(ListenerEvent::PoisonPill(shard_id.clone(), position.clone(), repeats));
    }
}

// ============================================================================
// Scripted Transport
// ============================================================================

/// One scripted fetch result.
#[derive(Debug, Clone)]
pub enum Step {
    /// Return these records with a live next iterator.
    Records(Vec<StreamRecord>),
    /// Fail the fetch.
    Fail(TransportError),
}

/// Transport that answers fetches from a fixed script.
///
/// Once the script runs out, fetches return an empty batch with no next
/// iterator, so the consumer sees the shard as closed and exits.
#[derive(Debug)]
pub struct ScriptedTransport {
    shards: Vec<ShardId>,
    script: Mutex<VecDeque<Step>>,
    positions: Mutex<Vec<IteratorPosition>>,
    fetches: AtomicU64,
}

impl ScriptedTransport {
    /// Creates a transport for one shard with the given script.
    #[must_use]
    pub fn new(shard: &ShardId, script: impl IntoIterator<Item = Step>) -> Self {
        Self {
            shards: vec![shard.clone()],
            script: Mutex::new(script.into_iter().collect()),
            positions: Mutex::new(Vec::new()),
            fetches: AtomicU64::new(0),
        }
    }

    /// Positions requested from `get_iterator`, in order.
    #[must_use]
    pub fn iterator_positions(&self) -> Vec<IteratorPosition> {
        self.positions.lock().expect("positions lock poisoned").clone()
    }

    /// Number of fetch calls.
    #[must_use]
    pub fn fetch_count(&self) -> u64 {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StreamTransport for ScriptedTransport {
    async fn list_shards(&self, _stream_id: &StreamId) -> TransportResult<Vec<ShardId>> {
        Ok(self.shards.clone())
    }

    async fn get_iterator(
        &self,
        _stream_id: &StreamId,
        _shard_id: &ShardId,
        position: IteratorPosition,
    ) -> TransportResult<IteratorHandle> {
        let mut positions = self.positions.lock().expect("positions lock poisoned");
        positions.push(position);
        Ok(IteratorHandle::new(format!("scripted-{}", positions.len())))
    }

    async fn fetch(&self, iterator: &IteratorHandle, _max_records: u32) -> TransportResult<FetchBatch> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let step = self.script.lock().expect("script lock poisoned").pop_front();
        match step {
            Some(Step::Records(records)) => Ok(FetchBatch {
                records,
                next_iterator: Some(iterator.clone()),
            }),
            Some(Step::Fail(e)) => Err(e),
            None => Ok(FetchBatch::default()),
        }
    }

    async fn put(&self, _stream_id: &StreamId, _entries: Vec<PutEntry>) -> TransportResult<PutOutcome> {
        Ok(PutOutcome::default())
    }
}

// ============================================================================
// Polling
// ============================================================================

/// Polls `condition` every `step` until it holds or `limit` passes.
/// Returns whether it held.
pub async fn eventually(limit: Duration, step: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(step).await;
    }
}
