//! Per-shard consumer.
//!
//! One consumer owns one shard for as long as it holds the shard's lease:
//!
//! ```text
//! Initializing -> Running <-> Backoff -> Draining -> Stopped
//! ```
//!
//! - **Initializing**: confirm the lease, start renewal, read the checkpoint
//!   and open an iterator after it (or at the trim horizon).
//! - **Running**: fetch, decode, process under a deadline, checkpoint the last
//!   record, advance. A failed batch is re-fetched with the same iterator; a
//!   batch whose leading position repeats across enough cycles is a poison
//!   pill and is checkpointed past without processing.
//! - **Draining**: stop renewal, release the lease under a deadline, and
//!   report the shard lost unless the consumer was simply stopped.
//!
//! Nothing here panics or terminates the process. Every failure ends in an
//! [`ExitReason`].

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use shardline_core::{Classify, ErrorKind, PositionToken, ShardId, StreamId};
use shardline_flow::{AdaptiveStrategy, BatchResult};
use shardline_lease::ShardLeaser;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::ConsumerConfig;
use crate::error::{ConsumerResult, TransportError};
use crate::listener::{notify, ConsumerListener, NoopListener};
use crate::processor::{decode_batch, Message, MessageProcessor};
use crate::renewal::{RenewalFlags, RenewalTask};
use crate::state::{ConsumerCounters, ConsumerPhase, ConsumerStats, ExitReason, ShardLost};
use crate::transport::{FetchBatch, IteratorHandle, IteratorPosition, StreamTransport};

/// In-memory state of the fetch loop.
#[derive(Debug, Default)]
struct LoopState {
    iterator: Option<IteratorHandle>,
    consecutive_errors: u32,
    last_leading: Option<PositionToken>,
    repeat_count: u32,
    /// Set by an iterator resync, cleared by the next successful fetch.
    resynced: bool,
}

impl LoopState {
    fn reset_poison_tracking(&mut self) {
        self.last_leading = None;
        self.repeat_count = 0;
    }

    /// Records the leading position of a batch and returns how many
    /// consecutive cycles it has led.
    fn observe_leading(&mut self, leading: &PositionToken) -> u32 {
        if self.last_leading.as_ref() == Some(leading) {
            self.repeat_count += 1;
        } else {
            self.last_leading = Some(leading.clone());
            self.repeat_count = 1;
        }
        self.repeat_count
    }
}

enum Step {
    Continue,
    Exit(ExitReason),
}

/// Consumes one shard.
pub struct ShardConsumer<T> {
    stream_id: StreamId,
    shard_id: ShardId,
    consumer_tag: String,
    leaser: Arc<ShardLeaser>,
    transport: Arc<dyn StreamTransport>,
    processor: Arc<dyn MessageProcessor<T>>,
    strategy: Option<Arc<dyn AdaptiveStrategy>>,
    listener: Arc<dyn ConsumerListener>,
    config: ConsumerConfig,
    lost_tx: Option<mpsc::UnboundedSender<ShardLost>>,
    phase: watch::Sender<ConsumerPhase>,
    counters: Arc<ConsumerCounters>,
}

impl<T> ShardConsumer<T>
where
    T: DeserializeOwned + Send + 'static,
{
    /// Creates a consumer for `shard_id`. The stream comes from the leaser.
    #[must_use]
    pub fn new(
        shard_id: ShardId,
        leaser: Arc<ShardLeaser>,
        transport: Arc<dyn StreamTransport>,
        processor: Arc<dyn MessageProcessor<T>>,
        config: ConsumerConfig,
    ) -> Self {
        let stream_id = leaser.stream_id().clone();
        let consumer_tag = format!("{}:{}", leaser.instance_id(), shard_id);
        let (phase, _) = watch::channel(ConsumerPhase::Initializing);
        Self {
            stream_id,
            shard_id,
            consumer_tag,
            leaser,
            transport,
            processor,
            strategy: None,
            listener: Arc::new(NoopListener),
            config,
            lost_tx: None,
            phase,
            counters: Arc::new(ConsumerCounters::default()),
        }
    }

    /// Builder: use an adaptive strategy for batch size and backoff.
    #[must_use]
    pub fn with_strategy(mut self, strategy: Arc<dyn AdaptiveStrategy>) -> Self {
        self.strategy = Some(strategy);
        self
    }

    /// Builder: set the lifecycle listener.
    #[must_use]
    pub fn with_listener(mut self, listener: Arc<dyn ConsumerListener>) -> Self {
        self.listener = listener;
        self
    }

    /// Builder: report lost shards on `tx`.
    #[must_use]
    pub fn with_lost_sender(mut self, tx: mpsc::UnboundedSender<ShardLost>) -> Self {
        self.lost_tx = Some(tx);
        self
    }

    /// Returns the shard.
    #[must_use]
    pub const fn shard_id(&self) -> &ShardId {
        &self.shard_id
    }

    /// Subscribes to phase changes.
    #[must_use]
    pub fn phase_watch(&self) -> watch::Receiver<ConsumerPhase> {
        self.phase.subscribe()
    }

    /// Returns a snapshot of the counters.
    #[must_use]
    pub fn stats(&self) -> ConsumerStats {
        self.counters.snapshot()
    }

    /// Runs the consumer on a new task.
    #[must_use]
    pub fn spawn(self, cancel: CancellationToken) -> ConsumerHandle {
        let shard_id = self.shard_id.clone();
        let phase = self.phase.subscribe();
        let counters = Arc::clone(&self.counters);
        let join = tokio::spawn(self.run(cancel.clone()));
        ConsumerHandle {
            shard_id,
            cancel,
            phase,
            counters,
            join: Some(join),
        }
    }

    /// Runs the consumer to completion on the current task.
    pub async fn run(self, cancel: CancellationToken) -> ExitReason {
        let loop_cancel = cancel.child_token();
        let flags = Arc::new(RenewalFlags::default());
        self.set_phase(ConsumerPhase::Initializing);
        info!(stream = %self.stream_id, shard = %self.shard_id, "Shard consumer starting");

        if !self.leaser.acquire_or_renew_lock(&self.shard_id).await {
            return self.drain(ExitReason::LockLost, &flags, None).await;
        }
        let renewal = RenewalTask::spawn(
            Arc::clone(&self.leaser),
            self.shard_id.clone(),
            &self.config,
            Arc::clone(&flags),
            loop_cancel.clone(),
        );

        let reason = match self.initial_iterator(&loop_cancel, &flags).await {
            Ok(iterator) => {
                let listener = &self.listener;
                notify(&self.shard_id, "shard_connected", || {
                    listener.on_shard_connected(&self.shard_id);
                });
                self.set_phase(ConsumerPhase::Running);
                let mut state = LoopState {
                    iterator: Some(iterator),
                    ..LoopState::default()
                };
                self.consume(&mut state, &loop_cancel, &flags).await
            }
            Err(reason) => reason,
        };

        self.drain(reason, &flags, Some(renewal)).await
    }

    // -------------------------------------------------------------------------
    // Initialization
    // -------------------------------------------------------------------------

    /// Reads the checkpoint and opens an iterator after it.
    async fn open_iterator(&self) -> ConsumerResult<IteratorHandle> {
        let checkpoint = self.leaser.get_checkpoint(&self.shard_id).await?;
        let position = checkpoint.map_or(IteratorPosition::TrimHorizon, IteratorPosition::AfterPosition);
        debug!(shard = %self.shard_id, ?position, "Opening iterator");
        let handle = self
            .transport
            .get_iterator(&self.stream_id, &self.shard_id, position)
            .await?;
        Ok(handle)
    }

    async fn initial_iterator(
        &self,
        cancel: &CancellationToken,
        flags: &RenewalFlags,
    ) -> Result<IteratorHandle, ExitReason> {
        let attempts = self.config.iterator_attempts.max(1);
        for attempt in 1..=attempts {
            match self.open_iterator().await {
                Ok(handle) => return Ok(handle),
                Err(e) => warn!(
                    shard = %self.shard_id,
                    attempt,
                    error = %e,
                    "Failed to obtain initial iterator"
                ),
            }
            if attempt < attempts && !self.sleep(cancel, self.config.base_backoff()).await {
                return Err(Self::cancel_reason(flags));
            }
        }
        if cancel.is_cancelled() {
            return Err(Self::cancel_reason(flags));
        }
        Err(ExitReason::IteratorUnavailable)
    }

    // -------------------------------------------------------------------------
    // Fetch Loop
    // -------------------------------------------------------------------------

    async fn consume(
        &self,
        state: &mut LoopState,
        cancel: &CancellationToken,
        flags: &RenewalFlags,
    ) -> ExitReason {
        loop {
            if cancel.is_cancelled() {
                return Self::cancel_reason(flags);
            }
            if state.consecutive_errors >= self.config.max_consecutive_errors.max(1) {
                warn!(
                    shard = %self.shard_id,
                    errors = state.consecutive_errors,
                    "Consecutive error ceiling reached"
                );
                return ExitReason::ErrorCeiling;
            }

            if let Some(strategy) = &self.strategy {
                if strategy.should_backoff(&self.shard_id) {
                    let delay = strategy.processing_delay(&self.shard_id);
                    self.backoff(cancel, delay).await;
                    continue;
                }
            }

            let Some(iterator) = state.iterator.clone() else {
                return ExitReason::ShardClosed;
            };
            let requested = self
                .strategy
                .as_ref()
                .map_or(self.config.default_batch_size, |s| s.batch_size(&self.shard_id));
            let max_records = self.config.clamp_batch(requested);

            let fetched = tokio::select! {
                () = cancel.cancelled() => continue,
                result = self.transport.fetch(&iterator, max_records) => result,
            };

            let step = match fetched {
                Ok(batch) => self.handle_batch(batch, state, cancel).await,
                Err(e) => self.handle_transport_error(&e, state, cancel).await,
            };
            if let Step::Exit(reason) = step {
                return reason;
            }
        }
    }

    async fn handle_batch(&self, batch: FetchBatch, state: &mut LoopState, cancel: &CancellationToken) -> Step {
        let FetchBatch {
            records,
            next_iterator,
        } = batch;
        state.resynced = false;

        let (Some(first), Some(last)) = (records.first(), records.last()) else {
            if next_iterator.is_some() {
                let delay = self
                    .strategy
                    .as_ref()
                    .map_or(self.config.idle_delay(), |s| s.processing_delay(&self.shard_id));
                self.sleep(cancel, delay).await;
            }
            return self.advance(state, next_iterator);
        };
        let leading = first.position.clone();
        let last_position = last.position.clone();
        ConsumerCounters::bump(&self.counters.batches);

        let messages: Vec<Message<T>> = decode_batch(&self.shard_id, &records);
        if messages.is_empty() {
            warn!(
                shard = %self.shard_id,
                records = records.len(),
                "No decodable records in batch"
            );
            return self.advance(state, next_iterator);
        }
        let count = messages.len();

        let repeats = state.observe_leading(&leading);
        if repeats >= self.config.poison_pill_threshold.max(1) {
            return self
                .skip_poison_pill(state, next_iterator, &leading, &last_position, count, repeats)
                .await;
        }

        let started = Instant::now();
        let call_cancel = cancel.child_token();
        let call = tokio::time::timeout(
            self.config.processor_timeout(),
            self.processor
                .process(&self.consumer_tag, messages, call_cancel.clone()),
        );
        let outcome = tokio::select! {
            () = cancel.cancelled() => {
                call_cancel.cancel();
                return Step::Continue;
            }
            outcome = call => outcome,
        };
        let latency = started.elapsed();
        let records_u32 = u32::try_from(count).unwrap_or(u32::MAX);

        match outcome {
            Ok(Ok(())) => {
                if let Err(e) = self.leaser.set_checkpoint(&self.shard_id, &last_position).await {
                    // The batch was handled but will be redelivered.
                    state.reset_poison_tracking();
                    state.consecutive_errors += 1;
                    ConsumerCounters::bump(&self.counters.transport_errors);
                    warn!(shard = %self.shard_id, error = %e, "Checkpoint write failed");
                    self.backoff(cancel, self.config.base_backoff()).await;
                    return Step::Continue;
                }
                ConsumerCounters::bump(&self.counters.checkpoints);
                self.counters.records.fetch_add(count as u64, Ordering::Relaxed);
                state.reset_poison_tracking();
                state.consecutive_errors = 0;

                let listener = &self.listener;
                notify(&self.shard_id, "checkpoint", || {
                    listener.on_checkpoint(&self.shard_id, &last_position, count);
                });
                self.report(BatchResult::success(self.shard_id.clone(), records_u32, latency));
                debug!(
                    shard = %self.shard_id,
                    count,
                    position = %last_position,
                    latency_ms = latency.as_millis(),
                    "Batch processed"
                );
                self.advance(state, next_iterator)
            }
            Ok(Err(e)) => {
                state.consecutive_errors += 1;
                ConsumerCounters::bump(&self.counters.processing_failures);
                warn!(
                    shard = %self.shard_id,
                    error = %e,
                    kind = %e.kind(),
                    consecutive = state.consecutive_errors,
                    "Processor failed, batch will be retried"
                );
                self.report(BatchResult::failure(self.shard_id.clone(), records_u32, latency));
                if self.strategy.is_none() {
                    self.backoff(cancel, self.config.base_backoff()).await;
                }
                Step::Continue
            }
            Err(_) => {
                call_cancel.cancel();
                state.consecutive_errors += 1;
                ConsumerCounters::bump(&self.counters.processing_failures);
                error!(
                    shard = %self.shard_id,
                    kind = %ErrorKind::ProcessingTimeout,
                    timeout_ms = self.config.processor_timeout_ms,
                    "Processor timed out"
                );
                self.report(BatchResult::failure(self.shard_id.clone(), records_u32, latency));
                Step::Exit(ExitReason::ProcessorTimeout)
            }
        }
    }

    async fn skip_poison_pill(
        &self,
        state: &mut LoopState,
        next_iterator: Option<IteratorHandle>,
        leading: &PositionToken,
        last_position: &PositionToken,
        count: usize,
        repeats: u32,
    ) -> Step {
        warn!(
            shard = %self.shard_id,
            position = %leading,
            repeats,
            count,
            "Poison pill detected, skipping batch"
        );
        if let Err(e) = self.leaser.set_checkpoint(&self.shard_id, last_position).await {
            // Tracking is kept, so the next cycle tries again.
            state.consecutive_errors += 1;
            ConsumerCounters::bump(&self.counters.transport_errors);
            warn!(shard = %self.shard_id, error = %e, "Checkpoint write failed");
            return Step::Continue;
        }
        ConsumerCounters::bump(&self.counters.poison_pills);
        ConsumerCounters::bump(&self.counters.checkpoints);

        self.report(BatchResult::poison_pill(
            self.shard_id.clone(),
            u32::try_from(count).unwrap_or(u32::MAX),
        ));
        let listener = &self.listener;
        notify(&self.shard_id, "poison_pill", || {
            listener.on_poison_pill(&self.shard_id, leading, repeats);
        });
        state.reset_poison_tracking();
        state.consecutive_errors = 0;
        self.advance(state, next_iterator)
    }

    async fn handle_transport_error(
        &self,
        err: &TransportError,
        state: &mut LoopState,
        cancel: &CancellationToken,
    ) -> Step {
        match err.kind() {
            ErrorKind::IteratorExpired => {
                if state.resynced {
                    // No fetch succeeded since the last resync.
                    state.consecutive_errors += 1;
                    ConsumerCounters::bump(&self.counters.transport_errors);
                    warn!(
                        shard = %self.shard_id,
                        consecutive = state.consecutive_errors,
                        "Iterator expired again after resync"
                    );
                    if !self.sleep(cancel, self.config.base_backoff()).await {
                        return Step::Continue;
                    }
                }
                ConsumerCounters::bump(&self.counters.resyncs);
                info!(shard = %self.shard_id, "Iterator expired, resyncing from checkpoint");
                match self.open_iterator().await {
                    Ok(handle) => {
                        state.iterator = Some(handle);
                        state.resynced = true;
                    }
                    Err(e) => {
                        state.consecutive_errors += 1;
                        ConsumerCounters::bump(&self.counters.transport_errors);
                        warn!(shard = %self.shard_id, error = %e, "Iterator resync failed");
                        self.backoff(cancel, self.config.base_backoff()).await;
                    }
                }
            }
            ErrorKind::Throttled => {
                ConsumerCounters::bump(&self.counters.throttles);
                self.report(BatchResult::throttled(self.shard_id.clone()));
                let delay = self
                    .strategy
                    .as_ref()
                    .map_or(Duration::ZERO, |s| s.processing_delay(&self.shard_id))
                    .max(self.config.throttle_backoff());
                debug!(shard = %self.shard_id, delay_ms = delay.as_millis(), "Fetch throttled");
                self.backoff(cancel, delay).await;
            }
            kind => {
                state.consecutive_errors += 1;
                ConsumerCounters::bump(&self.counters.transport_errors);
                warn!(
                    shard = %self.shard_id,
                    error = %err,
                    %kind,
                    consecutive = state.consecutive_errors,
                    "Fetch failed"
                );
                self.backoff(cancel, self.config.base_backoff()).await;
            }
        }
        Step::Continue
    }

    fn advance(&self, state: &mut LoopState, next_iterator: Option<IteratorHandle>) -> Step {
        state.iterator = next_iterator;
        if state.iterator.is_none() {
            info!(shard = %self.shard_id, "Shard closed and fully read");
            return Step::Exit(ExitReason::ShardClosed);
        }
        Step::Continue
    }

    // -------------------------------------------------------------------------
    // Draining
    // -------------------------------------------------------------------------

    async fn drain(&self, reason: ExitReason, flags: &RenewalFlags, renewal: Option<RenewalTask>) -> ExitReason {
        self.set_phase(ConsumerPhase::Draining);
        flags.shutting_down.store(true, Ordering::Release);
        if let Some(task) = renewal {
            task.stop(self.config.renewal_drain()).await;
        }

        match tokio::time::timeout(
            self.config.release_timeout(),
            self.leaser.release_lock(&self.shard_id),
        )
        .await
        {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(shard = %self.shard_id, error = %e, "Lease release failed"),
            Err(_) => warn!(
                shard = %self.shard_id,
                timeout_ms = self.config.release_timeout_ms,
                "Lease release timed out"
            ),
        }

        let listener = &self.listener;
        notify(&self.shard_id, "shard_disconnected", || {
            listener.on_shard_disconnected(&self.shard_id, reason);
        });
        if reason.is_shard_lost() {
            if let Some(tx) = &self.lost_tx {
                // The rebalancer may already be gone during shutdown.
                let _ = tx.send(ShardLost {
                    shard_id: self.shard_id.clone(),
                    reason,
                });
            }
        }

        info!(stream = %self.stream_id, shard = %self.shard_id, %reason, "Shard consumer stopped");
        self.set_phase(ConsumerPhase::Stopped);
        reason
    }

    // -------------------------------------------------------------------------
    // Helpers
    // -------------------------------------------------------------------------

    fn cancel_reason(flags: &RenewalFlags) -> ExitReason {
        if flags.is_lock_lost() {
            ExitReason::LockLost
        } else {
            ExitReason::Stopped
        }
    }

    fn set_phase(&self, phase: ConsumerPhase) {
        self.phase.send_replace(phase);
    }

    fn report(&self, result: BatchResult) {
        if let Some(strategy) = &self.strategy {
            strategy.record_batch_result(&result);
        }
    }

    /// Sleeps unless cancelled first. Returns false if cancelled.
    async fn sleep(&self, cancel: &CancellationToken, delay: Duration) -> bool {
        if delay.is_zero() {
            return !cancel.is_cancelled();
        }
        tokio::select! {
            () = cancel.cancelled() => false,
            () = tokio::time::sleep(delay) => true,
        }
    }

    /// Sleeps in the backoff phase.
    async fn backoff(&self, cancel: &CancellationToken, delay: Duration) {
        self.set_phase(ConsumerPhase::Backoff);
        if self.sleep(cancel, delay).await {
            self.set_phase(ConsumerPhase::Running);
        }
    }
}

impl<T> std::fmt::Debug for ShardConsumer<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardConsumer")
            .field("stream_id", &self.stream_id)
            .field("shard_id", &self.shard_id)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

// -----------------------------------------------------------------------------
// Handle
// -----------------------------------------------------------------------------

/// Handle on a spawned shard consumer.
#[derive(Debug)]
pub struct ConsumerHandle {
    shard_id: ShardId,
    cancel: CancellationToken,
    phase: watch::Receiver<ConsumerPhase>,
    counters: Arc<ConsumerCounters>,
    join: Option<JoinHandle<ExitReason>>,
}

impl ConsumerHandle {
    /// Returns the shard.
    #[must_use]
    pub const fn shard_id(&self) -> &ShardId {
        &self.shard_id
    }

    /// Returns the current phase.
    #[must_use]
    pub fn phase(&self) -> ConsumerPhase {
        *self.phase.borrow()
    }

    /// Subscribes to phase changes.
    #[must_use]
    pub fn phase_watch(&self) -> watch::Receiver<ConsumerPhase> {
        self.phase.clone()
    }

    /// Returns a snapshot of the counters.
    #[must_use]
    pub fn stats(&self) -> ConsumerStats {
        self.counters.snapshot()
    }

    /// Returns true once the consumer task has finished.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.join.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Asks the consumer to stop. Returns immediately.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Waits for the consumer to finish.
    pub async fn wait(mut self) -> ExitReason {
        let Some(join) = self.join.take() else {
            return ExitReason::Stopped;
        };
        match join.await {
            Ok(reason) => reason,
            Err(e) => {
                error!(shard = %self.shard_id, error = %e, "Consumer task failed");
                ExitReason::Stopped
            }
        }
    }

    /// Stops the consumer and waits for it to drain.
    pub async fn stop_and_wait(self) -> ExitReason {
        self.stop();
        self.wait().await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use serde::Deserialize;
    use shardline_core::InstanceId;
    use shardline_lease::{checkpoint_key, shard_lease_key, LeaseConfig, SimulatedLeaseStore};

    use super::*;
    use crate::error::ProcessError;
    use crate::transport::MemoryTransport;

    #[derive(Debug, Deserialize)]
    struct Event {
        n: u32,
    }

    #[derive(Default)]
    struct Collect {
        seen: Mutex<Vec<u32>>,
    }

    #[async_trait]
    impl MessageProcessor<Event> for Collect {
        async fn process(
            &self,
            _consumer_tag: &str,
            messages: Vec<Message<Event>>,
            _cancel: CancellationToken,
        ) -> Result<(), ProcessError> {
            self.seen
                .lock()
                .unwrap()
                .extend(messages.iter().map(|m| m.body.n));
            Ok(())
        }
    }

    fn fixture() -> (MemoryTransport, SimulatedLeaseStore, Arc<ShardLeaser>, ShardId) {
        let transport = MemoryTransport::new(3);
        let stream = StreamId::new("events");
        let shard = transport.create_stream(&stream, 1).remove(0);
        let store = SimulatedLeaseStore::new(3);
        let leaser = Arc::new(ShardLeaser::new(
            stream,
            InstanceId::new("node-a"),
            LeaseConfig::for_testing(),
            Arc::new(store.clone()),
        ));
        (transport, store, leaser, shard)
    }

    #[tokio::test(start_paused = true)]
    async fn test_processes_and_checkpoints() {
        let (transport, store, leaser, shard) = fixture();
        let stream = leaser.stream_id().clone();
        for n in 0..3 {
            transport
                .append(&stream, &shard, "k", format!(r#"{{"n":{n}}}"#))
                .unwrap();
        }

        let processor = Arc::new(Collect::default());
        let consumer = ShardConsumer::new(
            shard.clone(),
            Arc::clone(&leaser),
            Arc::new(transport.clone()),
            Arc::clone(&processor) as Arc<dyn MessageProcessor<Event>>,
            ConsumerConfig::for_testing(),
        );
        let handle = consumer.spawn(CancellationToken::new());

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(*processor.seen.lock().unwrap(), vec![0, 1, 2]);
        assert_eq!(
            store.checkpoint(&checkpoint_key(&stream, &shard)),
            Some(MemoryTransport::position(2))
        );
        assert_eq!(handle.phase(), ConsumerPhase::Running);

        assert_eq!(handle.stop_and_wait().await, ExitReason::Stopped);
        // A clean stop still releases the lease.
        assert_eq!(store.owner_of(&shard_lease_key(&stream, &shard)), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_shard_exits() {
        let (transport, _store, leaser, shard) = fixture();
        let stream = leaser.stream_id().clone();
        transport.append(&stream, &shard, "k", r#"{"n":1}"#).unwrap();
        transport.close_shard(&stream, &shard).unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let consumer = ShardConsumer::new(
            shard.clone(),
            leaser,
            Arc::new(transport),
            Arc::new(Collect::default()) as Arc<dyn MessageProcessor<Event>>,
            ConsumerConfig::for_testing(),
        )
        .with_lost_sender(tx);

        let reason = consumer.run(CancellationToken::new()).await;
        assert_eq!(reason, ExitReason::ShardClosed);
        let lost = rx.recv().await.unwrap();
        assert_eq!(lost.shard_id, shard);
        assert_eq!(lost.reason, ExitReason::ShardClosed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_contended_shard_is_not_consumed() {
        let (transport, store, leaser, shard) = fixture();
        let stream = leaser.stream_id().clone();
        let key = shard_lease_key(&stream, &shard);
        store.force_owner(&key, InstanceId::new("node-b"), Duration::from_secs(60));

        let consumer = ShardConsumer::new(
            shard,
            leaser,
            Arc::new(transport.clone()),
            Arc::new(Collect::default()) as Arc<dyn MessageProcessor<Event>>,
            ConsumerConfig::for_testing(),
        );
        assert_eq!(consumer.run(CancellationToken::new()).await, ExitReason::LockLost);
        assert_eq!(transport.fetch_count(), 0);
        assert_eq!(store.owner_of(&key), Some(InstanceId::new("node-b")));
    }

    #[test]
    fn test_poison_tracking_counts_repeats() {
        let mut state = LoopState::default();
        let a = PositionToken::new("100");
        let b = PositionToken::new("101");
        assert_eq!(state.observe_leading(&a), 1);
        assert_eq!(state.observe_leading(&a), 2);
        assert_eq!(state.observe_leading(&b), 1);
        assert_eq!(state.observe_leading(&b), 2);
        assert_eq!(state.observe_leading(&b), 3);
        state.reset_poison_tracking();
        assert_eq!(state.observe_leading(&b), 1);
    }
}
