//! Periodic shard rebalancing.
//!
//! The rebalancer is the single writer of the held-shard set. On each tick it
//! reaps consumers that exited on their own, recomputes the assignment, stops
//! consumers for shards it no longer targets, and starts consumers for newly
//! targeted shards it manages to lease.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use futures::future::join_all;
use serde::de::DeserializeOwned;
use shardline_core::{ShardId, StreamId};
use shardline_flow::AdaptiveStrategy;
use shardline_lease::{MembershipProvider, ShardLeaser};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{ConsumerConfig, RebalancerConfig};
use crate::consumer::{ConsumerHandle, ShardConsumer};
use crate::error::ConsumerResult;
use crate::listener::{ConsumerListener, NoopListener};
use crate::manager::ShardManager;
use crate::processor::MessageProcessor;
use crate::state::{ConsumerPhase, ExitReason, ShardLost};
use crate::transport::StreamTransport;

/// What one rebalance tick changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RebalanceOutcome {
    /// Consumers started this tick.
    pub started: Vec<ShardId>,
    /// Consumers stopped because their shard is no longer targeted.
    pub stopped: Vec<ShardId>,
    /// Targeted shards not started: leased elsewhere or over capacity.
    pub skipped: Vec<ShardId>,
    /// Consumers that had exited on their own since the last tick.
    pub lost: Vec<ShardId>,
}

impl RebalanceOutcome {
    /// Returns true if the tick changed nothing.
    #[must_use]
    pub fn is_noop(&self) -> bool {
        self.started.is_empty()
            && self.stopped.is_empty()
            && self.skipped.is_empty()
            && self.lost.is_empty()
    }
}

/// Keeps this instance's consumers in line with its share of the stream.
pub struct ShardRebalancer<T> {
    stream_id: StreamId,
    leaser: Arc<ShardLeaser>,
    manager: ShardManager,
    membership: Arc<dyn MembershipProvider>,
    transport: Arc<dyn StreamTransport>,
    processor: Arc<dyn MessageProcessor<T>>,
    strategy: Option<Arc<dyn AdaptiveStrategy>>,
    listener: Arc<dyn ConsumerListener>,
    consumer_config: ConsumerConfig,
    config: RebalancerConfig,
    consumers: HashMap<ShardId, ConsumerHandle>,
    held: BTreeSet<ShardId>,
    closed: BTreeSet<ShardId>,
    lost_tx: mpsc::UnboundedSender<ShardLost>,
    lost_rx: mpsc::UnboundedReceiver<ShardLost>,
    cancel: CancellationToken,
}

impl<T> ShardRebalancer<T>
where
    T: DeserializeOwned + Send + 'static,
{
    /// Creates a rebalancer for the leaser's stream and instance.
    #[must_use]
    pub fn new(
        leaser: Arc<ShardLeaser>,
        transport: Arc<dyn StreamTransport>,
        membership: Arc<dyn MembershipProvider>,
        processor: Arc<dyn MessageProcessor<T>>,
        consumer_config: ConsumerConfig,
        config: RebalancerConfig,
    ) -> Self {
        let (lost_tx, lost_rx) = mpsc::unbounded_channel();
        Self {
            stream_id: leaser.stream_id().clone(),
            manager: ShardManager::new(leaser.instance_id().clone(), Arc::clone(&transport)),
            leaser,
            membership,
            transport,
            processor,
            strategy: None,
            listener: Arc::new(NoopListener),
            consumer_config,
            config,
            consumers: HashMap::new(),
            held: BTreeSet::new(),
            closed: BTreeSet::new(),
            lost_tx,
            lost_rx,
            cancel: CancellationToken::new(),
        }
    }

    /// Builder: give every consumer this adaptive strategy.
    #[must_use]
    pub fn with_strategy(mut self, strategy: Arc<dyn AdaptiveStrategy>) -> Self {
        self.strategy = Some(strategy);
        self
    }

    /// Builder: give every consumer this listener.
    #[must_use]
    pub fn with_listener(mut self, listener: Arc<dyn ConsumerListener>) -> Self {
        self.listener = listener;
        self
    }

    /// Builder: stop when `cancel` is cancelled.
    #[must_use]
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Token that stops the run loop and every consumer.
    #[must_use]
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Returns the stream.
    #[must_use]
    pub const fn stream_id(&self) -> &StreamId {
        &self.stream_id
    }

    /// Returns the shards this instance currently holds, sorted.
    #[must_use]
    pub fn held_shards(&self) -> Vec<ShardId> {
        self.held.iter().cloned().collect()
    }

    /// Returns the phase of the consumer for `shard_id`, if one is running.
    #[must_use]
    pub fn consumer_phase(&self, shard_id: &ShardId) -> Option<ConsumerPhase> {
        self.consumers.get(shard_id).map(ConsumerHandle::phase)
    }

    /// Returns the consumer handle for `shard_id`.
    #[must_use]
    pub fn consumer(&self, shard_id: &ShardId) -> Option<&ConsumerHandle> {
        self.consumers.get(shard_id)
    }

    /// Runs one rebalance round.
    ///
    /// # Errors
    ///
    /// Returns an error if the shard list or the roster cannot be read. The
    /// running consumers are left untouched in that case.
    pub async fn tick(&mut self) -> ConsumerResult<RebalanceOutcome> {
        let mut outcome = RebalanceOutcome::default();
        self.reap(&mut outcome);

        let shards: Vec<ShardId> = self
            .manager
            .list_shards(&self.stream_id)
            .await?
            .into_iter()
            .filter(|s| !self.closed.contains(s))
            .collect();

        let mut roster = self.membership.active_instances(&self.stream_id).await?;
        roster.sort();
        roster.dedup();
        let max_instances = self.config.max_instances as usize;
        if roster.len() > max_instances {
            warn!(
                stream = %self.stream_id,
                instances = roster.len(),
                max = max_instances,
                "Roster exceeds instance limit, truncating"
            );
            roster.truncate(max_instances);
        }

        let assignment = self
            .manager
            .calculate_shard_assignment(&shards, &roster, &self.held);

        self.stop_consumers(&assignment.shards_to_release).await;
        outcome.stopped = assignment.shards_to_release;

        for shard in assignment.target_shards {
            if self.consumers.contains_key(&shard) {
                continue;
            }
            if self.consumers.len() >= self.config.max_held_shards as usize {
                warn!(
                    shard = %shard,
                    max = self.config.max_held_shards,
                    "Consumer registry full"
                );
                outcome.skipped.push(shard);
                continue;
            }
            if !self.leaser.acquire_or_renew_lock(&shard).await {
                outcome.skipped.push(shard);
                continue;
            }
            self.start_consumer(shard.clone());
            outcome.started.push(shard);
        }

        Ok(outcome)
    }

    /// Ticks on the configured interval until cancelled, then shuts down.
    pub async fn run(mut self) {
        let cancel = self.cancel.clone();
        let mut ticker = tokio::time::interval(self.config.interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        info!(
            stream = %self.stream_id,
            instance = %self.leaser.instance_id(),
            interval_ms = self.config.interval_ms,
            "Rebalancer starting"
        );
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = ticker.tick() => match self.tick().await {
                    Ok(outcome) if !outcome.is_noop() => info!(
                        stream = %self.stream_id,
                        started = outcome.started.len(),
                        stopped = outcome.stopped.len(),
                        skipped = outcome.skipped.len(),
                        lost = outcome.lost.len(),
                        held = self.held.len(),
                        "Rebalanced"
                    ),
                    Ok(_) => {}
                    Err(e) => warn!(stream = %self.stream_id, error = %e, "Rebalance failed"),
                }
            }
        }
        self.shutdown().await;
    }

    /// Stops every consumer and waits for all of them to drain.
    pub async fn shutdown(&mut self) {
        let shards: Vec<ShardId> = self.consumers.keys().cloned().collect();
        self.stop_consumers(&shards).await;
        self.held.clear();
        info!(stream = %self.stream_id, "Rebalancer stopped");
    }

    fn start_consumer(&mut self, shard_id: ShardId) {
        let mut consumer = ShardConsumer::new(
            shard_id.clone(),
            Arc::clone(&self.leaser),
            Arc::clone(&self.transport),
            Arc::clone(&self.processor),
            self.consumer_config.clone(),
        )
        .with_listener(Arc::clone(&self.listener))
        .with_lost_sender(self.lost_tx.clone());
        if let Some(strategy) = &self.strategy {
            consumer = consumer.with_strategy(Arc::clone(strategy));
        }

        let handle = consumer.spawn(self.cancel.child_token());
        debug!(shard = %shard_id, "Started shard consumer");
        self.consumers.insert(shard_id.clone(), handle);
        self.held.insert(shard_id);
    }

    async fn stop_consumers(&mut self, shards: &[ShardId]) {
        let mut handles = Vec::with_capacity(shards.len());
        for shard in shards {
            self.held.remove(shard);
            if let Some(handle) = self.consumers.remove(shard) {
                handle.stop();
                handles.push(handle);
            }
        }
        let stopped = join_all(handles.into_iter().map(|handle| async move {
            let shard = handle.shard_id().clone();
            (shard, handle.wait().await)
        }))
        .await;
        for (shard, reason) in stopped {
            self.forget_flow(&shard);
            debug!(shard = %shard, %reason, "Stopped shard consumer");
        }
    }

    fn forget_flow(&self, shard_id: &ShardId) {
        if let Some(strategy) = &self.strategy {
            strategy.forget(shard_id);
        }
    }

    /// Drops consumers that exited on their own.
    fn reap(&mut self, outcome: &mut RebalanceOutcome) {
        while let Ok(lost) = self.lost_rx.try_recv() {
            info!(shard = %lost.shard_id, reason = %lost.reason, "Shard lost");
            if lost.reason == ExitReason::ShardClosed {
                self.closed.insert(lost.shard_id);
            }
        }

        let finished: Vec<ShardId> = self
            .consumers
            .iter()
            .filter(|(_, h)| h.is_finished())
            .map(|(s, _)| s.clone())
            .collect();
        for shard in finished {
            self.consumers.remove(&shard);
            self.held.remove(&shard);
            self.forget_flow(&shard);
            outcome.lost.push(shard);
        }
        outcome.lost.sort();
    }
}

impl<T> std::fmt::Debug for ShardRebalancer<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardRebalancer")
            .field("stream_id", &self.stream_id)
            .field("held", &self.held)
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;
    use shardline_core::InstanceId;
    use shardline_lease::{shard_lease_key, LeaseConfig, SimulatedLeaseStore, StaticMembership};

    use super::*;
    use crate::error::ProcessError;
    use crate::processor::Message;
    use crate::transport::MemoryTransport;

    struct Discard;

    #[async_trait]
    impl MessageProcessor<serde_json::Value> for Discard {
        async fn process(
            &self,
            _consumer_tag: &str,
            _messages: Vec<Message<serde_json::Value>>,
            _cancel: CancellationToken,
        ) -> Result<(), ProcessError> {
            Ok(())
        }
    }

    fn rebalancer(
        name: &str,
        transport: &MemoryTransport,
        store: &SimulatedLeaseStore,
        membership: &StaticMembership,
    ) -> ShardRebalancer<serde_json::Value> {
        let leaser = Arc::new(ShardLeaser::new(
            StreamId::new("s"),
            InstanceId::new(name),
            LeaseConfig::for_testing(),
            Arc::new(store.clone()),
        ));
        ShardRebalancer::new(
            leaser,
            Arc::new(transport.clone()),
            Arc::new(membership.clone()),
            Arc::new(Discard),
            ConsumerConfig::for_testing(),
            RebalancerConfig::for_testing(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_tick_starts_target_shards() {
        let transport = MemoryTransport::new(1);
        let shards = transport.create_stream(&StreamId::new("s"), 4);
        let store = SimulatedLeaseStore::new(1);
        let membership = StaticMembership::new(["a", "b"].map(InstanceId::new));

        let mut a = rebalancer("a", &transport, &store, &membership);
        let outcome = a.tick().await.unwrap();
        assert_eq!(outcome.started, shards[..2].to_vec());
        assert_eq!(a.held_shards(), shards[..2].to_vec());

        // Idempotent: a second tick starts nothing.
        let outcome = a.tick().await.unwrap();
        assert!(outcome.is_noop());

        a.shutdown().await;
        assert!(a.held_shards().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_contended_shard_is_skipped() {
        let transport = MemoryTransport::new(1);
        let stream = StreamId::new("s");
        let shards = transport.create_stream(&stream, 2);
        let store = SimulatedLeaseStore::new(1);
        store.force_owner(
            &shard_lease_key(&stream, &shards[1]),
            InstanceId::new("old"),
            Duration::from_secs(5),
        );
        let membership = StaticMembership::new([InstanceId::new("a")]);

        let mut a = rebalancer("a", &transport, &store, &membership);
        let outcome = a.tick().await.unwrap();
        assert_eq!(outcome.started, vec![shards[0].clone()]);
        assert_eq!(outcome.skipped, vec![shards[1].clone()]);

        // The stale lease expires and the next tick picks the shard up.
        tokio::time::sleep(Duration::from_secs(6)).await;
        let outcome = a.tick().await.unwrap();
        assert_eq!(outcome.started, vec![shards[1].clone()]);

        a.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_roster_change_releases_shards() {
        let transport = MemoryTransport::new(1);
        let shards = transport.create_stream(&StreamId::new("s"), 4);
        let store = SimulatedLeaseStore::new(1);
        let membership = StaticMembership::new([InstanceId::new("a")]);

        let mut a = rebalancer("a", &transport, &store, &membership);
        assert_eq!(a.tick().await.unwrap().started.len(), 4);

        membership.add(InstanceId::new("b"));
        let outcome = a.tick().await.unwrap();
        assert_eq!(outcome.stopped, shards[2..].to_vec());
        assert_eq!(a.held_shards(), shards[..2].to_vec());

        a.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_shard_not_restarted() {
        let transport = MemoryTransport::new(1);
        let stream = StreamId::new("s");
        let shards = transport.create_stream(&stream, 1);
        transport.close_shard(&stream, &shards[0]).unwrap();
        let store = SimulatedLeaseStore::new(1);
        let membership = StaticMembership::new([InstanceId::new("a")]);

        let mut a = rebalancer("a", &transport, &store, &membership);
        assert_eq!(a.tick().await.unwrap().started, shards);

        tokio::time::sleep(Duration::from_millis(100)).await;
        let outcome = a.tick().await.unwrap();
        assert_eq!(outcome.lost, shards);
        assert!(outcome.started.is_empty());

        let outcome = a.tick().await.unwrap();
        assert!(outcome.is_noop());
    }
}
