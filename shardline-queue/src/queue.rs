//! Queue facade: produce, consume, shutdown.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use shardline_consumer::{
    ConsumerListener, MessageProcessor, NoopListener, ShardRebalancer, StreamTransport,
};
use shardline_core::{InstanceId, PutEntry, StreamId};
use shardline_flow::{AdaptiveStrategy, AimdStrategy};
use shardline_lease::{LeaseStore, MembershipProvider, ShardLeaser, StoreMembership};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::QueueConfig;
use crate::error::{QueueError, QueueResult};

/// Running consumer side of a queue.
struct Consuming {
    cancel: CancellationToken,
    join: JoinHandle<()>,
}

/// One instance's view of a stream.
///
/// A queue produces to the stream directly and, once `consume` is called,
/// takes part in consuming it: it publishes a heartbeat, and its rebalancer
/// claims this instance's share of the shards.
pub struct Queue {
    config: QueueConfig,
    stream_id: StreamId,
    transport: Arc<dyn StreamTransport>,
    leaser: Arc<ShardLeaser>,
    membership: Arc<dyn MembershipProvider>,
    listener: Arc<dyn ConsumerListener>,
    strategy: Option<Arc<dyn AdaptiveStrategy>>,
    consuming: Mutex<Option<Consuming>>,
    shut_down: AtomicBool,
}

impl Queue {
    /// Creates a queue over `transport` and `store`.
    ///
    /// Membership defaults to live heartbeats in `store`.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn new(
        config: QueueConfig,
        transport: Arc<dyn StreamTransport>,
        store: Arc<dyn LeaseStore>,
    ) -> QueueResult<Self> {
        config.validate()?;
        let stream_id = StreamId::new(&config.stream);
        let leaser = Arc::new(ShardLeaser::new(
            stream_id.clone(),
            InstanceId::new(&config.instance),
            config.lease_config(),
            Arc::clone(&store),
        ));
        let strategy: Option<Arc<dyn AdaptiveStrategy>> = if config.adaptive {
            Some(Arc::new(AimdStrategy::new(config.flow.clone())))
        } else {
            None
        };
        Ok(Self {
            config,
            stream_id,
            transport,
            leaser,
            membership: Arc::new(StoreMembership::new(store)),
            listener: Arc::new(NoopListener),
            strategy,
            consuming: Mutex::new(None),
            shut_down: AtomicBool::new(false),
        })
    }

    /// Builder: use a different membership provider.
    #[must_use]
    pub fn with_membership(mut self, membership: Arc<dyn MembershipProvider>) -> Self {
        self.membership = membership;
        self
    }

    /// Builder: set the consumer lifecycle listener.
    #[must_use]
    pub fn with_listener(mut self, listener: Arc<dyn ConsumerListener>) -> Self {
        self.listener = listener;
        self
    }

    /// Builder: use a custom adaptive strategy.
    #[must_use]
    pub fn with_strategy(mut self, strategy: Arc<dyn AdaptiveStrategy>) -> Self {
        self.strategy = Some(strategy);
        self
    }

    /// Returns the stream.
    #[must_use]
    pub const fn stream_id(&self) -> &StreamId {
        &self.stream_id
    }

    /// Returns the instance identity.
    #[must_use]
    pub fn instance_id(&self) -> &InstanceId {
        self.leaser.instance_id()
    }

    /// Returns the configuration.
    #[must_use]
    pub const fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Returns true once `consume` has started and before `shutdown`.
    pub async fn is_consuming(&self) -> bool {
        self.consuming.lock().await.is_some()
    }

    fn ensure_open(&self) -> QueueResult<()> {
        if self.shut_down.load(Ordering::Acquire) {
            return Err(QueueError::ShutDown);
        }
        Ok(())
    }

    /// Serializes `messages` as JSON and writes them, each routed by its
    /// partition key.
    ///
    /// Returns the indexes of messages the transport did not accept. Those
    /// are not retried.
    ///
    /// # Errors
    ///
    /// Returns an error if the queue is shut down, a message cannot be
    /// encoded, or a transport call fails outright.
    pub async fn produce<M, K>(&self, messages: impl IntoIterator<Item = (K, M)>) -> QueueResult<Vec<usize>>
    where
        M: Serialize,
        K: Into<String>,
    {
        self.ensure_open()?;
        let entries = messages
            .into_iter()
            .enumerate()
            .map(|(index, (key, message))| {
                serde_json::to_vec(&message)
                    .map(|payload| PutEntry::new(key, Bytes::from(payload)))
                    .map_err(|source| QueueError::Encode { index, source })
            })
            .collect::<QueueResult<Vec<PutEntry>>>()?;

        let chunk_size = self.config.max_put_records.max(1) as usize;
        let mut failed = Vec::new();
        let mut offset = 0;
        let total = entries.len();
        let mut remaining = entries.into_iter();
        while offset < total {
            let chunk: Vec<PutEntry> = remaining.by_ref().take(chunk_size).collect();
            let len = chunk.len();
            let outcome = self.transport.put(&self.stream_id, chunk).await?;
            failed.extend(outcome.failed_indexes.into_iter().map(|i| offset + i));
            offset += len;
        }

        if !failed.is_empty() {
            warn!(stream = %self.stream_id, failed = failed.len(), total, "Some messages were not accepted");
        }
        debug!(stream = %self.stream_id, total, "Produced messages");
        Ok(failed)
    }

    /// Starts consuming with `processor`.
    ///
    /// Publishes this instance's heartbeat and starts the rebalancer in the
    /// background.
    ///
    /// # Errors
    ///
    /// Returns an error if the queue is shut down or already consuming.
    pub async fn consume<T>(&self, processor: Arc<dyn MessageProcessor<T>>) -> QueueResult<()>
    where
        T: DeserializeOwned + Send + 'static,
    {
        self.ensure_open()?;
        let mut consuming = self.consuming.lock().await;
        if consuming.is_some() {
            return Err(QueueError::AlreadyConsuming);
        }

        self.leaser.start_heartbeat().await;

        let cancel = CancellationToken::new();
        let mut rebalancer = ShardRebalancer::new(
            Arc::clone(&self.leaser),
            Arc::clone(&self.transport),
            Arc::clone(&self.membership),
            processor,
            self.config.consumer.clone(),
            self.config.rebalancer.clone(),
        )
        .with_listener(Arc::clone(&self.listener))
        .with_cancel(cancel.clone());
        if let Some(strategy) = &self.strategy {
            rebalancer = rebalancer.with_strategy(Arc::clone(strategy));
        }

        let join = tokio::spawn(rebalancer.run());
        *consuming = Some(Consuming { cancel, join });
        info!(stream = %self.stream_id, instance = %self.instance_id(), "Queue consuming");
        Ok(())
    }

    /// Stops consuming and releases everything this instance holds.
    ///
    /// Stops the rebalancer, which drains every shard consumer, then stops
    /// the heartbeat. Idempotent.
    pub async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        let consuming = self.consuming.lock().await.take();
        if let Some(Consuming { cancel, join }) = consuming {
            cancel.cancel();
            if let Err(e) = join.await {
                warn!(stream = %self.stream_id, error = %e, "Rebalancer task failed");
            }
        }
        self.leaser.cleanup().await;
        info!(stream = %self.stream_id, instance = %self.instance_id(), "Queue shut down");
    }
}

impl std::fmt::Debug for Queue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Queue")
            .field("stream_id", &self.stream_id)
            .field("instance_id", self.leaser.instance_id())
            .finish_non_exhaustive()
    }
}
