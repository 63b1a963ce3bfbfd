//! User message processing.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use shardline_core::{PositionToken, ShardId, StreamRecord};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::error::ProcessError;

/// A decoded stream record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message<T> {
    /// Shard the record came from.
    pub shard_id: ShardId,
    /// Position of the record.
    pub position: PositionToken,
    /// Partition key the producer supplied.
    pub partition_key: String,
    /// Decoded body.
    pub body: T,
}

/// Handles batches of decoded messages.
///
/// Delivery is at-least-once: a batch is redelivered after a failure, a
/// timeout, or a change of shard owner before its checkpoint was written.
/// Implementations must tolerate seeing a message more than once.
///
/// `cancel` is cancelled when the call exceeds its deadline or the consumer
/// stops; the future is dropped right after, so long-running work should
/// watch the token to stop side effects early.
#[async_trait]
pub trait MessageProcessor<T>: Send + Sync {
    /// Processes one batch.
    ///
    /// `consumer_tag` identifies the instance and shard, for logging.
    async fn process(
        &self,
        consumer_tag: &str,
        messages: Vec<Message<T>>,
        cancel: CancellationToken,
    ) -> Result<(), ProcessError>;
}

/// Decodes JSON payloads, logging and dropping records that fail to decode.
#[must_use]
pub fn decode_batch<T: DeserializeOwned>(shard_id: &ShardId, records: &[StreamRecord]) -> Vec<Message<T>> {
    records
        .iter()
        .filter_map(|record| match serde_json::from_slice::<T>(&record.payload) {
            Ok(body) => Some(Message {
                shard_id: shard_id.clone(),
                position: record.position.clone(),
                partition_key: record.partition_key.clone(),
                body,
            }),
            Err(e) => {
                warn!(
                    shard = %shard_id,
                    position = %record.position,
                    error = %e,
                    "Dropping undecodable record"
                );
                None
            }
        })
        .collect()
}
