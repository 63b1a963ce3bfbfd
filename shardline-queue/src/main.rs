//! Shardline fleet demo.
//!
//! Runs a fleet of queue instances in one process over the in-memory stream
//! and the simulated lease store, produces a batch of messages, and reports
//! how many were delivered once the fleet has drained the stream.
//!
//! # Fixed Fleet
//!
//! ```bash
//! shardline --instances 3 --shards 8 --messages 1000
//! ```
//!
//! # Membership Changes
//!
//! Shut one instance down part way through and add another later. The
//! remaining instances take over the released shards from their checkpoints:
//!
//! ```bash
//! shardline --instances 3 --leave-after-secs 3 --join-after-secs 6
//! ```
//!
//! # Custom Settings
//!
//! ```bash
//! shardline --config shardline.toml --log-level debug
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use clap::Parser;
use serde::{Deserialize, Serialize};
use shardline_consumer::{Message, MemoryTransport, MessageProcessor, ProcessError};
use shardline_core::StreamId;
use shardline_lease::SimulatedLeaseStore;
use shardline_queue::{Queue, QueueConfig, QueueResult};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Shardline fleet demo.
#[derive(Parser, Debug)]
#[command(name = "shardline")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Number of instances started at launch.
    #[arg(long, default_value = "3")]
    instances: u32,

    /// Number of shards in the stream.
    #[arg(long, default_value = "8")]
    shards: u32,

    /// Number of messages to produce.
    #[arg(long, default_value = "1000")]
    messages: u64,

    /// Give up after this many seconds.
    #[arg(long, default_value = "20")]
    duration_secs: u64,

    /// Shut the first instance down after this many seconds.
    #[arg(long)]
    leave_after_secs: Option<u64>,

    /// Start one extra instance after this many seconds.
    #[arg(long)]
    join_after_secs: Option<u64>,

    /// Seed for the simulated stream and store.
    #[arg(long, default_value = "42")]
    seed: u64,

    /// Queue configuration file (TOML). Test timings are used when absent.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log level, used when `RUST_LOG` is not set.
    #[arg(long, default_value = "info")]
    log_level: Level,
}

/// Body of every demo message.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct DemoMessage {
    seq: u64,
}

/// Records every delivery, counting redeliveries separately.
#[derive(Default)]
struct CountingProcessor {
    delivered: AtomicU64,
    seen: Mutex<HashSet<u64>>,
}

impl CountingProcessor {
    fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    fn unique(&self) -> usize {
        self.seen.lock().map(|seen| seen.len()).unwrap_or_default()
    }
}

#[async_trait]
impl MessageProcessor<DemoMessage> for CountingProcessor {
    async fn process(
        &self,
        consumer_tag: &str,
        messages: Vec<Message<DemoMessage>>,
        _cancel: CancellationToken,
    ) -> Result<(), ProcessError> {
        let count = messages.len() as u64;
        let mut seen = self
            .seen
            .lock()
            .map_err(|_| ProcessError::failed("delivery log poisoned"))?;
        for message in &messages {
            seen.insert(message.body.seq);
        }
        drop(seen);
        self.delivered.fetch_add(count, Ordering::Relaxed);
        tracing::debug!(consumer = consumer_tag, count, "Processed batch");
        Ok(())
    }
}

fn instance_config(base: &QueueConfig, index: u32) -> QueueConfig {
    let mut config = base.clone();
    config.instance = format!("node-{index}");
    config
}

async fn start_instance(
    base: &QueueConfig,
    index: u32,
    transport: &MemoryTransport,
    store: &SimulatedLeaseStore,
    processor: &Arc<CountingProcessor>,
) -> QueueResult<Queue> {
    let queue = Queue::new(
        instance_config(base, index),
        Arc::new(transport.clone()),
        Arc::new(store.clone()),
    )?;
    queue.consume(Arc::clone(processor) as Arc<dyn MessageProcessor<DemoMessage>>).await?;
    info!(instance = %queue.instance_id(), "Instance started");
    Ok(queue)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // RUST_LOG wins over --log-level when set.
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(args.log_level.to_string()));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let base = match &args.config {
        Some(path) => QueueConfig::from_file(path)?,
        None => QueueConfig::for_testing("demo", "node-0"),
    };
    base.validate()?;

    info!(
        stream = %base.stream,
        instances = args.instances,
        shards = args.shards,
        messages = args.messages,
        seed = args.seed,
        "Starting Shardline fleet demo"
    );

    let transport = MemoryTransport::new(args.seed);
    let store = SimulatedLeaseStore::new(args.seed);
    let stream_id = StreamId::new(&base.stream);
    transport.create_stream(&stream_id, args.shards);

    let processor = Arc::new(CountingProcessor::default());
    let mut fleet = Vec::with_capacity(args.instances as usize + 1);
    for index in 0..args.instances {
        fleet.push(start_instance(&base, index, &transport, &store, &processor).await?);
    }

    let mut producer_config = base.clone();
    producer_config.instance = "producer".to_string();
    let producer = Queue::new(
        producer_config,
        Arc::new(transport.clone()),
        Arc::new(store.clone()),
    )?;
    let batch = (0..args.messages).map(|seq| (format!("key-{}", seq % 64), DemoMessage { seq }));
    let failed = producer.produce(batch).await?;
    if !failed.is_empty() {
        warn!(failed = failed.len(), "Some messages were rejected by the stream");
    }
    let expected = args.messages as usize - failed.len();

    let started = Instant::now();
    let deadline = started + Duration::from_secs(args.duration_secs);
    let mut left = args.leave_after_secs.is_none();
    let mut joined = args.join_after_secs.is_none();
    let mut ticker = tokio::time::interval(Duration::from_millis(250));

    loop {
        ticker.tick().await;
        let elapsed = started.elapsed().as_secs();

        if !left && args.leave_after_secs.is_some_and(|at| elapsed >= at) {
            left = true;
            if !fleet.is_empty() {
                let leaving = fleet.remove(0);
                info!(instance = %leaving.instance_id(), "Instance leaving");
                leaving.shutdown().await;
            }
        }
        if !joined && args.join_after_secs.is_some_and(|at| elapsed >= at) {
            joined = true;
            fleet.push(start_instance(&base, args.instances, &transport, &store, &processor).await?);
        }

        if processor.unique() >= expected && left && joined {
            break;
        }
        if Instant::now() >= deadline {
            warn!("Deadline reached before the stream was drained");
            break;
        }
    }

    for queue in &fleet {
        queue.shutdown().await;
    }
    producer.shutdown().await;

    let unique = processor.unique();
    let delivered = processor.delivered();
    info!(
        expected,
        unique,
        delivered,
        redelivered = delivered.saturating_sub(unique as u64),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "Fleet demo finished"
    );

    if unique < expected {
        return Err(format!("only {unique} of {expected} messages were delivered").into());
    }
    Ok(())
}
