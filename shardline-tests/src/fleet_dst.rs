//! Fleet deterministic simulation tests.
//!
//! Several rebalancers share one in-memory stream and one simulated lease
//! store. A seeded RNG drives the roster (instances join, leave, or drop out
//! of the roster while still running), injects ghost leases, and produces
//! more messages, while the transport and the store inject faults.
//!
//! # Properties
//!
//! 1. **Exclusivity**: no shard has an active consumer on two instances at
//!    any step.
//! 2. **At-least-once**: once faults stop, every produced message is
//!    delivered.

#![allow(clippy::cast_possible_truncation)] // u64 to usize safe on 64-bit test machines
#![allow(clippy::too_many_lines)] // Test functions can be longer for clarity
#![allow(clippy::significant_drop_tightening)] // Test code clarity > drop optimization

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use shardline_consumer::{
    ConsumerConfig, ConsumerPhase, MemoryTransport, MemoryTransportFaultConfig, MessageProcessor,
    RebalancerConfig, ShardRebalancer, StreamTransport,
};
use shardline_core::{InstanceId, PutEntry, ShardId, StreamId};
use shardline_lease::{shard_lease_key, LeaseStoreFaultConfig, SimulatedLeaseStore, StaticMembership};

use crate::properties::{check_delivered, check_exclusive_consumers};
use crate::scenarios::seeds::REGRESSION_SEEDS;
use crate::scenarios::{event_payload, leaser, Behavior, Event, RecordingProcessor};

const POOL: usize = 5;
const STEPS: usize = 150;
const STEP: Duration = Duration::from_millis(100);

struct Sim {
    rng: StdRng,
    stream: StreamId,
    shards: Vec<ShardId>,
    transport: MemoryTransport,
    store: SimulatedLeaseStore,
    membership: StaticMembership,
    processor: Arc<RecordingProcessor>,
    /// Running rebalancers by instance name.
    live: BTreeMap<String, ShardRebalancer<Event>>,
    produced: u64,
}

impl Sim {
    fn new(seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let stream = StreamId::new("dst");
        let transport = MemoryTransport::with_faults(
            seed,
            MemoryTransportFaultConfig::none()
                .with_throttle_rate(0.05)
                .with_fetch_error_rate(0.05),
        );
        let shards = transport.create_stream(&stream, rng.gen_range(2..10));
        let store = SimulatedLeaseStore::with_faults(
            seed,
            LeaseStoreFaultConfig::none()
                .with_acquire_fail_rate(0.05)
                .with_renew_fail_rate(0.02)
                .with_checkpoint_fail_rate(0.02),
        );
        Self {
            rng,
            stream,
            shards,
            transport,
            store,
            membership: StaticMembership::default(),
            processor: Arc::new(RecordingProcessor::new(Behavior::Succeed)),
            live: BTreeMap::new(),
            produced: 0,
        }
    }

    fn start(&mut self, name: String) {
        let rebalancer = ShardRebalancer::new(
            leaser(&self.stream, &name, &self.store),
            Arc::new(self.transport.clone()),
            Arc::new(self.membership.clone()),
            Arc::clone(&self.processor) as Arc<dyn MessageProcessor<Event>>,
            ConsumerConfig::for_testing(),
            RebalancerConfig::for_testing(),
        );
        self.membership.add(InstanceId::new(&name));
        self.live.insert(name, rebalancer);
    }

    async fn produce(&mut self, count: u64) {
        let entries: Vec<PutEntry> = (self.produced..self.produced + count)
            .map(|n| PutEntry::new(format!("key-{}", n % 29), event_payload(n)))
            .collect();
        let outcome = self.transport.put(&self.stream, entries).await.unwrap();
        assert!(outcome.all_succeeded());
        self.produced += count;
    }

    /// One random membership or fault event.
    async fn perturb(&mut self) {
        let roll: f64 = self.rng.gen();
        if roll < 0.05 {
            // Join: start an instance from the pool that is not running.
            let idle: Vec<String> = (0..POOL)
                .map(|i| format!("node-{i}"))
                .filter(|n| !self.live.contains_key(n))
                .collect();
            if !idle.is_empty() {
                let name = idle[self.rng.gen_range(0..idle.len())].clone();
                self.start(name);
            }
        } else if roll < 0.08 {
            // Leave: graceful shutdown, keeping at least one instance.
            if self.live.len() > 1 {
                let name = self.pick_live();
                self.membership.remove(&InstanceId::new(&name));
                if let Some(mut rebalancer) = self.live.remove(&name) {
                    rebalancer.shutdown().await;
                }
            }
        } else if roll < 0.11 {
            // Isolate or restore: flip roster membership of a running instance.
            let name = self.pick_live();
            let id = InstanceId::new(&name);
            if self.membership.snapshot().contains(&id) {
                if self.membership.snapshot().len() > 1 {
                    self.membership.remove(&id);
                }
            } else {
                self.membership.add(id);
            }
        } else if roll < 0.14 {
            // Ghost lease: an unknown owner briefly grabs a shard.
            let shard = &self.shards[self.rng.gen_range(0..self.shards.len())];
            self.store.force_owner(
                &shard_lease_key(&self.stream, shard),
                InstanceId::new("ghost"),
                Duration::from_secs(1),
            );
        } else if roll < 0.34 {
            let count = self.rng.gen_range(1..20);
            self.produce(count).await;
        }
    }

    fn pick_live(&mut self) -> String {
        let names: Vec<&String> = self.live.keys().collect();
        names[self.rng.gen_range(0..names.len())].clone()
    }

    async fn tick_all(&mut self) {
        for rebalancer in self.live.values_mut() {
            // Tick failures leave consumers untouched and are retried.
            let _ = rebalancer.tick().await;
        }
    }

    /// Shards with a consumer that may still fetch, per instance.
    fn active_consumers(&self) -> Vec<(InstanceId, Vec<ShardId>)> {
        self.live
            .iter()
            .map(|(name, rebalancer)| {
                let shards = rebalancer
                    .held_shards()
                    .into_iter()
                    .filter(|s| {
                        matches!(
                            rebalancer.consumer_phase(s),
                            Some(ConsumerPhase::Initializing | ConsumerPhase::Running | ConsumerPhase::Backoff)
                        )
                    })
                    .collect();
                (InstanceId::new(name), shards)
            })
            .collect()
    }

    fn clear_faults(&self) {
        *self.transport.fault_config() = MemoryTransportFaultConfig::none();
        *self.store.fault_config() = LeaseStoreFaultConfig::none();
    }

    async fn shutdown(&mut self) {
        for rebalancer in self.live.values_mut() {
            rebalancer.shutdown().await;
        }
    }
}

async fn run_fleet(seed: u64) {
    let mut sim = Sim::new(seed);
    for i in 0..3 {
        sim.start(format!("node-{i}"));
    }
    sim.produce(50).await;

    for step in 0..STEPS {
        sim.perturb().await;
        sim.tick_all().await;
        if let Err(violation) = check_exclusive_consumers(&sim.active_consumers()) {
            panic!("seed {seed} step {step}: {violation}");
        }
        tokio::time::sleep(STEP).await;
    }

    // Quiesce: no more faults, everyone back in the roster.
    sim.clear_faults();
    for name in sim.live.keys() {
        sim.membership.add(InstanceId::new(name));
    }
    let produced = sim.produced;
    for _ in 0..200 {
        sim.tick_all().await;
        if check_delivered(produced, &sim.processor.delivered()).is_ok() {
            break;
        }
        tokio::time::sleep(STEP).await;
    }

    if let Err(violation) = check_delivered(produced, &sim.processor.delivered()) {
        panic!("seed {seed}: {violation}");
    }
    sim.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_dst_fleet_exclusive_and_at_least_once() {
    for &seed in REGRESSION_SEEDS {
        run_fleet(seed).await;
    }
}

#[tokio::test(start_paused = true)]
async fn test_dst_fleet_survives_full_turnover() {
    // Every original instance leaves and is replaced; nothing is lost.
    let mut sim = Sim::new(0x5EED);
    sim.clear_faults();
    for i in 0..2 {
        sim.start(format!("node-{i}"));
    }
    sim.produce(40).await;
    for _ in 0..10 {
        sim.tick_all().await;
        tokio::time::sleep(STEP).await;
    }

    for i in 2..4 {
        sim.start(format!("node-{i}"));
    }
    for old in ["node-0", "node-1"] {
        sim.membership.remove(&InstanceId::new(old));
        if let Some(mut rebalancer) = sim.live.remove(old) {
            rebalancer.shutdown().await;
        }
    }
    sim.produce(40).await;

    for _ in 0..50 {
        sim.tick_all().await;
        tokio::time::sleep(STEP).await;
    }
    assert!(check_delivered(sim.produced, &sim.processor.delivered()).is_ok());

    let held: usize = sim.live.values().map(|r| r.held_shards().len()).sum();
    assert_eq!(held, sim.shards.len());
    sim.shutdown().await;
}
