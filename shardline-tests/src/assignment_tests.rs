//! Assignment partitioning tests.
//!
//! Every instance computes its own target set from the same inputs, so the
//! sets must partition the shards without any coordination.

use std::collections::BTreeSet;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use shardline_consumer::compute_assignment;
use shardline_core::{InstanceId, ShardId};

use crate::properties::check_assignment_partition;
use crate::scenarios::seeds::REGRESSION_SEEDS;

fn shards(n: usize) -> Vec<ShardId> {
    (0..n).map(|i| ShardId::new(format!("shard-{i:04}"))).collect()
}

fn instances(n: usize) -> Vec<InstanceId> {
    (0..n).map(|i| InstanceId::new(format!("node-{i}"))).collect()
}

#[test]
fn test_assignment_partitions_random_fleets() {
    for &seed in REGRESSION_SEEDS {
        let mut rng = StdRng::seed_from_u64(seed);
        for _ in 0..50 {
            let shard_count = rng.gen_range(0..40);
            let instance_count = rng.gen_range(1..12);
            let result = check_assignment_partition(&shards(shard_count), &instances(instance_count));
            assert!(
                result.is_ok(),
                "seed {seed}: {shard_count} shards / {instance_count} instances: {}",
                result.unwrap_err()
            );
        }
    }
}

#[test]
fn test_assignment_ignores_input_order() {
    let mut rng = StdRng::seed_from_u64(7);
    let all_shards = shards(17);
    let roster = instances(5);
    let me = roster[2].clone();
    let expected = compute_assignment(&all_shards, &roster, &BTreeSet::new(), &me);

    for _ in 0..20 {
        let mut s = all_shards.clone();
        let mut r = roster.clone();
        s.shuffle(&mut rng);
        r.shuffle(&mut rng);
        assert_eq!(compute_assignment(&s, &r, &BTreeSet::new(), &me), expected);
    }
}

#[test]
fn test_assignment_is_idempotent() {
    let all_shards = shards(12);
    let roster = instances(3);
    let me = roster[1].clone();

    let first = compute_assignment(&all_shards, &roster, &BTreeSet::new(), &me);
    let held: BTreeSet<ShardId> = first.target_shards.iter().cloned().collect();
    let second = compute_assignment(&all_shards, &roster, &held, &me);

    assert_eq!(second.target_shards, first.target_shards);
    assert!(second.shards_to_release.is_empty());
}

#[test]
fn test_assignment_removing_instance_moves_all_shards() {
    let all_shards = shards(10);
    let roster = instances(2);

    let before = compute_assignment(&all_shards, &roster, &BTreeSet::new(), &roster[0]);
    assert_eq!(before.target_shards, all_shards[..5].to_vec());

    let held: BTreeSet<ShardId> = before.target_shards.iter().cloned().collect();
    let after = compute_assignment(&all_shards, &roster[..1], &held, &roster[0]);
    assert_eq!(after.target_shards, all_shards);
    assert!(after.shards_to_release.is_empty());
}

#[test]
fn test_assignment_absent_instance_releases_everything() {
    let all_shards = shards(6);
    let roster = instances(3);
    let outsider = InstanceId::new("node-9");
    let held: BTreeSet<ShardId> = all_shards[..2].iter().cloned().collect();

    let assignment = compute_assignment(&all_shards, &roster, &held, &outsider);
    assert!(assignment.target_shards.is_empty());
    assert_eq!(assignment.shards_to_release, all_shards[..2].to_vec());
}

#[test]
fn test_assignment_growth_only_moves_tail_blocks() {
    // Going from 2 to 3 instances, node-0 keeps a prefix of what it had.
    let all_shards = shards(12);
    let before = compute_assignment(&all_shards, &instances(2), &BTreeSet::new(), &instances(2)[0]);
    let held: BTreeSet<ShardId> = before.target_shards.iter().cloned().collect();
    let after = compute_assignment(&all_shards, &instances(3), &held, &instances(3)[0]);

    assert_eq!(after.target_shards, all_shards[..4].to_vec());
    assert_eq!(after.shards_to_release, all_shards[4..6].to_vec());
}
