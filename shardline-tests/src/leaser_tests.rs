//! Leaser tests across several instances sharing one store.

use std::sync::Arc;
use std::time::Duration;

use shardline_consumer::MemoryTransport;
use shardline_core::{InstanceId, ShardId, StreamId};
use shardline_lease::{
    shard_lease_key, LeaseConfig, LeaseStoreFaultConfig, MembershipProvider, SimulatedLeaseStore, StoreMembership,
};

use crate::scenarios::leaser;

fn stream() -> StreamId {
    StreamId::new("orders")
}

#[tokio::test(start_paused = true)]
async fn test_leaser_handoff_after_expiry() {
    let store = SimulatedLeaseStore::new(1);
    let a = leaser(&stream(), "node-a", &store);
    let b = leaser(&stream(), "node-b", &store);
    let shard = ShardId::new("shard-0000");

    assert!(a.acquire_or_renew_lock(&shard).await);
    assert!(!b.acquire_or_renew_lock(&shard).await);
    a.set_checkpoint(&shard, &MemoryTransport::position(41)).await.unwrap();

    // node-a stops renewing, as if it had crashed.
    tokio::time::advance(a.ttl() + Duration::from_millis(1)).await;
    assert!(b.acquire_or_renew_lock(&shard).await);

    // The new owner resumes from the old owner's checkpoint.
    assert_eq!(
        b.get_checkpoint(&shard).await.unwrap(),
        Some(MemoryTransport::position(41))
    );

    // The old owner can neither renew nor release the new lease.
    assert!(!a.renew_lock(&shard).await);
    a.release_lock(&shard).await.unwrap();
    let lease = b.current_lease(&shard).await.unwrap().unwrap();
    assert_eq!(lease.owner, InstanceId::new("node-b"));
}

#[tokio::test(start_paused = true)]
async fn test_leaser_renew_extends_only_own_lease() {
    let store = SimulatedLeaseStore::new(2);
    let a = leaser(&stream(), "node-a", &store);
    let b = leaser(&stream(), "node-b", &store);
    let shard = ShardId::new("shard-0001");
    let key = shard_lease_key(&stream(), &shard);

    assert!(a.acquire_or_renew_lock(&shard).await);
    let before = store.raw_lease(&key).unwrap().expires_at;

    tokio::time::advance(Duration::from_millis(500)).await;
    assert!(!b.renew_lock(&shard).await);
    assert_eq!(store.raw_lease(&key).unwrap().expires_at, before);

    assert!(a.renew_lock(&shard).await);
    assert!(store.raw_lease(&key).unwrap().expires_at > before);
}

#[tokio::test(start_paused = true)]
async fn test_leaser_release_absent_lease_is_ok() {
    let store = SimulatedLeaseStore::new(3);
    let a = leaser(&stream(), "node-a", &store);
    a.release_lock(&ShardId::new("never-held")).await.unwrap();
    a.cleanup().await;
    a.cleanup().await;
}

#[tokio::test(start_paused = true)]
async fn test_leaser_store_faults_read_as_not_owned() {
    let store = SimulatedLeaseStore::with_faults(
        4,
        LeaseStoreFaultConfig::none().with_acquire_fail_rate(1.0),
    );
    let a = leaser(&stream(), "node-a", &store);
    let shard = ShardId::new("shard-0000");

    assert!(!a.acquire_or_renew_lock(&shard).await);
    assert_eq!(store.owner_of(&shard_lease_key(&stream(), &shard)), None);
}

#[tokio::test(start_paused = true)]
async fn test_leaser_heartbeats_form_roster() {
    let store = SimulatedLeaseStore::new(5);
    let membership = StoreMembership::new(Arc::new(store.clone()));
    let leasers: Vec<_> = ["node-c", "node-a", "node-b"]
        .iter()
        .map(|name| leaser(&stream(), name, &store))
        .collect();

    for l in &leasers {
        l.start_heartbeat().await;
    }
    let roster = membership.active_instances(&stream()).await.unwrap();
    assert_eq!(
        roster,
        vec![InstanceId::new("node-a"), InstanceId::new("node-b"), InstanceId::new("node-c")]
    );

    // Heartbeats keep instances visible well past one heartbeat TTL.
    tokio::time::sleep(LeaseConfig::for_testing().heartbeat_ttl * 3).await;
    assert_eq!(membership.active_instances(&stream()).await.unwrap().len(), 3);

    leasers[0].cleanup().await;
    let roster = membership.active_instances(&stream()).await.unwrap();
    assert_eq!(roster, vec![InstanceId::new("node-a"), InstanceId::new("node-b")]);

    // Other streams do not see these instances.
    let other = membership
        .active_instances(&StreamId::new("payments"))
        .await
        .unwrap();
    assert!(other.is_empty());

    for l in &leasers[1..] {
        l.cleanup().await;
    }
}
