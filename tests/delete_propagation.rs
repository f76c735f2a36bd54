//! Delete Propagation Tests
//!
//! Tombstones replicated from the primary:
//! - Completion only after every target acknowledged, in any order
//! - A target already holding a newer version keeps it
//! - Unreachable targets are re-sent the tombstone on reconnect

mod harness;

use harness::{full_object, key, shard, Cluster, Order};
use shard_recovery::replication::{
    MessageBody, MissingItem, ObjectKey, RecoveryConfig, RecoveryOutcome, ShardId, VersionStamp,
};

fn created() -> VersionStamp {
    VersionStamp::new(1, 2)
}

fn deleted() -> VersionStamp {
    VersionStamp::new(1, 9)
}

/// `object` on every shard; every replica must learn of the delete.
fn delete_setup(cluster: &Cluster, object: &ObjectKey) {
    for s in &cluster.shards {
        s.store
            .insert(object.clone(), full_object(1, created(), 1024, 2));
        if s.id != shard(0) {
            cluster
                .membership
                .add_missing(s.id, object.clone(), MissingItem::whole(deleted()));
        }
    }
}

// =============================================================================
// Acknowledgment
// =============================================================================

/// Replies arrive out of order; pending shrinks one at a time.
#[test]
fn test_delete_completes_after_all_acks_in_any_order() {
    let mut cluster = Cluster::new(4, RecoveryConfig::default());
    let object = key("victim");
    delete_setup(&cluster, &object);

    let mut completion = cluster.backend(0).recover_delete(object.clone(), deleted());
    assert!(!cluster.store(0).contains(&object));

    let requests = cluster.take_queued();
    assert_eq!(requests.len(), 3);
    assert!(requests
        .iter()
        .all(|(_, m)| matches!(&m.body, MessageBody::Delete(r) if r.version == deleted())));
    for (to, message) in requests {
        cluster.deliver(to, message);
    }

    let mut replies = cluster.take_queued();
    assert_eq!(replies.len(), 3);
    replies.sort_by_key(|(_, m)| match m.from.value() {
        3 => 0,
        1 => 1,
        _ => 2,
    });

    let mut expected_pending = 3;
    for (to, message) in replies {
        assert!(completion.try_result().is_none());
        let from: ShardId = message.from;
        cluster.deliver(to, message);
        expected_pending -= 1;
        if expected_pending > 0 {
            let pending = cluster.shard(0).backend.pending_deletes(&object).unwrap();
            assert_eq!(pending.len(), expected_pending);
            assert!(!pending.contains(&from));
        }
    }

    assert_eq!(completion.try_result(), Some(Ok(RecoveryOutcome::Recovered)));
    assert!(cluster.shard(0).backend.pending_deletes(&object).is_none());
    for s in &cluster.shards {
        assert!(!s.store.contains(&object), "{} still holds the object", s.id);
        assert!(!cluster.membership.is_missing(s.id, &object));
    }
    assert_eq!(cluster.shard(0).metrics.snapshot().deletes_propagated, 1);
    cluster.assert_idle();
}

/// A target holding a newer version answers without deleting it.
#[test]
fn test_newer_target_version_is_kept() {
    let mut cluster = Cluster::new(3, RecoveryConfig::default());
    let object = key("resurrected");
    delete_setup(&cluster, &object);
    let newer = VersionStamp::new(1, 12);
    cluster
        .store(2)
        .insert(object.clone(), full_object(2, newer, 512, 0));

    let mut completion = cluster.backend(0).recover_delete(object.clone(), deleted());
    cluster.pump(Order::Shuffled(5));

    assert_eq!(completion.try_result(), Some(Ok(RecoveryOutcome::Recovered)));
    assert!(!cluster.store(1).contains(&object));
    assert_eq!(cluster.store(2).get(&object).unwrap().version, newer);
    assert!(!cluster.membership.is_missing(shard(1), &object));
    assert!(cluster.membership.is_missing(shard(2), &object));
}

/// A newer local version makes the local tombstone stale.
#[test]
fn test_local_newer_version_discards_delete() {
    let mut cluster = Cluster::new(2, RecoveryConfig::default());
    let object = key("rewritten");
    cluster
        .store(0)
        .insert(object.clone(), full_object(3, VersionStamp::new(1, 20), 64, 0));

    let mut completion = cluster.backend(0).recover_delete(object.clone(), deleted());
    assert_eq!(completion.try_result(), Some(Ok(RecoveryOutcome::Stale)));
    assert!(cluster.store(0).contains(&object));
    assert!(cluster.take_queued().is_empty());
}

// =============================================================================
// Replication of an applied tombstone
// =============================================================================

#[test]
fn test_push_delete_replicates_without_local_commit() {
    let mut cluster = Cluster::new(4, RecoveryConfig::default());
    let object = key("already-gone");
    for target in [1, 2, 3] {
        cluster
            .store(target)
            .insert(object.clone(), full_object(5, created(), 256, 1));
        cluster
            .membership
            .add_missing(shard(target), object.clone(), MissingItem::whole(deleted()));
    }
    let submits_before = cluster.store(0).submits();

    let mut completion = cluster.backend(0).push_delete(object.clone(), deleted());
    assert_eq!(cluster.shard(0).backend.pending_deletes(&object).map(|p| p.len()), Some(3));
    cluster.pump(Order::Shuffled(17));

    assert_eq!(completion.try_result(), Some(Ok(RecoveryOutcome::Recovered)));
    assert!(cluster.shard(0).backend.pending_deletes(&object).is_none());
    assert_eq!(cluster.store(0).submits(), submits_before);
    for target in [1, 2, 3] {
        assert!(!cluster.store(target).contains(&object));
    }
}

#[test]
fn test_unreachable_target_gets_tombstone_on_reconnect() {
    let mut cluster = Cluster::new(3, RecoveryConfig::default());
    let object = key("partitioned");
    delete_setup(&cluster, &object);
    cluster.transport.set_unreachable(shard(2));

    let mut completion = cluster.backend(0).recover_delete(object.clone(), deleted());
    cluster.pump(Order::Fifo);

    assert!(completion.try_result().is_none());
    assert_eq!(
        cluster
            .shard(0)
            .backend
            .pending_deletes(&object)
            .map(|p| p.iter().copied().collect::<Vec<_>>()),
        Some(vec![shard(2)])
    );
    assert!(cluster.store(2).contains(&object));

    cluster.transport.set_reachable(shard(2));
    assert_eq!(cluster.backend(0).on_peer_reconnected(shard(2)), 1);
    cluster.pump(Order::Fifo);

    assert_eq!(completion.try_result(), Some(Ok(RecoveryOutcome::Recovered)));
    assert!(!cluster.store(2).contains(&object));
    cluster.assert_idle();
}

/// With no replica needing the tombstone, the delete completes at once.
#[test]
fn test_delete_without_targets_completes_immediately() {
    let mut cluster = Cluster::new(2, RecoveryConfig::default());
    let object = key("lonely");
    cluster
        .store(0)
        .insert(object.clone(), full_object(4, created(), 16, 0));

    let mut completion = cluster.backend(0).recover_delete(object.clone(), deleted());
    assert_eq!(completion.try_result(), Some(Ok(RecoveryOutcome::Recovered)));
    assert!(!cluster.store(0).contains(&object));
    assert!(cluster.take_queued().is_empty());
}
