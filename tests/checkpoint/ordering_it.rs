use crate::support::{durable, key, logged_ops, memory_bucket, shard0, two_node_topology, REPLICA};
use kvshard::durability::{AmbiguityReason, Level, NodeId};
use kvshard::{
    DurabilityError, EngineConfig, QueueOp, ReplicationTopology, ShardId, SyncWriteOutcome,
    WriteRequest,
};

#[test]
fn seqnos_strictly_increase_in_log_order() {
    let (bucket, _) = memory_bucket(EngineConfig::default(), 2);
    let shard = shard0(&bucket);
    shard
        .set_topology(ReplicationTopology::single_node("active"))
        .unwrap();

    shard.write(WriteRequest::set(key("a"), "1")).unwrap();
    shard.write(WriteRequest::set(key("b"), "1")).unwrap();
    shard.create_new_checkpoint();
    shard
        .write(WriteRequest::set(key("c"), "1").with_durability(durable(Level::Majority)))
        .unwrap();
    shard.write(WriteRequest::delete(key("a"))).unwrap();
    shard.write(WriteRequest::set(key("b"), "2")).unwrap();

    let ops = logged_ops(&shard);
    assert!(ops.windows(2).all(|pair| pair[0].1 < pair[1].1), "{ops:?}");
    assert_eq!(shard.stats().high_seqno, ops.last().unwrap().1);

    // Every shard numbers its own log.
    let other = bucket.shard(ShardId(1)).unwrap();
    let first = other.write(WriteRequest::set(key("a"), "1")).unwrap();
    assert_eq!(first.seqno(), 1);
}

#[test]
fn prepare_and_commit_land_in_different_checkpoints() {
    let (bucket, _) = memory_bucket(EngineConfig::default(), 1);
    let shard = shard0(&bucket);
    shard.set_topology(two_node_topology()).unwrap();

    let response = shard
        .write(WriteRequest::set(key("k"), "v").with_durability(durable(Level::Majority)))
        .unwrap();
    let prepare_seqno = response.seqno();
    let mut waiter = response.into_waiter().unwrap();
    assert!(waiter.try_outcome().is_none());
    assert!(shard.get(&key("k")).is_none());

    shard
        .seqno_acknowledged(&NodeId::new(REPLICA), prepare_seqno)
        .unwrap();
    let ops = logged_ops(&shard);
    assert_eq!(ops.len(), 2);
    assert_eq!(ops[0].2, QueueOp::PendingSyncWrite);
    assert_eq!(ops[1].2, QueueOp::CommitSyncWrite);
    assert_ne!(ops[0].0, ops[1].0);
    assert_eq!(
        waiter.try_outcome(),
        Some(SyncWriteOutcome::Success {
            commit_seqno: ops[1].1
        })
    );
    assert_eq!(shard.get(&key("k")).unwrap().value.as_deref(), Some(&b"v"[..]));
}

#[test]
fn abort_is_queued_separately_and_only_once() {
    let (bucket, _) = memory_bucket(EngineConfig::default(), 1);
    let shard = shard0(&bucket);
    shard.set_topology(two_node_topology()).unwrap();

    let response = shard
        .write(WriteRequest::set(key("k"), "v").with_durability(durable(Level::Majority)))
        .unwrap();
    let prepare_seqno = response.seqno();
    let mut waiter = response.into_waiter().unwrap();

    shard.abort_sync_write(prepare_seqno).unwrap();
    assert!(matches!(
        shard.abort_sync_write(prepare_seqno),
        Err(DurabilityError::PrepareNotTracked(_))
    ));
    let ops = logged_ops(&shard);
    assert_eq!(ops.len(), 2);
    assert_eq!(ops[1].2, QueueOp::AbortSyncWrite);
    assert_ne!(ops[0].0, ops[1].0);
    assert_eq!(
        waiter.try_outcome(),
        Some(SyncWriteOutcome::Ambiguous {
            reason: AmbiguityReason::Aborted
        })
    );
    assert!(shard.get(&key("k")).is_none());
    assert_eq!(shard.high_completed_seqno(), prepare_seqno);
}

#[test]
fn second_sync_write_on_a_key_is_refused_until_the_first_completes() {
    let (bucket, _) = memory_bucket(EngineConfig::default(), 1);
    let shard = shard0(&bucket);
    shard.set_topology(two_node_topology()).unwrap();

    let first = shard
        .write(WriteRequest::set(key("k"), "v1").with_durability(durable(Level::Majority)))
        .unwrap();
    let again = shard
        .write(WriteRequest::set(key("k"), "v2").with_durability(durable(Level::Majority)))
        .unwrap_err();
    assert!(again.is_sync_write_in_progress());
    let delete = shard
        .write(WriteRequest::delete(key("k")).with_durability(durable(Level::Majority)))
        .unwrap_err();
    assert!(delete.is_sync_write_in_progress());
    assert_eq!(shard.num_tracked_sync_writes(), 1);

    shard
        .seqno_acknowledged(&NodeId::new(REPLICA), first.seqno())
        .unwrap();
    let second = shard
        .write(WriteRequest::set(key("k"), "v2").with_durability(durable(Level::Majority)))
        .unwrap();
    assert!(second.seqno() > first.seqno());
}
