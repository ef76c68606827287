use crate::support::{durable, key, logged_ops, memory_bucket, shard0, two_node_topology, REPLICA};
use kvshard::durability::{AdmissionError, Level, NodeId, ReplicationTopology};
use kvshard::{
    DurabilityError, EngineConfig, QueueOp, ShardId, SyncWriteOutcome, WriteError, WriteRequest,
};

#[test]
fn persist_to_majority_commits_in_prepare_order_after_flush() {
    let (bucket, _) = memory_bucket(EngineConfig::default(), 1);
    let shard = shard0(&bucket);
    shard.set_topology(two_node_topology()).unwrap();

    let mut waiters = Vec::new();
    for name in ["a", "b", "c"] {
        let response = shard
            .write(
                WriteRequest::set(key(name), "v")
                    .with_durability(durable(Level::PersistToMajority)),
            )
            .unwrap();
        waiters.push(response.into_waiter().unwrap());
    }
    shard
        .seqno_acknowledged(&NodeId::new(REPLICA), 3)
        .unwrap();
    // The active has not persisted anything yet.
    assert_eq!(shard.num_tracked_sync_writes(), 3);
    assert!(waiters.iter_mut().all(|waiter| waiter.try_outcome().is_none()));

    bucket.flush(ShardId(0)).unwrap();
    assert_eq!(shard.num_tracked_sync_writes(), 0);

    let commits: Vec<_> = logged_ops(&shard)
        .into_iter()
        .filter(|(_, _, op)| *op == QueueOp::CommitSyncWrite)
        .collect();
    assert_eq!(commits.len(), 3);
    assert!(commits.iter().all(|(id, _, _)| *id == commits[0].0));
    let seqnos: Vec<_> = commits.iter().map(|(_, seqno, _)| *seqno).collect();
    assert_eq!(seqnos, vec![4, 5, 6]);

    let outcomes: Vec<_> = waiters
        .iter_mut()
        .map(|waiter| waiter.try_outcome())
        .collect();
    assert_eq!(
        outcomes,
        vec![
            Some(SyncWriteOutcome::Success { commit_seqno: 4 }),
            Some(SyncWriteOutcome::Success { commit_seqno: 5 }),
            Some(SyncWriteOutcome::Success { commit_seqno: 6 }),
        ]
    );
    assert_eq!(shard.high_completed_seqno(), 3);
    assert_eq!(
        bucket
            .metrics()
            .snapshot()
            .counter("kvshard.durability.committed"),
        3
    );
}

#[test]
fn satisfied_write_waits_behind_an_older_unsatisfied_one() {
    let (bucket, _) = memory_bucket(EngineConfig::default(), 1);
    let shard = shard0(&bucket);
    shard.set_topology(two_node_topology()).unwrap();

    let persist = shard
        .write(
            WriteRequest::set(key("slow"), "v")
                .with_durability(durable(Level::MajorityAndPersistOnMaster)),
        )
        .unwrap();
    let majority = shard
        .write(WriteRequest::set(key("fast"), "v").with_durability(durable(Level::Majority)))
        .unwrap();
    shard
        .seqno_acknowledged(&NodeId::new(REPLICA), majority.seqno())
        .unwrap();
    assert_eq!(shard.num_tracked_sync_writes(), 2);
    assert_eq!(shard.high_prepared_seqno(), 0);

    bucket.flush(ShardId(0)).unwrap();
    assert_eq!(shard.num_tracked_sync_writes(), 0);
    assert_eq!(shard.high_completed_seqno(), majority.seqno());
    assert!(shard.get(&key("slow")).is_some());
    assert!(shard.get(&key("fast")).is_some());
}

#[test]
fn acks_are_validated_against_the_topology() {
    let (bucket, _) = memory_bucket(EngineConfig::default(), 1);
    let shard = shard0(&bucket);
    shard.set_topology(two_node_topology()).unwrap();
    shard
        .write(WriteRequest::set(key("a"), "v").with_durability(durable(Level::Majority)))
        .unwrap();
    shard
        .write(WriteRequest::set(key("b"), "v").with_durability(durable(Level::Majority)))
        .unwrap();

    assert!(matches!(
        shard.seqno_acknowledged(&NodeId::new("stranger"), 1),
        Err(DurabilityError::UnknownReplica { .. })
    ));
    shard.seqno_acknowledged(&NodeId::new(REPLICA), 1).unwrap();
    assert_eq!(shard.num_tracked_sync_writes(), 1);
    assert!(matches!(
        shard.seqno_acknowledged(&NodeId::new(REPLICA), 0),
        Err(DurabilityError::AckRegression {
            seqno: 0,
            previous: 1,
            ..
        })
    ));
    assert_eq!(shard.num_tracked_sync_writes(), 1);
}

#[test]
fn every_chain_must_reach_its_own_majority() {
    let (bucket, _) = memory_bucket(EngineConfig::default(), 1);
    let shard = shard0(&bucket);
    let rebalance = ReplicationTopology::from_chains(vec![
        vec![Some("active"), Some("replica")],
        vec![Some("active"), Some("new_replica")],
    ])
    .unwrap();
    shard.set_topology(rebalance).unwrap();

    let response = shard
        .write(WriteRequest::set(key("k"), "v").with_durability(durable(Level::Majority)))
        .unwrap();
    shard
        .seqno_acknowledged(&NodeId::new(REPLICA), response.seqno())
        .unwrap();
    assert_eq!(shard.num_tracked_sync_writes(), 1);
    shard
        .seqno_acknowledged(&NodeId::new("new_replica"), response.seqno())
        .unwrap();
    assert_eq!(shard.num_tracked_sync_writes(), 0);
}

#[test]
fn impossible_topologies_refuse_durable_writes() {
    let (bucket, _) = memory_bucket(EngineConfig::default(), 1);
    let shard = shard0(&bucket);

    let unreachable =
        ReplicationTopology::from_chains(vec![vec![Some("active"), None, None]]).unwrap();
    shard.set_topology(unreachable).unwrap();
    let err = shard
        .write(WriteRequest::set(key("k"), "v").with_durability(durable(Level::Majority)))
        .unwrap_err();
    assert!(matches!(
        err,
        WriteError::Admission(AdmissionError::DurabilityImpossible { .. })
    ));

    let oversized = ReplicationTopology::from_chains(vec![vec![
        Some("active"),
        Some("r1"),
        Some("r2"),
        Some("r3"),
    ]])
    .unwrap();
    shard.set_topology(oversized).unwrap();
    let err = shard
        .write(WriteRequest::set(key("k"), "v").with_durability(durable(Level::Majority)))
        .unwrap_err();
    assert!(matches!(
        err,
        WriteError::Admission(AdmissionError::DurabilityImpossible { .. })
    ));

    let err = shard
        .write(WriteRequest::set(key("k"), "v").with_durability(durable(Level::None)))
        .unwrap_err();
    assert!(matches!(
        err,
        WriteError::Admission(AdmissionError::DurabilityInvalidLevel { .. })
    ));
    assert_eq!(shard.stats().high_seqno, 0);

    // Plain writes are unaffected.
    shard.write(WriteRequest::set(key("k"), "v")).unwrap();
}

#[test]
fn topology_change_can_satisfy_tracked_writes() {
    let (bucket, _) = memory_bucket(EngineConfig::default(), 1);
    let shard = shard0(&bucket);
    shard.set_topology(two_node_topology()).unwrap();
    let mut waiter = shard
        .write(WriteRequest::set(key("k"), "v").with_durability(durable(Level::Majority)))
        .unwrap()
        .into_waiter()
        .unwrap();
    assert!(waiter.try_outcome().is_none());

    shard
        .set_topology(ReplicationTopology::single_node("active"))
        .unwrap();
    assert!(waiter.try_outcome().unwrap().is_success());
    assert_eq!(shard.num_tracked_sync_writes(), 0);
}
