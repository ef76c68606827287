use crate::support::{durable, key, memory_bucket_in_state, shard0, ACTIVE};
use kvshard::checkpoint::CheckpointError;
use kvshard::durability::{AmbiguityReason, Level};
use kvshard::{
    CheckpointType, DurabilityError, EngineConfig, EngineError, MutationRecord,
    ReplicationTopology, ShardId,
    ShardState, SyncWriteOutcome, WriteError, WriteRequest,
};

fn prepare(name: &str, seqno: u64, level: Level) -> MutationRecord {
    MutationRecord::pending(key(name), Some(b"v".to_vec()), durable(level)).with_seqno(seqno)
}

#[test]
fn replica_tracks_prepares_until_the_commit_arrives() {
    let (bucket, _) = memory_bucket_in_state(EngineConfig::default(), 1, ShardState::Replica);
    let shard = shard0(&bucket);

    shard.create_snapshot(1, 3, None, CheckpointType::Memory);
    let pending = shard
        .receive_replicated(prepare("k", 1, Level::Majority))
        .unwrap();
    shard
        .receive_replicated(MutationRecord::mutation(key("a"), "1").with_seqno(2))
        .unwrap();
    assert_eq!(shard.num_tracked_sync_writes(), 1);
    // Majority prepares count once the whole snapshot is in.
    assert_eq!(shard.high_prepared_seqno(), 0);
    shard
        .receive_replicated(MutationRecord::mutation(key("b"), "1").with_seqno(3))
        .unwrap();
    assert_eq!(shard.high_prepared_seqno(), 1);
    assert!(shard.get(&key("k")).is_none());
    assert!(shard.get(&key("a")).is_some());

    shard.create_snapshot(4, 4, Some(1), CheckpointType::Memory);
    shard
        .receive_replicated(MutationRecord::commit_of(&pending).with_seqno(4))
        .unwrap();
    assert_eq!(shard.num_tracked_sync_writes(), 0);
    assert_eq!(shard.high_completed_seqno(), 1);
    assert_eq!(shard.get(&key("k")).unwrap().value.as_deref(), Some(&b"v"[..]));
}

#[test]
fn persist_level_prepares_count_after_the_replica_flushes() {
    let (bucket, _) = memory_bucket_in_state(EngineConfig::default(), 1, ShardState::Replica);
    let shard = shard0(&bucket);

    shard.create_snapshot(1, 1, None, CheckpointType::Disk);
    shard
        .receive_replicated(prepare("k", 1, Level::PersistToMajority))
        .unwrap();
    assert_eq!(shard.high_prepared_seqno(), 0);

    bucket.flush_all(ShardId(0)).unwrap();
    assert_eq!(shard.high_prepared_seqno(), 1);
    assert_eq!(shard.num_tracked_sync_writes(), 1);
}

#[test]
fn replicated_records_outside_the_snapshot_are_rejected() {
    let (bucket, _) = memory_bucket_in_state(EngineConfig::default(), 1, ShardState::Replica);
    let shard = shard0(&bucket);
    shard.create_snapshot(1, 2, None, CheckpointType::Memory);
    let err = shard
        .receive_replicated(MutationRecord::mutation(key("a"), "1").with_seqno(5))
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::Checkpoint(CheckpointError::OutsideSnapshot {
            seqno: 5,
            start: 1,
            end: 2
        })
    ));
    assert_eq!(shard.stats().high_seqno, 0);
}

#[test]
fn replicas_refuse_client_writes_and_actives_refuse_replication() {
    let (bucket, _) = memory_bucket_in_state(EngineConfig::default(), 1, ShardState::Replica);
    let shard = shard0(&bucket);
    assert_eq!(
        shard.write(WriteRequest::set(key("a"), "1")).unwrap_err(),
        WriteError::NotMyShard {
            state: ShardState::Replica
        }
    );

    shard.set_state(ShardState::Active, Some(ReplicationTopology::single_node(ACTIVE)));
    let err = shard
        .receive_replicated(MutationRecord::mutation(key("a"), "1").with_seqno(1))
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::Write(WriteError::NotMyShard {
            state: ShardState::Active
        })
    ));
}

#[test]
fn promoted_replica_resolves_prepares_it_inherited() {
    let (bucket, _) = memory_bucket_in_state(EngineConfig::default(), 1, ShardState::Replica);
    let shard = shard0(&bucket);
    shard.create_snapshot(1, 1, None, CheckpointType::Memory);
    shard
        .receive_replicated(prepare("k", 1, Level::Majority))
        .unwrap();

    shard.set_state(ShardState::Active, Some(ReplicationTopology::single_node(ACTIVE)));
    assert_eq!(shard.num_tracked_sync_writes(), 0);
    assert!(shard.get(&key("k")).is_some());
    let next = shard.write(WriteRequest::set(key("x"), "v")).unwrap();
    assert!(next.seqno() > 1);
}

#[test]
fn demotion_answers_waiting_clients_ambiguously() {
    let (bucket, _) = memory_bucket_in_state(EngineConfig::default(), 1, ShardState::Active);
    let shard = shard0(&bucket);
    shard
        .set_topology(crate::support::two_node_topology())
        .unwrap();
    let mut waiter = shard
        .write(WriteRequest::set(key("k"), "v").with_durability(durable(Level::Majority)))
        .unwrap()
        .into_waiter()
        .unwrap();

    shard.set_state(ShardState::Dead, None);
    assert_eq!(
        waiter.try_outcome(),
        Some(SyncWriteOutcome::Ambiguous {
            reason: AmbiguityReason::Takeover
        })
    );
    assert_eq!(shard.state(), ShardState::Dead);
    assert_eq!(shard.num_tracked_sync_writes(), 1);
}

#[test]
fn untracked_commit_is_refused_in_a_memory_snapshot_without_moving_the_log() {
    let (bucket, _) = memory_bucket_in_state(EngineConfig::default(), 1, ShardState::Replica);
    let shard = shard0(&bucket);
    let orphan = prepare("k", 1, Level::Majority);
    shard.create_snapshot(1, 2, None, CheckpointType::Memory);

    let err = shard
        .receive_replicated(MutationRecord::commit_of(&orphan).with_seqno(2))
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::Durability(DurabilityError::PrepareNotTracked(_))
    ));
    assert_eq!(shard.stats().high_seqno, 0);
    assert!(shard.checkpoint_items().is_empty());
    assert!(shard.get(&key("k")).is_none());

    // The same seqno is still free for the record the active really sent.
    shard
        .receive_replicated(MutationRecord::mutation(key("k"), "v").with_seqno(2))
        .unwrap();
    assert_eq!(shard.stats().high_seqno, 2);
}

#[test]
fn disk_snapshot_applies_a_commit_whose_prepare_was_deduplicated() {
    let (bucket, _) = memory_bucket_in_state(EngineConfig::default(), 1, ShardState::Replica);
    let shard = shard0(&bucket);
    let deduplicated = prepare("k", 1, Level::Majority);
    shard.create_snapshot(1, 2, Some(1), CheckpointType::Disk);

    shard
        .receive_replicated(MutationRecord::commit_of(&deduplicated).with_seqno(2))
        .unwrap();
    assert_eq!(shard.stats().high_seqno, 2);
    assert_eq!(shard.num_tracked_sync_writes(), 0);
    assert_eq!(shard.get(&key("k")).unwrap().value.as_deref(), Some(&b"v"[..]));
}
