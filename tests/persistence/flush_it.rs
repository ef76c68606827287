use crate::support::{durable, key, memory_bucket, shard0};
use kvshard::durability::{Level, ReplicationTopology};
use kvshard::store::{FailurePoint, InMemoryStore};
use kvshard::{
    Bucket, CollectionId, DocKey, EngineConfig, FlusherConfig, ShardId, WriteRequest,
};
use std::sync::Arc;

fn populate(bucket: &Bucket) {
    let shard = bucket.shard(ShardId(0)).unwrap();
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
}

#[test]
fn retried_flush_after_a_failed_commit_matches_an_uninterrupted_one() {
    for failure in [FailurePoint::BeforeApply, FailurePoint::AfterApply] {
        let (clean, clean_store) = memory_bucket(EngineConfig::default(), 1);
        populate(&clean);
        clean.flush_all(ShardId(0)).unwrap();

        let (crashed, crashed_store) = memory_bucket(EngineConfig::default(), 1);
        populate(&crashed);
        let shard = shard0(&crashed);
        let pending = shard.num_items_for_persistence();
        crashed_store.inject_failure(failure);

        let failed = crashed.flush(ShardId(0)).unwrap();
        assert_eq!(failed.num_flushed, 0);
        assert!(failed.more_available);
        assert_eq!(shard.num_items_for_persistence(), pending);

        crashed.flush_all(ShardId(0)).unwrap();
        assert_eq!(shard.num_items_for_persistence(), 0);
        assert_eq!(crashed_store.dump(ShardId(0)), clean_store.dump(ShardId(0)));
        assert_eq!(shard.stats().disk_items(), shard0(&clean).stats().disk_items());
        assert_eq!(
            crashed
                .metrics()
                .snapshot()
                .counter("kvshard.flusher.commit_failures"),
            1
        );
    }
}

#[test]
fn flush_deduplicates_and_tracks_on_disk_counts() {
    let (bucket, store) = memory_bucket(EngineConfig::default(), 1);
    populate(&bucket);
    let flushed = bucket.flush_all(ShardId(0)).unwrap();

    let stats = shard0(&bucket).stats();
    // b and c are live, a is a tombstone.
    assert_eq!(stats.disk_items(), 2);
    assert_eq!(stats.disk_prepares, 1);
    assert_eq!(stats.persisted_seqno, stats.high_seqno);
    assert_eq!(store.dump(ShardId(0)).len(), 4);
    assert_eq!(flushed, 4);
    assert_eq!(
        bucket
            .metrics()
            .snapshot()
            .counter("kvshard.flusher.items_flushed"),
        flushed as u64
    );
}

#[test]
fn sync_write_and_sync_delete_cycles_never_drive_counts_negative() {
    fn cycle(per_op_flush: bool) -> (Vec<u64>, Arc<InMemoryStore>) {
        let (bucket, store) = memory_bucket(EngineConfig::default(), 1);
        let shard = shard0(&bucket);
        shard
            .set_topology(ReplicationTopology::single_node("active"))
            .unwrap();
        let collection = CollectionId(8);
        let doc = DocKey::new(collection, "k");
        let mut observed = Vec::new();
        for _ in 0..4 {
            for request in [
                WriteRequest::set(doc.clone(), "v"),
                WriteRequest::delete(doc.clone()),
            ] {
                shard
                    .write(request.with_durability(durable(Level::Majority)))
                    .unwrap();
                if per_op_flush {
                    bucket.flush_all(ShardId(0)).unwrap();
                    let stats = shard.stats();
                    observed.push(stats.disk_collection_items.get(&collection).copied().unwrap_or(0));
                    assert!(stats.disk_items() <= 1);
                    assert!(stats.disk_prepares <= 1);
                }
            }
        }
        bucket.flush_all(ShardId(0)).unwrap();
        let stats = shard.stats();
        observed.push(stats.disk_collection_items.get(&collection).copied().unwrap_or(0));
        assert_eq!(stats.disk_items(), 0);
        (observed, store)
    }

    let (per_op, per_op_store) = cycle(true);
    assert_eq!(per_op.len(), 9);
    assert_eq!(per_op[..4], [1, 0, 1, 0]);
    let (batched, batched_store) = cycle(false);
    assert_eq!(batched, vec![0]);

    let live = |store: &InMemoryStore| {
        store
            .dump(ShardId(0))
            .into_iter()
            .filter(|(_, doc)| !doc.deleted)
            .count()
    };
    assert_eq!(live(per_op_store.as_ref()), live(batched_store.as_ref()));
}

#[test]
fn small_batches_still_persist_whole_memory_checkpoints() {
    let config = EngineConfig {
        flusher: FlusherConfig {
            batch_split_trigger: 1,
            ..FlusherConfig::default()
        },
        ..EngineConfig::default()
    };
    let (bucket, _) = memory_bucket(config, 1);
    let shard = shard0(&bucket);
    for name in ["a", "b", "c"] {
        shard.write(WriteRequest::set(key(name), "v")).unwrap();
    }
    shard.create_new_checkpoint();
    shard.write(WriteRequest::set(key("d"), "v")).unwrap();

    let first = bucket.flush(ShardId(0)).unwrap();
    assert_eq!(first.num_flushed, 3);
    assert!(first.more_available);
    let second = bucket.flush(ShardId(0)).unwrap();
    assert_eq!(second.num_flushed, 1);
    assert!(!second.more_available);
}

#[test]
fn memory_only_buckets_never_flush() {
    let config = EngineConfig {
        persistent: false,
        ..EngineConfig::default()
    };
    let (bucket, store) = memory_bucket(config, 1);
    shard0(&bucket)
        .write(WriteRequest::set(key("a"), "v"))
        .unwrap();
    assert_eq!(bucket.flush_all(ShardId(0)).unwrap(), 0);
    assert_eq!(store.num_commits(), 0);
}
