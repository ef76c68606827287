use crate::support::{durable, key, memory_bucket, shard0, two_node_topology, REPLICA};
use kvshard::durability::{Level, NodeId};
use kvshard::item::DiskKey;
use kvshard::store::PersistenceStore;
use kvshard::{EngineConfig, ShardId, WriteRequest};

#[test]
fn compaction_keeps_a_prepare_older_than_an_abort() {
    let (bucket, store) = memory_bucket(EngineConfig::default(), 1);
    let shard = shard0(&bucket);
    shard.set_topology(two_node_topology()).unwrap();
    for name in ["a", "b"] {
        shard
            .write(WriteRequest::set(key(name), "v").with_durability(durable(Level::Majority)))
            .unwrap();
    }
    shard.abort_sync_write(2).unwrap();
    bucket.flush_all(ShardId(0)).unwrap();
    assert_eq!(shard.num_tracked_sync_writes(), 1);
    assert_eq!(shard.high_completed_seqno(), 0);

    let stats = bucket.compact(ShardId(0), 0, 0).unwrap();
    assert_eq!(stats.prepares_purged, 0);
    let prepare = store
        .get(ShardId(0), &DiskKey::prepared(key("a")))
        .unwrap()
        .expect("live prepare survives compaction");
    assert_eq!(prepare.seqno, 1);
    assert_eq!(shard.stats().disk_prepares, 1);

    // Once a commits every prepare is completed and compaction may drop it.
    shard.seqno_acknowledged(&NodeId::new(REPLICA), 1).unwrap();
    assert_eq!(shard.num_tracked_sync_writes(), 0);
    assert_eq!(shard.high_completed_seqno(), 2);
    bucket.flush_all(ShardId(0)).unwrap();
    bucket.compact(ShardId(0), 0, 0).unwrap();
    assert!(store
        .get(ShardId(0), &DiskKey::prepared(key("a")))
        .unwrap()
        .is_none());
    assert!(store
        .get(ShardId(0), &DiskKey::committed(key("a")))
        .unwrap()
        .is_some());
}
