use crate::support::key;
use kvshard::store::PersistenceStore;
use kvshard::{
    Bucket, EngineConfig, FileStore, ShardId, ShardState, SharedMetricsRegistry, WriteRequest,
};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;

fn open_bucket(dir: &Path) -> (Bucket, Arc<FileStore>) {
    let store = Arc::new(FileStore::open(dir).unwrap());
    let bucket = Bucket::new(
        EngineConfig::default(),
        1,
        ShardState::Active,
        store.clone(),
        SharedMetricsRegistry::for_engine(),
    )
    .unwrap();
    (bucket, store)
}

#[test]
fn reopened_bucket_resumes_from_what_was_persisted() {
    let dir = tempfile::tempdir().unwrap();
    {
        let (bucket, _) = open_bucket(dir.path());
        let shard = bucket.shard(ShardId(0)).unwrap();
        for name in ["a", "b", "c"] {
            shard.write(WriteRequest::set(key(name), "v")).unwrap();
        }
        shard.write(WriteRequest::delete(key("b"))).unwrap();
        bucket.flush_all(ShardId(0)).unwrap();
        // Queued but never flushed, so lost on reopen.
        shard.write(WriteRequest::set(key("d"), "v")).unwrap();
    }

    let (bucket, store) = open_bucket(dir.path());
    let shard = bucket.shard(ShardId(0)).unwrap();
    let stats = shard.stats();
    assert_eq!(stats.persisted_seqno, 4);
    assert_eq!(stats.high_seqno, 4);
    assert_eq!(stats.disk_items(), 2);
    assert_eq!(store.persisted_high_seqno(ShardId(0)).unwrap(), 4);

    let next = shard.write(WriteRequest::set(key("e"), "v")).unwrap();
    assert_eq!(next.seqno(), 5);
    bucket.flush_all(ShardId(0)).unwrap();
    assert_eq!(shard.stats().disk_items(), 3);
}

#[test]
fn torn_tail_is_dropped_on_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = {
        let (bucket, store) = open_bucket(dir.path());
        let shard = bucket.shard(ShardId(0)).unwrap();
        shard.write(WriteRequest::set(key("a"), "v")).unwrap();
        bucket.flush_all(ShardId(0)).unwrap();
        store.shard_path(ShardId(0))
    };
    let mut file = OpenOptions::new().append(true).open(&path).unwrap();
    file.write_all(br#"{"high_seqno":9,"entr"#).unwrap();
    drop(file);

    let (bucket, _) = open_bucket(dir.path());
    let stats = bucket.shard(ShardId(0)).unwrap().stats();
    assert_eq!(stats.persisted_seqno, 1);
    assert_eq!(stats.disk_items(), 1);
}

#[test]
fn compaction_expires_documents_and_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    {
        let (bucket, _) = open_bucket(dir.path());
        let shard = bucket.shard(ShardId(0)).unwrap();
        shard
            .write(WriteRequest::set(key("ttl"), "v").with_expiry(100))
            .unwrap();
        shard.write(WriteRequest::set(key("keep"), "v")).unwrap();
        bucket.flush_all(ShardId(0)).unwrap();
        assert_eq!(shard.stats().disk_items(), 2);

        let stats = bucket.compact(ShardId(0), 0, 200).unwrap();
        assert_eq!(stats.expired, 1);
        assert_eq!(stats.tombstones_purged, 0);
        assert_eq!(shard.stats().disk_items(), 1);
    }

    let (bucket, _) = open_bucket(dir.path());
    assert_eq!(bucket.shard(ShardId(0)).unwrap().stats().disk_items(), 1);
    let purged = bucket.compact(ShardId(0), 2, 200).unwrap();
    assert_eq!(purged.tombstones_purged, 1);
    assert_eq!(purged.counts.total_items(), 1);
}
