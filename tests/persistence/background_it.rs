use crate::support::{key, memory_bucket, shard0};
use kvshard::{EngineConfig, ExecutorPool, WriteRequest};

#[test]
fn writes_wake_the_flusher_task() {
    let (bucket, store) = memory_bucket(EngineConfig::default(), 2);
    let pool = ExecutorPool::manual();
    let tasks = bucket.start_background_tasks(&pool);
    assert!(tasks.flusher.is_some());
    assert_eq!(pool.num_tasks(), 4);

    // Flusher, destroyer and timeout sweep are due at once.
    assert_eq!(pool.run_ready(), 3);
    assert_eq!(store.num_commits(), 0);

    for shard in bucket.shards() {
        shard.write(WriteRequest::set(key("a"), "v")).unwrap();
        shard.write(WriteRequest::set(key("b"), "v")).unwrap();
    }
    assert!(pool.run_ready() >= 1);
    assert_eq!(store.num_commits(), 2);
    for shard in bucket.shards() {
        assert_eq!(shard.num_items_for_persistence(), 0);
        assert_eq!(shard.stats().disk_items(), 2);
    }
    assert_eq!(
        bucket
            .metrics()
            .snapshot()
            .counter("kvshard.flusher.items_flushed"),
        4
    );

    tasks.cancel_all();
    assert_eq!(pool.num_tasks(), 0);
    pool.shutdown();
}

#[test]
fn memory_only_buckets_run_without_a_flusher() {
    let config = EngineConfig {
        persistent: false,
        ..EngineConfig::default()
    };
    let (bucket, store) = memory_bucket(config, 1);
    let pool = ExecutorPool::manual();
    let tasks = bucket.start_background_tasks(&pool);
    assert!(tasks.flusher.is_none());
    assert_eq!(pool.num_tasks(), 3);

    shard0(&bucket)
        .write(WriteRequest::set(key("a"), "v"))
        .unwrap();
    pool.run_ready();
    assert_eq!(store.num_commits(), 0);
    assert_eq!(shard0(&bucket).num_items_for_persistence(), 0);

    tasks.cancel_all();
    pool.shutdown();
}
