use crate::support::{durable, key, logged_ops, memory_bucket, shard0, two_node_topology};
use kvshard::durability::{AmbiguityReason, Level, Timeout};
use kvshard::{EngineConfig, ExecutorPool, QueueOp, SyncWriteOutcome, WriteRequest};
use std::time::{Duration, Instant};

#[test]
fn expired_prepares_are_aborted_and_reported_ambiguous() {
    let (bucket, _) = memory_bucket(EngineConfig::default(), 1);
    let shard = shard0(&bucket);
    shard.set_topology(two_node_topology()).unwrap();

    let mut short = shard
        .write(
            WriteRequest::set(key("short"), "v").with_durability(
                durable(Level::Majority).with_timeout(Timeout::Millis(10)),
            ),
        )
        .unwrap()
        .into_waiter()
        .unwrap();
    let mut forever = shard
        .write(
            WriteRequest::set(key("forever"), "v")
                .with_durability(durable(Level::Majority).with_timeout(Timeout::Infinite)),
        )
        .unwrap()
        .into_waiter()
        .unwrap();

    assert_eq!(shard.process_durability_timeouts(Instant::now()), 0);
    let later = Instant::now() + Duration::from_secs(3600);
    assert_eq!(shard.process_durability_timeouts(later), 1);
    assert_eq!(shard.process_durability_timeouts(later), 0);

    assert_eq!(
        short.try_outcome(),
        Some(SyncWriteOutcome::Ambiguous {
            reason: AmbiguityReason::Timeout
        })
    );
    assert!(forever.try_outcome().is_none());
    assert_eq!(shard.num_tracked_sync_writes(), 1);
    assert!(logged_ops(&shard)
        .iter()
        .any(|(_, _, op)| *op == QueueOp::AbortSyncWrite));

    let snapshot = bucket.metrics().snapshot();
    assert_eq!(snapshot.counter("kvshard.durability.timeouts"), 1);
    assert_eq!(snapshot.counter("kvshard.durability.aborted"), 1);

    // The key is writable again once its prepare is aborted.
    shard.write(WriteRequest::set(key("short"), "w")).unwrap();
}

#[test]
fn bucket_default_timeout_applies_when_none_is_given() {
    let mut config = EngineConfig::default();
    config.durability.default_timeout_ms = 50;
    let (bucket, _) = memory_bucket(config, 1);
    let shard = shard0(&bucket);
    shard.set_topology(two_node_topology()).unwrap();
    shard
        .write(WriteRequest::set(key("k"), "v").with_durability(durable(Level::Majority)))
        .unwrap();

    let before_deadline = Instant::now() + Duration::from_millis(10);
    assert_eq!(shard.process_durability_timeouts(before_deadline), 0);
    let after_deadline = Instant::now() + Duration::from_secs(1);
    assert_eq!(shard.process_durability_timeouts(after_deadline), 1);
}

#[test]
fn timeout_task_sweeps_every_shard() {
    let mut config = EngineConfig::default();
    config.durability.default_timeout_ms = 1;
    let (bucket, _) = memory_bucket(config, 2);
    for shard in bucket.shards() {
        shard.set_topology(two_node_topology()).unwrap();
        shard
            .write(WriteRequest::set(key("k"), "v").with_durability(durable(Level::Majority)))
            .unwrap();
    }
    std::thread::sleep(Duration::from_millis(5));

    let pool = ExecutorPool::manual();
    let tasks = bucket.start_background_tasks(&pool);
    pool.run_ready();
    for shard in bucket.shards() {
        assert_eq!(shard.num_tracked_sync_writes(), 0);
    }
    tasks.cancel_all();
    pool.shutdown();
}
