use crate::support::{key, memory_bucket, shard0};
use kvshard::{CheckpointConfig, CursorStart, EngineConfig, RemovalMode, ShardId, WriteRequest};

fn lazy_config() -> EngineConfig {
    EngineConfig {
        checkpoint: CheckpointConfig {
            removal_mode: RemovalMode::Lazy,
            ..CheckpointConfig::default()
        },
        ..EngineConfig::default()
    }
}

#[test]
fn checkpoints_referenced_by_a_cursor_survive_removal() {
    let (bucket, _) = memory_bucket(EngineConfig::default(), 1);
    let shard = shard0(&bucket);
    shard.register_cursor("replica", CursorStart::Oldest).unwrap();
    for name in ["a", "b", "c"] {
        shard.write(WriteRequest::set(key(name), "v")).unwrap();
        shard.create_new_checkpoint();
    }
    bucket.flush_all(ShardId(0)).unwrap();
    assert_eq!(shard.num_items_for_persistence(), 0);
    // The slow cursor pins the oldest checkpoint and everything after it.
    assert_eq!(shard.num_checkpoints(), 4);
    assert!(!shard.has_closed_unref_checkpoints());

    let first = shard.get_items_for_cursor("replica", Some(1)).unwrap();
    assert_eq!(first.len(), 1);
    assert_eq!(first.items[0].seqno, 1);
    assert!(first.more_available);
    assert_eq!(shard.num_checkpoints(), 3);
    assert_eq!(shard.num_items_for_cursor("replica").unwrap(), 2);

    let rest = shard.get_items_for_cursor("replica", None).unwrap();
    let seqnos: Vec<_> = rest.items.iter().map(|item| item.seqno).collect();
    assert_eq!(seqnos, vec![2, 3]);
    assert_eq!(rest.ranges.len(), 2);
    assert!(!rest.more_available);
    assert_eq!(shard.num_checkpoints(), 1);
    assert_eq!(shard.num_items_for_cursor("replica").unwrap(), 0);
}

#[test]
fn lazy_removal_waits_for_an_explicit_pass() {
    let (bucket, _) = memory_bucket(lazy_config(), 1);
    let shard = shard0(&bucket);
    shard.write(WriteRequest::set(key("a"), "v")).unwrap();
    shard.create_new_checkpoint();
    shard.write(WriteRequest::set(key("b"), "v")).unwrap();
    bucket.flush_all(ShardId(0)).unwrap();

    assert_eq!(shard.num_checkpoints(), 2);
    assert!(shard.has_closed_unref_checkpoints());
    let removed = shard.remove_closed_unref_checkpoints();
    assert_eq!(removed.checkpoints, 1);
    assert_eq!(removed.items, 1);
    assert_eq!(shard.num_checkpoints(), 1);
    assert_eq!(bucket.destroyer().num_pending(), 1);
    assert_eq!(bucket.destroyer().pending_memory(), removed.memory);
    assert_eq!(shard.num_items_for_persistence(), 0);
}

#[test]
fn late_cursor_is_told_to_backfill_what_was_removed() {
    let (bucket, _) = memory_bucket(EngineConfig::default(), 1);
    let shard = shard0(&bucket);
    shard.write(WriteRequest::set(key("a"), "v")).unwrap();
    shard.write(WriteRequest::set(key("b"), "v")).unwrap();
    shard.create_new_checkpoint();
    shard.write(WriteRequest::set(key("c"), "v")).unwrap();
    bucket.flush_all(ShardId(0)).unwrap();
    assert_eq!(shard.num_checkpoints(), 1);

    let late = shard.register_cursor("late", CursorStart::Seqno(0)).unwrap();
    assert_eq!(late.backfill_until, Some(2));
    let batch = shard.get_items_for_cursor("late", None).unwrap();
    let seqnos: Vec<_> = batch.items.iter().map(|item| item.seqno).collect();
    assert_eq!(seqnos, vec![3]);

    let caught_up = shard.register_cursor("caught_up", CursorStart::Seqno(3)).unwrap();
    assert_eq!(caught_up.backfill_until, None);
    assert_eq!(shard.num_items_for_cursor("caught_up").unwrap(), 0);

    assert!(shard.remove_cursor("late"));
    assert!(!shard.remove_cursor("late"));
}

#[test]
fn advance_skips_exactly_the_requested_items() {
    let (bucket, _) = memory_bucket(lazy_config(), 1);
    let shard = shard0(&bucket);
    shard.register_cursor("replica", CursorStart::Tail).unwrap();
    for name in ["a", "b"] {
        shard.write(WriteRequest::set(key(name), "v")).unwrap();
    }
    shard.create_new_checkpoint();
    shard.write(WriteRequest::set(key("c"), "v")).unwrap();

    assert_eq!(shard.advance_cursor("replica", 2).unwrap(), 2);
    let batch = shard.get_items_for_cursor("replica", None).unwrap();
    assert_eq!(batch.len(), 1);
    assert_eq!(batch.items[0].seqno, 3);
    assert_eq!(shard.advance_cursor("replica", 5).unwrap(), 0);
}
