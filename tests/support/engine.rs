#![allow(dead_code)]

use kvshard::checkpoint::CheckpointId;
use kvshard::durability::{Level, ReplicationTopology, Requirements};
use kvshard::store::InMemoryStore;
use kvshard::{
    Bucket, DocKey, EngineConfig, QueueOp, Seqno, Shard, ShardId, ShardState,
    SharedMetricsRegistry,
};
use std::sync::Arc;

pub const ACTIVE: &str = "active";
pub const REPLICA: &str = "replica";

pub fn key(name: &str) -> DocKey {
    DocKey::in_default(name)
}

pub fn durable(level: Level) -> Requirements {
    Requirements::new(level)
}

/// Active plus one replica in a single chain.
pub fn two_node_topology() -> ReplicationTopology {
    ReplicationTopology::from_chains(vec![vec![Some(ACTIVE), Some(REPLICA)]])
        .expect("two-node chain is valid")
}

/// Bucket over a fresh in-memory store. The store handle is returned for
/// failure injection and inspection.
pub fn memory_bucket(config: EngineConfig, shards: u16) -> (Arc<Bucket>, Arc<InMemoryStore>) {
    memory_bucket_in_state(config, shards, ShardState::Active)
}

pub fn memory_bucket_in_state(
    config: EngineConfig,
    shards: u16,
    state: ShardState,
) -> (Arc<Bucket>, Arc<InMemoryStore>) {
    let store = Arc::new(InMemoryStore::new());
    let bucket = Bucket::new(
        config,
        shards,
        state,
        store.clone(),
        SharedMetricsRegistry::for_engine(),
    )
    .expect("bucket config is valid");
    (Arc::new(bucket), store)
}

pub fn shard0(bucket: &Bucket) -> Arc<Shard> {
    Arc::clone(bucket.shard(ShardId(0)).expect("shard 0 exists"))
}

/// Records still held in memory as `(checkpoint, seqno, op)`.
pub fn logged_ops(shard: &Shard) -> Vec<(CheckpointId, Seqno, QueueOp)> {
    shard
        .checkpoint_items()
        .into_iter()
        .map(|(id, item)| (id, item.seqno, item.op))
        .collect()
}
