use super::{
    CommitOutcome, CompactionContext, CompactionStats, FlushBatch, PersistenceStore, ShardIndex,
    StoreError, StoredDoc,
};
use crate::item::{DiskKey, ShardId};
use log::warn;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Where an injected commit failure strikes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailurePoint {
    /// Nothing reaches the store.
    BeforeApply,
    /// The batch is applied but the caller sees an error, as if the process
    /// died before the acknowledgement.
    AfterApply,
}

/// Volatile store used by memory-only shards and tests. Supports one-shot
/// failure injection on the next commit.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    shards: Mutex<HashMap<ShardId, ShardIndex>>,
    failure: Mutex<Option<FailurePoint>>,
    commits: AtomicU64,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inject_failure(&self, point: FailurePoint) {
        *self.failure.lock() = Some(point);
    }

    /// Successful commits so far.
    pub fn num_commits(&self) -> u64 {
        self.commits.load(Ordering::Relaxed)
    }

    /// Every document of `shard`, ordered by key.
    pub fn dump(&self, shard: ShardId) -> Vec<(DiskKey, StoredDoc)> {
        self.shards
            .lock()
            .get(&shard)
            .map(|index| {
                index
                    .entries()
                    .into_iter()
                    .map(|entry| (entry.key, entry.doc))
                    .collect()
            })
            .unwrap_or_default()
    }
}

impl PersistenceStore for InMemoryStore {
    fn get(&self, shard: ShardId, key: &DiskKey) -> Result<Option<StoredDoc>, StoreError> {
        Ok(self
            .shards
            .lock()
            .get(&shard)
            .and_then(|index| index.get(key).cloned()))
    }

    fn commit_batch(&self, shard: ShardId, batch: &FlushBatch) -> Result<CommitOutcome, StoreError> {
        let failure = self.failure.lock().take();
        if failure == Some(FailurePoint::BeforeApply) {
            warn!("event=store_injected_failure shard={} point=before_apply", shard);
            return Err(StoreError::Injected("commit failed before apply"));
        }
        let entries = batch.entries();
        let outcome = {
            let mut shards = self.shards.lock();
            let index = shards.entry(shard).or_default();
            index.apply(&entries);
            index.outcome()
        };
        if failure == Some(FailurePoint::AfterApply) {
            warn!("event=store_injected_failure shard={} point=after_apply", shard);
            return Err(StoreError::Injected("commit acknowledgement lost"));
        }
        self.commits.fetch_add(1, Ordering::Relaxed);
        Ok(outcome)
    }

    fn compact(
        &self,
        shard: ShardId,
        context: &CompactionContext,
    ) -> Result<CompactionStats, StoreError> {
        Ok(self.shards.lock().entry(shard).or_default().compact(context))
    }

    fn counts(&self, shard: ShardId) -> Result<CommitOutcome, StoreError> {
        Ok(self
            .shards
            .lock()
            .get(&shard)
            .map(ShardIndex::outcome)
            .unwrap_or_default())
    }
}
