//! Persistence store collaborator: the opaque key-value store the flusher
//! drains into. Prepares and abort markers live in the prepared namespace,
//! everything else in the committed one.

pub mod file;
pub mod memory;

pub use file::FileStore;
pub use memory::{FailurePoint, InMemoryStore};

use crate::item::{CollectionId, DiskKey, MutationRecord, Namespace, QueueOp, QueuedItem, Seqno, ShardId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("injected failure: {0}")]
    Injected(&'static str),
    #[error("corrupt store file {path} at line {line}: {reason}")]
    Corrupt {
        path: String,
        line: usize,
        reason: String,
    },
}

/// A document as the store holds it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredDoc {
    pub value: Option<Vec<u8>>,
    pub seqno: Seqno,
    pub cas: u64,
    pub deleted: bool,
    pub expiry: u32,
    pub op: QueueOp,
}

impl StoredDoc {
    pub fn from_record(record: &MutationRecord) -> Self {
        Self {
            value: if record.deleted { None } else { record.value.clone() },
            seqno: record.seqno,
            cas: record.cas,
            deleted: record.deleted,
            expiry: record.expiry,
            op: record.op,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.op == QueueOp::PendingSyncWrite
    }

    pub fn is_abort(&self) -> bool {
        self.op == QueueOp::AbortSyncWrite
    }
}

/// One atomic unit of work for [`PersistenceStore::commit_batch`].
#[derive(Debug, Clone, Default)]
pub struct FlushBatch {
    pub items: Vec<QueuedItem>,
}

impl FlushBatch {
    pub fn new(items: Vec<QueuedItem>) -> Self {
        Self { items }
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn high_seqno(&self) -> Seqno {
        self.items.iter().map(|item| item.seqno).max().unwrap_or(0)
    }

    pub fn entries(&self) -> Vec<DiskEntry> {
        self.items
            .iter()
            .map(|item| DiskEntry {
                key: item.disk_key(),
                doc: StoredDoc::from_record(item),
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskEntry {
    pub key: DiskKey,
    pub doc: StoredDoc,
}

/// On-disk accounting after a commit or compaction. Counts are absolute.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommitOutcome {
    pub collection_items: BTreeMap<CollectionId, u64>,
    pub prepares_on_disk: u64,
    pub high_seqno: Seqno,
}

impl CommitOutcome {
    pub fn total_items(&self) -> u64 {
        self.collection_items.values().sum()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompactionContext {
    /// Tombstones and abort markers at or below this seqno are purged.
    pub purge_seqno: Seqno,
    /// Prepares at or below this seqno have been committed or aborted.
    pub high_completed_seqno: Seqno,
    /// Wall clock in seconds since the epoch, for expiry.
    pub now_secs: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompactionStats {
    pub expired: u64,
    pub tombstones_purged: u64,
    pub prepares_purged: u64,
    pub counts: CommitOutcome,
}

pub trait PersistenceStore: Send + Sync {
    fn get(&self, shard: ShardId, key: &DiskKey) -> Result<Option<StoredDoc>, StoreError>;

    /// Durably applies every record of `batch` or none of them.
    fn commit_batch(&self, shard: ShardId, batch: &FlushBatch) -> Result<CommitOutcome, StoreError>;

    fn compact(
        &self,
        shard: ShardId,
        context: &CompactionContext,
    ) -> Result<CompactionStats, StoreError>;

    fn counts(&self, shard: ShardId) -> Result<CommitOutcome, StoreError>;

    fn persisted_high_seqno(&self, shard: ShardId) -> Result<Seqno, StoreError> {
        Ok(self.counts(shard)?.high_seqno)
    }
}

/// Key index of one shard plus presence-derived counts. Shared by the
/// in-memory and file-backed stores.
#[derive(Debug, Clone, Default)]
pub(crate) struct ShardIndex {
    docs: BTreeMap<DiskKey, StoredDoc>,
    collection_items: BTreeMap<CollectionId, u64>,
    prepares_on_disk: u64,
    high_seqno: Seqno,
}

impl ShardIndex {
    pub(crate) fn get(&self, key: &DiskKey) -> Option<&StoredDoc> {
        self.docs.get(key)
    }

    /// Upserts by key. An entry older than what is stored is ignored, so a
    /// replayed batch leaves the index unchanged.
    pub(crate) fn apply(&mut self, entries: &[DiskEntry]) {
        for entry in entries {
            if self
                .docs
                .get(&entry.key)
                .is_some_and(|existing| existing.seqno > entry.doc.seqno)
            {
                continue;
            }
            self.high_seqno = self.high_seqno.max(entry.doc.seqno);
            self.upsert(entry.key.clone(), Some(entry.doc.clone()));
        }
    }

    fn upsert(&mut self, key: DiskKey, doc: Option<StoredDoc>) {
        let old = match doc {
            Some(doc) => self.docs.insert(key.clone(), doc),
            None => self.docs.remove(&key),
        };
        if let Some(old) = old.as_ref() {
            self.account(&key, old, false);
        }
        if let Some(new) = self.docs.get(&key).cloned() {
            self.account(&key, &new, true);
        }
    }

    fn account(&mut self, key: &DiskKey, doc: &StoredDoc, present: bool) {
        match key.namespace {
            Namespace::Committed if !doc.deleted => {
                let count = self.collection_items.entry(key.doc.collection()).or_default();
                *count = if present {
                    *count + 1
                } else {
                    count.saturating_sub(1)
                };
            }
            Namespace::Prepared if doc.is_pending() => {
                self.prepares_on_disk = if present {
                    self.prepares_on_disk + 1
                } else {
                    self.prepares_on_disk.saturating_sub(1)
                };
            }
            _ => {}
        }
    }

    pub(crate) fn outcome(&self) -> CommitOutcome {
        CommitOutcome {
            collection_items: self.collection_items.clone(),
            prepares_on_disk: self.prepares_on_disk,
            high_seqno: self.high_seqno,
        }
    }

    pub(crate) fn compact(&mut self, context: &CompactionContext) -> CompactionStats {
        let mut stats = CompactionStats::default();
        let keys: Vec<DiskKey> = self.docs.keys().cloned().collect();
        for key in keys {
            let Some(doc) = self.docs.get(&key).cloned() else {
                continue;
            };
            match key.namespace {
                Namespace::Committed if doc.deleted => {
                    if doc.seqno <= context.purge_seqno {
                        self.upsert(key, None);
                        stats.tombstones_purged += 1;
                    }
                }
                Namespace::Committed => {
                    if doc.expiry != 0 && doc.expiry <= context.now_secs {
                        let tombstone = StoredDoc {
                            value: None,
                            deleted: true,
                            op: QueueOp::Deletion,
                            ..doc
                        };
                        self.upsert(key, Some(tombstone));
                        stats.expired += 1;
                    }
                }
                // Live prepares are never expired, whatever their expiry.
                Namespace::Prepared if doc.is_pending() => {
                    if doc.seqno <= context.high_completed_seqno {
                        self.upsert(key, None);
                        stats.prepares_purged += 1;
                    }
                }
                Namespace::Prepared => {
                    if doc.seqno <= context.purge_seqno {
                        self.upsert(key, None);
                        stats.prepares_purged += 1;
                    }
                }
            }
        }
        stats.counts = self.outcome();
        stats
    }

    pub(crate) fn entries(&self) -> Vec<DiskEntry> {
        self.docs
            .iter()
            .map(|(key, doc)| DiskEntry {
                key: key.clone(),
                doc: doc.clone(),
            })
            .collect()
    }

    pub(crate) fn set_high_seqno(&mut self, seqno: Seqno) {
        self.high_seqno = self.high_seqno.max(seqno);
    }
}
