//! Mutation records queued into the checkpoint log and the key types used to
//! address them in memory and on disk.

use crate::durability::Requirements;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::mem;
use std::sync::Arc;

/// Sequence number within one keyspace-shard. Zero means "none".
pub type Seqno = u64;

/// Records are shared between the checkpoint that owns them, cursor reads and
/// the durability monitor.
pub type QueuedItem = Arc<MutationRecord>;

/// Identifier of a keyspace-shard (one independent seqno domain).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
pub struct ShardId(pub u16);

impl fmt::Display for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "shard:{}", self.0)
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
pub struct CollectionId(pub u32);

impl CollectionId {
    pub const DEFAULT: CollectionId = CollectionId(0);
}

impl fmt::Display for CollectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// A document key scoped to its collection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DocKey {
    collection: CollectionId,
    key: Vec<u8>,
}

impl DocKey {
    pub fn new(collection: CollectionId, key: impl Into<Vec<u8>>) -> Self {
        Self {
            collection,
            key: key.into(),
        }
    }

    pub fn in_default(key: impl Into<Vec<u8>>) -> Self {
        Self::new(CollectionId::DEFAULT, key)
    }

    pub fn collection(&self) -> CollectionId {
        self.collection
    }

    pub fn key(&self) -> &[u8] {
        &self.key
    }

    pub fn len(&self) -> usize {
        self.key.len()
    }

    pub fn is_empty(&self) -> bool {
        self.key.is_empty()
    }
}

impl fmt::Display for DocKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "cid:{}:{}",
            self.collection,
            String::from_utf8_lossy(&self.key)
        )
    }
}

/// On-disk key-space a record lands in. Prepares and aborts share the
/// prepared namespace; everything else is committed.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub enum Namespace {
    Committed,
    Prepared,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DiskKey {
    pub namespace: Namespace,
    pub doc: DocKey,
}

impl DiskKey {
    pub fn committed(doc: DocKey) -> Self {
        Self {
            namespace: Namespace::Committed,
            doc,
        }
    }

    pub fn prepared(doc: DocKey) -> Self {
        Self {
            namespace: Namespace::Prepared,
            doc,
        }
    }

    pub fn is_prepared(&self) -> bool {
        self.namespace == Namespace::Prepared
    }
}

impl fmt::Display for DiskKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.namespace {
            Namespace::Committed => write!(f, "{}", self.doc),
            Namespace::Prepared => write!(f, "pre:{}", self.doc),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum QueueOp {
    Mutation,
    Deletion,
    PendingSyncWrite,
    CommitSyncWrite,
    AbortSyncWrite,
    CheckpointStart,
    CheckpointEnd,
}

impl QueueOp {
    /// Checkpoint meta markers bracket a checkpoint and are never persisted.
    pub fn is_meta(self) -> bool {
        matches!(self, QueueOp::CheckpointStart | QueueOp::CheckpointEnd)
    }

    pub fn is_sync_write(self) -> bool {
        matches!(
            self,
            QueueOp::PendingSyncWrite | QueueOp::CommitSyncWrite | QueueOp::AbortSyncWrite
        )
    }

    pub fn namespace(self) -> Namespace {
        match self {
            QueueOp::PendingSyncWrite | QueueOp::AbortSyncWrite => Namespace::Prepared,
            _ => Namespace::Committed,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutationRecord {
    pub key: DocKey,
    pub seqno: Seqno,
    pub op: QueueOp,
    pub value: Option<Vec<u8>>,
    pub cas: u64,
    pub durability: Option<Requirements>,
    pub deleted: bool,
    /// Absolute expiry in seconds since the epoch; zero never expires.
    pub expiry: u32,
    /// Seqno of the prepare a commit or abort resolves.
    pub prepare_seqno: Option<Seqno>,
}

impl MutationRecord {
    fn base(key: DocKey, op: QueueOp) -> Self {
        Self {
            key,
            seqno: 0,
            op,
            value: None,
            cas: 0,
            durability: None,
            deleted: false,
            expiry: 0,
            prepare_seqno: None,
        }
    }

    pub fn mutation(key: DocKey, value: impl Into<Vec<u8>>) -> Self {
        Self {
            value: Some(value.into()),
            ..Self::base(key, QueueOp::Mutation)
        }
    }

    pub fn deletion(key: DocKey) -> Self {
        Self {
            deleted: true,
            ..Self::base(key, QueueOp::Deletion)
        }
    }

    pub fn pending(key: DocKey, value: Option<Vec<u8>>, requirements: Requirements) -> Self {
        Self {
            deleted: value.is_none(),
            value,
            durability: Some(requirements),
            ..Self::base(key, QueueOp::PendingSyncWrite)
        }
    }

    /// Builds the commit for `prepare`, carrying the prepared value forward.
    pub fn commit_of(prepare: &MutationRecord) -> Self {
        Self {
            value: prepare.value.clone(),
            cas: prepare.cas,
            deleted: prepare.deleted,
            expiry: prepare.expiry,
            prepare_seqno: Some(prepare.seqno),
            ..Self::base(prepare.key.clone(), QueueOp::CommitSyncWrite)
        }
    }

    pub fn abort_of(key: DocKey, prepare_seqno: Seqno) -> Self {
        Self {
            deleted: true,
            prepare_seqno: Some(prepare_seqno),
            ..Self::base(key, QueueOp::AbortSyncWrite)
        }
    }

    pub(crate) fn checkpoint_marker(op: QueueOp, seqno: Seqno) -> Self {
        debug_assert!(op.is_meta());
        Self {
            seqno,
            ..Self::base(DocKey::in_default(Vec::new()), op)
        }
    }

    pub fn with_seqno(mut self, seqno: Seqno) -> Self {
        self.seqno = seqno;
        self
    }

    pub fn with_cas(mut self, cas: u64) -> Self {
        self.cas = cas;
        self
    }

    pub fn with_expiry(mut self, expiry: u32) -> Self {
        self.expiry = expiry;
        self
    }

    pub fn is_meta(&self) -> bool {
        self.op.is_meta()
    }

    pub fn is_pending(&self) -> bool {
        self.op == QueueOp::PendingSyncWrite
    }

    pub fn disk_key(&self) -> DiskKey {
        DiskKey {
            namespace: self.op.namespace(),
            doc: self.key.clone(),
        }
    }

    /// Estimated resident size of the record, used for checkpoint memory
    /// accounting.
    pub fn size_bytes(&self) -> usize {
        mem::size_of::<MutationRecord>()
            + self.key.len()
            + self.value.as_ref().map(Vec::len).unwrap_or(0)
    }
}
