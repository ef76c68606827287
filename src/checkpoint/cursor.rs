use super::checkpoint::{CheckpointId, SnapshotRange};
use crate::item::{QueuedItem, Seqno};

/// Name of the cursor the flusher drains through.
pub const PERSISTENCE_CURSOR: &str = "persistence";

/// Position of a cursor: the last offset it consumed in a checkpoint. Ordered
/// the same way as the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CursorPosition {
    pub checkpoint: CheckpointId,
    pub offset: usize,
}

impl CursorPosition {
    pub fn new(checkpoint: CheckpointId, offset: usize) -> Self {
        Self { checkpoint, offset }
    }
}

/// Where a new cursor starts reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorStart {
    /// Oldest item still held in memory.
    Oldest,
    /// Only items queued after registration.
    Tail,
    /// Items with a seqno above the given one.
    Seqno(Seqno),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CursorRegistration {
    pub position: CursorPosition,
    /// Set when the requested start is older than the retained log; the
    /// consumer must backfill from disk up to and including this seqno.
    pub backfill_until: Option<Seqno>,
}

/// Items handed to a cursor reader in one call.
#[derive(Debug, Clone, Default)]
pub struct CursorBatch {
    pub items: Vec<QueuedItem>,
    pub ranges: Vec<SnapshotRange>,
    pub more_available: bool,
    pub(crate) end: Option<CursorPosition>,
}

impl CursorBatch {
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn high_seqno(&self) -> Option<Seqno> {
        self.items.iter().map(|item| item.seqno).max()
    }

    /// Position the reading cursor reaches once this batch is consumed.
    pub fn end_position(&self) -> Option<CursorPosition> {
        self.end
    }
}
