use super::memory::MemoryCounter;
use crate::item::{DiskKey, DocKey, MutationRecord, QueueOp, QueuedItem, Seqno};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

pub type CheckpointId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointType {
    Memory,
    Disk,
    /// First disk snapshot a replica receives; treated as `Disk` everywhere
    /// else.
    InitialDisk,
}

impl CheckpointType {
    pub fn is_disk(self) -> bool {
        matches!(self, CheckpointType::Disk | CheckpointType::InitialDisk)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointState {
    Open,
    Closed,
}

/// Seqno range a checkpoint covers, reported to cursor readers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotRange {
    pub start: Seqno,
    pub end: Seqno,
    pub checkpoint_type: CheckpointType,
    pub high_completed_seqno: Option<Seqno>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExpelResult {
    pub count: usize,
    pub memory: usize,
}

/// One segment of a shard's mutation log.
///
/// Items are addressed by offset. Offset 0 is the start marker. Deduplicated
/// items leave an empty slot so offsets stay stable. Expelled items are cut
/// from the front (behind the start marker) and `expelled` records how many
/// offsets that removed.
pub struct Checkpoint {
    id: CheckpointId,
    state: CheckpointState,
    checkpoint_type: CheckpointType,
    snapshot_start: Seqno,
    snapshot_end: Seqno,
    high_completed_seqno: Option<Seqno>,
    items: VecDeque<Option<QueuedItem>>,
    expelled: usize,
    key_index: HashMap<DiskKey, usize>,
    num_items: usize,
    mem_usage: usize,
    high_seqno: Seqno,
    tracker: MemoryCounter,
    opened_at: Instant,
}

impl Checkpoint {
    pub(crate) fn open(
        id: CheckpointId,
        checkpoint_type: CheckpointType,
        snapshot_start: Seqno,
        snapshot_end: Seqno,
        high_completed_seqno: Option<Seqno>,
        tracker: MemoryCounter,
    ) -> Self {
        let mut checkpoint = Self {
            id,
            state: CheckpointState::Open,
            checkpoint_type,
            snapshot_start,
            snapshot_end,
            high_completed_seqno,
            items: VecDeque::new(),
            expelled: 0,
            key_index: HashMap::new(),
            num_items: 0,
            mem_usage: 0,
            high_seqno: 0,
            tracker,
            opened_at: Instant::now(),
        };
        checkpoint.push_slot(Arc::new(MutationRecord::checkpoint_marker(
            QueueOp::CheckpointStart,
            snapshot_start,
        )));
        checkpoint
    }

    pub fn id(&self) -> CheckpointId {
        self.id
    }

    pub fn state(&self) -> CheckpointState {
        self.state
    }

    pub fn is_open(&self) -> bool {
        self.state == CheckpointState::Open
    }

    pub fn checkpoint_type(&self) -> CheckpointType {
        self.checkpoint_type
    }

    pub fn snapshot_range(&self) -> SnapshotRange {
        SnapshotRange {
            start: self.snapshot_start,
            end: self.snapshot_end,
            checkpoint_type: self.checkpoint_type,
            high_completed_seqno: self.high_completed_seqno,
        }
    }

    /// Non-meta items still held (expelled and deduplicated ones excluded).
    pub fn num_items(&self) -> usize {
        self.num_items
    }

    pub fn memory_usage(&self) -> usize {
        self.mem_usage
    }

    pub fn high_seqno(&self) -> Seqno {
        self.high_seqno
    }

    pub fn num_expelled(&self) -> usize {
        self.expelled
    }

    pub fn opened_at(&self) -> Instant {
        self.opened_at
    }

    /// True while nothing but the start marker was ever queued.
    pub fn is_pristine(&self) -> bool {
        self.items.len() == 1 && self.expelled == 0
    }

    /// One past the last offset in use.
    pub fn end_offset(&self) -> usize {
        self.items.len() + self.expelled
    }

    pub fn slot(&self, offset: usize) -> Option<&QueuedItem> {
        let index = if offset == 0 {
            0
        } else if offset > self.expelled {
            offset - self.expelled
        } else {
            return None;
        };
        self.items.get(index).and_then(Option::as_ref)
    }

    pub fn offset_of(&self, key: &DiskKey) -> Option<usize> {
        self.key_index.get(key).copied()
    }

    /// Latest offset of `doc` in either namespace.
    pub fn find_doc(&self, doc: &DocKey) -> Option<(usize, &QueuedItem)> {
        [DiskKey::committed(doc.clone()), DiskKey::prepared(doc.clone())]
            .iter()
            .filter_map(|key| self.offset_of(key))
            .max()
            .and_then(|offset| self.slot(offset).map(|item| (offset, item)))
    }

    /// Live non-meta items after `offset`, in log order.
    pub fn items_after(&self, offset: usize) -> impl Iterator<Item = (usize, &QueuedItem)> + '_ {
        let first = (offset + 1).max(self.expelled + 1);
        (first..self.end_offset()).filter_map(move |offset| {
            self.slot(offset)
                .filter(|item| !item.is_meta())
                .map(|item| (offset, item))
        })
    }

    pub fn items(&self) -> impl Iterator<Item = &QueuedItem> + '_ {
        self.items_after(0).map(|(_, item)| item)
    }

    pub(crate) fn append(&mut self, item: QueuedItem) -> usize {
        debug_assert!(self.is_open(), "append to closed checkpoint {}", self.id);
        let offset = self.end_offset();
        self.high_seqno = item.seqno;
        if item.seqno > self.snapshot_end {
            self.snapshot_end = item.seqno;
        }
        self.key_index.insert(item.disk_key(), offset);
        self.num_items += 1;
        self.push_slot(item);
        offset
    }

    /// Empties the slot at `offset`, leaving a hole.
    pub(crate) fn dedup_slot(&mut self, offset: usize) {
        if offset == 0 || offset <= self.expelled {
            return;
        }
        let index = offset - self.expelled;
        if let Some(item) = self.items.get_mut(index).and_then(Option::take) {
            let bytes = item.size_bytes();
            self.mem_usage -= bytes;
            self.tracker.sub(bytes);
            self.num_items -= 1;
        }
    }

    pub(crate) fn close(&mut self, end_marker_seqno: Seqno) {
        if !self.is_open() {
            return;
        }
        self.push_slot(Arc::new(MutationRecord::checkpoint_marker(
            QueueOp::CheckpointEnd,
            end_marker_seqno,
        )));
        self.state = CheckpointState::Closed;
    }

    /// Reuses a checkpoint that never received an item for a new snapshot.
    pub(crate) fn reset_snapshot(
        &mut self,
        checkpoint_type: CheckpointType,
        start: Seqno,
        end: Seqno,
        high_completed_seqno: Option<Seqno>,
    ) {
        debug_assert!(self.is_pristine());
        self.checkpoint_type = checkpoint_type;
        self.snapshot_start = start;
        self.snapshot_end = end;
        self.high_completed_seqno = high_completed_seqno;
    }

    pub(crate) fn set_high_completed_seqno(&mut self, seqno: Seqno) {
        self.high_completed_seqno = Some(seqno);
    }

    /// Drops every item at or before `offset`. The start marker stays, and so
    /// does the end marker of a closed checkpoint.
    pub(crate) fn expel_through(&mut self, offset: usize) -> ExpelResult {
        let mut result = ExpelResult::default();
        let last = offset.min(self.end_offset().saturating_sub(1));
        while self.expelled < last {
            let Some(slot) = self.items.remove(1) else {
                break;
            };
            if let Some(item) = slot {
                if item.op == QueueOp::CheckpointEnd {
                    self.items.insert(1, Some(item));
                    break;
                }
                let bytes = item.size_bytes();
                self.mem_usage -= bytes;
                self.tracker.sub(bytes);
                self.num_items -= 1;
                result.count += 1;
                result.memory += bytes;
                let key = item.disk_key();
                if self.key_index.get(&key) == Some(&(self.expelled + 1)) {
                    self.key_index.remove(&key);
                }
            }
            self.expelled += 1;
        }
        result
    }

    /// Moves this checkpoint's memory accounting to `tracker`.
    pub(crate) fn set_memory_tracker(&mut self, tracker: MemoryCounter) {
        if self.tracker.same_as(&tracker) {
            return;
        }
        self.tracker.sub(self.mem_usage);
        tracker.add(self.mem_usage);
        self.tracker = tracker;
    }

    fn push_slot(&mut self, item: QueuedItem) {
        let bytes = item.size_bytes();
        self.mem_usage += bytes;
        self.tracker.add(bytes);
        self.items.push_back(Some(item));
    }
}

impl Drop for Checkpoint {
    fn drop(&mut self) {
        self.tracker.sub(self.mem_usage);
    }
}

impl fmt::Debug for Checkpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Checkpoint")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("type", &self.checkpoint_type)
            .field("snapshot", &(self.snapshot_start, self.snapshot_end))
            .field("num_items", &self.num_items)
            .field("expelled", &self.expelled)
            .field("mem_usage", &self.mem_usage)
            .finish()
    }
}
