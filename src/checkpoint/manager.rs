use super::checkpoint::{
    Checkpoint, CheckpointId, CheckpointType, ExpelResult, SnapshotRange,
};
use super::cursor::{
    CursorBatch, CursorPosition, CursorRegistration, CursorStart, PERSISTENCE_CURSOR,
};
use super::destroyer::CheckpointDestroyer;
use super::memory::MemoryCounter;
use crate::config::CheckpointConfig;
use crate::item::{MutationRecord, QueuedItem, Seqno, ShardId};
use log::{debug, info};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CheckpointError {
    #[error("unknown cursor {0}")]
    UnknownCursor(String),
    #[error("cursor {0} was dropped to reclaim memory")]
    CursorDropped(String),
    #[error("cursor {0} already registered")]
    CursorExists(String),
    #[error("seqno {seqno} outside snapshot [{start}, {end}]")]
    OutsideSnapshot { seqno: Seqno, start: Seqno, end: Seqno },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RemovalResult {
    pub checkpoints: usize,
    pub items: usize,
    pub memory: usize,
}

/// Cursors dropped by the checkpoint visitor and the memory they pinned.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DroppedCursors {
    pub names: Vec<String>,
    pub unpinned_memory: usize,
}

enum ReadMode {
    /// Stop on checkpoint boundaries; only disk checkpoints split.
    Batch(Option<usize>),
    /// Stop after exactly this many items.
    Exact(usize),
}

/// Ordered checkpoints of one shard plus the cursors reading them.
pub struct CheckpointManager {
    shard: ShardId,
    config: CheckpointConfig,
    checkpoints: VecDeque<Checkpoint>,
    cursors: HashMap<String, CursorPosition>,
    dropped_cursors: HashSet<String>,
    next_checkpoint_id: CheckpointId,
    high_seqno: Seqno,
    high_completed_seqno: Option<Seqno>,
    memory: MemoryCounter,
    destroyer: Arc<CheckpointDestroyer>,
}

impl CheckpointManager {
    /// Opens the first checkpoint after `last_seqno`. A persistent shard gets
    /// the persistence cursor registered at the start of the log.
    pub fn new(
        shard: ShardId,
        config: CheckpointConfig,
        memory: MemoryCounter,
        destroyer: Arc<CheckpointDestroyer>,
        persistent: bool,
        last_seqno: Seqno,
    ) -> Self {
        let mut manager = Self {
            shard,
            config,
            checkpoints: VecDeque::new(),
            cursors: HashMap::new(),
            dropped_cursors: HashSet::new(),
            next_checkpoint_id: 1,
            high_seqno: last_seqno,
            high_completed_seqno: None,
            memory,
            destroyer,
        };
        manager.open_checkpoint(
            CheckpointType::Memory,
            last_seqno + 1,
            last_seqno + 1,
            None,
        );
        if persistent {
            let first = manager.front().id();
            manager
                .cursors
                .insert(PERSISTENCE_CURSOR.to_string(), CursorPosition::new(first, 0));
        }
        manager
    }

    pub fn shard(&self) -> ShardId {
        self.shard
    }

    pub fn high_seqno(&self) -> Seqno {
        self.high_seqno
    }

    pub fn num_checkpoints(&self) -> usize {
        self.checkpoints.len()
    }

    pub fn open_checkpoint_id(&self) -> CheckpointId {
        self.back().id()
    }

    pub fn checkpoint_ids(&self) -> Vec<CheckpointId> {
        self.checkpoints.iter().map(Checkpoint::id).collect()
    }

    pub fn memory_usage(&self) -> usize {
        self.checkpoints.iter().map(Checkpoint::memory_usage).sum()
    }

    pub fn num_open_checkpoint_items(&self) -> usize {
        self.back().num_items()
    }

    pub fn eager_removal(&self) -> bool {
        self.config.eager_removal()
    }

    /// Every live item in log order, tagged with its checkpoint.
    pub fn items(&self) -> Vec<(CheckpointId, QueuedItem)> {
        self.checkpoints
            .iter()
            .flat_map(|cp| cp.items().map(move |item| (cp.id(), Arc::clone(item))))
            .collect()
    }

    pub fn cursor_position(&self, name: &str) -> Option<CursorPosition> {
        self.cursors.get(name).copied()
    }

    pub fn cursor_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.cursors.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn num_cursors_in(&self, id: CheckpointId) -> usize {
        self.cursors
            .values()
            .filter(|position| position.checkpoint == id)
            .count()
    }

    /// Assigns the next seqno and queues `record` into the open checkpoint.
    pub fn queue_dirty(&mut self, record: MutationRecord) -> QueuedItem {
        let seqno = self.high_seqno + 1;
        self.queue(record.with_seqno(seqno))
    }

    /// Queues a record received from the active, which already carries its
    /// seqno.
    pub fn queue_replicated(
        &mut self,
        record: MutationRecord,
    ) -> Result<QueuedItem, CheckpointError> {
        assert!(
            record.seqno > self.high_seqno,
            "{} replicated seqno {} not above high seqno {}",
            self.shard,
            record.seqno,
            self.high_seqno
        );
        let range = self.back().snapshot_range();
        if record.seqno < range.start || record.seqno > range.end {
            return Err(CheckpointError::OutsideSnapshot {
                seqno: record.seqno,
                start: range.start,
                end: range.end,
            });
        }
        Ok(self.queue(record))
    }

    fn queue(&mut self, record: MutationRecord) -> QueuedItem {
        assert!(!record.is_meta(), "meta items are queued by the manager");
        self.maybe_close_on_threshold();

        let sync_collision = self
            .back()
            .find_doc(&record.key)
            .is_some_and(|(_, existing)| existing.op.is_sync_write() || record.op.is_sync_write());
        if sync_collision {
            self.close_and_open();
        }

        let disk_key = record.disk_key();
        let open_id = self.back().id();
        if let Some(existing) = self.back().offset_of(&disk_key) {
            let already_read = self
                .cursors
                .values()
                .any(|position| position.checkpoint == open_id && position.offset >= existing);
            if !already_read {
                self.back_mut().dedup_slot(existing);
            }
        }

        self.high_seqno = record.seqno;
        let item = Arc::new(record);
        self.back_mut().append(Arc::clone(&item));
        item
    }

    fn maybe_close_on_threshold(&mut self) {
        let open = self.back();
        if open.num_items() == 0 {
            return;
        }
        let full = open.num_items() >= self.config.max_items_per_checkpoint;
        let stale = open.opened_at().elapsed() >= self.config.checkpoint_period();
        if (full || stale) && !open.checkpoint_type().is_disk() {
            self.close_and_open();
        }
    }

    /// Closes the open checkpoint if it holds any item. Returns the new open
    /// checkpoint's id.
    pub fn create_new_checkpoint(&mut self) -> CheckpointId {
        if self.back().num_items() > 0 || self.back().num_expelled() > 0 {
            self.close_and_open();
        }
        self.open_checkpoint_id()
    }

    /// Closes the open checkpoint and opens the next one, continuing the
    /// current snapshot.
    fn close_and_open(&mut self) {
        let next = self.high_seqno + 1;
        let hcs = self.high_completed_seqno;
        let current = self.back().snapshot_range();
        self.back_mut().close(next);
        debug!(
            "event=checkpoint_closed shard={} id={} items={} memory={}",
            self.shard,
            self.back().id(),
            self.back().num_items(),
            self.back().memory_usage()
        );
        self.open_checkpoint(current.checkpoint_type, next, current.end.max(next), hcs);
        if self.config.eager_removal() {
            self.remove_closed_unref_checkpoints();
        }
    }

    fn open_checkpoint(
        &mut self,
        checkpoint_type: CheckpointType,
        start: Seqno,
        end: Seqno,
        high_completed_seqno: Option<Seqno>,
    ) {
        let id = self.next_checkpoint_id;
        self.next_checkpoint_id += 1;
        self.checkpoints.push_back(Checkpoint::open(
            id,
            checkpoint_type,
            start,
            end,
            high_completed_seqno,
            self.memory.clone(),
        ));
        debug!(
            "event=checkpoint_opened shard={} id={} type={:?} start={} end={}",
            self.shard, id, checkpoint_type, start, end
        );
    }

    /// Starts a replica snapshot. An untouched open checkpoint is reused.
    pub fn create_snapshot(
        &mut self,
        start: Seqno,
        end: Seqno,
        high_completed_seqno: Option<Seqno>,
        checkpoint_type: CheckpointType,
    ) {
        assert!(
            start <= end,
            "{} invalid snapshot range [{}, {}]",
            self.shard,
            start,
            end
        );
        if let Some(hcs) = high_completed_seqno {
            self.high_completed_seqno = Some(hcs);
        }
        if self.back().is_pristine() {
            self.back_mut()
                .reset_snapshot(checkpoint_type, start, end, high_completed_seqno);
            return;
        }
        let next = self.high_seqno + 1;
        self.back_mut().close(next);
        self.open_checkpoint(checkpoint_type, start, end, high_completed_seqno);
        if self.config.eager_removal() {
            self.remove_closed_unref_checkpoints();
        }
    }

    /// Tags checkpoints opened from now on with `seqno` as their high
    /// completed seqno.
    pub fn set_high_completed_seqno(&mut self, seqno: Seqno) {
        self.high_completed_seqno = Some(seqno);
        self.back_mut().set_high_completed_seqno(seqno);
    }

    pub fn register_cursor(
        &mut self,
        name: &str,
        start: CursorStart,
    ) -> Result<CursorRegistration, CheckpointError> {
        if self.cursors.contains_key(name) {
            return Err(CheckpointError::CursorExists(name.to_string()));
        }
        let front = self.front();
        let oldest = CursorPosition::new(front.id(), front.num_expelled());
        let oldest_retained = self.oldest_retained_seqno();
        let (position, backfill_until) = match start {
            CursorStart::Oldest if front.num_expelled() > 0 => {
                (oldest, oldest_retained.map(|first| first - 1))
            }
            CursorStart::Oldest => (oldest, None),
            CursorStart::Tail => {
                let open = self.back();
                (
                    CursorPosition::new(open.id(), open.end_offset() - 1),
                    None,
                )
            }
            CursorStart::Seqno(seqno) => {
                let backfill = match oldest_retained {
                    Some(first) if seqno + 1 < first => Some(first - 1),
                    None if seqno < self.high_seqno => Some(self.high_seqno),
                    _ => None,
                };
                (self.position_after_seqno(seqno), backfill)
            }
        };
        let position = self.normalize(position);
        self.dropped_cursors.remove(name);
        self.cursors.insert(name.to_string(), position);
        debug!(
            "event=cursor_registered shard={} cursor={} checkpoint={} offset={} backfill_until={:?}",
            self.shard, name, position.checkpoint, position.offset, backfill_until
        );
        Ok(CursorRegistration {
            position,
            backfill_until,
        })
    }

    fn oldest_retained_seqno(&self) -> Option<Seqno> {
        self.checkpoints
            .iter()
            .flat_map(|cp| cp.items())
            .map(|item| item.seqno)
            .next()
    }

    /// Last position whose item seqno is at or below `seqno`.
    fn position_after_seqno(&self, seqno: Seqno) -> CursorPosition {
        let front = self.front();
        let mut position = CursorPosition::new(front.id(), front.num_expelled());
        for cp in &self.checkpoints {
            for (offset, item) in cp.items_after(0) {
                if item.seqno > seqno {
                    return position;
                }
                position = CursorPosition::new(cp.id(), offset);
            }
        }
        // Everything retained is at or below `seqno`: read from the tail.
        let open = self.back();
        CursorPosition::new(open.id(), open.end_offset() - 1)
    }

    pub fn remove_cursor(&mut self, name: &str) -> bool {
        self.dropped_cursors.remove(name);
        let removed = self.cursors.remove(name).is_some();
        if removed && self.config.eager_removal() {
            self.remove_closed_unref_checkpoints();
        }
        removed
    }

    fn lookup_cursor(&self, name: &str) -> Result<CursorPosition, CheckpointError> {
        match self.cursors.get(name) {
            Some(position) => Ok(*position),
            None if self.dropped_cursors.contains(name) => {
                Err(CheckpointError::CursorDropped(name.to_string()))
            }
            None => Err(CheckpointError::UnknownCursor(name.to_string())),
        }
    }

    /// Reads the next batch for `name` and moves the cursor past it.
    pub fn get_items_for_cursor(
        &mut self,
        name: &str,
        limit: Option<usize>,
    ) -> Result<CursorBatch, CheckpointError> {
        let from = self.lookup_cursor(name)?;
        let batch = self.collect(from, ReadMode::Batch(limit));
        if let Some(end) = batch.end {
            self.move_cursor(name, end);
        }
        Ok(batch)
    }

    /// Moves `name` forward over exactly `count` items (fewer if the log
    /// runs out). Returns how many were skipped.
    pub fn advance_cursor(&mut self, name: &str, count: usize) -> Result<usize, CheckpointError> {
        let from = self.lookup_cursor(name)?;
        let batch = self.collect(from, ReadMode::Exact(count));
        if let Some(end) = batch.end {
            self.move_cursor(name, end);
        }
        Ok(batch.len())
    }

    /// Next flush batch. The persistence cursor does not move until
    /// [`CheckpointManager::commit_persistence_cursor`].
    pub fn items_for_persistence(&self, limit: usize) -> Result<CursorBatch, CheckpointError> {
        let from = self.lookup_cursor(PERSISTENCE_CURSOR)?;
        Ok(self.collect(from, ReadMode::Batch(Some(limit))))
    }

    pub fn commit_persistence_cursor(
        &mut self,
        position: CursorPosition,
    ) -> Result<(), CheckpointError> {
        let current = self.lookup_cursor(PERSISTENCE_CURSOR)?;
        assert!(
            position >= current,
            "{} persistence cursor moved backwards: {:?} -> {:?}",
            self.shard,
            current,
            position
        );
        self.move_cursor(PERSISTENCE_CURSOR, position);
        Ok(())
    }

    pub fn num_items_for_persistence(&self) -> usize {
        self.cursors
            .get(PERSISTENCE_CURSOR)
            .map(|position| self.count_items_after(*position))
            .unwrap_or(0)
    }

    pub fn num_items_for_cursor(&self, name: &str) -> Result<usize, CheckpointError> {
        let position = self.lookup_cursor(name)?;
        Ok(self.count_items_after(position))
    }

    fn move_cursor(&mut self, name: &str, position: CursorPosition) {
        let position = self.normalize(position);
        if let Some(current) = self.cursors.get_mut(name) {
            *current = position;
        }
        if self.config.eager_removal() {
            self.remove_closed_unref_checkpoints();
        }
    }

    fn index_of(&self, id: CheckpointId) -> usize {
        let front = self.front().id();
        let index = id
            .checked_sub(front)
            .map(|index| index as usize)
            .filter(|index| *index < self.checkpoints.len());
        match index {
            Some(index) => {
                assert_eq!(self.checkpoints[index].id(), id, "checkpoint ids not contiguous");
                index
            }
            None => panic!(
                "{} cursor references checkpoint {} which is no longer held (front {})",
                self.shard, id, front
            ),
        }
    }

    /// Hops past the end marker of a closed checkpoint onto the next one.
    fn normalize(&self, mut position: CursorPosition) -> CursorPosition {
        let mut index = self.index_of(position.checkpoint);
        loop {
            let cp = &self.checkpoints[index];
            let consumed_all = position.offset + 1 >= cp.end_offset();
            if cp.is_open() || !consumed_all || index + 1 >= self.checkpoints.len() {
                return position;
            }
            index += 1;
            position = CursorPosition::new(self.checkpoints[index].id(), 0);
        }
    }

    fn count_items_after(&self, position: CursorPosition) -> usize {
        let index = self.index_of(position.checkpoint);
        self.checkpoints
            .iter()
            .skip(index)
            .enumerate()
            .map(|(i, cp)| {
                let after = if i == 0 { position.offset } else { 0 };
                cp.items_after(after).count()
            })
            .sum()
    }

    fn collect(&self, from: CursorPosition, mode: ReadMode) -> CursorBatch {
        let mut batch = CursorBatch::default();
        let mut position = from;
        let mut index = self.index_of(from.checkpoint);
        'checkpoints: loop {
            let cp = &self.checkpoints[index];
            let mut touched = false;
            for offset in position.offset + 1..cp.end_offset() {
                // Markers and holes are consumed freely; limits apply to items.
                let live = cp.slot(offset).filter(|item| !item.is_meta());
                let stop = live.is_some()
                    && match mode {
                        ReadMode::Exact(count) => batch.items.len() >= count,
                        ReadMode::Batch(Some(limit)) => {
                            cp.checkpoint_type().is_disk() && batch.items.len() >= limit
                        }
                        ReadMode::Batch(None) => false,
                    };
                if stop {
                    break 'checkpoints;
                }
                position.offset = offset;
                if let Some(item) = live {
                    batch.items.push(Arc::clone(item));
                    touched = true;
                }
            }
            if touched {
                batch.ranges.push(cp.snapshot_range());
            }
            if cp.is_open() || index + 1 >= self.checkpoints.len() {
                break;
            }
            index += 1;
            position = CursorPosition::new(self.checkpoints[index].id(), 0);
            let full = match mode {
                ReadMode::Exact(count) => batch.items.len() >= count,
                ReadMode::Batch(Some(limit)) => batch.items.len() >= limit,
                ReadMode::Batch(None) => false,
            };
            if full {
                break;
            }
        }
        let position = self.normalize(position);
        batch.more_available = self.count_items_after(position) > 0;
        batch.end = Some(position);
        batch
    }

    /// Detaches closed checkpoints no cursor references, oldest first,
    /// stopping at the first one that must stay. The open checkpoint is never
    /// removed.
    pub fn remove_closed_unref_checkpoints(&mut self) -> RemovalResult {
        let mut result = RemovalResult::default();
        let mut detached = Vec::new();
        while self.checkpoints.len() > 1 {
            let front = self.front();
            if front.is_open() || self.num_cursors_in(front.id()) > 0 {
                break;
            }
            let Some(cp) = self.checkpoints.pop_front() else {
                break;
            };
            result.checkpoints += 1;
            result.items += cp.num_items();
            result.memory += cp.memory_usage();
            detached.push(cp);
        }
        if result.checkpoints > 0 {
            debug!(
                "event=checkpoint_removed shard={} checkpoints={} items={} memory={}",
                self.shard, result.checkpoints, result.items, result.memory
            );
            self.destroyer.queue_for_destruction(detached);
        }
        result
    }

    pub fn has_closed_unref_checkpoints(&self) -> bool {
        self.checkpoints.len() > 1
            && !self.front().is_open()
            && self.num_cursors_in(self.front().id()) == 0
    }

    /// Drops items in the oldest checkpoint that every cursor has already
    /// read.
    pub fn expel_unreferenced_items(&mut self) -> ExpelResult {
        let front_id = self.front().id();
        let lowest = self
            .cursors
            .values()
            .filter(|position| position.checkpoint == front_id)
            .map(|position| position.offset)
            .min();
        let Some(lowest) = lowest else {
            return ExpelResult::default();
        };
        let result = self.front_mut().expel_through(lowest);
        if result.count > 0 {
            debug!(
                "event=checkpoint_expelled shard={} checkpoint={} items={} memory={}",
                self.shard, front_id, result.count, result.memory
            );
        }
        result
    }

    /// Picks the replication cursors pinning the oldest checkpoint and drops
    /// them. Nothing is dropped while the persistence cursor is there too,
    /// since removal would stay blocked anyway.
    pub fn drop_cursors_for_reclamation(&mut self) -> DroppedCursors {
        let front = self.front();
        if front.is_open() {
            return DroppedCursors::default();
        }
        let front_id = front.id();
        let pinned_by_persistence = self
            .cursors
            .get(PERSISTENCE_CURSOR)
            .is_some_and(|position| position.checkpoint == front_id);
        if pinned_by_persistence {
            return DroppedCursors::default();
        }
        let mut names: Vec<String> = self
            .cursors
            .iter()
            .filter(|(name, position)| {
                name.as_str() != PERSISTENCE_CURSOR && position.checkpoint == front_id
            })
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        for name in &names {
            self.cursors.remove(name);
            self.dropped_cursors.insert(name.clone());
            info!(
                "event=cursor_dropped shard={} cursor={} checkpoint={}",
                self.shard, name, front_id
            );
        }
        let unpinned_memory = self
            .checkpoints
            .iter()
            .take(self.checkpoints.len() - 1)
            .take_while(|cp| !cp.is_open() && self.num_cursors_in(cp.id()) == 0)
            .map(Checkpoint::memory_usage)
            .sum();
        if !names.is_empty() && self.config.eager_removal() {
            self.remove_closed_unref_checkpoints();
        }
        DroppedCursors {
            names,
            unpinned_memory,
        }
    }

    pub fn snapshot_ranges(&self) -> Vec<SnapshotRange> {
        self.checkpoints.iter().map(Checkpoint::snapshot_range).collect()
    }

    pub fn open_checkpoint_age(&self, now: Instant) -> std::time::Duration {
        now.saturating_duration_since(self.back().opened_at())
    }

    fn front(&self) -> &Checkpoint {
        match self.checkpoints.front() {
            Some(cp) => cp,
            None => panic!("{} has no checkpoints", self.shard),
        }
    }

    fn front_mut(&mut self) -> &mut Checkpoint {
        let shard = self.shard;
        match self.checkpoints.front_mut() {
            Some(cp) => cp,
            None => panic!("{shard} has no checkpoints"),
        }
    }

    fn back(&self) -> &Checkpoint {
        match self.checkpoints.back() {
            Some(cp) => cp,
            None => panic!("{} has no open checkpoint", self.shard),
        }
    }

    fn back_mut(&mut self) -> &mut Checkpoint {
        let shard = self.shard;
        match self.checkpoints.back_mut() {
            Some(cp) => cp,
            None => panic!("{shard} has no open checkpoint"),
        }
    }
}

impl std::fmt::Debug for CheckpointManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CheckpointManager")
            .field("shard", &self.shard)
            .field("checkpoints", &self.checkpoints)
            .field("cursors", &self.cursors)
            .field("high_seqno", &self.high_seqno)
            .finish()
    }
}
