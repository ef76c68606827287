//! A keyspace-shard: the serialized execution context that owns one
//! checkpoint manager and one durability monitor and runs the write path
//! against them.

use crate::checkpoint::{
    CheckpointDestroyer, CheckpointError, CheckpointManager, CheckpointType, CursorBatch,
    CursorPosition, CursorRegistration, CursorStart, DroppedCursors, ExpelResult, MemoryCounter,
    RemovalResult,
};
use crate::config::EngineConfig;
use crate::durability::{
    AdmissionError, Completion, DurabilityError, DurabilityMonitor, NodeId, ReplicationTopology,
    Requirements, Resolution, SyncWriteWaiter,
};
use crate::error::{EngineError, WriteError};
use crate::executor::TaskHandle;
use crate::item::{CollectionId, DocKey, MutationRecord, QueueOp, QueuedItem, Seqno, ShardId};
use crate::store::{CommitOutcome, CompactionStats};
use crate::telemetry::{names, SharedMetricsRegistry};
use log::{debug, info};
use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::mem;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShardState {
    Active,
    Replica,
    Pending,
    Dead,
}

impl ShardState {
    pub fn as_str(self) -> &'static str {
        match self {
            ShardState::Active => "active",
            ShardState::Replica => "replica",
            ShardState::Pending => "pending",
            ShardState::Dead => "dead",
        }
    }
}

impl fmt::Display for ShardState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOp {
    Set,
    Add,
    Replace,
    Delete,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteRequest {
    pub op: WriteOp,
    pub key: DocKey,
    pub value: Option<Vec<u8>>,
    pub cas: Option<u64>,
    pub durability: Option<Requirements>,
    pub expiry: u32,
}

impl WriteRequest {
    fn new(op: WriteOp, key: DocKey, value: Option<Vec<u8>>) -> Self {
        Self {
            op,
            key,
            value,
            cas: None,
            durability: None,
            expiry: 0,
        }
    }

    pub fn set(key: DocKey, value: impl Into<Vec<u8>>) -> Self {
        Self::new(WriteOp::Set, key, Some(value.into()))
    }

    pub fn add(key: DocKey, value: impl Into<Vec<u8>>) -> Self {
        Self::new(WriteOp::Add, key, Some(value.into()))
    }

    pub fn replace(key: DocKey, value: impl Into<Vec<u8>>) -> Self {
        Self::new(WriteOp::Replace, key, Some(value.into()))
    }

    pub fn delete(key: DocKey) -> Self {
        Self::new(WriteOp::Delete, key, None)
    }

    pub fn with_cas(mut self, cas: u64) -> Self {
        self.cas = Some(cas);
        self
    }

    pub fn with_durability(mut self, requirements: Requirements) -> Self {
        self.durability = Some(requirements);
        self
    }

    pub fn with_expiry(mut self, expiry: u32) -> Self {
        self.expiry = expiry;
        self
    }
}

#[derive(Debug)]
pub enum WriteResponse {
    Done { seqno: Seqno, cas: u64 },
    /// The prepare is queued; the waiter yields the final outcome.
    Pending {
        seqno: Seqno,
        cas: u64,
        waiter: SyncWriteWaiter,
    },
}

impl WriteResponse {
    pub fn seqno(&self) -> Seqno {
        match self {
            WriteResponse::Done { seqno, .. } | WriteResponse::Pending { seqno, .. } => *seqno,
        }
    }

    pub fn cas(&self) -> u64 {
        match self {
            WriteResponse::Done { cas, .. } | WriteResponse::Pending { cas, .. } => *cas,
        }
    }

    pub fn into_waiter(self) -> Option<SyncWriteWaiter> {
        match self {
            WriteResponse::Pending { waiter, .. } => Some(waiter),
            WriteResponse::Done { .. } => None,
        }
    }
}

/// Committed view of a document held in memory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Document {
    pub value: Option<Vec<u8>>,
    pub seqno: Seqno,
    pub cas: u64,
    pub deleted: bool,
    pub expiry: u32,
}

impl Document {
    fn from_record(record: &MutationRecord) -> Self {
        Self {
            value: if record.deleted { None } else { record.value.clone() },
            seqno: record.seqno,
            cas: record.cas,
            deleted: record.deleted,
            expiry: record.expiry,
        }
    }

    /// Zero means the document never expires.
    pub fn is_expired(&self, now_secs: u32) -> bool {
        self.expiry != 0 && self.expiry <= now_secs
    }
}

fn unix_now_secs() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| u32::try_from(elapsed.as_secs()).unwrap_or(u32::MAX))
        .unwrap_or(0)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardStats {
    pub state: ShardState,
    pub high_seqno: Seqno,
    pub num_checkpoints: usize,
    pub checkpoint_memory: usize,
    pub items_for_persistence: usize,
    pub num_tracked_sync_writes: usize,
    pub high_prepared_seqno: Seqno,
    pub high_completed_seqno: Seqno,
    pub persisted_seqno: Seqno,
    pub disk_collection_items: BTreeMap<CollectionId, u64>,
    pub disk_prepares: u64,
}

impl ShardStats {
    pub fn disk_items(&self) -> u64 {
        self.disk_collection_items.values().sum()
    }
}

struct ShardInner {
    state: ShardState,
    checkpoints: CheckpointManager,
    durability: DurabilityMonitor,
    docs: HashMap<DocKey, Document>,
    disk: CommitOutcome,
    next_cas: u64,
}

pub struct Shard {
    id: ShardId,
    persistent: bool,
    default_timeout: Duration,
    inner: Mutex<ShardInner>,
    flush_lock: Mutex<()>,
    flusher: Mutex<Option<TaskHandle>>,
    metrics: SharedMetricsRegistry,
}

impl Shard {
    /// Builds a shard whose log continues after `disk`'s high seqno.
    pub fn new(
        id: ShardId,
        state: ShardState,
        config: &EngineConfig,
        memory: MemoryCounter,
        destroyer: Arc<CheckpointDestroyer>,
        disk: CommitOutcome,
        metrics: SharedMetricsRegistry,
    ) -> Self {
        let default_timeout = config.durability.default_timeout();
        let checkpoints = CheckpointManager::new(
            id,
            config.checkpoint.clone(),
            memory,
            destroyer,
            config.persistent,
            disk.high_seqno,
        );
        let durability = match state {
            ShardState::Active => {
                DurabilityMonitor::active(id, default_timeout, config.persistent)
            }
            _ => DurabilityMonitor::passive(id),
        };
        Self {
            id,
            persistent: config.persistent,
            default_timeout,
            inner: Mutex::new(ShardInner {
                state,
                checkpoints,
                durability,
                docs: HashMap::new(),
                disk,
                next_cas: 1,
            }),
            flush_lock: Mutex::new(()),
            flusher: Mutex::new(None),
            metrics,
        }
    }

    pub fn id(&self) -> ShardId {
        self.id
    }

    pub fn is_persistent(&self) -> bool {
        self.persistent
    }

    pub fn state(&self) -> ShardState {
        self.inner.lock().state
    }

    /// Registers the task woken whenever something is queued.
    pub fn attach_flusher(&self, handle: TaskHandle) {
        *self.flusher.lock() = Some(handle);
    }

    fn wake_flusher(&self) {
        if !self.persistent {
            return;
        }
        if let Some(handle) = self.flusher.lock().as_ref() {
            handle.wake();
        }
    }

    pub fn write(&self, request: WriteRequest) -> Result<WriteResponse, WriteError> {
        let response = {
            let mut inner = self.inner.lock();
            inner.write(request, Instant::now(), &self.metrics)?
        };
        self.wake_flusher();
        Ok(response)
    }

    /// Committed, non-deleted, unexpired document for `key`. Expired
    /// documents stay stored until compaction drops them.
    pub fn get(&self, key: &DocKey) -> Option<Document> {
        self.get_at(key, unix_now_secs())
    }

    /// As [`Shard::get`], judging expiry against `now_secs`.
    pub fn get_at(&self, key: &DocKey, now_secs: u32) -> Option<Document> {
        self.inner
            .lock()
            .docs
            .get(key)
            .filter(|doc| !doc.deleted && !doc.is_expired(now_secs))
            .cloned()
    }

    pub fn set_state(&self, state: ShardState, topology: Option<ReplicationTopology>) {
        {
            let mut inner = self.inner.lock();
            let previous = inner.state;
            let placeholder = DurabilityMonitor::passive(self.id);
            let durability = mem::replace(&mut inner.durability, placeholder);
            inner.durability = match state {
                ShardState::Active => durability.into_active(
                    self.default_timeout,
                    self.persistent,
                    topology,
                    Instant::now(),
                ),
                _ => durability.into_passive(),
            };
            inner.state = state;
            inner.process_resolved(&self.metrics);
            info!(
                "event=shard_state_changed shard={} from={} to={} tracked={}",
                self.id,
                previous,
                state,
                inner.durability.num_tracked()
            );
        }
        self.wake_flusher();
    }

    pub fn set_topology(&self, topology: ReplicationTopology) -> Result<(), EngineError> {
        topology.validate()?;
        {
            let mut inner = self.inner.lock();
            inner.durability.as_active_mut()?.set_topology(Some(topology));
            inner.process_resolved(&self.metrics);
        }
        self.wake_flusher();
        Ok(())
    }

    pub fn topology(&self) -> Option<ReplicationTopology> {
        self.inner
            .lock()
            .durability
            .as_active()
            .and_then(|adm| adm.topology().cloned())
    }

    /// A replica reports it has prepared everything up to `seqno`.
    pub fn seqno_acknowledged(&self, node: &NodeId, seqno: Seqno) -> Result<(), DurabilityError> {
        {
            let mut inner = self.inner.lock();
            inner.durability.as_active_mut()?.seqno_ack_received(node, seqno)?;
            inner.process_resolved(&self.metrics);
        }
        self.wake_flusher();
        Ok(())
    }

    pub fn abort_sync_write(&self, prepare_seqno: Seqno) -> Result<(), DurabilityError> {
        {
            let mut inner = self.inner.lock();
            inner.durability.as_active_mut()?.abort(prepare_seqno)?;
            inner.process_resolved(&self.metrics);
        }
        self.wake_flusher();
        Ok(())
    }

    /// Aborts tracked writes whose deadline passed. Returns how many.
    pub fn process_durability_timeouts(&self, now: Instant) -> usize {
        let aborted = {
            let mut inner = self.inner.lock();
            let aborted = match inner.durability.as_active_mut() {
                Ok(adm) => adm.process_timeouts(now),
                Err(_) => 0,
            };
            if aborted > 0 {
                self.metrics
                    .inc_counter(names::DURABILITY_TIMEOUTS, aborted as u64);
                inner.process_resolved(&self.metrics);
            }
            aborted
        };
        if aborted > 0 {
            self.wake_flusher();
        }
        aborted
    }

    pub fn num_tracked_sync_writes(&self) -> usize {
        self.inner.lock().durability.num_tracked()
    }

    pub fn high_prepared_seqno(&self) -> Seqno {
        self.inner.lock().durability.high_prepared_seqno()
    }

    pub fn high_completed_seqno(&self) -> Seqno {
        self.inner.lock().durability.high_completed_seqno()
    }

    /// Starts a snapshot received from the active.
    pub fn create_snapshot(
        &self,
        start: Seqno,
        end: Seqno,
        high_completed_seqno: Option<Seqno>,
        checkpoint_type: CheckpointType,
    ) {
        self.inner.lock().checkpoints.create_snapshot(
            start,
            end,
            high_completed_seqno,
            checkpoint_type,
        );
    }

    /// Applies a record streamed from the active. It must fall inside the
    /// current snapshot.
    pub fn receive_replicated(&self, record: MutationRecord) -> Result<QueuedItem, EngineError> {
        let item = {
            let mut inner = self.inner.lock();
            if !matches!(inner.state, ShardState::Replica | ShardState::Pending) {
                return Err(WriteError::NotMyShard { state: inner.state }.into());
            }
            inner.receive_replicated(record)?
        };
        self.wake_flusher();
        Ok(item)
    }

    pub fn register_cursor(
        &self,
        name: &str,
        start: CursorStart,
    ) -> Result<CursorRegistration, CheckpointError> {
        self.inner.lock().checkpoints.register_cursor(name, start)
    }

    pub fn remove_cursor(&self, name: &str) -> bool {
        self.inner.lock().checkpoints.remove_cursor(name)
    }

    pub fn get_items_for_cursor(
        &self,
        name: &str,
        limit: Option<usize>,
    ) -> Result<CursorBatch, CheckpointError> {
        self.inner.lock().checkpoints.get_items_for_cursor(name, limit)
    }

    pub fn advance_cursor(&self, name: &str, count: usize) -> Result<usize, CheckpointError> {
        self.inner.lock().checkpoints.advance_cursor(name, count)
    }

    pub fn num_items_for_cursor(&self, name: &str) -> Result<usize, CheckpointError> {
        self.inner.lock().checkpoints.num_items_for_cursor(name)
    }

    pub fn create_new_checkpoint(&self) {
        self.inner.lock().checkpoints.create_new_checkpoint();
    }

    pub fn checkpoint_memory(&self) -> usize {
        self.inner.lock().checkpoints.memory_usage()
    }

    pub fn num_checkpoints(&self) -> usize {
        self.inner.lock().checkpoints.num_checkpoints()
    }

    /// Every item still held in memory, tagged with its checkpoint id.
    pub fn checkpoint_items(&self) -> Vec<(u64, QueuedItem)> {
        self.inner.lock().checkpoints.items()
    }

    pub fn remove_closed_unref_checkpoints(&self) -> RemovalResult {
        self.inner
            .lock()
            .checkpoints
            .remove_closed_unref_checkpoints()
    }

    pub fn has_closed_unref_checkpoints(&self) -> bool {
        self.inner.lock().checkpoints.has_closed_unref_checkpoints()
    }

    pub fn expel_unreferenced_items(&self) -> ExpelResult {
        self.inner.lock().checkpoints.expel_unreferenced_items()
    }

    pub fn drop_cursors_for_reclamation(&self) -> DroppedCursors {
        self.inner.lock().checkpoints.drop_cursors_for_reclamation()
    }

    /// Serializes flushes of this shard; held across the store commit.
    pub fn lock_for_flush(&self) -> MutexGuard<'_, ()> {
        self.flush_lock.lock()
    }

    /// Next batch for the flusher. The persistence cursor stays put.
    pub fn items_for_persistence(&self, limit: usize) -> Result<CursorBatch, CheckpointError> {
        self.inner.lock().checkpoints.items_for_persistence(limit)
    }

    pub fn num_items_for_persistence(&self) -> usize {
        self.inner.lock().checkpoints.num_items_for_persistence()
    }

    /// Records a committed flush: moves the persistence cursor to `end`,
    /// takes the store's counts and tells the durability monitor everything
    /// up to `persisted_seqno` is on disk. Returns whether closed
    /// checkpoints are now waiting for the remover.
    pub fn complete_flush(
        &self,
        end: CursorPosition,
        outcome: Option<CommitOutcome>,
        persisted_seqno: Seqno,
    ) -> Result<bool, CheckpointError> {
        let wake_remover = {
            let mut inner = self.inner.lock();
            inner.checkpoints.commit_persistence_cursor(end)?;
            if let Some(outcome) = outcome {
                inner.disk = outcome;
            }
            if persisted_seqno > 0 {
                inner.durability.notify_local_persistence(persisted_seqno);
                inner.process_resolved(&self.metrics);
            }
            inner.checkpoints.has_closed_unref_checkpoints()
        };
        Ok(wake_remover)
    }

    /// Takes the counts a compaction left on disk.
    pub fn apply_compaction(&self, stats: &CompactionStats) {
        self.inner.lock().disk = stats.counts.clone();
    }

    pub fn stats(&self) -> ShardStats {
        let inner = self.inner.lock();
        ShardStats {
            state: inner.state,
            high_seqno: inner.checkpoints.high_seqno(),
            num_checkpoints: inner.checkpoints.num_checkpoints(),
            checkpoint_memory: inner.checkpoints.memory_usage(),
            items_for_persistence: inner.checkpoints.num_items_for_persistence(),
            num_tracked_sync_writes: inner.durability.num_tracked(),
            high_prepared_seqno: inner.durability.high_prepared_seqno(),
            high_completed_seqno: inner.durability.high_completed_seqno(),
            persisted_seqno: inner.disk.high_seqno,
            disk_collection_items: inner.disk.collection_items.clone(),
            disk_prepares: inner.disk.prepares_on_disk,
        }
    }
}

impl fmt::Debug for Shard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Shard")
            .field("id", &self.id)
            .field("persistent", &self.persistent)
            .finish()
    }
}

impl ShardInner {
    fn write(
        &mut self,
        request: WriteRequest,
        now: Instant,
        metrics: &SharedMetricsRegistry,
    ) -> Result<WriteResponse, WriteError> {
        let state = self.state;
        if state != ShardState::Active {
            return Err(WriteError::NotMyShard { state });
        }
        if let Some(requirements) = request.durability.as_ref() {
            let adm = self
                .durability
                .as_active_mut()
                .map_err(|_| WriteError::NotMyShard { state })?;
            adm.check_admission(requirements)?;
        }
        if self.durability.is_key_tracked(&request.key) {
            return Err(AdmissionError::SyncWriteInProgress.into());
        }
        self.check_existing(&request)?;

        let cas = self.next_cas;
        self.next_cas += 1;
        let value = match request.op {
            WriteOp::Delete => None,
            _ => request.value,
        };
        let record = match (request.durability, value) {
            (Some(requirements), value) => {
                MutationRecord::pending(request.key, value, requirements)
            }
            (None, Some(value)) => MutationRecord::mutation(request.key, value),
            (None, None) => MutationRecord::deletion(request.key),
        }
        .with_cas(cas)
        .with_expiry(request.expiry);

        let durable = record.durability.is_some();
        let item = self.checkpoints.queue_dirty(record);
        if !durable {
            self.docs
                .insert(item.key.clone(), Document::from_record(&item));
            return Ok(WriteResponse::Done {
                seqno: item.seqno,
                cas,
            });
        }

        let (completion, waiter) = Completion::pair();
        let adm = self
            .durability
            .as_active_mut()
            .map_err(|_| WriteError::NotMyShard { state })?;
        adm.add_sync_write(Arc::clone(&item), completion, now);
        self.process_resolved(metrics);
        Ok(WriteResponse::Pending {
            seqno: item.seqno,
            cas,
            waiter,
        })
    }

    fn check_existing(&self, request: &WriteRequest) -> Result<(), WriteError> {
        let live = self.docs.get(&request.key).filter(|doc| !doc.deleted);
        match (request.op, live) {
            (WriteOp::Add, Some(_)) => return Err(WriteError::KeyExists),
            (WriteOp::Replace | WriteOp::Delete, None) => return Err(WriteError::KeyNotFound),
            _ => {}
        }
        match (request.cas, live) {
            (Some(_), None) => Err(WriteError::KeyNotFound),
            (Some(expected), Some(doc)) if expected != doc.cas => Err(WriteError::CasMismatch {
                expected,
                actual: doc.cas,
            }),
            _ => Ok(()),
        }
    }

    /// Queues the Commit or Abort of every resolved sync write, then tells
    /// each waiting client.
    fn process_resolved(&mut self, metrics: &SharedMetricsRegistry) {
        let resolved = match self.durability.as_active_mut() {
            Ok(adm) => adm.drain_resolved(),
            Err(_) => return,
        };
        if resolved.is_empty() {
            return;
        }
        for sw in resolved {
            let prepare = Arc::clone(&sw.prepare);
            let resolution_seqno = match sw.resolution {
                Resolution::Commit => {
                    let commit = self.checkpoints.queue_dirty(MutationRecord::commit_of(&prepare));
                    self.docs
                        .insert(commit.key.clone(), Document::from_record(&commit));
                    metrics.inc_counter(names::DURABILITY_COMMITTED, 1);
                    commit.seqno
                }
                Resolution::Abort => {
                    let abort = self
                        .checkpoints
                        .queue_dirty(MutationRecord::abort_of(prepare.key.clone(), prepare.seqno));
                    metrics.inc_counter(names::DURABILITY_ABORTED, 1);
                    abort.seqno
                }
            };
            debug!(
                "event=sync_write_completed key={} prepare_seqno={} resolution={:?} seqno={}",
                prepare.key, prepare.seqno, sw.resolution, resolution_seqno
            );
            sw.notify(resolution_seqno);
        }
        let hcs = self.durability.high_completed_seqno();
        if hcs > 0 {
            self.checkpoints.set_high_completed_seqno(hcs);
        }
    }

    fn receive_replicated(&mut self, record: MutationRecord) -> Result<QueuedItem, EngineError> {
        if self.durability.as_passive_mut().is_none() {
            return Err(DurabilityError::NotActive.into());
        }
        // A disk snapshot is a backfill: the prepare of a Commit or Abort it
        // carries may have been deduplicated away on the active.
        let completes = matches!(record.op, QueueOp::CommitSyncWrite | QueueOp::AbortSyncWrite);
        let tracked = completes && self.durability.is_key_tracked(&record.key);
        if completes && !tracked {
            let in_disk_snapshot = self
                .checkpoints
                .snapshot_ranges()
                .last()
                .is_some_and(|range| range.checkpoint_type.is_disk());
            if !in_disk_snapshot {
                return Err(DurabilityError::PrepareNotTracked(record.key.to_string()).into());
            }
        }

        let item = self.checkpoints.queue_replicated(record)?;
        let pdm = match self.durability.as_passive_mut() {
            Some(pdm) => pdm,
            None => return Err(DurabilityError::NotActive.into()),
        };
        match item.op {
            QueueOp::PendingSyncWrite => pdm.add_sync_write(Arc::clone(&item)),
            QueueOp::CommitSyncWrite => {
                if tracked {
                    pdm.complete_sync_write(&item.key, Resolution::Commit)?;
                }
                self.docs
                    .insert(item.key.clone(), Document::from_record(&item));
            }
            QueueOp::AbortSyncWrite => {
                if tracked {
                    pdm.complete_sync_write(&item.key, Resolution::Abort)?;
                }
            }
            QueueOp::Mutation | QueueOp::Deletion => {
                self.docs
                    .insert(item.key.clone(), Document::from_record(&item));
            }
            QueueOp::CheckpointStart | QueueOp::CheckpointEnd => {}
        }
        let snapshot_end = self
            .checkpoints
            .snapshot_ranges()
            .last()
            .map(|range| range.end);
        if snapshot_end == Some(item.seqno) {
            if let Some(pdm) = self.durability.as_passive_mut() {
                pdm.notify_snapshot_end_received(item.seqno);
            }
        }
        Ok(item)
    }
}
