//! A bucket: the set of shards sharing one checkpoint memory quota, one
//! destroyer and one persistence store, plus the background tasks that
//! serve them.

use crate::checkpoint::{
    required_reduction, CheckpointDestroyer, CheckpointMemoryStats, CheckpointRemover,
};
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::executor::{ExecutorPool, Task, TaskHandle, TaskStatus};
use crate::flusher::{FlushResult, Flusher, FlusherTask};
use crate::item::ShardId;
use crate::shard::{Shard, ShardState};
use crate::store::{CompactionContext, CompactionStats, PersistenceStore};
use crate::telemetry::SharedMetricsRegistry;
use log::{debug, info};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};

pub struct Bucket {
    config: EngineConfig,
    shards: Vec<Arc<Shard>>,
    memory: CheckpointMemoryStats,
    destroyer: Arc<CheckpointDestroyer>,
    store: Arc<dyn PersistenceStore>,
    metrics: SharedMetricsRegistry,
    remover: Mutex<Option<TaskHandle>>,
}

impl Bucket {
    /// Creates `num_shards` shards in `state`. Each shard's log resumes after
    /// the high seqno the store already holds for it.
    pub fn new(
        config: EngineConfig,
        num_shards: u16,
        state: ShardState,
        store: Arc<dyn PersistenceStore>,
        metrics: SharedMetricsRegistry,
    ) -> Result<Self, EngineError> {
        config.validate()?;
        let memory = CheckpointMemoryStats::new();
        let destroyer = Arc::new(CheckpointDestroyer::new(
            memory.pending_destruction.clone(),
            metrics.clone(),
        ));
        let mut shards = Vec::with_capacity(usize::from(num_shards));
        for id in 0..num_shards {
            let id = ShardId(id);
            let disk = store.counts(id)?;
            shards.push(Arc::new(Shard::new(
                id,
                state,
                &config,
                memory.owned.clone(),
                Arc::clone(&destroyer),
                disk,
                metrics.clone(),
            )));
        }
        info!(
            "event=bucket_created shards={} persistent={} quota_bytes={}",
            num_shards, config.persistent, config.checkpoint.memory_quota_bytes
        );
        Ok(Self {
            config,
            shards,
            memory,
            destroyer,
            store,
            metrics,
            remover: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn metrics(&self) -> &SharedMetricsRegistry {
        &self.metrics
    }

    pub fn store(&self) -> &Arc<dyn PersistenceStore> {
        &self.store
    }

    pub fn destroyer(&self) -> &Arc<CheckpointDestroyer> {
        &self.destroyer
    }

    pub fn shards(&self) -> &[Arc<Shard>] {
        &self.shards
    }

    pub fn shard(&self, id: ShardId) -> Result<&Arc<Shard>, EngineError> {
        self.shards
            .get(usize::from(id.0))
            .ok_or(EngineError::UnknownShard(id))
    }

    /// Checkpoint memory still owned by shards plus memory queued for
    /// destruction.
    pub fn checkpoint_memory(&self) -> usize {
        self.memory.total()
    }

    pub fn memory_stats(&self) -> &CheckpointMemoryStats {
        &self.memory
    }

    /// Bytes of checkpoint memory the remover should free right now.
    pub fn required_reduction(&self) -> usize {
        let checkpoint = &self.config.checkpoint;
        required_reduction(
            self.checkpoint_memory(),
            checkpoint.memory_quota_bytes,
            checkpoint.memory_recovery_upper_mark,
            checkpoint.memory_recovery_lower_mark,
        )
    }

    /// Point-in-time ordering of the shards, largest checkpoint memory
    /// first.
    pub fn shards_by_checkpoint_memory(&self) -> Vec<Arc<Shard>> {
        let mut sized: Vec<(usize, Arc<Shard>)> = self
            .shards
            .iter()
            .map(|shard| (shard.checkpoint_memory(), Arc::clone(shard)))
            .collect();
        sized.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.id().cmp(&b.1.id())));
        sized.into_iter().map(|(_, shard)| shard).collect()
    }

    pub fn flusher(&self) -> Flusher {
        Flusher::new(
            Arc::clone(&self.store),
            self.config.flusher.clone(),
            self.metrics.clone(),
        )
    }

    /// Runs one flush of `id` on the calling thread.
    pub fn flush(&self, id: ShardId) -> Result<FlushResult, EngineError> {
        Ok(self.flusher().flush(self.shard(id)?))
    }

    /// Flushes `id` until its persistence cursor catches up or a commit
    /// fails. Returns how many items were written.
    pub fn flush_all(&self, id: ShardId) -> Result<usize, EngineError> {
        let shard = self.shard(id)?;
        let flusher = self.flusher();
        let mut flushed = 0;
        loop {
            let result = flusher.flush(shard);
            flushed += result.num_flushed;
            if result.num_flushed == 0 || !result.more_available {
                return Ok(flushed);
            }
        }
    }

    /// Compacts `id` in the store and refreshes the shard's on-disk counts.
    /// Prepares the shard has not yet completed are left alone.
    pub fn compact(
        &self,
        id: ShardId,
        purge_seqno: u64,
        now_secs: u32,
    ) -> Result<CompactionStats, EngineError> {
        let shard = self.shard(id)?;
        let _flushing = shard.lock_for_flush();
        let context = CompactionContext {
            purge_seqno,
            high_completed_seqno: shard.high_completed_seqno(),
            now_secs,
        };
        let stats = self.store.compact(id, &context)?;
        shard.apply_compaction(&stats);
        debug!(
            "event=bucket_compacted shard={} expired={} tombstones_purged={} prepares_purged={}",
            id, stats.expired, stats.tombstones_purged, stats.prepares_purged
        );
        Ok(stats)
    }

    pub fn wake_remover(&self) {
        if let Some(handle) = self.remover.lock().as_ref() {
            handle.wake();
        }
    }

    /// Schedules the flusher, remover, destroyer and durability-timeout
    /// tasks on `pool` and wires their wake-ups.
    pub fn start_background_tasks(self: &Arc<Self>, pool: &ExecutorPool) -> BackgroundTasks {
        let destroyer = pool.schedule(Arc::clone(&self.destroyer) as Arc<dyn Task>);
        self.destroyer.attach(destroyer.clone());

        let flusher = if self.config.persistent {
            let handle = pool.schedule(Arc::new(FlusherTask::new(Arc::clone(self))));
            for shard in &self.shards {
                shard.attach_flusher(handle.clone());
            }
            Some(handle)
        } else {
            None
        };

        let remover = pool.schedule_after(
            Arc::new(CheckpointRemover::new(Arc::clone(self), pool.spawner())),
            self.config.checkpoint.remover_interval(),
        );
        *self.remover.lock() = Some(remover.clone());

        let durability_timeouts = pool.schedule(Arc::new(DurabilityTimeoutTask {
            bucket: Arc::clone(self),
            interval: self.config.durability.timeout_check_interval(),
        }));
        info!(
            "event=bucket_tasks_started flusher={} shards={}",
            flusher.is_some(),
            self.shards.len()
        );
        BackgroundTasks {
            flusher,
            remover,
            destroyer,
            durability_timeouts,
        }
    }
}

impl std::fmt::Debug for Bucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bucket")
            .field("shards", &self.shards.len())
            .field("checkpoint_memory", &self.checkpoint_memory())
            .field("persistent", &self.config.persistent)
            .finish()
    }
}

/// Handles of the tasks started by [`Bucket::start_background_tasks`].
#[derive(Debug)]
pub struct BackgroundTasks {
    pub flusher: Option<TaskHandle>,
    pub remover: TaskHandle,
    pub destroyer: TaskHandle,
    pub durability_timeouts: TaskHandle,
}

impl BackgroundTasks {
    pub fn cancel_all(&self) {
        if let Some(flusher) = self.flusher.as_ref() {
            flusher.cancel();
        }
        self.remover.cancel();
        self.destroyer.cancel();
        self.durability_timeouts.cancel();
    }
}

/// Periodic sweep aborting sync writes past their deadline.
struct DurabilityTimeoutTask {
    bucket: Arc<Bucket>,
    interval: Duration,
}

impl Task for DurabilityTimeoutTask {
    fn name(&self) -> &str {
        "durability_timeouts"
    }

    fn run(&self) -> TaskStatus {
        let now = Instant::now();
        for shard in self.bucket.shards() {
            shard.process_durability_timeouts(now);
        }
        TaskStatus::Reschedule(self.interval)
    }
}
