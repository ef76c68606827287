use super::checkpoint::Checkpoint;
use super::memory::MemoryCounter;
use crate::executor::{Task, TaskHandle, TaskStatus};
use crate::telemetry::{names, SharedMetricsRegistry};
use log::debug;
use parking_lot::Mutex;
use std::mem;
use std::sync::atomic::{AtomicBool, Ordering};

/// Frees detached checkpoints away from the shard that detached them.
pub struct CheckpointDestroyer {
    pending: Mutex<Vec<Checkpoint>>,
    memory: MemoryCounter,
    notified: AtomicBool,
    waker: Mutex<Option<TaskHandle>>,
    metrics: SharedMetricsRegistry,
}

impl CheckpointDestroyer {
    pub fn new(memory: MemoryCounter, metrics: SharedMetricsRegistry) -> Self {
        Self {
            pending: Mutex::new(Vec::new()),
            memory,
            notified: AtomicBool::new(false),
            waker: Mutex::new(None),
            metrics,
        }
    }

    /// Registers the handle used to wake this destroyer's task.
    pub fn attach(&self, handle: TaskHandle) {
        *self.waker.lock() = Some(handle);
    }

    /// Takes ownership of `checkpoints`, charges their memory to the
    /// pending-destruction counter and wakes the task.
    pub fn queue_for_destruction(&self, checkpoints: Vec<Checkpoint>) {
        if checkpoints.is_empty() {
            return;
        }
        {
            let mut pending = self.pending.lock();
            for mut checkpoint in checkpoints {
                checkpoint.set_memory_tracker(self.memory.clone());
                pending.push(checkpoint);
            }
        }
        if !self.notified.swap(true, Ordering::AcqRel) {
            if let Some(handle) = self.waker.lock().as_ref() {
                handle.wake();
            }
        }
    }

    pub fn pending_memory(&self) -> usize {
        self.memory.get()
    }

    pub fn num_pending(&self) -> usize {
        self.pending.lock().len()
    }

    /// Swaps out the pending list and drops it outside the lock.
    pub fn destroy_pending(&self) -> usize {
        self.notified.store(false, Ordering::Release);
        let batch = mem::take(&mut *self.pending.lock());
        let count = batch.len();
        let memory: usize = batch.iter().map(Checkpoint::memory_usage).sum();
        drop(batch);
        if count > 0 {
            self.metrics
                .inc_counter(names::DESTROYER_DESTROYED, count as u64);
            debug!(
                "event=checkpoint_destroyer_run destroyed={} memory={}",
                count, memory
            );
        }
        count
    }
}

impl Task for CheckpointDestroyer {
    fn name(&self) -> &str {
        "checkpoint_destroyer"
    }

    fn run(&self) -> TaskStatus {
        self.destroy_pending();
        TaskStatus::Snooze
    }
}
