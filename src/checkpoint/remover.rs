//! Periodic checkpoint memory recovery. Each pass escalates: detach closed
//! unreferenced checkpoints, then expel items every cursor has read, then
//! hand the shortfall to a visitor that drops replication cursors.

use crate::bucket::Bucket;
use crate::executor::{Spawner, Task, TaskStatus};
use crate::shard::Shard;
use crate::telemetry::{names, SharedMetricsRegistry};
use log::{debug, info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    NothingToReclaim,
    /// A previous pass (or its visitor) is still in flight.
    Busy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoverOutcome {
    Skipped(SkipReason),
    Reclaimed {
        recovered: usize,
    },
    VisitorScheduled {
        recovered: usize,
        left_to_clear: usize,
    },
    /// Still short, but the visitor of an earlier pass has not finished.
    VisitorInFlight {
        recovered: usize,
        left_to_clear: usize,
    },
}

pub struct CheckpointRemover {
    bucket: Arc<Bucket>,
    available: Arc<AtomicBool>,
    spawner: Spawner,
    interval: Duration,
}

impl CheckpointRemover {
    pub fn new(bucket: Arc<Bucket>, spawner: Spawner) -> Self {
        let interval = bucket.config().checkpoint.remover_interval();
        Self {
            bucket,
            available: Arc::new(AtomicBool::new(true)),
            spawner,
            interval,
        }
    }

    /// False while a pass or the visitor it scheduled is running.
    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::Acquire)
    }

    fn try_acquire(&self) -> bool {
        self.available
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn run_once(&self) -> RemoverOutcome {
        let metrics = self.bucket.metrics();
        metrics.inc_counter(names::REMOVER_RUNS, 1);
        metrics.set_gauge(
            names::CHECKPOINT_MEMORY_BYTES,
            self.bucket.checkpoint_memory() as u64,
        );
        let required = self.bucket.required_reduction();
        if required == 0 {
            metrics.set_gauge(names::REMOVER_SHORTFALL_BYTES, 0);
            return RemoverOutcome::Skipped(SkipReason::NothingToReclaim);
        }
        // With eager removal stage 1 is a no-op, so passes may overlap a
        // running visitor; the flag then only guards the escalation.
        let config = &self.bucket.config().checkpoint;
        let eager = config.eager_removal();
        if !eager && !self.try_acquire() {
            debug!("event=checkpoint_remover_busy required={}", required);
            return RemoverOutcome::Skipped(SkipReason::Busy);
        }

        let shards = self.bucket.shards_by_checkpoint_memory();
        let mut recovered = 0;
        if !eager {
            recovered += remove_checkpoints(&shards, required, metrics);
        }
        if recovered < required && config.expel_enabled {
            recovered += expel_items(&shards, required - recovered, metrics);
        }
        if recovered >= required {
            metrics.set_gauge(names::REMOVER_SHORTFALL_BYTES, 0);
            if !eager {
                self.available.store(true, Ordering::Release);
            }
            debug!(
                "event=checkpoint_remover_run required={} recovered={}",
                required, recovered
            );
            return RemoverOutcome::Reclaimed { recovered };
        }

        let left_to_clear = required - recovered;
        metrics.set_gauge(names::REMOVER_SHORTFALL_BYTES, left_to_clear as u64);
        if eager && !self.try_acquire() {
            debug!(
                "event=checkpoint_remover_visitor_in_flight recovered={} left_to_clear={}",
                recovered, left_to_clear
            );
            return RemoverOutcome::VisitorInFlight {
                recovered,
                left_to_clear,
            };
        }
        info!(
            "event=checkpoint_remover_shortfall required={} recovered={} left_to_clear={}",
            required, recovered, left_to_clear
        );
        let visitor = CheckpointVisitor::new(
            Arc::clone(&self.bucket),
            left_to_clear,
            Arc::clone(&self.available),
        );
        if self.spawner.schedule(Arc::new(visitor)).is_none() {
            // Pool is gone; nobody will run the visitor.
            self.available.store(true, Ordering::Release);
        }
        RemoverOutcome::VisitorScheduled {
            recovered,
            left_to_clear,
        }
    }
}

fn remove_checkpoints(shards: &[Arc<Shard>], target: usize, metrics: &SharedMetricsRegistry) -> usize {
    let mut recovered = 0;
    for shard in shards {
        if recovered >= target {
            break;
        }
        let removed = shard.remove_closed_unref_checkpoints();
        if removed.checkpoints > 0 {
            metrics.inc_counter(names::CHECKPOINT_REMOVED, removed.checkpoints as u64);
        }
        recovered += removed.memory;
    }
    recovered
}

fn expel_items(shards: &[Arc<Shard>], target: usize, metrics: &SharedMetricsRegistry) -> usize {
    let mut recovered = 0;
    for shard in shards {
        if recovered >= target {
            break;
        }
        let expelled = shard.expel_unreferenced_items();
        if expelled.count > 0 {
            metrics.inc_counter(names::CHECKPOINT_ITEMS_EXPELLED, expelled.count as u64);
        }
        recovered += expelled.memory;
    }
    recovered
}

impl Task for CheckpointRemover {
    fn name(&self) -> &str {
        "checkpoint_remover"
    }

    fn run(&self) -> TaskStatus {
        self.run_once();
        TaskStatus::Reschedule(self.interval)
    }
}

/// One-shot task dropping the replication cursors that pin the most
/// checkpoint memory, until `memory_to_clear` is unpinned. The affected
/// streams have to backfill from disk.
pub struct CheckpointVisitor {
    bucket: Arc<Bucket>,
    memory_to_clear: usize,
    available: Arc<AtomicBool>,
    max_expected: Duration,
}

impl CheckpointVisitor {
    pub fn new(bucket: Arc<Bucket>, memory_to_clear: usize, available: Arc<AtomicBool>) -> Self {
        let max_expected = Duration::from_millis(bucket.config().checkpoint.visitor_max_expected_ms);
        Self {
            bucket,
            memory_to_clear,
            available,
            max_expected,
        }
    }

    /// Returns the memory the dropped cursors no longer pin.
    pub fn visit(&self) -> usize {
        let started = Instant::now();
        let metrics = self.bucket.metrics();
        let mut unpinned = 0;
        let mut visited = 0;
        for shard in self.bucket.shards_by_checkpoint_memory() {
            if unpinned >= self.memory_to_clear {
                break;
            }
            visited += 1;
            let dropped = shard.drop_cursors_for_reclamation();
            if !dropped.names.is_empty() {
                metrics.inc_counter(names::CHECKPOINT_CURSORS_DROPPED, dropped.names.len() as u64);
            }
            unpinned += dropped.unpinned_memory;
        }
        let elapsed = started.elapsed();
        if elapsed > self.max_expected {
            warn!(
                "event=checkpoint_visitor_slow shards={} elapsed_ms={} max_expected_ms={}",
                visited,
                elapsed.as_millis(),
                self.max_expected.as_millis()
            );
        }
        debug!(
            "event=checkpoint_visitor_done shards={} unpinned={} target={}",
            visited, unpinned, self.memory_to_clear
        );
        unpinned
    }
}

impl Task for CheckpointVisitor {
    fn name(&self) -> &str {
        "checkpoint_visitor"
    }

    fn run(&self) -> TaskStatus {
        self.visit();
        self.available.store(true, Ordering::Release);
        TaskStatus::Done
    }
}
