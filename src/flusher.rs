//! Drains each shard's persistence cursor into the persistence store.

use crate::bucket::Bucket;
use crate::config::FlusherConfig;
use crate::executor::{Task, TaskStatus};
use crate::item::{DiskKey, QueuedItem};
use crate::shard::Shard;
use crate::store::{FlushBatch, PersistenceStore};
use crate::telemetry::{names, SharedMetricsRegistry};
use log::{debug, error, warn};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushResult {
    pub more_available: bool,
    pub wakeup_checkpoint_remover: bool,
    pub num_flushed: usize,
}

/// Keeps the latest record per on-disk key, in seqno order. A prepare and
/// its commit land in different namespaces and so both survive.
pub fn dedup_batch(items: &[QueuedItem]) -> Vec<QueuedItem> {
    let mut latest: HashMap<DiskKey, QueuedItem> = HashMap::with_capacity(items.len());
    for item in items {
        match latest.get(&item.disk_key()) {
            Some(existing) if existing.seqno > item.seqno => {}
            _ => {
                latest.insert(item.disk_key(), Arc::clone(item));
            }
        }
    }
    let mut deduped: Vec<QueuedItem> = latest.into_values().collect();
    deduped.sort_by_key(|item| item.seqno);
    deduped
}

pub struct Flusher {
    store: Arc<dyn PersistenceStore>,
    config: FlusherConfig,
    metrics: SharedMetricsRegistry,
}

impl Flusher {
    pub fn new(
        store: Arc<dyn PersistenceStore>,
        config: FlusherConfig,
        metrics: SharedMetricsRegistry,
    ) -> Self {
        Self {
            store,
            config,
            metrics,
        }
    }

    /// Persists one batch of `shard`. On a store failure nothing moves and
    /// the same items come back on the next call.
    pub fn flush(&self, shard: &Shard) -> FlushResult {
        if !shard.is_persistent() {
            return FlushResult::default();
        }
        let _flushing = shard.lock_for_flush();
        let batch = match shard.items_for_persistence(self.config.batch_split_trigger) {
            Ok(batch) => batch,
            Err(err) => {
                error!(
                    "event=flusher_cursor_missing shard={} error={}",
                    shard.id(),
                    err
                );
                return FlushResult::default();
            }
        };
        let Some(end) = batch.end_position() else {
            return FlushResult::default();
        };
        let persisted_seqno = batch.high_seqno().unwrap_or(0);
        let items = dedup_batch(&batch.items);
        let work = FlushBatch::new(items);

        let outcome = if work.is_empty() {
            None
        } else {
            match self.store.commit_batch(shard.id(), &work) {
                Ok(outcome) => Some(outcome),
                Err(err) => {
                    error!(
                        "event=flusher_commit_failed shard={} items={} high_seqno={} error={}",
                        shard.id(),
                        work.len(),
                        persisted_seqno,
                        err
                    );
                    self.metrics.inc_counter(names::FLUSHER_COMMIT_FAILURES, 1);
                    return FlushResult {
                        more_available: true,
                        wakeup_checkpoint_remover: false,
                        num_flushed: 0,
                    };
                }
            }
        };

        let wakeup_checkpoint_remover = match shard.complete_flush(end, outcome, persisted_seqno) {
            Ok(wake) => wake,
            Err(err) => {
                error!(
                    "event=flusher_cursor_commit_failed shard={} error={}",
                    shard.id(),
                    err
                );
                false
            }
        };
        let num_flushed = work.len();
        if num_flushed > 0 {
            self.metrics
                .inc_counter(names::FLUSHER_ITEMS_FLUSHED, num_flushed as u64);
            if let Err(err) = self
                .metrics
                .observe_histogram(names::FLUSHER_BATCH_ITEMS, num_flushed as f64)
            {
                warn!(
                    "event=flusher_histogram_failed shard={} error={}",
                    shard.id(),
                    err
                );
            }
            debug!(
                "event=flusher_batch_committed shard={} items={} deduplicated={} high_seqno={}",
                shard.id(),
                num_flushed,
                batch.len() - num_flushed,
                persisted_seqno
            );
        }
        FlushResult {
            more_available: shard.num_items_for_persistence() > 0,
            wakeup_checkpoint_remover,
            num_flushed,
        }
    }
}

/// Flushes every shard of a bucket, then sleeps for the idle interval unless
/// more work is waiting.
pub struct FlusherTask {
    bucket: Arc<Bucket>,
    flusher: Flusher,
    idle: Duration,
}

impl FlusherTask {
    pub fn new(bucket: Arc<Bucket>) -> Self {
        let flusher = bucket.flusher();
        let idle = bucket.config().flusher.idle_interval();
        Self {
            bucket,
            flusher,
            idle,
        }
    }
}

impl Task for FlusherTask {
    fn name(&self) -> &str {
        "flusher"
    }

    fn run(&self) -> TaskStatus {
        let mut more = false;
        let mut wake_remover = false;
        for shard in self.bucket.shards() {
            let result = self.flusher.flush(shard);
            more |= result.more_available;
            wake_remover |= result.wakeup_checkpoint_remover;
        }
        if wake_remover {
            self.bucket.wake_remover();
        }
        if more {
            TaskStatus::Reschedule(Duration::ZERO)
        } else {
            TaskStatus::Reschedule(self.idle)
        }
    }
}
