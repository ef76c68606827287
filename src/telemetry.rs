//! Namespaced counters, gauges and histograms shared between the shard write
//! path and the background tasks.

use log::warn;
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;

pub const DEFAULT_NAMESPACE: &str = "kvshard";
const METRICS_SHARD_COUNT: usize = 8;

/// Metric names published by the engine, relative to the namespace.
pub mod names {
    pub const FLUSHER_ITEMS_FLUSHED: &str = "flusher.items_flushed";
    pub const FLUSHER_COMMIT_FAILURES: &str = "flusher.commit_failures";
    pub const FLUSHER_BATCH_ITEMS: &str = "flusher.batch_items";
    pub const CHECKPOINT_REMOVED: &str = "checkpoint.removed";
    pub const CHECKPOINT_ITEMS_EXPELLED: &str = "checkpoint.items_expelled";
    pub const CHECKPOINT_MEMORY_BYTES: &str = "checkpoint.memory_bytes";
    pub const CHECKPOINT_CURSORS_DROPPED: &str = "checkpoint.cursors_dropped";
    pub const REMOVER_RUNS: &str = "remover.runs";
    pub const REMOVER_SHORTFALL_BYTES: &str = "remover.shortfall_bytes";
    pub const DESTROYER_DESTROYED: &str = "destroyer.destroyed";
    pub const DURABILITY_COMMITTED: &str = "durability.committed";
    pub const DURABILITY_ABORTED: &str = "durability.aborted";
    pub const DURABILITY_TIMEOUTS: &str = "durability.timeouts";
}

const FLUSH_BATCH_HISTOGRAM_MAX: u64 = 100_000;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TelemetryError {
    #[error("unknown histogram {0}")]
    UnknownHistogram(String),
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct MetricsSnapshot {
    pub counters: HashMap<String, u64>,
    pub histograms: HashMap<String, Vec<u64>>,
    pub gauges: HashMap<String, u64>,
}

impl MetricsSnapshot {
    pub fn counter(&self, name: &str) -> u64 {
        self.counters.get(name).copied().unwrap_or(0)
    }

    pub fn gauge(&self, name: &str) -> u64 {
        self.gauges.get(name).copied().unwrap_or(0)
    }
}

#[derive(Debug, Clone)]
pub struct SharedMetricsRegistry {
    prefix: Arc<String>,
    shards: Arc<Vec<Mutex<MetricsShard>>>,
}

#[derive(Debug, Default)]
struct MetricsShard {
    counters: HashMap<String, Arc<AtomicU64>>,
    gauges: HashMap<String, Arc<AtomicU64>>,
    histograms: HashMap<String, Arc<HistogramCell>>,
}

#[derive(Debug)]
struct HistogramCell {
    bounds: Vec<f64>,
    counts: Vec<AtomicU64>,
}

impl HistogramCell {
    fn canonical(max_value: u64) -> Self {
        let bounds = canonical_histogram_bounds(max_value);
        Self {
            counts: bounds.iter().map(|_| AtomicU64::new(0)).collect(),
            bounds,
        }
    }

    fn observe(&self, value: f64) {
        let idx = if value.is_nan() {
            self.counts.len().saturating_sub(1)
        } else {
            match self
                .bounds
                .binary_search_by(|bound| bound.partial_cmp(&value).unwrap_or(Ordering::Greater))
            {
                Ok(pos) => pos,
                Err(pos) => pos.min(self.counts.len().saturating_sub(1)),
            }
        };
        if let Some(bucket) = self.counts.get(idx) {
            atomic_saturating_add(bucket, 1);
        }
    }

    fn snapshot(&self) -> Vec<u64> {
        self.counts
            .iter()
            .map(|count| count.load(AtomicOrdering::Relaxed))
            .collect()
    }
}

/// Geometric bounds growing by 1.5x up to `max_value`.
fn canonical_histogram_bounds(max_value: u64) -> Vec<f64> {
    let mut bounds = Vec::new();
    let mut current = 1u64;
    while current < max_value {
        bounds.push(current as f64);
        current = (current as f64 * 1.5).ceil() as u64;
    }
    bounds.push(max_value as f64);
    bounds
}

impl SharedMetricsRegistry {
    pub fn new(namespace: impl Into<String>) -> Self {
        let raw = namespace.into();
        let prefix = if raw.ends_with('.') {
            raw
        } else {
            format!("{raw}.")
        };
        Self {
            prefix: Arc::new(prefix),
            shards: Arc::new(
                (0..METRICS_SHARD_COUNT)
                    .map(|_| Mutex::new(MetricsShard::default()))
                    .collect(),
            ),
        }
    }

    /// Registry with every histogram the engine observes.
    pub fn for_engine() -> Self {
        let registry = Self::new(DEFAULT_NAMESPACE);
        registry.register_histogram(names::FLUSHER_BATCH_ITEMS, FLUSH_BATCH_HISTOGRAM_MAX);
        registry
    }

    pub fn inc_counter(&self, name: &str, delta: u64) -> u64 {
        let key = self.qualify(name);
        let cell = self
            .lock_shard(&key)
            .counters
            .entry(key.clone())
            .or_insert_with(|| Arc::new(AtomicU64::new(0)))
            .clone();
        atomic_saturating_add(&cell, delta)
    }

    pub fn set_gauge(&self, name: &str, value: u64) {
        let key = self.qualify(name);
        let cell = self
            .lock_shard(&key)
            .gauges
            .entry(key.clone())
            .or_insert_with(|| Arc::new(AtomicU64::new(0)))
            .clone();
        cell.store(value, AtomicOrdering::Relaxed);
    }

    pub fn register_histogram(&self, name: &str, max_value: u64) {
        let key = self.qualify(name);
        self.lock_shard(&key)
            .histograms
            .entry(key.clone())
            .or_insert_with(|| Arc::new(HistogramCell::canonical(max_value)));
    }

    pub fn observe_histogram(&self, name: &str, value: f64) -> Result<(), TelemetryError> {
        let key = self.qualify(name);
        let cell = self
            .lock_shard(&key)
            .histograms
            .get(&key)
            .cloned()
            .ok_or_else(|| TelemetryError::UnknownHistogram(key.clone()))?;
        cell.observe(value);
        Ok(())
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let mut snapshot = MetricsSnapshot::default();
        for shard in self.shards.iter() {
            let guard = recover(shard);
            for (name, cell) in &guard.counters {
                snapshot
                    .counters
                    .insert(name.clone(), cell.load(AtomicOrdering::Relaxed));
            }
            for (name, cell) in &guard.gauges {
                snapshot
                    .gauges
                    .insert(name.clone(), cell.load(AtomicOrdering::Relaxed));
            }
            for (name, cell) in &guard.histograms {
                snapshot.histograms.insert(name.clone(), cell.snapshot());
            }
        }
        snapshot
    }

    /// Fully qualified name of `name`, as it appears in snapshots.
    pub fn qualify(&self, name: &str) -> String {
        if name.starts_with(self.prefix.as_str()) {
            name.to_string()
        } else {
            format!("{}{}", self.prefix, name)
        }
    }

    fn lock_shard(&self, key: &str) -> MutexGuard<'_, MetricsShard> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        let idx = (hasher.finish() as usize) % self.shards.len();
        recover(&self.shards[idx])
    }
}

impl Default for SharedMetricsRegistry {
    fn default() -> Self {
        Self::for_engine()
    }
}

fn recover(shard: &Mutex<MetricsShard>) -> MutexGuard<'_, MetricsShard> {
    match shard.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            warn!("event=metrics_shard_poisoned; recovering state");
            poisoned.into_inner()
        }
    }
}

fn atomic_saturating_add(cell: &AtomicU64, delta: u64) -> u64 {
    let mut current = cell.load(AtomicOrdering::Relaxed);
    loop {
        let next = current.saturating_add(delta);
        match cell.compare_exchange_weak(
            current,
            next,
            AtomicOrdering::Relaxed,
            AtomicOrdering::Relaxed,
        ) {
            Ok(_) => return next,
            Err(actual) => current = actual,
        }
    }
}
