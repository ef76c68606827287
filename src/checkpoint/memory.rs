use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Shared byte counter. Clones update the same total.
#[derive(Debug, Clone, Default)]
pub struct MemoryCounter(Arc<AtomicUsize>);

impl MemoryCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, bytes: usize) {
        self.0.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Saturates at zero.
    pub fn sub(&self, bytes: usize) {
        let _ = self
            .0
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |current| {
                Some(current.saturating_sub(bytes))
            });
    }

    pub fn get(&self) -> usize {
        self.0.load(Ordering::Relaxed)
    }

    pub fn same_as(&self, other: &MemoryCounter) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

/// Bucket-wide checkpoint memory, split between checkpoints still owned by a
/// shard and checkpoints waiting in the destroyer.
#[derive(Debug, Clone, Default)]
pub struct CheckpointMemoryStats {
    pub owned: MemoryCounter,
    pub pending_destruction: MemoryCounter,
}

impl CheckpointMemoryStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn total(&self) -> usize {
        self.owned.get() + self.pending_destruction.get()
    }
}

/// Bytes the remover should free: nothing below the upper mark, otherwise
/// enough to get back down to the lower mark.
pub fn required_reduction(usage: usize, quota: usize, upper_mark: f64, lower_mark: f64) -> usize {
    let upper = (quota as f64 * upper_mark) as usize;
    if usage < upper {
        return 0;
    }
    let lower = (quota as f64 * lower_mark) as usize;
    usage.saturating_sub(lower)
}
