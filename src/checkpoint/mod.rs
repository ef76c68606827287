//! In-memory mutation log of a shard: checkpoints, the cursors reading them,
//! and the tasks that give their memory back.

#[allow(clippy::module_inception)]
pub mod checkpoint;
pub mod cursor;
pub mod destroyer;
pub mod manager;
pub mod memory;
pub mod remover;

pub use checkpoint::{Checkpoint, CheckpointId, CheckpointState, CheckpointType, ExpelResult, SnapshotRange};
pub use cursor::{CursorBatch, CursorPosition, CursorRegistration, CursorStart, PERSISTENCE_CURSOR};
pub use destroyer::CheckpointDestroyer;
pub use manager::{CheckpointError, CheckpointManager, DroppedCursors, RemovalResult};
pub use memory::{required_reduction, CheckpointMemoryStats, MemoryCounter};
pub use remover::{CheckpointRemover, CheckpointVisitor, RemoverOutcome, SkipReason};
