//! Per-shard mutation log, synchronous-replication durability tracking and
//! the flush pipeline of a sharded key-value engine.
//!
//! Each [`Shard`] orders its mutations into checkpoints, tracks durable
//! writes until a majority of its replication chains has acknowledged them
//! and hands the log to the [`Flusher`] through the persistence cursor. A
//! [`Bucket`] groups shards under one checkpoint memory quota and runs the
//! background tasks on an [`ExecutorPool`].

pub mod bucket;
pub mod checkpoint;
pub mod config;
pub mod durability;
pub mod error;
pub mod executor;
pub mod flusher;
pub mod item;
pub mod shard;
pub mod store;
pub mod telemetry;

pub use bucket::{BackgroundTasks, Bucket};
pub use checkpoint::{
    CheckpointError, CheckpointManager, CheckpointRemover, CheckpointType, CursorBatch,
    CursorStart, RemoverOutcome, PERSISTENCE_CURSOR,
};
pub use config::{
    CheckpointConfig, ConfigError, DurabilityConfig, EngineConfig, FlusherConfig, RemovalMode,
};
pub use durability::{
    AdmissionError, DurabilityError, Level, NodeId, ReplicationChain, ReplicationTopology,
    Requirements, SyncWriteOutcome, SyncWriteWaiter, Timeout, TopologyError,
};
pub use error::{EngineError, WriteError};
pub use executor::{ExecutorPool, Task, TaskHandle, TaskStatus};
pub use flusher::{FlushResult, Flusher};
pub use item::{CollectionId, DocKey, MutationRecord, QueueOp, QueuedItem, Seqno, ShardId};
pub use shard::{Document, Shard, ShardState, ShardStats, WriteRequest, WriteResponse};
pub use store::{FileStore, InMemoryStore, PersistenceStore, StoreError};
pub use telemetry::{MetricsSnapshot, SharedMetricsRegistry};
