use crate::checkpoint::CheckpointError;
use crate::config::ConfigError;
use crate::durability::{AdmissionError, DurabilityError, TopologyError};
use crate::item::ShardId;
use crate::shard::ShardState;
use crate::store::StoreError;
use thiserror::Error;

/// Synchronous refusal of a client write. Nothing was queued.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WriteError {
    #[error(transparent)]
    Admission(#[from] AdmissionError),
    #[error("key already exists")]
    KeyExists,
    #[error("key not found")]
    KeyNotFound,
    #[error("cas mismatch: expected {expected}, found {actual}")]
    CasMismatch { expected: u64, actual: u64 },
    #[error("shard is {state}, not accepting this operation")]
    NotMyShard { state: ShardState },
}

impl WriteError {
    pub fn is_sync_write_in_progress(&self) -> bool {
        matches!(
            self,
            WriteError::Admission(AdmissionError::SyncWriteInProgress)
        )
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Write(#[from] WriteError),
    #[error(transparent)]
    Durability(#[from] DurabilityError),
    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Topology(#[from] TopologyError),
    #[error("unknown shard {0}")]
    UnknownShard(ShardId),
}
