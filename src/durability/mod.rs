//! Synchronous-replication durability: admission of durable writes, the
//! per-write state machine and the active/passive monitors that resolve
//! prepares into commits or aborts.

pub mod monitor;
pub mod notify;
pub mod requirements;
pub mod sync_write;
pub mod topology;

pub use monitor::{
    ActiveDurabilityMonitor, DurabilityError, DurabilityMonitor, DurabilityStats,
    PassiveDurabilityMonitor, ResolvedSyncWrite,
};
pub use notify::{AmbiguityReason, Completion, SyncWriteOutcome, SyncWriteWaiter};
pub use requirements::{check_admission, AdmissionError, Level, Requirements, Timeout, MAX_REPLICAS};
pub use sync_write::{Resolution, SyncWrite, SyncWriteEvent, SyncWriteState};
pub use topology::{NodeId, ReplicationChain, ReplicationTopology, TopologyError};
