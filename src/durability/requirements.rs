use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use thiserror::Error;

use super::topology::ReplicationTopology;

/// Hard cap on replicas per chain. Larger chains are not rollback-safe under
/// failover, so durable writes against them are refused.
pub const MAX_REPLICAS: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Level {
    None,
    #[default]
    Majority,
    MajorityAndPersistOnMaster,
    PersistToMajority,
}

impl Level {
    /// Levels that need the active node to have persisted the prepare.
    pub fn requires_persistence(self) -> bool {
        matches!(
            self,
            Level::MajorityAndPersistOnMaster | Level::PersistToMajority
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Level::None => "none",
            Level::Majority => "majority",
            Level::MajorityAndPersistOnMaster => "majority_and_persist_on_master",
            Level::PersistToMajority => "persist_to_majority",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Timeout {
    /// Use the bucket's configured default.
    #[default]
    BucketDefault,
    Infinite,
    Millis(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Requirements {
    pub level: Level,
    #[serde(default)]
    pub timeout: Timeout,
}

impl Requirements {
    pub fn new(level: Level) -> Self {
        Self {
            level,
            timeout: Timeout::BucketDefault,
        }
    }

    pub fn with_timeout(mut self, timeout: Timeout) -> Self {
        self.timeout = timeout;
        self
    }

    /// Absolute deadline of a prepare tracked from `now`, or `None` when it
    /// may wait forever.
    pub fn deadline(&self, now: Instant, bucket_default: Duration) -> Option<Instant> {
        match self.timeout {
            Timeout::Infinite => None,
            Timeout::BucketDefault => now.checked_add(bucket_default),
            Timeout::Millis(ms) => now.checked_add(Duration::from_millis(u64::from(ms))),
        }
    }
}

/// Synchronous refusal of a write, raised before any state is touched.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AdmissionError {
    #[error("durability impossible: {reason}")]
    DurabilityImpossible { reason: &'static str },
    #[error("durability level {level} not supported by this shard")]
    DurabilityInvalidLevel { level: &'static str },
    #[error("sync write already in progress for key")]
    SyncWriteInProgress,
}

/// Validates a durability requirement against the shard's capabilities and
/// the current replication topology.
pub fn check_admission(
    requirements: &Requirements,
    topology: Option<&ReplicationTopology>,
    persistent: bool,
) -> Result<(), AdmissionError> {
    if requirements.level == Level::None {
        return Err(AdmissionError::DurabilityInvalidLevel {
            level: Level::None.as_str(),
        });
    }
    if !persistent && requirements.level.requires_persistence() {
        return Err(AdmissionError::DurabilityInvalidLevel {
            level: requirements.level.as_str(),
        });
    }
    let Some(topology) = topology else {
        return Err(AdmissionError::DurabilityImpossible {
            reason: "no replication topology",
        });
    };
    if topology.max_replicas() > MAX_REPLICAS {
        return Err(AdmissionError::DurabilityImpossible {
            reason: "too many replicas",
        });
    }
    if !topology.majority_reachable() {
        return Err(AdmissionError::DurabilityImpossible {
            reason: "not enough defined nodes for majority",
        });
    }
    Ok(())
}
