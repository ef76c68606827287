//! Per-write durability state: `Tracked` until the quorum and persistence
//! conditions of its level hold, then `Resolved` exactly once.

use super::notify::Completion;
use super::requirements::{Level, Requirements};
use super::topology::{NodeId, ReplicationTopology};
use crate::item::{DocKey, QueuedItem, Seqno};
use std::collections::BTreeSet;
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    Commit,
    Abort,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncWriteState {
    Tracked {
        acks: BTreeSet<NodeId>,
        persisted_locally: bool,
    },
    Resolved(Resolution),
}

/// Inputs that can move a tracked write forward.
#[derive(Debug, Clone, Copy)]
pub enum SyncWriteEvent<'a> {
    ReplicaAck(&'a NodeId),
    PersistedLocally,
    /// Re-check against the current topology without new input.
    Evaluate,
    Expired,
    AbortRequested,
}

impl SyncWriteState {
    pub fn tracked() -> Self {
        SyncWriteState::Tracked {
            acks: BTreeSet::new(),
            persisted_locally: false,
        }
    }

    pub fn is_tracked(&self) -> bool {
        matches!(self, SyncWriteState::Tracked { .. })
    }

    /// Applies `event`. Resolved states absorb every event, which keeps abort
    /// and timeout idempotent.
    pub fn next(
        self,
        level: Level,
        event: SyncWriteEvent<'_>,
        topology: Option<&ReplicationTopology>,
    ) -> SyncWriteState {
        let (mut acks, mut persisted_locally) = match self {
            SyncWriteState::Tracked {
                acks,
                persisted_locally,
            } => (acks, persisted_locally),
            resolved => return resolved,
        };
        match event {
            SyncWriteEvent::Expired | SyncWriteEvent::AbortRequested => {
                return SyncWriteState::Resolved(Resolution::Abort);
            }
            SyncWriteEvent::ReplicaAck(node) => {
                acks.insert(node.clone());
            }
            SyncWriteEvent::PersistedLocally => persisted_locally = true,
            SyncWriteEvent::Evaluate => {}
        }
        match topology {
            Some(topology) if quorum_met(level, &acks, persisted_locally, topology) => {
                SyncWriteState::Resolved(Resolution::Commit)
            }
            _ => SyncWriteState::Tracked {
                acks,
                persisted_locally,
            },
        }
    }
}

fn quorum_met(
    level: Level,
    acks: &BTreeSet<NodeId>,
    persisted_locally: bool,
    topology: &ReplicationTopology,
) -> bool {
    if level == Level::MajorityAndPersistOnMaster && !persisted_locally {
        return false;
    }
    let active_counts = match level {
        Level::None | Level::Majority | Level::MajorityAndPersistOnMaster => true,
        Level::PersistToMajority => persisted_locally,
    };
    topology.chains().iter().all(|chain| {
        let replica_acks = chain.replicas().filter(|node| acks.contains(*node)).count();
        let votes = replica_acks + usize::from(active_counts && chain.active().is_some());
        votes >= chain.majority()
    })
}

/// One prepare tracked by the active durability monitor.
#[derive(Debug)]
pub struct SyncWrite {
    prepare: QueuedItem,
    requirements: Requirements,
    deadline: Option<Instant>,
    state: SyncWriteState,
    completion: Completion,
}

impl SyncWrite {
    pub fn new(prepare: QueuedItem, deadline: Option<Instant>, completion: Completion) -> Self {
        let requirements = prepare.durability.unwrap_or_default();
        Self {
            prepare,
            requirements,
            deadline,
            state: SyncWriteState::tracked(),
            completion,
        }
    }

    pub fn seqno(&self) -> Seqno {
        self.prepare.seqno
    }

    pub fn key(&self) -> &DocKey {
        &self.prepare.key
    }

    pub fn level(&self) -> Level {
        self.requirements.level
    }

    pub fn prepare(&self) -> &QueuedItem {
        &self.prepare
    }

    pub fn state(&self) -> &SyncWriteState {
        &self.state
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn persisted_locally(&self) -> bool {
        matches!(
            self.state,
            SyncWriteState::Tracked {
                persisted_locally: true,
                ..
            }
        )
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        self.deadline.is_some_and(|deadline| deadline <= now)
    }

    /// Feeds one event through the state machine and reports a fresh
    /// resolution, if this event produced one.
    pub fn apply(
        &mut self,
        event: SyncWriteEvent<'_>,
        topology: Option<&ReplicationTopology>,
    ) -> Option<Resolution> {
        let was_tracked = self.state.is_tracked();
        let state = std::mem::replace(&mut self.state, SyncWriteState::tracked());
        self.state = state.next(self.requirements.level, event, topology);
        match (&self.state, was_tracked) {
            (SyncWriteState::Resolved(resolution), true) => Some(*resolution),
            _ => None,
        }
    }

    pub fn completion_mut(&mut self) -> &mut Completion {
        &mut self.completion
    }

    pub(crate) fn into_parts(self) -> (QueuedItem, Completion) {
        (self.prepare, self.completion)
    }
}
