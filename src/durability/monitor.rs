use super::notify::{AmbiguityReason, Completion, SyncWriteOutcome};
use super::requirements::{check_admission, AdmissionError, Level, Requirements};
use super::sync_write::{Resolution, SyncWrite, SyncWriteEvent, SyncWriteState};
use super::topology::{NodeId, ReplicationTopology};
use crate::item::{DocKey, QueuedItem, Seqno, ShardId};
use log::{debug, warn};
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DurabilityError {
    #[error("ack from {node} which is not in the replication topology")]
    UnknownReplica { node: NodeId },
    #[error("ack regression from {node}: {seqno} < {previous}")]
    AckRegression {
        node: NodeId,
        seqno: Seqno,
        previous: Seqno,
    },
    #[error("no tracked prepare {0}")]
    PrepareNotTracked(String),
    #[error("durability monitor is not active")]
    NotActive,
}

/// Prepare that left the tracked set and must have its Commit or Abort
/// queued by the owning shard.
#[derive(Debug)]
pub struct ResolvedSyncWrite {
    pub prepare: QueuedItem,
    pub resolution: Resolution,
    pub abort_reason: Option<AmbiguityReason>,
    completion: Completion,
}

impl ResolvedSyncWrite {
    /// Tells the waiting client how the write ended. `resolution_seqno` is
    /// the seqno the Commit was queued at.
    pub fn notify(mut self, resolution_seqno: Seqno) {
        let outcome = match self.resolution {
            Resolution::Commit => SyncWriteOutcome::Success {
                commit_seqno: resolution_seqno,
            },
            Resolution::Abort => SyncWriteOutcome::Ambiguous {
                reason: self.abort_reason.unwrap_or(AmbiguityReason::Aborted),
            },
        };
        self.completion.complete(outcome);
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DurabilityStats {
    pub committed: u64,
    pub aborted: u64,
    pub timeouts: u64,
}

/// Tracks prepares issued by this node while it is the active for a shard.
#[derive(Debug)]
pub struct ActiveDurabilityMonitor {
    shard: ShardId,
    topology: Option<ReplicationTopology>,
    tracked: VecDeque<SyncWrite>,
    replica_positions: HashMap<NodeId, Seqno>,
    resolved: VecDeque<ResolvedSyncWrite>,
    last_tracked_seqno: Seqno,
    persisted_seqno: Seqno,
    high_prepared_seqno: Seqno,
    max_completed_seqno: Seqno,
    default_timeout: Duration,
    persistent: bool,
    stats: DurabilityStats,
}

impl ActiveDurabilityMonitor {
    pub fn new(shard: ShardId, default_timeout: Duration, persistent: bool) -> Self {
        Self {
            shard,
            topology: None,
            tracked: VecDeque::new(),
            replica_positions: HashMap::new(),
            resolved: VecDeque::new(),
            last_tracked_seqno: 0,
            persisted_seqno: 0,
            high_prepared_seqno: 0,
            max_completed_seqno: 0,
            default_timeout,
            persistent,
            stats: DurabilityStats::default(),
        }
    }

    pub fn check_admission(&self, requirements: &Requirements) -> Result<(), AdmissionError> {
        check_admission(requirements, self.topology.as_ref(), self.persistent)
    }

    pub fn topology(&self) -> Option<&ReplicationTopology> {
        self.topology.as_ref()
    }

    /// Installs a new topology (or clears it) and re-evaluates every tracked
    /// write. Tracked writes survive a missing topology.
    pub fn set_topology(&mut self, topology: Option<ReplicationTopology>) {
        if let Some(new) = topology.as_ref() {
            self.replica_positions.retain(|node, _| new.contains(node));
        }
        self.topology = topology;
        for sw in self.tracked.iter_mut() {
            sw.apply(SyncWriteEvent::Evaluate, self.topology.as_ref());
        }
        self.drain_committed();
    }

    pub fn add_sync_write(&mut self, prepare: QueuedItem, completion: Completion, now: Instant) {
        assert!(
            prepare.is_pending(),
            "only prepares can be tracked, got {:?}",
            prepare.op
        );
        assert!(
            prepare.seqno > self.last_tracked_seqno,
            "{} prepare seqno {} not above last tracked {}",
            self.shard,
            prepare.seqno,
            self.last_tracked_seqno
        );
        self.last_tracked_seqno = prepare.seqno;
        let deadline = prepare
            .durability
            .unwrap_or_default()
            .deadline(now, self.default_timeout);
        let mut sw = SyncWrite::new(prepare, deadline, completion);
        sw.apply(SyncWriteEvent::Evaluate, self.topology.as_ref());
        self.tracked.push_back(sw);
        self.drain_committed();
    }

    /// Records that `node` has prepared everything up to `seqno`.
    pub fn seqno_ack_received(&mut self, node: &NodeId, seqno: Seqno) -> Result<(), DurabilityError> {
        let known = self
            .topology
            .as_ref()
            .is_some_and(|topology| topology.contains(node));
        if !known {
            warn!(
                "event=durability_unknown_replica shard={} node={} seqno={}",
                self.shard, node, seqno
            );
            return Err(DurabilityError::UnknownReplica { node: node.clone() });
        }
        if let Some(&previous) = self.replica_positions.get(node) {
            if seqno < previous {
                warn!(
                    "event=durability_ack_regression shard={} node={} seqno={} previous={}",
                    self.shard, node, seqno, previous
                );
                return Err(DurabilityError::AckRegression {
                    node: node.clone(),
                    seqno,
                    previous,
                });
            }
        }
        self.replica_positions.insert(node.clone(), seqno);
        for sw in self.tracked.iter_mut().take_while(|sw| sw.seqno() <= seqno) {
            sw.apply(SyncWriteEvent::ReplicaAck(node), self.topology.as_ref());
        }
        self.drain_committed();
        Ok(())
    }

    /// Flusher callback: everything up to `seqno` is on local disk.
    pub fn notify_local_persistence(&mut self, seqno: Seqno) {
        if seqno <= self.persisted_seqno {
            return;
        }
        self.persisted_seqno = seqno;
        for sw in self.tracked.iter_mut().take_while(|sw| sw.seqno() <= seqno) {
            sw.apply(SyncWriteEvent::PersistedLocally, self.topology.as_ref());
        }
        self.drain_committed();
    }

    pub fn abort(&mut self, prepare_seqno: Seqno) -> Result<(), DurabilityError> {
        let index = self
            .tracked
            .iter()
            .position(|sw| sw.seqno() == prepare_seqno && sw.state().is_tracked())
            .ok_or_else(|| DurabilityError::PrepareNotTracked(format!("seqno:{prepare_seqno}")))?;
        self.abort_at(index, SyncWriteEvent::AbortRequested, AmbiguityReason::Aborted);
        self.drain_committed();
        Ok(())
    }

    /// Aborts every tracked write whose deadline has passed. Returns how many
    /// were aborted.
    pub fn process_timeouts(&mut self, now: Instant) -> usize {
        let mut aborted = 0;
        let mut index = 0;
        while index < self.tracked.len() {
            let sw = &self.tracked[index];
            if sw.state().is_tracked() && sw.is_expired(now) {
                warn!(
                    "event=durability_timeout shard={} key={} prepare_seqno={} level={}",
                    self.shard,
                    sw.key(),
                    sw.seqno(),
                    sw.level().as_str()
                );
                self.abort_at(index, SyncWriteEvent::Expired, AmbiguityReason::Timeout);
                self.stats.timeouts += 1;
                aborted += 1;
            } else {
                index += 1;
            }
        }
        if aborted > 0 {
            self.drain_committed();
        }
        aborted
    }

    fn abort_at(&mut self, index: usize, event: SyncWriteEvent<'_>, reason: AmbiguityReason) {
        let Some(mut sw) = self.tracked.remove(index) else {
            return;
        };
        if sw.apply(event, self.topology.as_ref()) != Some(Resolution::Abort) {
            return;
        }
        self.max_completed_seqno = self.max_completed_seqno.max(sw.seqno());
        self.stats.aborted += 1;
        debug!(
            "event=durability_resolved shard={} key={} prepare_seqno={} resolution=abort",
            self.shard,
            sw.key(),
            sw.seqno()
        );
        let (prepare, completion) = sw.into_parts();
        self.resolved.push_back(ResolvedSyncWrite {
            prepare,
            resolution: Resolution::Abort,
            abort_reason: Some(reason),
            completion,
        });
    }

    /// Commits leave the tracked set strictly in prepare order, so a
    /// satisfied write waits behind an unsatisfied older one.
    fn drain_committed(&mut self) {
        while matches!(
            self.tracked.front().map(SyncWrite::state),
            Some(SyncWriteState::Resolved(Resolution::Commit))
        ) {
            let Some(sw) = self.tracked.pop_front() else {
                break;
            };
            self.max_completed_seqno = self.max_completed_seqno.max(sw.seqno());
            self.high_prepared_seqno = self.high_prepared_seqno.max(sw.seqno());
            self.stats.committed += 1;
            debug!(
                "event=durability_resolved shard={} key={} prepare_seqno={} resolution=commit",
                self.shard,
                sw.key(),
                sw.seqno()
            );
            let (prepare, completion) = sw.into_parts();
            self.resolved.push_back(ResolvedSyncWrite {
                prepare,
                resolution: Resolution::Commit,
                abort_reason: None,
                completion,
            });
        }
        self.advance_high_prepared();
    }

    fn advance_high_prepared(&mut self) {
        for sw in &self.tracked {
            if sw.seqno() <= self.high_prepared_seqno {
                continue;
            }
            let locally_prepared = match sw.level() {
                Level::None | Level::Majority => true,
                Level::MajorityAndPersistOnMaster | Level::PersistToMajority => {
                    sw.seqno() <= self.persisted_seqno
                }
            };
            if !locally_prepared {
                break;
            }
            self.high_prepared_seqno = sw.seqno();
        }
    }

    /// Resolutions waiting to be queued, oldest first.
    pub fn drain_resolved(&mut self) -> Vec<ResolvedSyncWrite> {
        self.resolved.drain(..).collect()
    }

    /// Replies `Ambiguous` to every waiting client; the writes stay tracked.
    pub fn notify_takeover(&mut self) {
        for sw in self.tracked.iter_mut() {
            sw.completion_mut().complete(SyncWriteOutcome::Ambiguous {
                reason: AmbiguityReason::Takeover,
            });
        }
    }

    pub fn num_tracked(&self) -> usize {
        self.tracked.len()
    }

    pub fn tracked_seqnos(&self) -> Vec<Seqno> {
        self.tracked.iter().map(SyncWrite::seqno).collect()
    }

    pub fn is_key_tracked(&self, key: &DocKey) -> bool {
        self.tracked.iter().any(|sw| sw.key() == key)
    }

    pub fn high_prepared_seqno(&self) -> Seqno {
        self.high_prepared_seqno
    }

    /// Every prepare at or below this seqno is completed. A completion past
    /// a still tracked prepare only counts once that prepare resolves.
    pub fn high_completed_seqno(&self) -> Seqno {
        match self.tracked.front() {
            Some(oldest) => self.max_completed_seqno.min(oldest.seqno() - 1),
            None => self.max_completed_seqno,
        }
    }

    pub fn stats(&self) -> DurabilityStats {
        self.stats
    }
}

#[derive(Debug, Clone)]
struct PassiveSyncWrite {
    prepare: QueuedItem,
    level: Level,
}

/// Replica-side tracking: prepares arrive from the active and are completed
/// by the Commit or Abort that follows them.
#[derive(Debug)]
pub struct PassiveDurabilityMonitor {
    shard: ShardId,
    tracked: VecDeque<PassiveSyncWrite>,
    last_tracked_seqno: Seqno,
    snapshot_end_received: Seqno,
    persisted_seqno: Seqno,
    high_prepared_seqno: Seqno,
    max_completed_seqno: Seqno,
}

impl PassiveDurabilityMonitor {
    pub fn new(shard: ShardId) -> Self {
        Self {
            shard,
            tracked: VecDeque::new(),
            last_tracked_seqno: 0,
            snapshot_end_received: 0,
            persisted_seqno: 0,
            high_prepared_seqno: 0,
            max_completed_seqno: 0,
        }
    }

    pub fn add_sync_write(&mut self, prepare: QueuedItem) {
        assert!(
            prepare.seqno > self.last_tracked_seqno,
            "{} replicated prepare seqno {} not above last tracked {}",
            self.shard,
            prepare.seqno,
            self.last_tracked_seqno
        );
        self.last_tracked_seqno = prepare.seqno;
        let level = prepare.durability.unwrap_or_default().level;
        self.tracked.push_back(PassiveSyncWrite { prepare, level });
    }

    /// The complete snapshot up to `snapshot_end` has been received.
    pub fn notify_snapshot_end_received(&mut self, snapshot_end: Seqno) {
        self.snapshot_end_received = self.snapshot_end_received.max(snapshot_end);
        self.advance_high_prepared();
    }

    pub fn notify_local_persistence(&mut self, seqno: Seqno) {
        self.persisted_seqno = self.persisted_seqno.max(seqno);
        self.advance_high_prepared();
    }

    /// Completes the oldest tracked prepare for `key`.
    pub fn complete_sync_write(
        &mut self,
        key: &DocKey,
        resolution: Resolution,
    ) -> Result<Seqno, DurabilityError> {
        let index = self
            .tracked
            .iter()
            .position(|pw| &pw.prepare.key == key)
            .ok_or_else(|| DurabilityError::PrepareNotTracked(key.to_string()))?;
        let Some(completed) = self.tracked.remove(index) else {
            return Err(DurabilityError::PrepareNotTracked(key.to_string()));
        };
        let seqno = completed.prepare.seqno;
        if resolution == Resolution::Commit {
            self.high_prepared_seqno = self.high_prepared_seqno.max(seqno);
        }
        self.max_completed_seqno = self.max_completed_seqno.max(seqno);
        debug!(
            "event=durability_passive_complete shard={} key={} prepare_seqno={} resolution={:?}",
            self.shard, key, seqno, resolution
        );
        self.advance_high_prepared();
        Ok(seqno)
    }

    fn advance_high_prepared(&mut self) {
        for pw in &self.tracked {
            let seqno = pw.prepare.seqno;
            if seqno <= self.high_prepared_seqno {
                continue;
            }
            let prepared = match pw.level {
                Level::PersistToMajority => seqno <= self.persisted_seqno,
                _ => seqno <= self.snapshot_end_received,
            };
            if !prepared {
                break;
            }
            self.high_prepared_seqno = seqno;
        }
    }

    pub fn num_tracked(&self) -> usize {
        self.tracked.len()
    }

    pub fn is_key_tracked(&self, key: &DocKey) -> bool {
        self.tracked.iter().any(|pw| &pw.prepare.key == key)
    }

    pub fn high_prepared_seqno(&self) -> Seqno {
        self.high_prepared_seqno
    }

    pub fn high_completed_seqno(&self) -> Seqno {
        match self.tracked.front() {
            Some(oldest) => self.max_completed_seqno.min(oldest.prepare.seqno - 1),
            None => self.max_completed_seqno,
        }
    }
}

/// The monitor a shard holds, switched with the shard's replication state.
#[derive(Debug)]
pub enum DurabilityMonitor {
    Active(ActiveDurabilityMonitor),
    Passive(PassiveDurabilityMonitor),
}

impl DurabilityMonitor {
    pub fn active(shard: ShardId, default_timeout: Duration, persistent: bool) -> Self {
        DurabilityMonitor::Active(ActiveDurabilityMonitor::new(
            shard,
            default_timeout,
            persistent,
        ))
    }

    pub fn passive(shard: ShardId) -> Self {
        DurabilityMonitor::Passive(PassiveDurabilityMonitor::new(shard))
    }

    pub fn as_active_mut(&mut self) -> Result<&mut ActiveDurabilityMonitor, DurabilityError> {
        match self {
            DurabilityMonitor::Active(adm) => Ok(adm),
            DurabilityMonitor::Passive(_) => Err(DurabilityError::NotActive),
        }
    }

    pub fn as_active(&self) -> Option<&ActiveDurabilityMonitor> {
        match self {
            DurabilityMonitor::Active(adm) => Some(adm),
            DurabilityMonitor::Passive(_) => None,
        }
    }

    pub fn as_passive_mut(&mut self) -> Option<&mut PassiveDurabilityMonitor> {
        match self {
            DurabilityMonitor::Passive(pdm) => Some(pdm),
            DurabilityMonitor::Active(_) => None,
        }
    }

    /// Becomes active; prepares inherited from the passive side start their
    /// durability timeout from `now`.
    pub fn into_active(
        self,
        default_timeout: Duration,
        persistent: bool,
        topology: Option<ReplicationTopology>,
        now: Instant,
    ) -> Self {
        match self {
            DurabilityMonitor::Active(mut adm) => {
                adm.set_topology(topology);
                DurabilityMonitor::Active(adm)
            }
            DurabilityMonitor::Passive(pdm) => {
                let mut adm = ActiveDurabilityMonitor::new(pdm.shard, default_timeout, persistent);
                adm.persisted_seqno = pdm.persisted_seqno;
                adm.high_prepared_seqno = pdm.high_prepared_seqno;
                adm.max_completed_seqno = pdm.max_completed_seqno;
                adm.last_tracked_seqno = pdm.last_tracked_seqno;
                for pw in pdm.tracked {
                    let deadline = pw
                        .prepare
                        .durability
                        .unwrap_or_default()
                        .deadline(now, default_timeout);
                    let persisted = pw.prepare.seqno <= adm.persisted_seqno;
                    let mut sw = SyncWrite::new(pw.prepare, deadline, Completion::detached());
                    if persisted {
                        sw.apply(SyncWriteEvent::PersistedLocally, None);
                    }
                    adm.tracked.push_back(sw);
                }
                adm.set_topology(topology);
                DurabilityMonitor::Active(adm)
            }
        }
    }

    /// Becomes passive. Waiting clients get `Ambiguous`; the prepares stay
    /// tracked until the new active resolves them.
    pub fn into_passive(self) -> Self {
        match self {
            DurabilityMonitor::Passive(pdm) => DurabilityMonitor::Passive(pdm),
            DurabilityMonitor::Active(mut adm) => {
                adm.notify_takeover();
                let mut pdm = PassiveDurabilityMonitor::new(adm.shard);
                pdm.persisted_seqno = adm.persisted_seqno;
                pdm.high_prepared_seqno = adm.high_prepared_seqno;
                pdm.max_completed_seqno = adm.max_completed_seqno;
                pdm.last_tracked_seqno = adm.last_tracked_seqno;
                for sw in adm.tracked {
                    let level = sw.level();
                    let (prepare, _) = sw.into_parts();
                    pdm.tracked.push_back(PassiveSyncWrite { prepare, level });
                }
                DurabilityMonitor::Passive(pdm)
            }
        }
    }

    pub fn notify_local_persistence(&mut self, seqno: Seqno) {
        match self {
            DurabilityMonitor::Active(adm) => adm.notify_local_persistence(seqno),
            DurabilityMonitor::Passive(pdm) => pdm.notify_local_persistence(seqno),
        }
    }

    pub fn num_tracked(&self) -> usize {
        match self {
            DurabilityMonitor::Active(adm) => adm.num_tracked(),
            DurabilityMonitor::Passive(pdm) => pdm.num_tracked(),
        }
    }

    pub fn is_key_tracked(&self, key: &DocKey) -> bool {
        match self {
            DurabilityMonitor::Active(adm) => adm.is_key_tracked(key),
            DurabilityMonitor::Passive(pdm) => pdm.is_key_tracked(key),
        }
    }

    pub fn high_prepared_seqno(&self) -> Seqno {
        match self {
            DurabilityMonitor::Active(adm) => adm.high_prepared_seqno(),
            DurabilityMonitor::Passive(pdm) => pdm.high_prepared_seqno(),
        }
    }

    pub fn high_completed_seqno(&self) -> Seqno {
        match self {
            DurabilityMonitor::Active(adm) => adm.high_completed_seqno(),
            DurabilityMonitor::Passive(pdm) => pdm.high_completed_seqno(),
        }
    }
}
