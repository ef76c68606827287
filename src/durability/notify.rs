//! Exactly-once completion channel between a tracked sync write and the
//! client that issued it.

use crate::item::Seqno;
use tokio::sync::oneshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AmbiguityReason {
    /// The durability deadline passed before a quorum formed.
    Timeout,
    /// Aborted by an explicit request.
    Aborted,
    /// The shard stopped being active while the write was in flight.
    Takeover,
    /// The tracking state was dropped without ever resolving.
    Dropped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncWriteOutcome {
    Success { commit_seqno: Seqno },
    Ambiguous { reason: AmbiguityReason },
}

impl SyncWriteOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, SyncWriteOutcome::Success { .. })
    }
}

/// Sending half held by the durability monitor. Only the first
/// [`Completion::complete`] call is delivered.
#[derive(Debug)]
pub struct Completion {
    tx: Option<oneshot::Sender<SyncWriteOutcome>>,
}

impl Completion {
    pub fn pair() -> (Completion, SyncWriteWaiter) {
        let (tx, rx) = oneshot::channel();
        (Completion { tx: Some(tx) }, SyncWriteWaiter { rx })
    }

    /// Completion with nobody listening, used for prepares that arrive
    /// through replication or warmup.
    pub fn detached() -> Self {
        Completion { tx: None }
    }

    /// Delivers `outcome` unless the completion already fired. Returns
    /// whether this call was the one that delivered.
    pub fn complete(&mut self, outcome: SyncWriteOutcome) -> bool {
        match self.tx.take() {
            Some(tx) => {
                // Receiver may be gone; the write is still resolved.
                let _ = tx.send(outcome);
                true
            }
            None => false,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.tx.is_some()
    }
}

/// Receiving half returned to the client with the "in progress" answer.
#[derive(Debug)]
pub struct SyncWriteWaiter {
    rx: oneshot::Receiver<SyncWriteOutcome>,
}

impl SyncWriteWaiter {
    pub async fn wait(self) -> SyncWriteOutcome {
        self.rx.await.unwrap_or(SyncWriteOutcome::Ambiguous {
            reason: AmbiguityReason::Dropped,
        })
    }

    /// Non-blocking poll; `None` while the write is still in flight.
    pub fn try_outcome(&mut self) -> Option<SyncWriteOutcome> {
        match self.rx.try_recv() {
            Ok(outcome) => Some(outcome),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(SyncWriteOutcome::Ambiguous {
                reason: AmbiguityReason::Dropped,
            }),
        }
    }
}
