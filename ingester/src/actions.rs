//! Role-change and subscription commands, queued per task and processed
//! serially by the ingestion loop.

use data_types::PartitionId;
use parking_lot::Mutex;
use std::collections::VecDeque;

/// The commands the control plane may issue for a partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionKind {
    /// Start tailing the version topic.
    Subscribe,
    /// Stop consuming and forget the partition.
    Unsubscribe,
    /// Begin the deferred promotion to leader.
    StandbyToLeader,
    /// Demote back to standby.
    LeaderToStandby,
    /// Unsubscribe and delete local state.
    DropPartition,
}

/// One queued command. The session id captured at submission guards
/// execution; a stale session makes the action a no-op.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IngestionAction {
    /// What to do.
    pub kind: ActionKind,
    /// The partition to do it to.
    pub partition: PartitionId,
    /// Session current when the command was submitted.
    pub session_id: u64,
}

/// FIFO of pending actions, drained in batches by the ingestion loop.
#[derive(Debug, Default)]
pub struct ActionQueue {
    queue: Mutex<VecDeque<IngestionAction>>,
}

impl ActionQueue {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue an action.
    pub fn push(&self, action: IngestionAction) {
        self.queue.lock().push_back(action);
    }

    /// Take everything queued, preserving submission order.
    pub fn drain(&self) -> Vec<IngestionAction> {
        self.queue.lock().drain(..).collect()
    }

    /// Whether anything is pending.
    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drains_in_submission_order() {
        let queue = ActionQueue::new();
        for (i, kind) in [ActionKind::Subscribe, ActionKind::StandbyToLeader].iter().enumerate() {
            queue.push(IngestionAction {
                kind: *kind,
                partition: PartitionId::new(i as u32),
                session_id: i as u64,
            });
        }

        let drained = queue.drain();
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].kind, ActionKind::Subscribe);
        assert_eq!(drained[1].kind, ActionKind::StandbyToLeader);
        assert!(queue.is_empty());
    }
}
