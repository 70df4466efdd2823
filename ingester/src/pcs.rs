//! Per-partition consumption state.

use crate::completion::CompletionSignal;
use crate::div::DataIntegrityValidator;
use crate::offsets::OffsetRecord;
use bytes::Bytes;
use clock::Time;
use data_types::{FabricUrl, IncrementalPushPolicy, PartitionId, Topic, TopicSwitch};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// Role of a partition within its ingestion task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionState {
    /// Not subscribed.
    Offline,
    /// Tailing the version topic.
    Standby,
    /// Promotion requested; still tailing the version topic until it
    /// quiesces.
    InTransitionFromStandbyToLeader,
    /// Promotion paused while the store is a migration duplicate.
    PauseTransitionFromStandbyToLeader,
    /// Consuming the upstream source and producing to the version topic.
    Leader,
}

/// Last-write cache entry for the partial-update path, alive from produce to
/// drainer application.
#[derive(Debug, Clone, PartialEq)]
pub struct TransientRecord {
    /// Upstream offset of the update that wrote this value.
    pub offset: i64,
    /// The merged value; `None` for a delete.
    pub value: Option<Bytes>,
    /// Schema id of the merged value.
    pub value_schema_id: i32,
}

/// Mutable state of one partition. Role fields are written only by the
/// ingestion thread; drainers update the offset record and complete persist
/// futures through the shared mutex.
#[derive(Debug)]
pub struct PartitionConsumptionState {
    /// The (sub-)partition this state describes.
    pub partition: PartitionId,
    /// Sub-partitions per user partition.
    pub amplification_factor: u32,
    /// Whether the store takes nearline writes.
    pub hybrid: bool,
    /// How incremental pushes reach this version.
    pub incremental_push_policy: IncrementalPushPolicy,

    /// Current role.
    pub state: PartitionState,
    /// Durable checkpoint, mutated by drainers as records apply.
    pub offset_record: OffsetRecord,
    /// Data-integrity validator, rebuilt from the checkpoint on subscribe.
    pub div: DataIntegrityValidator,

    /// Whether the bulk-load segment finished.
    pub end_of_push_received: bool,
    /// Whether the leader consumes from a remote fabric.
    pub consume_remotely: bool,
    /// Fabric the current subscription points at; `None` means the local
    /// fabric.
    pub source_fabric_url: Option<FabricUrl>,
    /// Whether already-consumed upstream records are being skipped. Only set
    /// while remotely consuming a version topic after end-of-push.
    pub skip_upstream_records: bool,

    /// When the last record was consumed on the current subscription.
    pub latest_message_consumption_ts: Time,
    /// When this partition subscribed, for the bootstrap deadline.
    pub consumption_start_ts: Time,

    /// Topic switch waiting for leader execution.
    pub pending_topic_switch: Option<TopicSwitch>,
    /// Persist signal of the last leader-produced record.
    pub last_leader_persist_future: Option<CompletionSignal>,
    /// Persist signal of the last record enqueued to a drainer.
    pub last_queued_record_persisted_future: Option<CompletionSignal>,

    /// Last-write cache of the partial-update path.
    pub transient_records: HashMap<Bytes, TransientRecord>,

    /// Whether the hybrid rebalance latch was released.
    pub latch_released: bool,
    /// Whether completion was reported for this partition.
    pub completed_reported: bool,
    /// Whether a fatal error stopped this partition.
    pub failed: bool,

    /// Session the current role was installed under; stale role commands are
    /// skipped.
    pub leader_session_id: u64,
}

/// Shared handle to a partition's state.
pub type SharedPcs = Arc<Mutex<PartitionConsumptionState>>;

impl PartitionConsumptionState {
    /// State for a freshly subscribed partition.
    pub fn new(
        partition: PartitionId,
        amplification_factor: u32,
        hybrid: bool,
        incremental_push_policy: IncrementalPushPolicy,
        offset_record: OffsetRecord,
        session_id: u64,
        now: Time,
    ) -> Self {
        let div = DataIntegrityValidator::from_offset_record(&offset_record);
        let end_of_push_received = offset_record.end_of_push_received;
        Self {
            partition,
            amplification_factor,
            hybrid,
            incremental_push_policy,
            state: PartitionState::Standby,
            offset_record,
            div,
            end_of_push_received,
            consume_remotely: false,
            source_fabric_url: None,
            skip_upstream_records: false,
            latest_message_consumption_ts: now,
            consumption_start_ts: now,
            pending_topic_switch: None,
            last_leader_persist_future: None,
            last_queued_record_persisted_future: None,
            transient_records: HashMap::new(),
            latch_released: false,
            completed_reported: false,
            failed: false,
            leader_session_id: session_id,
        }
    }

    /// Whether this partition is the leader.
    pub fn is_leader(&self) -> bool {
        self.state == PartitionState::Leader
    }

    /// The topic the leader consumes, defaulting to the version topic.
    pub fn leader_topic_or(&self, version_topic: &Topic) -> Topic {
        self.offset_record
            .leader_topic()
            .unwrap_or_else(|| version_topic.clone())
    }

    /// Whether records consumed by this partition must be re-produced into
    /// the version topic.
    pub fn should_produce_to_version_topic(&self, version_topic: &Topic) -> bool {
        self.is_leader()
            && (self.leader_topic_or(version_topic) != *version_topic || self.consume_remotely)
    }

    /// Look up the last written value for `key` in the transient cache.
    pub fn transient_record(&self, key: &[u8]) -> Option<&TransientRecord> {
        self.transient_records.get(key)
    }

    /// Cache the merged value of `key` produced at `offset`.
    pub fn set_transient_record(
        &mut self,
        key: Bytes,
        offset: i64,
        value: Option<Bytes>,
        value_schema_id: i32,
    ) {
        self.transient_records.insert(
            key,
            TransientRecord {
                offset,
                value,
                value_schema_id,
            },
        );
    }

    /// Drop the cache entry for `key` once the record written at `offset`
    /// has been applied, unless a newer write refreshed it.
    pub fn prune_transient_record(&mut self, key: &[u8], offset: i64) {
        if let Some(entry) = self.transient_records.get(key) {
            if entry.offset <= offset {
                self.transient_records.remove(key);
            }
        }
    }

    /// Drop all cached values; called on any role change.
    pub fn clear_transient_records(&mut self) {
        self.transient_records.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use data_types::LOWEST_OFFSET;

    fn pcs() -> PartitionConsumptionState {
        PartitionConsumptionState::new(
            PartitionId::new(0),
            1,
            false,
            IncrementalPushPolicy::default(),
            OffsetRecord::empty(),
            0,
            Time::from_timestamp_millis(0),
        )
    }

    #[test]
    fn restores_from_offset_record() {
        let mut record = OffsetRecord::empty();
        record.end_of_push_received = true;
        record.leader_topic_raw = Some("s_rt".to_string());
        let state = PartitionConsumptionState::new(
            PartitionId::new(1),
            1,
            true,
            IncrementalPushPolicy::default(),
            record,
            0,
            Time::from_timestamp_millis(0),
        );
        assert!(state.end_of_push_received);
        assert_eq!(state.state, PartitionState::Standby);
        assert_eq!(
            state.leader_topic_or(&Topic::version_topic("s", 1)).as_str(),
            "s_rt"
        );
        assert_eq!(state.offset_record.local_version_topic_offset, LOWEST_OFFSET);
    }

    #[test]
    fn produce_predicate() {
        let vt = Topic::version_topic("s", 1);
        let mut state = pcs();

        // followers never produce
        state.offset_record.leader_topic_raw = Some("s_rt".to_string());
        assert!(!state.should_produce_to_version_topic(&vt));

        // leader on a different topic produces
        state.state = PartitionState::Leader;
        assert!(state.should_produce_to_version_topic(&vt));

        // leader on the local version topic does not
        state.offset_record.leader_topic_raw = Some(vt.as_str().to_string());
        assert!(!state.should_produce_to_version_topic(&vt));

        // unless it consumes remotely
        state.consume_remotely = true;
        assert!(state.should_produce_to_version_topic(&vt));
    }

    #[test]
    fn transient_cache_pruning() {
        let mut state = pcs();
        let key = Bytes::from_static(b"k");
        state.set_transient_record(key.clone(), 10, Some(Bytes::from_static(b"v")), 1);

        // an older apply does not evict
        state.prune_transient_record(&key, 9);
        assert!(state.transient_record(&key).is_some());

        // applying the producing record evicts
        state.prune_transient_record(&key, 10);
        assert!(state.transient_record(&key).is_none());
    }
}
