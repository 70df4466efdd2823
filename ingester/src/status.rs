//! Reporting seam towards the control plane.

use data_types::PartitionId;
use parking_lot::Mutex;
use std::fmt::Debug;
use tracing::{error, info};

/// Callbacks the engine raises as partitions make progress or fail.
pub trait StatusReporter: Debug + Send + Sync + 'static {
    /// The partition caught up and may serve reads.
    fn completed(&self, partition: PartitionId);

    /// The partition failed fatally.
    fn error(&self, partition: PartitionId, message: &str);

    /// The partition's version-topic base is caught up; releases the
    /// optional rebalance latch. Fired at most once per partition.
    fn caught_up_base_topic(&self, partition: PartitionId);

    /// An incremental push started.
    fn start_of_incremental_push(&self, partition: PartitionId, version: &str);

    /// An incremental push finished.
    fn end_of_incremental_push(&self, partition: PartitionId, version: &str);

    /// A topic switch was accepted.
    fn topic_switch_received(&self, partition: PartitionId);
}

/// Reporter that only logs.
#[derive(Debug, Default)]
pub struct LoggingStatusReporter;

impl StatusReporter for LoggingStatusReporter {
    fn completed(&self, partition: PartitionId) {
        info!(%partition, "partition completed");
    }

    fn error(&self, partition: PartitionId, message: &str) {
        error!(%partition, message, "partition failed");
    }

    fn caught_up_base_topic(&self, partition: PartitionId) {
        info!(%partition, "base topic caught up");
    }

    fn start_of_incremental_push(&self, partition: PartitionId, version: &str) {
        info!(%partition, version, "incremental push started");
    }

    fn end_of_incremental_push(&self, partition: PartitionId, version: &str) {
        info!(%partition, version, "incremental push finished");
    }

    fn topic_switch_received(&self, partition: PartitionId) {
        info!(%partition, "topic switch received");
    }
}

/// One reported status change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusEvent {
    /// [`StatusReporter::completed`].
    Completed(PartitionId),
    /// [`StatusReporter::error`].
    Error(PartitionId, String),
    /// [`StatusReporter::caught_up_base_topic`].
    CaughtUpBaseTopic(PartitionId),
    /// [`StatusReporter::start_of_incremental_push`].
    StartOfIncrementalPush(PartitionId, String),
    /// [`StatusReporter::end_of_incremental_push`].
    EndOfIncrementalPush(PartitionId, String),
    /// [`StatusReporter::topic_switch_received`].
    TopicSwitchReceived(PartitionId),
}

/// Reporter that records every event, for tests.
#[derive(Debug, Default)]
pub struct RecordingStatusReporter {
    events: Mutex<Vec<StatusEvent>>,
}

impl RecordingStatusReporter {
    /// Create an empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// All events reported so far.
    pub fn events(&self) -> Vec<StatusEvent> {
        self.events.lock().clone()
    }

    /// Whether `event` was reported.
    pub fn contains(&self, event: &StatusEvent) -> bool {
        self.events.lock().contains(event)
    }

    /// Errors reported for `partition`.
    pub fn errors_for(&self, partition: PartitionId) -> Vec<String> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                StatusEvent::Error(p, message) if *p == partition => Some(message.clone()),
                _ => None,
            })
            .collect()
    }
}

impl StatusReporter for RecordingStatusReporter {
    fn completed(&self, partition: PartitionId) {
        self.events.lock().push(StatusEvent::Completed(partition));
    }

    fn error(&self, partition: PartitionId, message: &str) {
        self.events
            .lock()
            .push(StatusEvent::Error(partition, message.to_string()));
    }

    fn caught_up_base_topic(&self, partition: PartitionId) {
        self.events
            .lock()
            .push(StatusEvent::CaughtUpBaseTopic(partition));
    }

    fn start_of_incremental_push(&self, partition: PartitionId, version: &str) {
        self.events
            .lock()
            .push(StatusEvent::StartOfIncrementalPush(partition, version.to_string()));
    }

    fn end_of_incremental_push(&self, partition: PartitionId, version: &str) {
        self.events
            .lock()
            .push(StatusEvent::EndOfIncrementalPush(partition, version.to_string()));
    }

    fn topic_switch_received(&self, partition: PartitionId) {
        self.events
            .lock()
            .push(StatusEvent::TopicSwitchReceived(partition));
    }
}
