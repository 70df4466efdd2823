//! Error taxonomy of the ingestion engine.
//!
//! Fatal errors fail a partition (or the whole task); everything else is
//! recorded in metrics and processing continues. Drainer and producer
//! completions stage their errors here and the next ingestion loop iteration
//! surfaces them.

use crate::div::DivError;
use data_types::PartitionId;
use parking_lot::Mutex;
use pubsub::PubSubError;
use snafu::Snafu;
use storage::StorageError;

/// Errors raised by the ingestion engine.
#[derive(Debug, Snafu)]
#[allow(missing_docs)]
#[snafu(visibility(pub(crate)))]
pub enum IngestError {
    #[snafu(display("protocol violation on partition {partition}: {reason}"))]
    ProtocolViolation {
        partition: PartitionId,
        reason: String,
    },

    #[snafu(display("data validation failed on partition {partition}: {source}"))]
    DataValidation {
        partition: PartitionId,
        source: DivError,
    },

    #[snafu(display("lossy upstream rewind on partition {partition}: {reason}"))]
    LossyRewind {
        partition: PartitionId,
        reason: String,
    },

    #[snafu(display("partition {partition} exceeded its bootstrap deadline"))]
    PushTimeout { partition: PartitionId },

    #[snafu(display("storage failure on partition {partition}: {source}"))]
    Storage {
        partition: PartitionId,
        source: StorageError,
    },

    #[snafu(display("metadata store failure on partition {partition}: {source}"))]
    Metadata {
        partition: PartitionId,
        source: crate::offsets::MetadataError,
    },

    #[snafu(display("producer failure on partition {partition}: {source}"))]
    Producer {
        partition: PartitionId,
        source: PubSubError,
    },

    #[snafu(display("fabric failure: {source}"))]
    Fabric { source: PubSubError },

    #[snafu(display("ingestion task is not running"))]
    NotRunning,
}

impl IngestError {
    /// The partition this error fails, if it is partition-scoped.
    pub fn partition(&self) -> Option<PartitionId> {
        match self {
            Self::ProtocolViolation { partition, .. }
            | Self::DataValidation { partition, .. }
            | Self::LossyRewind { partition, .. }
            | Self::PushTimeout { partition }
            | Self::Storage { partition, .. }
            | Self::Metadata { partition, .. }
            | Self::Producer { partition, .. } => Some(*partition),
            Self::Fabric { .. } | Self::NotRunning => None,
        }
    }
}

#[allow(missing_docs)]
pub type Result<T, E = IngestError> = std::result::Result<T, E>;

/// Staging area for errors raised off the ingestion thread.
///
/// Drainers and produce completions `offer` errors here; the ingestion loop
/// drains the sink at the start of every iteration and fails the affected
/// partitions.
#[derive(Debug, Default)]
pub struct ErrorSink {
    staged: Mutex<Vec<IngestError>>,
}

impl ErrorSink {
    /// Create an empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Stage an error for the next loop iteration.
    pub fn offer(&self, error: IngestError) {
        self.staged.lock().push(error);
    }

    /// Take all staged errors.
    pub fn drain(&self) -> Vec<IngestError> {
        std::mem::take(&mut *self.staged.lock())
    }

    /// Whether anything is staged.
    pub fn has_errors(&self) -> bool {
        !self.staged.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sink_drains_in_order() {
        let sink = ErrorSink::new();
        assert!(!sink.has_errors());

        sink.offer(IngestError::PushTimeout {
            partition: PartitionId::new(1),
        });
        sink.offer(IngestError::NotRunning);
        assert!(sink.has_errors());

        let drained = sink.drain();
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].partition(), Some(PartitionId::new(1)));
        assert_eq!(drained[1].partition(), None);
        assert!(!sink.has_errors());
    }
}
