//! Data-integrity validation: per-producer segment/sequence tracking.
//!
//! Every producer stamps records with a `(segment, sequence)` position. The
//! validator checks each consumed record continues the producer's position;
//! anything else is a duplicate (skippable), a gap (fatal), or a producer we
//! have never seen mid-stream (benign, logged).
//!
//! Validator state is rebuildable from the positions checkpointed in the
//! partition's offset record.

use crate::offsets::{OffsetRecord, ProducerPosition};
use data_types::ProducerGuid;
use pubsub::{ControlMessage, Payload, ProducerMetadata};
use std::collections::HashMap;
use tracing::{debug, warn};

/// Validation failures.
#[derive(Debug, thiserror::Error)]
pub enum DivError {
    /// The record was already consumed; safe to skip.
    #[error(
        "duplicate record from producer {guid}: segment {segment} sequence {sequence} \
         already consumed"
    )]
    Duplicate {
        /// Producer identity.
        guid: ProducerGuid,
        /// Segment of the duplicate.
        segment: u32,
        /// Sequence of the duplicate.
        sequence: u32,
    },

    /// Records are missing between the tracked position and this record.
    #[error(
        "missing records from producer {guid}: tracked segment {tracked_segment} sequence \
         {tracked_sequence}, received segment {segment} sequence {sequence}"
    )]
    MissingRecords {
        /// Producer identity.
        guid: ProducerGuid,
        /// Last validated segment.
        tracked_segment: u32,
        /// Last validated sequence.
        tracked_sequence: u32,
        /// Segment of the received record.
        segment: u32,
        /// Sequence of the received record.
        sequence: u32,
    },
}

impl DivError {
    /// Whether this failure must fail the partition (before end-of-push).
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::Duplicate { .. })
    }
}

/// The offset-record mutation to apply once the validated record is durably
/// applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DivTransform {
    /// Producer whose position advanced.
    pub guid: ProducerGuid,
    /// The new position.
    pub position: ProducerPosition,
}

/// Per-partition validator.
#[derive(Debug, Default)]
pub struct DataIntegrityValidator {
    producers: HashMap<ProducerGuid, ProducerPosition>,
}

impl DataIntegrityValidator {
    /// A validator with no tracked producers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild from the positions checkpointed in `record`.
    pub fn from_offset_record(record: &OffsetRecord) -> Self {
        let producers = record
            .pending_offset_transformers
            .iter()
            .filter_map(|(hex, position)| {
                let bytes: Vec<u8> = (0..hex.len())
                    .step_by(2)
                    .filter_map(|i| u8::from_str_radix(hex.get(i..i + 2)?, 16).ok())
                    .collect();
                ProducerGuid::from_bytes(&bytes).ok().map(|g| (g, *position))
            })
            .collect();
        Self { producers }
    }

    /// Validate one record, advancing the producer's tracked position on
    /// success.
    pub fn validate(&mut self, producer: &ProducerMetadata, payload: &Payload) -> Result<DivTransform, DivError> {
        let guid = producer.guid;
        let segment = producer.segment;
        let sequence = producer.sequence;
        let starts_segment = matches!(payload, Payload::Control(ControlMessage::StartOfSegment));

        match self.producers.get(&guid) {
            None => {
                if segment != 0 || sequence != 0 {
                    // picked the producer up mid-stream, e.g. after a topic
                    // rewind past its registration
                    warn!(
                        %guid,
                        segment,
                        sequence,
                        "tracking unregistered producer from mid-stream position"
                    );
                }
            }
            Some(tracked) => {
                let missing = DivError::MissingRecords {
                    guid,
                    tracked_segment: tracked.segment,
                    tracked_sequence: tracked.sequence,
                    segment,
                    sequence,
                };
                let duplicate = DivError::Duplicate {
                    guid,
                    segment,
                    sequence,
                };
                if segment == tracked.segment {
                    if sequence <= tracked.sequence {
                        return Err(duplicate);
                    }
                    if sequence != tracked.sequence + 1 {
                        return Err(missing);
                    }
                } else if segment == tracked.segment + 1 {
                    // a new segment must open at zero; pass-through streams
                    // may drop the explicit marker
                    if sequence != 0 {
                        return Err(missing);
                    }
                    if !starts_segment {
                        debug!(%guid, segment, "segment rolled over without a marker");
                    }
                } else if segment < tracked.segment {
                    return Err(duplicate);
                } else {
                    return Err(missing);
                }
            }
        }

        let position = ProducerPosition { segment, sequence };
        self.producers.insert(guid, position);
        Ok(DivTransform { guid, position })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use bytes::Bytes;

    fn meta(guid: ProducerGuid, segment: u32, sequence: u32) -> ProducerMetadata {
        ProducerMetadata::new(guid, segment, sequence, 0)
    }

    fn put() -> Payload {
        Payload::Put {
            schema_id: 1,
            value: Bytes::from_static(b"v"),
        }
    }

    #[test]
    fn sequential_records_pass() {
        let mut v = DataIntegrityValidator::new();
        let guid = ProducerGuid::random();

        v.validate(&meta(guid, 0, 0), &put()).unwrap();
        v.validate(&meta(guid, 0, 1), &put()).unwrap();
        let t = v.validate(&meta(guid, 0, 2), &put()).unwrap();
        assert_eq!(t.position, ProducerPosition { segment: 0, sequence: 2 });
    }

    #[test]
    fn duplicates_are_skippable() {
        let mut v = DataIntegrityValidator::new();
        let guid = ProducerGuid::random();

        v.validate(&meta(guid, 0, 0), &put()).unwrap();
        v.validate(&meta(guid, 0, 1), &put()).unwrap();

        let err = v.validate(&meta(guid, 0, 1), &put()).unwrap_err();
        assert_matches!(err, DivError::Duplicate { sequence: 1, .. });
        assert!(!err.is_fatal());

        // the duplicate must not move the tracked position
        v.validate(&meta(guid, 0, 2), &put()).unwrap();
    }

    #[test]
    fn gaps_are_fatal() {
        let mut v = DataIntegrityValidator::new();
        let guid = ProducerGuid::random();

        v.validate(&meta(guid, 0, 0), &put()).unwrap();
        let err = v.validate(&meta(guid, 0, 5), &put()).unwrap_err();
        assert_matches!(err, DivError::MissingRecords { sequence: 5, .. });
        assert!(err.is_fatal());
    }

    #[test]
    fn segment_rollover() {
        let mut v = DataIntegrityValidator::new();
        let guid = ProducerGuid::random();

        v.validate(&meta(guid, 0, 3), &put()).unwrap();
        v.validate(
            &meta(guid, 1, 0),
            &Payload::Control(ControlMessage::StartOfSegment),
        )
        .unwrap();
        v.validate(&meta(guid, 1, 1), &put()).unwrap();

        // skipping a whole segment is a gap
        let err = v.validate(&meta(guid, 3, 0), &put()).unwrap_err();
        assert_matches!(err, DivError::MissingRecords { segment: 3, .. });

        // a stale segment is a duplicate
        let err = v.validate(&meta(guid, 0, 4), &put()).unwrap_err();
        assert_matches!(err, DivError::Duplicate { .. });
    }

    #[test]
    fn unregistered_producer_mid_stream_is_tolerated() {
        let mut v = DataIntegrityValidator::new();
        let guid = ProducerGuid::random();
        v.validate(&meta(guid, 4, 17), &put()).unwrap();
        v.validate(&meta(guid, 4, 18), &put()).unwrap();
    }

    #[test]
    fn rebuild_from_offset_record() {
        let mut v = DataIntegrityValidator::new();
        let guid = ProducerGuid::random();
        v.validate(&meta(guid, 0, 0), &put()).unwrap();
        let t = v.validate(&meta(guid, 0, 1), &put()).unwrap();

        let mut record = OffsetRecord::empty();
        record.record_producer_position(&t.guid, t.position);

        let mut rebuilt = DataIntegrityValidator::from_offset_record(&record);
        // continues where the checkpoint left off
        rebuilt.validate(&meta(guid, 0, 2), &put()).unwrap();
        let err = rebuilt.validate(&meta(guid, 0, 1), &put()).unwrap_err();
        assert_matches!(err, DivError::Duplicate { .. });
    }
}
