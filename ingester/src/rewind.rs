//! Classification of upstream-offset rewinds.
//!
//! A rewind (a record whose upstream offset is below the last recorded one,
//! stamped by a different producer) is the signature of split-brain
//! leadership. It is benign when the rewound record carries exactly what
//! storage already holds, lossy otherwise.

use bytes::Bytes;
use data_types::{PartitionId, ProducerGuid};
use std::sync::Arc;
use storage::StorageEngine;

/// Payload shapes a rewound record can carry.
#[derive(Debug)]
pub enum RewindPayload<'a> {
    /// Full value write.
    Put {
        /// Writer schema id.
        schema_id: i32,
        /// Serialized value, without the storage header.
        value: &'a Bytes,
    },
    /// Tombstone.
    Delete,
    /// Control or partial-update record.
    Other,
}

/// Outcome of classifying a rewind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RewindClassification {
    /// The rewound record matches current state; no data can be lost.
    Benign,
    /// The rewound record conflicts with current state.
    Lossy {
        /// Human-readable conflict description.
        reason: String,
    },
}

/// Identity of the producer a record claims, used to detect that a rewind
/// came from a different leader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProducerIdentity {
    /// Producer guid, when known.
    pub guid: Option<ProducerGuid>,
    /// Producing host, when known.
    pub host_id: Option<String>,
}

impl ProducerIdentity {
    /// Whether `self` and `other` are known to be different producers.
    ///
    /// Missing fields compare as equal; only a positive mismatch of guid or
    /// host counts.
    pub fn differs_from(&self, other: &Self) -> bool {
        let guid_mismatch = matches!((&self.guid, &other.guid), (Some(a), Some(b)) if a != b);
        let host_mismatch =
            matches!((&self.host_id, &other.host_id), (Some(a), Some(b)) if a != b);
        guid_mismatch || host_mismatch
    }
}

/// Classify a rewound record against what storage currently holds.
///
/// Values are stored with a 4-byte big-endian schema-id header; a put is
/// benign only when both the schema id and the bytes after the header match.
pub fn classify_rewind(
    storage: &Arc<dyn StorageEngine>,
    partition: PartitionId,
    key: &[u8],
    payload: RewindPayload<'_>,
) -> RewindClassification {
    match payload {
        RewindPayload::Put { schema_id, value } => {
            let stored = match storage.get(partition, key) {
                Ok(stored) => stored,
                Err(e) => {
                    return RewindClassification::Lossy {
                        reason: format!("storage lookup failed: {e}"),
                    }
                }
            };
            let Some(stored) = stored else {
                return RewindClassification::Lossy {
                    reason: "rewound put but key is absent".to_string(),
                };
            };
            if stored.len() < 4 {
                return RewindClassification::Lossy {
                    reason: "stored value has no schema header".to_string(),
                };
            }
            let stored_schema_id =
                i32::from_be_bytes([stored[0], stored[1], stored[2], stored[3]]);
            if stored_schema_id != schema_id {
                return RewindClassification::Lossy {
                    reason: format!(
                        "schema id mismatch: stored {stored_schema_id}, rewound {schema_id}"
                    ),
                };
            }
            if &stored[4..] != value.as_ref() {
                return RewindClassification::Lossy {
                    reason: "value bytes differ from stored value".to_string(),
                };
            }
            RewindClassification::Benign
        }
        RewindPayload::Delete => match storage.get(partition, key) {
            Ok(None) => RewindClassification::Benign,
            Ok(Some(_)) => RewindClassification::Lossy {
                reason: "rewound delete but key is present".to_string(),
            },
            Err(e) => RewindClassification::Lossy {
                reason: format!("storage lookup failed: {e}"),
            },
        },
        RewindPayload::Other => RewindClassification::Lossy {
            reason: "rewound control or update record".to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use storage::MemStorageEngine;

    fn engine_with(key: &[u8], schema_id: i32, value: &[u8]) -> Arc<dyn StorageEngine> {
        let engine = MemStorageEngine::new();
        let p = PartitionId::new(0);
        engine.create_partition(p).unwrap();
        let mut stored = schema_id.to_be_bytes().to_vec();
        stored.extend_from_slice(value);
        engine.put(p, key, &stored).unwrap();
        Arc::new(engine)
    }

    #[test]
    fn matching_put_is_benign() {
        let storage = engine_with(b"k", 1, b"v3");
        let value = Bytes::from_static(b"v3");
        assert_eq!(
            classify_rewind(
                &storage,
                PartitionId::new(0),
                b"k",
                RewindPayload::Put { schema_id: 1, value: &value },
            ),
            RewindClassification::Benign
        );
    }

    #[test]
    fn conflicting_put_is_lossy() {
        let storage = engine_with(b"k", 1, b"v2");
        let value = Bytes::from_static(b"v3");
        assert_matches::assert_matches!(
            classify_rewind(
                &storage,
                PartitionId::new(0),
                b"k",
                RewindPayload::Put { schema_id: 1, value: &value },
            ),
            RewindClassification::Lossy { .. }
        );
    }

    #[test]
    fn schema_mismatch_is_lossy() {
        let storage = engine_with(b"k", 2, b"v3");
        let value = Bytes::from_static(b"v3");
        assert_matches::assert_matches!(
            classify_rewind(
                &storage,
                PartitionId::new(0),
                b"k",
                RewindPayload::Put { schema_id: 1, value: &value },
            ),
            RewindClassification::Lossy { .. }
        );
    }

    #[test]
    fn delete_of_absent_key_is_benign() {
        let storage: Arc<dyn StorageEngine> = {
            let engine = MemStorageEngine::new();
            engine.create_partition(PartitionId::new(0)).unwrap();
            Arc::new(engine)
        };
        assert_eq!(
            classify_rewind(&storage, PartitionId::new(0), b"k", RewindPayload::Delete),
            RewindClassification::Benign
        );

        let storage = engine_with(b"k", 1, b"v");
        assert_matches::assert_matches!(
            classify_rewind(&storage, PartitionId::new(0), b"k", RewindPayload::Delete),
            RewindClassification::Lossy { .. }
        );
    }

    #[test]
    fn control_rewind_is_lossy() {
        let storage = engine_with(b"k", 1, b"v");
        assert_matches::assert_matches!(
            classify_rewind(&storage, PartitionId::new(0), b"k", RewindPayload::Other),
            RewindClassification::Lossy { .. }
        );
    }

    #[test]
    fn identity_comparison() {
        let guid_a = ProducerGuid::random();
        let guid_b = ProducerGuid::random();

        let a = ProducerIdentity { guid: Some(guid_a), host_id: Some("h1".into()) };
        let b = ProducerIdentity { guid: Some(guid_b), host_id: Some("h1".into()) };
        assert!(a.differs_from(&b));

        let same = ProducerIdentity { guid: Some(guid_a), host_id: None };
        assert!(!a.differs_from(&same));

        let host_only = ProducerIdentity { guid: None, host_id: Some("h2".into()) };
        assert!(a.differs_from(&host_only));
    }
}
