//! Persistent per-partition offset records and per-version state.
//!
//! Both are prost-encoded into the storage engine's metadata partition, the
//! offset record under `P_<partitionId>` and the version state under
//! `VERSION_METADATA`. The version state is mutated only by the ingestion
//! thread of the owning task and served to readers through a single-entry
//! cache.

use data_types::{
    CompressionStrategy, FabricUrl, PartitionId, ProducerGuid, Topic, TopicSwitch, LOWEST_OFFSET,
    SINGLE_SOURCE_UPSTREAM_KEY,
};
use parking_lot::RwLock;
use prost::Message;
use snafu::{ResultExt, Snafu};
use std::collections::BTreeMap;
use std::sync::Arc;
use storage::StorageEngine;

/// Metadata-partition key of the per-version state.
pub const VERSION_METADATA_KEY: &str = "VERSION_METADATA";

fn offset_record_key(partition: PartitionId) -> String {
    format!("P_{partition}")
}

/// Errors of the offset/version metadata store.
#[derive(Debug, Snafu)]
#[allow(missing_docs)]
pub enum MetadataError {
    #[snafu(display("metadata read/write failed: {source}"))]
    Storage { source: storage::StorageError },

    #[snafu(display("persisted metadata is corrupt: {source}"))]
    Corrupt { source: prost::DecodeError },
}

#[allow(missing_docs)]
pub type Result<T, E = MetadataError> = std::result::Result<T, E>;

/// Last validated segment/sequence position of one producer, persisted so the
/// validator can be rebuilt after a restart.
#[derive(Clone, Copy, PartialEq, Eq, ::prost::Message)]
pub struct ProducerPosition {
    /// Segment counter.
    #[prost(uint32, tag = "1")]
    pub segment: u32,
    /// Sequence within the segment.
    #[prost(uint32, tag = "2")]
    pub sequence: u32,
}

/// Durable per-partition ingestion checkpoint.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct OffsetRecord {
    /// Last version-topic offset durably applied. Monotonically
    /// non-decreasing on a given host.
    #[prost(int64, tag = "1")]
    pub local_version_topic_offset: i64,

    /// Topic the leader is (or last was) consuming.
    #[prost(string, optional, tag = "2")]
    pub leader_topic_raw: Option<String>,

    /// Last-consumed offset per upstream key.
    #[prost(btree_map = "string, int64", tag = "3")]
    pub upstream_offsets: BTreeMap<String, i64>,

    /// Identity of the leader that produced the last persisted record.
    #[prost(bytes = "vec", optional, tag = "4")]
    pub leader_producer_guid: Option<Vec<u8>>,

    /// Host id of that leader.
    #[prost(string, optional, tag = "5")]
    pub leader_host_id: Option<String>,

    /// Validator positions to re-apply on restart, keyed by producer guid in
    /// hex.
    #[prost(btree_map = "string, message", tag = "6")]
    pub pending_offset_transformers: BTreeMap<String, ProducerPosition>,

    /// Whether the bulk-load segment of this partition finished.
    #[prost(bool, tag = "7")]
    pub end_of_push_received: bool,
}

impl OffsetRecord {
    /// A checkpoint for a partition that has consumed nothing yet.
    pub fn empty() -> Self {
        Self {
            local_version_topic_offset: LOWEST_OFFSET,
            ..Default::default()
        }
    }

    /// The single-source upstream offset, when one was recorded.
    pub fn upstream_offset(&self) -> Option<i64> {
        self.upstream_offsets
            .get(SINGLE_SOURCE_UPSTREAM_KEY)
            .copied()
    }

    /// Record the single-source upstream offset. Rewinds are recorded too;
    /// followers must track the true leader position.
    pub fn set_upstream_offset(&mut self, offset: i64) {
        self.upstream_offsets
            .insert(SINGLE_SOURCE_UPSTREAM_KEY.to_string(), offset);
    }

    /// The leader topic as a [`Topic`], when set.
    pub fn leader_topic(&self) -> Option<Topic> {
        self.leader_topic_raw.as_deref().map(Topic::parse)
    }

    /// Remember a validated producer position.
    pub fn record_producer_position(&mut self, guid: &ProducerGuid, position: ProducerPosition) {
        self.pending_offset_transformers
            .insert(guid.to_hex(), position);
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
struct TopicSwitchPb {
    #[prost(string, tag = "1")]
    source_topic: String,
    #[prost(string, repeated, tag = "2")]
    source_fabric_urls: Vec<String>,
    #[prost(int64, tag = "3")]
    rewind_start_timestamp: i64,
}

impl From<&TopicSwitch> for TopicSwitchPb {
    fn from(v: &TopicSwitch) -> Self {
        Self {
            source_topic: v.source_topic.as_str().to_string(),
            source_fabric_urls: v
                .source_fabric_urls
                .iter()
                .map(|u| u.as_str().to_string())
                .collect(),
            rewind_start_timestamp: v.rewind_start_timestamp,
        }
    }
}

impl From<TopicSwitchPb> for TopicSwitch {
    fn from(v: TopicSwitchPb) -> Self {
        Self {
            source_topic: Topic::parse(v.source_topic),
            source_fabric_urls: v
                .source_fabric_urls
                .into_iter()
                .map(FabricUrl::new)
                .collect(),
            rewind_start_timestamp: v.rewind_start_timestamp,
        }
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
struct StoreVersionStatePb {
    #[prost(bool, tag = "1")]
    chunking_enabled: bool,
    #[prost(int32, tag = "2")]
    compression: i32,
    #[prost(message, optional, tag = "3")]
    last_topic_switch: Option<TopicSwitchPb>,
}

/// Durable per-version state, created on the first `StartOfPush`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StoreVersionState {
    /// Whether values in this version may be chunked.
    pub chunking_enabled: bool,
    /// Value compression of this version.
    pub compression: CompressionStrategy,
    /// The last topic switch observed, surviving restarts so a recovering
    /// leader picks the right upstream.
    pub last_topic_switch: Option<TopicSwitch>,
}

impl StoreVersionState {
    fn to_pb(&self) -> StoreVersionStatePb {
        StoreVersionStatePb {
            chunking_enabled: self.chunking_enabled,
            compression: self.compression.as_i32(),
            last_topic_switch: self.last_topic_switch.as_ref().map(Into::into),
        }
    }

    fn from_pb(pb: StoreVersionStatePb) -> Self {
        Self {
            chunking_enabled: pb.chunking_enabled,
            compression: CompressionStrategy::from_i32(pb.compression),
            last_topic_switch: pb.last_topic_switch.map(Into::into),
        }
    }
}

/// Read-through, write-through store for offset records and the version
/// state.
#[derive(Debug)]
pub struct OffsetMetadataStore {
    storage: Arc<dyn StorageEngine>,
    version_state: RwLock<Option<Arc<StoreVersionState>>>,
}

impl OffsetMetadataStore {
    /// Create a store over `storage`'s metadata partition.
    pub fn new(storage: Arc<dyn StorageEngine>) -> Self {
        Self {
            storage,
            version_state: RwLock::new(None),
        }
    }

    /// Load the checkpoint of `partition`, or an empty one.
    pub fn load_offset_record(&self, partition: PartitionId) -> Result<OffsetRecord> {
        let bytes = self
            .storage
            .get_metadata(&offset_record_key(partition))
            .context(StorageSnafu)?;
        match bytes {
            Some(bytes) => OffsetRecord::decode(bytes.as_ref()).context(CorruptSnafu),
            None => Ok(OffsetRecord::empty()),
        }
    }

    /// Write through the checkpoint of `partition`.
    pub fn save_offset_record(&self, partition: PartitionId, record: &OffsetRecord) -> Result<()> {
        let mut buf = Vec::with_capacity(record.encoded_len());
        record.encode(&mut buf).expect("buffer sized upfront");
        self.storage
            .put_metadata(&offset_record_key(partition), &buf)
            .context(StorageSnafu)
    }

    /// Remove the checkpoint of `partition`.
    pub fn delete_offset_record(&self, partition: PartitionId) -> Result<()> {
        self.storage
            .delete_metadata(&offset_record_key(partition))
            .context(StorageSnafu)
    }

    /// The version state, through the single-entry cache.
    pub fn version_state(&self) -> Result<Option<Arc<StoreVersionState>>> {
        if let Some(state) = self.version_state.read().as_ref() {
            return Ok(Some(Arc::clone(state)));
        }

        let bytes = self
            .storage
            .get_metadata(VERSION_METADATA_KEY)
            .context(StorageSnafu)?;
        let Some(bytes) = bytes else { return Ok(None) };

        let decoded = Arc::new(StoreVersionState::from_pb(
            StoreVersionStatePb::decode(bytes.as_ref()).context(CorruptSnafu)?,
        ));
        *self.version_state.write() = Some(Arc::clone(&decoded));
        Ok(Some(decoded))
    }

    /// Mutate the version state (creating it on first use), write it through,
    /// and refresh the cache.
    pub fn update_version_state(
        &self,
        f: impl FnOnce(&mut StoreVersionState),
    ) -> Result<Arc<StoreVersionState>> {
        let mut state = self
            .version_state()?
            .map(|s| (*s).clone())
            .unwrap_or_default();
        f(&mut state);

        let pb = state.to_pb();
        let mut buf = Vec::with_capacity(pb.encoded_len());
        pb.encode(&mut buf).expect("buffer sized upfront");
        self.storage
            .put_metadata(VERSION_METADATA_KEY, &buf)
            .context(StorageSnafu)?;

        let state = Arc::new(state);
        *self.version_state.write() = Some(Arc::clone(&state));
        Ok(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use storage::MemStorageEngine;

    fn store() -> OffsetMetadataStore {
        OffsetMetadataStore::new(Arc::new(MemStorageEngine::new()))
    }

    #[test]
    fn offset_record_round_trip() {
        let store = store();
        let p = PartitionId::new(5);

        // missing record loads as empty
        let record = store.load_offset_record(p).unwrap();
        assert_eq!(record.local_version_topic_offset, LOWEST_OFFSET);
        assert_eq!(record.upstream_offset(), None);

        let guid = ProducerGuid::random();
        let mut record = OffsetRecord::empty();
        record.local_version_topic_offset = 102;
        record.leader_topic_raw = Some("store_rt".to_string());
        record.set_upstream_offset(50);
        record.leader_producer_guid = Some(guid.as_bytes().to_vec());
        record.leader_host_id = Some("host-1".to_string());
        record.record_producer_position(&guid, ProducerPosition { segment: 2, sequence: 7 });
        record.end_of_push_received = true;

        store.save_offset_record(p, &record).unwrap();
        let restored = store.load_offset_record(p).unwrap();
        assert_eq!(restored, record);
        assert_eq!(restored.upstream_offset(), Some(50));
        assert_eq!(restored.leader_topic().unwrap().as_str(), "store_rt");

        store.delete_offset_record(p).unwrap();
        assert_eq!(
            store.load_offset_record(p).unwrap().local_version_topic_offset,
            LOWEST_OFFSET
        );
    }

    #[test]
    fn version_state_cache_and_write_through() {
        let engine = Arc::new(MemStorageEngine::new());
        let store = OffsetMetadataStore::new(Arc::clone(&engine) as Arc<dyn StorageEngine>);

        assert!(store.version_state().unwrap().is_none());

        let switch = TopicSwitch {
            source_topic: Topic::real_time("store"),
            source_fabric_urls: vec![FabricUrl::from("remote://fabric")],
            rewind_start_timestamp: 1234,
        };
        store
            .update_version_state(|state| {
                state.chunking_enabled = true;
                state.last_topic_switch = Some(switch.clone());
            })
            .unwrap();

        let cached = store.version_state().unwrap().unwrap();
        assert!(cached.chunking_enabled);
        assert_eq!(cached.last_topic_switch.as_ref(), Some(&switch));

        // a fresh store over the same engine reads what was written through
        let fresh = OffsetMetadataStore::new(engine as Arc<dyn StorageEngine>);
        let reloaded = fresh.version_state().unwrap().unwrap();
        assert_eq!(*reloaded, *cached);
    }

    #[test]
    fn upstream_offset_records_rewinds() {
        let mut record = OffsetRecord::empty();
        record.set_upstream_offset(50);
        record.set_upstream_offset(49);
        assert_eq!(record.upstream_offset(), Some(49));
    }
}
