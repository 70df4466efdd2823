//! Record model and the consumer/producer traits.

use async_trait::async_trait;
use bytes::Bytes;
use data_types::{FabricUrl, PartitionId, ProducerGuid, Topic, TopicSwitch};
use prost::Message;
use std::fmt::{Debug, Display, Formatter};
use std::sync::Arc;

/// Schema id marking a value as one chunk of a larger value.
pub const CHUNK_SCHEMA_ID: i32 = -10;

/// Schema id marking a value as a chunk manifest.
pub const CHUNK_MANIFEST_SCHEMA_ID: i32 = -20;

/// Generic boxed error type for fabric operations.
///
/// The dynamic boxing makes it easier to deal with errors from different
/// implementations.
#[derive(Debug)]
pub struct PubSubError {
    inner: Box<dyn std::error::Error + Sync + Send>,
    kind: PubSubErrorKind,
}

impl PubSubError {
    /// Wrap an error with an explicit kind.
    pub fn new(
        kind: PubSubErrorKind,
        e: impl Into<Box<dyn std::error::Error + Sync + Send>>,
    ) -> Self {
        Self {
            inner: e.into(),
            kind,
        }
    }

    /// The operation was handed invalid input.
    pub fn invalid_input(e: impl Into<Box<dyn std::error::Error + Sync + Send>>) -> Self {
        Self::new(PubSubErrorKind::InvalidInput, e)
    }

    /// The operation encountered invalid data on the wire.
    pub fn invalid_data(e: impl Into<Box<dyn std::error::Error + Sync + Send>>) -> Self {
        Self::new(PubSubErrorKind::InvalidData, e)
    }

    /// The offset being read is unknown to the fabric.
    pub fn unknown_offset(e: impl Into<Box<dyn std::error::Error + Sync + Send>>) -> Self {
        Self::new(PubSubErrorKind::UnknownOffset, e)
    }

    /// Catch-all.
    pub fn unknown(e: impl Into<Box<dyn std::error::Error + Sync + Send>>) -> Self {
        Self::new(PubSubErrorKind::Unknown, e)
    }

    /// Returns the kind of error this was.
    pub fn kind(&self) -> PubSubErrorKind {
        self.kind
    }

    /// Returns the inner error.
    pub fn inner(&self) -> &dyn std::error::Error {
        self.inner.as_ref()
    }
}

impl Display for PubSubError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "PubSubError({:?}): {}", self.kind, self.inner)
    }
}

impl std::error::Error for PubSubError {}

impl From<String> for PubSubError {
    fn from(e: String) -> Self {
        Self {
            inner: e.into(),
            kind: PubSubErrorKind::Unknown,
        }
    }
}

impl From<&'static str> for PubSubError {
    fn from(e: &'static str) -> Self {
        Self {
            inner: e.into(),
            kind: PubSubErrorKind::Unknown,
        }
    }
}

/// Failure categories of [`PubSubError`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PubSubErrorKind {
    /// This operation failed for an unknown reason.
    Unknown,

    /// This operation was provided with invalid input data.
    InvalidInput,

    /// This operation encountered invalid data.
    InvalidData,

    /// A fatal IO error occurred.
    Io,

    /// The offset that we are trying to read is unknown.
    UnknownOffset,
}

/// Where a produced record landed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordMetadata {
    /// Topic the record was appended to.
    pub topic: Topic,
    /// Partition the record was appended to.
    pub partition: PartitionId,
    /// Offset assigned by the fabric.
    pub offset: i64,
}

/// Identity and position of the producer that emitted a record. The segment
/// and sequence drive data-integrity validation downstream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProducerMetadata {
    /// Producer identity.
    pub guid: ProducerGuid,
    /// Segment counter, reset per producer session.
    pub segment: u32,
    /// Sequence within the segment.
    pub sequence: u32,
    /// Producer-side timestamp, milliseconds since epoch.
    pub message_timestamp: i64,
    /// Offset of the upstream record this one re-produces, if any.
    pub upstream_offset: Option<i64>,
}

impl ProducerMetadata {
    /// Metadata for a fresh producer position.
    pub fn new(guid: ProducerGuid, segment: u32, sequence: u32, message_timestamp: i64) -> Self {
        Self {
            guid,
            segment,
            sequence,
            message_timestamp,
            upstream_offset: None,
        }
    }
}

/// Footer a leader attaches to records it re-produces into the version topic,
/// so followers can track the true upstream position and leader identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaderFooter {
    /// Host id of the producing leader.
    pub host_id: String,
    /// Upstream offset of the source record.
    pub upstream_offset: i64,
}

/// Control messages carried in-band on topics.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlMessage {
    /// Start of the bulk-load segment of a version.
    StartOfPush {
        /// Whether values in this push may be chunked.
        chunked: bool,
    },
    /// End of the bulk-load segment.
    EndOfPush,
    /// Producer opened a new segment.
    StartOfSegment,
    /// Producer finished a segment.
    EndOfSegment {
        /// Whether the segment is final for this producer.
        finalized: bool,
    },
    /// Start of an incremental push.
    StartOfIncrementalPush {
        /// Push version label.
        version: String,
    },
    /// End of an incremental push.
    EndOfIncrementalPush {
        /// Push version label.
        version: String,
    },
    /// Order the leader to change its upstream source.
    TopicSwitch(TopicSwitch),
    /// Legacy buffer-replay marker; a protocol violation in this engine.
    StartOfBufferReplay,
}

impl ControlMessage {
    /// Stable name used in logs and errors.
    pub fn name(&self) -> &'static str {
        match self {
            Self::StartOfPush { .. } => "StartOfPush",
            Self::EndOfPush => "EndOfPush",
            Self::StartOfSegment => "StartOfSegment",
            Self::EndOfSegment { .. } => "EndOfSegment",
            Self::StartOfIncrementalPush { .. } => "StartOfIncrementalPush",
            Self::EndOfIncrementalPush { .. } => "EndOfIncrementalPush",
            Self::TopicSwitch(_) => "TopicSwitch",
            Self::StartOfBufferReplay => "StartOfBufferReplay",
        }
    }
}

/// Value payload of a record.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// Full value write.
    Put {
        /// Writer schema id of the value.
        schema_id: i32,
        /// Serialized value.
        value: Bytes,
    },
    /// Tombstone.
    Delete,
    /// Partial update applied against the current value.
    Update {
        /// Value schema id the update was authored against.
        schema_id: i32,
        /// Serialized update.
        update: Bytes,
    },
    /// In-band control message.
    Control(ControlMessage),
}

impl Payload {
    /// Whether this is a control message.
    pub fn is_control(&self) -> bool {
        matches!(self, Self::Control(_))
    }

    /// Approximate serialized size, used for memory accounting.
    pub fn serialized_size(&self) -> usize {
        match self {
            Self::Put { value, .. } => value.len() + 4,
            Self::Delete => 0,
            Self::Update { update, .. } => update.len() + 4,
            Self::Control(_) => 16,
        }
    }
}

/// A record as it travels on a topic: producer position, optional leader
/// footer, payload.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordEnvelope {
    /// Position of the producer that emitted this record.
    pub producer: ProducerMetadata,
    /// Set on records a leader re-produced into the version topic.
    pub leader_footer: Option<LeaderFooter>,
    /// The payload.
    pub payload: Payload,
}

impl RecordEnvelope {
    /// The upstream offset this record tracks, from the leader footer when
    /// present, else from the producer metadata.
    pub fn upstream_offset(&self) -> Option<i64> {
        self.leader_footer
            .as_ref()
            .map(|f| f.upstream_offset)
            .or(self.producer.upstream_offset)
    }
}

/// A record handed out by [`TopicConsumer::poll`].
#[derive(Debug, Clone, PartialEq)]
pub struct PolledRecord {
    /// Fabric the record came from.
    pub url: FabricUrl,
    /// Topic the record came from.
    pub topic: Topic,
    /// Partition the record came from.
    pub partition: PartitionId,
    /// Offset within the partition.
    pub offset: i64,
    /// Record key.
    pub key: Bytes,
    /// Record body.
    pub envelope: RecordEnvelope,
}

impl PolledRecord {
    /// Approximate in-memory footprint, used for queue accounting.
    pub fn serialized_size(&self) -> usize {
        self.key.len() + self.envelope.payload.serialized_size() + 64
    }
}

/// Manifest written in place of a chunked value, listing the chunk keys in
/// order.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ChunkManifest {
    /// Keys of the chunks, in assembly order.
    #[prost(bytes = "vec", repeated, tag = "1")]
    pub keys_with_chunk_id_suffix: Vec<Vec<u8>>,
    /// Total size of the reassembled value.
    #[prost(uint64, tag = "2")]
    pub total_value_bytes: u64,
    /// Writer schema id of the reassembled value.
    #[prost(int32, tag = "3")]
    pub schema_id: i32,
}

impl ChunkManifest {
    /// Serialize to bytes for storage as the top-level value.
    pub fn encode_to_bytes(&self) -> Bytes {
        let mut buf = Vec::with_capacity(self.encoded_len());
        self.encode(&mut buf).expect("buffer sized upfront");
        buf.into()
    }

    /// Decode from the stored top-level value.
    pub fn decode_from_bytes(bytes: &[u8]) -> Result<Self, PubSubError> {
        Self::decode(bytes).map_err(PubSubError::invalid_data)
    }
}

/// One chunk of a chunked value, as produced to the version topic.
#[derive(Debug, Clone, PartialEq)]
pub struct ProducedChunk {
    /// Chunk key (top-level key plus chunk-id suffix).
    pub key: Bytes,
    /// Chunk bytes.
    pub value: Bytes,
}

/// Reported by the producer when a value was split into chunks.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkingInfo {
    /// The key of the logical record.
    pub top_level_key: Bytes,
    /// The chunks, in produce order.
    pub chunks: Vec<ProducedChunk>,
    /// Manifest describing the chunks; its key list matches `chunks` 1:1.
    pub manifest: ChunkManifest,
}

/// Completion of a produce call.
#[derive(Debug, Clone, PartialEq)]
pub struct ProduceResult {
    /// Where the record (for chunked values: the manifest) landed.
    pub metadata: RecordMetadata,
    /// Set when the value was split into chunks.
    pub chunking: Option<ChunkingInfo>,
}

/// Upstream log client: topic+partition subscriptions across fabrics, polling
/// and offset lookups.
#[async_trait]
pub trait TopicConsumer: Debug + Send + Sync + 'static {
    /// Subscribe to `(topic, partition)` on `url`, resuming after `offset`
    /// (`LOWEST_OFFSET` means from the oldest retained record).
    async fn subscribe(
        &self,
        topic: &Topic,
        partition: PartitionId,
        offset: i64,
        url: &FabricUrl,
    ) -> Result<(), PubSubError>;

    /// Drop the subscription for `(topic, partition)`.
    async fn unsubscribe(&self, topic: &Topic, partition: PartitionId) -> Result<(), PubSubError>;

    /// Fetch the next batch across all subscriptions. Returns immediately
    /// with an empty batch when nothing is available.
    async fn poll(&self) -> Result<Vec<PolledRecord>, PubSubError>;

    /// The next offset to be assigned on `(topic, partition)` at `url`.
    async fn end_offset(
        &self,
        url: &FabricUrl,
        topic: &Topic,
        partition: PartitionId,
    ) -> Result<i64, PubSubError>;

    /// The first offset whose record timestamp is at or after `timestamp_ms`,
    /// or `None` when no such record exists.
    async fn offset_for_timestamp(
        &self,
        url: &FabricUrl,
        topic: &Topic,
        partition: PartitionId,
        timestamp_ms: i64,
    ) -> Result<Option<i64>, PubSubError>;

    /// Lag of the current subscription on `(topic, partition)`, if known.
    async fn offset_lag(&self, topic: &Topic, partition: PartitionId) -> Option<i64>;

    /// Return type (like `"mock"` or `"kafka"`) of this consumer.
    fn type_name(&self) -> &'static str;
}

/// Downstream producer bound to one version topic.
///
/// Completion (record metadata plus optional chunking info) is reported as
/// the return value; implementations must assign offsets and report
/// completions in send order per partition.
#[async_trait]
pub trait TopicProducer: Debug + Send + Sync + 'static {
    /// Append a data record.
    async fn put(
        &self,
        partition: PartitionId,
        key: Bytes,
        envelope: RecordEnvelope,
    ) -> Result<ProduceResult, PubSubError>;

    /// Append a tombstone.
    async fn delete(
        &self,
        partition: PartitionId,
        key: Bytes,
        envelope: RecordEnvelope,
    ) -> Result<ProduceResult, PubSubError>;

    /// Append a control message.
    async fn send_control(
        &self,
        partition: PartitionId,
        control: ControlMessage,
        producer: ProducerMetadata,
        leader_footer: Option<LeaderFooter>,
    ) -> Result<ProduceResult, PubSubError>;

    /// Enable or disable value chunking for subsequent puts.
    fn update_chunking_enabled(&self, enabled: bool);

    /// Close the current segment on `partition`.
    async fn end_segment(&self, partition: PartitionId, finalize: bool) -> Result<(), PubSubError>;

    /// Release all producer state for `partition`.
    async fn close_partition(&self, partition: PartitionId) -> Result<(), PubSubError>;

    /// Close the producer; all subsequent sends fail.
    async fn close(&self) -> Result<(), PubSubError>;

    /// Return type (like `"mock"` or `"kafka"`) of this producer.
    fn type_name(&self) -> &'static str;
}

/// Source of [`TopicProducer`] instances, used for lazy producer creation.
#[async_trait]
pub trait ProducerProvider: Debug + Send + Sync + 'static {
    /// A producer bound to `topic`.
    async fn producer(&self, topic: &Topic) -> Result<Arc<dyn TopicProducer>, PubSubError>;
}
