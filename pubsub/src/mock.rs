//! In-memory fabric implementing both the consumer and producer sides.

use crate::core::{
    ChunkManifest, ChunkingInfo, ControlMessage, LeaderFooter, Payload, PolledRecord,
    ProduceResult, ProducedChunk, ProducerMetadata, ProducerProvider, PubSubError,
    PubSubErrorKind, RecordEnvelope, RecordMetadata, TopicConsumer, TopicProducer,
    CHUNK_MANIFEST_SCHEMA_ID, CHUNK_SCHEMA_ID,
};
use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use data_types::{FabricUrl, PartitionId, Topic, LOWEST_OFFSET};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone)]
struct StoredRecord {
    key: Bytes,
    envelope: RecordEnvelope,
}

#[derive(Debug, Default)]
struct FabricState {
    // url -> topic -> partitions -> records
    clusters: HashMap<FabricUrl, HashMap<Topic, Vec<Vec<StoredRecord>>>>,
}

/// A set of in-memory clusters addressable by URL.
#[derive(Debug, Default)]
pub struct MockFabric {
    state: Mutex<FabricState>,
}

impl MockFabric {
    /// Create an empty fabric.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create `topic` with `partitions` partitions on the cluster at `url`.
    pub fn create_topic(&self, url: &FabricUrl, topic: &Topic, partitions: u32) {
        let mut state = self.state.lock();
        state
            .clusters
            .entry(url.clone())
            .or_default()
            .entry(topic.clone())
            .or_insert_with(|| vec![Vec::new(); partitions as usize]);
    }

    /// Append a record, returning its offset.
    pub fn append(
        &self,
        url: &FabricUrl,
        topic: &Topic,
        partition: PartitionId,
        key: Bytes,
        envelope: RecordEnvelope,
    ) -> Result<i64, PubSubError> {
        let mut state = self.state.lock();
        let records = Self::partition_mut(&mut state, url, topic, partition)?;
        records.push(StoredRecord { key, envelope });
        Ok(records.len() as i64 - 1)
    }

    /// Next offset to be assigned on `(topic, partition)`.
    pub fn end_offset(
        &self,
        url: &FabricUrl,
        topic: &Topic,
        partition: PartitionId,
    ) -> Result<i64, PubSubError> {
        let mut state = self.state.lock();
        Ok(Self::partition_mut(&mut state, url, topic, partition)?.len() as i64)
    }

    /// First offset whose record timestamp is `>= timestamp_ms`.
    pub fn offset_for_timestamp(
        &self,
        url: &FabricUrl,
        topic: &Topic,
        partition: PartitionId,
        timestamp_ms: i64,
    ) -> Result<Option<i64>, PubSubError> {
        let mut state = self.state.lock();
        let records = Self::partition_mut(&mut state, url, topic, partition)?;
        Ok(records
            .iter()
            .position(|r| r.envelope.producer.message_timestamp >= timestamp_ms)
            .map(|p| p as i64))
    }

    /// All `(key, envelope)` pairs on `(topic, partition)`, for assertions.
    pub fn records(
        &self,
        url: &FabricUrl,
        topic: &Topic,
        partition: PartitionId,
    ) -> Result<Vec<(Bytes, RecordEnvelope)>, PubSubError> {
        let mut state = self.state.lock();
        Ok(Self::partition_mut(&mut state, url, topic, partition)?
            .iter()
            .map(|r| (r.key.clone(), r.envelope.clone()))
            .collect())
    }

    fn partition_mut<'a>(
        state: &'a mut FabricState,
        url: &FabricUrl,
        topic: &Topic,
        partition: PartitionId,
    ) -> Result<&'a mut Vec<StoredRecord>, PubSubError> {
        state
            .clusters
            .get_mut(url)
            .and_then(|topics| topics.get_mut(topic))
            .and_then(|partitions| partitions.get_mut(partition.get() as usize))
            .ok_or_else(|| {
                PubSubError::new(
                    PubSubErrorKind::InvalidInput,
                    format!("unknown topic-partition {topic}-{partition} at {url}"),
                )
            })
    }
}

#[derive(Debug)]
struct Subscription {
    url: FabricUrl,
    next_offset: i64,
}

/// [`TopicConsumer`] over a [`MockFabric`]. Each consumer tracks its own
/// subscription positions; the fabric is shared.
#[derive(Debug)]
pub struct MockConsumer {
    fabric: Arc<MockFabric>,
    subscriptions: Mutex<BTreeMap<(Topic, PartitionId), Subscription>>,
    max_poll_records: usize,
}

impl MockConsumer {
    /// Create a consumer over `fabric`.
    pub fn new(fabric: Arc<MockFabric>) -> Self {
        Self {
            fabric,
            subscriptions: Mutex::new(BTreeMap::new()),
            max_poll_records: 64,
        }
    }

    /// Topics and partitions currently subscribed, for assertions.
    pub fn subscriptions(&self) -> Vec<(Topic, PartitionId)> {
        self.subscriptions.lock().keys().cloned().collect()
    }

    /// The next offset the subscription on `(topic, partition)` will consume.
    pub fn position(&self, topic: &Topic, partition: PartitionId) -> Option<i64> {
        self.subscriptions
            .lock()
            .get(&(topic.clone(), partition))
            .map(|s| s.next_offset)
    }
}

#[async_trait]
impl TopicConsumer for MockConsumer {
    async fn subscribe(
        &self,
        topic: &Topic,
        partition: PartitionId,
        offset: i64,
        url: &FabricUrl,
    ) -> Result<(), PubSubError> {
        // resume after `offset`; LOWEST_OFFSET resumes from the beginning
        let next_offset = if offset <= LOWEST_OFFSET { 0 } else { offset + 1 };
        self.subscriptions.lock().insert(
            (topic.clone(), partition),
            Subscription {
                url: url.clone(),
                next_offset,
            },
        );
        Ok(())
    }

    async fn unsubscribe(&self, topic: &Topic, partition: PartitionId) -> Result<(), PubSubError> {
        self.subscriptions.lock().remove(&(topic.clone(), partition));
        Ok(())
    }

    async fn poll(&self) -> Result<Vec<PolledRecord>, PubSubError> {
        let mut subscriptions = self.subscriptions.lock();
        let mut batch = Vec::new();

        for ((topic, partition), subscription) in subscriptions.iter_mut() {
            if batch.len() >= self.max_poll_records {
                break;
            }

            let mut state = self.fabric.state.lock();
            let records =
                MockFabric::partition_mut(&mut state, &subscription.url, topic, *partition)?;
            let from = subscription.next_offset.max(0) as usize;
            for (i, record) in records
                .iter()
                .enumerate()
                .skip(from)
                .take(self.max_poll_records - batch.len())
            {
                batch.push(PolledRecord {
                    url: subscription.url.clone(),
                    topic: topic.clone(),
                    partition: *partition,
                    offset: i as i64,
                    key: record.key.clone(),
                    envelope: record.envelope.clone(),
                });
                subscription.next_offset = i as i64 + 1;
            }
        }

        Ok(batch)
    }

    async fn end_offset(
        &self,
        url: &FabricUrl,
        topic: &Topic,
        partition: PartitionId,
    ) -> Result<i64, PubSubError> {
        self.fabric.end_offset(url, topic, partition)
    }

    async fn offset_for_timestamp(
        &self,
        url: &FabricUrl,
        topic: &Topic,
        partition: PartitionId,
        timestamp_ms: i64,
    ) -> Result<Option<i64>, PubSubError> {
        self.fabric
            .offset_for_timestamp(url, topic, partition, timestamp_ms)
    }

    async fn offset_lag(&self, topic: &Topic, partition: PartitionId) -> Option<i64> {
        let subscriptions = self.subscriptions.lock();
        let subscription = subscriptions.get(&(topic.clone(), partition))?;
        let end = self
            .fabric
            .end_offset(&subscription.url, topic, partition)
            .ok()?;
        Some((end - subscription.next_offset).max(0))
    }

    fn type_name(&self) -> &'static str {
        "mock"
    }
}

/// [`TopicProducer`] appending to one topic of a [`MockFabric`] cluster.
///
/// Values larger than `max_record_bytes` are split into chunks plus a
/// manifest when chunking is enabled, mirroring what a real fabric writer
/// does below its record-size limit.
#[derive(Debug)]
pub struct MockProducer {
    fabric: Arc<MockFabric>,
    url: FabricUrl,
    topic: Topic,
    max_record_bytes: usize,
    chunking_enabled: AtomicBool,
    open_segments: Mutex<BTreeSet<PartitionId>>,
    closed: AtomicBool,
    fail_next: Mutex<Option<String>>,
}

impl MockProducer {
    /// Create a producer for `topic` on the cluster at `url`.
    pub fn new(fabric: Arc<MockFabric>, url: FabricUrl, topic: Topic) -> Self {
        Self {
            fabric,
            url,
            topic,
            max_record_bytes: 1024 * 1024,
            chunking_enabled: AtomicBool::new(false),
            open_segments: Mutex::new(BTreeSet::new()),
            closed: AtomicBool::new(false),
            fail_next: Mutex::new(None),
        }
    }

    /// Lower the record-size limit, forcing chunking of smaller values.
    pub fn with_max_record_bytes(mut self, max_record_bytes: usize) -> Self {
        self.max_record_bytes = max_record_bytes;
        self
    }

    /// Make the next send fail with `message`.
    pub fn fail_next_send(&self, message: impl Into<String>) {
        *self.fail_next.lock() = Some(message.into());
    }

    /// Partitions with an open segment, for assertions.
    pub fn open_segments(&self) -> Vec<PartitionId> {
        self.open_segments.lock().iter().copied().collect()
    }

    fn check_send(&self, partition: PartitionId) -> Result<(), PubSubError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(PubSubError::new(
                PubSubErrorKind::Io,
                "producer is closed".to_string(),
            ));
        }
        if let Some(message) = self.fail_next.lock().take() {
            return Err(PubSubError::new(PubSubErrorKind::Io, message));
        }
        self.open_segments.lock().insert(partition);
        Ok(())
    }

    fn append(
        &self,
        partition: PartitionId,
        key: Bytes,
        envelope: RecordEnvelope,
    ) -> Result<RecordMetadata, PubSubError> {
        let offset = self
            .fabric
            .append(&self.url, &self.topic, partition, key, envelope)?;
        Ok(RecordMetadata {
            topic: self.topic.clone(),
            partition,
            offset,
        })
    }

    fn chunk_key(top_level_key: &Bytes, index: u32) -> Bytes {
        let mut key = BytesMut::with_capacity(top_level_key.len() + 4);
        key.put_slice(top_level_key);
        key.put_u32(index);
        key.freeze()
    }
}

#[async_trait]
impl TopicProducer for MockProducer {
    async fn put(
        &self,
        partition: PartitionId,
        key: Bytes,
        envelope: RecordEnvelope,
    ) -> Result<ProduceResult, PubSubError> {
        self.check_send(partition)?;

        let (schema_id, value) = match &envelope.payload {
            Payload::Put { schema_id, value } => (*schema_id, value.clone()),
            other => {
                return Err(PubSubError::invalid_input(format!(
                    "put called with non-put payload {other:?}"
                )))
            }
        };

        let needs_chunking =
            self.chunking_enabled.load(Ordering::SeqCst) && value.len() > self.max_record_bytes;
        if !needs_chunking {
            let metadata = self.append(partition, key, envelope)?;
            return Ok(ProduceResult {
                metadata,
                chunking: None,
            });
        }

        let mut chunks = Vec::new();
        for (index, slice) in value.chunks(self.max_record_bytes).enumerate() {
            let chunk_key = Self::chunk_key(&key, index as u32);
            let chunk_value = Bytes::copy_from_slice(slice);
            self.append(
                partition,
                chunk_key.clone(),
                RecordEnvelope {
                    producer: envelope.producer.clone(),
                    leader_footer: envelope.leader_footer.clone(),
                    payload: Payload::Put {
                        schema_id: CHUNK_SCHEMA_ID,
                        value: chunk_value.clone(),
                    },
                },
            )?;
            chunks.push(ProducedChunk {
                key: chunk_key,
                value: chunk_value,
            });
        }

        let manifest = ChunkManifest {
            keys_with_chunk_id_suffix: chunks.iter().map(|c| c.key.to_vec()).collect(),
            total_value_bytes: value.len() as u64,
            schema_id,
        };
        let metadata = self.append(
            partition,
            key.clone(),
            RecordEnvelope {
                producer: envelope.producer,
                leader_footer: envelope.leader_footer,
                payload: Payload::Put {
                    schema_id: CHUNK_MANIFEST_SCHEMA_ID,
                    value: manifest.encode_to_bytes(),
                },
            },
        )?;

        Ok(ProduceResult {
            metadata,
            chunking: Some(ChunkingInfo {
                top_level_key: key,
                chunks,
                manifest,
            }),
        })
    }

    async fn delete(
        &self,
        partition: PartitionId,
        key: Bytes,
        envelope: RecordEnvelope,
    ) -> Result<ProduceResult, PubSubError> {
        self.check_send(partition)?;
        let metadata = self.append(partition, key, envelope)?;
        Ok(ProduceResult {
            metadata,
            chunking: None,
        })
    }

    async fn send_control(
        &self,
        partition: PartitionId,
        control: ControlMessage,
        producer: ProducerMetadata,
        leader_footer: Option<LeaderFooter>,
    ) -> Result<ProduceResult, PubSubError> {
        self.check_send(partition)?;
        let metadata = self.append(
            partition,
            Bytes::new(),
            RecordEnvelope {
                producer,
                leader_footer,
                payload: Payload::Control(control),
            },
        )?;
        Ok(ProduceResult {
            metadata,
            chunking: None,
        })
    }

    fn update_chunking_enabled(&self, enabled: bool) {
        self.chunking_enabled.store(enabled, Ordering::SeqCst);
    }

    async fn end_segment(&self, partition: PartitionId, _finalize: bool) -> Result<(), PubSubError> {
        self.open_segments.lock().remove(&partition);
        Ok(())
    }

    async fn close_partition(&self, partition: PartitionId) -> Result<(), PubSubError> {
        self.open_segments.lock().remove(&partition);
        Ok(())
    }

    async fn close(&self) -> Result<(), PubSubError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn type_name(&self) -> &'static str {
        "mock"
    }
}

/// [`ProducerProvider`] handing out [`MockProducer`]s on a fixed cluster.
#[derive(Debug)]
pub struct MockProducerProvider {
    fabric: Arc<MockFabric>,
    url: FabricUrl,
    max_record_bytes: usize,
    producers: Mutex<HashMap<Topic, Arc<MockProducer>>>,
}

impl MockProducerProvider {
    /// Create a provider for the cluster at `url`.
    pub fn new(fabric: Arc<MockFabric>, url: FabricUrl) -> Self {
        Self {
            fabric,
            url,
            max_record_bytes: 1024 * 1024,
            producers: Mutex::new(HashMap::new()),
        }
    }

    /// Lower the record-size limit of created producers.
    pub fn with_max_record_bytes(mut self, max_record_bytes: usize) -> Self {
        self.max_record_bytes = max_record_bytes;
        self
    }

    /// The producer previously created for `topic`, for assertions.
    pub fn existing_producer(&self, topic: &Topic) -> Option<Arc<MockProducer>> {
        self.producers.lock().get(topic).map(Arc::clone)
    }
}

#[async_trait]
impl ProducerProvider for MockProducerProvider {
    async fn producer(&self, topic: &Topic) -> Result<Arc<dyn TopicProducer>, PubSubError> {
        let mut producers = self.producers.lock();
        let producer = producers.entry(topic.clone()).or_insert_with(|| {
            Arc::new(
                MockProducer::new(Arc::clone(&self.fabric), self.url.clone(), topic.clone())
                    .with_max_record_bytes(self.max_record_bytes),
            )
        });
        Ok(Arc::clone(producer) as Arc<dyn TopicProducer>)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use data_types::ProducerGuid;

    fn envelope(ts: i64, value: &[u8]) -> RecordEnvelope {
        RecordEnvelope {
            producer: ProducerMetadata::new(ProducerGuid::random(), 0, 0, ts),
            leader_footer: None,
            payload: Payload::Put {
                schema_id: 1,
                value: Bytes::copy_from_slice(value),
            },
        }
    }

    fn setup() -> (Arc<MockFabric>, FabricUrl, Topic) {
        let fabric = Arc::new(MockFabric::new());
        let url = FabricUrl::from("local://fabric");
        let topic = Topic::version_topic("store", 1);
        fabric.create_topic(&url, &topic, 2);
        (fabric, url, topic)
    }

    #[tokio::test]
    async fn subscribe_resumes_after_offset() {
        let (fabric, url, topic) = setup();
        let p = PartitionId::new(0);
        for i in 0..3 {
            fabric
                .append(&url, &topic, p, Bytes::from(vec![i]), envelope(i as i64, b"v"))
                .unwrap();
        }

        let consumer = MockConsumer::new(Arc::clone(&fabric));
        consumer.subscribe(&topic, p, 0, &url).await.unwrap();

        let batch = consumer.poll().await.unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].offset, 1);
        assert_eq!(batch[1].offset, 2);

        // nothing more until a new record lands
        assert!(consumer.poll().await.unwrap().is_empty());
        fabric
            .append(&url, &topic, p, Bytes::from_static(b"k"), envelope(9, b"v"))
            .unwrap();
        let batch = consumer.poll().await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].offset, 3);
    }

    #[tokio::test]
    async fn lowest_offset_reads_from_start() {
        let (fabric, url, topic) = setup();
        let p = PartitionId::new(1);
        fabric
            .append(&url, &topic, p, Bytes::from_static(b"k"), envelope(1, b"v"))
            .unwrap();

        let consumer = MockConsumer::new(fabric);
        consumer.subscribe(&topic, p, LOWEST_OFFSET, &url).await.unwrap();
        let batch = consumer.poll().await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].offset, 0);
    }

    #[tokio::test]
    async fn offset_lookups() {
        let (fabric, url, topic) = setup();
        let p = PartitionId::new(0);
        for ts in [100, 200, 300] {
            fabric
                .append(&url, &topic, p, Bytes::from_static(b"k"), envelope(ts, b"v"))
                .unwrap();
        }

        let consumer = MockConsumer::new(fabric);
        assert_eq!(consumer.end_offset(&url, &topic, p).await.unwrap(), 3);
        assert_eq!(
            consumer
                .offset_for_timestamp(&url, &topic, p, 200)
                .await
                .unwrap(),
            Some(1)
        );
        assert_eq!(
            consumer
                .offset_for_timestamp(&url, &topic, p, 999)
                .await
                .unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn producer_chunks_large_values() {
        let (fabric, url, topic) = setup();
        let p = PartitionId::new(0);
        let producer =
            MockProducer::new(Arc::clone(&fabric), url.clone(), topic.clone()).with_max_record_bytes(4);
        producer.update_chunking_enabled(true);

        let result = producer
            .put(p, Bytes::from_static(b"key"), envelope(1, b"0123456789"))
            .await
            .unwrap();

        let chunking = result.chunking.expect("value over the limit must chunk");
        assert_eq!(chunking.chunks.len(), 3);
        assert_eq!(
            chunking.manifest.keys_with_chunk_id_suffix.len(),
            chunking.chunks.len()
        );
        assert_eq!(chunking.manifest.total_value_bytes, 10);

        // chunks land before the manifest, manifest offset is last
        let records = fabric.records(&url, &topic, p).unwrap();
        assert_eq!(records.len(), 4);
        assert_eq!(result.metadata.offset, 3);
        let reassembled: Vec<u8> = chunking
            .chunks
            .iter()
            .flat_map(|c| c.value.iter().copied())
            .collect();
        assert_eq!(reassembled, b"0123456789");
    }

    #[tokio::test]
    async fn producer_does_not_chunk_when_disabled() {
        let (fabric, url, topic) = setup();
        let producer =
            MockProducer::new(fabric, url, topic).with_max_record_bytes(4);

        let result = producer
            .put(
                PartitionId::new(0),
                Bytes::from_static(b"key"),
                envelope(1, b"0123456789"),
            )
            .await
            .unwrap();
        assert!(result.chunking.is_none());
    }

    #[tokio::test]
    async fn closed_producer_rejects_sends() {
        let (fabric, url, topic) = setup();
        let producer = MockProducer::new(fabric, url, topic);
        producer.close().await.unwrap();
        let err = producer
            .put(PartitionId::new(0), Bytes::new(), envelope(1, b"v"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), PubSubErrorKind::Io);
    }
}
