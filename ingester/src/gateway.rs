//! The shared version-topic producer.
//!
//! One gateway per ingestion task, shared across all partitions. The
//! underlying producer is created lazily under a one-shot initializer and
//! closed exactly once at task shutdown. Before end-of-push the leader
//! re-emits consumed records with the upstream producer's metadata
//! (pass-through) so downstream validation holds end-to-end; afterwards it
//! produces under its own identity, tracked per partition.

use bytes::Bytes;
use clock::TimeProvider;
use data_types::{PartitionId, ProducerGuid, Topic};
use parking_lot::Mutex;
use pubsub::{
    ControlMessage, LeaderFooter, Payload, ProduceResult, ProducerMetadata, ProducerProvider,
    PubSubError, RecordEnvelope, TopicProducer,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::OnceCell;

/// How a record's producer metadata is stamped.
#[derive(Debug)]
pub enum ProduceMode<'a> {
    /// Preserve the upstream producer's metadata (pre-end-of-push
    /// re-production).
    PassThrough(&'a ProducerMetadata),
    /// Stamp the gateway's own identity and position.
    OwnMetadata,
}

#[derive(Debug, Default, Clone, Copy)]
struct OwnPosition {
    segment: u32,
    next_sequence: u32,
}

/// Lazily initialized, shared producer for the task's version topic.
#[derive(Debug)]
pub struct ProducerGateway {
    provider: Arc<dyn ProducerProvider>,
    topic: Topic,
    producer: OnceCell<Arc<dyn TopicProducer>>,
    guid: ProducerGuid,
    host_id: String,
    time: Arc<dyn TimeProvider>,
    chunking_enabled: AtomicBool,
    positions: Mutex<HashMap<PartitionId, OwnPosition>>,
    closed: AtomicBool,
}

impl ProducerGateway {
    /// Create a gateway for `topic`; no producer is created until the first
    /// send.
    pub fn new(
        provider: Arc<dyn ProducerProvider>,
        topic: Topic,
        host_id: impl Into<String>,
        time: Arc<dyn TimeProvider>,
    ) -> Self {
        Self {
            provider,
            topic,
            producer: OnceCell::new(),
            guid: ProducerGuid::random(),
            host_id: host_id.into(),
            time,
            chunking_enabled: AtomicBool::new(false),
            positions: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// The gateway's own producer identity.
    pub fn guid(&self) -> ProducerGuid {
        self.guid
    }

    /// The host this gateway produces from.
    pub fn host_id(&self) -> &str {
        &self.host_id
    }

    async fn producer(&self) -> Result<&Arc<dyn TopicProducer>, PubSubError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(PubSubError::unknown("producer gateway is closed"));
        }
        let producer = self
            .producer
            .get_or_try_init(|| async {
                let producer = self.provider.producer(&self.topic).await?;
                producer.update_chunking_enabled(self.chunking_enabled.load(Ordering::SeqCst));
                Ok::<_, PubSubError>(producer)
            })
            .await?;
        Ok(producer)
    }

    fn next_own_metadata(&self, partition: PartitionId) -> ProducerMetadata {
        let mut positions = self.positions.lock();
        let position = positions.entry(partition).or_default();
        let metadata = ProducerMetadata::new(
            self.guid,
            position.segment,
            position.next_sequence,
            self.time.now().timestamp_millis(),
        );
        position.next_sequence += 1;
        metadata
    }

    fn stamp(
        &self,
        partition: PartitionId,
        mode: ProduceMode<'_>,
        upstream_offset: i64,
    ) -> (ProducerMetadata, Option<LeaderFooter>) {
        let producer = match mode {
            ProduceMode::PassThrough(upstream) => upstream.clone(),
            ProduceMode::OwnMetadata => self.next_own_metadata(partition),
        };
        let footer = LeaderFooter {
            host_id: self.host_id.clone(),
            upstream_offset,
        };
        (producer, Some(footer))
    }

    /// Produce a full value.
    pub async fn put(
        &self,
        partition: PartitionId,
        key: Bytes,
        schema_id: i32,
        value: Bytes,
        mode: ProduceMode<'_>,
        upstream_offset: i64,
    ) -> Result<ProduceResult, PubSubError> {
        let (producer_meta, leader_footer) = self.stamp(partition, mode, upstream_offset);
        self.producer()
            .await?
            .put(
                partition,
                key,
                RecordEnvelope {
                    producer: producer_meta,
                    leader_footer,
                    payload: Payload::Put { schema_id, value },
                },
            )
            .await
    }

    /// Produce a tombstone.
    pub async fn delete(
        &self,
        partition: PartitionId,
        key: Bytes,
        mode: ProduceMode<'_>,
        upstream_offset: i64,
    ) -> Result<ProduceResult, PubSubError> {
        let (producer_meta, leader_footer) = self.stamp(partition, mode, upstream_offset);
        self.producer()
            .await?
            .delete(
                partition,
                key,
                RecordEnvelope {
                    producer: producer_meta,
                    leader_footer,
                    payload: Payload::Delete,
                },
            )
            .await
    }

    /// Produce a control message.
    pub async fn send_control(
        &self,
        partition: PartitionId,
        control: ControlMessage,
        mode: ProduceMode<'_>,
        upstream_offset: i64,
    ) -> Result<ProduceResult, PubSubError> {
        let (producer_meta, leader_footer) = self.stamp(partition, mode, upstream_offset);
        self.producer()
            .await?
            .send_control(partition, control, producer_meta, leader_footer)
            .await
    }

    /// Enable or disable chunking for subsequent puts.
    pub fn update_chunking(&self, enabled: bool) {
        self.chunking_enabled.store(enabled, Ordering::SeqCst);
        if let Some(producer) = self.producer.get() {
            producer.update_chunking_enabled(enabled);
        }
    }

    /// Close the open segment on `partition`; the next own-metadata produce
    /// starts a new one.
    pub async fn close_segment(&self, partition: PartitionId) -> Result<(), PubSubError> {
        {
            let mut positions = self.positions.lock();
            if let Some(position) = positions.get_mut(&partition) {
                position.segment += 1;
                position.next_sequence = 0;
            }
        }
        if let Some(producer) = self.producer.get() {
            producer.end_segment(partition, true).await?;
        }
        Ok(())
    }

    /// Release all producer state for `partition`.
    pub async fn close_partition(&self, partition: PartitionId) -> Result<(), PubSubError> {
        self.positions.lock().remove(&partition);
        if let Some(producer) = self.producer.get() {
            producer.close_partition(partition).await?;
        }
        Ok(())
    }

    /// Close the underlying producer. Idempotent; only the first call closes.
    pub async fn close(&self) -> Result<(), PubSubError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if let Some(producer) = self.producer.get() {
            producer.close().await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clock::{SystemProvider, Time};
    use data_types::FabricUrl;
    use pubsub::mock::{MockFabric, MockProducerProvider};

    fn gateway() -> (Arc<MockFabric>, FabricUrl, Topic, ProducerGateway) {
        let fabric = Arc::new(MockFabric::new());
        let url = FabricUrl::from("local://fabric");
        let topic = Topic::version_topic("s", 1);
        fabric.create_topic(&url, &topic, 2);
        let provider = Arc::new(MockProducerProvider::new(Arc::clone(&fabric), url.clone()));
        let gateway = ProducerGateway::new(
            provider,
            topic.clone(),
            "host-1",
            Arc::new(SystemProvider::new()),
        );
        (fabric, url, topic, gateway)
    }

    #[tokio::test]
    async fn own_metadata_positions_advance_per_partition() {
        let (fabric, url, topic, gateway) = gateway();
        let p0 = PartitionId::new(0);
        let p1 = PartitionId::new(1);

        for _ in 0..2 {
            gateway
                .put(
                    p0,
                    Bytes::from_static(b"k"),
                    1,
                    Bytes::from_static(b"v"),
                    ProduceMode::OwnMetadata,
                    7,
                )
                .await
                .unwrap();
        }
        gateway
            .put(
                p1,
                Bytes::from_static(b"k"),
                1,
                Bytes::from_static(b"v"),
                ProduceMode::OwnMetadata,
                8,
            )
            .await
            .unwrap();

        let records = fabric.records(&url, &topic, p0).unwrap();
        assert_eq!(records[0].1.producer.sequence, 0);
        assert_eq!(records[1].1.producer.sequence, 1);
        assert_eq!(records[0].1.producer.guid, gateway.guid());
        assert_eq!(
            records[0].1.leader_footer.as_ref().unwrap().upstream_offset,
            7
        );

        let records = fabric.records(&url, &topic, p1).unwrap();
        assert_eq!(records[0].1.producer.sequence, 0);
    }

    #[tokio::test]
    async fn pass_through_preserves_upstream_metadata() {
        let (fabric, url, topic, gateway) = gateway();
        let p = PartitionId::new(0);
        let upstream_guid = ProducerGuid::random();
        let upstream = ProducerMetadata {
            guid: upstream_guid,
            segment: 3,
            sequence: 11,
            message_timestamp: Time::from_timestamp_millis(5).timestamp_millis(),
            upstream_offset: None,
        };

        gateway
            .put(
                p,
                Bytes::from_static(b"k"),
                1,
                Bytes::from_static(b"v"),
                ProduceMode::PassThrough(&upstream),
                42,
            )
            .await
            .unwrap();

        let records = fabric.records(&url, &topic, p).unwrap();
        assert_eq!(records[0].1.producer.guid, upstream_guid);
        assert_eq!(records[0].1.producer.segment, 3);
        assert_eq!(records[0].1.producer.sequence, 11);
        let footer = records[0].1.leader_footer.as_ref().unwrap();
        assert_eq!(footer.host_id, "host-1");
        assert_eq!(footer.upstream_offset, 42);
    }

    #[tokio::test]
    async fn segment_close_starts_a_new_segment() {
        let (fabric, url, topic, gateway) = gateway();
        let p = PartitionId::new(0);

        gateway
            .put(
                p,
                Bytes::from_static(b"k"),
                1,
                Bytes::from_static(b"v"),
                ProduceMode::OwnMetadata,
                0,
            )
            .await
            .unwrap();
        gateway.close_segment(p).await.unwrap();
        gateway
            .put(
                p,
                Bytes::from_static(b"k"),
                1,
                Bytes::from_static(b"v"),
                ProduceMode::OwnMetadata,
                1,
            )
            .await
            .unwrap();

        let records = fabric.records(&url, &topic, p).unwrap();
        assert_eq!(records[0].1.producer.segment, 0);
        assert_eq!(records[1].1.producer.segment, 1);
        assert_eq!(records[1].1.producer.sequence, 0);
    }

    #[tokio::test]
    async fn close_is_one_shot() {
        let (_, _, _, gateway) = gateway();
        gateway.close().await.unwrap();
        gateway.close().await.unwrap();

        let err = gateway
            .put(
                PartitionId::new(0),
                Bytes::new(),
                1,
                Bytes::new(),
                ProduceMode::OwnMetadata,
                0,
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("closed"));
    }
}
