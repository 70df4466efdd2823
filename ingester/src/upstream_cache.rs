//! TTL cache over upstream end-offset and offset-for-timestamp lookups.
//!
//! Entries are immutable once written; readers race freely and writers racing
//! to refresh the same key may both hit the upstream, last write wins.

use clock::{Time, TimeProvider};
use data_types::{FabricUrl, PartitionId, Topic};
use parking_lot::RwLock;
use pubsub::{PubSubError, TopicConsumer};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

type TopicPartitionKey = (FabricUrl, Topic, PartitionId);

#[derive(Debug, Clone, Copy)]
struct Cached<T> {
    fetched_at: Time,
    value: T,
}

/// Caches upstream metadata lookups across clusters, keyed by cluster URL.
#[derive(Debug)]
pub struct UpstreamMetadataCache {
    consumer: Arc<dyn TopicConsumer>,
    time: Arc<dyn TimeProvider>,
    ttl: Duration,
    end_offsets: RwLock<HashMap<TopicPartitionKey, Cached<i64>>>,
    timestamp_offsets: RwLock<HashMap<(TopicPartitionKey, i64), Cached<Option<i64>>>>,
}

impl UpstreamMetadataCache {
    /// Create a cache with the given entry TTL.
    pub fn new(consumer: Arc<dyn TopicConsumer>, time: Arc<dyn TimeProvider>, ttl: Duration) -> Self {
        Self {
            consumer,
            time,
            ttl,
            end_offsets: Default::default(),
            timestamp_offsets: Default::default(),
        }
    }

    fn is_fresh(&self, fetched_at: Time) -> bool {
        match self.time.now().checked_duration_since(fetched_at) {
            Some(age) => age < self.ttl,
            None => true,
        }
    }

    /// The next offset to be assigned on `(topic, partition)` at `url`,
    /// served from cache within the TTL.
    pub async fn end_offset(
        &self,
        url: &FabricUrl,
        topic: &Topic,
        partition: PartitionId,
    ) -> Result<i64, PubSubError> {
        let key = (url.clone(), topic.clone(), partition);
        if let Some(cached) = self.end_offsets.read().get(&key) {
            if self.is_fresh(cached.fetched_at) {
                return Ok(cached.value);
            }
        }

        let value = self.consumer.end_offset(url, topic, partition).await?;
        self.end_offsets.write().insert(
            key,
            Cached {
                fetched_at: self.time.now(),
                value,
            },
        );
        Ok(value)
    }

    /// The first offset at or after `timestamp_ms`, served from cache within
    /// the TTL.
    pub async fn offset_for_timestamp(
        &self,
        url: &FabricUrl,
        topic: &Topic,
        partition: PartitionId,
        timestamp_ms: i64,
    ) -> Result<Option<i64>, PubSubError> {
        let key = ((url.clone(), topic.clone(), partition), timestamp_ms);
        if let Some(cached) = self.timestamp_offsets.read().get(&key) {
            if self.is_fresh(cached.fetched_at) {
                return Ok(cached.value);
            }
        }

        let value = self
            .consumer
            .offset_for_timestamp(url, topic, partition, timestamp_ms)
            .await?;
        self.timestamp_offsets.write().insert(
            key,
            Cached {
                fetched_at: self.time.now(),
                value,
            },
        );
        Ok(value)
    }
}
