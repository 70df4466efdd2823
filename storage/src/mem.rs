//! In-memory [`StorageEngine`].

use crate::{Result, StorageEngine, StorageError};
use bytes::Bytes;
use data_types::{PartitionId, METADATA_PARTITION_ID};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};

#[derive(Debug, Default)]
struct PartitionData {
    records: BTreeMap<Vec<u8>, Bytes>,
    replication_metadata: BTreeMap<Vec<u8>, Bytes>,
    batch_mode: bool,
    sync_count: u64,
}

/// A [`StorageEngine`] holding everything in memory. The engine every test
/// runs against.
///
/// The outer lock guards partition open/close (batch-mode toggles re-open a
/// partition) against concurrent point lookups.
#[derive(Debug, Default)]
pub struct MemStorageEngine {
    partitions: RwLock<HashMap<u32, PartitionData>>,
}

impl MemStorageEngine {
    /// Create an empty engine with a metadata partition.
    pub fn new() -> Self {
        let engine = Self::default();
        engine
            .partitions
            .write()
            .insert(METADATA_PARTITION_ID, PartitionData::default());
        engine
    }

    fn with_partition<R>(
        &self,
        partition: PartitionId,
        f: impl FnOnce(&mut PartitionData) -> R,
    ) -> Result<R> {
        let mut partitions = self.partitions.write();
        let data = partitions
            .get_mut(&partition.get())
            .ok_or(StorageError::PartitionNotFound { partition })?;
        Ok(f(data))
    }
}

impl StorageEngine for MemStorageEngine {
    fn create_partition(&self, partition: PartitionId) -> Result<()> {
        self.partitions
            .write()
            .entry(partition.get())
            .or_default();
        Ok(())
    }

    fn drop_partition(&self, partition: PartitionId) -> Result<()> {
        self.partitions.write().remove(&partition.get());
        Ok(())
    }

    fn drop_store(&self) -> Result<()> {
        self.partitions.write().clear();
        Ok(())
    }

    fn put(&self, partition: PartitionId, key: &[u8], value: &[u8]) -> Result<()> {
        self.with_partition(partition, |data| {
            data.records
                .insert(key.to_vec(), Bytes::copy_from_slice(value));
        })
    }

    fn put_with_replication_metadata(
        &self,
        partition: PartitionId,
        key: &[u8],
        value: &[u8],
        replication_metadata: &[u8],
    ) -> Result<()> {
        self.with_partition(partition, |data| {
            data.records
                .insert(key.to_vec(), Bytes::copy_from_slice(value));
            data.replication_metadata
                .insert(key.to_vec(), Bytes::copy_from_slice(replication_metadata));
        })
    }

    fn get(&self, partition: PartitionId, key: &[u8]) -> Result<Option<Bytes>> {
        let partitions = self.partitions.read();
        let data = partitions
            .get(&partition.get())
            .ok_or(StorageError::PartitionNotFound { partition })?;
        Ok(data.records.get(key).cloned())
    }

    fn delete(&self, partition: PartitionId, key: &[u8]) -> Result<()> {
        self.with_partition(partition, |data| {
            data.records.remove(key);
            data.replication_metadata.remove(key);
        })
    }

    fn begin_batch_write(&self, partition: PartitionId) -> Result<()> {
        self.with_partition(partition, |data| data.batch_mode = true)
    }

    fn end_batch_write(&self, partition: PartitionId) -> Result<()> {
        self.with_partition(partition, |data| data.batch_mode = false)
    }

    fn sync(&self, partition: PartitionId) -> Result<BTreeMap<String, String>> {
        self.with_partition(partition, |data| {
            data.sync_count += 1;
            BTreeMap::from([
                ("records".to_string(), data.records.len().to_string()),
                ("syncs".to_string(), data.sync_count.to_string()),
            ])
        })
    }

    fn put_metadata(&self, key: &str, value: &[u8]) -> Result<()> {
        self.put(
            PartitionId::new(METADATA_PARTITION_ID),
            key.as_bytes(),
            value,
        )
    }

    fn get_metadata(&self, key: &str) -> Result<Option<Bytes>> {
        self.get(PartitionId::new(METADATA_PARTITION_ID), key.as_bytes())
    }

    fn delete_metadata(&self, key: &str) -> Result<()> {
        self.delete(PartitionId::new(METADATA_PARTITION_ID), key.as_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_get_delete() {
        let engine = MemStorageEngine::new();
        let p = PartitionId::new(3);
        engine.create_partition(p).unwrap();

        engine.put(p, b"k", b"v1").unwrap();
        assert_eq!(engine.get(p, b"k").unwrap().unwrap().as_ref(), b"v1");

        engine.put(p, b"k", b"v2").unwrap();
        assert_eq!(engine.get(p, b"k").unwrap().unwrap().as_ref(), b"v2");

        engine.delete(p, b"k").unwrap();
        assert!(engine.get(p, b"k").unwrap().is_none());
    }

    #[test]
    fn unknown_partition_errors() {
        let engine = MemStorageEngine::new();
        let err = engine.put(PartitionId::new(9), b"k", b"v").unwrap_err();
        assert!(matches!(err, StorageError::PartitionNotFound { .. }));
    }

    #[test]
    fn create_partition_is_idempotent() {
        let engine = MemStorageEngine::new();
        let p = PartitionId::new(1);
        engine.create_partition(p).unwrap();
        engine.put(p, b"k", b"v").unwrap();
        engine.create_partition(p).unwrap();
        assert_eq!(engine.get(p, b"k").unwrap().unwrap().as_ref(), b"v");
    }

    #[test]
    fn metadata_partition_round_trip() {
        let engine = MemStorageEngine::new();
        engine.put_metadata("VERSION_METADATA", b"state").unwrap();
        assert_eq!(
            engine.get_metadata("VERSION_METADATA").unwrap().unwrap(),
            Bytes::from_static(b"state")
        );
        engine.delete_metadata("VERSION_METADATA").unwrap();
        assert!(engine.get_metadata("VERSION_METADATA").unwrap().is_none());
    }

    #[test]
    fn drop_partition_discards_data() {
        let engine = MemStorageEngine::new();
        let p = PartitionId::new(2);
        engine.create_partition(p).unwrap();
        engine.put(p, b"k", b"v").unwrap();
        engine.drop_partition(p).unwrap();
        assert!(matches!(
            engine.get(p, b"k"),
            Err(StorageError::PartitionNotFound { .. })
        ));
    }
}
