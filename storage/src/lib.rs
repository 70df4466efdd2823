//! The pluggable partitioned key-value engine the ingestion engine writes
//! into, plus an in-memory implementation.
//!
//! The engine is deliberately minimal: puts, gets, deletes, a batch-write mode
//! toggled around bulk loads, a per-partition sync checkpoint, and a metadata
//! partition keyed by well-known strings. Everything else (compaction, disk
//! format) is behind the trait.
#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    missing_docs,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

use bytes::Bytes;
use data_types::PartitionId;
use snafu::Snafu;
use std::collections::BTreeMap;
use std::fmt::Debug;

mod mem;
pub use mem::MemStorageEngine;

/// Errors returned by a [`StorageEngine`].
#[derive(Debug, Snafu)]
#[allow(missing_docs)]
pub enum StorageError {
    #[snafu(display("partition {partition} does not exist"))]
    PartitionNotFound { partition: PartitionId },

    #[snafu(display("storage engine failure: {message}"))]
    EngineFailure { message: String },
}

#[allow(missing_docs)]
pub type Result<T, E = StorageError> = std::result::Result<T, E>;

/// A partitioned key-value engine owned by a single store version.
///
/// Implementations must serialize writes per partition; callers guarantee a
/// single writer per partition but may read concurrently with writes (the
/// write-compute lookup path reads from the ingestion thread while drainers
/// write).
pub trait StorageEngine: Debug + Send + Sync + 'static {
    /// Create `partition` if it does not exist yet.
    fn create_partition(&self, partition: PartitionId) -> Result<()>;

    /// Drop `partition` and all its data.
    fn drop_partition(&self, partition: PartitionId) -> Result<()>;

    /// Drop every partition, including metadata.
    fn drop_store(&self) -> Result<()>;

    /// Write `value` under `key`.
    fn put(&self, partition: PartitionId, key: &[u8], value: &[u8]) -> Result<()>;

    /// Write `value` under `key` together with opaque replication metadata.
    fn put_with_replication_metadata(
        &self,
        partition: PartitionId,
        key: &[u8],
        value: &[u8],
        replication_metadata: &[u8],
    ) -> Result<()>;

    /// Read the value under `key`.
    fn get(&self, partition: PartitionId, key: &[u8]) -> Result<Option<Bytes>>;

    /// Remove `key`.
    fn delete(&self, partition: PartitionId, key: &[u8]) -> Result<()>;

    /// Switch `partition` into batch-write mode for a bulk load.
    fn begin_batch_write(&self, partition: PartitionId) -> Result<()>;

    /// Leave batch-write mode, re-opening the partition for point writes.
    fn end_batch_write(&self, partition: PartitionId) -> Result<()>;

    /// Flush `partition`, returning the engine's checkpoint description.
    fn sync(&self, partition: PartitionId) -> Result<BTreeMap<String, String>>;

    /// Write a metadata-partition entry.
    fn put_metadata(&self, key: &str, value: &[u8]) -> Result<()>;

    /// Read a metadata-partition entry.
    fn get_metadata(&self, key: &str) -> Result<Option<Bytes>>;

    /// Remove a metadata-partition entry.
    fn delete_metadata(&self, key: &str) -> Result<()>;
}
