//! Shared data types for the partition ingestion engine: identifiers, topic
//! naming rules, and the control-plane values persisted alongside offsets.
#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_copy_implementations,
    missing_debug_implementations,
    missing_docs,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

use snafu::Snafu;
use std::fmt::Display;

/// Sentinel offset meaning "start from the oldest retained record".
pub const LOWEST_OFFSET: i64 = -1;

/// Partition id reserved for the storage engine's metadata partition.
pub const METADATA_PARTITION_ID: u32 = 1_000_000_000;

/// Reserved key in `upstream_offsets` that tracks the single upstream source
/// of a partition.
pub const SINGLE_SOURCE_UPSTREAM_KEY: &str = "NON_AA";

/// Errors constructing or parsing the types in this crate.
#[derive(Debug, Snafu)]
#[allow(missing_docs)]
pub enum Error {
    #[snafu(display("producer guid must be 16 bytes, got {len}"))]
    InvalidProducerGuid { len: usize },
}

/// Unique id of a (sub-)partition within a store version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PartitionId(u32);

#[allow(missing_docs)]
impl PartitionId {
    pub const fn new(v: u32) -> Self {
        Self(v)
    }

    pub fn get(&self) -> u32 {
        self.0
    }

    /// The user partition this sub-partition amplifies.
    pub fn user_partition(&self, amplification_factor: u32) -> Self {
        Self(self.0 / amplification_factor)
    }

    /// Whether this sub-partition is the one entitled to produce on behalf of
    /// its user partition.
    pub fn is_leader_sub_partition(&self, amplification_factor: u32) -> bool {
        self.0 % amplification_factor == 0
    }
}

impl Display for PartitionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// URL of an upstream or downstream log fabric (cluster).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FabricUrl(String);

impl FabricUrl {
    /// Create a fabric URL.
    pub fn new(url: impl Into<String>) -> Self {
        Self(url.into())
    }

    /// The URL as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for FabricUrl {
    fn from(v: &str) -> Self {
        Self(v.to_string())
    }
}

impl Display for FabricUrl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity of a record producer. 16 opaque bytes, normally a UUID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProducerGuid([u8; 16]);

impl ProducerGuid {
    /// A fresh random identity.
    pub fn random() -> Self {
        Self(*uuid::Uuid::new_v4().as_bytes())
    }

    /// The raw bytes.
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// Rebuild from raw bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, Error> {
        let bytes: [u8; 16] = bytes
            .try_into()
            .map_err(|_| Error::InvalidProducerGuid { len: bytes.len() })?;
        Ok(Self(bytes))
    }

    /// Hex rendering, used as a map key in persisted state.
    pub fn to_hex(&self) -> String {
        self.0.iter().map(|b| format!("{b:02x}")).collect()
    }
}

impl Display for ProducerGuid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

const REAL_TIME_SUFFIX: &str = "_rt";
const STREAM_REPROCESSING_SUFFIX: &str = "_sr";
const VERSION_SEPARATOR: &str = "_v";

/// A topic name, classified by the store naming convention:
///
/// - `<store>_v<N>` is the version topic of version `N`,
/// - `<store>_rt` is the store's real-time topic,
/// - `<store>_v<N>_sr` is the stream-reprocessing topic feeding version `N`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Topic(String);

impl Topic {
    /// The version topic of `version` of `store`.
    pub fn version_topic(store: &str, version: u32) -> Self {
        Self(format!("{store}{VERSION_SEPARATOR}{version}"))
    }

    /// The real-time topic of `store`.
    pub fn real_time(store: &str) -> Self {
        Self(format!("{store}{REAL_TIME_SUFFIX}"))
    }

    /// The stream-reprocessing topic of `version` of `store`.
    pub fn stream_reprocessing(store: &str, version: u32) -> Self {
        Self(format!(
            "{store}{VERSION_SEPARATOR}{version}{STREAM_REPROCESSING_SUFFIX}"
        ))
    }

    /// Parse an existing topic name.
    pub fn parse(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Topic name as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether this is a real-time topic.
    pub fn is_real_time(&self) -> bool {
        self.0.ends_with(REAL_TIME_SUFFIX)
    }

    /// Whether this is a stream-reprocessing topic.
    pub fn is_stream_reprocessing(&self) -> bool {
        self.0.ends_with(STREAM_REPROCESSING_SUFFIX)
    }

    /// Whether this is a version topic.
    pub fn is_version_topic(&self) -> bool {
        !self.is_real_time() && !self.is_stream_reprocessing() && self.version().is_some()
    }

    /// The store this topic belongs to.
    pub fn store_name(&self) -> &str {
        let base = self
            .0
            .strip_suffix(REAL_TIME_SUFFIX)
            .or_else(|| self.0.strip_suffix(STREAM_REPROCESSING_SUFFIX))
            .unwrap_or(&self.0);
        match base.rfind(VERSION_SEPARATOR) {
            Some(idx) if base[idx + VERSION_SEPARATOR.len()..]
                .chars()
                .all(|c| c.is_ascii_digit())
                && idx + VERSION_SEPARATOR.len() < base.len() =>
            {
                &base[..idx]
            }
            _ => base,
        }
    }

    /// The store version this topic feeds, if the name carries one.
    pub fn version(&self) -> Option<u32> {
        let base = self
            .0
            .strip_suffix(STREAM_REPROCESSING_SUFFIX)
            .unwrap_or(&self.0);
        let idx = base.rfind(VERSION_SEPARATOR)?;
        base[idx + VERSION_SEPARATOR.len()..].parse().ok()
    }
}

impl Display for Topic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Compression applied to values in a version topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompressionStrategy {
    /// Values are stored as-is.
    #[default]
    NoOp,
    /// Gzip-compressed values.
    Gzip,
    /// Zstd-compressed values, dictionary trained per push.
    ZstdWithDict,
}

impl CompressionStrategy {
    /// Stable wire id.
    pub fn as_i32(&self) -> i32 {
        match self {
            Self::NoOp => 0,
            Self::Gzip => 1,
            Self::ZstdWithDict => 2,
        }
    }

    /// Decode a wire id, defaulting unknown values to [`Self::NoOp`].
    pub fn from_i32(v: i32) -> Self {
        match v {
            1 => Self::Gzip,
            2 => Self::ZstdWithDict,
            _ => Self::NoOp,
        }
    }
}

/// Control message ordering a leader to change its upstream source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicSwitch {
    /// The topic to consume from after the switch.
    pub source_topic: Topic,
    /// Fabric(s) hosting the source topic. This engine requires exactly one.
    pub source_fabric_urls: Vec<FabricUrl>,
    /// Rewind point for the new source; `<= 0` means "from oldest".
    pub rewind_start_timestamp: i64,
}

/// How incremental pushes reach this store version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IncrementalPushPolicy {
    /// Incremental pushes write straight to the version topic.
    #[default]
    PushToVersionTopic,
    /// Incremental pushes ride the real-time topic like hybrid writes.
    IncrementalPushSameAsRealTime,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topic_classification() {
        let vt = Topic::version_topic("user_profiles", 7);
        assert_eq!(vt.as_str(), "user_profiles_v7");
        assert!(vt.is_version_topic());
        assert!(!vt.is_real_time());
        assert!(!vt.is_stream_reprocessing());
        assert_eq!(vt.store_name(), "user_profiles");
        assert_eq!(vt.version(), Some(7));

        let rt = Topic::real_time("user_profiles");
        assert!(rt.is_real_time());
        assert!(!rt.is_version_topic());
        assert_eq!(rt.store_name(), "user_profiles");
        assert_eq!(rt.version(), None);

        let sr = Topic::stream_reprocessing("user_profiles", 7);
        assert_eq!(sr.as_str(), "user_profiles_v7_sr");
        assert!(sr.is_stream_reprocessing());
        assert!(!sr.is_version_topic());
        assert_eq!(sr.store_name(), "user_profiles");
        assert_eq!(sr.version(), Some(7));
    }

    #[test]
    fn store_names_containing_version_separator() {
        let vt = Topic::version_topic("a_v2_store", 3);
        assert_eq!(vt.as_str(), "a_v2_store_v3");
        assert_eq!(vt.store_name(), "a_v2_store");
        assert_eq!(vt.version(), Some(3));
    }

    #[test]
    fn sub_partition_math() {
        let p = PartitionId::new(6);
        assert_eq!(p.user_partition(3), PartitionId::new(2));
        assert!(p.is_leader_sub_partition(3));
        assert!(!PartitionId::new(7).is_leader_sub_partition(3));

        // amplification factor of one: every partition is its own leader
        assert!(PartitionId::new(5).is_leader_sub_partition(1));
        assert_eq!(PartitionId::new(5).user_partition(1), PartitionId::new(5));
    }

    #[test]
    fn producer_guid_round_trip() {
        let guid = ProducerGuid::random();
        let restored = ProducerGuid::from_bytes(guid.as_bytes()).unwrap();
        assert_eq!(guid, restored);
        assert_eq!(guid.to_hex().len(), 32);

        assert!(matches!(
            ProducerGuid::from_bytes(&[1, 2, 3]),
            Err(Error::InvalidProducerGuid { len: 3 })
        ));
    }
}
