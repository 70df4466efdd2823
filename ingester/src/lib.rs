//! Leader/follower partition ingestion engine for a versioned key-value
//! store.
//!
//! Per store version, one [`IngestionTask`](task::IngestionTask) supervises a
//! set of partitions. Each partition is either STANDBY, tailing the canonical
//! version topic and applying records to local storage, or LEADER, consuming
//! an upstream source (real-time, stream-reprocessing, or a remote version
//! topic) and re-producing it into the version topic for everyone else.
//!
//! The moving parts:
//!
//! - [`task`] owns the ingestion loop: it services role-change actions, runs
//!   deadline-driven transitions, polls upstreams and delegates records.
//! - [`gateway`] wraps the shared version-topic producer (lazy creation,
//!   segment lifecycle, chunk handling, completion wiring).
//! - [`drainer`] applies records to storage behind memory-bounded queues and
//!   checkpoints per-partition offsets.
//! - [`div`] tracks per-producer segment/sequence positions to catch
//!   duplicates and gaps; [`rewind`] classifies upstream-offset rewinds
//!   caused by leader churn.
//! - [`offsets`] persists per-partition offset records and the per-version
//!   state in the storage engine's metadata partition.
#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

pub mod actions;
pub mod completion;
pub mod config;
pub mod delegator;
pub mod div;
pub mod drainer;
pub mod error;
pub mod gateway;
pub mod metrics;
pub mod offsets;
pub mod pcs;
pub mod queue;
pub mod rewind;
pub mod status;
pub mod task;
pub mod upstream_cache;

pub use crate::config::{IngesterConfig, StoreContext};
pub use crate::delegator::UpdateApplier;
pub use crate::error::IngestError;
pub use crate::status::{RecordingStatusReporter, StatusEvent, StatusReporter};
pub use crate::task::{IngestionTask, IngestionTaskParams};
