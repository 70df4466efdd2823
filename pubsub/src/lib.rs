//! Abstractions over the log fabrics the ingestion engine talks to: an
//! upstream consumer (version, real-time and stream-reprocessing topics,
//! possibly on remote fabrics) and the downstream version-topic producer.
//!
//! [`mock`] provides an in-memory fabric implementing both sides, used by all
//! engine tests.
#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

pub mod core;
pub mod mock;

pub use crate::core::*;
