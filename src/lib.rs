#![doc = include_str!("../README.md")]
//!
//! ---
//!
//! # Crate layout
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`cache`] | [`ComputeCache`], the thread-safe controller |
//! | [`config`] | [`CacheConfig`] construction parameters |
//! | [`entry`] | [`Status`] state machine, [`ValueLease`] / [`BytesLease`] |
//! | [`codec`] | compression codec errors and the reserved failure code |
//! | [`error`] | [`CacheError`] |
//! | [`metrics`] | [`CacheCounters`] operation counters |

/// Cache controller: lookup, insertion, eviction, single-flight miss
/// coalescing, and TTL enforcement.
pub mod cache;

/// Value codec for the compression layer (bincode serialization wrapped in
/// LZ4 block compression).
pub mod codec;

/// Cache configuration structure.
pub mod config;

/// Entry record, its lifecycle state machine, and the lease types returned
/// by reads.
pub mod entry;

/// Error types for cache operations.
pub mod error;

/// Intrusive doubly linked list maintaining the recency order.
///
/// Internal infrastructure: raw-pointer operations that rely on the cache
/// controller's locking discipline. Not part of the public API.
pub(crate) mod list;

/// Operation counters with deterministic snapshot reporting.
pub mod metrics;

pub use cache::{ComputeCache, Iter, MissResult};
pub use codec::{CodecError, CODEC_FAILURE_CODE};
pub use config::CacheConfig;
pub use entry::{BytesLease, Status, ValueLease};
pub use error::CacheError;
pub use metrics::CacheCounters;
