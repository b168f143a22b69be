//! Error types surfaced by cache operations.

use thiserror::Error;

use crate::codec::CodecError;

/// Unified error type for cache operations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CacheError {
    /// The cache is full and every resident entry is mid-computation, so no
    /// eviction victim exists. The request was not admitted.
    #[error("cache capacity exhausted: all resident entries are mid-computation")]
    CapacityExhausted,

    /// The miss handler failed for this key; the failure is negative-cached
    /// for the configured negative TTL.
    #[error("negative-cached failure (ad hoc code {ad_hoc_code})")]
    Failed { ad_hoc_code: i8 },

    /// A compressed-bytes read was issued against a cache built without
    /// compression support.
    #[error("compression is not enabled for this cache")]
    CompressionDisabled,

    /// Serialization or LZ4 round-trip failure while storing or reading a
    /// value. The affected entry is negative-cached with
    /// [`CODEC_FAILURE_CODE`](crate::codec::CODEC_FAILURE_CODE).
    #[error(transparent)]
    Codec(#[from] CodecError),
}
