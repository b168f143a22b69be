//! Value codec backing the compression layer.
//!
//! Stored form is `LZ4_block(bincode(value))`. The block carries no length
//! prefix; the serialized (uncompressed) length is recorded out-of-band in
//! the owning entry, which is what `LZ4_decompress_safe` needs to size its
//! output buffer.

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

/// Ad hoc code reserved for entries negative-cached by a codec failure.
///
/// The miss handler owns the rest of the `i8` range; handlers should not
/// use this value for their own purposes.
pub const CODEC_FAILURE_CODE: i8 = i8::MIN;

/// Failure in either direction of the serialize/compress round trip.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("serialization failed: {0}")]
    Serialize(String),

    #[error("deserialization failed: {0}")]
    Deserialize(String),

    #[error("compression failed: {0}")]
    Compress(String),

    #[error("decompression failed: {0}")]
    Decompress(String),
}

/// Serializes `value` and LZ4-compresses the result. Returns the compressed
/// bytes together with the serialized length.
pub(crate) fn encode_value<V: Serialize>(value: &V) -> Result<(Vec<u8>, u64), CodecError> {
    let serialized =
        bincode::serialize(value).map_err(|e| CodecError::Serialize(e.to_string()))?;
    let compressed = lz4::block::compress(&serialized, None, false)
        .map_err(|e| CodecError::Compress(e.to_string()))?;
    Ok((compressed, serialized.len() as u64))
}

/// Inverse of [`encode_value`]. `original_size` must be the serialized
/// length recorded when the bytes were produced.
pub(crate) fn decode_value<V: DeserializeOwned>(
    bytes: &[u8],
    original_size: u64,
) -> Result<V, CodecError> {
    let serialized = lz4::block::decompress(bytes, Some(original_size as i32))
        .map_err(|e| CodecError::Decompress(e.to_string()))?;
    bincode::deserialize(&serialized).map_err(|e| CodecError::Deserialize(e.to_string()))
}

/// Monomorphized codec entry points captured by the `with_compression`
/// constructors, so the serde bounds never leak into the rest of the cache
/// API.
pub(crate) struct CodecVtable<V> {
    pub(crate) encode: fn(&V) -> Result<(Vec<u8>, u64), CodecError>,
    pub(crate) decode: fn(&[u8], u64) -> Result<V, CodecError>,
}

impl<V> CodecVtable<V> {
    pub(crate) fn new() -> Self
    where
        V: Serialize + DeserializeOwned,
    {
        CodecVtable {
            encode: encode_value::<V>,
            decode: decode_value::<V>,
        }
    }
}
