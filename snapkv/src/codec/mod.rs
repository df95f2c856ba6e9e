pub mod bin_codec;
pub mod int_codec;
pub mod string_codec;

use crate::error::CResult;

/// A stateless, total, bidirectional mapping between a typed value and its
/// byte sequence. Encoding never fails for a well-formed value; decoding
/// fails only on malformed bytes.
pub trait Codec<T>: Send + Sync {
    /// Encodes a value to bytes.
    fn encode(&self, value: &T) -> CResult<Vec<u8>>;

    /// Decodes a value from bytes.
    fn decode(&self, bytes: &[u8]) -> CResult<T>;
}
