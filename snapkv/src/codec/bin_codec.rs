use std::marker::PhantomData;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::codec::Codec;
use crate::error::CResult;

/// Bincode codec for any serde-serializable value, so callers can store
/// structured values without writing a codec by hand.
pub struct BinCodec<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> BinCodec<T> {
    pub fn new() -> Self {
        BinCodec { _marker: PhantomData }
    }
}

impl<T> Default for BinCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Codec<T> for BinCodec<T>
where
    T: Serialize + DeserializeOwned + Send + Sync,
{
    fn encode(&self, value: &T) -> CResult<Vec<u8>> {
        Ok(bincode::serialize(value)?)
    }

    fn decode(&self, bytes: &[u8]) -> CResult<T> {
        Ok(bincode::deserialize(bytes)?)
    }
}
