use std::io::Cursor;

use byteorder::{LittleEndian, ReadBytesExt};

use crate::codec::Codec;
use crate::error::{CResult, Error};

/// Fixed eight-byte codec for 64-bit integers.
///
/// The byte order is pinned to little-endian, the native order of the hosts
/// this store targets. Decoding accepts shorter inputs by zero-extending the
/// missing high bytes, so a value written as four bytes by an older producer
/// reads back unchanged. Inputs longer than eight bytes fail.
#[derive(Clone, Copy, Default)]
pub struct IntCodec;

impl IntCodec {
    pub fn new() -> Self {
        IntCodec
    }
}

impl Codec<i64> for IntCodec {
    fn encode(&self, value: &i64) -> CResult<Vec<u8>> {
        Ok(value.to_le_bytes().to_vec())
    }

    fn decode(&self, bytes: &[u8]) -> CResult<i64> {
        if bytes.len() > 8 {
            return Err(Error::Encoding(format!(
                "integer must be at most 8 bytes, got {}",
                bytes.len()
            )));
        }
        if bytes.is_empty() {
            return Ok(0);
        }
        let mut cursor = Cursor::new(bytes);
        Ok(cursor.read_uint::<LittleEndian>(bytes.len())? as i64)
    }
}
