use crate::codec::Codec;
use crate::error::CResult;

/// UTF-8 string codec. Decoding is strict: bytes that are not valid UTF-8
/// fail instead of being replaced.
#[derive(Clone, Copy, Default)]
pub struct StringCodec;

impl StringCodec {
    pub fn new() -> Self {
        StringCodec
    }
}

impl Codec<String> for StringCodec {
    fn encode(&self, value: &String) -> CResult<Vec<u8>> {
        Ok(value.as_bytes().to_vec())
    }

    fn decode(&self, bytes: &[u8]) -> CResult<String> {
        Ok(String::from_utf8(bytes.to_vec())?)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::error::Error;

    #[test]
    fn roundtrip() -> CResult<()> {
        let codec = StringCodec::new();
        for value in ["", "a", "snapshot", "你好", "emoji 🦀"] {
            let value = value.to_string();
            assert_eq!(codec.decode(&codec.encode(&value)?)?, value);
        }
        Ok(())
    }

    #[test]
    fn invalid_utf8() {
        let codec = StringCodec::new();
        match codec.decode(&[0xff, 0xfe, 0xfd]) {
            Err(Error::Encoding(_)) => {}
            other => panic!("expected encoding failure, got {:?}", other),
        }
    }
}
