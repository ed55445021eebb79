//! Character types: `text`, `varchar`, `bpchar`, `char`, `name`.
//!
//! Text and binary wire forms are identical byte-for-byte, both are the
//! UTF-8 payload.
use bytes::Bytes;

use super::{Codec, CodecRegistry, DecodeError, EncodeError, Encoded, PgValue};
use crate::{
    common::ByteStr,
    postgres::{Oid, PgFormat, oid},
};

#[derive(Debug)]
pub struct TextCodec;

impl Codec for TextCodec {
    fn can_decode(&self, oid: Oid, _: PgFormat) -> bool {
        matches!(
            oid,
            oid::TEXT | oid::VARCHAR | oid::BPCHAR | oid::CHAR | oid::NAME | oid::UNKNOWN,
        )
    }

    fn decode(
        &self,
        _: &CodecRegistry,
        raw: &Bytes,
        _: Oid,
        _: PgFormat,
    ) -> Result<PgValue, DecodeError> {
        Ok(PgValue::Text(ByteStr::from_utf8(raw.clone())?))
    }

    fn can_encode(&self, value: &PgValue) -> bool {
        matches!(value, PgValue::Text(_))
    }

    fn encode(&self, _: &CodecRegistry, value: &PgValue) -> Result<Encoded, EncodeError> {
        let PgValue::Text(text) = value else {
            return Err(EncodeError::Unsupported(value.type_name()));
        };
        Ok(Encoded::text(text.as_str().to_owned(), oid::TEXT))
    }

    fn preferred_type(&self, _: Oid, _: PgFormat) -> Option<&'static str> {
        Some("String")
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn utf8_is_enforced() {
        let registry = CodecRegistry::default();
        let raw = Bytes::from_static(&[0xff, 0xfe]);
        let err = registry.decode(Some(&raw), oid::TEXT, PgFormat::Text).unwrap_err();
        assert!(matches!(err, DecodeError::Utf8(_)));
    }

    #[test]
    fn varchar_and_text_share_the_codec() {
        let registry = CodecRegistry::default();
        let raw = Bytes::from_static(b"hello");
        for oid in [oid::TEXT, oid::VARCHAR, oid::BPCHAR, oid::NAME] {
            let value = registry.decode(Some(&raw), oid, PgFormat::Binary).unwrap();
            let PgValue::Text(text) = value else { panic!() };
            assert_eq!(text.as_str(), "hello");
        }
    }
}
