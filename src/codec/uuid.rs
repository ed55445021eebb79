//! `uuid`, sixteen raw bytes in binary, hyphenated in text.
use bytes::Bytes;
use uuid::Uuid;

use super::{Codec, CodecRegistry, DecodeError, EncodeError, Encoded, PgValue, primitive::text_str};
use crate::postgres::{Oid, PgFormat, oid};

#[derive(Debug)]
pub struct UuidCodec;

impl Codec for UuidCodec {
    fn can_decode(&self, oid: Oid, _: PgFormat) -> bool {
        oid == oid::UUID
    }

    fn decode(
        &self,
        _: &CodecRegistry,
        raw: &Bytes,
        _: Oid,
        format: PgFormat,
    ) -> Result<PgValue, DecodeError> {
        let uuid = match format {
            PgFormat::Binary => Uuid::from_slice(raw)
                .map_err(|_| DecodeError::malformed("uuid must be 16 bytes"))?,
            PgFormat::Text => text_str(raw)?
                .parse()
                .map_err(|_| DecodeError::malformed("invalid uuid text"))?,
        };
        Ok(PgValue::Uuid(uuid))
    }

    fn can_encode(&self, value: &PgValue) -> bool {
        matches!(value, PgValue::Uuid(_))
    }

    fn encode(&self, _: &CodecRegistry, value: &PgValue) -> Result<Encoded, EncodeError> {
        let PgValue::Uuid(uuid) = value else {
            return Err(EncodeError::Unsupported(value.type_name()));
        };
        Ok(Encoded::inline(uuid.as_bytes(), oid::UUID))
    }

    fn preferred_type(&self, _: Oid, _: PgFormat) -> Option<&'static str> {
        Some("uuid::Uuid")
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn binary_and_text_agree() {
        let registry = CodecRegistry::default();
        let uuid: Uuid = "a0eebc99-9c0b-4ef8-bb6d-6bb9bd380a11".parse().unwrap();

        let raw = Bytes::copy_from_slice(uuid.as_bytes());
        assert_eq!(
            registry.decode(Some(&raw), oid::UUID, PgFormat::Binary).unwrap(),
            PgValue::Uuid(uuid),
        );

        let raw = Bytes::from_static(b"a0eebc99-9c0b-4ef8-bb6d-6bb9bd380a11");
        assert_eq!(
            registry.decode(Some(&raw), oid::UUID, PgFormat::Text).unwrap(),
            PgValue::Uuid(uuid),
        );

        let encoded = registry.encode(&PgValue::Uuid(uuid)).unwrap();
        assert_eq!(encoded.bytes(), Some(&uuid.as_bytes()[..]));
    }
}
