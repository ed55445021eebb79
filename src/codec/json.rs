//! `json` and `jsonb` via [`serde_json`].
//!
//! The binary form of `jsonb` is the text form behind a one-byte
//! version prefix; `json` has no prefix in either format.
use bytes::{BufMut, Bytes, BytesMut};

use super::{Codec, CodecRegistry, DecodeError, EncodeError, Encoded, PgValue};
use crate::postgres::{Oid, PgFormat, oid};

const JSONB_VERSION: u8 = 1;

#[derive(Debug)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn can_decode(&self, oid: Oid, _: PgFormat) -> bool {
        matches!(oid, oid::JSON | oid::JSONB)
    }

    fn decode(
        &self,
        _: &CodecRegistry,
        raw: &Bytes,
        oid: Oid,
        format: PgFormat,
    ) -> Result<PgValue, DecodeError> {
        let payload = match (oid, format) {
            (oid::JSONB, PgFormat::Binary) => match raw.split_first() {
                Some((&JSONB_VERSION, rest)) => rest,
                Some(_) => return Err(DecodeError::malformed("unknown jsonb version")),
                None => return Err(DecodeError::malformed("empty jsonb payload")),
            },
            _ => &raw[..],
        };
        serde_json::from_slice(payload)
            .map(PgValue::Json)
            .map_err(|e| DecodeError::malformed(format!("invalid json: {e}")))
    }

    fn can_encode(&self, value: &PgValue) -> bool {
        matches!(value, PgValue::Json(_))
    }

    fn encode(&self, _: &CodecRegistry, value: &PgValue) -> Result<Encoded, EncodeError> {
        let PgValue::Json(json) = value else {
            return Err(EncodeError::Unsupported(value.type_name()));
        };
        let text = serde_json::to_vec(json).expect("serde_json::Value is always serializable");
        let mut buf = BytesMut::with_capacity(text.len() + 1);
        buf.put_u8(JSONB_VERSION);
        buf.put_slice(&text);
        Ok(Encoded::binary(buf.freeze(), oid::JSONB))
    }

    fn preferred_type(&self, _: Oid, _: PgFormat) -> Option<&'static str> {
        Some("serde_json::Value")
    }
}
