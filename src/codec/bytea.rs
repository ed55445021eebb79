//! `bytea`, with both the `\x` hex and the legacy escape text output
//! forms.
use bytes::Bytes;

use super::{Codec, CodecRegistry, DecodeError, EncodeError, Encoded, PgValue};
use crate::postgres::{Oid, PgFormat, oid};

#[derive(Debug)]
pub struct ByteaCodec;

impl Codec for ByteaCodec {
    fn can_decode(&self, oid: Oid, _: PgFormat) -> bool {
        oid == oid::BYTEA
    }

    fn decode(
        &self,
        _: &CodecRegistry,
        raw: &Bytes,
        _: Oid,
        format: PgFormat,
    ) -> Result<PgValue, DecodeError> {
        match format {
            PgFormat::Binary => Ok(PgValue::Bytea(raw.clone())),
            PgFormat::Text => match raw.strip_prefix(b"\\x") {
                Some(hex) => decode_hex(hex),
                None => decode_escape(raw),
            },
        }
    }

    fn can_encode(&self, value: &PgValue) -> bool {
        matches!(value, PgValue::Bytea(_))
    }

    fn encode(&self, _: &CodecRegistry, value: &PgValue) -> Result<Encoded, EncodeError> {
        let PgValue::Bytea(bytes) = value else {
            return Err(EncodeError::Unsupported(value.type_name()));
        };
        Ok(Encoded::binary(bytes.clone(), oid::BYTEA))
    }

    fn preferred_type(&self, _: Oid, _: PgFormat) -> Option<&'static str> {
        Some("Vec<u8>")
    }
}

fn decode_hex(hex: &[u8]) -> Result<PgValue, DecodeError> {
    if hex.len() % 2 != 0 {
        return Err(DecodeError::malformed("odd length bytea hex"));
    }

    fn nibble(b: u8) -> Result<u8, DecodeError> {
        match b {
            b'0'..=b'9' => Ok(b - b'0'),
            b'a'..=b'f' => Ok(b - b'a' + 10),
            b'A'..=b'F' => Ok(b - b'A' + 10),
            _ => Err(DecodeError::malformed("invalid bytea hex digit")),
        }
    }

    let mut out = Vec::with_capacity(hex.len() / 2);
    for pair in hex.chunks_exact(2) {
        out.push((nibble(pair[0])? << 4) | nibble(pair[1])?);
    }
    Ok(PgValue::Bytea(out.into()))
}

fn decode_escape(raw: &[u8]) -> Result<PgValue, DecodeError> {
    let mut out = Vec::with_capacity(raw.len());
    let mut iter = raw.iter().copied();
    while let Some(b) = iter.next() {
        if b != b'\\' {
            out.push(b);
            continue;
        }
        match iter.next() {
            Some(b'\\') => out.push(b'\\'),
            Some(o1 @ b'0'..=b'3') => {
                let (Some(o2 @ b'0'..=b'7'), Some(o3 @ b'0'..=b'7')) =
                    (iter.next(), iter.next())
                else {
                    return Err(DecodeError::malformed("truncated bytea octal escape"));
                };
                out.push(((o1 - b'0') << 6) | ((o2 - b'0') << 3) | (o3 - b'0'));
            },
            _ => return Err(DecodeError::malformed("invalid bytea escape")),
        }
    }
    Ok(PgValue::Bytea(out.into()))
}

#[cfg(test)]
mod test {
    use super::*;

    fn decode(raw: &[u8], format: PgFormat) -> Bytes {
        let registry = CodecRegistry::default();
        let value = registry
            .decode(Some(&Bytes::copy_from_slice(raw)), oid::BYTEA, format)
            .unwrap();
        let PgValue::Bytea(bytes) = value else { panic!() };
        bytes
    }

    #[test]
    fn hex_form() {
        assert_eq!(decode(b"\\x6869", PgFormat::Text), &b"hi"[..]);
        assert_eq!(decode(b"\\xDEadBEef", PgFormat::Text), &[0xde, 0xad, 0xbe, 0xef][..]);
    }

    #[test]
    fn escape_form() {
        assert_eq!(decode(b"abc\\000\\\\x", PgFormat::Text), &b"abc\0\\x"[..]);
        assert_eq!(decode(b"\\377", PgFormat::Text), &[0xff][..]);
    }

    #[test]
    fn binary_is_passthrough() {
        assert_eq!(decode(&[0, 1, 2], PgFormat::Binary), &[0, 1, 2][..]);
    }

    #[test]
    fn empty_is_distinct_from_null() {
        let registry = CodecRegistry::default();
        let raw = Bytes::new();
        let value = registry.decode(Some(&raw), oid::BYTEA, PgFormat::Binary).unwrap();
        assert_eq!(value, PgValue::Bytea(Bytes::new()));
        let null = registry.decode(None, oid::BYTEA, PgFormat::Binary).unwrap();
        assert!(null.is_null());
    }
}
