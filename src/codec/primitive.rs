//! Boolean, integer and floating point codecs.
use bytes::Bytes;

use super::{Codec, CodecRegistry, DecodeError, EncodeError, Encoded, PgValue};
use crate::postgres::{Oid, PgFormat, oid};

pub(super) fn check_len(raw: &[u8], expect: usize, what: &'static str) -> Result<(), DecodeError> {
    if raw.len() != expect {
        return Err(DecodeError::malformed(format!(
            "{what} must be {expect} bytes, got {}",
            raw.len(),
        )));
    }
    Ok(())
}

pub(super) fn text_str(raw: &[u8]) -> Result<&str, DecodeError> {
    std::str::from_utf8(raw).map_err(Into::into)
}

/// `bool`, binary single byte or text `t`/`f`.
#[derive(Debug)]
pub struct BoolCodec;

impl Codec for BoolCodec {
    fn can_decode(&self, oid: Oid, _: PgFormat) -> bool {
        oid == oid::BOOL
    }

    fn decode(
        &self,
        _: &CodecRegistry,
        raw: &Bytes,
        _: Oid,
        format: PgFormat,
    ) -> Result<PgValue, DecodeError> {
        let value = match format {
            PgFormat::Binary => {
                check_len(raw, 1, "bool")?;
                raw[0] != 0
            },
            PgFormat::Text => match text_str(raw)? {
                "t" | "true" => true,
                "f" | "false" => false,
                other => return Err(DecodeError::malformed(format!("invalid bool {other:?}"))),
            },
        };
        Ok(PgValue::Bool(value))
    }

    fn can_encode(&self, value: &PgValue) -> bool {
        matches!(value, PgValue::Bool(_))
    }

    fn encode(&self, _: &CodecRegistry, value: &PgValue) -> Result<Encoded, EncodeError> {
        let PgValue::Bool(b) = value else {
            return Err(EncodeError::Unsupported(value.type_name()));
        };
        Ok(Encoded::inline(&[*b as u8], oid::BOOL))
    }

    fn preferred_type(&self, _: Oid, _: PgFormat) -> Option<&'static str> {
        Some("bool")
    }
}

/// `int2`, `int4` and `int8`.
#[derive(Debug)]
pub struct IntCodec;

impl Codec for IntCodec {
    fn can_decode(&self, oid: Oid, _: PgFormat) -> bool {
        matches!(oid, oid::INT2 | oid::INT4 | oid::INT8)
    }

    fn decode(
        &self,
        _: &CodecRegistry,
        raw: &Bytes,
        oid: Oid,
        format: PgFormat,
    ) -> Result<PgValue, DecodeError> {
        match format {
            PgFormat::Binary => match oid {
                oid::INT2 => {
                    check_len(raw, 2, "int2")?;
                    Ok(PgValue::Int2(i16::from_be_bytes(raw[..].try_into().unwrap())))
                },
                oid::INT4 => {
                    check_len(raw, 4, "int4")?;
                    Ok(PgValue::Int4(i32::from_be_bytes(raw[..].try_into().unwrap())))
                },
                _ => {
                    check_len(raw, 8, "int8")?;
                    Ok(PgValue::Int8(i64::from_be_bytes(raw[..].try_into().unwrap())))
                },
            },
            PgFormat::Text => {
                let text = text_str(raw)?;
                let parse = |what| {
                    DecodeError::malformed(format!("invalid {what}: {text:?}"))
                };
                match oid {
                    oid::INT2 => Ok(PgValue::Int2(text.parse().map_err(|_| parse("int2"))?)),
                    oid::INT4 => Ok(PgValue::Int4(text.parse().map_err(|_| parse("int4"))?)),
                    _ => Ok(PgValue::Int8(text.parse().map_err(|_| parse("int8"))?)),
                }
            },
        }
    }

    fn can_encode(&self, value: &PgValue) -> bool {
        matches!(value, PgValue::Int2(_) | PgValue::Int4(_) | PgValue::Int8(_))
    }

    fn encode(&self, _: &CodecRegistry, value: &PgValue) -> Result<Encoded, EncodeError> {
        Ok(match value {
            PgValue::Int2(v) => Encoded::inline(&v.to_be_bytes(), oid::INT2),
            PgValue::Int4(v) => Encoded::inline(&v.to_be_bytes(), oid::INT4),
            PgValue::Int8(v) => Encoded::inline(&v.to_be_bytes(), oid::INT8),
            _ => return Err(EncodeError::Unsupported(value.type_name())),
        })
    }

    fn preferred_type(&self, oid: Oid, _: PgFormat) -> Option<&'static str> {
        match oid {
            oid::INT2 => Some("i16"),
            oid::INT4 => Some("i32"),
            oid::INT8 => Some("i64"),
            _ => None,
        }
    }
}

/// `float4` and `float8`, including the `NaN`/`Infinity` text spellings.
#[derive(Debug)]
pub struct FloatCodec;

fn parse_float<F: std::str::FromStr>(text: &str, what: &'static str) -> Result<F, DecodeError> {
    match text {
        "NaN" => "NaN".parse(),
        "Infinity" => "inf".parse(),
        "-Infinity" => "-inf".parse(),
        other => other.parse(),
    }
    .map_err(|_| DecodeError::malformed(format!("invalid {what}: {text:?}")))
}

impl Codec for FloatCodec {
    fn can_decode(&self, oid: Oid, _: PgFormat) -> bool {
        matches!(oid, oid::FLOAT4 | oid::FLOAT8)
    }

    fn decode(
        &self,
        _: &CodecRegistry,
        raw: &Bytes,
        oid: Oid,
        format: PgFormat,
    ) -> Result<PgValue, DecodeError> {
        match (oid, format) {
            (oid::FLOAT4, PgFormat::Binary) => {
                check_len(raw, 4, "float4")?;
                Ok(PgValue::Float4(f32::from_be_bytes(raw[..].try_into().unwrap())))
            },
            (_, PgFormat::Binary) => {
                check_len(raw, 8, "float8")?;
                Ok(PgValue::Float8(f64::from_be_bytes(raw[..].try_into().unwrap())))
            },
            (oid::FLOAT4, PgFormat::Text) => {
                Ok(PgValue::Float4(parse_float(text_str(raw)?, "float4")?))
            },
            (_, PgFormat::Text) => {
                Ok(PgValue::Float8(parse_float(text_str(raw)?, "float8")?))
            },
        }
    }

    fn can_encode(&self, value: &PgValue) -> bool {
        matches!(value, PgValue::Float4(_) | PgValue::Float8(_))
    }

    fn encode(&self, _: &CodecRegistry, value: &PgValue) -> Result<Encoded, EncodeError> {
        Ok(match value {
            PgValue::Float4(v) => Encoded::inline(&v.to_be_bytes(), oid::FLOAT4),
            PgValue::Float8(v) => Encoded::inline(&v.to_be_bytes(), oid::FLOAT8),
            _ => return Err(EncodeError::Unsupported(value.type_name())),
        })
    }

    fn preferred_type(&self, oid: Oid, _: PgFormat) -> Option<&'static str> {
        match oid {
            oid::FLOAT4 => Some("f32"),
            oid::FLOAT8 => Some("f64"),
            _ => None,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn registry() -> CodecRegistry {
        CodecRegistry::default()
    }

    fn decode(raw: &[u8], oid: Oid, format: PgFormat) -> PgValue {
        registry()
            .decode(Some(&Bytes::copy_from_slice(raw)), oid, format)
            .unwrap()
    }

    #[test]
    fn int_binary_and_text_agree() {
        assert_eq!(decode(&7i16.to_be_bytes(), oid::INT2, PgFormat::Binary), PgValue::Int2(7));
        assert_eq!(decode(b"7", oid::INT2, PgFormat::Text), PgValue::Int2(7));
        assert_eq!(
            decode(&(-42i32).to_be_bytes(), oid::INT4, PgFormat::Binary),
            PgValue::Int4(-42),
        );
        assert_eq!(decode(b"-42", oid::INT4, PgFormat::Text), PgValue::Int4(-42));
        assert_eq!(
            decode(&i64::MAX.to_be_bytes(), oid::INT8, PgFormat::Binary),
            PgValue::Int8(i64::MAX),
        );
    }

    #[test]
    fn bool_forms() {
        assert_eq!(decode(&[1], oid::BOOL, PgFormat::Binary), PgValue::Bool(true));
        assert_eq!(decode(b"t", oid::BOOL, PgFormat::Text), PgValue::Bool(true));
        assert_eq!(decode(b"f", oid::BOOL, PgFormat::Text), PgValue::Bool(false));
    }

    #[test]
    fn float_text_spellings() {
        let PgValue::Float8(v) = decode(b"NaN", oid::FLOAT8, PgFormat::Text) else {
            panic!()
        };
        assert!(v.is_nan());
        assert_eq!(
            decode(b"-Infinity", oid::FLOAT4, PgFormat::Text),
            PgValue::Float4(f32::NEG_INFINITY),
        );
        assert_eq!(decode(b"1.5", oid::FLOAT8, PgFormat::Text), PgValue::Float8(1.5));
    }

    #[test]
    fn truncated_binary_int_is_malformed() {
        let raw = Bytes::from_static(&[0, 1]);
        let err = registry().decode(Some(&raw), oid::INT4, PgFormat::Binary).unwrap_err();
        assert!(matches!(err, DecodeError::Malformed(_)));
    }

    #[test]
    fn encode_uses_fixed_widths() {
        let registry = registry();
        let encoded = registry.encode(&PgValue::Int8(200)).unwrap();
        assert_eq!(encoded.bytes(), Some(&200i64.to_be_bytes()[..]));
        assert_eq!(encoded.oid(), oid::INT8);
        assert_eq!(encoded.format(), PgFormat::Binary);

        let encoded = registry.encode(&PgValue::Bool(true)).unwrap();
        assert_eq!(encoded.bytes(), Some(&[1u8][..]));
    }
}
