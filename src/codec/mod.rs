//! Value encoding and decoding.
//!
//! A [`Codec`] translates between wire values, identified by oid and
//! format, and host values represented as [`PgValue`]. The
//! [`CodecRegistry`] holds codecs in registration order; lookups return
//! the first codec that reports capability, so user codecs registered
//! in front can override the built-ins.
use bytes::Bytes;
use std::{borrow::Cow, fmt, str::Utf8Error};

use crate::{
    common::ByteStr,
    postgres::{Oid, PgFormat, oid},
};

mod array;
mod bytea;
mod json;
mod net;
mod numeric;
mod primitive;
mod temporal;
mod text;
mod uuid;

pub use array::PgArray;
pub use temporal::Interval;

/// A decoded host value.
///
/// The variant set mirrors the built-in codecs; `Null` retains the
/// column's declared oid so typed access can still reason about it.
#[derive(Debug, Clone, PartialEq)]
pub enum PgValue {
    Null(Oid),
    Bool(bool),
    Int2(i16),
    Int4(i32),
    Int8(i64),
    Float4(f32),
    Float8(f64),
    /// Arbitrary precision numeric, kept in decimal text form.
    Numeric(String),
    Text(ByteStr),
    Bytea(Bytes),
    Date(time::Date),
    Time(time::Time),
    Timestamp(time::PrimitiveDateTime),
    TimestampTz(time::OffsetDateTime),
    Interval(Interval),
    Uuid(::uuid::Uuid),
    Json(serde_json::Value),
    Inet(std::net::IpAddr),
    Url(url::Url),
    Array(PgArray),
}

impl PgValue {
    /// Host-side name of the variant, for diagnostics.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Null(_) => "null",
            Self::Bool(_) => "bool",
            Self::Int2(_) => "i16",
            Self::Int4(_) => "i32",
            Self::Int8(_) => "i64",
            Self::Float4(_) => "f32",
            Self::Float8(_) => "f64",
            Self::Numeric(_) => "numeric",
            Self::Text(_) => "String",
            Self::Bytea(_) => "Vec<u8>",
            Self::Date(_) => "time::Date",
            Self::Time(_) => "time::Time",
            Self::Timestamp(_) => "time::PrimitiveDateTime",
            Self::TimestampTz(_) => "time::OffsetDateTime",
            Self::Interval(_) => "Interval",
            Self::Uuid(_) => "uuid::Uuid",
            Self::Json(_) => "serde_json::Value",
            Self::Inet(_) => "IpAddr",
            Self::Url(_) => "url::Url",
            Self::Array(_) => "PgArray",
        }
    }

    /// Returns `true` for the `Null` variant.
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null(_))
    }

    /// The natural parameter oid of this value.
    pub fn oid(&self) -> Oid {
        match self {
            Self::Null(oid) => *oid,
            Self::Bool(_) => oid::BOOL,
            Self::Int2(_) => oid::INT2,
            Self::Int4(_) => oid::INT4,
            Self::Int8(_) => oid::INT8,
            Self::Float4(_) => oid::FLOAT4,
            Self::Float8(_) => oid::FLOAT8,
            Self::Numeric(_) => oid::NUMERIC,
            Self::Text(_) => oid::TEXT,
            Self::Bytea(_) => oid::BYTEA,
            Self::Date(_) => oid::DATE,
            Self::Time(_) => oid::TIME,
            Self::Timestamp(_) => oid::TIMESTAMP,
            Self::TimestampTz(_) => oid::TIMESTAMPTZ,
            Self::Interval(_) => oid::INTERVAL,
            Self::Uuid(_) => oid::UUID,
            Self::Json(_) => oid::JSONB,
            Self::Inet(_) => oid::INET,
            Self::Url(_) => oid::TEXT,
            Self::Array(array) => array::array_oid(array.element_oid),
        }
    }
}

/// A type with a corresponding postgres oid.
pub trait PgType {
    const OID: Oid;
}

macro_rules! pg_type {
    ($ty:ty, $oid:expr $(, $doc:literal)?) => {
        impl PgType for $ty {
            $(#[doc = $doc])?
            const OID: Oid = $oid;
        }
    };
}

pg_type!(bool, oid::BOOL);
pg_type!(i16, oid::INT2, "`int2` 2-byte storage");
pg_type!(i32, oid::INT4, "`int4` 4-byte storage");
pg_type!(i64, oid::INT8, "`int8` 8-byte storage");
pg_type!(f32, oid::FLOAT4, "`float4` single-precision floating point");
pg_type!(f64, oid::FLOAT8, "`float8` double-precision floating point");
pg_type!(&str, oid::TEXT, "`text` variable-length string");
pg_type!(String, oid::TEXT, "`text` variable-length string");
pg_type!(Vec<u8>, oid::BYTEA);
pg_type!(::uuid::Uuid, oid::UUID);
pg_type!(time::Date, oid::DATE);
pg_type!(time::Time, oid::TIME);
pg_type!(time::PrimitiveDateTime, oid::TIMESTAMP);
pg_type!(time::OffsetDateTime, oid::TIMESTAMPTZ);
pg_type!(Interval, oid::INTERVAL);
pg_type!(serde_json::Value, oid::JSONB);
pg_type!(std::net::IpAddr, oid::INET);

macro_rules! value_from {
    (<$ty:ty> $pat:pat => $body:expr) => {
        impl From<$ty> for PgValue {
            fn from($pat: $ty) -> Self {
                $body
            }
        }
    };
}

value_from!(<bool> v => Self::Bool(v));
value_from!(<i16> v => Self::Int2(v));
value_from!(<i32> v => Self::Int4(v));
value_from!(<i64> v => Self::Int8(v));
value_from!(<f32> v => Self::Float4(v));
value_from!(<f64> v => Self::Float8(v));
value_from!(<&str> v => Self::Text(ByteStr::copy_from_str(v)));
value_from!(<String> v => Self::Text(v.into()));
value_from!(<Bytes> v => Self::Bytea(v));
value_from!(<::uuid::Uuid> v => Self::Uuid(v));
value_from!(<time::Date> v => Self::Date(v));
value_from!(<time::Time> v => Self::Time(v));
value_from!(<time::PrimitiveDateTime> v => Self::Timestamp(v));
value_from!(<time::OffsetDateTime> v => Self::TimestampTz(v));
value_from!(<Interval> v => Self::Interval(v));
value_from!(<serde_json::Value> v => Self::Json(v));
value_from!(<std::net::IpAddr> v => Self::Inet(v));
value_from!(<url::Url> v => Self::Url(v));
value_from!(<PgArray> v => Self::Array(v));

impl<T> From<Option<T>> for PgValue
where
    T: Into<PgValue> + PgType,
{
    fn from(value: Option<T>) -> Self {
        match value {
            Some(v) => v.into(),
            None => Self::Null(T::OID),
        }
    }
}

impl<T> From<Vec<T>> for PgValue
where
    T: Into<PgValue> + PgType,
{
    fn from(values: Vec<T>) -> Self {
        Self::Array(PgArray::new(
            T::OID,
            values.into_iter().map(Into::into).collect(),
        ))
    }
}

/// An encoded parameter: oid, wire format, and the payload bytes.
///
/// `Null` is distinguishable from an empty payload. Small binary values
/// are stored inline without allocating.
#[derive(Debug, Clone)]
pub struct Encoded {
    oid: Oid,
    format: PgFormat,
    value: EncodedValue,
}

const INLINE_LEN: usize = 16;

#[derive(Clone)]
enum EncodedValue {
    Null,
    Inline { len: u8, buf: [u8; INLINE_LEN] },
    Bytes(Bytes),
}

impl fmt::Debug for EncodedValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use crate::ext::FmtExt;
        match self {
            Self::Null => f.write_str("Null"),
            Self::Inline { len, buf } => write!(f, "{}", buf[..*len as usize].lossy()),
            Self::Bytes(bytes) => write!(f, "{}", bytes.lossy()),
        }
    }
}

impl Encoded {
    /// A NULL parameter of the given declared type.
    pub fn null(oid: Oid) -> Self {
        Self { oid, format: PgFormat::Binary, value: EncodedValue::Null }
    }

    /// A small binary payload, stored inline.
    ///
    /// # Panics
    ///
    /// Panics when `value` exceeds the inline capacity.
    pub fn inline(value: &[u8], oid: Oid) -> Self {
        assert!(value.len() <= INLINE_LEN, "inline value is too large");
        let mut buf = [0u8; INLINE_LEN];
        buf[..value.len()].copy_from_slice(value);
        Self {
            oid,
            format: PgFormat::Binary,
            value: EncodedValue::Inline { len: value.len() as u8, buf },
        }
    }

    /// A binary payload.
    pub fn binary(value: impl Into<Bytes>, oid: Oid) -> Self {
        Self { oid, format: PgFormat::Binary, value: EncodedValue::Bytes(value.into()) }
    }

    /// A text-format payload.
    pub fn text(value: impl Into<Bytes>, oid: Oid) -> Self {
        Self { oid, format: PgFormat::Text, value: EncodedValue::Bytes(value.into()) }
    }

    pub fn oid(&self) -> Oid {
        self.oid
    }

    pub fn format(&self) -> PgFormat {
        self.format
    }

    /// The payload, or [`None`] for NULL.
    pub fn bytes(&self) -> Option<&[u8]> {
        match &self.value {
            EncodedValue::Null => None,
            EncodedValue::Inline { len, buf } => Some(&buf[..*len as usize]),
            EncodedValue::Bytes(bytes) => Some(bytes),
        }
    }
}

/// A value translator registered in a [`CodecRegistry`].
///
/// Decoding receives the registry back so containers (arrays) can
/// delegate element handling.
pub trait Codec: fmt::Debug + Send + Sync {
    /// Whether this codec can decode a wire value of `oid` in `format`.
    fn can_decode(&self, oid: Oid, format: PgFormat) -> bool;

    /// Decode a non-NULL wire value.
    fn decode(
        &self,
        registry: &CodecRegistry,
        raw: &Bytes,
        oid: Oid,
        format: PgFormat,
    ) -> Result<PgValue, DecodeError>;

    /// Whether this codec can encode the host value.
    fn can_encode(&self, value: &PgValue) -> bool;

    /// Encode the host value into a parameter.
    fn encode(&self, registry: &CodecRegistry, value: &PgValue) -> Result<Encoded, EncodeError>;

    /// Encode a NULL parameter of the given type.
    fn encode_null(&self, oid: Oid) -> Encoded {
        Encoded::null(oid)
    }

    /// Host type this codec prefers for a wire type, for column metadata.
    fn preferred_type(&self, oid: Oid, format: PgFormat) -> Option<&'static str>;
}

/// Ordered collection of [`Codec`]s.
#[derive(Debug)]
pub struct CodecRegistry {
    codecs: Vec<Box<dyn Codec>>,
}

impl Default for CodecRegistry {
    fn default() -> Self {
        let mut registry = Self { codecs: Vec::new() };
        registry.register(primitive::BoolCodec);
        registry.register(primitive::IntCodec);
        registry.register(primitive::FloatCodec);
        registry.register(numeric::NumericCodec);
        registry.register(text::TextCodec);
        registry.register(bytea::ByteaCodec);
        registry.register(temporal::TemporalCodec);
        registry.register(uuid::UuidCodec);
        registry.register(json::JsonCodec);
        registry.register(net::NetCodec);
        registry.register(array::ArrayCodec);
        registry
    }
}

impl CodecRegistry {
    /// A registry without any codec registered.
    pub fn empty() -> Self {
        Self { codecs: Vec::new() }
    }

    /// Append a codec; earlier registrations win lookups.
    pub fn register<C: Codec + 'static>(&mut self, codec: C) {
        self.codecs.push(Box::new(codec));
    }

    /// Insert a codec in front of the built-ins.
    pub fn register_front<C: Codec + 'static>(&mut self, codec: C) {
        self.codecs.insert(0, Box::new(codec));
    }

    fn decoder(&self, oid: Oid, format: PgFormat) -> Option<&dyn Codec> {
        self.codecs
            .iter()
            .map(AsRef::as_ref)
            .find(|c| c.can_decode(oid, format))
    }

    /// Decode a wire value; [`None`] raw bytes decode to `Null`.
    pub fn decode(
        &self,
        raw: Option<&Bytes>,
        oid: Oid,
        format: PgFormat,
    ) -> Result<PgValue, DecodeError> {
        let Some(raw) = raw else {
            return Ok(PgValue::Null(oid));
        };
        match self.decoder(oid, format) {
            Some(codec) => codec.decode(self, raw, oid, format),
            None => Err(DecodeError::Unsupported { oid, format }),
        }
    }

    /// Encode a host value into a parameter.
    pub fn encode(&self, value: &PgValue) -> Result<Encoded, EncodeError> {
        if let PgValue::Null(oid) = value {
            let codec = self
                .codecs
                .iter()
                .map(AsRef::as_ref)
                .find(|c| c.can_decode(*oid, PgFormat::Binary) || c.can_decode(*oid, PgFormat::Text));
            return Ok(match codec {
                Some(codec) => codec.encode_null(*oid),
                None => Encoded::null(*oid),
            });
        }
        match self.codecs.iter().find(|c| c.can_encode(value)) {
            Some(codec) => codec.encode(self, value),
            None => Err(EncodeError::Unsupported(value.type_name())),
        }
    }

    /// The host type the first capable codec prefers for `oid`.
    pub fn preferred_type(&self, oid: Oid, format: PgFormat) -> Option<&'static str> {
        self.decoder(oid, format)?.preferred_type(oid, format)
    }
}

/// An error when decoding a wire value.
pub enum DecodeError {
    /// No codec can handle this oid and format.
    Unsupported { oid: Oid, format: PgFormat },
    /// Postgres returned a non UTF-8 string.
    Utf8(Utf8Error),
    /// The value bytes do not match their declared type.
    Malformed(Cow<'static, str>),
    /// Column requested not found.
    ColumnNotFound(Cow<'static, str>),
    /// Typed access requested an incompatible host type.
    TypeMismatch { expected: &'static str, found: &'static str },
}

impl DecodeError {
    pub(crate) fn malformed(reason: impl Into<Cow<'static, str>>) -> Self {
        Self::Malformed(reason.into())
    }
}

impl std::error::Error for DecodeError { }

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("failed to decode value, ")?;
        match self {
            Self::Unsupported { oid, format } => {
                write!(f, "no codec for oid {oid} in {format} format")
            },
            Self::Utf8(e) => write!(f, "{e}"),
            Self::Malformed(reason) => write!(f, "{reason}"),
            Self::ColumnNotFound(name) => write!(f, "column not found: {name}"),
            Self::TypeMismatch { expected, found } => {
                write!(f, "expected {expected}, found {found}")
            },
        }
    }
}

impl fmt::Debug for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{self}\"")
    }
}

impl From<Utf8Error> for DecodeError {
    fn from(e: Utf8Error) -> Self {
        Self::Utf8(e)
    }
}

impl From<std::string::FromUtf8Error> for DecodeError {
    fn from(e: std::string::FromUtf8Error) -> Self {
        Self::Utf8(e.utf8_error())
    }
}

/// An error when encoding a parameter.
#[derive(Debug, thiserror::Error)]
pub enum EncodeError {
    /// No codec accepts this host value.
    #[error("no codec can encode {0}")]
    Unsupported(&'static str),
    /// The value is outside the wire type's range.
    #[error("value out of range for {0}")]
    OutOfRange(&'static str),
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn registration_order_wins() {
        #[derive(Debug)]
        struct Always;

        impl Codec for Always {
            fn can_decode(&self, _: Oid, _: PgFormat) -> bool {
                true
            }

            fn decode(
                &self,
                _: &CodecRegistry,
                _: &Bytes,
                _: Oid,
                _: PgFormat,
            ) -> Result<PgValue, DecodeError> {
                Ok(PgValue::Int4(-1))
            }

            fn can_encode(&self, _: &PgValue) -> bool {
                false
            }

            fn encode(&self, _: &CodecRegistry, _: &PgValue) -> Result<Encoded, EncodeError> {
                unreachable!()
            }

            fn preferred_type(&self, _: Oid, _: PgFormat) -> Option<&'static str> {
                Some("i32")
            }
        }

        let mut registry = CodecRegistry::default();
        registry.register_front(Always);

        let raw = Bytes::copy_from_slice(&7i32.to_be_bytes());
        let value = registry.decode(Some(&raw), oid::INT4, PgFormat::Binary).unwrap();
        assert_eq!(value, PgValue::Int4(-1));
    }

    #[test]
    fn null_round_trips_through_registry() {
        let registry = CodecRegistry::default();
        let value = registry.decode(None, oid::TEXT, PgFormat::Text).unwrap();
        assert_eq!(value, PgValue::Null(oid::TEXT));

        let encoded = registry.encode(&value).unwrap();
        assert_eq!(encoded.bytes(), None);
        assert_eq!(encoded.oid(), oid::TEXT);
    }

    #[test]
    fn unknown_oid_is_unsupported() {
        let registry = CodecRegistry::default();
        let raw = Bytes::from_static(b"x");
        let err = registry.decode(Some(&raw), 999_999, PgFormat::Binary).unwrap_err();
        assert!(matches!(err, DecodeError::Unsupported { .. }));
    }

    #[test]
    fn option_into_value_keeps_the_type_oid() {
        let value: PgValue = Option::<i64>::None.into();
        assert_eq!(value, PgValue::Null(oid::INT8));
        assert_eq!(value.oid(), oid::INT8);
    }
}
