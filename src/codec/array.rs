//! Arrays of the other built-in types.
//!
//! Text form is the brace syntax `{a,b,NULL,"c,d"}`; binary form is
//! `ndim | hasnull | elem_oid | (dim, lbound)* | (len, bytes)*`.
//! Element handling is delegated back to the registry, so any decodable
//! element type is decodable inside an array.
use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::{Codec, CodecRegistry, DecodeError, EncodeError, Encoded, PgValue};
use crate::postgres::{Oid, PgFormat, oid};

/// Dimension count accepted by the server.
const MAX_DIM: usize = 6;

/// An array value: element oid, dimension sizes, and the elements
/// flattened in row-major order.
#[derive(Debug, Clone, PartialEq)]
pub struct PgArray {
    pub element_oid: Oid,
    pub dims: Vec<i32>,
    pub values: Vec<PgValue>,
}

impl PgArray {
    /// A one-dimensional array.
    pub fn new(element_oid: Oid, values: Vec<PgValue>) -> Self {
        Self {
            element_oid,
            dims: vec![values.len() as i32],
            values,
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// The array oid for an element oid, zero (unspecified) when unknown.
pub(super) fn array_oid(element: Oid) -> Oid {
    ELEMENT_ARRAY
        .iter()
        .find(|(e, _)| *e == element)
        .map(|(_, a)| *a)
        .unwrap_or(0)
}

fn element_oid(array: Oid) -> Option<Oid> {
    ELEMENT_ARRAY
        .iter()
        .find(|(_, a)| *a == array)
        .map(|(e, _)| *e)
}

const ELEMENT_ARRAY: &[(Oid, Oid)] = &[
    (oid::BOOL, oid::BOOL_ARRAY),
    (oid::BYTEA, oid::BYTEA_ARRAY),
    (oid::CHAR, oid::CHAR_ARRAY),
    (oid::NAME, oid::NAME_ARRAY),
    (oid::INT2, oid::INT2_ARRAY),
    (oid::INT4, oid::INT4_ARRAY),
    (oid::INT8, oid::INT8_ARRAY),
    (oid::TEXT, oid::TEXT_ARRAY),
    (oid::FLOAT4, oid::FLOAT4_ARRAY),
    (oid::FLOAT8, oid::FLOAT8_ARRAY),
    (oid::BPCHAR, oid::BPCHAR_ARRAY),
    (oid::VARCHAR, oid::VARCHAR_ARRAY),
    (oid::DATE, oid::DATE_ARRAY),
    (oid::TIME, oid::TIME_ARRAY),
    (oid::TIMESTAMP, oid::TIMESTAMP_ARRAY),
    (oid::TIMESTAMPTZ, oid::TIMESTAMPTZ_ARRAY),
    (oid::INTERVAL, oid::INTERVAL_ARRAY),
    (oid::NUMERIC, oid::NUMERIC_ARRAY),
    (oid::UUID, oid::UUID_ARRAY),
    (oid::JSON, oid::JSON_ARRAY),
    (oid::JSONB, oid::JSONB_ARRAY),
    (oid::INET, oid::INET_ARRAY),
];

#[derive(Debug)]
pub struct ArrayCodec;

impl Codec for ArrayCodec {
    fn can_decode(&self, oid: Oid, _: PgFormat) -> bool {
        element_oid(oid).is_some()
    }

    fn decode(
        &self,
        registry: &CodecRegistry,
        raw: &Bytes,
        oid: Oid,
        format: PgFormat,
    ) -> Result<PgValue, DecodeError> {
        let element = element_oid(oid)
            .ok_or(DecodeError::Unsupported { oid, format })?;
        match format {
            PgFormat::Binary => decode_binary(registry, raw),
            PgFormat::Text => decode_text(registry, raw, element),
        }
    }

    fn can_encode(&self, value: &PgValue) -> bool {
        matches!(value, PgValue::Array(_))
    }

    fn encode(&self, registry: &CodecRegistry, value: &PgValue) -> Result<Encoded, EncodeError> {
        let PgValue::Array(array) = value else {
            return Err(EncodeError::Unsupported(value.type_name()));
        };

        let count: i64 = array.dims.iter().map(|d| *d as i64).product();
        if array.dims.len() > MAX_DIM || count != array.values.len() as i64 {
            return Err(EncodeError::OutOfRange("array dimensions"));
        }

        let mut buf = BytesMut::new();
        buf.put_i32(array.dims.len() as i32);
        buf.put_i32(array.values.iter().any(PgValue::is_null) as i32);
        buf.put_u32(array.element_oid);
        for dim in &array.dims {
            buf.put_i32(*dim);
            buf.put_i32(1); // lower bound
        }
        for value in &array.values {
            if value.is_null() {
                buf.put_i32(-1);
                continue;
            }
            let encoded = registry.encode(value)?;
            let bytes = encoded.bytes().unwrap_or_default();
            buf.put_i32(bytes.len() as i32);
            buf.put_slice(bytes);
        }

        Ok(Encoded::binary(buf.freeze(), array_oid(array.element_oid)))
    }

    fn preferred_type(&self, _: Oid, _: PgFormat) -> Option<&'static str> {
        Some("PgArray")
    }
}

fn decode_binary(registry: &CodecRegistry, raw: &Bytes) -> Result<PgValue, DecodeError> {
    let mut buf = &raw[..];
    if buf.len() < 12 {
        return Err(DecodeError::malformed("array header truncated"));
    }

    let ndim = buf.get_i32();
    let _has_null = buf.get_i32();
    let element = buf.get_u32();

    if !(0..=MAX_DIM as i32).contains(&ndim) {
        return Err(DecodeError::malformed(format!("array dimensions {ndim} out of range")));
    }

    let mut dims = Vec::with_capacity(ndim as usize);
    let mut count: i64 = 1;
    for _ in 0..ndim {
        if buf.len() < 8 {
            return Err(DecodeError::malformed("array dimension truncated"));
        }
        let dim = buf.get_i32();
        let _lower_bound = buf.get_i32();
        if dim < 0 {
            return Err(DecodeError::malformed("negative array dimension"));
        }
        dims.push(dim);
        count *= dim as i64;
    }
    if ndim == 0 {
        count = 0;
    }

    let mut values = Vec::with_capacity(count as usize);
    let base = raw.len() - buf.len();
    let mut offset = 0usize;
    for _ in 0..count {
        if buf.len() < 4 {
            return Err(DecodeError::malformed("array element truncated"));
        }
        let len = buf.get_i32();
        offset += 4;
        if len == -1 {
            values.push(PgValue::Null(element));
            continue;
        }
        let len = len as usize;
        if buf.len() < len {
            return Err(DecodeError::malformed("array element truncated"));
        }
        let bytes = raw.slice(base + offset..base + offset + len);
        buf.advance(len);
        offset += len;
        values.push(registry.decode(Some(&bytes), element, PgFormat::Binary)?);
    }

    Ok(PgValue::Array(PgArray { element_oid: element, dims, values }))
}

fn decode_text(registry: &CodecRegistry, raw: &Bytes, element: Oid) -> Result<PgValue, DecodeError> {
    let text = std::str::from_utf8(raw)?;
    let mut parser = TextParser { rest: text.trim(), element, registry };

    let (dims, values) = parser.array(0)?;
    if !parser.rest.is_empty() {
        return Err(parser.malformed());
    }

    Ok(PgValue::Array(PgArray { element_oid: element, dims, values }))
}

struct TextParser<'a> {
    rest: &'a str,
    element: Oid,
    registry: &'a CodecRegistry,
}

impl TextParser<'_> {
    fn malformed(&self) -> DecodeError {
        DecodeError::malformed("invalid array text form")
    }

    fn eat(&mut self, prefix: char) -> Result<(), DecodeError> {
        match self.rest.strip_prefix(prefix) {
            Some(rest) => {
                self.rest = rest;
                Ok(())
            },
            None => Err(self.malformed()),
        }
    }

    /// Parse one `{...}` level; returns dimensions (outermost first)
    /// and flattened values.
    fn array(&mut self, depth: usize) -> Result<(Vec<i32>, Vec<PgValue>), DecodeError> {
        if depth >= MAX_DIM {
            return Err(DecodeError::malformed("array nesting too deep"));
        }
        self.eat('{')?;

        let mut values = Vec::new();
        let mut inner_dims: Option<Vec<i32>> = None;
        let mut len = 0i32;

        if self.rest.starts_with('}') {
            self.eat('}')?;
            return Ok((vec![0], values));
        }

        loop {
            if self.rest.starts_with('{') {
                let (dims, inner) = self.array(depth + 1)?;
                match &inner_dims {
                    None => inner_dims = Some(dims),
                    // sub-arrays must be rectangular
                    Some(prev) if *prev != dims => return Err(self.malformed()),
                    Some(_) => { },
                }
                values.extend(inner);
            } else {
                values.push(self.element_value()?);
            }
            len += 1;

            match self.rest.chars().next() {
                Some(',') => self.eat(',')?,
                Some('}') => {
                    self.eat('}')?;
                    break;
                },
                _ => return Err(self.malformed()),
            }
        }

        let mut dims = vec![len];
        dims.extend(inner_dims.unwrap_or_default());
        Ok((dims, values))
    }

    fn element_value(&mut self) -> Result<PgValue, DecodeError> {
        if self.rest.starts_with('"') {
            let text = self.quoted()?;
            let raw = Bytes::from(text.into_bytes());
            return self.registry.decode(Some(&raw), self.element, PgFormat::Text);
        }

        let end = self
            .rest
            .find([',', '}'])
            .ok_or_else(|| self.malformed())?;
        let token = &self.rest[..end];
        self.rest = &self.rest[end..];

        if token.eq_ignore_ascii_case("null") {
            return Ok(PgValue::Null(self.element));
        }
        let raw = Bytes::copy_from_slice(token.as_bytes());
        self.registry.decode(Some(&raw), self.element, PgFormat::Text)
    }

    fn quoted(&mut self) -> Result<String, DecodeError> {
        self.eat('"')?;
        let mut out = String::new();
        let mut chars = self.rest.char_indices();
        while let Some((i, c)) = chars.next() {
            match c {
                '\\' => match chars.next() {
                    Some((_, escaped)) => out.push(escaped),
                    None => return Err(self.malformed()),
                },
                '"' => {
                    self.rest = &self.rest[i + 1..];
                    return Ok(out);
                },
                c => out.push(c),
            }
        }
        Err(self.malformed())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn decode(raw: &[u8], oid: Oid, format: PgFormat) -> PgArray {
        let value = CodecRegistry::default()
            .decode(Some(&Bytes::copy_from_slice(raw)), oid, format)
            .unwrap();
        let PgValue::Array(array) = value else { panic!() };
        array
    }

    #[test]
    fn int8_array_binary_form() {
        // [100, 200] :: bigint[]
        let raw: &[u8] = &[
            0x00, 0x00, 0x00, 0x01, // ndim
            0x00, 0x00, 0x00, 0x00, // hasnull
            0x00, 0x00, 0x00, 0x14, // int8
            0x00, 0x00, 0x00, 0x02, // dim 0 size
            0x00, 0x00, 0x00, 0x02, // dim 0 lower bound
            0x00, 0x00, 0x00, 0x08, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x64,
            0x00, 0x00, 0x00, 0x08, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0xC8,
        ];
        let array = decode(raw, oid::INT8_ARRAY, PgFormat::Binary);
        assert_eq!(array.element_oid, oid::INT8);
        assert_eq!(array.dims, [2]);
        assert_eq!(array.values, [PgValue::Int8(100), PgValue::Int8(200)]);
    }

    #[test]
    fn int8_array_text_form_decodes_identically() {
        let binary = decode(
            &{
                let registry = CodecRegistry::default();
                let value: PgValue = vec![100i64, 200].into();
                let encoded = registry.encode(&value).unwrap();
                encoded.bytes().unwrap().to_vec()
            },
            oid::INT8_ARRAY,
            PgFormat::Binary,
        );
        let text = decode(b"{100,200}", oid::INT8_ARRAY, PgFormat::Text);
        assert_eq!(binary.values, text.values);
        assert_eq!(binary.dims, text.dims);
    }

    #[test]
    fn text_form_quoting_null_and_commas() {
        let array = decode(b"{a,b,NULL,\"c,d\",\"q\\\"t\"}", oid::TEXT_ARRAY, PgFormat::Text);
        let expect = [
            PgValue::Text("a".into()),
            PgValue::Text("b".into()),
            PgValue::Null(oid::TEXT),
            PgValue::Text("c,d".into()),
            PgValue::Text("q\"t".into()),
        ];
        assert_eq!(array.values, expect);
    }

    #[test]
    fn multidimensional_text() {
        let array = decode(b"{{1,2,3},{4,5,6}}", oid::INT4_ARRAY, PgFormat::Text);
        assert_eq!(array.dims, [2, 3]);
        assert_eq!(array.values.len(), 6);
        assert_eq!(array.values[4], PgValue::Int4(5));
    }

    #[test]
    fn ragged_text_is_rejected() {
        let raw = Bytes::from_static(b"{{1,2},{3}}");
        assert!(
            CodecRegistry::default()
                .decode(Some(&raw), oid::INT4_ARRAY, PgFormat::Text)
                .is_err()
        );
    }

    #[test]
    fn empty_array() {
        let array = decode(b"{}", oid::INT4_ARRAY, PgFormat::Text);
        assert!(array.is_empty());
    }

    #[test]
    fn null_elements_round_trip_in_binary() {
        let registry = CodecRegistry::default();
        let array = PgArray::new(
            oid::INT4,
            vec![PgValue::Int4(1), PgValue::Null(oid::INT4), PgValue::Int4(3)],
        );
        let encoded = registry.encode(&PgValue::Array(array.clone())).unwrap();
        assert_eq!(encoded.oid(), oid::INT4_ARRAY);

        let decoded = decode(encoded.bytes().unwrap(), oid::INT4_ARRAY, PgFormat::Binary);
        assert_eq!(decoded.values, array.values);
    }

    #[test]
    fn dimension_count_is_bounded() {
        let mut raw = BytesMut::new();
        raw.put_i32(7);
        raw.put_i32(0);
        raw.put_u32(oid::INT4);
        assert!(
            CodecRegistry::default()
                .decode(Some(&raw.freeze()), oid::INT4_ARRAY, PgFormat::Binary)
                .is_err()
        );
    }
}
