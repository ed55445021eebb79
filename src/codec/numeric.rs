//! `numeric`, kept host-side as a decimal string.
//!
//! The binary form is a sequence of base-10000 digits:
//! `ndigits | weight | sign | dscale | digit*`, weight counted in
//! four-decimal-digit groups left of the decimal point.
use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::{Codec, CodecRegistry, DecodeError, EncodeError, Encoded, PgValue, primitive::text_str};
use crate::postgres::{Oid, PgFormat, oid};

const SIGN_POS: u16 = 0x0000;
const SIGN_NEG: u16 = 0x4000;
const SIGN_NAN: u16 = 0xC000;

#[derive(Debug)]
pub struct NumericCodec;

impl Codec for NumericCodec {
    fn can_decode(&self, oid: Oid, _: PgFormat) -> bool {
        oid == oid::NUMERIC
    }

    fn decode(
        &self,
        _: &CodecRegistry,
        raw: &Bytes,
        _: Oid,
        format: PgFormat,
    ) -> Result<PgValue, DecodeError> {
        match format {
            PgFormat::Text => Ok(PgValue::Numeric(text_str(raw)?.to_owned())),
            PgFormat::Binary => decode_binary(raw),
        }
    }

    fn can_encode(&self, value: &PgValue) -> bool {
        matches!(value, PgValue::Numeric(_))
    }

    fn encode(&self, _: &CodecRegistry, value: &PgValue) -> Result<Encoded, EncodeError> {
        let PgValue::Numeric(text) = value else {
            return Err(EncodeError::Unsupported(value.type_name()));
        };
        encode_binary(text)
    }

    fn preferred_type(&self, _: Oid, _: PgFormat) -> Option<&'static str> {
        Some("numeric")
    }
}

fn decode_binary(raw: &Bytes) -> Result<PgValue, DecodeError> {
    let mut buf = &raw[..];
    if buf.len() < 8 {
        return Err(DecodeError::malformed("numeric header truncated"));
    }

    let ndigits = buf.get_u16() as usize;
    let weight = buf.get_i16() as i32;
    let sign = buf.get_u16();
    let dscale = buf.get_u16() as usize;

    if sign == SIGN_NAN {
        return Ok(PgValue::Numeric("NaN".into()));
    }
    if buf.len() != ndigits * 2 {
        return Err(DecodeError::malformed("numeric digit count mismatch"));
    }

    let mut digits = Vec::with_capacity(ndigits);
    for _ in 0..ndigits {
        let d = buf.get_u16();
        if d > 9999 {
            return Err(DecodeError::malformed("numeric digit out of range"));
        }
        digits.push(d);
    }

    let mut out = String::new();
    if sign == SIGN_NEG {
        out.push('-');
    }

    // integer groups: indices 0..=weight
    if weight < 0 {
        out.push('0');
    } else {
        for i in 0..=weight as usize {
            let digit = digits.get(i).copied().unwrap_or(0);
            if i == 0 {
                out.push_str(itoa::Buffer::new().format(digit));
            } else {
                out.push_str(&format!("{digit:04}"));
            }
        }
    }

    if dscale > 0 {
        let mut frac = String::new();
        // fractional groups start right after the integer groups; for
        // weight < -1 there are leading zero groups not stored
        let mut group = weight + 1;
        let mut i = if weight < 0 { 0 } else { weight as usize + 1 };
        while frac.len() < dscale {
            if group < 0 {
                frac.push_str("0000");
            } else {
                let digit = digits.get(i).copied().unwrap_or(0);
                frac.push_str(&format!("{digit:04}"));
                i += 1;
            }
            group += 1;
        }
        frac.truncate(dscale);
        out.push('.');
        out.push_str(&frac);
    }

    Ok(PgValue::Numeric(out))
}

fn encode_binary(text: &str) -> Result<Encoded, EncodeError> {
    let mut buf = BytesMut::with_capacity(16);

    if text == "NaN" {
        buf.put_u16(0);
        buf.put_i16(0);
        buf.put_u16(SIGN_NAN);
        buf.put_u16(0);
        return Ok(Encoded::binary(buf.freeze(), oid::NUMERIC));
    }

    let (sign, unsigned) = match text.strip_prefix('-') {
        Some(rest) => (SIGN_NEG, rest),
        None => (SIGN_POS, text.strip_prefix('+').unwrap_or(text)),
    };

    let (int_part, frac_part) = match unsigned.split_once('.') {
        Some((i, f)) => (i, f),
        None => (unsigned, ""),
    };
    if int_part.is_empty() && frac_part.is_empty() {
        return Err(EncodeError::OutOfRange("numeric"));
    }
    if !int_part.bytes().all(|b| b.is_ascii_digit())
        || !frac_part.bytes().all(|b| b.is_ascii_digit())
    {
        return Err(EncodeError::OutOfRange("numeric"));
    }

    let dscale = frac_part.len();

    // left-pad the integer part and right-pad the fraction to whole
    // base-10000 groups, then strip zero groups at both ends
    let int_pad = (4 - int_part.len() % 4) % 4;
    let mut grouped = String::with_capacity(int_part.len() + frac_part.len() + 6);
    for _ in 0..int_pad {
        grouped.push('0');
    }
    grouped.push_str(int_part);
    let int_groups = grouped.len() / 4;
    grouped.push_str(frac_part);
    while grouped.len() % 4 != 0 {
        grouped.push('0');
    }

    let mut digits: Vec<u16> = grouped
        .as_bytes()
        .chunks(4)
        .map(|c| std::str::from_utf8(c).unwrap().parse().unwrap())
        .collect();

    let mut weight = int_groups as i32 - 1;
    let mut skip = 0;
    while skip < digits.len() && digits[skip] == 0 && skip < int_groups {
        skip += 1;
        weight -= 1;
    }
    digits.drain(..skip);
    while digits.last() == Some(&0) {
        digits.pop();
    }
    if digits.is_empty() {
        weight = 0;
    }

    buf.put_u16(digits.len() as u16);
    buf.put_i16(weight as i16);
    buf.put_u16(sign);
    buf.put_u16(dscale as u16);
    for d in digits {
        buf.put_u16(d);
    }

    Ok(Encoded::binary(buf.freeze(), oid::NUMERIC))
}
