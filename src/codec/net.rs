//! `inet`/`cidr` addresses and URL host values.
//!
//! The binary address form is `family | bits | is_cidr | len | addr`,
//! family being AF_INET (2) for v4 and AF_INET + 1 for v6.
use bytes::{BufMut, Bytes, BytesMut};
use std::net::IpAddr;

use super::{Codec, CodecRegistry, DecodeError, EncodeError, Encoded, PgValue, primitive::text_str};
use crate::postgres::{Oid, PgFormat, oid};

const AF_INET: u8 = 2;
const AF_INET6: u8 = 3;

#[derive(Debug)]
pub struct NetCodec;

impl Codec for NetCodec {
    fn can_decode(&self, oid: Oid, _: PgFormat) -> bool {
        matches!(oid, oid::INET | oid::CIDR)
    }

    fn decode(
        &self,
        _: &CodecRegistry,
        raw: &Bytes,
        _: Oid,
        format: PgFormat,
    ) -> Result<PgValue, DecodeError> {
        let addr = match format {
            PgFormat::Binary => decode_binary(raw)?,
            PgFormat::Text => {
                let text = text_str(raw)?;
                // host addresses may carry an explicit prefix length
                let host = text.split('/').next().unwrap_or(text);
                host.parse()
                    .map_err(|_| DecodeError::malformed(format!("invalid inet {text:?}")))?
            },
        };
        Ok(PgValue::Inet(addr))
    }

    fn can_encode(&self, value: &PgValue) -> bool {
        matches!(value, PgValue::Inet(_) | PgValue::Url(_))
    }

    fn encode(&self, _: &CodecRegistry, value: &PgValue) -> Result<Encoded, EncodeError> {
        match value {
            PgValue::Inet(addr) => {
                let mut buf = BytesMut::with_capacity(20);
                match addr {
                    IpAddr::V4(v4) => {
                        buf.put_u8(AF_INET);
                        buf.put_u8(32);
                        buf.put_u8(0);
                        buf.put_u8(4);
                        buf.put_slice(&v4.octets());
                    },
                    IpAddr::V6(v6) => {
                        buf.put_u8(AF_INET6);
                        buf.put_u8(128);
                        buf.put_u8(0);
                        buf.put_u8(16);
                        buf.put_slice(&v6.octets());
                    },
                }
                Ok(Encoded::binary(buf.freeze(), oid::INET))
            },
            // URLs travel as text values
            PgValue::Url(url) => Ok(Encoded::text(String::from(url.as_str()), oid::TEXT)),
            _ => Err(EncodeError::Unsupported(value.type_name())),
        }
    }

    fn preferred_type(&self, _: Oid, _: PgFormat) -> Option<&'static str> {
        Some("IpAddr")
    }
}

fn decode_binary(raw: &Bytes) -> Result<IpAddr, DecodeError> {
    let malformed = || DecodeError::malformed("invalid inet payload");
    let [family, _bits, _is_cidr, len, addr @ ..] = &raw[..] else {
        return Err(malformed());
    };
    match (*family, *len, addr.len()) {
        (AF_INET, 4, 4) => {
            let octets: [u8; 4] = addr.try_into().unwrap();
            Ok(IpAddr::from(octets))
        },
        (AF_INET6, 16, 16) => {
            let octets: [u8; 16] = addr.try_into().unwrap();
            Ok(IpAddr::from(octets))
        },
        _ => Err(malformed()),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn v4_round_trip() {
        let registry = CodecRegistry::default();
        let addr: IpAddr = "192.168.0.1".parse().unwrap();

        let encoded = registry.encode(&PgValue::Inet(addr)).unwrap();
        let raw = Bytes::copy_from_slice(encoded.bytes().unwrap());
        assert_eq!(
            registry.decode(Some(&raw), oid::INET, PgFormat::Binary).unwrap(),
            PgValue::Inet(addr),
        );
    }

    #[test]
    fn text_with_prefix_length() {
        let registry = CodecRegistry::default();
        let raw = Bytes::from_static(b"10.0.0.0/8");
        assert_eq!(
            registry.decode(Some(&raw), oid::CIDR, PgFormat::Text).unwrap(),
            PgValue::Inet("10.0.0.0".parse().unwrap()),
        );
    }

    #[test]
    fn v6_binary() {
        let registry = CodecRegistry::default();
        let addr: IpAddr = "::1".parse().unwrap();
        let encoded = registry.encode(&PgValue::Inet(addr)).unwrap();
        let raw = Bytes::copy_from_slice(encoded.bytes().unwrap());
        assert_eq!(raw[0], AF_INET6);
        assert_eq!(
            registry.decode(Some(&raw), oid::INET, PgFormat::Binary).unwrap(),
            PgValue::Inet(addr),
        );
    }

    #[test]
    fn url_encodes_as_text() {
        let registry = CodecRegistry::default();
        let url: url::Url = "https://example.com/x".parse().unwrap();
        let encoded = registry.encode(&PgValue::Url(url)).unwrap();
        assert_eq!(encoded.format(), PgFormat::Text);
        assert_eq!(encoded.bytes(), Some(&b"https://example.com/x"[..]));
    }
}
