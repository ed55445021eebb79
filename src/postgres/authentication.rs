//! The authentication request family, all sharing the `'R'` tag.
use bytes::{Buf, Bytes};

use super::{BackendProtocol, ProtocolError};
use crate::{common::ByteStr, ext::BytesExt};

/// An authentication request from the backend.
///
/// The variant is selected by the first four bytes of the body; several
/// variants carry additional mechanism data.
///
/// <https://www.postgresql.org/docs/current/protocol-flow.html#PROTOCOL-FLOW-START-UP>
#[derive(Debug)]
pub enum Authentication {
    /// Authentication was successful.
    Ok,
    /// Kerberos V5 authentication is required.
    KerberosV5,
    /// A clear-text password is required.
    CleartextPassword,
    /// An MD5-encrypted password is required, using the given salt.
    MD5Password { salt: [u8; 4] },
    /// GSSAPI authentication is required.
    GSS,
    /// GSSAPI or SSPI continuation data.
    GSSContinue { data: Bytes },
    /// SSPI authentication is required.
    SSPI,
    /// SASL authentication is required; the body lists mechanism names
    /// in the server's order of preference.
    SASL { mechanisms: Vec<ByteStr> },
    /// A SASL challenge to be answered with a `SASLResponse`.
    SASLContinue { data: Bytes },
    /// SASL outcome data (the server signature for SCRAM).
    SASLFinal { data: Bytes },
}

impl Authentication {
    pub const MSGTYPE: u8 = b'R';
}

impl BackendProtocol for Authentication {
    fn decode(msgtype: u8, mut body: Bytes) -> Result<Self, ProtocolError> {
        if msgtype != Self::MSGTYPE {
            return Err(ProtocolError::unexpected("Authentication", msgtype));
        }

        let auth = match body.get_i32() {
            0 => Self::Ok,
            2 => Self::KerberosV5,
            3 => Self::CleartextPassword,
            5 => {
                let mut salt = [0u8; 4];
                body.copy_to_slice(&mut salt);
                Self::MD5Password { salt }
            },
            7 => Self::GSS,
            8 => Self::GSSContinue { data: body },
            9 => Self::SSPI,
            10 => {
                let mut mechanisms = Vec::new();
                while body.first().is_some_and(|b| *b != b'\0') {
                    mechanisms.push(body.get_nul_bytestr()?);
                }
                Self::SASL { mechanisms }
            },
            11 => Self::SASLContinue { data: body },
            12 => Self::SASLFinal { data: body },
            code => return Err(ProtocolError::new(format!(
                "unknown authentication method {code}",
            ))),
        };

        Ok(auth)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn decode(body: &[u8]) -> Authentication {
        Authentication::decode(b'R', Bytes::copy_from_slice(body)).unwrap()
    }

    #[test]
    fn md5_salt() {
        let body = [&5i32.to_be_bytes()[..], &[0x1A, 0x2B, 0x3C, 0x4D]].concat();
        let Authentication::MD5Password { salt } = decode(&body) else {
            panic!("expected MD5Password");
        };
        assert_eq!(salt, [0x1A, 0x2B, 0x3C, 0x4D]);
    }

    #[test]
    fn sasl_mechanism_list() {
        let body = [&10i32.to_be_bytes()[..], b"SCRAM-SHA-256-PLUS\0SCRAM-SHA-256\0\0"].concat();
        let Authentication::SASL { mechanisms } = decode(&body) else {
            panic!("expected SASL");
        };
        let names: Vec<&str> = mechanisms.iter().map(|m| m.as_str()).collect();
        assert_eq!(names, ["SCRAM-SHA-256-PLUS", "SCRAM-SHA-256"]);
    }

    #[test]
    fn unknown_method_errors() {
        let body = 99i32.to_be_bytes();
        assert!(Authentication::decode(b'R', Bytes::copy_from_slice(&body)).is_err());
    }
}
