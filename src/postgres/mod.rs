//! PostgreSQL frontend/backend protocol, version 3.0.
//!
//! Message catalogue and framing rules:
//!
//! 1. The first byte of a message identifies the message type.
//! 2. The next four bytes specify the length of the rest of the message
//!    (this length count includes itself, but not the message-type byte).
//!
//! The initial `Startup`, `SSLRequest` and `CancelRequest` messages carry
//! no message-type byte.
//!
//! <https://www.postgresql.org/docs/current/protocol-message-formats.html>
use bytes::BytesMut;
use std::{borrow::Cow, fmt, str::Utf8Error};

use crate::ext::UsizeExt;

pub mod frontend;
pub mod backend;
mod authentication;

pub use authentication::Authentication;
pub use backend::BackendMessage;

/// Postgres object identifier.
///
/// The oid type is implemented as an unsigned four-byte integer.
///
/// <https://www.postgresql.org/docs/current/datatype-oid.html>
pub type Oid = u32;

/// Well known type oids from `pg_type`.
pub mod oid {
    use super::Oid;

    pub const BOOL: Oid = 16;
    pub const BYTEA: Oid = 17;
    pub const CHAR: Oid = 18;
    pub const NAME: Oid = 19;
    pub const INT8: Oid = 20;
    pub const INT2: Oid = 21;
    pub const INT4: Oid = 23;
    pub const TEXT: Oid = 25;
    pub const JSON: Oid = 114;
    pub const FLOAT4: Oid = 700;
    pub const FLOAT8: Oid = 701;
    pub const UNKNOWN: Oid = 705;
    pub const INET: Oid = 869;
    pub const CIDR: Oid = 650;
    pub const BPCHAR: Oid = 1042;
    pub const VARCHAR: Oid = 1043;
    pub const DATE: Oid = 1082;
    pub const TIME: Oid = 1083;
    pub const TIMESTAMP: Oid = 1114;
    pub const TIMESTAMPTZ: Oid = 1184;
    pub const INTERVAL: Oid = 1186;
    pub const NUMERIC: Oid = 1700;
    pub const UUID: Oid = 2950;
    pub const JSONB: Oid = 3802;

    pub const BOOL_ARRAY: Oid = 1000;
    pub const BYTEA_ARRAY: Oid = 1001;
    pub const CHAR_ARRAY: Oid = 1002;
    pub const NAME_ARRAY: Oid = 1003;
    pub const INT2_ARRAY: Oid = 1005;
    pub const INT4_ARRAY: Oid = 1007;
    pub const TEXT_ARRAY: Oid = 1009;
    pub const INT8_ARRAY: Oid = 1016;
    pub const FLOAT4_ARRAY: Oid = 1021;
    pub const FLOAT8_ARRAY: Oid = 1022;
    pub const INET_ARRAY: Oid = 1041;
    pub const BPCHAR_ARRAY: Oid = 1014;
    pub const VARCHAR_ARRAY: Oid = 1015;
    pub const DATE_ARRAY: Oid = 1182;
    pub const TIME_ARRAY: Oid = 1183;
    pub const TIMESTAMP_ARRAY: Oid = 1115;
    pub const TIMESTAMPTZ_ARRAY: Oid = 1185;
    pub const INTERVAL_ARRAY: Oid = 1187;
    pub const JSON_ARRAY: Oid = 199;
    pub const NUMERIC_ARRAY: Oid = 1231;
    pub const UUID_ARRAY: Oid = 2951;
    pub const JSONB_ARRAY: Oid = 3807;
}

/// Wire format of a parameter or result column.
///
/// <https://www.postgresql.org/docs/current/protocol-overview.html#PROTOCOL-FORMAT-CODES>
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PgFormat {
    Text,
    Binary,
}

impl PgFormat {
    pub const fn code(self) -> i16 {
        match self {
            PgFormat::Text => 0,
            PgFormat::Binary => 1,
        }
    }

    pub fn from_code(code: i16) -> Result<Self, ProtocolError> {
        match code {
            0 => Ok(PgFormat::Text),
            1 => Ok(PgFormat::Binary),
            _ => Err(ProtocolError::new(format!("unknown format code {code}"))),
        }
    }
}

/// Backend transaction status, as reported by `ReadyForQuery`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransactionStatus {
    /// Not in a transaction block.
    Idle,
    /// In a transaction block.
    Open,
    /// In a failed transaction block, queries will be rejected until
    /// the block is rolled back.
    Failed,
}

impl TransactionStatus {
    pub(crate) fn from_u8(status: u8) -> Result<Self, ProtocolError> {
        match status {
            b'I' => Ok(Self::Idle),
            b'T' => Ok(Self::Open),
            b'E' => Ok(Self::Failed),
            _ => Err(ProtocolError::new(format!(
                "unknown transaction status {:?}",
                status as char,
            ))),
        }
    }
}

/// A message that can be written to the backend.
///
/// Implementors write their body only; the message-type byte and the
/// length prefix are the envelope writer's concern, see [`write`].
pub trait FrontendProtocol {
    /// The message-type byte.
    const MSGTYPE: u8;

    /// Write the message body into `buf`.
    fn encode_body(&self, buf: &mut BytesMut);
}

/// Write a complete frontend message envelope.
///
/// Writes the message-type byte, reserves four bytes, writes the body,
/// then back-patches the length (which includes itself but not the tag).
pub fn write<F: FrontendProtocol>(message: &F, buf: &mut BytesMut) {
    use bytes::BufMut;

    buf.put_u8(F::MSGTYPE);
    let offset = buf.len();
    buf.put_u32(0);
    message.encode_body(buf);
    let size = (buf.len() - offset).to_u32();
    buf[offset..offset + 4].copy_from_slice(&size.to_be_bytes());
}

/// A type that can be decoded from a backend message.
pub trait BackendProtocol: Sized {
    /// Decode from a message-type byte and the message body.
    ///
    /// The decoder is total: a tag the implementor does not recognize is
    /// a [`ProtocolError`], never a panic.
    fn decode(msgtype: u8, body: bytes::Bytes) -> Result<Self, ProtocolError>;
}

/// An error when translating the byte stream.
///
/// Protocol errors are not recoverable; the connection that produced one
/// is closed.
#[derive(Debug, thiserror::Error)]
#[error("{reason}")]
pub struct ProtocolError {
    reason: Cow<'static, str>,
}

impl ProtocolError {
    pub fn new(reason: impl Into<Cow<'static, str>>) -> Self {
        Self { reason: reason.into() }
    }

    pub(crate) fn unexpected(expected: &str, found: u8) -> Self {
        Self::new(format!(
            "expected {expected}, found message {:?}",
            found as char,
        ))
    }

    pub(crate) fn unknown_tag(tag: u8) -> Self {
        Self::new(format!("unsupported backend message {:?}", tag as char))
    }

    pub(crate) fn missing_nul() -> Self {
        Self::new("postgres string is not nul terminated")
    }
}

impl From<Utf8Error> for ProtocolError {
    fn from(err: Utf8Error) -> Self {
        Self::new(format!("non UTF-8 postgres string: {err}"))
    }
}

impl fmt::Display for PgFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PgFormat::Text => f.write_str("text"),
            PgFormat::Binary => f.write_str("binary"),
        }
    }
}
