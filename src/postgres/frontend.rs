//! Messages sent from the frontend to the backend.
use bytes::{BufMut, BytesMut};

use super::{FrontendProtocol, Oid, PgFormat};
use crate::{
    codec::Encoded,
    ext::{BufMutExt, UsizeExt},
};

/// The protocol version number: major 3, minor 0.
pub const PROTOCOL_VERSION: i32 = 196608;

/// The SSL negotiation code, chosen to not collide with any protocol
/// version number.
pub const SSL_REQUEST_CODE: i32 = 80877103;

/// The cancel request code.
pub const CANCEL_REQUEST_CODE: i32 = 80877102;

/// The startup message.
///
/// For historical reasons, the very first message sent by the client has
/// no message-type byte, so this does not implement [`FrontendProtocol`].
/// The protocol version is followed by name/value parameter pairs,
/// terminated by an empty name.
#[derive(Debug)]
pub struct Startup<'a> {
    /// The database user name to connect as. Required; there is no default.
    pub user: &'a str,
    /// The database to connect to. Defaults to the user name.
    pub database: Option<&'a str>,
    /// Reported in `pg_stat_activity.application_name`.
    pub application_name: &'a str,
    /// Additional run-time parameters, forwarded verbatim.
    pub options: &'a [(String, String)],
}

impl Startup<'_> {
    pub fn encode(&self, buf: &mut BytesMut) {
        let offset = buf.len();
        buf.put_u32(0);
        buf.put_i32(PROTOCOL_VERSION);

        buf.put_nul_string("user");
        buf.put_nul_string(self.user);

        if let Some(database) = self.database {
            buf.put_nul_string("database");
            buf.put_nul_string(database);
        }

        buf.put_nul_string("application_name");
        buf.put_nul_string(self.application_name);

        buf.put_nul_string("client_encoding");
        buf.put_nul_string("UTF8");

        for (name, value) in self.options {
            buf.put_nul_string(name);
            buf.put_nul_string(value);
        }

        // terminator after the last name/value pair
        buf.put_u8(0);

        let size = (buf.len() - offset).to_u32();
        buf[offset..offset + 4].copy_from_slice(&size.to_be_bytes());
    }
}

/// SSL negotiation request, sent before [`Startup`] when TLS is desired.
///
/// Untagged; always eight bytes.
#[derive(Debug)]
pub struct SslRequest;

impl SslRequest {
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_i32(8);
        buf.put_i32(SSL_REQUEST_CODE);
    }
}

/// Request to cancel a query in progress, sent over its own connection.
///
/// Untagged; always sixteen bytes. No reply is expected, the server just
/// closes the connection.
#[derive(Debug)]
pub struct CancelRequest {
    /// The process ID of the target backend.
    pub process_id: i32,
    /// The secret key for the target backend.
    pub secret_key: i32,
}

impl CancelRequest {
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_i32(16);
        buf.put_i32(CANCEL_REQUEST_CODE);
        buf.put_i32(self.process_id);
        buf.put_i32(self.secret_key);
    }
}

/// A password response, cleartext or MD5-hashed depending on the
/// authentication request.
#[derive(Debug)]
pub struct PasswordMessage<'a> {
    pub password: &'a str,
}

impl FrontendProtocol for PasswordMessage<'_> {
    const MSGTYPE: u8 = b'p';

    fn encode_body(&self, buf: &mut BytesMut) {
        buf.put_nul_string(self.password);
    }
}

/// Initial SASL response, carrying the selected mechanism and the
/// client-first message.
#[derive(Debug)]
pub struct SaslInitialResponse<'a> {
    pub mechanism: &'a str,
    pub response: &'a [u8],
}

impl FrontendProtocol for SaslInitialResponse<'_> {
    // shares the tag with PasswordMessage, disambiguated by context
    const MSGTYPE: u8 = b'p';

    fn encode_body(&self, buf: &mut BytesMut) {
        buf.put_nul_string(self.mechanism);
        buf.put_i32(self.response.len().to_u32() as i32);
        buf.put_slice(self.response);
    }
}

/// SASL challenge response (the client-final message for SCRAM).
#[derive(Debug)]
pub struct SaslResponse<'a> {
    pub data: &'a [u8],
}

impl FrontendProtocol for SaslResponse<'_> {
    const MSGTYPE: u8 = b'p';

    fn encode_body(&self, buf: &mut BytesMut) {
        buf.put_slice(self.data);
    }
}

/// Parse a query string into a prepared statement.
#[derive(Debug)]
pub struct Parse<'a> {
    /// Prepared statement name; an empty string selects the unnamed
    /// prepared statement.
    pub name: &'a str,
    /// The query string to be parsed.
    pub sql: &'a str,
    /// Parameter type oids. Zero leaves a type unspecified.
    pub param_types: &'a [Oid],
}

impl FrontendProtocol for Parse<'_> {
    const MSGTYPE: u8 = b'P';

    fn encode_body(&self, buf: &mut BytesMut) {
        buf.put_nul_string(self.name);
        buf.put_nul_string(self.sql);
        buf.put_u16(self.param_types.len().to_u16());
        for &oid in self.param_types {
            buf.put_u32(oid);
        }
    }
}

/// Bind a prepared statement and parameter values into a portal.
#[derive(Debug)]
pub struct Bind<'a> {
    /// Destination portal; an empty string selects the unnamed portal.
    pub portal: &'a str,
    /// Source prepared statement name.
    pub statement: &'a str,
    /// Parameter values, dense and in order; arity must match the
    /// `Parse` parameter-type vector.
    pub params: &'a [Encoded],
    /// Format requested for all result columns.
    pub result_format: PgFormat,
}

impl FrontendProtocol for Bind<'_> {
    const MSGTYPE: u8 = b'B';

    fn encode_body(&self, buf: &mut BytesMut) {
        buf.put_nul_string(self.portal);
        buf.put_nul_string(self.statement);

        // one format code per parameter
        buf.put_u16(self.params.len().to_u16());
        for param in self.params {
            buf.put_i16(param.format().code());
        }

        buf.put_u16(self.params.len().to_u16());
        for param in self.params {
            match param.bytes() {
                // -1 indicates a NULL parameter value, no bytes follow
                None => buf.put_i32(-1),
                Some(value) => {
                    buf.put_i32(value.len().to_u32() as i32);
                    buf.put_slice(value);
                },
            }
        }

        buf.put_u16(1);
        buf.put_i16(self.result_format.code());
    }
}

/// Request a description of a portal (`'P'`) or statement (`'S'`).
#[derive(Debug)]
pub struct Describe<'a> {
    pub kind: u8,
    pub name: &'a str,
}

impl FrontendProtocol for Describe<'_> {
    const MSGTYPE: u8 = b'D';

    fn encode_body(&self, buf: &mut BytesMut) {
        buf.put_u8(self.kind);
        buf.put_nul_string(self.name);
    }
}

/// Execute a portal.
#[derive(Debug)]
pub struct Execute<'a> {
    pub portal: &'a str,
    /// Maximum number of rows to return; zero denotes no limit.
    pub max_rows: u32,
}

impl FrontendProtocol for Execute<'_> {
    const MSGTYPE: u8 = b'E';

    fn encode_body(&self, buf: &mut BytesMut) {
        buf.put_nul_string(self.portal);
        buf.put_u32(self.max_rows);
    }
}

/// Close a prepared statement (`'S'`) or portal (`'P'`).
#[derive(Debug)]
pub struct Close<'a> {
    pub kind: u8,
    pub name: &'a str,
}

impl FrontendProtocol for Close<'_> {
    const MSGTYPE: u8 = b'C';

    fn encode_body(&self, buf: &mut BytesMut) {
        buf.put_u8(self.kind);
        buf.put_nul_string(self.name);
    }
}

/// Finish an extended-query sequence; the backend answers with
/// `ReadyForQuery` after processing everything up to this point.
#[derive(Debug)]
pub struct Sync;

impl FrontendProtocol for Sync {
    const MSGTYPE: u8 = b'S';

    fn encode_body(&self, _: &mut BytesMut) { }
}

/// Force the backend to deliver pending responses without closing the
/// current sequence.
#[derive(Debug)]
pub struct Flush;

impl FrontendProtocol for Flush {
    const MSGTYPE: u8 = b'H';

    fn encode_body(&self, _: &mut BytesMut) { }
}

/// A simple query, executed directly without a prepared statement.
///
/// May contain multiple statements separated by semicolons.
#[derive(Debug)]
pub struct Query<'a> {
    pub sql: &'a str,
}

impl FrontendProtocol for Query<'_> {
    const MSGTYPE: u8 = b'Q';

    fn encode_body(&self, buf: &mut BytesMut) {
        buf.put_nul_string(self.sql);
    }
}

/// Graceful connection shutdown.
#[derive(Debug)]
pub struct Terminate;

impl FrontendProtocol for Terminate {
    const MSGTYPE: u8 = b'X';

    fn encode_body(&self, _: &mut BytesMut) { }
}

/// A chunk of COPY data.
#[derive(Debug)]
pub struct CopyData<'a> {
    pub data: &'a [u8],
}

impl FrontendProtocol for CopyData<'_> {
    const MSGTYPE: u8 = b'd';

    fn encode_body(&self, buf: &mut BytesMut) {
        buf.put_slice(self.data);
    }
}

/// End of COPY data.
#[derive(Debug)]
pub struct CopyDone;

impl FrontendProtocol for CopyDone {
    const MSGTYPE: u8 = b'c';

    fn encode_body(&self, _: &mut BytesMut) { }
}

/// Abort a COPY-in with an error reported to the issuing statement.
#[derive(Debug)]
pub struct CopyFail<'a> {
    pub message: &'a str,
}

impl FrontendProtocol for CopyFail<'_> {
    const MSGTYPE: u8 = b'f';

    fn encode_body(&self, buf: &mut BytesMut) {
        buf.put_nul_string(self.message);
    }
}

#[cfg(test)]
mod test {
    use bytes::BytesMut;

    use super::*;
    use crate::postgres::write;

    fn encoded<F: FrontendProtocol>(message: F) -> BytesMut {
        let mut buf = BytesMut::new();
        write(&message, &mut buf);
        buf
    }

    #[test]
    fn envelope_length_includes_itself_but_not_the_tag() {
        let buf = encoded(Query { sql: "SELECT 1" });
        let len = u32::from_be_bytes(buf[1..5].try_into().unwrap());
        assert_eq!(len as usize, buf.len() - 1);
        assert_eq!(buf[0], b'Q');
    }

    #[test]
    fn sync_and_flush_are_minimal() {
        assert_eq!(&encoded(Sync)[..], b"S\x00\x00\x00\x04");
        assert_eq!(&encoded(Flush)[..], b"H\x00\x00\x00\x04");
        assert_eq!(&encoded(Terminate)[..], b"X\x00\x00\x00\x04");
    }

    #[test]
    fn parse_wire_form() {
        let buf = encoded(Parse {
            name: "S_0",
            sql: "SELECT $1",
            param_types: &[23],
        });
        let expect = b"P\x00\x00\x00\x18S_0\0SELECT $1\0\x00\x01\x00\x00\x00\x17";
        assert_eq!(&buf[..], &expect[..]);
    }

    #[test]
    fn execute_wire_form() {
        let buf = encoded(Execute { portal: "", max_rows: 0 });
        assert_eq!(&buf[..], b"E\x00\x00\x00\x09\0\x00\x00\x00\x00");
    }

    #[test]
    fn close_statement_wire_form() {
        let buf = encoded(Close { kind: b'S', name: "S_1" });
        assert_eq!(&buf[..], b"C\x00\x00\x00\x09SS_1\0");
    }

    #[test]
    fn cancel_request_is_sixteen_bytes() {
        let mut buf = BytesMut::new();
        CancelRequest { process_id: 1234, secret_key: 5678 }.encode(&mut buf);
        assert_eq!(buf.len(), 16);
        assert_eq!(&buf[..8], b"\x00\x00\x00\x10\x04\xd2\x16\x2e");
        assert_eq!(&buf[8..12], &1234i32.to_be_bytes());
        assert_eq!(&buf[12..], &5678i32.to_be_bytes());
    }

    #[test]
    fn ssl_request_wire_form() {
        let mut buf = BytesMut::new();
        SslRequest.encode(&mut buf);
        assert_eq!(&buf[..], b"\x00\x00\x00\x08\x04\xd2\x16\x2f");
    }

    #[test]
    fn password_and_sasl_frames() {
        let buf = encoded(PasswordMessage { password: "md5abc" });
        assert_eq!(&buf[..], b"p\x00\x00\x00\x0bmd5abc\0");

        let buf = encoded(SaslInitialResponse {
            mechanism: "SCRAM-SHA-256",
            response: b"n,,n=,r=abc",
        });
        assert_eq!(buf[0], b'p');
        assert_eq!(&buf[5..19], b"SCRAM-SHA-256\0");
        assert_eq!(&buf[19..23], &11u32.to_be_bytes());
        assert_eq!(&buf[23..], b"n,,n=,r=abc");

        let buf = encoded(SaslResponse { data: b"c=biws,r=abc,p=xyz" });
        assert_eq!(&buf[5..], b"c=biws,r=abc,p=xyz");
    }

    #[test]
    fn copy_frames() {
        let buf = encoded(CopyData { data: b"1\tfoo\n" });
        assert_eq!(&buf[..], b"d\x00\x00\x00\x0a1\tfoo\n");

        assert_eq!(&encoded(CopyDone)[..], b"c\x00\x00\x00\x04");

        let buf = encoded(CopyFail { message: "gave up" });
        assert_eq!(&buf[..], b"f\x00\x00\x00\x0cgave up\0");
    }

    #[test]
    fn bind_distinguishes_null_from_empty() {
        use crate::{codec::Encoded as Param, postgres::oid};

        let params = [
            Param::null(oid::TEXT),
            Param::text("", oid::TEXT),
            Param::inline(&7i32.to_be_bytes(), oid::INT4),
        ];
        let buf = encoded(Bind {
            portal: "",
            statement: "S_0",
            params: &params,
            result_format: PgFormat::Text,
        });

        // portal, statement
        let mut body = &buf[5..];
        assert_eq!(&body[..5], b"\0S_0\0");
        body = &body[5..];

        // three per-parameter format codes: binary, text, binary
        assert_eq!(&body[..8], &[0, 3, 0, 1, 0, 0, 0, 1]);
        body = &body[8..];

        // values: NULL (-1), empty (0), four bytes
        assert_eq!(&body[..2], &[0, 3]);
        assert_eq!(&body[2..6], &(-1i32).to_be_bytes());
        assert_eq!(&body[6..10], &0u32.to_be_bytes());
        assert_eq!(&body[10..14], &4u32.to_be_bytes());
        assert_eq!(&body[14..18], &7i32.to_be_bytes());

        // single result-format code
        assert_eq!(&body[18..], &[0, 1, 0, 0]);
    }

    #[test]
    fn startup_carries_terminated_parameter_pairs() {
        let mut buf = BytesMut::new();
        Startup {
            user: "alice",
            database: Some("store"),
            application_name: "pgstream",
            options: &[("statement_timeout".into(), "5000".into())],
        }
        .encode(&mut buf);

        let len = u32::from_be_bytes(buf[..4].try_into().unwrap());
        assert_eq!(len as usize, buf.len());
        assert_eq!(&buf[4..8], &PROTOCOL_VERSION.to_be_bytes());
        assert_eq!(buf[buf.len() - 1], 0);

        let body = &buf[8..];
        let mut pairs = body
            .split(|b| *b == 0)
            .map(|s| std::str::from_utf8(s).unwrap());
        assert_eq!(pairs.next(), Some("user"));
        assert_eq!(pairs.next(), Some("alice"));
        assert_eq!(pairs.next(), Some("database"));
        assert_eq!(pairs.next(), Some("store"));
        assert_eq!(pairs.next(), Some("application_name"));
        assert_eq!(pairs.next(), Some("pgstream"));
        assert_eq!(pairs.next(), Some("client_encoding"));
        assert_eq!(pairs.next(), Some("UTF8"));
        assert_eq!(pairs.next(), Some("statement_timeout"));
        assert_eq!(pairs.next(), Some("5000"));
    }
}
