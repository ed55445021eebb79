//! Messages sent from the backend to the frontend.
use bytes::{Buf, Bytes};
use std::fmt;

use super::{Authentication, BackendProtocol, Oid, PgFormat, ProtocolError, TransactionStatus};
use crate::{common::ByteStr, ext::BytesExt};

macro_rules! check_msgtype {
    ($self:ident, $typ:ident) => {
        if $typ != $self::MSGTYPE {
            return Err(ProtocolError::unexpected(
                std::any::type_name::<$self>(),
                $typ,
            ));
        }
    };
}

macro_rules! unit_message {
    ($(#[$doc:meta])* $name:ident = $tag:literal) => {
        $(#[$doc])*
        #[derive(Debug)]
        pub struct $name;

        impl $name {
            pub const MSGTYPE: u8 = $tag;
        }

        impl BackendProtocol for $name {
            fn decode(msgtype: u8, _: Bytes) -> Result<Self, ProtocolError> {
                check_msgtype!(Self, msgtype);
                Ok(Self)
            }
        }
    };
}

/// All possible backend messages.
///
/// Used where the expected message type depends on the backend, e.g.
/// the row-streaming phases; linear flows receive concrete types instead.
#[derive(Debug)]
pub enum BackendMessage {
    Authentication(Authentication),
    BackendKeyData(BackendKeyData),
    BindComplete(BindComplete),
    CloseComplete(CloseComplete),
    CommandComplete(CommandComplete),
    CopyBothResponse(CopyBothResponse),
    CopyData(CopyData),
    CopyDone(CopyDone),
    CopyInResponse(CopyInResponse),
    CopyOutResponse(CopyOutResponse),
    DataRow(DataRow),
    EmptyQueryResponse(EmptyQueryResponse),
    ErrorResponse(ErrorResponse),
    NoData(NoData),
    NoticeResponse(NoticeResponse),
    NotificationResponse(NotificationResponse),
    ParameterDescription(ParameterDescription),
    ParameterStatus(ParameterStatus),
    ParseComplete(ParseComplete),
    PortalSuspended(PortalSuspended),
    ReadyForQuery(ReadyForQuery),
    RowDescription(RowDescription),
}

macro_rules! dispatch {
    ($msgtype:ident, $body:ident, { $($variant:ident,)* }) => {
        match $msgtype {
            $(
                $variant::MSGTYPE =>
                    Self::$variant(<$variant as BackendProtocol>::decode($msgtype, $body)?),
            )*
            tag => return Err(ProtocolError::unknown_tag(tag)),
        }
    };
}

impl BackendProtocol for BackendMessage {
    fn decode(msgtype: u8, body: Bytes) -> Result<Self, ProtocolError> {
        Ok(dispatch!(msgtype, body, {
            Authentication,
            BackendKeyData,
            BindComplete,
            CloseComplete,
            CommandComplete,
            CopyBothResponse,
            CopyData,
            CopyDone,
            CopyInResponse,
            CopyOutResponse,
            DataRow,
            EmptyQueryResponse,
            ErrorResponse,
            NoData,
            NoticeResponse,
            NotificationResponse,
            ParameterDescription,
            ParameterStatus,
            ParseComplete,
            PortalSuspended,
            ReadyForQuery,
            RowDescription,
        }))
    }
}

impl BackendMessage {
    /// Message name for diagnostics on unexpected frames.
    pub fn name(&self) -> &'static str {
        macro_rules! name {
            ($($variant:ident,)*) => {
                match self { $(Self::$variant(_) => stringify!($variant),)* }
            };
        }
        name! {
            Authentication, BackendKeyData, BindComplete, CloseComplete,
            CommandComplete, CopyBothResponse, CopyData, CopyDone,
            CopyInResponse, CopyOutResponse, DataRow, EmptyQueryResponse,
            ErrorResponse, NoData, NoticeResponse, NotificationResponse,
            ParameterDescription, ParameterStatus, ParseComplete,
            PortalSuspended, ReadyForQuery, RowDescription,
        }
    }

    pub(crate) fn unexpected(&self, when: &str) -> ProtocolError {
        ProtocolError::new(format!("unexpected {} while {when}", self.name()))
    }
}

/// Cancellation key data.
///
/// The frontend must save these values if it wishes to be able to issue
/// `CancelRequest` messages later.
#[derive(Debug, Clone, Copy)]
pub struct BackendKeyData {
    /// The process ID of this backend.
    pub process_id: i32,
    /// The secret key of this backend.
    pub secret_key: i32,
}

impl BackendKeyData {
    pub const MSGTYPE: u8 = b'K';
}

impl BackendProtocol for BackendKeyData {
    fn decode(msgtype: u8, mut body: Bytes) -> Result<Self, ProtocolError> {
        check_msgtype!(Self, msgtype);
        Ok(Self {
            process_id: body.get_i32(),
            secret_key: body.get_i32(),
        })
    }
}

/// A run-time parameter status report.
#[derive(Debug)]
pub struct ParameterStatus {
    /// The name of the run-time parameter being reported.
    pub name: ByteStr,
    /// The current value of the parameter.
    pub value: ByteStr,
}

impl ParameterStatus {
    pub const MSGTYPE: u8 = b'S';
}

impl BackendProtocol for ParameterStatus {
    fn decode(msgtype: u8, mut body: Bytes) -> Result<Self, ProtocolError> {
        check_msgtype!(Self, msgtype);
        Ok(Self {
            name: body.get_nul_bytestr()?,
            value: body.get_nul_bytestr()?,
        })
    }
}

/// The backend is ready for a new query cycle.
///
/// Terminates every exchange; carries the transaction status.
#[derive(Debug)]
pub struct ReadyForQuery {
    pub status: TransactionStatus,
}

impl ReadyForQuery {
    pub const MSGTYPE: u8 = b'Z';
}

impl BackendProtocol for ReadyForQuery {
    fn decode(msgtype: u8, mut body: Bytes) -> Result<Self, ProtocolError> {
        check_msgtype!(Self, msgtype);
        Ok(Self { status: TransactionStatus::from_u8(body.get_u8())? })
    }
}

/// One identified field of an `ErrorResponse` or `NoticeResponse`.
///
/// Field tags are single bytes; unrecognized tags are preserved so the
/// caller can inspect everything the server sent.
///
/// <https://www.postgresql.org/docs/current/protocol-error-fields.html>
#[derive(Debug, Clone)]
pub struct MessageFields {
    fields: Vec<(u8, ByteStr)>,
}

impl MessageFields {
    const SEVERITY: u8 = b'S';
    const CODE: u8 = b'C';
    const MESSAGE: u8 = b'M';
    const DETAIL: u8 = b'D';
    const HINT: u8 = b'H';
    const POSITION: u8 = b'P';

    fn decode(mut body: Bytes) -> Result<Self, ProtocolError> {
        let mut fields = Vec::new();
        loop {
            let tag = body.get_u8();
            if tag == b'\0' {
                break;
            }
            fields.push((tag, body.get_nul_bytestr()?));
        }
        Ok(Self { fields })
    }

    /// Lookup a field by its tag byte.
    pub fn get(&self, tag: u8) -> Option<&str> {
        self.fields
            .iter()
            .find(|(t, _)| *t == tag)
            .map(|(_, v)| v.as_str())
    }

    /// All fields in wire order.
    pub fn iter(&self) -> impl Iterator<Item = (u8, &str)> {
        self.fields.iter().map(|(t, v)| (*t, v.as_str()))
    }

    pub fn severity(&self) -> &str {
        self.get(Self::SEVERITY).unwrap_or_default()
    }

    /// The SQLSTATE code.
    pub fn code(&self) -> &str {
        self.get(Self::CODE).unwrap_or_default()
    }

    pub fn message(&self) -> &str {
        self.get(Self::MESSAGE).unwrap_or_default()
    }

    pub fn detail(&self) -> Option<&str> {
        self.get(Self::DETAIL)
    }

    pub fn hint(&self) -> Option<&str> {
        self.get(Self::HINT)
    }

    /// 1-based character position of the error in the statement.
    pub fn position(&self) -> Option<u32> {
        self.get(Self::POSITION)?.parse().ok()
    }
}

/// An error report from the backend.
#[derive(Debug, Clone)]
pub struct ErrorResponse {
    pub fields: MessageFields,
}

impl ErrorResponse {
    pub const MSGTYPE: u8 = b'E';
}

impl BackendProtocol for ErrorResponse {
    fn decode(msgtype: u8, body: Bytes) -> Result<Self, ProtocolError> {
        check_msgtype!(Self, msgtype);
        Ok(Self { fields: MessageFields::decode(body)? })
    }
}

impl std::error::Error for ErrorResponse { }

impl fmt::Display for ErrorResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {} ({})",
            self.fields.severity(),
            self.fields.message(),
            self.fields.code(),
        )
    }
}

/// A warning report; same body as [`ErrorResponse`], different tag and
/// severity values.
#[derive(Debug)]
pub struct NoticeResponse {
    pub fields: MessageFields,
}

impl NoticeResponse {
    pub const MSGTYPE: u8 = b'N';
}

impl BackendProtocol for NoticeResponse {
    fn decode(msgtype: u8, body: Bytes) -> Result<Self, ProtocolError> {
        check_msgtype!(Self, msgtype);
        Ok(Self { fields: MessageFields::decode(body)? })
    }
}

/// An asynchronous `LISTEN`/`NOTIFY` payload.
#[derive(Debug, Clone)]
pub struct NotificationResponse {
    /// The process ID of the notifying backend.
    pub process_id: i32,
    /// The name of the channel.
    pub channel: ByteStr,
    /// The payload string, possibly empty.
    pub payload: ByteStr,
}

impl NotificationResponse {
    pub const MSGTYPE: u8 = b'A';
}

impl BackendProtocol for NotificationResponse {
    fn decode(msgtype: u8, mut body: Bytes) -> Result<Self, ProtocolError> {
        check_msgtype!(Self, msgtype);
        Ok(Self {
            process_id: body.get_i32(),
            channel: body.get_nul_bytestr()?,
            payload: body.get_nul_bytestr()?,
        })
    }
}

/// One field of a [`RowDescription`].
#[derive(Debug, Clone)]
pub struct FieldDescription {
    /// The field name.
    pub name: ByteStr,
    /// Object ID of the source table, or zero.
    pub table_oid: u32,
    /// Attribute number of the source column, or zero.
    pub column_id: i16,
    /// The object ID of the field's data type.
    pub oid: Oid,
    /// The data type size; negative values denote variable-width types.
    pub type_size: i16,
    /// The type modifier; meaning is type-specific.
    pub type_modifier: i32,
    /// Format the values of this field are transmitted in.
    pub format: PgFormat,
}

/// Description of the fields of the rows about to be returned.
#[derive(Debug)]
pub struct RowDescription {
    pub fields: Vec<FieldDescription>,
}

impl RowDescription {
    pub const MSGTYPE: u8 = b'T';
}

impl BackendProtocol for RowDescription {
    fn decode(msgtype: u8, mut body: Bytes) -> Result<Self, ProtocolError> {
        check_msgtype!(Self, msgtype);
        let len = body.get_u16();
        let mut fields = Vec::with_capacity(len as usize);
        for _ in 0..len {
            fields.push(FieldDescription {
                name: body.get_nul_bytestr()?,
                table_oid: body.get_u32(),
                column_id: body.get_i16(),
                oid: body.get_u32(),
                type_size: body.get_i16(),
                type_modifier: body.get_i32(),
                format: PgFormat::from_code(body.get_i16())?,
            });
        }
        Ok(Self { fields })
    }
}

/// One result row.
///
/// Column values are kept as the raw message body and sliced lazily;
/// `columns` is the declared value count, which must match the current
/// `RowDescription`.
#[derive(Debug, Clone)]
pub struct DataRow {
    pub columns: u16,
    pub body: Bytes,
}

impl DataRow {
    pub const MSGTYPE: u8 = b'D';
}

impl BackendProtocol for DataRow {
    fn decode(msgtype: u8, mut body: Bytes) -> Result<Self, ProtocolError> {
        check_msgtype!(Self, msgtype);
        let columns = body.get_u16();
        Ok(Self { columns, body })
    }
}

/// Command completion report, e.g. `INSERT 0 42`, `SELECT 42`.
#[derive(Debug)]
pub struct CommandComplete {
    /// The command tag.
    pub tag: ByteStr,
}

impl CommandComplete {
    pub const MSGTYPE: u8 = b'C';

    /// Number of rows the completed command affected, parsed from the
    /// tag; zero for commands that do not report a count.
    pub fn rows_affected(&self) -> u64 {
        let mut words = self.tag.split_whitespace();
        let Some(tag) = words.next() else {
            return 0;
        };
        let Some(rows) = words.next() else {
            return 0;
        };
        match tag {
            // INSERT tag is `INSERT oid rows`
            "INSERT" => words.next().unwrap_or_default(),
            "SELECT" => rows,
            "UPDATE" => rows,
            "DELETE" => rows,
            "MERGE" => rows,
            "FETCH" => rows,
            "MOVE" => rows,
            "COPY" => rows,
            _ => return 0,
        }
        .parse()
        .unwrap_or_default()
    }
}

impl BackendProtocol for CommandComplete {
    fn decode(msgtype: u8, mut body: Bytes) -> Result<Self, ProtocolError> {
        check_msgtype!(Self, msgtype);
        Ok(Self { tag: body.get_nul_bytestr()? })
    }
}

/// Parameter types required by a described statement.
#[derive(Debug)]
pub struct ParameterDescription {
    pub types: Vec<Oid>,
}

impl ParameterDescription {
    pub const MSGTYPE: u8 = b't';
}

impl BackendProtocol for ParameterDescription {
    fn decode(msgtype: u8, mut body: Bytes) -> Result<Self, ProtocolError> {
        check_msgtype!(Self, msgtype);
        let len = body.get_u16();
        Ok(Self {
            types: (0..len).map(|_| body.get_u32()).collect(),
        })
    }
}

/// The backend is ready to copy data from the frontend.
#[derive(Debug)]
pub struct CopyInResponse {
    pub format: i8,
    pub column_formats: Vec<i16>,
}

impl CopyInResponse {
    pub const MSGTYPE: u8 = b'G';
}

/// The backend is ready to copy data to the frontend.
#[derive(Debug)]
pub struct CopyOutResponse {
    pub format: i8,
    pub column_formats: Vec<i16>,
}

impl CopyOutResponse {
    pub const MSGTYPE: u8 = b'H';
}

/// Bidirectional copy, used for streaming replication.
#[derive(Debug)]
pub struct CopyBothResponse {
    pub format: i8,
    pub column_formats: Vec<i16>,
}

impl CopyBothResponse {
    pub const MSGTYPE: u8 = b'W';
}

macro_rules! copy_response {
    ($($name:ident),*) => {
        $(
            impl BackendProtocol for $name {
                fn decode(msgtype: u8, mut body: Bytes) -> Result<Self, ProtocolError> {
                    check_msgtype!(Self, msgtype);
                    let format = body.get_i8();
                    let len = body.get_u16();
                    Ok(Self {
                        format,
                        column_formats: (0..len).map(|_| body.get_i16()).collect(),
                    })
                }
            }
        )*
    };
}

copy_response!(CopyInResponse, CopyOutResponse, CopyBothResponse);

/// A chunk of COPY data from the backend.
#[derive(Debug)]
pub struct CopyData {
    pub data: Bytes,
}

impl CopyData {
    pub const MSGTYPE: u8 = b'd';
}

impl BackendProtocol for CopyData {
    fn decode(msgtype: u8, body: Bytes) -> Result<Self, ProtocolError> {
        check_msgtype!(Self, msgtype);
        Ok(Self { data: body })
    }
}

unit_message! {
    /// End of COPY data from the backend.
    CopyDone = b'c'
}

unit_message! {
    /// A `Parse` completed successfully.
    ParseComplete = b'1'
}

unit_message! {
    /// A `Bind` completed successfully.
    BindComplete = b'2'
}

unit_message! {
    /// A `Close` completed successfully.
    CloseComplete = b'3'
}

unit_message! {
    /// The described statement or portal returns no rows.
    NoData = b'n'
}

unit_message! {
    /// The query string was empty.
    EmptyQueryResponse = b'I'
}

unit_message! {
    /// An `Execute` reached its row limit; the portal can be executed
    /// again to fetch more.
    PortalSuspended = b's'
}

#[cfg(test)]
mod test {
    use super::*;

    fn decode<B: BackendProtocol>(tag: u8, body: &[u8]) -> B {
        B::decode(tag, Bytes::copy_from_slice(body)).unwrap()
    }

    #[test]
    fn ready_for_query_status() {
        let m: ReadyForQuery = decode(b'Z', b"I");
        assert_eq!(m.status, TransactionStatus::Idle);
        let m: ReadyForQuery = decode(b'Z', b"T");
        assert_eq!(m.status, TransactionStatus::Open);
        let m: ReadyForQuery = decode(b'Z', b"E");
        assert_eq!(m.status, TransactionStatus::Failed);
        assert!(ReadyForQuery::decode(b'Z', Bytes::from_static(b"X")).is_err());
    }

    #[test]
    fn unknown_tag_is_a_protocol_error() {
        let err = BackendMessage::decode(b'~', Bytes::new()).unwrap_err();
        assert!(err.to_string().contains("unsupported backend message"));
    }

    #[test]
    fn typed_decode_rejects_wrong_tag() {
        assert!(ParseComplete::decode(b'2', Bytes::new()).is_err());
    }

    #[test]
    fn error_response_preserves_all_fields() {
        let m: ErrorResponse = decode(
            b'E',
            b"SERROR\0C23505\0Mduplicate key\0Dalready exists\0Hdrop it\0P12\0\0",
        );
        assert_eq!(m.fields.severity(), "ERROR");
        assert_eq!(m.fields.code(), "23505");
        assert_eq!(m.fields.message(), "duplicate key");
        assert_eq!(m.fields.detail(), Some("already exists"));
        assert_eq!(m.fields.hint(), Some("drop it"));
        assert_eq!(m.fields.position(), Some(12));
        assert_eq!(m.fields.iter().count(), 6);
    }

    #[test]
    fn notification_response_round_trip() {
        let m: NotificationResponse = decode(
            b'A',
            &[&42i32.to_be_bytes()[..], b"c\0hi\0"].concat(),
        );
        assert_eq!(m.process_id, 42);
        assert_eq!(m.channel.as_str(), "c");
        assert_eq!(m.payload.as_str(), "hi");
    }

    #[test]
    fn row_description_fields() {
        let mut body = Vec::new();
        body.extend_from_slice(&1u16.to_be_bytes());
        body.extend_from_slice(b"id\0");
        body.extend_from_slice(&16u32.to_be_bytes()); // table oid
        body.extend_from_slice(&1i16.to_be_bytes()); // column id
        body.extend_from_slice(&23u32.to_be_bytes()); // int4
        body.extend_from_slice(&4i16.to_be_bytes());
        body.extend_from_slice(&(-1i32).to_be_bytes());
        body.extend_from_slice(&1i16.to_be_bytes()); // binary

        let m: RowDescription = decode(b'T', &body);
        assert_eq!(m.fields.len(), 1);
        let f = &m.fields[0];
        assert_eq!(f.name.as_str(), "id");
        assert_eq!(f.oid, 23);
        assert_eq!(f.format, PgFormat::Binary);
    }

    #[test]
    fn command_complete_rows_affected() {
        let rows = |tag: &[u8]| {
            let m: CommandComplete = decode(b'C', &[tag, b"\0"].concat());
            m.rows_affected()
        };
        assert_eq!(rows(b"INSERT 0 42"), 42);
        assert_eq!(rows(b"UPDATE 42"), 42);
        assert_eq!(rows(b"SELECT 42"), 42);
        assert_eq!(rows(b"DELETE 7"), 7);
        assert_eq!(rows(b"CREATE TABLE"), 0);
        assert_eq!(rows(b"BEGIN"), 0);
    }

    #[test]
    fn parameter_description_types() {
        let mut body = Vec::new();
        body.extend_from_slice(&2u16.to_be_bytes());
        body.extend_from_slice(&23u32.to_be_bytes());
        body.extend_from_slice(&25u32.to_be_bytes());
        let m: ParameterDescription = decode(b't', &body);
        assert_eq!(m.types, vec![23, 25]);
    }
}
