//! `pgstream` error types.
use std::{backtrace::Backtrace, fmt, io};

use crate::{
    codec::{DecodeError, EncodeError},
    connection::{ConfigError, UnsupportedAuth},
    net::TlsError,
    postgres::{ProtocolError, backend::ErrorResponse},
    query::EmptyQueryError,
    row::RowNotFound,
};

/// A specialized [`Result`] type for `pgstream` operation.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// All possible error from the `pgstream` library.
pub struct Error {
    context: String,
    backtrace: Backtrace,
    kind: ErrorKind,
}

impl Error {
    pub fn kind(&self) -> &ErrorKind {
        &self.kind
    }

    pub fn backtrace(&self) -> &Backtrace {
        &self.backtrace
    }

    /// The server error report, when the failure came from an
    /// `ErrorResponse`.
    pub fn database(&self) -> Option<&ErrorResponse> {
        match &self.kind {
            ErrorKind::Database(e) => Some(e),
            _ => None,
        }
    }

    /// Classification of the server error by SQLSTATE, when applicable.
    pub fn database_kind(&self) -> Option<DatabaseErrorKind> {
        self.database()
            .map(|e| DatabaseErrorKind::from_code(e.fields.code()))
    }

    /// Whether retrying the failed operation can succeed, on this or a
    /// fresh connection.
    pub fn is_retryable(&self) -> bool {
        match &self.kind {
            ErrorKind::Io(_) => true,
            ErrorKind::Database(e) => {
                DatabaseErrorKind::from_code(e.fields.code()).is_retryable()
            },
            _ => false,
        }
    }

    pub(crate) fn context(mut self, context: impl Into<String>) -> Self {
        self.context = context.into();
        self
    }

    pub(crate) fn closed() -> Self {
        ErrorKind::Closed.into()
    }
}

/// All possible error kind from the `pgstream` library.
pub enum ErrorKind {
    /// Invalid connection configuration or url.
    Config(ConfigError),
    /// The byte stream violated the wire protocol; the connection is
    /// closed.
    Protocol(ProtocolError),
    Io(io::Error),
    /// TLS negotiation or handshake failure.
    Tls(TlsError),
    /// The server reported an error.
    Database(ErrorResponse),
    /// The server requested an authentication scheme the driver does
    /// not speak.
    UnsupportedAuth(UnsupportedAuth),
    Decode(DecodeError),
    Encode(EncodeError),
    RowNotFound(RowNotFound),
    EmptyQuery(EmptyQueryError),
    /// Operation on a closed connection.
    Closed,
}

/// Classification of a server error by its SQLSTATE class, driving
/// retry decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatabaseErrorKind {
    /// Constraint violation, class 23.
    DataIntegrity,
    /// Syntax error or access-rule violation, class 42.
    BadGrammar,
    /// Serialization failure or deadlock; retry the statement.
    RetryTransient,
    /// Class 40; retry in a new transaction.
    Rollback,
    /// Authentication or authorization failure, class 28.
    Auth,
    /// Anything else; not retryable.
    NonTransient,
}

impl DatabaseErrorKind {
    /// Map a SQLSTATE code to its class.
    pub fn from_code(code: &str) -> Self {
        match code {
            "40001" | "40P01" => Self::RetryTransient,
            _ => match code.get(..2) {
                Some("23") => Self::DataIntegrity,
                Some("42") => Self::BadGrammar,
                Some("40") => Self::Rollback,
                Some("28") => Self::Auth,
                _ => Self::NonTransient,
            },
        }
    }

    pub fn is_retryable(self) -> bool {
        matches!(self, Self::RetryTransient | Self::Rollback)
    }
}

macro_rules! from {
    (<$ty:ty>$pat:pat => $body:expr) => {
        impl From<$ty> for Error {
            fn from($pat: $ty) -> Self {
                let backtrace = Backtrace::capture();
                Self { context: String::new(), backtrace, kind: $body }
            }
        }
    };
}

from!(<ErrorKind>e => e);
from!(<ConfigError>e => ErrorKind::Config(e));
from!(<ProtocolError>e => ErrorKind::Protocol(e));
from!(<io::Error>e => ErrorKind::Io(e));
from!(<TlsError>e => ErrorKind::Tls(e));
from!(<ErrorResponse>e => ErrorKind::Database(e));
from!(<UnsupportedAuth>e => ErrorKind::UnsupportedAuth(e));
from!(<DecodeError>e => ErrorKind::Decode(e));
from!(<EncodeError>e => ErrorKind::Encode(e));
from!(<RowNotFound>e => ErrorKind::RowNotFound(e));
from!(<EmptyQueryError>e => ErrorKind::EmptyQuery(e));

impl std::error::Error for Error { }

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.context.is_empty() {
            write!(f, "{}: ", self.context)?;
        }

        fmt::Display::fmt(&self.kind, f)?;

        if let std::backtrace::BacktraceStatus::Captured = self.backtrace.status() {
            let mut backtrace = self.backtrace.to_string();
            write!(f, "\n\n")?;
            writeln!(f, "Stack backtrace:")?;
            backtrace.truncate(backtrace.trim_end().len());
            write!(f, "{backtrace}")?;
        }

        Ok(())
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{self}\"")
    }
}

impl std::error::Error for ErrorKind { }

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config(e) => e.fmt(f),
            Self::Protocol(e) => e.fmt(f),
            Self::Io(e) => e.fmt(f),
            Self::Tls(e) => e.fmt(f),
            Self::Database(e) => e.fmt(f),
            Self::UnsupportedAuth(e) => e.fmt(f),
            Self::Decode(e) => e.fmt(f),
            Self::Encode(e) => e.fmt(f),
            Self::RowNotFound(e) => e.fmt(f),
            Self::EmptyQuery(e) => e.fmt(f),
            Self::Closed => f.write_str("connection is closed"),
        }
    }
}

impl fmt::Debug for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{self}\"")
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn sqlstate_classification() {
        use DatabaseErrorKind::*;

        assert_eq!(DatabaseErrorKind::from_code("23505"), DataIntegrity);
        assert_eq!(DatabaseErrorKind::from_code("42601"), BadGrammar);
        assert_eq!(DatabaseErrorKind::from_code("40001"), RetryTransient);
        assert_eq!(DatabaseErrorKind::from_code("40P01"), RetryTransient);
        assert_eq!(DatabaseErrorKind::from_code("40000"), Rollback);
        assert_eq!(DatabaseErrorKind::from_code("28P01"), Auth);
        assert_eq!(DatabaseErrorKind::from_code("57014"), NonTransient);
        assert_eq!(DatabaseErrorKind::from_code(""), NonTransient);
    }

    #[test]
    fn retryable_classes() {
        assert!(DatabaseErrorKind::RetryTransient.is_retryable());
        assert!(DatabaseErrorKind::Rollback.is_retryable());
        assert!(!DatabaseErrorKind::DataIntegrity.is_retryable());
        assert!(!DatabaseErrorKind::BadGrammar.is_retryable());
    }
}
