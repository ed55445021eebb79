//! The extended-query state machine:
//! `Parse?` `Bind` `Describe` `Execute` `Close` `Sync`, consumed as a
//! demand-driven row stream.
use futures_core::Stream;
use std::{
    pin::Pin,
    sync::Arc,
    task::{Context, Poll, ready},
};

use super::{EmptyQueryError, QueryResult};
use crate::{
    Error, Result,
    cache::{CacheKey, StatementPlan},
    codec::{CodecRegistry, Encoded, PgValue},
    common::ByteStr,
    error::ErrorKind,
    postgres::{
        Oid,
        backend::{self, BackendMessage, CommandComplete, FieldDescription},
        frontend,
    },
    row::{FromValue, Row, RowNotFound},
    sql::Sql,
    statement::{PortalName, StatementName},
    transport::PgTransport,
};

/// Lazy stream of rows produced by one extended-query exchange.
///
/// Rows are decoded only when the consumer pulls; no pull, no socket
/// read. Frames already written are never withdrawn: dropping the
/// stream mid-exchange flags the transport, and the outstanding window
/// is discarded through its `ReadyForQuery` before the next exchange
/// reads a reply.
#[derive(Debug)]
#[must_use = "streams do nothing unless polled"]
pub struct FetchStream<SQL, ExeFut, IO: PgTransport> {
    sql: SQL,
    io: Option<IO>,
    phase: Phase<ExeFut>,
    params: Vec<PgValue>,
    encoded: Vec<Encoded>,
    param_oids: Vec<Oid>,
    registry: Option<Arc<CodecRegistry>>,
    key: Option<CacheKey>,
    statement: Option<StatementName>,
    fields: Option<Arc<[FieldDescription]>>,
    max_rows: u32,
    cmd: Option<CommandComplete>,
    suspended: bool,
    empty: bool,
}

#[derive(Debug)]
enum Phase<ExeFut> {
    Connect { f: ExeFut },
    Prepare,
    CloseEvicted,
    ParseComplete,
    BindComplete,
    Description,
    Rows,
    ClosePortal,
    ReadyForQuery,
    /// A server error arrived mid-window; everything up to
    /// `ReadyForQuery` is discarded, then the error terminates the
    /// stream.
    Drain { error: Option<Error> },
    Complete,
}

impl<SQL, ExeFut, IO: PgTransport> FetchStream<SQL, ExeFut, IO> {
    pub(crate) fn new(sql: SQL, exe: ExeFut, params: Vec<PgValue>, max_rows: u32) -> Self {
        Self {
            sql,
            io: None,
            phase: Phase::Connect { f: exe },
            params,
            encoded: Vec::new(),
            param_oids: Vec::new(),
            registry: None,
            key: None,
            statement: None,
            fields: None,
            max_rows,
            cmd: None,
            suspended: false,
            empty: false,
        }
    }

    /// The command completion of the finished stream, when any.
    pub(crate) fn command(&mut self) -> Option<CommandComplete> {
        self.cmd.take()
    }

    pub(crate) fn was_empty_query(&self) -> bool {
        self.empty
    }

    /// Whether the configured fetch size cut the result short; the
    /// portal reported suspension before completing.
    pub fn suspended(&self) -> bool {
        self.suspended
    }
}

impl<SQL, ExeFut, IO: PgTransport> Drop for FetchStream<SQL, ExeFut, IO> {
    fn drop(&mut self) {
        let Some(io) = self.io.as_mut() else { return };
        match self.phase {
            // nothing on the wire yet, or the window is fully consumed
            Phase::Connect { .. } | Phase::Prepare | Phase::Complete => { },
            // the parse round was flushed without a Sync; send one so
            // the window has a ReadyForQuery to be discarded through
            Phase::CloseEvicted | Phase::ParseComplete => {
                io.send(frontend::Sync);
                io.ready_request();
            },
            // Sync is already on the wire; the reply sequence up to
            // ReadyForQuery is abandoned in flight
            _ => io.ready_request(),
        }
    }
}

/// Whether an executor error is a server report (the window still runs
/// to `ReadyForQuery`) or a channel failure (nothing more is coming).
fn is_database_error(error: &Error) -> bool {
    matches!(error.kind(), ErrorKind::Database(_))
}

impl<SQL, ExeFut, IO> FetchStream<SQL, ExeFut, IO>
where
    SQL: Sql + Unpin,
    ExeFut: Future<Output = Result<IO>> + Unpin,
    IO: PgTransport,
{
    fn send_parse(&mut self) {
        let io = self.io.as_mut().unwrap();
        let name = self.statement.as_ref().unwrap();
        io.send(frontend::Parse {
            name: name.as_str(),
            sql: self.sql.sql().trim(),
            param_types: &self.param_oids,
        });
        io.send(frontend::Flush);
    }

    /// `Bind` `Describe` `Execute` `Close` `Sync`, pipelined in one
    /// flush.
    fn send_portal(&mut self) {
        let io = self.io.as_mut().unwrap();
        let statement = self.statement.as_ref().unwrap();
        let portal = PortalName::next();
        let result_format = io.result_format();

        io.send(frontend::Bind {
            portal: portal.as_str(),
            statement: statement.as_str(),
            params: &self.encoded,
            result_format,
        });
        io.send(frontend::Describe { kind: b'P', name: portal.as_str() });
        io.send(frontend::Execute { portal: portal.as_str(), max_rows: self.max_rows });
        io.send(frontend::Close { kind: b'P', name: portal.as_str() });
        io.send(frontend::Sync);
    }

}

macro_rules! fail {
    ($me:ident, $err:expr) => {{
        $me.phase = Phase::Complete;
        return Poll::Ready(Some(Err($err)));
    }};
}

/// A server report mid-window: discard to `ReadyForQuery`, then fail
/// the stream with it. Any other error means the channel is gone.
macro_rules! exchange_err {
    ($me:ident, $err:ident) => {{
        if is_database_error(&$err) {
            $me.phase = Phase::Drain { error: Some($err) };
        } else {
            fail!($me, $err);
        }
    }};
}

/// Same, from a phase before `Sync` was sent: the caller owes the
/// server a `Sync` to bring the window to `ReadyForQuery`.
macro_rules! parse_err {
    ($me:ident, $err:ident) => {{
        if is_database_error(&$err) {
            $me.io.as_mut().unwrap().send(frontend::Sync);
            $me.phase = Phase::Drain { error: Some($err) };
        } else {
            fail!($me, $err);
        }
    }};
}

impl<SQL, ExeFut, IO> Stream for FetchStream<SQL, ExeFut, IO>
where
    SQL: Sql + Unpin,
    ExeFut: Future<Output = Result<IO>> + Unpin,
    IO: PgTransport,
{
    type Item = Result<Row>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let me = self.get_mut();

        loop {
            match &mut me.phase {
                Phase::Connect { f } => {
                    match ready!(Pin::new(f).poll(cx)) {
                        Ok(io) => {
                            me.io = Some(io);
                            me.phase = Phase::Prepare;
                        },
                        Err(err) => fail!(me, err),
                    }
                },
                Phase::Prepare => {
                    let io = me.io.as_mut().unwrap();
                    let registry = io.registry().clone();

                    let mut encoded = Vec::with_capacity(me.params.len());
                    for value in &me.params {
                        match registry.encode(value) {
                            Ok(e) => encoded.push(e),
                            Err(err) => fail!(me, err.into()),
                        }
                    }
                    me.param_oids = encoded.iter().map(Encoded::oid).collect();
                    me.encoded = encoded;
                    me.registry = Some(registry);

                    let plan = match me.sql.persistent() {
                        true => {
                            let key = CacheKey::new(
                                ByteStr::copy_from_str(me.sql.sql().trim()),
                                me.param_oids.clone(),
                            );
                            let plan = io.statement_plan(&key);
                            me.key = Some(key);
                            plan
                        },
                        false => StatementPlan::Parse {
                            name: StatementName::unnamed(),
                            evict: None,
                        },
                    };

                    match plan {
                        StatementPlan::CacheHit(name) => {
                            me.key = None;
                            me.statement = Some(name);
                            me.send_portal();
                            me.phase = Phase::BindComplete;
                        },
                        StatementPlan::Parse { name, evict: Some(evicted) } => {
                            let io = me.io.as_mut().unwrap();
                            io.send(frontend::Close { kind: b'S', name: evicted.as_str() });
                            io.send(frontend::Flush);
                            me.statement = Some(name);
                            me.phase = Phase::CloseEvicted;
                        },
                        StatementPlan::Parse { name, evict: None } => {
                            me.statement = Some(name);
                            me.send_parse();
                            me.phase = Phase::ParseComplete;
                        },
                    }
                },
                Phase::CloseEvicted => {
                    let io = me.io.as_mut().unwrap();
                    match ready!(io.poll_recv::<backend::CloseComplete>(cx)) {
                        Ok(_) => {
                            me.send_parse();
                            me.phase = Phase::ParseComplete;
                        },
                        Err(err) => parse_err!(me, err),
                    }
                },
                Phase::ParseComplete => {
                    let io = me.io.as_mut().unwrap();
                    match ready!(io.poll_recv::<backend::ParseComplete>(cx)) {
                        Ok(_) => {
                            if let Some(key) = me.key.take() {
                                let name = me.statement.clone().unwrap();
                                me.io.as_mut().unwrap().statement_parsed(key, name);
                            }
                            me.send_portal();
                            me.phase = Phase::BindComplete;
                        },
                        Err(err) => parse_err!(me, err),
                    }
                },
                Phase::BindComplete => {
                    let io = me.io.as_mut().unwrap();
                    match ready!(io.poll_recv::<backend::BindComplete>(cx)) {
                        Ok(_) => me.phase = Phase::Description,
                        Err(err) => exchange_err!(me, err),
                    }
                },
                Phase::Description => {
                    let io = me.io.as_mut().unwrap();
                    match ready!(io.poll_recv::<BackendMessage>(cx)) {
                        Ok(BackendMessage::RowDescription(rd)) => {
                            me.fields = Some(rd.fields.into());
                            me.phase = Phase::Rows;
                        },
                        Ok(BackendMessage::NoData(_)) => {
                            me.fields = None;
                            me.phase = Phase::Rows;
                        },
                        Ok(other) => {
                            let err = other.unexpected("describing portal");
                            me.io.as_mut().unwrap().ready_request();
                            fail!(me, err.into());
                        },
                        Err(err) => exchange_err!(me, err),
                    }
                },
                Phase::Rows => {
                    let io = me.io.as_mut().unwrap();
                    match ready!(io.poll_recv::<BackendMessage>(cx)) {
                        Ok(BackendMessage::DataRow(dr)) => {
                            let Some(fields) = &me.fields else {
                                let err = crate::postgres::ProtocolError::new(
                                    "DataRow without a row description",
                                );
                                me.io.as_mut().unwrap().ready_request();
                                fail!(me, err.into());
                            };
                            let row = Row::new(
                                fields.clone(),
                                me.registry.clone().unwrap(),
                                dr,
                            );
                            match row {
                                Ok(row) => return Poll::Ready(Some(Ok(row))),
                                Err(err) => {
                                    // a mangled row leaves the window
                                    // unread, let the transport realign
                                    me.io.as_mut().unwrap().ready_request();
                                    fail!(me, err.into());
                                },
                            }
                        },
                        Ok(BackendMessage::CommandComplete(cmd)) => {
                            me.cmd = Some(cmd);
                            me.phase = Phase::ClosePortal;
                        },
                        Ok(BackendMessage::PortalSuspended(_)) => {
                            me.suspended = true;
                            me.phase = Phase::ClosePortal;
                        },
                        Ok(BackendMessage::EmptyQueryResponse(_)) => {
                            me.empty = true;
                            me.phase = Phase::ClosePortal;
                        },
                        Ok(other) => {
                            let err = other.unexpected("fetching rows");
                            me.io.as_mut().unwrap().ready_request();
                            fail!(me, err.into());
                        },
                        Err(err) => exchange_err!(me, err),
                    }
                },
                Phase::ClosePortal => {
                    let io = me.io.as_mut().unwrap();
                    match ready!(io.poll_recv::<backend::CloseComplete>(cx)) {
                        Ok(_) => me.phase = Phase::ReadyForQuery,
                        Err(err) => exchange_err!(me, err),
                    }
                },
                Phase::ReadyForQuery => {
                    let io = me.io.as_mut().unwrap();
                    match ready!(io.poll_recv::<backend::ReadyForQuery>(cx)) {
                        Ok(_) => me.phase = Phase::Complete,
                        Err(err) => exchange_err!(me, err),
                    }
                },
                Phase::Drain { error } => {
                    let io = me.io.as_mut().unwrap();
                    match ready!(io.poll_recv::<BackendMessage>(cx)) {
                        Ok(BackendMessage::ReadyForQuery(_)) => {
                            let error = error.take();
                            me.phase = Phase::Complete;
                            match error {
                                Some(err) => return Poll::Ready(Some(Err(err))),
                                None => return Poll::Ready(None),
                            }
                        },
                        Ok(_) => { },
                        Err(err) => fail!(me, err),
                    }
                },
                Phase::Complete => return Poll::Ready(None),
            }
        }
    }
}

macro_rules! collector {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug)]
        #[must_use = "futures do nothing unless you `.await` or poll them"]
        pub struct $name<SQL, ExeFut, IO: PgTransport> {
            fetch: FetchStream<SQL, ExeFut, IO>,
            rows: Vec<Row>,
        }

        impl<SQL, ExeFut, IO: PgTransport> $name<SQL, ExeFut, IO> {
            pub(crate) fn new(fetch: FetchStream<SQL, ExeFut, IO>) -> Self {
                Self { fetch, rows: Vec::new() }
            }
        }
    };
}

collector! {
    /// Buffer every row of the stream.
    FetchAll
}

impl<SQL, ExeFut, IO> Future for FetchAll<SQL, ExeFut, IO>
where
    SQL: Sql + Unpin,
    ExeFut: Future<Output = Result<IO>> + Unpin,
    IO: PgTransport,
{
    type Output = Result<Vec<Row>>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context) -> Poll<Self::Output> {
        let me = self.get_mut();

        while let Some(row) = ready!(Pin::new(&mut me.fetch).poll_next(cx)?) {
            me.rows.push(row);
        }

        Poll::Ready(Ok(std::mem::take(&mut me.rows)))
    }
}

collector! {
    /// Exactly one row; fails with [`RowNotFound`] otherwise.
    FetchOne
}

impl<SQL, ExeFut, IO> Future for FetchOne<SQL, ExeFut, IO>
where
    SQL: Sql + Unpin,
    ExeFut: Future<Output = Result<IO>> + Unpin,
    IO: PgTransport,
{
    type Output = Result<Row>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context) -> Poll<Self::Output> {
        let me = self.get_mut();

        while let Some(row) = ready!(Pin::new(&mut me.fetch).poll_next(cx)?) {
            me.rows.push(row);
        }

        match me.rows.pop() {
            Some(row) => Poll::Ready(Ok(row)),
            None => Poll::Ready(Err(RowNotFound.into())),
        }
    }
}

collector! {
    /// At most one row.
    FetchOptional
}

impl<SQL, ExeFut, IO> Future for FetchOptional<SQL, ExeFut, IO>
where
    SQL: Sql + Unpin,
    ExeFut: Future<Output = Result<IO>> + Unpin,
    IO: PgTransport,
{
    type Output = Result<Option<Row>>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context) -> Poll<Self::Output> {
        let me = self.get_mut();

        while let Some(row) = ready!(Pin::new(&mut me.fetch).poll_next(cx)?) {
            me.rows.push(row);
        }

        Poll::Ready(Ok(me.rows.pop()))
    }
}

/// The first column of the single row, converted to a host type.
#[derive(Debug)]
#[must_use = "futures do nothing unless you `.await` or poll them"]
pub struct FetchScalar<SQL, ExeFut, IO: PgTransport, T> {
    inner: FetchOne<SQL, ExeFut, IO>,
    _marker: std::marker::PhantomData<T>,
}

impl<SQL, ExeFut, IO: PgTransport, T> FetchScalar<SQL, ExeFut, IO, T> {
    pub(crate) fn new(fetch: FetchStream<SQL, ExeFut, IO>) -> Self {
        Self { inner: FetchOne::new(fetch), _marker: std::marker::PhantomData }
    }
}

impl<SQL, ExeFut, IO, T> Future for FetchScalar<SQL, ExeFut, IO, T>
where
    SQL: Sql + Unpin,
    ExeFut: Future<Output = Result<IO>> + Unpin,
    IO: PgTransport,
    T: FromValue + Unpin,
{
    type Output = Result<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context) -> Poll<Self::Output> {
        let me = self.get_mut();
        let row = ready!(Pin::new(&mut me.inner).poll(cx)?);
        Poll::Ready(row.try_get(0).map_err(Into::into))
    }
}

/// Drive the exchange to completion and report the affected-row count.
#[derive(Debug)]
#[must_use = "futures do nothing unless you `.await` or poll them"]
pub struct Execute<SQL, ExeFut, IO: PgTransport> {
    fetch: FetchStream<SQL, ExeFut, IO>,
}

impl<SQL, ExeFut, IO: PgTransport> Execute<SQL, ExeFut, IO> {
    pub(crate) fn new(fetch: FetchStream<SQL, ExeFut, IO>) -> Self {
        Self { fetch }
    }
}

impl<SQL, ExeFut, IO> Future for Execute<SQL, ExeFut, IO>
where
    SQL: Sql + Unpin,
    ExeFut: Future<Output = Result<IO>> + Unpin,
    IO: PgTransport,
{
    type Output = Result<QueryResult>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context) -> Poll<Self::Output> {
        let me = self.get_mut();

        while ready!(Pin::new(&mut me.fetch).poll_next(cx)?).is_some() { }

        if me.fetch.was_empty_query() {
            return Poll::Ready(Err(EmptyQueryError.into()));
        }

        let rows_affected = me
            .fetch
            .command()
            .map(|cmd| cmd.rows_affected())
            .unwrap_or_default();
        Poll::Ready(Ok(QueryResult { rows_affected }))
    }
}
