//! The simple-query flow.
//!
//! One `Query` message may carry several `;`-separated statements; the
//! backend answers with a description/row/completion sequence per
//! statement and a single closing `ReadyForQuery`. Values arrive in
//! text format.
use futures_core::Stream;
use std::{
    pin::Pin,
    sync::Arc,
    task::{Context, Poll, ready},
};

use crate::{
    Error, Result,
    codec::CodecRegistry,
    error::ErrorKind,
    postgres::{backend::{BackendMessage, FieldDescription}, frontend},
    row::Row,
    sql::Sql,
    transport::PgTransport,
};

/// Row stream over one simple-query exchange.
///
/// Rows of every contained statement appear in sequence; completion
/// tags are accumulated into the total affected-row count. A sent
/// `Query` is never withdrawn: dropping the stream mid-exchange flags
/// the transport, and the outstanding reply sequence is discarded
/// through its `ReadyForQuery` before the next exchange reads.
#[derive(Debug)]
#[must_use = "streams do nothing unless polled"]
pub struct SimpleQueryStream<SQL, ExeFut, IO: PgTransport> {
    sql: SQL,
    io: Option<IO>,
    registry: Option<Arc<CodecRegistry>>,
    fields: Option<Arc<[FieldDescription]>>,
    phase: Phase<ExeFut>,
    rows_affected: u64,
}

#[derive(Debug)]
enum Phase<ExeFut> {
    Connect { f: ExeFut },
    Send,
    Streaming,
    Drain { error: Option<Error> },
    Complete,
}

impl<SQL, ExeFut, IO: PgTransport> SimpleQueryStream<SQL, ExeFut, IO> {
    pub(crate) fn new(sql: SQL, exe: ExeFut) -> Self {
        Self {
            sql,
            io: None,
            registry: None,
            fields: None,
            phase: Phase::Connect { f: exe },
            rows_affected: 0,
        }
    }

    /// Total rows affected across all statements, once the stream has
    /// finished.
    pub fn rows_affected(&self) -> u64 {
        self.rows_affected
    }
}

impl<SQL, ExeFut, IO: PgTransport> Drop for SimpleQueryStream<SQL, ExeFut, IO> {
    fn drop(&mut self) {
        let Some(io) = self.io.as_mut() else { return };
        match self.phase {
            // the Query message is only written on the Send -> Streaming
            // transition, so nothing is owed before that
            Phase::Connect { .. } | Phase::Send | Phase::Complete => { },
            // the reply sequence up to ReadyForQuery is abandoned in
            // flight
            _ => io.ready_request(),
        }
    }
}

macro_rules! fail {
    ($me:ident, $err:expr) => {{
        $me.phase = Phase::Complete;
        return Poll::Ready(Some(Err($err)));
    }};
}

impl<SQL, ExeFut, IO> Stream for SimpleQueryStream<SQL, ExeFut, IO>
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
                            me.phase = Phase::Send;
                        },
                        Err(err) => fail!(me, err),
                    }
                },
                Phase::Send => {
                    let io = me.io.as_mut().unwrap();
                    me.registry = Some(io.registry().clone());
                    io.send(frontend::Query { sql: me.sql.sql() });
                    me.phase = Phase::Streaming;
                },
                Phase::Streaming => {
                    let io = me.io.as_mut().unwrap();
                    match ready!(io.poll_recv::<BackendMessage>(cx)) {
                        Ok(BackendMessage::RowDescription(rd)) => {
                            me.fields = Some(rd.fields.into());
                        },
                        Ok(BackendMessage::DataRow(dr)) => {
                            let Some(fields) = &me.fields else {
                                let err = crate::postgres::ProtocolError::new(
                                    "DataRow without a row description",
                                );
                                me.io.as_mut().unwrap().ready_request();
                                fail!(me, err.into());
                            };
                            match Row::new(fields.clone(), me.registry.clone().unwrap(), dr) {
                                Ok(row) => return Poll::Ready(Some(Ok(row))),
                                Err(err) => {
                                    me.io.as_mut().unwrap().ready_request();
                                    fail!(me, err.into());
                                },
                            }
                        },
                        Ok(BackendMessage::CommandComplete(cmd)) => {
                            // one per contained statement
                            me.rows_affected += cmd.rows_affected();
                            me.fields = None;
                        },
                        Ok(BackendMessage::EmptyQueryResponse(_)) => { },
                        Ok(BackendMessage::CopyInResponse(_))
                        | Ok(BackendMessage::CopyOutResponse(_)) => {
                            // COPY execution is out of scope; realign
                            let err = crate::postgres::ProtocolError::new(
                                "COPY statements are not supported over the query api",
                            );
                            me.io.as_mut().unwrap().ready_request();
                            fail!(me, err.into());
                        },
                        Ok(BackendMessage::ReadyForQuery(_)) => {
                            me.phase = Phase::Complete;
                            return Poll::Ready(None);
                        },
                        Ok(other) => {
                            let err = other.unexpected("streaming simple query");
                            me.io.as_mut().unwrap().ready_request();
                            fail!(me, err.into());
                        },
                        Err(err) => {
                            if matches!(err.kind(), ErrorKind::Database(_)) {
                                // the backend still closes the cycle
                                me.phase = Phase::Drain { error: Some(err) };
                            } else {
                                fail!(me, err);
                            }
                        },
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

/// Drive one simple-query exchange to completion, dropping any rows.
pub(crate) async fn run<IO: PgTransport>(sql: &str, mut io: IO) -> Result<u64> {
    let mut stream = SimpleQueryStream::new(sql, std::future::ready(Ok(&mut io)));

    std::future::poll_fn(|cx| {
        loop {
            match ready!(Pin::new(&mut stream).poll_next(cx)) {
                Some(Ok(_)) => continue,
                Some(Err(err)) => return Poll::Ready(Err(err)),
                None => return Poll::Ready(Ok(())),
            }
        }
    })
    .await?;

    Ok(stream.rows_affected())
}
