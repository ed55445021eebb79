//! Query API types.
use std::fmt;

use crate::{codec::PgValue, executor::Executor, row::FromValue, sql::Sql};

pub mod fetch;
pub mod simple;

pub use fetch::FetchStream;
pub use simple::SimpleQueryStream;

/// Entrypoint of the extended-query API.
///
/// ```no_run
/// # async fn app(mut conn: pgstream::Connection) -> pgstream::Result<()> {
/// let rows = pgstream::query("SELECT id, name FROM foo WHERE id > $1", &mut conn)
///     .bind(14)
///     .fetch_all()
///     .await?;
/// # Ok(())
/// # }
/// ```
#[inline]
pub fn query<SQL, Exe>(sql: SQL, exe: Exe) -> Query<SQL, Exe> {
    Query { sql, exe, params: Vec::new(), max_rows: 0 }
}

/// Entrypoint for statements executed for their effect.
///
/// The same builder as [`query`]; awaiting it directly yields the
/// affected-row count.
#[inline]
pub fn execute<SQL, Exe>(sql: SQL, exe: Exe) -> Query<SQL, Exe> {
    query(sql, exe)
}

/// One simple-query exchange, used for unparameterised statements,
/// transaction control, and `SET`s; see [`simple`].
#[inline]
pub fn simple_query<SQL, Exe>(sql: SQL, exe: Exe) -> SimpleQueryStream<SQL, Exe::Future, Exe::Transport>
where
    SQL: Sql,
    Exe: Executor,
{
    SimpleQueryStream::new(sql, exe.connection())
}

/// The query API.
#[derive(Debug)]
#[must_use = "queries do nothing unless executed"]
pub struct Query<SQL, Exe> {
    sql: SQL,
    exe: Exe,
    params: Vec<PgValue>,
    max_rows: u32,
}

impl<SQL, Exe> Query<SQL, Exe> {
    /// Bind the next query parameter.
    ///
    /// Parameters form a dense zero-based vector; their count at
    /// submission is the statement's parameter arity.
    #[inline]
    pub fn bind<V: Into<PgValue>>(mut self, value: V) -> Self {
        self.params.push(value.into());
        self
    }

    /// Limit each `Execute` to this many rows.
    ///
    /// When the limit cuts a result short the portal reports
    /// suspension and the stream ends; re-execute the query to read
    /// further rows.
    #[inline]
    pub fn fetch_size(mut self, rows: u32) -> Self {
        self.max_rows = rows;
        self
    }
}

impl<SQL, Exe> Query<SQL, Exe>
where
    SQL: Sql,
    Exe: Executor,
{
    fn stream(self) -> FetchStream<SQL, Exe::Future, Exe::Transport> {
        FetchStream::new(self.sql, self.exe.connection(), self.params, self.max_rows)
    }

    /// Fetch rows using the [`Stream`][futures_core::Stream] api.
    ///
    /// Rows are decoded on demand; an unpolled stream reads nothing
    /// off the socket.
    #[inline]
    pub fn fetch(self) -> FetchStream<SQL, Exe::Future, Exe::Transport> {
        self.stream()
    }

    /// Fetch all rows into a [`Vec`].
    #[inline]
    pub fn fetch_all(self) -> fetch::FetchAll<SQL, Exe::Future, Exe::Transport> {
        fetch::FetchAll::new(self.stream())
    }

    /// Fetch exactly one row.
    #[inline]
    pub fn fetch_one(mut self) -> fetch::FetchOne<SQL, Exe::Future, Exe::Transport> {
        self.max_rows = 1;
        fetch::FetchOne::new(self.stream())
    }

    /// Optionally fetch one row.
    #[inline]
    pub fn fetch_optional(mut self) -> fetch::FetchOptional<SQL, Exe::Future, Exe::Transport> {
        self.max_rows = 1;
        fetch::FetchOptional::new(self.stream())
    }

    /// Fetch the first column of the single row.
    #[inline]
    pub fn fetch_scalar<T: FromValue>(mut self) -> fetch::FetchScalar<SQL, Exe::Future, Exe::Transport, T> {
        self.max_rows = 1;
        fetch::FetchScalar::new(self.stream())
    }

    /// Execute the statement and return the number of affected rows.
    #[inline]
    pub fn execute(self) -> fetch::Execute<SQL, Exe::Future, Exe::Transport> {
        fetch::Execute::new(self.stream())
    }
}

impl<SQL, Exe> IntoFuture for Query<SQL, Exe>
where
    SQL: Sql + Unpin,
    Exe: Executor,
{
    type Output = crate::Result<QueryResult>;

    type IntoFuture = fetch::Execute<SQL, Exe::Future, Exe::Transport>;

    #[inline]
    fn into_future(self) -> Self::IntoFuture {
        self.execute()
    }
}

/// Completion summary of an executed statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueryResult {
    pub rows_affected: u64,
}

/// The submitted query string was empty.
#[derive(Debug)]
pub struct EmptyQueryError;

impl std::error::Error for EmptyQueryError { }

impl fmt::Display for EmptyQueryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("query string is empty")
    }
}
