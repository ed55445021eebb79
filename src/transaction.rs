//! The [`Transaction`] type.
use std::{
    io,
    sync::Arc,
    task::{Context, Poll},
};

use crate::{
    Result,
    cache::{CacheKey, StatementPlan},
    codec::CodecRegistry,
    executor::Executor,
    postgres::{
        BackendProtocol, FrontendProtocol, PgFormat, TransactionStatus,
        frontend,
    },
    query::simple,
    sql::quote_ident,
    statement::StatementName,
    transport::PgTransport,
};

/// Begin a transaction block.
///
/// A no-op when the connection is already inside one; the transaction
/// status reported by the server is the single source of truth.
///
/// ```no_run
/// # async fn app(mut conn: pgstream::Connection) -> pgstream::Result<()> {
/// let mut tx = pgstream::begin(&mut conn).await?;
///
/// pgstream::execute("INSERT INTO foo(id) VALUES($1)", &mut tx)
///     .bind(14)
///     .await?;
///
/// tx.commit().await?;
/// # Ok(())
/// # }
/// ```
pub async fn begin<E: Executor>(exe: E) -> Result<Transaction<E::Transport>> {
    let mut io = exe.connection().await?;
    if io.transaction_status() != TransactionStatus::Open {
        simple::run("BEGIN", &mut io).await?;
    }
    Ok(Transaction { io, done: false })
}

/// An RAII implementation of transaction scope.
///
/// Commit with [`Transaction::commit`]; when dropped without a commit,
/// a rollback is queued instead.
pub struct Transaction<IO: PgTransport> {
    io: IO,
    done: bool,
}

impl<IO> Transaction<IO>
where
    IO: PgTransport,
{
    /// Commit the transaction.
    ///
    /// A no-op when the server reports no open transaction block.
    pub async fn commit(mut self) -> Result<()> {
        if self.io.transaction_status() != TransactionStatus::Idle {
            simple::run("COMMIT", &mut self.io).await?;
        }
        self.done = true;
        Ok(())
    }

    /// Roll the transaction back explicitly.
    ///
    /// A no-op when the server reports no open transaction block.
    pub async fn rollback(mut self) -> Result<()> {
        if self.io.transaction_status() != TransactionStatus::Idle {
            simple::run("ROLLBACK", &mut self.io).await?;
        }
        self.done = true;
        Ok(())
    }

    /// Establish a savepoint inside this transaction.
    pub async fn savepoint(&mut self, name: &str) -> Result<()> {
        let sql = format!("SAVEPOINT {}", quote_ident(name));
        simple::run(&sql, &mut self.io).await?;
        Ok(())
    }

    /// Destroy a previously established savepoint.
    pub async fn release_savepoint(&mut self, name: &str) -> Result<()> {
        let sql = format!("RELEASE SAVEPOINT {}", quote_ident(name));
        simple::run(&sql, &mut self.io).await?;
        Ok(())
    }

    /// Roll back to a previously established savepoint.
    ///
    /// This is the only statement a failed transaction block accepts
    /// besides a full rollback.
    pub async fn rollback_to_savepoint(&mut self, name: &str) -> Result<()> {
        let sql = format!("ROLLBACK TO SAVEPOINT {}", quote_ident(name));
        simple::run(&sql, &mut self.io).await?;
        Ok(())
    }
}

impl<IO> Drop for Transaction<IO>
where
    IO: PgTransport,
{
    fn drop(&mut self) {
        if !self.done {
            self.io.send(frontend::Query { sql: "ROLLBACK" });
            self.io.ready_request();
        }
    }
}

impl<IO> PgTransport for Transaction<IO>
where
    IO: PgTransport,
{
    fn poll_flush(&mut self, cx: &mut Context) -> Poll<io::Result<()>> {
        IO::poll_flush(&mut self.io, cx)
    }

    fn poll_recv<B: BackendProtocol>(&mut self, cx: &mut Context) -> Poll<Result<B>> {
        IO::poll_recv(&mut self.io, cx)
    }

    fn ready_request(&mut self) {
        IO::ready_request(&mut self.io)
    }

    fn send<F: FrontendProtocol>(&mut self, message: F) {
        IO::send(&mut self.io, message)
    }

    fn send_startup(&mut self, startup: frontend::Startup) {
        IO::send_startup(&mut self.io, startup)
    }

    fn statement_plan(&mut self, key: &CacheKey) -> StatementPlan {
        IO::statement_plan(&mut self.io, key)
    }

    fn statement_parsed(&mut self, key: CacheKey, name: StatementName) {
        IO::statement_parsed(&mut self.io, key, name)
    }

    fn registry(&self) -> &Arc<CodecRegistry> {
        IO::registry(&self.io)
    }

    fn transaction_status(&self) -> TransactionStatus {
        IO::transaction_status(&self.io)
    }

    fn result_format(&self) -> PgFormat {
        IO::result_format(&self.io)
    }
}
