//! The [`PgTransport`] trait.
use std::{
    io,
    sync::Arc,
    task::{Context, Poll},
};

use crate::{
    Result,
    cache::{CacheKey, StatementPlan},
    codec::CodecRegistry,
    postgres::{BackendProtocol, FrontendProtocol, PgFormat, TransactionStatus, frontend},
    statement::StatementName,
};

/// A buffered stream which can send and receive postgres messages.
///
/// This is the seam between the executors and the connection; flow
/// tests drive the executors through an in-memory implementation.
pub trait PgTransport: Unpin {
    /// Poll to flush the underlying io.
    fn poll_flush(&mut self, cx: &mut Context) -> Poll<io::Result<()>>;

    /// Poll to receive a message.
    ///
    /// Calling `poll_recv` will also try to [`poll_flush`][1] if there
    /// is buffered message.
    ///
    /// The implementor routes `NoticeResponse`, `NotificationResponse`,
    /// `ParameterStatus` and `BackendKeyData` to their side channels and
    /// never returns them.
    ///
    /// The implementor also handles `ErrorResponse`: it discards frames
    /// until the closing `ReadyForQuery` to keep the channel aligned,
    /// then returns the error as [`Err`].
    ///
    /// [1]: PgTransport::poll_flush
    fn poll_recv<B: BackendProtocol>(&mut self, cx: &mut Context) -> Poll<Result<B>>;

    /// Request implementor to ignore all backend messages until
    /// `ReadyForQuery` is received.
    ///
    /// Each call abandons one exchange window: calling this twice
    /// discards through two `ReadyForQuery` frames. Dropped streams and
    /// transactions use this to keep the channel aligned with frames
    /// that were already written.
    fn ready_request(&mut self);

    /// Send message to the backend.
    ///
    /// Note that this send is buffered, caller must also call
    /// [`poll_flush`][1] or [`flush`][2] afterwards.
    ///
    /// [1]: PgTransport::poll_flush
    /// [2]: PgTransportExt::flush
    fn send<F: FrontendProtocol>(&mut self, message: F);

    /// Send [`Startup`][1] message to the backend.
    ///
    /// For historical reasons, the very first message sent by the client
    /// has no message-type byte, thus [`Startup`][1] does not implement
    /// [`FrontendProtocol`].
    ///
    /// [1]: frontend::Startup
    fn send_startup(&mut self, startup: frontend::Startup);

    /// Ask the statement cache how to prepare this key.
    fn statement_plan(&mut self, key: &CacheKey) -> StatementPlan;

    /// Record a successful `ParseComplete` for the key.
    fn statement_parsed(&mut self, key: CacheKey, name: StatementName);

    /// The codec registry rows should be decoded against.
    fn registry(&self) -> &Arc<CodecRegistry>;

    /// Transaction status as of the last `ReadyForQuery`.
    fn transaction_status(&self) -> TransactionStatus;

    /// Format requested for result columns.
    fn result_format(&self) -> PgFormat {
        PgFormat::Text
    }
}

impl<P> PgTransport for &mut P
where
    P: PgTransport,
{
    fn poll_flush(&mut self, cx: &mut Context) -> Poll<io::Result<()>> {
        P::poll_flush(self, cx)
    }

    fn poll_recv<B: BackendProtocol>(&mut self, cx: &mut Context) -> Poll<Result<B>> {
        P::poll_recv(self, cx)
    }

    fn ready_request(&mut self) {
        P::ready_request(self);
    }

    fn send<F: FrontendProtocol>(&mut self, message: F) {
        P::send(self, message);
    }

    fn send_startup(&mut self, startup: frontend::Startup) {
        P::send_startup(self, startup);
    }

    fn statement_plan(&mut self, key: &CacheKey) -> StatementPlan {
        P::statement_plan(self, key)
    }

    fn statement_parsed(&mut self, key: CacheKey, name: StatementName) {
        P::statement_parsed(self, key, name)
    }

    fn registry(&self) -> &Arc<CodecRegistry> {
        P::registry(self)
    }

    fn transaction_status(&self) -> TransactionStatus {
        P::transaction_status(self)
    }

    fn result_format(&self) -> PgFormat {
        P::result_format(self)
    }
}

/// An extension trait to provide `Future` API for [`PgTransport`].
pub trait PgTransportExt: PgTransport {
    /// Flush the underlying io.
    fn flush(&mut self) -> impl Future<Output = io::Result<()>> {
        std::future::poll_fn(|cx| self.poll_flush(cx))
    }

    /// Receive a backend message.
    fn recv<B: BackendProtocol>(&mut self) -> impl Future<Output = Result<B>> {
        std::future::poll_fn(|cx| self.poll_recv(cx))
    }
}

impl<T> PgTransportExt for T where T: PgTransport { }
