//! Postgres connection: the single-writer exchange pipeline and its
//! side channels.
use bytes::BytesMut;
use std::{
    collections::HashMap,
    io,
    sync::Arc,
    task::{Context, Poll, ready},
};
use tokio::{io::AsyncWriteExt, sync::broadcast};

use crate::{
    Error, Result,
    cache::{CacheKey, StatementCache, StatementPlan},
    codec::CodecRegistry,
    net::{BufferedSocket, Socket},
    postgres::{
        BackendProtocol, FrontendProtocol, PgFormat, TransactionStatus,
        backend::{
            BackendKeyData, ErrorResponse, NoticeResponse, NotificationResponse,
            ParameterStatus, ReadyForQuery,
        },
        frontend,
    },
    statement::StatementName,
    transport::{PgTransport, PgTransportExt},
};

mod config;
mod sasl;
mod startup;

pub use config::{Config, ConfigError, StatementCacheConfig};
pub use startup::UnsupportedAuth;

/// Ring capacity of the notification broadcast; a subscriber lagging
/// further than this observes a [`MissedNotifications`] item instead of
/// stalling the protocol.
const NOTIFICATION_BUFFER: usize = 256;

/// A single postgres connection.
///
/// All protocol state is owned here and touched through `&mut`, which
/// serialises exchanges: frames of one exchange are never interleaved
/// with another's, and results complete in submission order.
pub struct Connection {
    socket: BufferedSocket,
    config: Config,
    registry: Arc<CodecRegistry>,
    cache: StatementCache,
    parameters: HashMap<String, String>,
    key_data: Option<BackendKeyData>,
    tx_status: TransactionStatus,
    notifications: broadcast::Sender<NotificationResponse>,
    /// Abandoned exchange windows still owed to the wire; each one is
    /// discarded through its closing `ReadyForQuery` before frames are
    /// handed to a caller again.
    pending_discards: u32,
    closed: bool,
}

impl Connection {
    /// Connect using a `postgres://` url.
    pub async fn connect(url: &str) -> Result<Connection> {
        Self::connect_with(Config::parse(url)?).await
    }

    /// Connect using configuration from the environment.
    ///
    /// See [`Config::from_env`] for the variables read.
    pub async fn connect_env() -> Result<Connection> {
        Self::connect_with(Config::from_env()?).await
    }

    /// Connect using the given configuration.
    pub async fn connect_with(config: Config) -> Result<Connection> {
        match config.connect_timeout {
            None => Self::connect_inner(config).await,
            Some(limit) => {
                match tokio::time::timeout(limit, Self::connect_inner(config)).await {
                    Ok(conn) => conn,
                    Err(_) => Err(Error::from(io::Error::new(
                        io::ErrorKind::TimedOut,
                        "connect timed out",
                    ))
                    .context("establishing connection")),
                }
            },
        }
    }

    async fn connect_inner(config: Config) -> Result<Connection> {
        let socket = Socket::connect(&config).await?;

        let cache = match config.statement_cache {
            StatementCacheConfig::Disabled => StatementCache::disabled(),
            StatementCacheConfig::Unbounded => StatementCache::unbounded(),
            StatementCacheConfig::Bounded(limit) => StatementCache::bounded(limit),
        };

        let (notifications, _) = broadcast::channel(NOTIFICATION_BUFFER);
        let mut conn = Connection {
            socket: BufferedSocket::new(socket),
            config,
            registry: Arc::new(CodecRegistry::default()),
            cache,
            parameters: HashMap::new(),
            key_data: None,
            tx_status: TransactionStatus::Idle,
            notifications,
            pending_discards: 0,
            closed: false,
        };

        startup::handshake(&mut conn).await?;

        if let Some(schema) = conn.config.schema.clone() {
            let sql = format!("SET search_path TO {}", crate::sql::quote_ident(&schema));
            crate::query::simple::run(&sql, &mut conn)
                .await
                .map_err(|e| e.context("applying configured schema"))?;
        }

        Ok(conn)
    }

    /// Transaction status as of the last `ReadyForQuery`.
    pub fn transaction_status(&self) -> TransactionStatus {
        self.tx_status
    }

    /// Latest reported value of a server parameter, e.g. `"TimeZone"`.
    pub fn parameter(&self, name: &str) -> Option<&str> {
        self.parameters.get(name).map(String::as_str)
    }

    /// The server version, from `server_version_num` when reported.
    pub fn server_version(&self) -> Version {
        Version::from_parameters(&self.parameters)
    }

    /// The backend process id from `BackendKeyData`.
    pub fn process_id(&self) -> Option<i32> {
        self.key_data.map(|k| k.process_id)
    }

    /// Subscribe to `LISTEN`/`NOTIFY` payloads.
    ///
    /// Notifications observed while any exchange is in flight are
    /// routed here and never into result streams.
    pub fn notifications(&self) -> Notifications {
        Notifications { rx: self.notifications.subscribe() }
    }

    /// A handle that can cancel this connection's running query from
    /// elsewhere.
    ///
    /// Returns [`None`] until the server has sent its key data.
    pub fn cancel_token(&self) -> Option<CancelToken> {
        let key = self.key_data?;
        Some(CancelToken {
            config: self.config.clone(),
            process_id: key.process_id,
            secret_key: key.secret_key,
        })
    }

    /// Whether this connection is still usable.
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Gracefully terminate the session.
    pub async fn close(mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.send(frontend::Terminate);
        self.flush().await?;
        self.closed = true;
        Ok(())
    }

    fn fail<T>(&mut self, error: impl Into<Error>) -> Poll<Result<T>> {
        self.closed = true;
        Poll::Ready(Err(error.into()))
    }
}

impl PgTransport for Connection {
    fn poll_flush(&mut self, cx: &mut Context) -> Poll<io::Result<()>> {
        if self.closed {
            return Poll::Ready(Err(io::ErrorKind::NotConnected.into()));
        }
        self.socket.poll_flush(cx)
    }

    fn poll_recv<B: BackendProtocol>(&mut self, cx: &mut Context) -> Poll<Result<B>> {
        if self.closed {
            return Poll::Ready(Err(Error::closed()));
        }

        loop {
            // push buffered requests out before waiting on responses
            if self.socket.wants_flush() {
                if let Err(err) = ready!(self.socket.poll_flush(cx)) {
                    return self.fail(err);
                }
            }

            let (tag, body) = match ready!(self.socket.poll_frame(cx)) {
                Ok(frame) => frame,
                Err(err) => return self.fail(err),
            };

            match tag {
                NoticeResponse::MSGTYPE => {
                    let notice = match NoticeResponse::decode(tag, body) {
                        Ok(n) => n,
                        Err(err) => return self.fail(err),
                    };
                    tracing::warn!(
                        code = notice.fields.code(),
                        "{}: {}",
                        notice.fields.severity(),
                        notice.fields.message(),
                    );
                },
                NotificationResponse::MSGTYPE => {
                    let notification = match NotificationResponse::decode(tag, body) {
                        Ok(n) => n,
                        Err(err) => return self.fail(err),
                    };
                    // no receiver is fine, the channel is a side effect
                    let _ = self.notifications.send(notification);
                },
                ParameterStatus::MSGTYPE => {
                    let status = match ParameterStatus::decode(tag, body) {
                        Ok(s) => s,
                        Err(err) => return self.fail(err),
                    };
                    tracing::trace!(name = status.name.as_str(), value = status.value.as_str(), "parameter status");
                    self.parameters
                        .insert(status.name.as_str().into(), status.value.as_str().into());
                },
                BackendKeyData::MSGTYPE => {
                    match BackendKeyData::decode(tag, body) {
                        Ok(key) => self.key_data = Some(key),
                        Err(err) => return self.fail(err),
                    }
                },
                ReadyForQuery::MSGTYPE => {
                    let ready = match ReadyForQuery::decode(tag, body.clone()) {
                        Ok(r) => r,
                        Err(err) => return self.fail(err),
                    };
                    self.tx_status = ready.status;
                    if self.pending_discards > 0 {
                        // one abandoned window fully consumed
                        self.pending_discards -= 1;
                        continue;
                    }
                    match B::decode(tag, body) {
                        Ok(message) => return Poll::Ready(Ok(message)),
                        Err(err) => return self.fail(err),
                    }
                },
                ErrorResponse::MSGTYPE => {
                    let error = match ErrorResponse::decode(tag, body) {
                        Ok(e) => e,
                        Err(err) => return self.fail(err),
                    };
                    if self.pending_discards > 0 {
                        tracing::debug!(code = error.fields.code(), "discarding error response");
                        continue;
                    }
                    return Poll::Ready(Err(error.into()));
                },
                _ => {
                    if self.pending_discards > 0 {
                        continue;
                    }
                    match B::decode(tag, body) {
                        Ok(message) => return Poll::Ready(Ok(message)),
                        // unexpected or unknown frame is a protocol
                        // violation, the channel cannot recover
                        Err(err) => return self.fail(err),
                    }
                },
            }
        }
    }

    fn ready_request(&mut self) {
        self.pending_discards += 1;
    }

    fn send<F: FrontendProtocol>(&mut self, message: F) {
        if self.closed {
            return;
        }
        self.socket.encode(&message);
    }

    fn send_startup(&mut self, startup: frontend::Startup) {
        startup.encode(self.socket.write_buf_mut());
    }

    fn statement_plan(&mut self, key: &CacheKey) -> StatementPlan {
        self.cache.plan(key)
    }

    fn statement_parsed(&mut self, key: CacheKey, name: StatementName) {
        self.cache.parsed(key, name);
    }

    fn registry(&self) -> &Arc<CodecRegistry> {
        &self.registry
    }

    fn transaction_status(&self) -> TransactionStatus {
        self.tx_status
    }

    fn result_format(&self) -> PgFormat {
        match self.config.force_binary {
            true => PgFormat::Binary,
            false => PgFormat::Text,
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("host", &self.config.host.as_str())
            .field("status", &self.tx_status)
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

/// Receiver half of the notification side channel.
pub struct Notifications {
    rx: broadcast::Receiver<NotificationResponse>,
}

impl Notifications {
    /// The next notification; [`None`] once the connection is gone.
    ///
    /// A slow subscriber does not stall the protocol: when the buffer
    /// wraps, the overflow is surfaced as [`MissedNotifications`].
    pub async fn recv(&mut self) -> Option<Result<NotificationResponse, MissedNotifications>> {
        match self.rx.recv().await {
            Ok(notification) => Some(Ok(notification)),
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                Some(Err(MissedNotifications { missed }))
            },
            Err(broadcast::error::RecvError::Closed) => None,
        }
    }
}

/// This subscriber fell behind and lost notifications.
#[derive(Debug, PartialEq, Eq)]
pub struct MissedNotifications {
    pub missed: u64,
}

impl std::error::Error for MissedNotifications { }

impl std::fmt::Display for MissedNotifications {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "subscriber lagged, {} notifications lost", self.missed)
    }
}

/// Out-of-band cancellation handle.
///
/// Cancelling opens a second, short-lived connection to the same
/// endpoint, writes a `CancelRequest` and closes; no reply is expected.
/// It never participates in the exchange queue and cannot affect the
/// transaction status.
#[derive(Clone, Debug)]
pub struct CancelToken {
    config: Config,
    process_id: i32,
    secret_key: i32,
}

impl CancelToken {
    /// Ask the server to abort whatever the owning connection is
    /// currently executing.
    pub async fn cancel(&self) -> Result<()> {
        let mut socket = Socket::connect(&self.config).await?;

        let mut buf = BytesMut::with_capacity(16);
        frontend::CancelRequest {
            process_id: self.process_id,
            secret_key: self.secret_key,
        }
        .encode(&mut buf);

        socket.write_all(&buf).await?;
        socket.shutdown().await.ok();
        Ok(())
    }
}

/// Server version, numeric form `major * 10000 + minor [* 100 + patch]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Version {
    raw: String,
    num: u32,
}

impl Version {
    fn from_parameters(parameters: &HashMap<String, String>) -> Version {
        let raw = parameters
            .get("server_version")
            .cloned()
            .unwrap_or_default();
        let num = parameters
            .get("server_version_num")
            .and_then(|n| n.parse().ok())
            .unwrap_or_else(|| Self::parse_text(&raw));
        Version { raw, num }
    }

    /// Parse `M.m[.p]` as `M*10000 + m*100 + p`, or `M*10000 + m` from
    /// version 10 on. Trailing vendor decorations are ignored.
    fn parse_text(raw: &str) -> u32 {
        let mut parts = raw.split('.').map(|part| {
            let digits: String = part.chars().take_while(char::is_ascii_digit).collect();
            digits.parse::<u32>().unwrap_or(0)
        });

        let major = parts.next().unwrap_or(0);
        let minor = parts.next().unwrap_or(0);
        let patch = parts.next().unwrap_or(0);

        if major >= 10 {
            major * 10_000 + minor
        } else {
            major * 10_000 + minor * 100 + patch
        }
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn number(&self) -> u32 {
        self.num
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn version_text_parsing() {
        assert_eq!(Version::parse_text("9.6.24"), 90624);
        assert_eq!(Version::parse_text("9.4"), 90400);
        assert_eq!(Version::parse_text("10.1"), 100001);
        assert_eq!(Version::parse_text("14beta1"), 140000);
        assert_eq!(Version::parse_text("12.3 (Debian 12.3-1)"), 120003);
        assert_eq!(Version::parse_text(""), 0);
    }

    #[test]
    fn version_num_parameter_is_authoritative() {
        let mut params = HashMap::new();
        params.insert("server_version".into(), "16.2".into());
        params.insert("server_version_num".into(), "160002".into());
        let version = Version::from_parameters(&params);
        assert_eq!(version.number(), 160002);
        assert_eq!(version.as_str(), "16.2");

        params.remove("server_version_num");
        assert_eq!(Version::from_parameters(&params).number(), 160002);
    }
}
