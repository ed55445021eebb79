//! Protocol flow tests against a scripted in-process server.
//!
//! The server answers canned byte batches keyed on the message-type
//! byte of the frame that triggers them, and records every frame the
//! driver sends for later inspection.
use std::{
    collections::VecDeque,
    sync::{Arc, Mutex},
};

use futures_util::{FutureExt, StreamExt};
use pgstream::{Config, Connection, DatabaseErrorKind, TransactionStatus};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
};

type Log = Arc<Mutex<Vec<(u8, Vec<u8>)>>>;

struct MockServer {
    port: u16,
    log: Log,
    /// Raw payloads of any connection after the first, the way a
    /// cancel request arrives.
    side_connections: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl MockServer {
    /// `responses` are served in order, each once its trigger tag
    /// arrives; `startup_response` answers the startup message.
    async fn start(startup_response: Vec<u8>, responses: Vec<(u8, Vec<u8>)>) -> MockServer {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let log: Log = Arc::default();
        let side_connections: Arc<Mutex<Vec<Vec<u8>>>> = Arc::default();

        let session_log = log.clone();
        let side = side_connections.clone();
        tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let main = session(tcp, startup_response, responses.into(), session_log);
            let extras = async {
                loop {
                    let (mut tcp, _) = listener.accept().await.unwrap();
                    let mut raw = Vec::new();
                    tcp.read_to_end(&mut raw).await.unwrap();
                    side.lock().unwrap().push(raw);
                }
            };
            tokio::join!(main, extras).0
        });

        MockServer { port, log, side_connections }
    }

    fn config(&self) -> Config {
        Config::new("alice")
            .password("secret")
            .host("127.0.0.1")
            .port(self.port)
    }

    fn sent_tags(&self) -> Vec<u8> {
        self.log.lock().unwrap().iter().map(|(tag, _)| *tag).collect()
    }

    fn sent(&self) -> Vec<(u8, Vec<u8>)> {
        self.log.lock().unwrap().clone()
    }
}

async fn session(
    mut tcp: TcpStream,
    startup_response: Vec<u8>,
    mut responses: VecDeque<(u8, Vec<u8>)>,
    log: Log,
) {
    // startup message: length-prefixed, untagged
    let mut len = [0u8; 4];
    tcp.read_exact(&mut len).await.unwrap();
    let mut body = vec![0u8; u32::from_be_bytes(len) as usize - 4];
    tcp.read_exact(&mut body).await.unwrap();
    tcp.write_all(&startup_response).await.unwrap();

    loop {
        let mut tag = [0u8; 1];
        if tcp.read_exact(&mut tag).await.is_err() {
            return;
        }
        let mut len = [0u8; 4];
        tcp.read_exact(&mut len).await.unwrap();
        let mut body = vec![0u8; u32::from_be_bytes(len) as usize - 4];
        tcp.read_exact(&mut body).await.unwrap();
        log.lock().unwrap().push((tag[0], body));

        if responses.front().is_some_and(|(trigger, _)| *trigger == tag[0]) {
            let (_, data) = responses.pop_front().unwrap();
            tcp.write_all(&data).await.unwrap();
        }
    }
}

// ===== canned backend frames =====

fn msg(tag: u8, body: &[u8]) -> Vec<u8> {
    let mut out = vec![tag];
    out.extend_from_slice(&(body.len() as u32 + 4).to_be_bytes());
    out.extend_from_slice(body);
    out
}

fn auth_ok() -> Vec<u8> {
    msg(b'R', &0i32.to_be_bytes())
}

fn auth_md5(salt: [u8; 4]) -> Vec<u8> {
    let mut body = 5i32.to_be_bytes().to_vec();
    body.extend_from_slice(&salt);
    msg(b'R', &body)
}

fn auth_cleartext() -> Vec<u8> {
    msg(b'R', &3i32.to_be_bytes())
}

fn parameter_status(name: &str, value: &str) -> Vec<u8> {
    msg(b'S', format!("{name}\0{value}\0").as_bytes())
}

fn backend_key_data(pid: i32, secret: i32) -> Vec<u8> {
    let mut body = pid.to_be_bytes().to_vec();
    body.extend_from_slice(&secret.to_be_bytes());
    msg(b'K', &body)
}

fn ready(status: u8) -> Vec<u8> {
    msg(b'Z', &[status])
}

fn parse_complete() -> Vec<u8> {
    msg(b'1', &[])
}

fn bind_complete() -> Vec<u8> {
    msg(b'2', &[])
}

fn close_complete() -> Vec<u8> {
    msg(b'3', &[])
}

/// One-column `RowDescription`, text format.
fn row_description(name: &str, oid: u32) -> Vec<u8> {
    let mut body = 1u16.to_be_bytes().to_vec();
    body.extend_from_slice(name.as_bytes());
    body.push(0);
    body.extend_from_slice(&0u32.to_be_bytes()); // table oid
    body.extend_from_slice(&0i16.to_be_bytes()); // column id
    body.extend_from_slice(&oid.to_be_bytes());
    body.extend_from_slice(&(-1i16).to_be_bytes());
    body.extend_from_slice(&(-1i32).to_be_bytes());
    body.extend_from_slice(&0i16.to_be_bytes()); // text
    msg(b'T', &body)
}

fn data_row(columns: &[Option<&[u8]>]) -> Vec<u8> {
    let mut body = (columns.len() as u16).to_be_bytes().to_vec();
    for column in columns {
        match column {
            None => body.extend_from_slice(&(-1i32).to_be_bytes()),
            Some(value) => {
                body.extend_from_slice(&(value.len() as u32).to_be_bytes());
                body.extend_from_slice(value);
            },
        }
    }
    msg(b'D', &body)
}

fn command_complete(tag: &str) -> Vec<u8> {
    msg(b'C', format!("{tag}\0").as_bytes())
}

fn error_response(code: &str) -> Vec<u8> {
    msg(b'E', format!("SERROR\0C{code}\0Mboom\0\0").as_bytes())
}

fn notification(pid: i32, channel: &str, payload: &str) -> Vec<u8> {
    let mut body = pid.to_be_bytes().to_vec();
    body.extend_from_slice(channel.as_bytes());
    body.push(0);
    body.extend_from_slice(payload.as_bytes());
    body.push(0);
    msg(b'A', &body)
}

fn startup_ok(status: u8) -> Vec<u8> {
    [
        auth_ok(),
        parameter_status("server_version", "16.2"),
        parameter_status("server_version_num", "160002"),
        backend_key_data(42, 77),
        ready(status),
    ]
    .concat()
}

/// `BindComplete` through `ReadyForQuery` for a one-column, one-row
/// `SELECT`.
fn select_window(value: &[u8]) -> Vec<u8> {
    [
        bind_complete(),
        row_description("v", 23),
        data_row(&[Some(value)]),
        command_complete("SELECT 1"),
        close_complete(),
        ready(b'I'),
    ]
    .concat()
}

// ===== scenarios =====

#[tokio::test]
async fn md5_startup_sends_the_salted_hash() {
    let server = MockServer::start(
        auth_md5([0x1A, 0x2B, 0x3C, 0x4D]),
        vec![(b'p', startup_ok(b'I'))],
    )
    .await;

    let conn = Connection::connect_with(server.config()).await.unwrap();

    let sent = server.sent();
    let password = sent.iter().find(|(tag, _)| *tag == b'p').unwrap();
    // "md5" || hex(md5(hex(md5("secret" || "alice")) || salt)), nul terminated
    assert_eq!(password.1, b"md57ebaa254a0ff3a0207457356039aa9ff\0");

    assert_eq!(conn.server_version().number(), 160_002);
    assert_eq!(conn.process_id(), Some(42));
    assert_eq!(conn.transaction_status(), TransactionStatus::Idle);
}

#[tokio::test]
async fn cleartext_startup_sends_the_password() {
    let server = MockServer::start(auth_cleartext(), vec![(b'p', startup_ok(b'I'))]).await;

    Connection::connect_with(server.config()).await.unwrap();

    let sent = server.sent();
    let password = sent.iter().find(|(tag, _)| *tag == b'p').unwrap();
    assert_eq!(password.1, b"secret\0");
}

#[tokio::test]
async fn extended_query_streams_rows() {
    let server = MockServer::start(
        startup_ok(b'I'),
        vec![
            (b'H', parse_complete()),
            (b'S', select_window(b"420")),
        ],
    )
    .await;

    let mut conn = Connection::connect_with(server.config()).await.unwrap();

    let rows = pgstream::query("SELECT $1::int4", &mut conn)
        .bind(420)
        .fetch_all()
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].try_get::<_, i32>("v").unwrap(), 420);

    // Parse · Flush · Bind · Describe · Execute · Close(portal) · Sync
    assert_eq!(server.sent_tags(), [b'P', b'H', b'B', b'D', b'E', b'C', b'S']);
}

#[tokio::test]
async fn fetch_scalar_converts_the_single_column() {
    let server = MockServer::start(
        startup_ok(b'I'),
        vec![(b'H', parse_complete()), (b'S', select_window(b"7"))],
    )
    .await;

    let mut conn = Connection::connect_with(server.config()).await.unwrap();

    let value: i32 = pgstream::query("SELECT count(*)::int4 FROM t", &mut conn)
        .fetch_scalar()
        .await
        .unwrap();
    assert_eq!(value, 7);

    // fetch_scalar limits the execute to a single row
    let execute = server
        .sent()
        .into_iter()
        .find(|(tag, _)| *tag == b'E')
        .unwrap();
    assert_eq!(&execute.1[execute.1.len() - 4..], &1u32.to_be_bytes());
}

#[tokio::test]
async fn bounded_cache_eviction_closes_the_eldest_statement() {
    let select = |v: &[u8]| select_window(v);
    let server = MockServer::start(
        startup_ok(b'I'),
        vec![
            (b'H', parse_complete()),     // A → S_0
            (b'S', select(b"1")),
            (b'H', parse_complete()),     // B → S_1
            (b'S', select(b"2")),
            (b'S', select(b"3")),         // A again, cache hit
            (b'H', close_complete()),     // evict S_1
            (b'H', parse_complete()),     // C → S_2
            (b'S', select(b"4")),
        ],
    )
    .await;

    let mut conn = Connection::connect_with(
        server
            .config()
            .statement_cache(pgstream::connection::StatementCacheConfig::Bounded(2)),
    )
    .await
    .unwrap();

    for sql in ["SELECT 'A'", "SELECT 'B'", "SELECT 'A'", "SELECT 'C'"] {
        pgstream::query(sql, &mut conn).fetch_all().await.unwrap();
    }

    let sent = server.sent();

    let parses: Vec<Vec<u8>> = sent
        .iter()
        .filter(|(tag, _)| *tag == b'P')
        .map(|(_, body)| body.clone())
        .collect();
    assert_eq!(parses.len(), 3, "A cache hit must not parse again");
    assert!(parses[0].starts_with(b"S_0\0SELECT 'A'\0"));
    assert!(parses[1].starts_with(b"S_1\0SELECT 'B'\0"));
    assert!(parses[2].starts_with(b"S_2\0SELECT 'C'\0"));

    // the eviction closes S_1 (A was promoted by its second use), and
    // does so before the replacement parse
    let close_eldest = sent
        .iter()
        .position(|(tag, body)| *tag == b'C' && body == b"SS_1\0")
        .expect("expected Close(Statement, S_1)");
    let parse_c = sent
        .iter()
        .position(|(_, body)| body.starts_with(b"S_2\0"))
        .unwrap();
    assert!(close_eldest < parse_c);
}

#[tokio::test]
async fn error_mid_stream_fails_the_stream_and_keeps_the_connection() {
    let window = [
        bind_complete(),
        row_description("v", 23),
        data_row(&[Some(&b"1"[..])]),
        error_response("23505"),
        ready(b'I'),
    ]
    .concat();

    let server = MockServer::start(
        startup_ok(b'T'),
        vec![
            (b'H', parse_complete()),
            (b'S', window),
            (b'H', parse_complete()),
            (b'S', select_window(b"2")),
        ],
    )
    .await;

    let mut conn = Connection::connect_with(server.config()).await.unwrap();
    assert_eq!(conn.transaction_status(), TransactionStatus::Open);

    let mut stream = pgstream::query("SELECT v FROM t", &mut conn).fetch();
    let first = stream.next().await.unwrap().unwrap();
    assert_eq!(first.try_get::<_, i32>(0).unwrap(), 1);

    let error = stream.next().await.unwrap().unwrap_err();
    assert_eq!(error.database_kind(), Some(DatabaseErrorKind::DataIntegrity));
    assert_eq!(error.database().unwrap().fields.code(), "23505");
    assert!(stream.next().await.is_none());
    drop(stream);

    // the trailing ReadyForQuery realigned the connection
    assert_eq!(conn.transaction_status(), TransactionStatus::Idle);
    assert!(!conn.is_closed());

    let rows = pgstream::query("SELECT 2", &mut conn).fetch_all().await.unwrap();
    assert_eq!(rows[0].try_get::<_, i32>(0).unwrap(), 2);
}

#[tokio::test]
async fn dropping_a_stream_mid_rows_realigns_the_connection() {
    let window = [
        bind_complete(),
        row_description("v", 23),
        data_row(&[Some(&b"1"[..])]),
        data_row(&[Some(&b"2"[..])]),
        command_complete("SELECT 2"),
        close_complete(),
        ready(b'I'),
    ]
    .concat();

    let server = MockServer::start(
        startup_ok(b'I'),
        vec![
            (b'H', parse_complete()),
            (b'S', window),
            (b'H', parse_complete()),
            (b'S', select_window(b"9")),
        ],
    )
    .await;

    let mut conn = Connection::connect_with(server.config()).await.unwrap();

    // pull one row, then abandon the exchange with the second row,
    // completion and ReadyForQuery still in flight
    let mut stream = pgstream::query("SELECT v FROM t", &mut conn).fetch();
    let first = stream.next().await.unwrap().unwrap();
    assert_eq!(first.try_get::<_, i32>(0).unwrap(), 1);
    drop(stream);

    // the leftover frames are discarded, not read as this reply
    let rows = pgstream::query("SELECT 9", &mut conn).fetch_all().await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].try_get::<_, i32>(0).unwrap(), 9);
    assert_eq!(conn.transaction_status(), TransactionStatus::Idle);
}

#[tokio::test]
async fn dropping_a_stream_before_sync_still_closes_the_window() {
    let server = MockServer::start(
        startup_ok(b'I'),
        vec![
            (b'H', parse_complete()),
            // the drop owes the server a Sync; answer it
            (b'S', ready(b'I')),
            (b'H', parse_complete()),
            (b'S', select_window(b"9")),
        ],
    )
    .await;

    let mut conn = Connection::connect_with(server.config()).await.unwrap();

    // a single poll writes the parse round, then the stream is dropped
    // while waiting on the backend
    let mut stream = pgstream::query("SELECT pending", &mut conn).fetch();
    assert!(stream.next().now_or_never().is_none());
    drop(stream);

    let rows = pgstream::query("SELECT 9", &mut conn).fetch_all().await.unwrap();
    assert_eq!(rows[0].try_get::<_, i32>(0).unwrap(), 9);
}

#[tokio::test]
async fn notifications_route_to_the_side_channel() {
    let window = [
        bind_complete(),
        row_description("v", 23),
        data_row(&[Some(&b"1"[..])]),
        notification(42, "c", "hi"),
        data_row(&[Some(&b"2"[..])]),
        command_complete("SELECT 2"),
        close_complete(),
        ready(b'I'),
    ]
    .concat();

    let server = MockServer::start(
        startup_ok(b'I'),
        vec![(b'H', parse_complete()), (b'S', window)],
    )
    .await;

    let mut conn = Connection::connect_with(server.config()).await.unwrap();
    let mut notifications = conn.notifications();

    let rows = pgstream::query("SELECT v FROM t", &mut conn)
        .fetch_all()
        .await
        .unwrap();

    // both rows reach the consumer, the notification does not
    assert_eq!(rows.len(), 2);

    let event = notifications.recv().await.unwrap().unwrap();
    assert_eq!(event.process_id, 42);
    assert_eq!(event.channel.as_str(), "c");
    assert_eq!(event.payload.as_str(), "hi");
}

#[tokio::test]
async fn rows_decode_only_when_pulled() {
    // the second row is mangled; decoding it eagerly would fail the
    // first pull too
    let window = [
        bind_complete(),
        row_description("v", 23),
        data_row(&[Some(&b"1"[..])]),
        data_row(&[Some(&b"not-an-int"[..])]),
        command_complete("SELECT 2"),
        close_complete(),
        ready(b'I'),
    ]
    .concat();

    let server = MockServer::start(
        startup_ok(b'I'),
        vec![(b'H', parse_complete()), (b'S', window)],
    )
    .await;

    let mut conn = Connection::connect_with(server.config()).await.unwrap();

    let mut stream = pgstream::query("SELECT v FROM t", &mut conn).fetch();
    let first = stream.next().await.unwrap().unwrap();
    assert_eq!(first.try_get::<_, i32>(0).unwrap(), 1);

    let second = stream.next().await.unwrap().unwrap();
    assert!(second.try_get::<_, i32>(0).is_err());
}

#[tokio::test]
async fn simple_query_streams_multiple_statements() {
    let response = [
        row_description("v", 23),
        data_row(&[Some(&b"1"[..])]),
        command_complete("SELECT 1"),
        command_complete("UPDATE 3"),
        ready(b'I'),
    ]
    .concat();

    let server = MockServer::start(startup_ok(b'I'), vec![(b'Q', response)]).await;

    let mut conn = Connection::connect_with(server.config()).await.unwrap();

    let mut stream = pgstream::simple_query("SELECT 1; UPDATE t SET x = 0", &mut conn);
    let mut rows = 0;
    while let Some(row) = stream.next().await {
        row.unwrap();
        rows += 1;
    }
    assert_eq!(rows, 1);
    assert_eq!(stream.rows_affected(), 4);
}

#[tokio::test]
async fn transaction_facade_is_driven_by_reported_status() {
    let begin_response = [command_complete("BEGIN"), ready(b'T')].concat();
    let savepoint_response = [command_complete("SAVEPOINT"), ready(b'T')].concat();
    let commit_response = [command_complete("COMMIT"), ready(b'I')].concat();

    let server = MockServer::start(
        startup_ok(b'I'),
        vec![
            (b'Q', begin_response),
            (b'Q', savepoint_response),
            (b'Q', commit_response),
        ],
    )
    .await;

    let mut conn = Connection::connect_with(server.config()).await.unwrap();

    let mut tx = pgstream::begin(&mut conn).await.unwrap();
    tx.savepoint("before_risky").await.unwrap();
    tx.commit().await.unwrap();
    assert_eq!(conn.transaction_status(), TransactionStatus::Idle);

    // BEGIN, SAVEPOINT and COMMIT, nothing more
    assert_eq!(server.sent_tags(), [b'Q', b'Q', b'Q']);
    let savepoint = &server.sent()[1];
    assert_eq!(savepoint.1, b"SAVEPOINT \"before_risky\"\0");
}

#[tokio::test]
async fn cancel_request_is_sixteen_bytes_on_a_fresh_connection() {
    let server = MockServer::start(startup_ok(b'I'), vec![]).await;

    let conn = Connection::connect_with(server.config()).await.unwrap();
    assert_eq!(conn.transaction_status(), TransactionStatus::Idle);

    // the token opens its own connection to the same endpoint and
    // returns without awaiting any reply
    let token = conn.cancel_token().unwrap();
    token.cancel().await.unwrap();

    let frame = loop {
        let recorded = server.side_connections.lock().unwrap().first().cloned();
        match recorded {
            Some(frame) => break frame,
            None => tokio::time::sleep(std::time::Duration::from_millis(5)).await,
        }
    };

    assert_eq!(frame.len(), 16);
    assert_eq!(&frame[..8], b"\x00\x00\x00\x10\x04\xd2\x16\x2e");
    assert_eq!(&frame[8..12], &42i32.to_be_bytes());
    assert_eq!(&frame[12..16], &77i32.to_be_bytes());

    // the exchange pipeline never saw the cancel
    assert!(server.sent_tags().is_empty());
    assert_eq!(conn.transaction_status(), TransactionStatus::Idle);
}
