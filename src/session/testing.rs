//! Whole-connection tests against scripted in-process MySQL servers.
//!
//! [`MockBackend`] speaks just enough of the server side of the protocol to
//! accept pooled sessions and answer queries from a script, recording every
//! statement it receives. [`TestClient`] is the client side.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::Framed;

use super::{handle_connection, ConnContext, ProxyState};
use crate::backend::{BackendSession, BackendState, Credential, SessionAttrs};
use crate::config::{BackendConfig, BackendInitialState, BackendRole, Config, ProxyMode, UserConfig};
use crate::metrics::Metrics;
use crate::network::Channel;
use crate::protocol::capabilities::{
    CLIENT_COMPRESS, CLIENT_CONNECT_WITH_DB, CLIENT_PROTOCOL_41, CLIENT_SSL, DEFAULT_CAPABILITIES,
};
use crate::protocol::handshake::NATIVE_PASSWORD_PLUGIN;
use crate::protocol::packet::{put_lenenc_int, put_lenenc_str, read_lenenc_int};
use crate::protocol::resultset::Progress;
use crate::protocol::{
    error_codes, is_ok_packet, query_payload, status, CodecError, Command, EofPacket, ErrPacket, HandshakeResponse,
    InitialHandshake, OkPacket, Packet, PacketCodec, ResponseKind, ResultParser, ResultSummary,
};
use crate::router::ShardingRule;
use crate::xa::{MemoryTransactionLog, RecordKind};

const USER: &str = "app";
const PASSWORD: &str = "secret";
const MAX_PACKET: usize = 1 << 24;

/// Scripted answer to one query
#[derive(Debug, Clone)]
pub enum Reply {
    Ok,
    /// Single-column text result set
    Rows(Vec<String>),
    Err(u16, &'static str),
    /// Answer after a pause
    Slow(u64, Box<Reply>),
    /// Result set cut off before its final EOF, then the connection drops
    Truncated(Vec<String>),
}

type Script = Arc<dyn Fn(&str) -> Reply + Send + Sync>;

pub struct MockBackend {
    pub addr: SocketAddr,
    statements: Arc<Mutex<Vec<String>>>,
    connections: Arc<AtomicUsize>,
}

impl MockBackend {
    pub async fn start(script: impl Fn(&str) -> Reply + Send + Sync + 'static) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let statements = Arc::new(Mutex::new(Vec::new()));
        let connections = Arc::new(AtomicUsize::new(0));
        let script: Script = Arc::new(script);

        let (log, count) = (statements.clone(), connections.clone());
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let thread_id = count.fetch_add(1, Ordering::SeqCst) as u32 + 1;
                let (script, log) = (script.clone(), log.clone());
                tokio::spawn(async move {
                    let _ = serve(stream, thread_id, script, log).await;
                });
            }
        });

        Self {
            addr,
            statements,
            connections,
        }
    }

    /// Every statement received, in arrival order
    pub fn statements(&self) -> Vec<String> {
        self.statements.lock().clone()
    }

    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }
}

fn column_def(name: &str) -> Bytes {
    let mut out = BytesMut::new();
    for part in ["def", "test", "t", "t", name, name] {
        put_lenenc_str(&mut out, part.as_bytes());
    }
    out.extend_from_slice(&[0x0c, 0x21, 0, 0xff, 0, 0, 0, 0xfd, 0, 0, 0, 0, 0]);
    out.freeze()
}

fn encode_reply(reply: Reply, status_flags: u16) -> Vec<Bytes> {
    match reply {
        Reply::Ok => vec![OkPacket::with_status(status_flags).encode(CLIENT_PROTOCOL_41)],
        Reply::Err(code, message) => vec![ErrPacket::new(code, "HY000", message).encode(CLIENT_PROTOCOL_41)],
        Reply::Rows(rows) => {
            let mut count = BytesMut::new();
            put_lenenc_int(&mut count, 1);
            let mut out = vec![count.freeze(), column_def("c"), EofPacket::new(status_flags).encode()];
            for row in rows {
                let mut payload = BytesMut::new();
                put_lenenc_str(&mut payload, row.as_bytes());
                out.push(payload.freeze());
            }
            out.push(EofPacket::new(status_flags).encode());
            out
        }
        Reply::Slow(_, inner) => encode_reply(*inner, status_flags),
        Reply::Truncated(rows) => {
            let mut out = encode_reply(Reply::Rows(rows), status_flags);
            out.pop();
            out
        }
    }
}

async fn serve(
    stream: TcpStream,
    thread_id: u32,
    script: Script,
    log: Arc<Mutex<Vec<String>>>,
) -> Result<(), CodecError> {
    let mut framed = Framed::new(stream, PacketCodec::new(MAX_PACKET));
    let greeting = InitialHandshake::new(thread_id, "8.0.36-mock", 45);
    framed.send(Packet::new(0, greeting.encode())).await?;
    let Some(response) = framed.next().await.transpose()? else {
        return Ok(());
    };
    let ok = OkPacket::new().encode(CLIENT_PROTOCOL_41);
    framed.send(Packet::new(response.sequence_id.wrapping_add(1), ok)).await?;

    let (mut in_transaction, mut autocommit) = (false, true);
    while let Some(packet) = framed.next().await.transpose()? {
        let Some(&code) = packet.payload.first() else {
            break;
        };
        let status_of = |in_transaction: bool, autocommit: bool| {
            let mut flags = 0;
            if in_transaction {
                flags |= status::SERVER_STATUS_IN_TRANS;
            }
            if autocommit {
                flags |= status::SERVER_STATUS_AUTOCOMMIT;
            }
            flags
        };
        let mut hang_up = false;
        let replies = match Command::from(code) {
            Command::Quit => break,
            Command::Query => {
                let sql = String::from_utf8_lossy(&packet.payload[1..]).to_string();
                log.lock().push(sql.clone());
                let mut reply = script(&sql);
                if let Reply::Slow(ms, inner) = reply.clone() {
                    tokio::time::sleep(Duration::from_millis(ms)).await;
                    reply = *inner;
                }
                hang_up = matches!(reply, Reply::Truncated(_));
                if !matches!(reply, Reply::Err(..)) {
                    let upper = sql.to_ascii_uppercase();
                    if upper.starts_with("BEGIN") || upper.starts_with("START TRANSACTION") || upper.starts_with("XA START") {
                        in_transaction = true;
                    } else if upper.starts_with("COMMIT")
                        || upper.starts_with("ROLLBACK")
                        || upper.starts_with("XA COMMIT")
                        || upper.starts_with("XA ROLLBACK")
                    {
                        in_transaction = false;
                    } else if upper.starts_with("SET AUTOCOMMIT=") {
                        autocommit = upper.ends_with('1');
                    }
                }
                encode_reply(reply, status_of(in_transaction, autocommit))
            }
            Command::SetOption => {
                log.lock().push(format!("SET_OPTION {}", packet.payload.get(1).copied().unwrap_or(0)));
                vec![EofPacket::new(status_of(in_transaction, autocommit)).encode()]
            }
            Command::InitDb => {
                log.lock().push(format!("INIT_DB {}", String::from_utf8_lossy(&packet.payload[1..])));
                encode_reply(Reply::Ok, status_of(in_transaction, autocommit))
            }
            _ => encode_reply(Reply::Ok, status_of(in_transaction, autocommit)),
        };

        let mut id = packet.sequence_id.wrapping_add(1);
        for payload in replies {
            framed.send(Packet::new(id, payload)).await?;
            id = id.wrapping_add(1);
        }
        if hang_up {
            break;
        }
    }
    Ok(())
}

/// Client side of a proxy connection
pub struct TestClient {
    framed: Framed<TcpStream, PacketCodec>,
}

/// A complete response as the client saw it
#[derive(Debug)]
pub struct Response {
    pub packets: Vec<Packet>,
    pub summary: ResultSummary,
}

impl Response {
    /// First column of every row of a single text result set
    pub fn rows(&self) -> Vec<String> {
        let Some((columns, _)) = self.packets.first().and_then(|p| read_lenenc_int(&p.payload)) else {
            return Vec::new();
        };
        let first_row = columns as usize + 2;
        if self.packets.len() <= first_row {
            return Vec::new();
        }
        self.packets[first_row..self.packets.len() - 1]
            .iter()
            .map(|p| {
                let (len, used) = read_lenenc_int(&p.payload).unwrap();
                String::from_utf8_lossy(&p.payload[used..used + len as usize]).to_string()
            })
            .collect()
    }

    pub fn error_code(&self) -> Option<u16> {
        self.summary.error().map(|e| e.error_code)
    }
}

impl TestClient {
    /// Send `sql` and collect frames until the proxy closes the connection
    pub async fn query_until_closed(&mut self, sql: &str) -> Vec<Packet> {
        self.framed.send(Packet::new(0, query_payload(sql))).await.unwrap();
        let mut packets = Vec::new();
        loop {
            let next = tokio::time::timeout(Duration::from_secs(5), self.framed.next())
                .await
                .expect("proxy kept the connection open");
            match next {
                Some(Ok(packet)) => packets.push(packet),
                Some(Err(_)) | None => return packets,
            }
        }
    }

    pub async fn connect(addr: SocketAddr, database: Option<&str>) -> Self {
        let stream = TcpStream::connect(addr).await.unwrap();
        let mut framed = Framed::new(stream, PacketCodec::new(MAX_PACKET));
        let greeting = framed.next().await.unwrap().unwrap();
        let handshake = InitialHandshake::parse(&greeting.payload).unwrap();

        let mut caps = DEFAULT_CAPABILITIES;
        if database.is_some() {
            caps |= CLIENT_CONNECT_WITH_DB;
        }
        let response = HandshakeResponse {
            capability_flags: caps,
            max_packet_size: MAX_PACKET as u32,
            character_set: 45,
            username: USER.to_string(),
            auth_response: Credential::from_password(PASSWORD).scramble(&handshake.auth_plugin_data()),
            database: database.map(str::to_string),
            auth_plugin_name: NATIVE_PASSWORD_PLUGIN.to_string(),
        };
        framed.send(Packet::new(1, response.encode())).await.unwrap();
        let reply = framed.next().await.unwrap().unwrap();
        assert!(is_ok_packet(&reply.payload), "authentication failed");
        Self { framed }
    }

    pub async fn query(&mut self, sql: &str) -> Response {
        self.framed.send(Packet::new(0, query_payload(sql))).await.unwrap();
        let mut parser = ResultParser::new(ResponseKind::Query);
        let mut packets = Vec::new();
        loop {
            let packet = tokio::time::timeout(Duration::from_secs(5), self.framed.next())
                .await
                .expect("response timed out")
                .expect("proxy closed the connection")
                .unwrap();
            let progress = parser.feed(&packet).unwrap();
            packets.push(packet);
            if progress == Progress::Finished {
                break;
            }
        }
        Response {
            packets,
            summary: parser.into_summary(),
        }
    }
}

/// A proxy listening on an ephemeral port
pub struct TestProxy {
    pub addr: SocketAddr,
    pub state: Arc<ProxyState>,
    pub xa_log: Arc<MemoryTransactionLog>,
}

impl TestProxy {
    pub async fn start(config: Config) -> Self {
        let xa_log = Arc::new(MemoryTransactionLog::new());
        let metrics = Arc::new(Metrics::new().unwrap());
        let state = Arc::new(ProxyState::build(Arc::new(config), metrics, xa_log.clone()));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let proxy = state.clone();
        tokio::spawn(async move {
            let next_id = AtomicU32::new(1);
            while let Ok((stream, peer)) = listener.accept().await {
                let conn_id = next_id.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(handle_connection(proxy.clone(), stream, conn_id, peer));
            }
        });

        Self { addr, state, xa_log }
    }

    /// Wait until the pool holds `n` idle sessions
    pub async fn await_idle(&self, n: usize) {
        for _ in 0..200 {
            if self.state.pool.idle_count() == n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("pool never reached {} idle sessions", n);
    }
}

pub fn config(mode: ProxyMode, backends: &[(&MockBackend, &str)]) -> Config {
    let mut config = Config {
        mode,
        users: vec![UserConfig {
            name: USER.to_string(),
            password: PASSWORD.to_string(),
        }],
        backends: backends
            .iter()
            .map(|(backend, group)| BackendConfig {
                addr: backend.addr.to_string(),
                role: BackendRole::Rw,
                group: group.to_string(),
                state: BackendInitialState::Up,
            })
            .collect(),
        ..Config::default()
    };
    config.health.enabled = false;
    config
}

fn sharded_on_id(groups: &[&str]) -> ShardingRule {
    ShardingRule {
        name: "t_by_id".to_string(),
        table_pattern: "t".to_string(),
        shard_column: "id".to_string(),
        algorithm: "mod".to_string(),
        range_boundaries: vec![],
        groups: groups.iter().map(|g| g.to_string()).collect(),
    }
}

#[tokio::test]
async fn test_single_backend_select_roundtrip() {
    let backend = MockBackend::start(|sql| match sql {
        "SELECT 1" => Reply::Rows(vec!["1".to_string()]),
        _ => Reply::Ok,
    })
    .await;
    let proxy = TestProxy::start(config(ProxyMode::Proxy, &[(&backend, "default")])).await;

    let mut client = TestClient::connect(proxy.addr, None).await;
    let response = client.query("SELECT 1").await;

    assert!(response.summary.is_ok());
    assert_eq!(response.rows(), vec!["1"]);
    // column count, column, EOF, row, EOF with the backend's own ids
    let ids: Vec<u8> = response.packets.iter().map(|p| p.sequence_id).collect();
    assert_eq!(ids, vec![1, 2, 3, 4, 5]);
    assert_eq!(backend.statements(), vec!["SELECT 1"]);
    proxy.await_idle(1).await;
}

#[tokio::test]
async fn test_scatter_select_merges_all_groups() {
    let groups = ["g0", "g1", "g2"];
    let mut backends = Vec::new();
    for group in groups {
        backends.push(MockBackend::start(move |_| Reply::Rows(vec![format!("row-{}", group)])).await);
    }
    let mut config = config(
        ProxyMode::Shard,
        &[(&backends[0], "g0"), (&backends[1], "g1"), (&backends[2], "g2")],
    );
    config.sharding = vec![sharded_on_id(&groups)];
    let proxy = TestProxy::start(config).await;

    let mut client = TestClient::connect(proxy.addr, None).await;
    let response = client.query("SELECT * FROM t").await;

    assert!(response.summary.is_ok());
    let mut rows = response.rows();
    rows.sort();
    assert_eq!(rows, vec!["row-g0", "row-g1", "row-g2"]);
    // one header for the merged result
    assert_eq!(response.packets.len(), 3 + 3 + 1);
    for backend in &backends {
        assert_eq!(backend.statements(), vec!["SELECT * FROM t"]);
    }
    proxy.await_idle(3).await;
}

#[tokio::test]
async fn test_failed_prepare_rolls_back_every_branch() {
    let healthy = MockBackend::start(|_| Reply::Ok).await;
    let failing = MockBackend::start(|sql| {
        if sql.starts_with("XA PREPARE") {
            Reply::Err(error_codes::ER_XAER_RMFAIL, "XAER_RMFAIL: cannot prepare")
        } else {
            Reply::Ok
        }
    })
    .await;
    let mut config = config(ProxyMode::Shard, &[(&healthy, "g0"), (&failing, "g1")]);
    config.sharding = vec![sharded_on_id(&["g0", "g1"])];
    config.xa.enabled = true;
    let proxy = TestProxy::start(config).await;

    let mut client = TestClient::connect(proxy.addr, None).await;
    assert!(client.query("BEGIN").await.summary.is_ok());
    assert!(client.query("INSERT INTO t (id) VALUES (1)").await.summary.is_ok());
    assert!(client.query("INSERT INTO t (id) VALUES (2)").await.summary.is_ok());
    let commit = client.query("COMMIT").await;
    assert_eq!(commit.error_code(), Some(error_codes::ER_XAER_RMFAIL));

    let phases = |backend: &MockBackend| -> Vec<String> {
        backend
            .statements()
            .iter()
            .filter(|s| s.starts_with("XA "))
            .map(|s| s.split_whitespace().take(2).collect::<Vec<_>>().join(" "))
            .collect()
    };
    let expected = vec!["XA START", "XA END", "XA PREPARE", "XA ROLLBACK"];
    assert_eq!(phases(&healthy), expected);
    assert_eq!(phases(&failing), expected);

    let mends: Vec<_> = proxy
        .xa_log
        .records()
        .into_iter()
        .filter(|r| r.kind == RecordKind::Mend)
        .collect();
    assert_eq!(mends.len(), 1);
    assert_eq!(mends[0].participants.len(), 1);
    assert!(mends[0].participants[0].starts_with(&failing.addr.to_string()));

    // The distributed transaction is over: the next write runs on its own
    assert!(client.query("INSERT INTO t (id) VALUES (3)").await.summary.is_ok());
    let statements = failing.statements();
    assert_eq!(statements.last().map(String::as_str), Some("INSERT INTO t (id) VALUES (3)"));
    assert!(statements[statements.len() - 2].starts_with("XA ROLLBACK"));
}

#[tokio::test]
async fn test_reused_session_switches_database_once() {
    let backend = MockBackend::start(|sql| {
        if sql.starts_with("SELECT") {
            Reply::Rows(vec!["x".to_string()])
        } else {
            Reply::Ok
        }
    })
    .await;
    let proxy = TestProxy::start(config(ProxyMode::Proxy, &[(&backend, "default")])).await;

    let mut first = TestClient::connect(proxy.addr, Some("shop")).await;
    assert!(first.query("SELECT 1").await.summary.is_ok());
    proxy.await_idle(1).await;

    let mut second = TestClient::connect(proxy.addr, Some("billing")).await;
    assert!(second.query("SELECT 2").await.summary.is_ok());

    assert_eq!(backend.connections(), 1);
    assert_eq!(backend.statements(), vec!["SELECT 1", "USE `billing`", "SELECT 2"]);
}

#[tokio::test]
async fn test_pool_exhaustion_gives_up_after_retries() {
    let backend = MockBackend::start(|sql| {
        if sql.starts_with("SELECT") {
            Reply::Rows(vec!["1".to_string()])
        } else {
            Reply::Ok
        }
    })
    .await;
    let mut config = config(ProxyMode::Proxy, &[(&backend, "default")]);
    config.pool.max_conns_per_backend = 1;
    config.pool.retry_max_attempts = 3;
    config.pool.retry_base_delay_ms = 5;
    config.pool.retry_step_ms = 5;
    config.pool.retry_max_delay_ms = 20;
    let proxy = TestProxy::start(config).await;

    // Holds the only session inside a transaction
    let mut holder = TestClient::connect(proxy.addr, None).await;
    assert!(holder.query("BEGIN").await.summary.is_ok());
    assert!(holder.query("SELECT 1").await.summary.is_ok());

    let mut waiter = TestClient::connect(proxy.addr, None).await;
    let response = waiter.query("SELECT 1").await;
    assert_eq!(response.error_code(), Some(error_codes::ER_CON_COUNT_ERROR));
    assert_eq!(proxy.state.metrics.pool_exhausted_total.get(), 1);
    assert_eq!(backend.connections(), 1);

    // The holder's transaction is untouched
    assert!(holder.query("COMMIT").await.summary.is_ok());
    assert_eq!(backend.statements(), vec!["START TRANSACTION", "SELECT 1", "COMMIT"]);
}

#[tokio::test]
async fn test_refresh_closes_pooled_sessions() {
    let backend = MockBackend::start(|sql| match sql {
        "SELECT 1" => Reply::Rows(vec!["1".to_string()]),
        _ => Reply::Ok,
    })
    .await;
    let proxy = TestProxy::start(config(ProxyMode::Proxy, &[(&backend, "default")])).await;

    let mut client = TestClient::connect(proxy.addr, None).await;
    assert!(client.query("SELECT 1").await.summary.is_ok());
    proxy.await_idle(1).await;

    assert_eq!(proxy.state.pool.refresh(), 1);
    assert_eq!(proxy.state.pool.idle_count(), 0);

    assert!(client.query("SELECT 1").await.summary.is_ok());
    assert_eq!(backend.connections(), 2);
    proxy.await_idle(1).await;
}

/// Send a handshake response with extra capability bits and return the reply
async fn handshake_with(addr: SocketAddr, extra_caps: u32, ssl_request_only: bool) -> Packet {
    let stream = TcpStream::connect(addr).await.unwrap();
    let mut framed = Framed::new(stream, PacketCodec::new(MAX_PACKET));
    let greeting = framed.next().await.unwrap().unwrap();
    let handshake = InitialHandshake::parse(&greeting.payload).unwrap();

    let caps = DEFAULT_CAPABILITIES | extra_caps;
    let payload = if ssl_request_only {
        let mut short = BytesMut::zeroed(32);
        short[..4].copy_from_slice(&caps.to_le_bytes());
        short[4..8].copy_from_slice(&(MAX_PACKET as u32).to_le_bytes());
        short[8] = 45;
        short.freeze()
    } else {
        HandshakeResponse {
            capability_flags: caps,
            max_packet_size: MAX_PACKET as u32,
            character_set: 45,
            username: USER.to_string(),
            auth_response: Credential::from_password(PASSWORD).scramble(&handshake.auth_plugin_data()),
            database: None,
            auth_plugin_name: NATIVE_PASSWORD_PLUGIN.to_string(),
        }
        .encode()
    };
    framed.send(Packet::new(1, payload)).await.unwrap();
    tokio::time::timeout(Duration::from_secs(5), framed.next())
        .await
        .expect("no reply to handshake")
        .expect("proxy closed without a reply")
        .unwrap()
}

#[tokio::test]
async fn test_tls_and_compression_requests_are_refused() {
    let backend = MockBackend::start(|_| Reply::Ok).await;
    let proxy = TestProxy::start(config(ProxyMode::Proxy, &[(&backend, "default")])).await;

    let reply = handshake_with(proxy.addr, CLIENT_SSL, true).await;
    let err = ErrPacket::parse(&reply.payload, CLIENT_PROTOCOL_41).expect("expected an error packet");
    assert_eq!(err.error_code, error_codes::ER_ACCESS_DENIED_ERROR);

    let reply = handshake_with(proxy.addr, CLIENT_COMPRESS, false).await;
    let err = ErrPacket::parse(&reply.payload, CLIENT_PROTOCOL_41).expect("expected an error packet");
    assert_eq!(err.error_code, error_codes::ER_ACCESS_DENIED_ERROR);

    // a plain client still gets in
    let mut client = TestClient::connect(proxy.addr, None).await;
    assert!(client.query("SELECT 1").await.summary.is_ok());
}

#[tokio::test]
async fn test_idle_timeout_follows_connection_state() {
    let backend = MockBackend::start(|_| Reply::Ok).await;
    let mut config = config(ProxyMode::Proxy, &[(&backend, "default")]);
    config.timeouts.client_idle_ms = 1000;
    config.timeouts.short_wait_ms = 10;
    config.timeouts.maintained_client_idle_ms = 2000;
    config.timeouts.incomplete_tran_idle_ms = 3000;
    let state = Arc::new(ProxyState::build(
        Arc::new(config),
        Arc::new(Metrics::new().unwrap()),
        Arc::new(MemoryTransactionLog::new()),
    ));
    let (a, _b) = tokio::io::duplex(64);
    let mut ctx = ConnContext::new(state.clone(), 1, Channel::new(Box::new(a), "client", MAX_PACKET));
    let ms = Duration::from_millis;

    assert_eq!(ctx.idle_timeout(), ms(1000));

    // right after BEGIN
    ctx.in_transaction = true;
    ctx.is_start_tran_command = true;
    assert_eq!(ctx.idle_timeout(), ms(10));

    // nothing followed BEGIN: back to plain autocommit
    ctx.expire_short_wait();
    assert!(!ctx.in_transaction);
    assert!(ctx.attrs.autocommit);
    assert_eq!(ctx.idle_timeout(), ms(1000));

    ctx.attrs.autocommit = false;
    assert_eq!(ctx.idle_timeout(), ms(3000));
    ctx.attrs.autocommit = true;

    let registered = state.pool.registry().get(0).unwrap().clone();
    registered.set_state(BackendState::Maintaining);
    let (c, _d) = tokio::io::duplex(64);
    ctx.sessions.push(BackendSession::new(
        0,
        backend.addr.to_string(),
        USER,
        Channel::new(Box::new(c), "backend", MAX_PACKET),
        1,
        CLIENT_PROTOCOL_41,
        SessionAttrs::default(),
        0,
    ));
    assert_eq!(ctx.idle_timeout(), ms(2000));
}

#[tokio::test]
async fn test_begin_without_statement_falls_back_to_autocommit() {
    let backend = MockBackend::start(|sql| match sql {
        "SELECT 1" => Reply::Rows(vec!["1".to_string()]),
        _ => Reply::Ok,
    })
    .await;
    let mut config = config(ProxyMode::Proxy, &[(&backend, "default")]);
    config.timeouts.short_wait_ms = 50;
    let proxy = TestProxy::start(config).await;

    let mut client = TestClient::connect(proxy.addr, None).await;
    let begin = client.query("BEGIN").await;
    assert_ne!(begin.summary.server_status & status::SERVER_STATUS_IN_TRANS, 0);

    tokio::time::sleep(Duration::from_millis(200)).await;
    let response = client.query("SELECT 1").await;
    assert!(response.summary.is_ok());
    assert_eq!(response.summary.server_status & status::SERVER_STATUS_IN_TRANS, 0);
    assert_eq!(backend.statements(), vec!["SELECT 1"]);
    // not bound to a transaction, so the session goes back to the pool
    proxy.await_idle(1).await;
}

#[tokio::test]
async fn test_streamed_scatter_select_delivers_every_row() {
    let groups = ["g0", "g1"];
    let mut backends = Vec::new();
    for group in groups {
        backends.push(
            MockBackend::start(move |_| Reply::Rows((0..20).map(|i| format!("{}-{}", group, i)).collect())).await,
        );
    }
    let mut config = config(ProxyMode::Shard, &[(&backends[0], "g0"), (&backends[1], "g1")]);
    config.sharding = vec![sharded_on_id(&groups)];
    config.streaming.tcp_stream = true;
    config.streaming.header_size_threshold = 1;
    config.streaming.stream_threshold_bytes = 64;
    let proxy = TestProxy::start(config).await;

    let mut client = TestClient::connect(proxy.addr, None).await;
    let response = client.query("SELECT * FROM t").await;

    assert!(response.summary.is_ok());
    assert_eq!(response.rows().len(), 40);
    // one header, then rows, then the final EOF, numbered without gaps
    assert_eq!(response.packets.len(), 3 + 40 + 1);
    for (i, packet) in response.packets.iter().enumerate() {
        assert_eq!(packet.sequence_id as usize, i + 1);
    }
    proxy.await_idle(2).await;
}

#[tokio::test]
async fn test_streamed_merge_error_after_output_closes_connection() {
    let fast = MockBackend::start(|_| Reply::Rows(vec!["a".to_string(), "b".to_string()])).await;
    let slow = MockBackend::start(|_| {
        Reply::Slow(200, Box::new(Reply::Err(error_codes::ER_UNKNOWN_ERROR, "shard failed")))
    })
    .await;
    let mut config = config(ProxyMode::Shard, &[(&fast, "g0"), (&slow, "g1")]);
    config.sharding = vec![sharded_on_id(&["g0", "g1"])];
    config.streaming.tcp_stream = true;
    config.streaming.header_size_threshold = 1;
    let proxy = TestProxy::start(config).await;

    let mut client = TestClient::connect(proxy.addr, None).await;
    let packets = client.query_until_closed("SELECT * FROM t").await;

    // the first shard's rows went out before the failure; no ERR follows them
    assert!(packets.len() >= 3);
    assert!(packets.iter().all(|p| p.payload.first() != Some(&0xff)));
    assert_eq!(proxy.state.metrics.merge_failures_total.get(), 1);
}

#[tokio::test]
async fn test_backend_lost_mid_stream_closes_connection() {
    let backend = MockBackend::start(|sql| match sql {
        "SELECT big" => Reply::Truncated((0..10).map(|i| i.to_string()).collect()),
        _ => Reply::Ok,
    })
    .await;
    let mut config = config(ProxyMode::Proxy, &[(&backend, "default")]);
    config.streaming.fast_stream = true;
    config.streaming.stream_threshold_bytes = 1;
    let proxy = TestProxy::start(config).await;

    let mut client = TestClient::connect(proxy.addr, None).await;
    let packets = client.query_until_closed("SELECT big").await;

    assert!(!packets.is_empty());
    assert!(packets.iter().all(|p| p.payload.first() != Some(&0xff)));
    // the broken session is never pooled
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(proxy.state.pool.idle_count(), 0);
}
