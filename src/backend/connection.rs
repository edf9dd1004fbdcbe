use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_util::codec::Framed;
use tracing::{debug, error};

use crate::network::Channel;
use crate::protocol::handshake::NATIVE_PASSWORD_PLUGIN;
use crate::protocol::{
    capabilities, charset_id, is_err_packet, is_ok_packet, status, AuthSwitchRequest, CodecError,
    ErrPacket, HandshakeResponse, InitialHandshake, Packet, PacketCodec,
};

use super::credentials::Credential;
use super::registry::Backend;
use super::session::{BackendSession, SessionAttrs};

/// utf8mb4_general_ci
const DEFAULT_CHARSET_ID: u8 = 45;

/// Errors while opening a backend session
#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    #[error("Connect failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("Connect timed out")]
    Timeout,

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Backend refused authentication ({code}): {message}")]
    Auth { code: u16, message: String },

    #[error("Unsupported auth plugin: {0}")]
    UnsupportedPlugin(String),

    #[error("Backend closed the connection during handshake")]
    Closed,
}

impl From<CodecError> for ConnectError {
    fn from(e: CodecError) -> Self {
        match e {
            CodecError::Io(e) => ConnectError::Io(e),
            other => ConnectError::Protocol(other.to_string()),
        }
    }
}

/// What a new backend session is opened with
#[derive(Debug, Clone)]
pub struct ConnectParams<'a> {
    pub user: &'a str,
    pub credential: &'a Credential,
    pub charset: &'a str,
    pub database: Option<&'a str>,
    pub max_packet_size: usize,
    pub epoch: u64,
}

async fn next_packet(framed: &mut Framed<TcpStream, PacketCodec>) -> Result<Packet, ConnectError> {
    framed.next().await.ok_or(ConnectError::Closed)?.map_err(ConnectError::from)
}

/// Open and authenticate a new session against `backend`
pub async fn connect(backend: &Backend, params: ConnectParams<'_>) -> Result<BackendSession, ConnectError> {
    debug!(backend = %backend.addr, user = params.user, "Connecting to backend");

    let stream = TcpStream::connect(&backend.addr).await?;
    stream.set_nodelay(true)?;
    let mut framed = Framed::new(stream, PacketCodec::new(params.max_packet_size));

    let greeting = next_packet(&mut framed).await?;
    if is_err_packet(&greeting.payload) {
        let err = ErrPacket::parse(&greeting.payload, capabilities::CLIENT_PROTOCOL_41)
            .unwrap_or_else(|| ErrPacket::new(1040, "08004", "Connection refused"));
        return Err(ConnectError::Auth {
            code: err.error_code,
            message: err.error_message,
        });
    }
    let handshake = InitialHandshake::parse(&greeting.payload)
        .ok_or_else(|| ConnectError::Protocol("Invalid backend handshake".into()))?;

    debug!(
        backend = %backend.addr,
        server_version = %handshake.server_version,
        thread_id = handshake.connection_id,
        "Received backend handshake"
    );

    let mut caps = capabilities::DEFAULT_CAPABILITIES & handshake.capability_flags;
    if params.database.is_some() {
        caps |= capabilities::CLIENT_CONNECT_WITH_DB;
    }

    let response = HandshakeResponse {
        capability_flags: caps,
        max_packet_size: params.max_packet_size.min(u32::MAX as usize) as u32,
        character_set: charset_id(params.charset).unwrap_or(DEFAULT_CHARSET_ID),
        username: params.user.to_string(),
        auth_response: params.credential.scramble(&handshake.auth_plugin_data()),
        database: params.database.map(str::to_string),
        auth_plugin_name: NATIVE_PASSWORD_PLUGIN.to_string(),
    };
    let mut seq = greeting.sequence_id.wrapping_add(1);
    framed.send(Packet::new(seq, response.encode())).await?;

    loop {
        let reply = next_packet(&mut framed).await?;
        seq = reply.sequence_id.wrapping_add(1);
        match reply.payload.first() {
            Some(_) if is_ok_packet(&reply.payload) => break,
            Some(0xFF) => {
                let err = ErrPacket::parse(&reply.payload, caps)
                    .unwrap_or_else(|| ErrPacket::new(1045, "28000", "Access denied"));
                error!(
                    backend = %backend.addr,
                    error_code = err.error_code,
                    error_message = %err.error_message,
                    "Backend authentication failed"
                );
                return Err(ConnectError::Auth {
                    code: err.error_code,
                    message: err.error_message,
                });
            }
            Some(0xFE) => {
                let switch = AuthSwitchRequest::parse(&reply.payload)
                    .ok_or_else(|| ConnectError::Protocol("Invalid auth switch request".into()))?;
                if switch.plugin_name != NATIVE_PASSWORD_PLUGIN {
                    return Err(ConnectError::UnsupportedPlugin(switch.plugin_name));
                }
                let scramble = params.credential.scramble(&switch.plugin_data);
                framed.send(Packet::new(seq, scramble)).await?;
            }
            Some(0x01) => {
                return Err(ConnectError::UnsupportedPlugin(
                    "extra auth data (caching_sha2_password?)".into(),
                ))
            }
            _ => return Err(ConnectError::Protocol("Expected OK packet from backend".into())),
        }
    }

    debug!(backend = %backend.addr, thread_id = handshake.connection_id, "Backend authentication successful");

    let attrs = SessionAttrs {
        db: params.database.map(str::to_string),
        charset: params.charset.to_string(),
        multi_statements: caps & capabilities::CLIENT_MULTI_STATEMENTS != 0,
        autocommit: handshake.status_flags & status::SERVER_STATUS_AUTOCOMMIT != 0
            || handshake.status_flags == 0,
    };

    let parts = framed.into_parts();
    let channel = Channel::with_buffer(
        Box::new(parts.io),
        backend.addr.clone(),
        params.max_packet_size,
        parts.read_buf,
    );

    Ok(BackendSession::new(
        backend.id,
        backend.addr.clone(),
        params.user,
        channel,
        handshake.connection_id,
        caps,
        attrs,
        params.epoch,
    ))
}
