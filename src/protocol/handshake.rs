use bytes::{Buf, BufMut, Bytes, BytesMut};
use rand::Rng;
use sha1::{Digest, Sha1};

use super::packet::{capabilities::*, put_lenenc_int, read_lenenc_int, status, Packet};

pub const NATIVE_PASSWORD_PLUGIN: &str = "mysql_native_password";

/// MySQL initial handshake packet (server -> client)
#[derive(Debug, Clone)]
pub struct InitialHandshake {
    pub protocol_version: u8,
    pub server_version: String,
    pub connection_id: u32,
    pub auth_plugin_data_part1: [u8; 8],
    pub capability_flags: u32,
    pub character_set: u8,
    pub status_flags: u16,
    pub auth_plugin_data_part2: Vec<u8>,
    pub auth_plugin_name: String,
}

impl InitialHandshake {
    /// Create the greeting the proxy sends to a new client
    pub fn new(connection_id: u32, server_version: &str, character_set: u8) -> Self {
        let mut rng = rand::thread_rng();
        // Printable scramble bytes: part 2 is NUL terminated on the wire
        let mut auth_data1 = [0u8; 8];
        for b in auth_data1.iter_mut() {
            *b = rng.gen_range(33..127);
        }
        let auth_data2: Vec<u8> = (0..12).map(|_| rng.gen_range(33..127)).collect();

        Self {
            protocol_version: 10,
            server_version: server_version.to_string(),
            connection_id,
            auth_plugin_data_part1: auth_data1,
            capability_flags: DEFAULT_CAPABILITIES,
            character_set,
            status_flags: status::SERVER_STATUS_AUTOCOMMIT,
            auth_plugin_data_part2: auth_data2,
            auth_plugin_name: NATIVE_PASSWORD_PLUGIN.to_string(),
        }
    }

    /// Get full auth plugin data (20 bytes)
    pub fn auth_plugin_data(&self) -> Vec<u8> {
        let mut data = Vec::with_capacity(20);
        data.extend_from_slice(&self.auth_plugin_data_part1);
        data.extend_from_slice(&self.auth_plugin_data_part2);
        data
    }

    /// Encode the greeting payload
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();

        buf.put_u8(self.protocol_version);

        // Server version (null-terminated)
        buf.extend_from_slice(self.server_version.as_bytes());
        buf.put_u8(0);

        buf.put_u32_le(self.connection_id);
        buf.extend_from_slice(&self.auth_plugin_data_part1);
        // Filler
        buf.put_u8(0);

        buf.put_u16_le((self.capability_flags & 0xFFFF) as u16);
        buf.put_u8(self.character_set);
        buf.put_u16_le(self.status_flags);
        buf.put_u16_le(((self.capability_flags >> 16) & 0xFFFF) as u16);

        if self.capability_flags & CLIENT_PLUGIN_AUTH != 0 {
            buf.put_u8((self.auth_plugin_data_part1.len() + self.auth_plugin_data_part2.len() + 1) as u8);
        } else {
            buf.put_u8(0);
        }

        // Reserved (10 bytes)
        buf.extend_from_slice(&[0u8; 10]);

        if self.capability_flags & CLIENT_SECURE_CONNECTION != 0 {
            buf.extend_from_slice(&self.auth_plugin_data_part2);
            buf.put_u8(0);
        }

        if self.capability_flags & CLIENT_PLUGIN_AUTH != 0 {
            buf.extend_from_slice(self.auth_plugin_name.as_bytes());
            buf.put_u8(0);
        }

        buf.freeze()
    }

    /// Parse a backend greeting
    pub fn parse(payload: &[u8]) -> Option<Self> {
        if payload.len() < 32 {
            return None;
        }

        let mut buf = payload;

        let protocol_version = buf.get_u8();

        let null_pos = buf.iter().position(|&b| b == 0)?;
        let server_version = String::from_utf8_lossy(&buf[..null_pos]).to_string();
        buf.advance(null_pos + 1);

        if buf.remaining() < 31 {
            return None;
        }

        let connection_id = buf.get_u32_le();

        let mut auth_plugin_data_part1 = [0u8; 8];
        auth_plugin_data_part1.copy_from_slice(&buf[..8]);
        buf.advance(8);

        // Filler
        buf.advance(1);

        let capability_flags_lower = buf.get_u16_le() as u32;
        let character_set = buf.get_u8();
        let status_flags = buf.get_u16_le();
        let capability_flags_upper = buf.get_u16_le() as u32;
        let capability_flags = capability_flags_lower | (capability_flags_upper << 16);

        let auth_plugin_data_len = buf.get_u8();

        // Reserved
        buf.advance(10);

        let mut auth_plugin_data_part2 = Vec::new();
        if capability_flags & CLIENT_SECURE_CONNECTION != 0 {
            let len = std::cmp::max(13, (auth_plugin_data_len as usize).saturating_sub(8)).min(buf.len());
            let data_len = buf.iter().take(len).position(|&b| b == 0).unwrap_or(len);
            auth_plugin_data_part2.extend_from_slice(&buf[..data_len]);
            buf.advance(len);
        }

        let auth_plugin_name = if capability_flags & CLIENT_PLUGIN_AUTH != 0 && !buf.is_empty() {
            let null_pos = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
            String::from_utf8_lossy(&buf[..null_pos]).to_string()
        } else {
            NATIVE_PASSWORD_PLUGIN.to_string()
        };

        Some(Self {
            protocol_version,
            server_version,
            connection_id,
            auth_plugin_data_part1,
            capability_flags,
            character_set,
            status_flags,
            auth_plugin_data_part2,
            auth_plugin_name,
        })
    }
}

/// MySQL handshake response packet (client -> server)
#[derive(Debug, Clone)]
pub struct HandshakeResponse {
    pub capability_flags: u32,
    pub max_packet_size: u32,
    pub character_set: u8,
    pub username: String,
    pub auth_response: Vec<u8>,
    pub database: Option<String>,
    pub auth_plugin_name: String,
}

impl HandshakeResponse {
    /// A 32 byte response carrying CLIENT_SSL is a TLS upgrade request
    pub fn is_ssl_request(payload: &[u8]) -> bool {
        payload.len() == 32 && {
            let caps = u32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]);
            caps & CLIENT_SSL != 0
        }
    }

    /// Parse from packet payload
    pub fn parse(payload: &[u8]) -> Option<Self> {
        if payload.len() < 33 {
            return None;
        }

        let mut buf = payload;

        let capability_flags = buf.get_u32_le();
        let max_packet_size = buf.get_u32_le();
        let character_set = buf.get_u8();

        // Reserved (23 bytes)
        buf.advance(23);

        let null_pos = buf.iter().position(|&b| b == 0)?;
        let username = String::from_utf8_lossy(&buf[..null_pos]).to_string();
        buf.advance(null_pos + 1);

        let auth_response = if capability_flags & CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA != 0 {
            let (len, used) = read_lenenc_int(buf)?;
            let len = len as usize;
            if buf.len() < used + len {
                return None;
            }
            let data = buf[used..used + len].to_vec();
            buf.advance(used + len);
            data
        } else if capability_flags & CLIENT_SECURE_CONNECTION != 0 {
            if buf.is_empty() {
                return None;
            }
            let len = buf.get_u8() as usize;
            if buf.len() < len {
                return None;
            }
            let data = buf[..len].to_vec();
            buf.advance(len);
            data
        } else {
            let null_pos = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
            let data = buf[..null_pos].to_vec();
            buf.advance((null_pos + 1).min(buf.len()));
            data
        };

        let database = if capability_flags & CLIENT_CONNECT_WITH_DB != 0 && !buf.is_empty() {
            let null_pos = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
            let db = String::from_utf8_lossy(&buf[..null_pos]).to_string();
            buf.advance((null_pos + 1).min(buf.len()));
            if db.is_empty() {
                None
            } else {
                Some(db)
            }
        } else {
            None
        };

        let auth_plugin_name = if capability_flags & CLIENT_PLUGIN_AUTH != 0 && !buf.is_empty() {
            let null_pos = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
            String::from_utf8_lossy(&buf[..null_pos]).to_string()
        } else {
            NATIVE_PASSWORD_PLUGIN.to_string()
        };

        Some(Self {
            capability_flags,
            max_packet_size,
            character_set,
            username,
            auth_response,
            database,
            auth_plugin_name,
        })
    }

    /// Encode the response payload
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();

        buf.put_u32_le(self.capability_flags);
        buf.put_u32_le(self.max_packet_size);
        buf.put_u8(self.character_set);

        // Reserved (23 bytes)
        buf.extend_from_slice(&[0u8; 23]);

        buf.extend_from_slice(self.username.as_bytes());
        buf.put_u8(0);

        if self.capability_flags & CLIENT_SECURE_CONNECTION != 0 {
            buf.put_u8(self.auth_response.len() as u8);
            buf.extend_from_slice(&self.auth_response);
        } else {
            buf.extend_from_slice(&self.auth_response);
            buf.put_u8(0);
        }

        if self.capability_flags & CLIENT_CONNECT_WITH_DB != 0 {
            if let Some(ref db) = self.database {
                buf.extend_from_slice(db.as_bytes());
            }
            buf.put_u8(0);
        }

        if self.capability_flags & CLIENT_PLUGIN_AUTH != 0 {
            buf.extend_from_slice(self.auth_plugin_name.as_bytes());
            buf.put_u8(0);
        }

        buf.freeze()
    }
}

/// Auth switch request (0xFE) sent by a server that wants another plugin
#[derive(Debug, Clone)]
pub struct AuthSwitchRequest {
    pub plugin_name: String,
    pub plugin_data: Vec<u8>,
}

impl AuthSwitchRequest {
    pub fn parse(payload: &[u8]) -> Option<Self> {
        if payload.first() != Some(&0xFE) {
            return None;
        }
        let rest = &payload[1..];
        let null_pos = rest.iter().position(|&b| b == 0)?;
        let plugin_name = String::from_utf8_lossy(&rest[..null_pos]).to_string();
        let mut plugin_data = rest[null_pos + 1..].to_vec();
        if plugin_data.last() == Some(&0) {
            plugin_data.pop();
        }
        Some(Self {
            plugin_name,
            plugin_data,
        })
    }
}

/// SHA1(password): the stage-one hash kept by the credential store
pub fn stage1_hash(password: &str) -> [u8; 20] {
    let mut hasher = Sha1::new();
    hasher.update(password.as_bytes());
    hasher.finalize().into()
}

/// Compute mysql_native_password auth response
pub fn compute_auth_response(password: &str, auth_data: &[u8]) -> Vec<u8> {
    if password.is_empty() {
        return Vec::new();
    }
    scramble_from_stage1(&stage1_hash(password), auth_data)
}

/// SHA1(password) XOR SHA1(auth_data + SHA1(SHA1(password)))
pub fn scramble_from_stage1(stage1: &[u8; 20], auth_data: &[u8]) -> Vec<u8> {
    let mut hasher = Sha1::new();
    hasher.update(stage1);
    let stage2 = hasher.finalize();

    let mut hasher = Sha1::new();
    hasher.update(auth_data);
    hasher.update(stage2);
    let mask = hasher.finalize();

    stage1.iter().zip(mask.iter()).map(|(a, b)| a ^ b).collect()
}

/// Check a client's scramble against the stored stage-one hash.
///
/// `None` means the account has an empty password.
pub fn verify_auth_response(stage1: Option<&[u8; 20]>, auth_data: &[u8], response: &[u8]) -> bool {
    match stage1 {
        None => response.is_empty(),
        Some(stage1) => {
            response.len() == 20 && scramble_from_stage1(stage1, auth_data) == response
        }
    }
}

/// OK packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OkPacket {
    pub affected_rows: u64,
    pub last_insert_id: u64,
    pub status_flags: u16,
    pub warnings: u16,
}

impl OkPacket {
    pub fn new() -> Self {
        Self {
            affected_rows: 0,
            last_insert_id: 0,
            status_flags: status::SERVER_STATUS_AUTOCOMMIT,
            warnings: 0,
        }
    }

    pub fn with_status(status_flags: u16) -> Self {
        Self {
            status_flags,
            ..Self::new()
        }
    }

    pub fn encode(&self, capabilities: u32) -> Bytes {
        let mut buf = BytesMut::new();

        buf.put_u8(0x00);
        put_lenenc_int(&mut buf, self.affected_rows);
        put_lenenc_int(&mut buf, self.last_insert_id);

        if capabilities & CLIENT_PROTOCOL_41 != 0 {
            buf.put_u16_le(self.status_flags);
            buf.put_u16_le(self.warnings);
        }

        buf.freeze()
    }

    /// Parse an OK payload (protocol 4.1 layout)
    pub fn parse(payload: &[u8]) -> Option<Self> {
        if payload.first() != Some(&0x00) {
            return None;
        }
        let mut pos = 1;
        let (affected_rows, used) = read_lenenc_int(&payload[pos..])?;
        pos += used;
        let (last_insert_id, used) = read_lenenc_int(&payload[pos..])?;
        pos += used;

        let (status_flags, warnings) = if payload.len() >= pos + 4 {
            (
                u16::from_le_bytes([payload[pos], payload[pos + 1]]),
                u16::from_le_bytes([payload[pos + 2], payload[pos + 3]]),
            )
        } else {
            (0, 0)
        };

        Some(Self {
            affected_rows,
            last_insert_id,
            status_flags,
            warnings,
        })
    }
}

impl Default for OkPacket {
    fn default() -> Self {
        Self::new()
    }
}

/// EOF packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EofPacket {
    pub warnings: u16,
    pub status_flags: u16,
}

impl EofPacket {
    pub fn new(status_flags: u16) -> Self {
        Self {
            warnings: 0,
            status_flags,
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(5);
        buf.put_u8(0xFE);
        buf.put_u16_le(self.warnings);
        buf.put_u16_le(self.status_flags);
        buf.freeze()
    }

    pub fn parse(payload: &[u8]) -> Option<Self> {
        if !is_eof_packet(payload) {
            return None;
        }
        if payload.len() >= 5 {
            Some(Self {
                warnings: u16::from_le_bytes([payload[1], payload[2]]),
                status_flags: u16::from_le_bytes([payload[3], payload[4]]),
            })
        } else {
            Some(Self::new(0))
        }
    }
}

/// ERR packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrPacket {
    pub error_code: u16,
    pub sql_state: String,
    pub error_message: String,
}

impl ErrPacket {
    pub fn new(error_code: u16, sql_state: &str, error_message: &str) -> Self {
        Self {
            error_code,
            sql_state: sql_state.to_string(),
            error_message: error_message.to_string(),
        }
    }

    pub fn encode(&self, capabilities: u32) -> Bytes {
        let mut buf = BytesMut::new();

        buf.put_u8(0xFF);
        buf.put_u16_le(self.error_code);

        if capabilities & CLIENT_PROTOCOL_41 != 0 {
            buf.put_u8(b'#');
            buf.extend_from_slice(self.sql_state.as_bytes());
        }

        buf.extend_from_slice(self.error_message.as_bytes());

        buf.freeze()
    }

    /// Same error addressed to a specific sequence id
    pub fn to_packet(&self, sequence_id: u8, capabilities: u32) -> Packet {
        Packet::new(sequence_id, self.encode(capabilities))
    }

    /// Parse from packet payload
    pub fn parse(payload: &[u8], capabilities: u32) -> Option<Self> {
        if payload.is_empty() || payload[0] != 0xFF {
            return None;
        }

        let mut buf = &payload[1..];
        if buf.len() < 2 {
            return None;
        }

        let error_code = buf.get_u16_le();

        let (sql_state, error_message) =
            if capabilities & CLIENT_PROTOCOL_41 != 0 && !buf.is_empty() && buf[0] == b'#' {
                buf.advance(1);
                if buf.len() >= 5 {
                    let sql_state = String::from_utf8_lossy(&buf[..5]).to_string();
                    buf.advance(5);
                    (sql_state, String::from_utf8_lossy(buf).to_string())
                } else {
                    ("HY000".to_string(), String::from_utf8_lossy(buf).to_string())
                }
            } else {
                ("HY000".to_string(), String::from_utf8_lossy(buf).to_string())
            };

        Some(Self {
            error_code,
            sql_state,
            error_message,
        })
    }
}

/// Check if packet is OK packet
pub fn is_ok_packet(payload: &[u8]) -> bool {
    !payload.is_empty() && payload[0] == 0x00
}

/// Check if packet is ERR packet
pub fn is_err_packet(payload: &[u8]) -> bool {
    !payload.is_empty() && payload[0] == 0xFF
}

/// Check if packet is EOF packet (classic protocol, CLIENT_DEPRECATE_EOF off)
pub fn is_eof_packet(payload: &[u8]) -> bool {
    !payload.is_empty() && payload[0] == 0xFE && payload.len() < 9
}

/// Collation ids for the character sets clients commonly request
const CHARSETS: &[(&str, u8)] = &[
    ("big5", 1),
    ("latin1", 8),
    ("gbk", 28),
    ("utf8", 33),
    ("utf8mb3", 33),
    ("utf8mb4", 45),
    ("binary", 63),
    ("gb18030", 248),
];

/// Default collation id for a character set name
pub fn charset_id(name: &str) -> Option<u8> {
    CHARSETS
        .iter()
        .find(|(n, _)| n.eq_ignore_ascii_case(name))
        .map(|(_, id)| *id)
}

/// Character set name for a collation id sent in a handshake
pub fn charset_name(id: u8) -> Option<&'static str> {
    match id {
        33 | 83 | 192..=215 => Some("utf8"),
        45 | 46 | 224..=247 | 255 => Some("utf8mb4"),
        _ => CHARSETS.iter().find(|(_, i)| *i == id).map(|(n, _)| *n),
    }
}
