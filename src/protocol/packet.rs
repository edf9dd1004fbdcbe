use bytes::{Buf, BufMut, Bytes, BytesMut};

/// MySQL packet header size: 3 bytes length + 1 byte sequence
pub const PACKET_HEADER_SIZE: usize = 4;
/// Maximum payload carried by one physical packet (16MB - 1)
pub const MAX_PACKET_SIZE: usize = 0xFF_FF_FF;

/// MySQL wire protocol packet (one physical frame)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub sequence_id: u8,
    pub payload: Bytes,
}

impl Packet {
    pub fn new(sequence_id: u8, payload: impl Into<Bytes>) -> Self {
        Self {
            sequence_id,
            payload: payload.into(),
        }
    }

    /// Encode packet to bytes (header + payload)
    pub fn encode(&self, dst: &mut BytesMut) {
        dst.reserve(PACKET_HEADER_SIZE + self.payload.len());
        put_header(dst, self.payload.len(), self.sequence_id);
        dst.extend_from_slice(&self.payload);
    }

    /// Encoded size on the wire
    pub fn wire_len(&self) -> usize {
        PACKET_HEADER_SIZE + self.payload.len()
    }

    /// Try to decode packet from bytes, returns None if not enough data
    pub fn decode(src: &mut BytesMut) -> Option<Self> {
        let len = peek_payload_len(src)?;
        if src.len() < PACKET_HEADER_SIZE + len {
            return None;
        }

        let sequence_id = src[3];
        src.advance(PACKET_HEADER_SIZE);
        let payload = src.split_to(len).freeze();

        Some(Self {
            sequence_id,
            payload,
        })
    }

    /// True when another physical frame continues this logical packet
    pub fn has_continuation(&self) -> bool {
        self.payload.len() == MAX_PACKET_SIZE
    }

    /// First payload byte, if any
    pub fn first_byte(&self) -> Option<u8> {
        self.payload.first().copied()
    }
}

/// Write a 4-byte packet header
pub fn put_header(dst: &mut BytesMut, len: usize, sequence_id: u8) {
    dst.put_u8((len & 0xFF) as u8);
    dst.put_u8(((len >> 8) & 0xFF) as u8);
    dst.put_u8(((len >> 16) & 0xFF) as u8);
    dst.put_u8(sequence_id);
}

/// Payload length announced by a header at the start of `src`
pub fn peek_payload_len(src: &[u8]) -> Option<usize> {
    if src.len() < PACKET_HEADER_SIZE {
        return None;
    }
    Some(src[0] as usize | ((src[1] as usize) << 8) | ((src[2] as usize) << 16))
}

/// MySQL capability flags
#[allow(dead_code)]
pub mod capabilities {
    pub const CLIENT_LONG_PASSWORD: u32 = 1;
    pub const CLIENT_FOUND_ROWS: u32 = 1 << 1;
    pub const CLIENT_LONG_FLAG: u32 = 1 << 2;
    pub const CLIENT_CONNECT_WITH_DB: u32 = 1 << 3;
    pub const CLIENT_NO_SCHEMA: u32 = 1 << 4;
    pub const CLIENT_COMPRESS: u32 = 1 << 5;
    pub const CLIENT_ODBC: u32 = 1 << 6;
    pub const CLIENT_LOCAL_FILES: u32 = 1 << 7;
    pub const CLIENT_IGNORE_SPACE: u32 = 1 << 8;
    pub const CLIENT_PROTOCOL_41: u32 = 1 << 9;
    pub const CLIENT_INTERACTIVE: u32 = 1 << 10;
    pub const CLIENT_SSL: u32 = 1 << 11;
    pub const CLIENT_IGNORE_SIGPIPE: u32 = 1 << 13;
    pub const CLIENT_TRANSACTIONS: u32 = 1 << 14;
    pub const CLIENT_RESERVED: u32 = 1 << 15;
    pub const CLIENT_SECURE_CONNECTION: u32 = 1 << 15;
    pub const CLIENT_MULTI_STATEMENTS: u32 = 1 << 16;
    pub const CLIENT_MULTI_RESULTS: u32 = 1 << 17;
    pub const CLIENT_PS_MULTI_RESULTS: u32 = 1 << 18;
    pub const CLIENT_PLUGIN_AUTH: u32 = 1 << 19;
    pub const CLIENT_CONNECT_ATTRS: u32 = 1 << 20;
    pub const CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA: u32 = 1 << 21;
    pub const CLIENT_DEPRECATE_EOF: u32 = 1 << 24;

    /// Capabilities the proxy speaks on both sides.
    ///
    /// CLIENT_DEPRECATE_EOF stays off so result sets always end with a
    /// classic EOF marker; the result parser and the stream analyzer rely
    /// on it. CLIENT_SSL and CLIENT_COMPRESS are never advertised.
    pub const DEFAULT_CAPABILITIES: u32 = CLIENT_LONG_PASSWORD
        | CLIENT_FOUND_ROWS
        | CLIENT_LONG_FLAG
        | CLIENT_CONNECT_WITH_DB
        | CLIENT_PROTOCOL_41
        | CLIENT_TRANSACTIONS
        | CLIENT_SECURE_CONNECTION
        | CLIENT_MULTI_STATEMENTS
        | CLIENT_MULTI_RESULTS
        | CLIENT_PS_MULTI_RESULTS
        | CLIENT_PLUGIN_AUTH;
}

/// Server status flags carried by OK and EOF packets
#[allow(dead_code)]
pub mod status {
    pub const SERVER_STATUS_IN_TRANS: u16 = 0x0001;
    pub const SERVER_STATUS_AUTOCOMMIT: u16 = 0x0002;
    pub const SERVER_MORE_RESULTS_EXISTS: u16 = 0x0008;
    pub const SERVER_STATUS_NO_GOOD_INDEX_USED: u16 = 0x0010;
    pub const SERVER_STATUS_NO_INDEX_USED: u16 = 0x0020;
    pub const SERVER_STATUS_CURSOR_EXISTS: u16 = 0x0040;
    pub const SERVER_STATUS_LAST_ROW_SENT: u16 = 0x0080;
}

/// Error codes the proxy emits or inspects
#[allow(dead_code)]
pub mod error_codes {
    pub const ER_CON_COUNT_ERROR: u16 = 1040;
    pub const ER_ACCESS_DENIED_ERROR: u16 = 1045;
    pub const ER_UNKNOWN_COM_ERROR: u16 = 1047;
    pub const ER_PARSE_ERROR: u16 = 1064;
    pub const ER_UNKNOWN_ERROR: u16 = 1105;
    pub const ER_LOCK_WAIT_TIMEOUT: u16 = 1205;
    pub const ER_LOCK_DEADLOCK: u16 = 1213;
    pub const ER_UNSUPPORTED_PS: u16 = 1295;
    pub const ER_XAER_NOTA: u16 = 1397;
    pub const ER_XAER_RMFAIL: u16 = 1399;
    pub const ER_XA_RBROLLBACK: u16 = 1402;
    pub const ER_XA_RBTIMEOUT: u16 = 1613;
    pub const ER_XA_RBDEADLOCK: u16 = 1614;
    pub const ER_NET_PACKETS_OUT_OF_ORDER: u16 = 1156;
    pub const ER_NET_PACKET_TOO_LARGE: u16 = 1153;
}

/// MySQL command types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    Sleep = 0x00,
    Quit = 0x01,
    InitDb = 0x02,
    Query = 0x03,
    FieldList = 0x04,
    CreateDb = 0x05,
    DropDb = 0x06,
    Refresh = 0x07,
    Shutdown = 0x08,
    Statistics = 0x09,
    ProcessInfo = 0x0a,
    Connect = 0x0b,
    ProcessKill = 0x0c,
    Debug = 0x0d,
    Ping = 0x0e,
    Time = 0x0f,
    DelayedInsert = 0x10,
    ChangeUser = 0x11,
    BinlogDump = 0x12,
    TableDump = 0x13,
    ConnectOut = 0x14,
    RegisterSlave = 0x15,
    StmtPrepare = 0x16,
    StmtExecute = 0x17,
    StmtSendLongData = 0x18,
    StmtClose = 0x19,
    StmtReset = 0x1a,
    SetOption = 0x1b,
    StmtFetch = 0x1c,
    Daemon = 0x1d,
    BinlogDumpGtid = 0x1e,
    ResetConnection = 0x1f,
    Unknown = 0xff,
}

impl From<u8> for Command {
    fn from(value: u8) -> Self {
        match value {
            0x00 => Command::Sleep,
            0x01 => Command::Quit,
            0x02 => Command::InitDb,
            0x03 => Command::Query,
            0x04 => Command::FieldList,
            0x05 => Command::CreateDb,
            0x06 => Command::DropDb,
            0x07 => Command::Refresh,
            0x08 => Command::Shutdown,
            0x09 => Command::Statistics,
            0x0a => Command::ProcessInfo,
            0x0b => Command::Connect,
            0x0c => Command::ProcessKill,
            0x0d => Command::Debug,
            0x0e => Command::Ping,
            0x0f => Command::Time,
            0x10 => Command::DelayedInsert,
            0x11 => Command::ChangeUser,
            0x12 => Command::BinlogDump,
            0x13 => Command::TableDump,
            0x14 => Command::ConnectOut,
            0x15 => Command::RegisterSlave,
            0x16 => Command::StmtPrepare,
            0x17 => Command::StmtExecute,
            0x18 => Command::StmtSendLongData,
            0x19 => Command::StmtClose,
            0x1a => Command::StmtReset,
            0x1b => Command::SetOption,
            0x1c => Command::StmtFetch,
            0x1d => Command::Daemon,
            0x1e => Command::BinlogDumpGtid,
            0x1f => Command::ResetConnection,
            _ => Command::Unknown,
        }
    }
}

impl Command {
    /// Commands the server never answers
    pub fn has_no_response(&self) -> bool {
        matches!(self, Command::StmtSendLongData | Command::StmtClose)
    }
}

// ============================================================================
// Length-encoded values
// ============================================================================

/// Encode a length-encoded integer
pub fn put_lenenc_int(buf: &mut BytesMut, value: u64) {
    if value < 251 {
        buf.put_u8(value as u8);
    } else if value < 65536 {
        buf.put_u8(0xFC);
        buf.put_u16_le(value as u16);
    } else if value < 16777216 {
        buf.put_u8(0xFD);
        buf.put_u8((value & 0xFF) as u8);
        buf.put_u8(((value >> 8) & 0xFF) as u8);
        buf.put_u8(((value >> 16) & 0xFF) as u8);
    } else {
        buf.put_u8(0xFE);
        buf.put_u64_le(value);
    }
}

/// Encode a length-encoded string
pub fn put_lenenc_str(buf: &mut BytesMut, value: &[u8]) {
    put_lenenc_int(buf, value.len() as u64);
    buf.extend_from_slice(value);
}

/// Read a length-encoded integer, returning (value, bytes consumed)
///
/// Returns None for the NULL marker (0xFB), the ERR marker (0xFF) or a
/// truncated buffer.
pub fn read_lenenc_int(data: &[u8]) -> Option<(u64, usize)> {
    let first = *data.first()?;
    match first {
        0..=0xFA => Some((first as u64, 1)),
        0xFC if data.len() >= 3 => Some((u16::from_le_bytes([data[1], data[2]]) as u64, 3)),
        0xFD if data.len() >= 4 => Some((
            data[1] as u64 | ((data[2] as u64) << 8) | ((data[3] as u64) << 16),
            4,
        )),
        0xFE if data.len() >= 9 => {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&data[1..9]);
            Some((u64::from_le_bytes(raw), 9))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packet_encode_decode() {
        let packet = Packet::new(3, Bytes::from_static(b"\x03SELECT 1"));
        let mut buf = BytesMut::new();
        packet.encode(&mut buf);
        assert_eq!(&buf[..4], &[9, 0, 0, 3]);

        let decoded = Packet::decode(&mut buf).unwrap();
        assert_eq!(decoded, packet);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_decode_incomplete() {
        let mut buf = BytesMut::from(&[5u8, 0, 0, 0, 1, 2][..]);
        assert!(Packet::decode(&mut buf).is_none());
        assert_eq!(buf.len(), 6);
    }

    #[test]
    fn test_lenenc_int() {
        for value in [0u64, 250, 251, 65535, 65536, 16777215, 16777216, u64::MAX] {
            let mut buf = BytesMut::new();
            put_lenenc_int(&mut buf, value);
            let (decoded, used) = read_lenenc_int(&buf).unwrap();
            assert_eq!(decoded, value);
            assert_eq!(used, buf.len());
        }
    }

    #[test]
    fn test_lenenc_null_marker() {
        assert!(read_lenenc_int(&[0xFB]).is_none());
        assert!(read_lenenc_int(&[0xFC, 1]).is_none());
    }

    #[test]
    fn test_no_response_commands() {
        assert!(Command::StmtSendLongData.has_no_response());
        assert!(Command::StmtClose.has_no_response());
        assert!(!Command::Query.has_no_response());
    }
}
