pub mod codec;
pub mod command;
pub mod handshake;
pub mod packet;
pub mod resultset;

pub use codec::{CodecError, PacketCodec};
pub use command::{classify_query, query_payload, set_option_payload, ClientCommand, QueryKind};
pub use handshake::{
    charset_id, charset_name, compute_auth_response, is_eof_packet, is_err_packet, is_ok_packet, stage1_hash,
    verify_auth_response, AuthSwitchRequest, EofPacket, ErrPacket, HandshakeResponse,
    InitialHandshake, OkPacket,
};
pub use packet::{capabilities, error_codes, status, Command, Packet};
pub use resultset::{ResponseKind, ResponseStatus, ResultParser, ResultSummary};
