use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder};

use super::packet::{peek_payload_len, Packet, MAX_PACKET_SIZE};

/// Framing errors raised while decoding packets
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Packet of {size} bytes exceeds limit of {limit} bytes")]
    TooLarge { size: usize, limit: usize },
}

/// MySQL packet codec for use with tokio Framed and the channel layer
///
/// `max_logical_size` bounds a logical packet (the sum of its physical
/// frames). Frames of exactly `MAX_PACKET_SIZE` bytes carry a continuation.
#[derive(Debug)]
pub struct PacketCodec {
    max_logical_size: usize,
    /// Bytes of the logical packet assembled so far
    logical_size: usize,
}

impl PacketCodec {
    pub fn new(max_logical_size: usize) -> Self {
        Self {
            max_logical_size,
            logical_size: 0,
        }
    }
}

impl Default for PacketCodec {
    fn default() -> Self {
        Self::new(usize::MAX)
    }
}

impl Decoder for PacketCodec {
    type Item = Packet;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        // Reject an oversized packet as soon as its header is visible
        if let Some(len) = peek_payload_len(src) {
            let size = self.logical_size + len;
            if size > self.max_logical_size {
                return Err(CodecError::TooLarge {
                    size,
                    limit: self.max_logical_size,
                });
            }
        }

        let Some(packet) = Packet::decode(src) else {
            return Ok(None);
        };

        if packet.has_continuation() {
            self.logical_size += packet.payload.len();
        } else {
            self.logical_size = 0;
        }

        Ok(Some(packet))
    }
}

impl Encoder<Packet> for PacketCodec {
    type Error = CodecError;

    fn encode(&mut self, item: Packet, dst: &mut BytesMut) -> Result<(), Self::Error> {
        debug_assert!(item.payload.len() <= MAX_PACKET_SIZE);
        item.encode(dst);
        Ok(())
    }
}
