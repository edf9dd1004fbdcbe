//! Queued packet I/O over a duplex byte stream.
//!
//! A [`Channel`] owns one end of a connection (client or backend) and keeps
//! three buffers: a send queue of encoded frames with a byte offset into the
//! head, a receive queue of framed packets, and the raw bytes that have not
//! formed a complete frame yet. Sequence ids are tracked per channel: after
//! [`Channel::reset_packet_id`] the next outbound frame gets id 0 and the
//! next inbound frame is accepted as the new baseline.

use std::collections::VecDeque;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::codec::Decoder;
use tracing::trace;

use crate::protocol::codec::{CodecError, PacketCodec};
use crate::protocol::packet::{put_header, peek_payload_len, Packet, MAX_PACKET_SIZE, PACKET_HEADER_SIZE};

/// Byte stream the channel runs over (plain TCP, TLS, in-memory duplex)
pub trait Transport: AsyncRead + AsyncWrite + Unpin + Send + Sync {}

impl<T> Transport for T where T: AsyncRead + AsyncWrite + Unpin + Send + Sync {}

const READ_CHUNK: usize = 16 * 1024;

/// Channel errors
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Peer closed the connection")]
    Closed,

    #[error("Packet of {size} bytes exceeds limit of {limit} bytes")]
    PacketTooLarge { size: usize, limit: usize },

    #[error("Packets out of order: expected id {expected}, got {got}")]
    OutOfOrder { expected: u8, got: u8 },
}

impl ChannelError {
    /// Framing violations: the byte stream can no longer be trusted
    pub fn is_protocol_error(&self) -> bool {
        matches!(
            self,
            ChannelError::PacketTooLarge { .. } | ChannelError::OutOfOrder { .. }
        )
    }
}

impl From<CodecError> for ChannelError {
    fn from(e: CodecError) -> Self {
        match e {
            CodecError::Io(e) => ChannelError::Io(e),
            CodecError::TooLarge { size, limit } => ChannelError::PacketTooLarge { size, limit },
        }
    }
}

/// One end of a duplex MySQL connection
pub struct Channel {
    io: Box<dyn Transport>,
    peer: String,
    codec: PacketCodec,
    send_queue: VecDeque<Bytes>,
    /// Bytes of the head of `send_queue` already written
    send_offset: usize,
    recv_queue: VecDeque<Packet>,
    raw: BytesMut,
    last_packet_id: u8,
    packet_id_is_reset: bool,
    compressed: bool,
    tls: bool,
    /// Bytes still expected to complete the frame at the head of `raw`
    to_read: usize,
}

impl Channel {
    pub fn new(io: Box<dyn Transport>, peer: impl Into<String>, max_packet_size: usize) -> Self {
        Self::with_buffer(io, peer, max_packet_size, BytesMut::new())
    }

    /// Build a channel around a stream whose first bytes were already read
    pub fn with_buffer(
        io: Box<dyn Transport>,
        peer: impl Into<String>,
        max_packet_size: usize,
        raw: BytesMut,
    ) -> Self {
        Self {
            io,
            peer: peer.into(),
            codec: PacketCodec::new(max_packet_size),
            send_queue: VecDeque::new(),
            send_offset: 0,
            recv_queue: VecDeque::new(),
            raw,
            last_packet_id: 0,
            packet_id_is_reset: true,
            compressed: false,
            tls: false,
            to_read: 0,
        }
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Compressed protocol framing; never negotiated, so always false for now
    pub fn is_compressed(&self) -> bool {
        self.compressed
    }

    /// TLS-wrapped transport; this proxy does not negotiate TLS, so plain sockets report false
    pub fn is_tls(&self) -> bool {
        self.tls
    }

    /// Start a fresh logical exchange
    pub fn reset_packet_id(&mut self) {
        self.packet_id_is_reset = true;
    }

    pub fn is_packet_id_reset(&self) -> bool {
        self.packet_id_is_reset
    }

    pub fn last_packet_id(&self) -> u8 {
        self.last_packet_id
    }

    fn next_packet_id(&mut self) -> u8 {
        let id = if self.packet_id_is_reset {
            self.packet_id_is_reset = false;
            0
        } else {
            self.last_packet_id.wrapping_add(1)
        };
        self.last_packet_id = id;
        id
    }

    /// Queue a logical packet, splitting it into 16MB frames when needed
    pub fn append_packet(&mut self, payload: Bytes) {
        let mut rest = payload;
        loop {
            let chunk = rest.split_to(rest.len().min(MAX_PACKET_SIZE));
            let full = chunk.len() == MAX_PACKET_SIZE;
            self.append_frame(chunk);
            // A logical packet ending on a frame boundary gets an empty tail frame
            if !full {
                break;
            }
        }
    }

    /// Queue exactly one physical frame (payload at most 16MB - 1)
    pub fn append_frame(&mut self, payload: Bytes) {
        debug_assert!(payload.len() <= MAX_PACKET_SIZE);
        let id = self.next_packet_id();
        let mut frame = BytesMut::with_capacity(PACKET_HEADER_SIZE + payload.len());
        put_header(&mut frame, payload.len(), id);
        frame.extend_from_slice(&payload);
        self.send_queue.push_back(frame.freeze());
    }

    /// Queue bytes that are already framed (fast-stream forwarding).
    ///
    /// `last_id` is the id of the last frame header contained in `bytes`.
    pub fn append_raw(&mut self, bytes: Bytes, last_id: Option<u8>) {
        if let Some(id) = last_id {
            self.last_packet_id = id;
            self.packet_id_is_reset = false;
        }
        if !bytes.is_empty() {
            self.send_queue.push_back(bytes);
        }
    }

    pub fn has_pending_writes(&self) -> bool {
        !self.send_queue.is_empty()
    }

    pub fn pending_write_bytes(&self) -> usize {
        self.send_queue.iter().map(Bytes::len).sum::<usize>() - self.send_offset
    }

    /// Drop everything queued for sending
    pub fn clear_send_queue(&mut self) {
        self.send_queue.clear();
        self.send_offset = 0;
    }

    /// Write queued frames until the queue is empty.
    ///
    /// Partial writes advance the head offset, so a cancelled flush resumes
    /// where it stopped.
    pub async fn flush(&mut self) -> Result<(), ChannelError> {
        while let Some(head) = self.send_queue.front() {
            let n = self.io.write(&head[self.send_offset..]).await?;
            if n == 0 {
                return Err(ChannelError::Closed);
            }
            self.send_offset += n;
            if self.send_offset >= head.len() {
                self.send_queue.pop_front();
                self.send_offset = 0;
            }
        }
        self.io.flush().await?;
        Ok(())
    }

    /// Read whatever the peer has sent into the raw buffer
    pub async fn read_more(&mut self) -> Result<usize, ChannelError> {
        self.raw.reserve(READ_CHUNK);
        let n = self.io.read_buf(&mut self.raw).await?;
        if n == 0 {
            return Err(ChannelError::Closed);
        }
        trace!(peer = %self.peer, bytes = n, "read");
        Ok(n)
    }

    /// Frame every complete packet in the raw buffer into the receive queue
    pub fn frame_available(&mut self) -> Result<usize, ChannelError> {
        let mut framed = 0;
        while let Some(packet) = self.codec.decode(&mut self.raw)? {
            self.accept_incoming_id(packet.sequence_id)?;
            self.recv_queue.push_back(packet);
            framed += 1;
        }
        self.to_read = match peek_payload_len(&self.raw) {
            Some(len) => PACKET_HEADER_SIZE + len - self.raw.len(),
            None => 0,
        };
        Ok(framed)
    }

    fn accept_incoming_id(&mut self, id: u8) -> Result<(), ChannelError> {
        if self.packet_id_is_reset {
            self.packet_id_is_reset = false;
        } else {
            let expected = self.last_packet_id.wrapping_add(1);
            if id != expected {
                return Err(ChannelError::OutOfOrder { expected, got: id });
            }
        }
        self.last_packet_id = id;
        Ok(())
    }

    /// Next framed packet, framing from the raw buffer if needed
    pub fn next_packet(&mut self) -> Result<Option<Packet>, ChannelError> {
        if self.recv_queue.is_empty() {
            self.frame_available()?;
        }
        Ok(self.recv_queue.pop_front())
    }

    pub fn has_queued_input(&self) -> bool {
        !self.recv_queue.is_empty() || !self.raw.is_empty()
    }

    /// Bytes still expected before the partial frame in the raw buffer completes
    pub fn bytes_still_expected(&self) -> usize {
        self.to_read
    }

    /// Hand the unframed bytes to the caller (fast-stream path)
    pub fn take_raw(&mut self) -> BytesMut {
        self.raw.split()
    }

    pub async fn shutdown(&mut self) {
        let _ = self.io.shutdown().await;
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("peer", &self.peer)
            .field("queued_frames", &self.send_queue.len())
            .field("recv_queue", &self.recv_queue.len())
            .field("raw", &self.raw.len())
            .field("last_packet_id", &self.last_packet_id)
            .field("packet_id_is_reset", &self.packet_id_is_reset)
            .field("compressed", &self.compressed)
            .field("tls", &self.tls)
            .finish()
    }
}
