//! Fast-stream forwarding of a single-backend response.
//!
//! Raw bytes from the backend are forwarded to the client as soon as they
//! form complete frames. Frames are still parsed so the connection knows
//! when the response ends and what its final status was. At most one
//! partial frame is held back between reads.

use bytes::{Bytes, BytesMut};

use crate::protocol::packet::{peek_payload_len, PACKET_HEADER_SIZE};
use crate::protocol::resultset::{Progress, ResultError};
use crate::protocol::{Packet, ResponseKind, ResultParser, ResultSummary};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum StreamError {
    #[error("Packets out of order: expected id {expected}, got {got}")]
    OutOfOrder { expected: u8, got: u8 },

    #[error(transparent)]
    Response(#[from] ResultError),

    #[error("{0} bytes received after the response ended")]
    TrailingData(usize),
}

/// Complete frames ready for the client
#[derive(Debug, Default)]
pub struct Forward {
    pub bytes: Bytes,
    /// Id of the last frame contained in `bytes`
    pub last_id: Option<u8>,
}

#[derive(Debug)]
pub struct StreamAnalyzer {
    parser: ResultParser,
    carry: BytesMut,
    next_id: u8,
    finished: bool,
}

impl StreamAnalyzer {
    /// `first_id` is the id the backend's first response frame carries
    pub fn new(kind: ResponseKind, first_id: u8) -> Self {
        Self {
            parser: ResultParser::new(kind),
            carry: BytesMut::new(),
            next_id: first_id,
            finished: false,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Bytes of an incomplete frame held back
    pub fn carried(&self) -> usize {
        self.carry.len()
    }

    pub fn summary(&self) -> &ResultSummary {
        self.parser.summary()
    }

    pub fn into_summary(self) -> ResultSummary {
        self.parser.into_summary()
    }

    /// Take newly read bytes; return the complete frames among them
    pub fn feed(&mut self, input: &[u8]) -> Result<Forward, StreamError> {
        if self.finished {
            return match input.len() {
                0 => Ok(Forward::default()),
                n => Err(StreamError::TrailingData(n)),
            };
        }
        self.carry.extend_from_slice(input);

        // Locate complete frames first, then split them off in one piece
        let mut frames = Vec::new();
        let mut offset = 0;
        let mut expected = self.next_id;
        while let Some(len) = peek_payload_len(&self.carry[offset..]) {
            let end = offset + PACKET_HEADER_SIZE + len;
            if end > self.carry.len() {
                break;
            }
            let id = self.carry[offset + 3];
            if id != expected {
                return Err(StreamError::OutOfOrder { expected, got: id });
            }
            frames.push((offset, len, id));
            expected = id.wrapping_add(1);
            offset = end;
        }

        if frames.is_empty() {
            return Ok(Forward::default());
        }

        let chunk = self.carry.split_to(offset).freeze();
        let mut last_id = None;
        for (i, (start, len, id)) in frames.iter().copied().enumerate() {
            let payload = chunk.slice(start + PACKET_HEADER_SIZE..start + PACKET_HEADER_SIZE + len);
            let progress = self.parser.feed(&Packet::new(id, payload))?;
            last_id = Some(id);
            if progress == Progress::Finished {
                self.finished = true;
                let trailing = chunk.len() - (start + PACKET_HEADER_SIZE + len) + self.carry.len();
                if i + 1 < frames.len() || trailing > 0 {
                    return Err(StreamError::TrailingData(trailing));
                }
            }
        }
        self.next_id = expected;

        Ok(Forward { bytes: chunk, last_id })
    }
}
