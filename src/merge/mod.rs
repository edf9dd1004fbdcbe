//! Combining the responses of several backend sessions into one result.
//!
//! A merger is fed each session's complete response in turn and yields the
//! client-facing payloads. Mergers that can forward rows before every session
//! has answered report it through [`ResultMerger::is_streamable`].

mod concat;

pub use concat::ConcatMerger;

use bytes::{Bytes, BytesMut};

use crate::protocol::{ErrPacket, Packet};

/// Where a merge stands after one response was pushed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeStatus {
    /// More responses are expected
    Partial,
    /// Every expected response was merged; the output is final
    Complete,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MergeError {
    /// Part of the result already reached the client; the stream cannot be repaired
    #[error("Merge failed after output was sent: {0}")]
    Fatal(String),

    /// Nothing was sent yet; the client gets this error instead of a result
    #[error("Merge failed: {}", .0.error_message)]
    Recoverable(ErrPacket),
}

pub trait ResultMerger: Send {
    /// Merge one session's full response (physical frames, in order)
    fn push(&mut self, response: &[Packet]) -> Result<MergeStatus, MergeError>;

    /// Drain payloads ready for the client
    fn take_output(&mut self) -> Vec<Bytes>;

    /// Output may be taken before the merge completes
    fn is_streamable(&self) -> bool;
}

/// Join physical frames back into logical packet payloads
pub fn logical_payloads(frames: &[Packet]) -> Vec<Bytes> {
    let mut payloads = Vec::with_capacity(frames.len());
    let mut pending: Option<BytesMut> = None;
    for frame in frames {
        let continues = frame.has_continuation();
        match (pending.as_mut(), continues) {
            (None, false) => payloads.push(frame.payload.clone()),
            (None, true) => pending = Some(BytesMut::from(&frame.payload[..])),
            (Some(buf), _) => {
                buf.extend_from_slice(&frame.payload);
                if !continues {
                    if let Some(buf) = pending.take() {
                        payloads.push(buf.freeze());
                    }
                }
            }
        }
    }
    if let Some(buf) = pending {
        payloads.push(buf.freeze());
    }
    payloads
}
