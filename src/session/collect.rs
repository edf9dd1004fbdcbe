//! Fan-out rounds: write one command to each member session, then collect
//! until every member has answered or failed.

use std::collections::VecDeque;

use bytes::Bytes;
use tracing::{error, warn};

use crate::backend::{BackendSession, DispatchState};
use crate::network::Channel;
use crate::protocol::Packet;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundProgress {
    /// Some member still has request bytes queued
    NeedWrite,
    /// Responses are outstanding
    NeedRead,
    /// Every member finished or failed
    Done,
}

/// Bookkeeping of one dispatch round
#[derive(Debug, Default)]
pub struct Round {
    members: Vec<usize>,
    counted: Vec<bool>,
    expected: usize,
    received: usize,
    /// Members that finished since the last `take_ready`, in finish order
    ready: VecDeque<usize>,
}

impl Round {
    /// Queue each command on its session. Unavailable sessions are skipped
    /// and do not count towards the expected responses.
    pub fn start(sessions: &mut [BackendSession], commands: Vec<(usize, Bytes)>) -> Self {
        let mut members = Vec::with_capacity(commands.len());
        for (idx, payload) in commands {
            match sessions.get_mut(idx) {
                Some(session) if !session.unavailable => {
                    session.send_command(payload);
                    members.push(idx);
                }
                Some(session) => {
                    warn!(backend = %session.addr(), "Skipping unavailable session");
                }
                None => error!(idx, "Round names a missing session"),
            }
        }
        let expected = members.len();
        Self {
            counted: vec![false; expected],
            members,
            expected,
            received: 0,
            ready: VecDeque::new(),
        }
    }

    pub fn expected(&self) -> usize {
        self.expected
    }

    pub fn received(&self) -> usize {
        self.received
    }

    pub fn members(&self) -> &[usize] {
        &self.members
    }

    pub fn is_complete(&self) -> bool {
        self.received == self.expected
    }

    /// Parse whatever arrived and report what the round is waiting for
    pub fn poll(&mut self, sessions: &mut [BackendSession]) -> RoundProgress {
        let mut need_write = false;
        for pos in 0..self.members.len() {
            let idx = self.members[pos];
            if self.counted[pos] {
                continue;
            }
            let Some(session) = sessions.get_mut(idx) else {
                error!(idx, "Round member vanished");
                self.count(pos, idx);
                continue;
            };
            match session.dispatch_state() {
                DispatchState::Error => self.count(pos, idx),
                DispatchState::Write => need_write = true,
                _ => match session.absorb() {
                    Ok(true) => self.count(pos, idx),
                    Ok(false) => {}
                    Err(e) => {
                        warn!(backend = %session.addr(), error = %e, "Backend response rejected");
                        session.set_dispatch_state(DispatchState::Error);
                        session.unavailable = true;
                        self.count(pos, idx);
                    }
                },
            }
        }

        if need_write {
            RoundProgress::NeedWrite
        } else if self.is_complete() {
            RoundProgress::Done
        } else {
            RoundProgress::NeedRead
        }
    }

    fn count(&mut self, pos: usize, idx: usize) {
        self.counted[pos] = true;
        self.received += 1;
        self.ready.push_back(idx);
    }

    /// Next member whose response is complete (or failed)
    pub fn take_ready(&mut self) -> Option<usize> {
        self.ready.pop_front()
    }
}

/// Forward a backend response unchanged. The client channel was reset for
/// this command, so the frame ids come out as the backend sent them.
pub fn passthrough(client: &mut Channel, frames: Vec<Packet>) {
    for frame in frames {
        client.append_frame(frame.payload);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::SessionAttrs;
    use crate::protocol::capabilities::CLIENT_PROTOCOL_41;
    use crate::protocol::{query_payload, OkPacket};
    use tokio::io::duplex;

    fn session_with_server(thread_id: u32) -> (BackendSession, Channel) {
        let (a, b) = duplex(1 << 16);
        let session = BackendSession::new(
            thread_id as usize,
            format!("db{}:3306", thread_id),
            "app",
            Channel::new(Box::new(a), "db", 1 << 24),
            thread_id,
            CLIENT_PROTOCOL_41,
            SessionAttrs::default(),
            0,
        );
        (session, Channel::new(Box::new(b), "proxy", 1 << 24))
    }

    async fn answer_ok(server: &mut Channel) {
        server.read_more().await.unwrap();
        server.next_packet().unwrap().unwrap();
        server.append_packet(OkPacket::new().encode(CLIENT_PROTOCOL_41));
        server.flush().await.unwrap();
    }

    #[tokio::test]
    async fn test_expected_counts_only_written_sessions() {
        let (s0, mut srv0) = session_with_server(0);
        let (mut s1, _srv1) = session_with_server(1);
        let (s2, mut srv2) = session_with_server(2);
        s1.unavailable = true;
        let mut sessions = vec![s0, s1, s2];

        let commands = (0..3).map(|i| (i, query_payload("SELECT 1"))).collect();
        let mut round = Round::start(&mut sessions, commands);
        assert_eq!(round.expected(), 2);
        assert_eq!(round.members(), &[0, 2]);
        assert_eq!(round.poll(&mut sessions), RoundProgress::NeedWrite);

        for s in sessions.iter_mut().filter(|s| s.has_pending_writes()) {
            s.flush().await.unwrap();
        }
        assert_eq!(round.poll(&mut sessions), RoundProgress::NeedRead);

        answer_ok(&mut srv0).await;
        sessions[0].read_more().await.unwrap();
        // one of two answered: still collecting
        assert_eq!(round.poll(&mut sessions), RoundProgress::NeedRead);
        assert_eq!(round.received(), 1);
        assert_eq!(round.take_ready(), Some(0));

        answer_ok(&mut srv2).await;
        sessions[2].read_more().await.unwrap();
        assert_eq!(round.poll(&mut sessions), RoundProgress::Done);
        assert_eq!(round.take_ready(), Some(2));
        assert_eq!(round.take_ready(), None);
    }

    #[tokio::test]
    async fn test_failed_session_counts_as_received() {
        let (s0, _srv0) = session_with_server(0);
        let mut sessions = vec![s0];
        let mut round = Round::start(&mut sessions, vec![(0, query_payload("SELECT 1"))]);
        sessions[0].flush().await.unwrap();
        assert_eq!(round.poll(&mut sessions), RoundProgress::NeedRead);

        sessions[0].set_dispatch_state(DispatchState::Error);
        assert_eq!(round.poll(&mut sessions), RoundProgress::Done);
        assert!(round.is_complete());
    }

    #[tokio::test]
    async fn test_vanished_and_failed_members_both_count() {
        let (s0, _srv0) = session_with_server(0);
        let (s1, _srv1) = session_with_server(1);
        let mut sessions = vec![s0, s1];
        let commands = (0..2).map(|i| (i, query_payload("SELECT 1"))).collect();
        let mut round = Round::start(&mut sessions, commands);
        for s in sessions.iter_mut() {
            s.flush().await.unwrap();
        }

        sessions[0].set_dispatch_state(DispatchState::Error);
        sessions.truncate(1);
        assert_eq!(round.poll(&mut sessions), RoundProgress::Done);
        assert_eq!(round.received(), 2);
        assert_eq!(round.take_ready(), Some(0));
        assert_eq!(round.take_ready(), Some(1));
        // counted members are not counted again
        assert_eq!(round.poll(&mut sessions), RoundProgress::Done);
        assert_eq!(round.received(), 2);
    }

    #[test]
    fn test_empty_round_is_done() {
        let mut sessions: Vec<BackendSession> = Vec::new();
        let mut round = Round::start(&mut sessions, Vec::new());
        assert_eq!(round.poll(&mut sessions), RoundProgress::Done);
    }

    #[tokio::test]
    async fn test_passthrough_keeps_frame_ids() {
        let (a, b) = duplex(1 << 16);
        let mut client = Channel::new(Box::new(a), "client", 1 << 24);
        let mut peer = Channel::new(Box::new(b), "peer", 1 << 24);

        // command arrives with id 0
        peer.append_packet(query_payload("SELECT 1"));
        peer.flush().await.unwrap();
        client.reset_packet_id();
        client.read_more().await.unwrap();
        client.next_packet().unwrap().unwrap();

        let frames = vec![
            Packet::new(1, Bytes::from_static(b"\x01")),
            Packet::new(2, Bytes::from_static(b"\x03def")),
        ];
        passthrough(&mut client, frames);
        client.flush().await.unwrap();

        peer.read_more().await.unwrap();
        let first = peer.next_packet().unwrap().unwrap();
        assert_eq!(first.sequence_id, 1);
        assert_eq!(&first.payload[..], b"\x01");
    }
}
