//! One proxy-to-backend connection and its per-round bookkeeping.

use std::fmt;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tracing::{debug, trace};

use crate::network::{Channel, ChannelError};
use crate::protocol::resultset::{Progress, ResultError};
use crate::protocol::{status, Command, Packet, ResponseKind, ResultParser, ResultSummary};
use crate::xa::XaState;

use super::registry::BackendId;

/// Session attribute categories, in reconciliation order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Attr {
    DefaultDb,
    Charset,
    MultiStatements,
    Autocommit,
}

impl Attr {
    pub const ORDER: [Attr; 4] = [
        Attr::DefaultDb,
        Attr::Charset,
        Attr::MultiStatements,
        Attr::Autocommit,
    ];

    fn bit(self) -> u8 {
        match self {
            Attr::DefaultDb => 0b0001,
            Attr::Charset => 0b0010,
            Attr::MultiStatements => 0b0100,
            Attr::Autocommit => 0b1000,
        }
    }
}

/// Set of mismatched attribute categories
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AttrMask(u8);

impl AttrMask {
    pub fn empty() -> Self {
        Self(0)
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn contains(self, attr: Attr) -> bool {
        self.0 & attr.bit() != 0
    }

    pub fn insert(&mut self, attr: Attr) {
        self.0 |= attr.bit();
    }

    pub fn remove(&mut self, attr: Attr) {
        self.0 &= !attr.bit();
    }

    pub fn union(self, other: AttrMask) -> AttrMask {
        AttrMask(self.0 | other.0)
    }

    /// Next category to reconcile after `current`, or `None` once the
    /// order wraps around.
    pub fn next_after(self, current: Option<Attr>) -> Option<Attr> {
        let start = match current {
            None => 0,
            Some(attr) => Attr::ORDER.iter().position(|a| *a == attr)? + 1,
        };
        Attr::ORDER[start..].iter().copied().find(|a| self.contains(*a))
    }
}

/// Connection-scoped settings that must agree between client and backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionAttrs {
    pub db: Option<String>,
    pub charset: String,
    pub multi_statements: bool,
    pub autocommit: bool,
}

impl Default for SessionAttrs {
    fn default() -> Self {
        Self {
            db: None,
            charset: "utf8mb4".to_string(),
            multi_statements: false,
            autocommit: true,
        }
    }
}

/// Progress of one session within a dispatch round
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DispatchState {
    #[default]
    None,
    /// Request queued, not fully written
    Write,
    /// Request written, response pending
    Read,
    Finished,
    /// Some of the response was forwarded, more is coming
    PartFinished,
    Error,
}

/// Errors raised while exchanging packets with a backend
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error("Malformed backend response: {0}")]
    Response(#[from] ResultError),

    #[error("Backend sent data while no request was outstanding")]
    Unsolicited,
}

impl BackendError {
    /// Transport-level failure (as opposed to a protocol violation)
    pub fn is_transport(&self) -> bool {
        match self {
            BackendError::Channel(e) => !e.is_protocol_error(),
            _ => false,
        }
    }
}

/// One live connection to a backend server
pub struct BackendSession {
    backend: BackendId,
    addr: String,
    user: String,
    channel: Channel,
    thread_id: u32,
    server_caps: u32,
    /// Settings the server currently holds for this connection
    pub attrs: SessionAttrs,
    in_transaction: bool,
    epoch: u64,
    created_at: Instant,
    last_used: Instant,

    /// Took part in the current fan-out
    pub participated: bool,
    dispatch: DispatchState,
    pub xa: XaState,
    /// Branch id when the transaction is partitioned per backend
    pub xid: Option<String>,
    pub attr_diff: AttrMask,
    /// Performed a write inside the current transaction
    pub has_written: bool,
    /// Transport failed; excluded from further commands
    pub unavailable: bool,
    parser: Option<ResultParser>,
    response: Vec<Packet>,
    summary: Option<ResultSummary>,
}

impl BackendSession {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        backend: BackendId,
        addr: impl Into<String>,
        user: impl Into<String>,
        channel: Channel,
        thread_id: u32,
        server_caps: u32,
        attrs: SessionAttrs,
        epoch: u64,
    ) -> Self {
        let now = Instant::now();
        Self {
            backend,
            addr: addr.into(),
            user: user.into(),
            channel,
            thread_id,
            server_caps,
            attrs,
            in_transaction: false,
            epoch,
            created_at: now,
            last_used: now,
            participated: false,
            dispatch: DispatchState::None,
            xa: XaState::None,
            xid: None,
            attr_diff: AttrMask::empty(),
            has_written: false,
            unavailable: false,
            parser: None,
            response: Vec::new(),
            summary: None,
        }
    }

    pub fn backend(&self) -> BackendId {
        self.backend
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn thread_id(&self) -> u32 {
        self.thread_id
    }

    pub fn server_caps(&self) -> u32 {
        self.server_caps
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// `addr@thread_id`, the participant label used in transaction logs
    pub fn label(&self) -> String {
        format!("{}@{}", self.addr, self.thread_id)
    }

    pub fn channel_mut(&mut self) -> &mut Channel {
        &mut self.channel
    }

    pub fn is_in_transaction(&self) -> bool {
        self.in_transaction
    }

    pub fn set_in_transaction(&mut self, in_transaction: bool) {
        self.in_transaction = in_transaction;
    }

    pub fn dispatch_state(&self) -> DispatchState {
        self.dispatch
    }

    pub fn set_dispatch_state(&mut self, state: DispatchState) {
        self.dispatch = state;
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub fn idle_for(&self) -> Duration {
        self.last_used.elapsed()
    }

    /// Clear per-round state before a new fan-out
    pub fn begin_round(&mut self) {
        self.participated = false;
        self.dispatch = DispatchState::None;
        self.parser = None;
        self.response.clear();
        self.summary = None;
    }

    /// Queue a command and arm the response parser.
    ///
    /// Commands without a response (`COM_STMT_CLOSE`, `COM_STMT_SEND_LONG_DATA`)
    /// finish as soon as they are flushed.
    pub fn send_command(&mut self, payload: Bytes) {
        let command = payload.first().map(|b| Command::from(*b)).unwrap_or(Command::Unknown);
        self.parser = (!command.has_no_response()).then(|| ResultParser::new(ResponseKind::for_command(command)));
        self.response.clear();
        self.summary = None;
        self.participated = true;
        self.dispatch = DispatchState::Write;
        self.last_used = Instant::now();
        self.channel.reset_packet_id();
        self.channel.append_packet(payload);
        trace!(backend = %self.addr, thread_id = self.thread_id, ?command, "Queued command");
    }

    /// Write the queued request; moves the session to `Read` (or `Finished`
    /// for commands without a response).
    pub async fn flush(&mut self) -> Result<(), ChannelError> {
        self.channel.flush().await?;
        if self.dispatch == DispatchState::Write {
            self.dispatch = if self.parser.is_some() {
                DispatchState::Read
            } else {
                DispatchState::Finished
            };
        }
        Ok(())
    }

    pub fn has_pending_writes(&self) -> bool {
        self.channel.has_pending_writes()
    }

    pub async fn read_more(&mut self) -> Result<usize, ChannelError> {
        self.channel.read_more().await
    }

    /// Parse every complete packet already received. Returns `true` once the
    /// response is complete.
    pub fn absorb(&mut self) -> Result<bool, BackendError> {
        let Some(parser) = self.parser.as_mut() else {
            return if self.channel.has_queued_input() {
                Err(BackendError::Unsolicited)
            } else {
                Ok(self.dispatch == DispatchState::Finished)
            };
        };

        while let Some(packet) = self.channel.next_packet()? {
            let progress = parser.feed(&packet)?;
            self.response.push(packet);
            if progress == Progress::Finished {
                let summary = parser.summary().clone();
                self.finish(summary);
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn finish(&mut self, summary: ResultSummary) {
        if summary.is_ok() && summary.server_status != 0 {
            self.in_transaction = summary.server_status & status::SERVER_STATUS_IN_TRANS != 0;
            self.attrs.autocommit = summary.server_status & status::SERVER_STATUS_AUTOCOMMIT != 0;
        }
        self.parser = None;
        self.dispatch = DispatchState::Finished;
        self.last_used = Instant::now();
        self.summary = Some(summary);
    }

    /// Mark the response complete after it was forwarded without parsing
    pub fn finish_streamed(&mut self, summary: ResultSummary) {
        self.finish(summary);
    }

    pub fn is_finished(&self) -> bool {
        self.dispatch == DispatchState::Finished
    }

    pub fn response(&self) -> &[Packet] {
        &self.response
    }

    pub fn take_response(&mut self) -> Vec<Packet> {
        std::mem::take(&mut self.response)
    }

    pub fn summary(&self) -> Option<&ResultSummary> {
        self.summary.as_ref()
    }

    /// Nothing in flight and no server-side transaction state: safe to pool
    pub fn is_reusable(&self) -> bool {
        !self.unavailable
            && !self.in_transaction
            && self.xa == XaState::None
            && matches!(self.dispatch, DispatchState::None | DispatchState::Finished)
            && !self.channel.has_pending_writes()
            && !self.channel.has_queued_input()
    }

    /// Reset per-transaction flags after a commit or rollback
    pub fn end_transaction(&mut self) {
        self.has_written = false;
        self.xa = XaState::None;
        self.xid = None;
    }

    /// Best-effort COM_QUIT, then drop the socket
    pub async fn quit(mut self, timeout: Duration) {
        self.channel.clear_send_queue();
        self.channel.reset_packet_id();
        self.channel.append_packet(Bytes::from_static(&[Command::Quit as u8]));
        let _ = tokio::time::timeout(timeout, self.channel.flush()).await;
        self.channel.shutdown().await;
        debug!(backend = %self.addr, thread_id = self.thread_id, "Backend session closed");
    }
}

impl fmt::Debug for BackendSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendSession")
            .field("backend", &self.backend)
            .field("addr", &self.addr)
            .field("thread_id", &self.thread_id)
            .field("dispatch", &self.dispatch)
            .field("xa", &self.xa)
            .field("in_transaction", &self.in_transaction)
            .finish()
    }
}
