use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use tracing::debug;

use crate::backend::{BackendId, BackendSession, BackendState, SessionAttrs};
use crate::config::ProxyMode;
use crate::merge::{MergeError, ResultMerger};
use crate::network::Channel;
use crate::plugin::RoutePlan;
use crate::pool::PoolError;
use crate::protocol::{ClientCommand, ErrPacket};
use crate::xa::XaDriver;

use super::collect::Round;
use super::reconcile::Reconciler;
use super::state::ConState;
use super::stream::StreamAnalyzer;
use super::ProxyState;

/// Why the XA commit sequence is running and what the client gets at the end
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum XaPurpose {
    /// Autocommit write spanning groups; the deferred result goes out on commit
    ImplicitCommit,
    ClientCommit,
    ClientRollback,
    /// The statement failed; roll back and report this error
    Abort(ErrPacket),
}

/// State of one client connection
pub struct ConnContext {
    pub(super) proxy: Arc<ProxyState>,
    pub(super) conn_id: u32,
    pub(super) client: Channel,
    pub(super) client_caps: u32,
    pub(super) user: String,
    pub(super) scramble: Vec<u8>,
    pub(super) authenticated: bool,

    pub(super) state: ConState,
    pub(super) prev_state: ConState,

    /// Settings the client believes its connection has
    pub(super) attrs: SessionAttrs,
    pub(super) sessions: Vec<BackendSession>,

    /// Frames of a command split over several packets
    pub(super) partial_request: Option<BytesMut>,
    pub(super) request: Bytes,
    pub(super) command: Option<ClientCommand>,
    pub(super) plan: Option<RoutePlan>,

    pub(super) in_transaction: bool,
    /// Previous statement was BEGIN / START TRANSACTION
    pub(super) is_start_tran_command: bool,
    pub(super) dist_tran: bool,
    pub(super) implicit_xa: bool,
    pub(super) xa: XaDriver,
    pub(super) xa_purpose: Option<XaPurpose>,

    pub(super) round: Round,
    pub(super) reconciler: Reconciler,

    pub(super) checkout_attempts: u32,
    pub(super) pending_checkout: Vec<BackendId>,
    pub(super) checkout_error: Option<PoolError>,

    pub(super) merger: Option<Box<dyn ResultMerger>>,
    pub(super) merge_error: Option<MergeError>,
    pub(super) stream: Option<StreamAnalyzer>,
    /// Part of the current response already went to the client
    pub(super) fast_streamed: bool,
    pub(super) tcp_streamed: bool,
    /// Merged result held back until the implicit transaction commits
    pub(super) deferred: Vec<Bytes>,

    /// Statement ids prepared on the bound session
    pub(super) prepared: HashSet<u32>,
    pub(super) query_started: Instant,
    pub(super) query_label: &'static str,
    /// Tear down every attached session when the response is sent
    pub(super) discard_sessions: bool,
}

impl ConnContext {
    pub fn new(proxy: Arc<ProxyState>, conn_id: u32, client: Channel) -> Self {
        let config = &proxy.config;
        let xa = XaDriver::new(
            proxy.xid_generator.clone(),
            proxy.xa_log.clone(),
            config.xa.partitioned,
            config.xa.detailed_log,
        );
        let attrs = SessionAttrs {
            charset: config.server.default_charset.clone(),
            ..SessionAttrs::default()
        };
        Self {
            conn_id,
            client,
            client_caps: 0,
            user: String::new(),
            scramble: Vec::new(),
            authenticated: false,
            state: ConState::Init,
            prev_state: ConState::Init,
            attrs,
            sessions: Vec::new(),
            partial_request: None,
            request: Bytes::new(),
            command: None,
            plan: None,
            in_transaction: false,
            is_start_tran_command: false,
            dist_tran: false,
            implicit_xa: false,
            xa,
            xa_purpose: None,
            round: Round::default(),
            reconciler: Reconciler::new(),
            checkout_attempts: 0,
            pending_checkout: Vec::new(),
            checkout_error: None,
            merger: None,
            merge_error: None,
            stream: None,
            fast_streamed: false,
            tcp_streamed: false,
            deferred: Vec::new(),
            prepared: HashSet::new(),
            query_started: Instant::now(),
            query_label: "other",
            discard_sessions: false,
            proxy,
        }
    }

    pub fn state(&self) -> ConState {
        self.state
    }

    /// Explicit transaction or autocommit switched off
    pub(super) fn is_transactional(&self) -> bool {
        self.in_transaction || !self.attrs.autocommit
    }

    pub(super) fn xa_mode(&self) -> bool {
        self.proxy.behavior.mode() == ProxyMode::Shard && self.proxy.config.xa.enabled
    }

    pub(super) fn enter(&mut self, next: ConState) {
        tracing::trace!(conn_id = self.conn_id, from = %self.state, to = %next, "State change");
        self.prev_state = self.state;
        self.state = next;
    }

    pub(super) fn session_index(&self, backend: BackendId) -> Option<usize> {
        self.sessions.iter().position(|s| s.backend() == backend)
    }

    pub(super) fn attached_backends(&self) -> Vec<BackendId> {
        self.sessions.iter().map(BackendSession::backend).collect()
    }

    /// No statement followed BEGIN within the short wait. Nothing reached a
    /// backend yet, so the client drops back to autocommit with no open
    /// transaction and the normal idle budget applies.
    pub(super) fn expire_short_wait(&mut self) {
        self.is_start_tran_command = false;
        if self.xa.is_active() || self.sessions.iter().any(BackendSession::is_in_transaction) {
            return;
        }
        debug!(conn_id = self.conn_id, "No statement after BEGIN, back to autocommit");
        self.in_transaction = false;
        self.attrs.autocommit = true;
    }

    /// How long to wait for the next client command
    pub(super) fn idle_timeout(&self) -> Duration {
        let timeouts = &self.proxy.config.timeouts;
        let registry = self.proxy.pool.registry();
        let maintained = self.sessions.iter().any(|s| {
            registry
                .get(s.backend())
                .is_some_and(|b| b.state() == BackendState::Maintaining)
        });
        let ms = if self.is_start_tran_command {
            timeouts.short_wait_ms
        } else if maintained {
            timeouts.maintained_client_idle_ms
        } else if self.is_transactional() || self.xa.is_active() {
            timeouts.incomplete_tran_idle_ms
        } else {
            timeouts.client_idle_ms
        };
        Duration::from_millis(ms)
    }

    pub(super) fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.proxy.config.timeouts.backend_read_ms)
    }

    pub(super) fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.proxy.config.timeouts.backend_write_ms)
    }

    pub(super) fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.proxy.config.timeouts.connect_ms)
    }

    /// Forget everything about the statement that just finished
    pub(super) fn clear_statement(&mut self) {
        self.request = Bytes::new();
        self.command = None;
        self.plan = None;
        self.round = Round::default();
        self.reconciler = Reconciler::new();
        self.checkout_attempts = 0;
        self.pending_checkout.clear();
        self.checkout_error = None;
        self.merger = None;
        self.merge_error = None;
        self.stream = None;
        self.fast_streamed = false;
        self.tcp_streamed = false;
        self.implicit_xa = false;
        self.xa_purpose = None;
        self.deferred.clear();
    }
}

impl std::fmt::Debug for ConnContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnContext")
            .field("conn_id", &self.conn_id)
            .field("user", &self.user)
            .field("state", &self.state)
            .field("sessions", &self.sessions)
            .field("in_transaction", &self.in_transaction)
            .field("dist_tran", &self.dist_tran)
            .finish()
    }
}
