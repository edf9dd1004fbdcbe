//! Client-facing state handlers: handshake, authentication, command intake,
//! locally answered commands, replies and teardown.

use bytes::{Bytes, BytesMut};
use tracing::{debug, info, warn};

use crate::backend::SessionAttrs;
use crate::network::ChannelError;
use crate::plugin::{RoutePlan, RouteRequest, Target};
use crate::protocol::capabilities::{CLIENT_COMPRESS, CLIENT_MULTI_STATEMENTS};
use crate::protocol::packet::MAX_PACKET_SIZE;
use crate::protocol::{
    charset_id, charset_name, classify_query, error_codes, query_payload, status, ClientCommand, EofPacket, ErrPacket,
    HandshakeResponse, InitialHandshake, OkPacket, QueryKind, ResponseKind,
};

use super::context::{ConnContext, XaPurpose};
use super::state::{ConState, Outcome, WaitFor};

/// Charset id announced in the greeting when the configured name is unknown
const FALLBACK_CHARSET_ID: u8 = 45;

impl ConnContext {
    /// Run the handler of the current state
    pub(super) fn handle(&mut self) -> Outcome {
        match self.state {
            ConState::Init => self.on_init(),
            ConState::ConnectServer => Outcome::Goto(ConState::SendHandshake),
            ConState::SendHandshake => self.on_send_handshake(),
            ConState::ReadAuth => self.on_read_auth(),
            ConState::SendAuthResult => self.on_send_auth_result(),
            ConState::ReadQuery => self.on_read_query(),
            ConState::GetServerConnection => self.on_get_server_connection(),
            ConState::AdjustAttrs => self.on_adjust_attrs(),
            ConState::XaStart => self.on_xa_start(),
            ConState::SendQuery => self.on_send_query(),
            ConState::ReadQueryResult => self.on_read_query_result(),
            ConState::ReadMultiQueryResult => self.on_read_multi_query_result(),
            ConState::XaCommit => self.on_xa_commit(),
            ConState::SendQueryResult => self.on_send_result(false),
            ConState::SendError => self.on_send_result(true),
            ConState::Error => self.on_error(),
            ConState::CloseClient => Outcome::Goto(ConState::CloseServer),
            ConState::ClientQuit => {
                debug!(conn_id = self.conn_id, "Client sent QUIT");
                Outcome::Goto(ConState::CloseServer)
            }
            ConState::CloseServer => self.on_close_server(),
        }
    }

    fn on_init(&mut self) -> Outcome {
        debug!(conn_id = self.conn_id, peer = %self.client.peer(), "Client connected");
        Outcome::Goto(ConState::ConnectServer)
    }

    fn on_send_handshake(&mut self) -> Outcome {
        if self.scramble.is_empty() {
            let server = &self.proxy.config.server;
            let charset = charset_id(&server.default_charset).unwrap_or(FALLBACK_CHARSET_ID);
            let handshake = InitialHandshake::new(self.conn_id, &server.server_version, charset);
            self.scramble = handshake.auth_plugin_data();
            self.client.reset_packet_id();
            self.client.append_packet(handshake.encode());
        }
        self.flush_client_then(ConState::ReadAuth)
    }

    fn on_read_auth(&mut self) -> Outcome {
        let packet = match self.client.next_packet() {
            Ok(Some(packet)) => packet,
            Ok(None) => return Outcome::Wait(WaitFor::ClientRead, self.connect_timeout()),
            Err(e) => {
                warn!(conn_id = self.conn_id, error = %e, "Bad handshake response");
                return Outcome::Goto(ConState::CloseClient);
            }
        };

        match self.authenticate(&packet.payload) {
            Ok(response) => {
                self.user = response.username;
                self.client_caps = response.capability_flags;
                self.attrs.db = response.database.filter(|db| !db.is_empty());
                if let Some(name) = charset_name(response.character_set) {
                    self.attrs.charset = name.to_string();
                }
                self.attrs.multi_statements = response.capability_flags & CLIENT_MULTI_STATEMENTS != 0;
                self.authenticated = true;
                let ok = OkPacket::with_status(status::SERVER_STATUS_AUTOCOMMIT);
                self.client.append_packet(ok.encode(self.client_caps));
            }
            Err(err) => {
                warn!(conn_id = self.conn_id, reason = %err.error_message, "Client authentication failed");
                self.client.append_packet(err.encode(self.client_caps));
            }
        }
        Outcome::Goto(ConState::SendAuthResult)
    }

    fn authenticate(&mut self, payload: &[u8]) -> Result<HandshakeResponse, ErrPacket> {
        let denied = |msg: &str| ErrPacket::new(error_codes::ER_ACCESS_DENIED_ERROR, "28000", msg);
        if HandshakeResponse::is_ssl_request(payload) && !self.client.is_tls() {
            return Err(denied("SSL connections are not supported"));
        }
        let response = HandshakeResponse::parse(payload).ok_or_else(|| denied("Bad handshake"))?;
        self.client_caps = response.capability_flags;
        if response.capability_flags & CLIENT_COMPRESS != 0 && !self.client.is_compressed() {
            return Err(denied("Compressed protocol is not supported"));
        }
        let verified = self
            .proxy
            .credentials
            .get(&response.username)
            .is_some_and(|credential| credential.verify(&self.scramble, &response.auth_response));
        if !verified {
            return Err(denied(&format!(
                "Access denied for user '{}' (using password: {})",
                response.username,
                if response.auth_response.is_empty() { "NO" } else { "YES" }
            )));
        }
        Ok(response)
    }

    fn on_send_auth_result(&mut self) -> Outcome {
        if self.client.has_pending_writes() {
            return Outcome::Wait(WaitFor::ClientWrite, self.write_timeout());
        }
        if !self.authenticated {
            return Outcome::Goto(ConState::CloseClient);
        }
        info!(conn_id = self.conn_id, user = %self.user, db = ?self.attrs.db, "Client authenticated");
        self.client.reset_packet_id();
        Outcome::Goto(ConState::ReadQuery)
    }

    /// Assemble one logical command from the client channel
    fn read_command(&mut self) -> Result<Option<Bytes>, ChannelError> {
        while let Some(packet) = self.client.next_packet()? {
            let continues = packet.payload.len() == MAX_PACKET_SIZE;
            match self.partial_request.as_mut() {
                None if !continues => return Ok(Some(packet.payload)),
                None => self.partial_request = Some(BytesMut::from(&packet.payload[..])),
                Some(buf) => buf.extend_from_slice(&packet.payload),
            }
            if !continues {
                return Ok(self.partial_request.take().map(BytesMut::freeze));
            }
        }
        Ok(None)
    }

    fn on_read_query(&mut self) -> Outcome {
        let payload = match self.read_command() {
            Ok(Some(payload)) => payload,
            Ok(None) => return Outcome::Wait(WaitFor::ClientRead, self.idle_timeout()),
            Err(e) => {
                warn!(conn_id = self.conn_id, error = %e, "Client framing error");
                return Outcome::Goto(ConState::CloseClient);
            }
        };

        self.clear_statement();
        self.query_started = std::time::Instant::now();
        self.is_start_tran_command = false;
        let command = ClientCommand::parse(&payload);
        debug!(conn_id = self.conn_id, command = ?command.command(), "Received command");

        if let Some(outcome) = self.try_local(&command) {
            self.query_label = "local";
            return outcome;
        }

        if self.xa_mode() && self.is_transactional() {
            self.dist_tran = true;
        }
        let attached = self.attached_backends();
        let request = RouteRequest {
            command: &command,
            payload: &payload,
            in_transaction: self.is_transactional(),
            attached: &attached,
            has_prepared: !self.prepared.is_empty(),
        };
        let plan = match self.proxy.behavior.route_query(&request) {
            Ok(plan) => plan,
            Err(err) => {
                debug!(conn_id = self.conn_id, code = err.error_code, "Statement rejected by router");
                return self.reply_error(err);
            }
        };

        let registry = self.proxy.pool.registry();
        let target = match plan.targets.first().and_then(|t| registry.get(t.backend)) {
            Some(backend) if backend.is_rw() => "rw",
            _ => "ro",
        };
        self.proxy.metrics.record_route(target, plan.is_scatter());
        self.query_label = if plan.is_write { "write" } else { "read" };
        if plan.implicit_xa {
            self.dist_tran = true;
            self.implicit_xa = true;
        }
        debug!(
            conn_id = self.conn_id,
            targets = plan.targets.len(),
            write = plan.is_write,
            implicit_xa = plan.implicit_xa,
            "Routed statement"
        );

        self.request = payload;
        self.command = Some(command);
        self.plan = Some(plan);
        Outcome::Goto(ConState::GetServerConnection)
    }

    /// Commands the proxy answers without a backend
    fn try_local(&mut self, command: &ClientCommand) -> Option<Outcome> {
        let outcome = match command {
            ClientCommand::Quit => Outcome::Goto(ConState::ClientQuit),
            ClientCommand::Ping => self.reply_ok(),
            ClientCommand::InitDb(db) => {
                self.attrs.db = Some(db.clone());
                self.reply_ok()
            }
            ClientCommand::SetOption(option) => {
                self.attrs.multi_statements = *option == 0;
                let eof = EofPacket::new(self.status_flags());
                self.client.append_packet(eof.encode());
                Outcome::Goto(ConState::SendQueryResult)
            }
            ClientCommand::ResetConnection => {
                self.reset_connection();
                self.reply_ok()
            }
            ClientCommand::Other(cmd, _) => self.reply_error(ErrPacket::new(
                error_codes::ER_UNKNOWN_COM_ERROR,
                "08S01",
                &format!("Command {:?} is not supported by the proxy", cmd),
            )),
            ClientCommand::Query(sql) => return self.try_local_query(sql),
            _ => return None,
        };
        Some(outcome)
    }

    fn try_local_query(&mut self, sql: &str) -> Option<Outcome> {
        let outcome = match classify_query(sql) {
            QueryKind::Begin => {
                if !self.in_transaction {
                    self.in_transaction = true;
                    self.is_start_tran_command = true;
                }
                self.reply_ok()
            }
            QueryKind::Commit => self.end_transaction(true),
            QueryKind::Rollback => self.end_transaction(false),
            QueryKind::SetAutocommit(true) => {
                self.attrs.autocommit = true;
                if self.in_transaction || self.sessions.iter().any(|s| s.is_in_transaction()) || self.xa.is_active() {
                    self.end_transaction(true)
                } else {
                    self.reply_ok()
                }
            }
            QueryKind::SetAutocommit(false) => {
                self.attrs.autocommit = false;
                self.reply_ok()
            }
            QueryKind::SetNames(charset) => {
                self.attrs.charset = charset;
                self.reply_ok()
            }
            QueryKind::Use(db) => {
                self.attrs.db = Some(db);
                self.reply_ok()
            }
            QueryKind::Other => return None,
        };
        Some(outcome)
    }

    /// COMMIT or ROLLBACK from the client
    fn end_transaction(&mut self, commit: bool) -> Outcome {
        self.is_start_tran_command = false;
        if self.dist_tran && self.xa.is_active() {
            let purpose = if commit {
                XaPurpose::ClientCommit
            } else {
                self.xa.request_rollback();
                XaPurpose::ClientRollback
            };
            self.xa_purpose = Some(purpose);
            return Outcome::Goto(ConState::XaCommit);
        }

        self.dist_tran = false;
        self.in_transaction = false;
        let sql = if commit { "COMMIT" } else { "ROLLBACK" };
        let open: Vec<Target> = self
            .sessions
            .iter()
            .filter(|s| s.is_in_transaction() && !s.unavailable)
            .map(|s| Target {
                backend: s.backend(),
                payload: query_payload(sql),
            })
            .collect();
        if open.is_empty() {
            return self.reply_ok();
        }

        self.query_label = "transaction";
        self.plan = Some(RoutePlan {
            targets: open,
            kind: ResponseKind::Query,
            analysis: None,
            is_write: false,
            implicit_xa: false,
        });
        self.command = Some(ClientCommand::Query(sql.to_string()));
        Outcome::Goto(ConState::GetServerConnection)
    }

    fn reset_connection(&mut self) {
        if self.xa.is_active() {
            self.xa.reset(&mut self.sessions);
        }
        self.discard_sessions = self.sessions.iter().any(|s| s.is_in_transaction()) || self.dist_tran;
        self.dist_tran = false;
        self.in_transaction = false;
        self.prepared.clear();
        self.attrs = SessionAttrs {
            db: self.attrs.db.take(),
            charset: self.proxy.config.server.default_charset.clone(),
            ..SessionAttrs::default()
        };
    }

    pub(super) fn status_flags(&self) -> u16 {
        let mut flags = 0;
        if self.attrs.autocommit {
            flags |= status::SERVER_STATUS_AUTOCOMMIT;
        }
        if self.in_transaction || self.xa.is_active() {
            flags |= status::SERVER_STATUS_IN_TRANS;
        }
        flags
    }

    pub(super) fn reply_ok(&mut self) -> Outcome {
        let ok = OkPacket::with_status(self.status_flags());
        self.client.append_packet(ok.encode(self.client_caps));
        Outcome::Goto(ConState::SendQueryResult)
    }

    pub(super) fn reply_error(&mut self, err: ErrPacket) -> Outcome {
        self.client.append_packet(err.encode(self.client_caps));
        Outcome::Goto(ConState::SendError)
    }

    fn flush_client_then(&mut self, next: ConState) -> Outcome {
        if self.client.has_pending_writes() {
            Outcome::Wait(WaitFor::ClientWrite, self.write_timeout())
        } else {
            Outcome::Goto(next)
        }
    }

    /// Flush the response, then release or keep the sessions
    fn on_send_result(&mut self, is_error: bool) -> Outcome {
        if self.client.has_pending_writes() {
            return Outcome::Wait(WaitFor::ClientWrite, self.write_timeout());
        }

        let metrics = &self.proxy.metrics;
        metrics.record_query(self.query_label, self.query_started.elapsed().as_secs_f64());
        if is_error {
            metrics.record_query_error(self.query_label);
        }
        if let Some(ClientCommand::StmtClose { statement_id }) = &self.command {
            self.prepared.remove(statement_id);
        }

        self.release_sessions();
        self.clear_statement();
        self.client.reset_packet_id();
        Outcome::Goto(ConState::ReadQuery)
    }

    /// Check sessions back in unless transaction or statement state lives on them
    fn release_sessions(&mut self) {
        let pool = self.proxy.pool.clone();
        if self.discard_sessions {
            self.discard_sessions = false;
            for session in self.sessions.drain(..) {
                pool.discard(session);
            }
            return;
        }

        let bound = self.is_transactional()
            || self.dist_tran
            || self.xa.is_active()
            || !self.prepared.is_empty()
            || self.sessions.iter().any(|s| s.is_in_transaction());
        if !bound {
            for session in self.sessions.drain(..) {
                pool.checkin(session);
            }
            return;
        }
        if !self.xa.is_active() {
            let (lost, kept): (Vec<_>, Vec<_>) = self.sessions.drain(..).partition(|s| s.unavailable);
            self.sessions = kept;
            for session in lost {
                pool.discard(session);
            }
        }
    }

    fn on_error(&mut self) -> Outcome {
        warn!(conn_id = self.conn_id, prev_state = %self.prev_state, "Connection failed");
        self.discard_sessions = true;
        Outcome::Goto(ConState::CloseClient)
    }

    fn on_close_server(&mut self) -> Outcome {
        if self.xa.is_active() {
            // Branches that never reached PREPARE roll back when their connection closes
            warn!(conn_id = self.conn_id, xid = ?self.xa.xid(), "Closing with an open distributed transaction");
            self.xa.reset(&mut self.sessions);
            self.discard_sessions = true;
        }
        let pool = self.proxy.pool.clone();
        for session in self.sessions.drain(..) {
            if self.discard_sessions {
                pool.discard(session);
            } else {
                pool.checkin(session);
            }
        }
        Outcome::Close
    }
}

/// Flags a plan's single target sends with no response phase
pub(super) fn has_no_response(command: Option<&ClientCommand>) -> bool {
    command.is_some_and(|c| c.command().has_no_response())
}
