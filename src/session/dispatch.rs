//! Backend-facing state handlers: session checkout, attribute
//! reconciliation, fan-out, response collection and the XA sequence.

use bytes::Bytes;
use tracing::{debug, error, info, warn};

use crate::backend::{BackendSession, DispatchState};
use crate::merge::MergeError;
use crate::pool::backoff_delay;
use crate::protocol::{error_codes, query_payload, ClientCommand, ErrPacket};
use crate::xa::{XaOutcome, XaState, XaStep};

use super::collect::{passthrough, Round, RoundProgress};
use super::context::{ConnContext, XaPurpose};
use super::handlers::has_no_response;
use super::reconcile::Wanted;
use super::state::{ConState, Outcome, WaitFor};
use super::stream::StreamAnalyzer;

fn proxy_error(message: impl AsRef<str>) -> ErrPacket {
    ErrPacket::new(error_codes::ER_UNKNOWN_ERROR, "HY000", message.as_ref())
}

fn xa_rolled_back(reason: &str) -> ErrPacket {
    ErrPacket::new(
        error_codes::ER_XAER_RMFAIL,
        "XAE07",
        &format!("Distributed transaction rolled back: {}", reason),
    )
}

impl ConnContext {
    /// Wait on whatever the current round still needs
    fn poll_round(&mut self) -> Option<Outcome> {
        match self.round.poll(&mut self.sessions) {
            RoundProgress::NeedWrite => Some(Outcome::Wait(WaitFor::BackendWrite, self.write_timeout())),
            RoundProgress::NeedRead => Some(Outcome::Wait(WaitFor::BackendRead, self.read_timeout())),
            RoundProgress::Done => None,
        }
    }

    pub(super) fn on_get_server_connection(&mut self) -> Outcome {
        let Some(plan) = self.plan.as_ref() else {
            error!(conn_id = self.conn_id, "No route plan while acquiring sessions");
            return Outcome::Goto(ConState::Error);
        };

        if let Some(err) = self.checkout_error.take() {
            let pool = &self.proxy.pool;
            if !err.is_retryable() {
                warn!(conn_id = self.conn_id, error = %err, "Cannot acquire backend session");
                self.proxy.metrics.record_backend_error("checkout");
                return self.reply_error(proxy_error(err.to_string()));
            }
            self.checkout_attempts += 1;
            if self.checkout_attempts >= pool.config().retry_max_attempts {
                warn!(conn_id = self.conn_id, attempts = self.checkout_attempts, "Backend pool exhausted");
                self.proxy.metrics.pool_exhausted_total.inc();
                return self.reply_error(ErrPacket::new(
                    error_codes::ER_CON_COUNT_ERROR,
                    "08004",
                    "Service unavailable: no backend connection available",
                ));
            }
            let delay = backoff_delay(self.checkout_attempts - 1, pool.config());
            debug!(conn_id = self.conn_id, attempt = self.checkout_attempts, ?delay, "Retrying checkout");
            return Outcome::Wait(WaitFor::Timer, delay);
        }

        let mut missing = Vec::new();
        for target in &plan.targets {
            if self.session_index(target.backend).is_none() && !missing.contains(&target.backend) {
                missing.push(target.backend);
            }
        }
        if !missing.is_empty() {
            let budget = self.connect_timeout() * (missing.len() as u32 + 1);
            self.pending_checkout = missing;
            return Outcome::Wait(WaitFor::Checkout, budget);
        }

        let targets: Vec<_> = plan.targets.iter().map(|t| t.backend).collect();
        for session in self.sessions.iter_mut() {
            session.begin_round();
        }
        for backend in targets {
            let Some(idx) = self.session_index(backend) else {
                error!(conn_id = self.conn_id, backend, "Target session missing after checkout");
                return Outcome::Goto(ConState::Error);
            };
            let session = &mut self.sessions[idx];
            if session.unavailable {
                let err = proxy_error(format!("Lost connection to backend {}", session.addr()));
                return self.fail_statement(err);
            }
            session.participated = true;
        }
        self.checkout_attempts = 0;
        Outcome::Goto(ConState::AdjustAttrs)
    }

    /// Attributes every participating session must hold
    fn wanted_attrs(&self) -> (crate::backend::SessionAttrs, bool) {
        let mut attrs = self.attrs.clone();
        if self.dist_tran {
            // XA branches run with autocommit on; XA START opens the transaction
            attrs.autocommit = true;
        }
        (attrs, self.in_transaction && !self.dist_tran)
    }

    pub(super) fn on_adjust_attrs(&mut self) -> Outcome {
        let (attrs, transaction) = self.wanted_attrs();
        let wanted = Wanted {
            attrs: &attrs,
            transaction,
        };

        if self.round.expected() > 0 {
            if let Some(wait) = self.poll_round() {
                return wait;
            }
            let round = std::mem::take(&mut self.round);
            if let Err(err) = self.reconciler.finish_round(&mut self.sessions, round.members(), wanted) {
                warn!(conn_id = self.conn_id, error = %err.error_message, "Session reconciliation failed");
                self.proxy.metrics.record_backend_error("reconcile");
                if self.xa.is_active() {
                    self.xa.mark_failed(err.error_message.clone());
                } else {
                    self.discard_sessions = true;
                    self.in_transaction = false;
                }
                return self.fail_statement(err);
            }
        }

        if let Some(commands) = self.reconciler.next_round(&mut self.sessions, wanted) {
            self.round = Round::start(&mut self.sessions, commands);
            if self.round.expected() > 0 {
                return Outcome::Wait(WaitFor::BackendWrite, self.write_timeout());
            }
        }

        let needs_branch = self
            .sessions
            .iter()
            .any(|s| s.participated && !s.unavailable && s.xa == XaState::None);
        if self.dist_tran && needs_branch {
            Outcome::Goto(ConState::XaStart)
        } else {
            Outcome::Goto(ConState::SendQuery)
        }
    }

    pub(super) fn on_xa_start(&mut self) -> Outcome {
        if self.round.expected() > 0 {
            if let Some(wait) = self.poll_round() {
                return wait;
            }
            self.round = Round::default();
            self.xa.complete_round(&mut self.sessions);
            if self.xa.is_failed() {
                self.xa.request_rollback();
                self.xa_purpose = Some(XaPurpose::Abort(xa_rolled_back("XA START failed")));
                return Outcome::Goto(ConState::XaCommit);
            }
            return Outcome::Goto(ConState::SendQuery);
        }

        match self.xa.start_round(&mut self.sessions) {
            Some(round) => {
                let commands = round
                    .commands
                    .into_iter()
                    .map(|(idx, sql)| (idx, query_payload(&sql)))
                    .collect();
                self.round = Round::start(&mut self.sessions, commands);
                Outcome::Wait(WaitFor::BackendWrite, self.write_timeout())
            }
            None => Outcome::Goto(ConState::SendQuery),
        }
    }

    pub(super) fn on_send_query(&mut self) -> Outcome {
        let Some(plan) = self.plan.as_ref() else {
            error!(conn_id = self.conn_id, "No route plan at dispatch");
            return Outcome::Goto(ConState::Error);
        };
        let commands: Vec<(usize, Bytes)> = plan
            .targets
            .iter()
            .filter_map(|t| self.session_index(t.backend).map(|idx| (idx, t.payload.clone())))
            .collect();
        let (kind, is_write, scatter) = (plan.kind, plan.is_write, plan.is_scatter());
        let analysis = plan.analysis.clone();

        for session in self.sessions.iter_mut() {
            session.participated = false;
        }
        self.round = Round::start(&mut self.sessions, commands);
        if self.round.expected() == 0 {
            return self.fail_statement(proxy_error("No backend session available for the statement"));
        }
        if self.dist_tran {
            self.xa.mark_query(&mut self.sessions, is_write);
        } else if is_write {
            for idx in self.round.members().to_vec() {
                self.sessions[idx].has_written = true;
            }
        }

        let streaming = &self.proxy.config.streaming;
        if scatter {
            let merger = self
                .proxy
                .behavior
                .merger(analysis, self.round.expected(), self.client_caps);
            self.merger = Some(merger);
            return Outcome::Goto(ConState::ReadMultiQueryResult);
        }

        let no_response = has_no_response(self.command.as_ref());
        if streaming.fast_stream && kind.carries_rows() && !self.dist_tran && !no_response {
            let idx = self.round.members()[0];
            let first_id = self.sessions[idx].channel_mut().last_packet_id().wrapping_add(1);
            self.stream = Some(StreamAnalyzer::new(kind, first_id));
        }
        Outcome::Goto(ConState::ReadQueryResult)
    }

    /// Report a failed single-session response and drop the session
    fn backend_lost(&mut self, idx: usize) -> Outcome {
        self.proxy.metrics.record_backend_error("query");
        let addr = self.sessions[idx].addr().to_string();
        if self.dist_tran {
            self.xa.check_query_round(&mut self.sessions);
        } else {
            let session = self.sessions.remove(idx);
            self.proxy.pool.discard(session);
            if self.in_transaction {
                warn!(conn_id = self.conn_id, backend = %addr, "Transaction lost with its backend");
                self.in_transaction = false;
            }
        }
        self.fail_statement(proxy_error(format!("Lost connection to backend {}", addr)))
    }

    pub(super) fn on_read_query_result(&mut self) -> Outcome {
        if self.stream.is_some() {
            return self.stream_response();
        }
        if let Some(wait) = self.poll_round() {
            return wait;
        }
        let Some(idx) = self.round.members().first().copied() else {
            error!(conn_id = self.conn_id, "Single response without a session");
            return Outcome::Goto(ConState::Error);
        };
        if self.sessions[idx].dispatch_state() == DispatchState::Error {
            return self.backend_lost(idx);
        }
        if has_no_response(self.command.as_ref()) {
            return Outcome::Goto(ConState::SendQueryResult);
        }

        let session = &mut self.sessions[idx];
        let frames = session.take_response();
        let summary = session.summary().cloned();
        if let (Some(ClientCommand::StmtPrepare(_)), Some(id)) =
            (&self.command, summary.as_ref().and_then(|s| s.statement_id))
        {
            self.prepared.insert(id);
        }
        if self.dist_tran {
            self.xa.check_query_round(&mut self.sessions);
        }
        passthrough(&mut self.client, frames);
        match summary.as_ref().and_then(|s| s.error()) {
            Some(_) => Outcome::Goto(ConState::SendError),
            None => Outcome::Goto(ConState::SendQueryResult),
        }
    }

    /// Forward a single-session response as it arrives
    fn stream_response(&mut self) -> Outcome {
        let Some(idx) = self.round.members().first().copied() else {
            error!(conn_id = self.conn_id, "Stream without a session");
            return Outcome::Goto(ConState::Error);
        };
        let session = &mut self.sessions[idx];
        match session.dispatch_state() {
            DispatchState::Write => return Outcome::Wait(WaitFor::BackendWrite, self.write_timeout()),
            DispatchState::Error if self.fast_streamed => {
                warn!(conn_id = self.conn_id, backend = %session.addr(), "Backend lost mid-stream");
                return Outcome::Goto(ConState::Error);
            }
            DispatchState::Error => {
                self.stream = None;
                return self.backend_lost(idx);
            }
            _ => {}
        }

        let raw = session.channel_mut().take_raw();
        let Some(analyzer) = self.stream.as_mut() else {
            return Outcome::Goto(ConState::Error);
        };
        match analyzer.feed(&raw) {
            Ok(forward) => {
                if !forward.bytes.is_empty() {
                    self.fast_streamed = true;
                    self.client.append_raw(forward.bytes, forward.last_id);
                }
            }
            Err(e) => {
                warn!(conn_id = self.conn_id, backend = %session.addr(), error = %e, "Malformed streamed response");
                session.set_dispatch_state(DispatchState::Error);
                session.unavailable = true;
                if self.fast_streamed {
                    return Outcome::Goto(ConState::Error);
                }
                self.stream = None;
                return self.backend_lost(idx);
            }
        }

        if analyzer.is_finished() {
            let failed = analyzer.summary().error().is_some();
            if let Some(analyzer) = self.stream.take() {
                session.finish_streamed(analyzer.into_summary());
            }
            self.round = Round::default();
            return Outcome::Goto(if failed { ConState::SendError } else { ConState::SendQueryResult });
        }
        if self.client.pending_write_bytes() >= self.proxy.config.streaming.stream_threshold_bytes {
            return Outcome::Wait(WaitFor::ClientWrite, self.write_timeout());
        }
        Outcome::Wait(WaitFor::BackendRead, self.read_timeout())
    }

    pub(super) fn on_read_multi_query_result(&mut self) -> Outcome {
        let progress = self.round.poll(&mut self.sessions);
        let Some(merger) = self.merger.as_mut() else {
            error!(conn_id = self.conn_id, "Multi-session response without a merger");
            return Outcome::Goto(ConState::Error);
        };

        while let Some(idx) = self.round.take_ready() {
            let session: &mut BackendSession = &mut self.sessions[idx];
            if session.dispatch_state() == DispatchState::Error {
                self.proxy.metrics.record_backend_error("query");
                if self.merge_error.is_none() {
                    let message = format!("Lost connection to backend {}", session.addr());
                    self.merge_error = Some(if self.tcp_streamed {
                        MergeError::Fatal(message)
                    } else {
                        MergeError::Recoverable(proxy_error(message))
                    });
                }
                continue;
            }
            let frames = session.take_response();
            if self.merge_error.is_some() {
                continue;
            }
            if let Err(e) = merger.push(&frames) {
                self.merge_error = Some(e);
            }
        }

        let streaming = &self.proxy.config.streaming;
        if streaming.tcp_stream && !self.implicit_xa && self.merge_error.is_none() && merger.is_streamable() {
            let output = merger.take_output();
            if !output.is_empty() {
                self.tcp_streamed = true;
                for payload in output {
                    self.client.append_packet(payload);
                }
            }
        }

        match progress {
            RoundProgress::NeedWrite => return Outcome::Wait(WaitFor::BackendWrite, self.write_timeout()),
            RoundProgress::NeedRead => {
                // the first early flush only needs the header part
                let threshold = if self.fast_streamed {
                    streaming.stream_threshold_bytes
                } else {
                    streaming.header_size_threshold
                };
                if self.tcp_streamed && self.client.pending_write_bytes() >= threshold {
                    self.fast_streamed = true;
                    return Outcome::Wait(WaitFor::ClientWrite, self.write_timeout());
                }
                return Outcome::Wait(WaitFor::BackendRead, self.read_timeout());
            }
            RoundProgress::Done => {}
        }

        if self.dist_tran {
            self.xa.check_query_round(&mut self.sessions);
        }
        match self.merge_error.take() {
            Some(MergeError::Fatal(message)) => {
                error!(conn_id = self.conn_id, reason = %message, "Merge failed after output was sent");
                self.proxy.metrics.merge_failures_total.inc();
                Outcome::Goto(ConState::Error)
            }
            Some(MergeError::Recoverable(err)) => {
                self.proxy.metrics.merge_failures_total.inc();
                if !self.dist_tran {
                    let pool = self.proxy.pool.clone();
                    let (lost, kept): (Vec<_>, Vec<_>) = self.sessions.drain(..).partition(|s| s.unavailable);
                    self.sessions = kept;
                    for session in lost {
                        pool.discard(session);
                    }
                }
                self.fail_statement(err)
            }
            None => {
                let output = self.merger.as_mut().map(|m| m.take_output()).unwrap_or_default();
                if self.implicit_xa {
                    self.deferred = output;
                    self.xa_purpose = Some(XaPurpose::ImplicitCommit);
                    return Outcome::Goto(ConState::XaCommit);
                }
                for payload in output {
                    self.client.append_packet(payload);
                }
                Outcome::Goto(ConState::SendQueryResult)
            }
        }
    }

    /// Send `err` for the current statement. An implicit distributed
    /// transaction is rolled back first.
    pub(super) fn fail_statement(&mut self, err: ErrPacket) -> Outcome {
        if self.implicit_xa && self.xa.is_active() {
            self.xa.request_rollback();
            self.xa_purpose = Some(XaPurpose::Abort(err));
            return Outcome::Goto(ConState::XaCommit);
        }
        self.reply_error(err)
    }

    pub(super) fn on_xa_commit(&mut self) -> Outcome {
        if self.round.expected() > 0 {
            if let Some(wait) = self.poll_round() {
                return wait;
            }
            self.round = Round::default();
            self.xa.complete_round(&mut self.sessions);
        }

        loop {
            match self.xa.next_step(&mut self.sessions) {
                XaStep::Send(round) => {
                    let commands = round
                        .commands
                        .into_iter()
                        .map(|(idx, sql)| (idx, query_payload(&sql)))
                        .collect();
                    self.round = Round::start(&mut self.sessions, commands);
                    if self.round.expected() > 0 {
                        return Outcome::Wait(WaitFor::BackendWrite, self.write_timeout());
                    }
                    self.round = Round::default();
                    self.xa.complete_round(&mut self.sessions);
                }
                XaStep::Done(outcome) => return self.finish_xa(outcome),
            }
        }
    }

    fn finish_xa(&mut self, outcome: XaOutcome) -> Outcome {
        let purpose = self.xa_purpose.take().unwrap_or(XaPurpose::ClientCommit);
        let label = match &outcome {
            XaOutcome::Committed { one_phase: true } => "one_phase",
            XaOutcome::Committed { one_phase: false } => "commit",
            XaOutcome::RolledBack => "rollback",
            XaOutcome::Failed { .. } => "failed",
            XaOutcome::Abandoned { .. } => "abandoned",
        };
        self.proxy.metrics.record_xa(label);
        info!(conn_id = self.conn_id, outcome = label, "Distributed transaction finished");

        self.xa.reset(&mut self.sessions);
        self.dist_tran = false;
        self.in_transaction = false;
        let deferred = std::mem::take(&mut self.deferred);

        match (outcome, purpose) {
            (XaOutcome::Abandoned { reason }, _) => {
                self.proxy.metrics.xa_mending_total.inc();
                self.discard_sessions = true;
                self.reply_error(xa_rolled_back(&reason))
            }
            (_, XaPurpose::Abort(err)) => self.reply_error(err),
            (XaOutcome::Committed { .. }, XaPurpose::ImplicitCommit) => {
                for payload in deferred {
                    self.client.append_packet(payload);
                }
                Outcome::Goto(ConState::SendQueryResult)
            }
            (XaOutcome::Committed { .. }, _) => self.reply_ok(),
            (XaOutcome::RolledBack, XaPurpose::ClientRollback) => self.reply_ok(),
            (XaOutcome::Failed { reason }, _) => {
                if !self.sessions.iter().all(BackendSession::is_reusable) {
                    self.discard_sessions = true;
                }
                self.reply_error(xa_rolled_back(&reason))
            }
            (XaOutcome::RolledBack, _) => self.reply_error(xa_rolled_back("rollback requested")),
        }
    }
}

