//! Distributed transaction sequencing across backend sessions.
//!
//! The driver never touches sockets. It tells the connection which XA
//! statement each session gets in the next round, and after the round has
//! been collected it reads every session's outcome and decides the next
//! phase. Rounds run in this order:
//!
//! ```text
//! START -> (queries) -> END -> PREPARE -> COMMIT -> CANDIDATE_OVER -> OVER
//!                               \-> COMMIT ONE PHASE -/
//! any failure up to COMMIT  -> [END for active branches] -> ROLLBACK -> CANDIDATE_OVER -> OVER
//! ```

use std::sync::Arc;

use tracing::{error, info, warn};

use crate::backend::{BackendSession, DispatchState};
use crate::protocol::error_codes::*;

use super::log::{TransactionLog, XaLogRecord};
use super::state::{XaPhase, XaState};
use super::xid::{XaCommand, XidGenerator};

/// Server errors that doom the distributed transaction
pub fn is_xa_fatal(code: u16) -> bool {
    matches!(
        code,
        ER_LOCK_DEADLOCK | ER_LOCK_WAIT_TIMEOUT | ER_XA_RBDEADLOCK | ER_XA_RBTIMEOUT | ER_XA_RBROLLBACK | ER_XAER_RMFAIL
    )
}

/// Statements for one round, by session index
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XaRound {
    pub commands: Vec<(usize, String)>,
}

/// How a finished transaction ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum XaOutcome {
    Committed { one_phase: bool },
    /// Rolled back because the client asked for it
    RolledBack,
    /// Rolled back after a failure
    Failed { reason: String },
    /// No session was left to talk to; the backends must be torn down
    Abandoned { reason: String },
}

/// Next step of the commit sequence
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum XaStep {
    Send(XaRound),
    Done(XaOutcome),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pending {
    Nothing,
    Start,
    End,
    Prepare,
    CommitOnePhase,
    Commit,
    /// XA END for branches that were still active when the failure hit
    RollbackEnd,
    Rollback,
}

pub struct XaDriver {
    phase: XaPhase,
    xid: Option<String>,
    /// Number of branches started in partitioned mode
    branches: usize,
    partitioned: bool,
    detailed_log: bool,
    generator: Arc<XidGenerator>,
    log: Arc<dyn TransactionLog>,
    failed: Option<String>,
    rollback_requested: bool,
    one_phase: bool,
    /// Most branches seen holding changes so far
    writers: usize,
    pending: Pending,
    round: Vec<usize>,
    /// Participants whose branch outcome is uncertain
    suspects: Vec<String>,
}

impl XaDriver {
    pub fn new(
        generator: Arc<XidGenerator>,
        log: Arc<dyn TransactionLog>,
        partitioned: bool,
        detailed_log: bool,
    ) -> Self {
        Self {
            phase: XaPhase::default(),
            xid: None,
            branches: 0,
            partitioned,
            detailed_log,
            generator,
            log,
            failed: None,
            rollback_requested: false,
            one_phase: false,
            writers: 0,
            pending: Pending::Nothing,
            round: Vec::new(),
            suspects: Vec::new(),
        }
    }

    pub fn state(&self) -> XaState {
        self.phase.current()
    }

    pub fn history(&self) -> &[XaState] {
        self.phase.history()
    }

    pub fn xid(&self) -> Option<&str> {
        self.xid.as_deref()
    }

    pub fn is_active(&self) -> bool {
        self.phase.current().is_active()
    }

    pub fn is_failed(&self) -> bool {
        self.failed.is_some()
    }

    /// Record a failure; the commit sequence will roll back
    pub fn mark_failed(&mut self, reason: impl Into<String>) {
        if self.failed.is_none() {
            let reason = reason.into();
            warn!(target: "cetus::xa", xid = ?self.xid, reason = %reason, "Distributed transaction failed");
            self.failed = Some(reason);
        }
    }

    pub fn request_rollback(&mut self) {
        self.rollback_requested = true;
    }

    /// XA START for every participating session that has no branch yet.
    /// Opens the transaction on first use.
    pub fn start_round(&mut self, sessions: &mut [BackendSession]) -> Option<XaRound> {
        let xid = match &self.xid {
            Some(xid) if self.phase.current().is_active() => xid.clone(),
            _ => {
                let xid = self.generator.next_xid();
                if let Err(e) = self.phase.advance(XaState::Start) {
                    error!(target: "cetus::xa", error = %e, "Cannot open distributed transaction");
                    return None;
                }
                info!(target: "cetus::xa", xid = %xid, "Distributed transaction opened");
                self.xid = Some(xid.clone());
                self.reset_flags();
                xid
            }
        };

        let mut commands = Vec::new();
        for (idx, session) in sessions.iter_mut().enumerate() {
            if !session.participated || session.xa != XaState::None || session.unavailable {
                continue;
            }
            let branch = if self.partitioned {
                self.branches += 1;
                XidGenerator::branch(&xid, self.branches)
            } else {
                xid.clone()
            };
            commands.push((idx, XaCommand::Start.sql(&branch)));
            session.xid = Some(branch);
            session.xa = XaState::Start;
        }
        if commands.is_empty() {
            return None;
        }
        Some(self.begin_round(Pending::Start, sessions, commands))
    }

    /// The statement for the real query went out to these sessions
    pub fn mark_query(&mut self, sessions: &mut [BackendSession], is_write: bool) {
        for session in sessions.iter_mut().filter(|s| s.participated && s.xa.is_active()) {
            session.xa = XaState::Query;
            if is_write {
                session.has_written = true;
            }
        }
        if let Err(e) = self.phase.advance(XaState::Query) {
            error!(target: "cetus::xa", error = %e, "Out of order XA query");
        }
    }

    /// Inspect a collected query round for errors that doom the transaction
    pub fn check_query_round(&mut self, sessions: &mut [BackendSession]) {
        for session in sessions.iter_mut().filter(|s| s.participated) {
            if session.dispatch_state() == DispatchState::Error {
                session.unavailable = true;
                self.mark_failed(format!("{} lost during query", session.label()));
            } else if let Some(err) = session.summary().and_then(|s| s.error()) {
                if is_xa_fatal(err.error_code) {
                    self.mark_failed(format!("{} returned {}", session.label(), err.error_code));
                }
            }
        }
    }

    /// Decide the next commit (or rollback) round
    pub fn next_step(&mut self, sessions: &mut [BackendSession]) -> XaStep {
        let workers = worker_indexes(sessions);
        if workers.is_empty() && self.pending != Pending::Rollback {
            return self.abandon("no backend session left");
        }

        let rolling_back = self.failed.is_some() || self.rollback_requested;
        match self.pending {
            Pending::Nothing | Pending::Start if rolling_back => self.rollback_or_end(sessions),
            Pending::Nothing | Pending::Start => {
                self.count_writers(sessions);
                self.advance(XaState::End);
                let commands = self.commands_for(sessions, &workers, XaCommand::End);
                for idx in &workers {
                    sessions[*idx].xa = XaState::End;
                }
                XaStep::Send(self.begin_round(Pending::End, sessions, commands))
            }
            Pending::End | Pending::Prepare | Pending::CommitOnePhase | Pending::Commit if rolling_back => {
                self.rollback_or_end(sessions)
            }
            Pending::End => {
                self.one_phase = self.decide_one_phase(sessions, &workers);
                self.advance(XaState::Prepare);
                let (command, pending) = if self.one_phase {
                    (XaCommand::CommitOnePhase, Pending::CommitOnePhase)
                } else {
                    (XaCommand::Prepare, Pending::Prepare)
                };
                let commands = self.commands_for(sessions, &workers, command);
                for idx in &workers {
                    sessions[*idx].xa = XaState::Prepare;
                }
                XaStep::Send(self.begin_round(pending, sessions, commands))
            }
            Pending::Prepare => {
                self.advance(XaState::Commit);
                let commands = self.commands_for(sessions, &workers, XaCommand::Commit);
                for idx in &workers {
                    sessions[*idx].xa = XaState::Commit;
                }
                XaStep::Send(self.begin_round(Pending::Commit, sessions, commands))
            }
            Pending::CommitOnePhase | Pending::Commit => {
                let one_phase = self.pending == Pending::CommitOnePhase;
                self.finish(sessions);
                XaStep::Done(XaOutcome::Committed { one_phase })
            }
            Pending::RollbackEnd => self.rollback_round(sessions),
            Pending::Rollback => {
                self.finish(sessions);
                XaStep::Done(match self.failed.take() {
                    Some(reason) => XaOutcome::Failed { reason },
                    None => XaOutcome::RolledBack,
                })
            }
        }
    }

    /// Read the outcome of the round just collected
    pub fn complete_round(&mut self, sessions: &mut [BackendSession]) {
        let round = std::mem::take(&mut self.round);
        for idx in round {
            let Some(session) = sessions.get_mut(idx) else {
                error!(target: "cetus::xa", idx, "Round names a missing session");
                continue;
            };
            let label = session.label();
            if session.dispatch_state() == DispatchState::Error {
                // The branch outcome on that server is now unknown
                session.unavailable = true;
                self.suspects.push(label.clone());
                if self.pending != Pending::Rollback {
                    self.mark_failed(format!("{} lost during {:?}", label, self.pending));
                }
                continue;
            }
            if let Some(err) = session.summary().and_then(|s| s.error()) {
                match self.pending {
                    Pending::Rollback | Pending::RollbackEnd => {
                        warn!(target: "cetus::xa", participant = %label, code = err.error_code, "Rollback error ignored");
                    }
                    Pending::Commit => {
                        self.suspects.push(label.clone());
                        self.mark_failed(format!("{} rejected commit: {}", label, err.error_message));
                    }
                    _ => {
                        self.suspects.push(label.clone());
                        self.mark_failed(format!("{} returned {}: {}", label, err.error_code, err.error_message));
                    }
                }
            }
        }
        self.suspects.dedup();
    }

    /// Drop all transaction state (client reset or disconnect)
    pub fn reset(&mut self, sessions: &mut [BackendSession]) {
        for session in sessions.iter_mut() {
            session.end_transaction();
        }
        self.phase.reset();
        self.xid = None;
        self.reset_flags();
    }

    fn reset_flags(&mut self) {
        self.failed = None;
        self.rollback_requested = false;
        self.one_phase = false;
        self.writers = 0;
        self.pending = Pending::Nothing;
        self.round.clear();
        self.suspects.clear();
        self.branches = 0;
    }

    fn rollback_or_end(&mut self, sessions: &mut [BackendSession]) -> XaStep {
        if self.phase.current() != XaState::Rollback {
            self.advance(XaState::Rollback);
        }
        let active: Vec<usize> = worker_indexes(sessions)
            .into_iter()
            .filter(|idx| matches!(sessions[*idx].xa, XaState::Start | XaState::Query))
            .collect();
        if active.is_empty() {
            return self.rollback_round(sessions);
        }
        let commands = self.commands_for(sessions, &active, XaCommand::End);
        for idx in &active {
            sessions[*idx].xa = XaState::End;
        }
        XaStep::Send(self.begin_round(Pending::RollbackEnd, sessions, commands))
    }

    fn rollback_round(&mut self, sessions: &mut [BackendSession]) -> XaStep {
        let workers = worker_indexes(sessions);
        if let Some(xid) = self.xid.clone() {
            if !self.suspects.is_empty() {
                let reason = self.failed.clone().unwrap_or_else(|| "rollback".to_string());
                let record = XaLogRecord::mend(&xid, XaCommand::Rollback.sql(&xid), self.suspects.clone(), reason);
                warn!(target: "cetus::xa", xid = %xid, participants = ?self.suspects, "Mending entry written");
                if let Err(e) = self.log.append(record) {
                    error!(target: "cetus::xa", xid = %xid, error = %e, "Failed to write mending entry");
                }
            }
        }
        if workers.is_empty() {
            return self.abandon("no backend session left for rollback");
        }
        let commands = self.commands_for(sessions, &workers, XaCommand::Rollback);
        for idx in &workers {
            sessions[*idx].xa = XaState::Rollback;
        }
        XaStep::Send(self.begin_round(Pending::Rollback, sessions, commands))
    }

    fn abandon(&mut self, reason: &str) -> XaStep {
        let reason = self.failed.take().unwrap_or_else(|| reason.to_string());
        if let Some(xid) = &self.xid {
            error!(target: "cetus::xa", xid = %xid, reason = %reason, "Distributed transaction abandoned");
            let record = XaLogRecord::mend(xid, "ABANDON", self.suspects.clone(), reason.clone());
            if let Err(e) = self.log.append(record) {
                error!(target: "cetus::xa", xid = %xid, error = %e, "Failed to write mending entry");
            }
        }
        self.phase.force_over();
        self.pending = Pending::Nothing;
        self.round.clear();
        XaStep::Done(XaOutcome::Abandoned { reason })
    }

    fn finish(&mut self, sessions: &mut [BackendSession]) {
        self.advance(XaState::CandidateOver);
        self.advance(XaState::Over);
        if let Some(xid) = &self.xid {
            info!(target: "cetus::xa", xid = %xid, history = ?self.phase.history(), "Distributed transaction over");
        }
        for session in sessions.iter_mut() {
            session.end_transaction();
        }
        self.pending = Pending::Nothing;
    }

    /// Branches with changes decide both the commit mode and whether
    /// phases are logged; the count only grows within one transaction
    fn count_writers(&mut self, sessions: &[BackendSession]) {
        let writers = sessions.iter().filter(|s| s.xa.is_active() && s.has_written).count();
        self.writers = self.writers.max(writers);
    }

    fn advance(&mut self, to: XaState) {
        if let Err(e) = self.phase.advance(to) {
            error!(target: "cetus::xa", error = %e, "XA phase violation");
        }
    }

    /// One-phase when at most one branch can hold changes, or when every
    /// partition lives on the same server
    fn decide_one_phase(&self, sessions: &[BackendSession], workers: &[usize]) -> bool {
        if workers.len() <= 1 || self.writers <= 1 {
            return true;
        }
        if self.partitioned {
            let first = sessions[workers[0]].addr();
            return workers.iter().all(|idx| sessions[*idx].addr() == first);
        }
        false
    }

    fn commands_for(&self, sessions: &[BackendSession], targets: &[usize], command: XaCommand) -> Vec<(usize, String)> {
        let global = self.xid.clone().unwrap_or_default();
        targets
            .iter()
            .map(|idx| {
                let xid = sessions[*idx].xid.as_deref().unwrap_or(&global);
                (*idx, command.sql(xid))
            })
            .collect()
    }

    fn begin_round(&mut self, pending: Pending, sessions: &[BackendSession], commands: Vec<(usize, String)>) -> XaRound {
        self.pending = pending;
        self.round = commands.iter().map(|(idx, _)| *idx).collect();
        self.count_writers(sessions);

        let should_log = self.writers > 1 || self.detailed_log;
        if let (true, Some(xid)) = (should_log, &self.xid) {
            for (command, participants) in group_by_command(sessions, &commands) {
                info!(target: "cetus::xa", xid = %xid, command = %command, participants = ?participants, "XA phase");
                if let Err(e) = self.log.append(XaLogRecord::phase(xid, command, participants)) {
                    warn!(target: "cetus::xa", xid = %xid, error = %e, "Failed to log XA phase");
                }
            }
        }
        XaRound { commands }
    }
}

fn worker_indexes(sessions: &[BackendSession]) -> Vec<usize> {
    sessions
        .iter()
        .enumerate()
        .filter(|(_, s)| s.xa.is_active() && !s.unavailable)
        .map(|(idx, _)| idx)
        .collect()
}

/// Partitioned branches each get their own statement text
fn group_by_command(sessions: &[BackendSession], commands: &[(usize, String)]) -> Vec<(String, Vec<String>)> {
    let mut grouped: Vec<(String, Vec<String>)> = Vec::new();
    for (idx, command) in commands {
        let label = sessions[*idx].label();
        match grouped.iter_mut().find(|(c, _)| c == command) {
            Some((_, labels)) => labels.push(label),
            None => grouped.push((command.clone(), vec![label])),
        }
    }
    grouped
}
