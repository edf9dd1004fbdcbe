//! XA phase sum-type and its transition function.

use std::fmt;

/// Phase of a distributed transaction, per connection and per session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum XaState {
    #[default]
    None,
    Start,
    Query,
    End,
    Prepare,
    Commit,
    Rollback,
    CandidateOver,
    Over,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("Illegal XA transition {from} -> {to}")]
pub struct XaTransitionError {
    pub from: XaState,
    pub to: XaState,
}

impl XaState {
    fn rank(self) -> u8 {
        match self {
            XaState::None => 0,
            XaState::Start => 1,
            XaState::Query => 2,
            XaState::End => 3,
            XaState::Prepare => 4,
            XaState::Commit => 5,
            XaState::Rollback => 5,
            XaState::CandidateOver => 6,
            XaState::Over => 7,
        }
    }

    /// Validated transition. Phases only move forward; ROLLBACK is reachable
    /// from any phase up to and including COMMIT, and a finished transaction
    /// may restart at START.
    pub fn transition(self, to: XaState) -> Result<XaState, XaTransitionError> {
        let ok = match (self, to) {
            (XaState::Over, XaState::Start) | (XaState::None, XaState::Start) => true,
            (_, XaState::None) => self == XaState::Over || self == XaState::None,
            (from, XaState::Rollback) => from.rank() <= XaState::Commit.rank() && from != XaState::Rollback,
            (XaState::Rollback, XaState::CandidateOver) => true,
            (XaState::Rollback, _) => false,
            (XaState::Query, XaState::Query) => true,
            (XaState::Prepare, XaState::CandidateOver) => true,
            (from, to) => to.rank() == from.rank() + 1,
        };
        if ok {
            Ok(to)
        } else {
            Err(XaTransitionError { from: self, to })
        }
    }

    pub fn is_active(self) -> bool {
        !matches!(self, XaState::None | XaState::Over)
    }
}

impl fmt::Display for XaState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            XaState::None => "NONE",
            XaState::Start => "XA_START",
            XaState::Query => "XA_QUERY",
            XaState::End => "XA_END",
            XaState::Prepare => "XA_PREPARE",
            XaState::Commit => "XA_COMMIT",
            XaState::Rollback => "XA_ROLLBACK",
            XaState::CandidateOver => "XA_CANDIDATE_OVER",
            XaState::Over => "XA_OVER",
        };
        f.write_str(name)
    }
}

/// Connection-level phase with its recorded history
#[derive(Debug, Clone, Default)]
pub struct XaPhase {
    current: XaState,
    history: Vec<XaState>,
}

impl XaPhase {
    pub fn current(&self) -> XaState {
        self.current
    }

    pub fn history(&self) -> &[XaState] {
        &self.history
    }

    pub fn advance(&mut self, to: XaState) -> Result<(), XaTransitionError> {
        if to == self.current && to == XaState::Query {
            return Ok(());
        }
        self.current = self.current.transition(to)?;
        if to == XaState::Start {
            self.history.clear();
        }
        self.history.push(to);
        Ok(())
    }

    /// Skip straight to OVER when no worker session is left
    pub fn force_over(&mut self) {
        self.current = XaState::Over;
        self.history.push(XaState::Over);
    }

    pub fn reset(&mut self) {
        self.current = XaState::None;
    }
}
