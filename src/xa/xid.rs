//! Transaction ids and the literal XA statements built from them.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;

/// Generates `prefix_<unix seconds>_<counter>` ids.
///
/// The counter is process-wide and never reset, so two ids from one
/// generator never collide even within the same second.
#[derive(Debug)]
pub struct XidGenerator {
    prefix: String,
    counter: AtomicU64,
}

impl XidGenerator {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            counter: AtomicU64::new(1),
        }
    }

    pub fn next_xid(&self) -> String {
        let seq = self.counter.fetch_add(1, Ordering::Relaxed);
        format!("{}_{}_{}", self.prefix, Utc::now().timestamp(), seq)
    }

    /// Per-backend branch of `xid` in partitioned mode
    pub fn branch(xid: &str, index: usize) -> String {
        format!("{}_{}", xid, index)
    }
}

/// XA statement kinds sent to participants
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XaCommand {
    Start,
    End,
    Prepare,
    Commit,
    CommitOnePhase,
    Rollback,
}

impl XaCommand {
    pub fn sql(self, xid: &str) -> String {
        match self {
            XaCommand::Start => format!("XA START '{}'", xid),
            XaCommand::End => format!("XA END '{}'", xid),
            XaCommand::Prepare => format!("XA PREPARE '{}'", xid),
            XaCommand::Commit => format!("XA COMMIT '{}'", xid),
            XaCommand::CommitOnePhase => format!("XA COMMIT '{}' ONE PHASE", xid),
            XaCommand::Rollback => format!("XA ROLLBACK '{}'", xid),
        }
    }
}
