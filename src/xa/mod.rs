//! Distributed (XA) transactions.
//!
//! - [`XaState`] / [`XaPhase`]: phase sum-type with a validated transition function
//! - [`XidGenerator`]: transaction ids and XA statement text
//! - [`TransactionLog`]: append-only phase and mending records
//! - [`XaDriver`]: round-by-round commit and rollback sequencing

mod driver;
mod log;
mod state;
mod xid;

pub use driver::{is_xa_fatal, XaDriver, XaOutcome, XaRound, XaStep};
#[cfg(test)]
pub use log::MemoryTransactionLog;
pub use log::{FileTransactionLog, NullTransactionLog, RecordKind, TransactionLog, XaLogError, XaLogRecord};
pub use state::{XaPhase, XaState, XaTransitionError};
pub use xid::{XaCommand, XidGenerator};
