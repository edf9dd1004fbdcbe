//! Backend liveness probing.
//!
//! - Periodic COM_PING per backend over a kept-open probe session
//! - Backend marked down after consecutive failures, up again on one success
//! - Maintaining backends stay drained regardless of probe results

mod checker;

pub use checker::{ping, CheckError, HealthChecker};
