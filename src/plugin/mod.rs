//! Routing behaviours.
//!
//! A [`Behavior`] decides, for one client command, which backends take part
//! and what each of them is sent. The connection state machine treats the
//! decision as opaque input:
//!
//! - [`ProxyBehavior`]: one backend group, read/write split, prepared statements
//! - [`ShardBehavior`]: sharding rules across groups, scatter with merge

mod proxy;
mod shard;

pub use proxy::ProxyBehavior;
pub use shard::ShardBehavior;

use bytes::Bytes;

use crate::backend::BackendId;
use crate::config::ProxyMode;
use crate::merge::{ConcatMerger, ResultMerger};
use crate::parser::SqlAnalysis;
use crate::protocol::{error_codes, ClientCommand, ErrPacket, ResponseKind};

/// What the connection knows when it asks for a route
#[derive(Debug)]
pub struct RouteRequest<'a> {
    pub command: &'a ClientCommand,
    /// Raw command payload as the client sent it
    pub payload: &'a Bytes,
    /// Explicit transaction or autocommit disabled
    pub in_transaction: bool,
    /// Backends of the sessions currently attached, in attach order
    pub attached: &'a [BackendId],
    /// Prepared statements are open on the attached session
    pub has_prepared: bool,
}

/// One backend and the payload it receives
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub backend: BackendId,
    pub payload: Bytes,
}

#[derive(Debug, Clone)]
pub struct RoutePlan {
    pub targets: Vec<Target>,
    pub kind: ResponseKind,
    /// Statement analysis, used by the merger for scatter reads
    pub analysis: Option<SqlAnalysis>,
    pub is_write: bool,
    /// Autocommit write spanning groups: run it inside its own XA transaction
    pub implicit_xa: bool,
}

impl RoutePlan {
    /// Same payload to a single backend
    pub fn single(backend: BackendId, request: &RouteRequest<'_>) -> Self {
        Self {
            targets: vec![Target {
                backend,
                payload: request.payload.clone(),
            }],
            kind: ResponseKind::for_command(request.command.command()),
            analysis: None,
            is_write: false,
            implicit_xa: false,
        }
    }

    pub fn is_scatter(&self) -> bool {
        self.targets.len() > 1
    }
}

/// Per-mode routing hooks
pub trait Behavior: Send + Sync {
    fn name(&self) -> &'static str;

    fn mode(&self) -> ProxyMode;

    /// COM_STMT_* commands may be forwarded
    fn supports_prepared(&self) -> bool;

    /// Pick the participating backends for a command. The error is sent to
    /// the client as is.
    fn route_query(&self, request: &RouteRequest<'_>) -> Result<RoutePlan, ErrPacket>;

    /// Merger for a scatter response
    fn merger(&self, analysis: Option<SqlAnalysis>, expected: usize, capabilities: u32) -> Box<dyn ResultMerger> {
        Box::new(ConcatMerger::new(analysis, expected, capabilities))
    }
}

pub(crate) fn no_backend(group: &str) -> ErrPacket {
    ErrPacket::new(
        error_codes::ER_UNKNOWN_ERROR,
        "HY000",
        &format!("No available backend in group '{}'", group),
    )
}
