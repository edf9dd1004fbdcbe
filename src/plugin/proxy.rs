use std::sync::Arc;

use tracing::debug;

use super::{no_backend, Behavior, RoutePlan, RouteRequest};
use crate::backend::{BackendId, BackendRegistry};
use crate::config::ProxyMode;
use crate::parser::{SqlAnalyzer, StatementType};
use crate::protocol::{ClientCommand, ErrPacket};
use crate::router::{RouteTarget, RwSplitter};

/// Pass-through over one backend group with read/write split
pub struct ProxyBehavior {
    registry: Arc<BackendRegistry>,
    analyzer: SqlAnalyzer,
    group: String,
}

impl ProxyBehavior {
    pub fn new(registry: Arc<BackendRegistry>, group: impl Into<String>) -> Self {
        Self {
            registry,
            analyzer: SqlAnalyzer::new(),
            group: group.into(),
        }
    }

    fn rw(&self) -> Result<BackendId, ErrPacket> {
        self.registry.rw_of(&self.group).ok_or_else(|| no_backend(&self.group))
    }

    fn pick(&self, target: RouteTarget) -> Result<BackendId, ErrPacket> {
        let backend = match target {
            RouteTarget::Rw => self.registry.rw_of(&self.group),
            RouteTarget::Ro => self.registry.ro_of(&self.group),
        };
        backend.ok_or_else(|| no_backend(&self.group))
    }
}

impl Behavior for ProxyBehavior {
    fn name(&self) -> &'static str {
        "proxy"
    }

    fn mode(&self) -> ProxyMode {
        ProxyMode::Proxy
    }

    fn supports_prepared(&self) -> bool {
        true
    }

    fn route_query(&self, request: &RouteRequest<'_>) -> Result<RoutePlan, ErrPacket> {
        // A bound session keeps every statement while transaction or
        // prepared-statement state lives on it
        let bound = request
            .attached
            .first()
            .copied()
            .filter(|_| request.in_transaction || request.has_prepared);

        let ClientCommand::Query(sql) = request.command else {
            let backend = match request.attached.first() {
                Some(backend) => *backend,
                None => self.rw()?,
            };
            return Ok(RoutePlan::single(backend, request));
        };

        // Unparseable statements still pass through, on the rw backend
        let stmt_type = match self.analyzer.analyze(sql) {
            Ok(analysis) => analysis.stmt_type,
            Err(e) => {
                debug!(error = %e, "Statement not analyzed, routing as other");
                StatementType::Other
            }
        };

        let backend = match bound {
            Some(backend) => backend,
            None => self.pick(RwSplitter::route(stmt_type, request.in_transaction))?,
        };
        let mut plan = RoutePlan::single(backend, request);
        plan.is_write = stmt_type.is_write() || stmt_type == StatementType::Ddl;
        Ok(plan)
    }
}
