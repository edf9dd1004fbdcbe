use std::sync::Arc;

use tracing::debug;

use super::{no_backend, Behavior, RoutePlan, RouteRequest, Target};
use crate::backend::BackendRegistry;
use crate::config::ProxyMode;
use crate::parser::{SqlAnalyzer, SqlRewriter, StatementType};
use crate::protocol::{error_codes, query_payload, ClientCommand, ErrPacket, ResponseKind};
use crate::router::{RouteTarget, Router};

/// Sharding across backend groups
pub struct ShardBehavior {
    registry: Arc<BackendRegistry>,
    router: Router,
    analyzer: SqlAnalyzer,
    xa_enabled: bool,
}

fn not_supported(message: impl std::fmt::Display) -> ErrPacket {
    ErrPacket::new(
        error_codes::ER_PARSE_ERROR,
        "42000",
        &format!("Statement not supported in shard mode: {}", message),
    )
}

impl ShardBehavior {
    pub fn new(registry: Arc<BackendRegistry>, router: Router, xa_enabled: bool) -> Self {
        Self {
            registry,
            router,
            analyzer: SqlAnalyzer::new(),
            xa_enabled,
        }
    }
}

impl Behavior for ShardBehavior {
    fn name(&self) -> &'static str {
        "shard"
    }

    fn mode(&self) -> ProxyMode {
        ProxyMode::Shard
    }

    fn supports_prepared(&self) -> bool {
        false
    }

    fn route_query(&self, request: &RouteRequest<'_>) -> Result<RoutePlan, ErrPacket> {
        let sql = match request.command {
            ClientCommand::Query(sql) => sql,
            ClientCommand::FieldList { .. } => {
                let group = self.router.default_group();
                let backend = self.registry.rw_of(group).ok_or_else(|| no_backend(group))?;
                return Ok(RoutePlan::single(backend, request));
            }
            _ => {
                return Err(ErrPacket::new(
                    error_codes::ER_UNSUPPORTED_PS,
                    "HY000",
                    "Prepared statements are not supported in shard mode",
                ))
            }
        };

        let analysis = self.analyzer.analyze(sql).map_err(not_supported)?;
        let route = self
            .router
            .route(&analysis, request.in_transaction)
            .map_err(not_supported)?;

        // Scatter reads fetch offset + count rows per shard; the merger
        // applies the real window
        let payload = match analysis.limit {
            Some(limit) if route.is_scatter() => SqlRewriter::push_down_limit(sql, limit)
                .map(|rewritten| {
                    debug!(sql = %rewritten, "Pushed down LIMIT");
                    query_payload(&rewritten)
                })
                .unwrap_or_else(|| request.payload.clone()),
            _ => request.payload.clone(),
        };

        let mut targets = Vec::with_capacity(route.groups.len());
        for group in &route.groups {
            let backend = match route.target {
                RouteTarget::Rw => self.registry.rw_of(group),
                RouteTarget::Ro => self.registry.ro_of(group),
            }
            .ok_or_else(|| no_backend(group))?;
            targets.push(Target {
                backend,
                payload: payload.clone(),
            });
        }

        let is_write = analysis.stmt_type.is_write() || analysis.stmt_type == StatementType::Ddl;
        let implicit_xa = self.xa_enabled && is_write && !request.in_transaction && targets.len() > 1;
        let merge_analysis = (analysis.stmt_type == StatementType::Select).then_some(analysis);

        Ok(RoutePlan {
            targets,
            kind: ResponseKind::Query,
            analysis: merge_analysis,
            is_write,
            implicit_xa,
        })
    }
}
