mod rule;
mod rw_split;
mod shard;

pub use rule::{RouterConfig, ShardingRule};
pub use rw_split::{RouteTarget, RwSplitter};
pub use shard::{ShardAlgorithm, ShardCalculator, ShardValue};

use crate::parser::{ShardKeyValue, SqlAnalysis, StatementType};

/// Routing result: the backend groups a statement must run on
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupRoute {
    /// Target groups, deduplicated, in shard order
    pub groups: Vec<String>,
    /// Read-write routing target
    pub target: RouteTarget,
    /// At least one sharded table is involved
    pub sharded: bool,
}

impl GroupRoute {
    /// Hits more than one group
    pub fn is_scatter(&self) -> bool {
        self.groups.len() > 1
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RouteError {
    #[error("Sharding key {column} of table {table} is required")]
    MissingShardKey { table: String, column: String },

    #[error("Statement matches no shard")]
    NoMatchingShard,

    #[error("Rule {rule} has no group for shard {shard}")]
    UnknownGroup { rule: String, shard: usize },
}

/// Maps an analyzed statement to backend groups
pub struct Router {
    config: RouterConfig,
    /// Group holding every unsharded table
    default_group: String,
}

impl Router {
    pub fn new(config: RouterConfig, default_group: impl Into<String>) -> Self {
        Self {
            config,
            default_group: default_group.into(),
        }
    }

    pub fn default_group(&self) -> &str {
        &self.default_group
    }

    /// Route a statement.
    ///
    /// Every sharded table narrows the target set (tables joined in one
    /// statement must meet on common groups). Statements touching only
    /// unsharded tables run on the default group.
    pub fn route(&self, analysis: &SqlAnalysis, in_transaction: bool) -> Result<GroupRoute, RouteError> {
        let target = RwSplitter::route(analysis.stmt_type, in_transaction);
        let mut groups: Option<Vec<String>> = None;

        for table in &analysis.tables {
            let Some((rule, calc)) = self.config.find(table) else {
                continue;
            };

            let key = analysis
                .shard_keys
                .iter()
                .find(|(col, _)| col.eq_ignore_ascii_case(&rule.shard_column))
                .map(|(_, v)| v);

            let shards = match key {
                Some(ShardKeyValue::Single(v)) => vec![calc.calculate(v)],
                Some(ShardKeyValue::Multiple(values)) => calc.calculate_all(values),
                Some(ShardKeyValue::Range { start, end }) => calc.calculate_between(*start, *end),
                Some(ShardKeyValue::Unknown) | None => {
                    if matches!(analysis.stmt_type, StatementType::Insert | StatementType::Replace) {
                        return Err(RouteError::MissingShardKey {
                            table: table.clone(),
                            column: rule.shard_column.clone(),
                        });
                    }
                    calc.all_shards()
                }
            };

            let mut table_groups: Vec<String> = Vec::with_capacity(shards.len());
            for shard in shards {
                let group = rule.group_of(shard).ok_or_else(|| RouteError::UnknownGroup {
                    rule: rule.name.clone(),
                    shard,
                })?;
                if !table_groups.iter().any(|g| g == group) {
                    table_groups.push(group.to_string());
                }
            }

            groups = Some(match groups {
                Some(existing) => existing.into_iter().filter(|g| table_groups.contains(g)).collect(),
                None => table_groups,
            });
        }

        match groups {
            Some(groups) if groups.is_empty() => Err(RouteError::NoMatchingShard),
            Some(groups) => Ok(GroupRoute {
                groups,
                target,
                sharded: true,
            }),
            None => Ok(GroupRoute {
                groups: vec![self.default_group.clone()],
                target,
                sharded: false,
            }),
        }
    }

    pub fn is_sharded(&self, table_name: &str) -> bool {
        self.config.is_sharded(table_name)
    }
}
