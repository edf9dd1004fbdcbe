use serde::Deserialize;
use std::borrow::Cow;
use std::collections::HashMap;

use super::shard::{ShardAlgorithm, ShardCalculator};

/// Lowercase without allocating when the name already is
#[inline]
fn to_lowercase_cow(s: &str) -> Cow<'_, str> {
    if s.bytes().all(|b| !b.is_ascii_uppercase()) {
        Cow::Borrowed(s)
    } else {
        Cow::Owned(s.to_lowercase())
    }
}

/// Sharding rule configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ShardingRule {
    /// Rule name (for logging)
    pub name: String,
    /// Logical table name (case-insensitive exact match)
    pub table_pattern: String,
    /// Column name used as shard key
    pub shard_column: String,
    #[serde(default = "default_algorithm")]
    pub algorithm: String,
    /// Range boundaries (for range algorithm)
    #[serde(default)]
    pub range_boundaries: Vec<i64>,
    /// Backend groups; shard `i` lives on `groups[i]`
    #[serde(default)]
    pub groups: Vec<String>,
}

fn default_algorithm() -> String {
    "mod".to_string()
}

impl ShardingRule {
    pub fn matches_table(&self, table_name: &str) -> bool {
        // Qualified names (db.table) match on the table part
        let table = table_name.rsplit('.').next().unwrap_or(table_name);
        self.table_pattern
            .eq_ignore_ascii_case(table.trim_matches('`'))
    }

    pub fn create_calculator(&self) -> ShardCalculator {
        let algorithm = ShardAlgorithm::from_str(&self.algorithm).unwrap_or(ShardAlgorithm::Mod);

        match algorithm {
            ShardAlgorithm::Range => ShardCalculator::new_range(self.range_boundaries.clone()),
            _ => ShardCalculator::new(algorithm, self.groups.len()),
        }
    }

    /// Group holding a shard index
    pub fn group_of(&self, shard: usize) -> Option<&str> {
        self.groups.get(shard).map(String::as_str)
    }
}

/// All sharding rules with their calculators
#[derive(Debug, Default, Clone)]
pub struct RouterConfig {
    rules: HashMap<String, (ShardingRule, ShardCalculator)>,
}

impl RouterConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_rules(rules: &[ShardingRule]) -> Self {
        let mut config = Self::new();
        for rule in rules {
            config.add_rule(rule.clone());
        }
        config
    }

    pub fn add_rule(&mut self, rule: ShardingRule) {
        let pattern = rule.table_pattern.to_lowercase();
        let calculator = rule.create_calculator();
        self.rules.insert(pattern, (rule, calculator));
    }

    /// Find the rule and calculator for a (possibly qualified) table
    pub fn find(&self, table_name: &str) -> Option<(&ShardingRule, &ShardCalculator)> {
        let table = table_name.rsplit('.').next().unwrap_or(table_name);
        let key = to_lowercase_cow(table.trim_matches('`'));
        self.rules.get(key.as_ref()).map(|(r, c)| (r, c))
    }

    pub fn is_sharded(&self, table_name: &str) -> bool {
        self.find(table_name).is_some()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}
