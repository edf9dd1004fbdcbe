use sqlparser::ast::{
    BinaryOperator, Expr, Offset, OrderByExpr, Query, Select, SelectItem, SetExpr, Statement,
    TableFactor, TableWithJoins, UnaryOperator, Value,
};
use sqlparser::dialect::MySqlDialect;
use sqlparser::parser::Parser;
use tracing::debug;

use crate::router::ShardValue;

/// SQL analysis result
#[derive(Debug, Clone, Default)]
pub struct SqlAnalysis {
    pub stmt_type: StatementType,
    /// Tables referenced in the statement
    pub tables: Vec<String>,
    /// Shard key conditions (column_name -> values)
    pub shard_keys: Vec<(String, ShardKeyValue)>,
    pub is_read_only: bool,
    /// Aggregate calls in the select list, by projection position
    pub aggregates: Vec<AggregateInfo>,
    pub has_group_by: bool,
    pub has_distinct: bool,
    /// ORDER BY keys resolvable to projection positions
    pub order_by: Vec<OrderKey>,
    /// ORDER BY present but some key is not a projected column
    pub order_by_unresolved: bool,
    pub limit: Option<LimitClause>,
    /// Number of projected columns, `None` when a wildcard is used
    pub projection_len: Option<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StatementType {
    Select,
    Insert,
    Replace,
    Update,
    Delete,
    Ddl,
    Begin,
    Commit,
    Rollback,
    Set,
    Show,
    Use,
    #[default]
    Other,
}

impl StatementType {
    pub fn is_read_only(&self) -> bool {
        matches!(self, StatementType::Select | StatementType::Show)
    }

    pub fn is_transaction_control(&self) -> bool {
        matches!(
            self,
            StatementType::Begin | StatementType::Commit | StatementType::Rollback
        )
    }

    /// Data changes that make a session a write participant
    pub fn is_write(&self) -> bool {
        matches!(
            self,
            StatementType::Insert
                | StatementType::Replace
                | StatementType::Update
                | StatementType::Delete
        )
    }
}

/// Shard key condition extracted from SQL
#[derive(Debug, Clone, PartialEq)]
pub enum ShardKeyValue {
    /// `col = v`
    Single(ShardValue),
    /// `col IN (..)`, or the values of a multi-row INSERT
    Multiple(Vec<ShardValue>),
    /// `col BETWEEN a AND b`
    Range { start: i64, end: i64 },
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregateType {
    Count,
    Sum,
    Max,
    Min,
    Avg,
}

impl AggregateType {
    fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_uppercase().as_str() {
            "COUNT" => Some(Self::Count),
            "SUM" => Some(Self::Sum),
            "MAX" => Some(Self::Max),
            "MIN" => Some(Self::Min),
            "AVG" => Some(Self::Avg),
            _ => None,
        }
    }
}

/// Aggregate call in the select list
#[derive(Debug, Clone, PartialEq)]
pub struct AggregateInfo {
    pub func_type: AggregateType,
    /// Projection position
    pub position: usize,
    pub expr_str: String,
    pub is_distinct: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrderKey {
    pub position: usize,
    pub descending: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LimitClause {
    pub offset: u64,
    pub count: u64,
}

pub struct SqlAnalyzer {
    dialect: MySqlDialect,
}

impl SqlAnalyzer {
    pub fn new() -> Self {
        Self {
            dialect: MySqlDialect {},
        }
    }

    pub fn analyze(&self, sql: &str) -> Result<SqlAnalysis, AnalyzerError> {
        let sql_trimmed = sql.trim().trim_end_matches(';');

        // Transaction control is classified without a full parse
        let head: String = sql_trimmed
            .split_whitespace()
            .take(2)
            .collect::<Vec<_>>()
            .join(" ")
            .to_uppercase();
        let quick = if head.starts_with("BEGIN") || head.starts_with("START TRANSACTION") {
            Some(StatementType::Begin)
        } else if head.starts_with("COMMIT") {
            Some(StatementType::Commit)
        } else if head.starts_with("ROLLBACK") {
            Some(StatementType::Rollback)
        } else {
            None
        };
        if let Some(stmt_type) = quick {
            return Ok(SqlAnalysis {
                stmt_type,
                ..Default::default()
            });
        }

        let statements = Parser::parse_sql(&self.dialect, sql_trimmed)
            .map_err(|e| AnalyzerError::ParseError(e.to_string()))?;

        let mut analysis = match statements.len() {
            0 => return Err(AnalyzerError::EmptyStatement),
            1 => self.analyze_statement(&statements[0])?,
            n => return Err(AnalyzerError::MultipleStatements(n)),
        };
        if analysis.stmt_type == StatementType::Insert && head.starts_with("REPLACE") {
            analysis.stmt_type = StatementType::Replace;
        }
        Ok(analysis)
    }

    fn analyze_statement(&self, stmt: &Statement) -> Result<SqlAnalysis, AnalyzerError> {
        let analysis = match stmt {
            Statement::Query(query) => self.analyze_query(query),
            Statement::Insert {
                table_name,
                columns,
                source,
                ..
            } => {
                let mut shard_keys = vec![];
                if let Some(src) = source {
                    if let SetExpr::Values(values) = src.body.as_ref() {
                        let cols: Vec<String> = columns.iter().map(|c| c.value.clone()).collect();
                        shard_keys = Self::insert_shard_keys(&cols, &values.rows);
                    }
                }
                SqlAnalysis {
                    stmt_type: StatementType::Insert,
                    tables: vec![table_name.to_string()],
                    shard_keys,
                    ..Default::default()
                }
            }
            Statement::Update {
                table, selection, ..
            } => SqlAnalysis {
                stmt_type: StatementType::Update,
                tables: self.tables_of(table),
                shard_keys: selection
                    .as_ref()
                    .map(|expr| self.extract_shard_keys(expr))
                    .unwrap_or_default(),
                ..Default::default()
            },
            Statement::Delete {
                from, selection, ..
            } => SqlAnalysis {
                stmt_type: StatementType::Delete,
                tables: from.iter().flat_map(|t| self.tables_of(t)).collect(),
                shard_keys: selection
                    .as_ref()
                    .map(|expr| self.extract_shard_keys(expr))
                    .unwrap_or_default(),
                ..Default::default()
            },
            Statement::CreateTable { name, .. } => SqlAnalysis {
                stmt_type: StatementType::Ddl,
                tables: vec![name.to_string()],
                ..Default::default()
            },
            Statement::AlterTable { name, .. } => SqlAnalysis {
                stmt_type: StatementType::Ddl,
                tables: vec![name.to_string()],
                ..Default::default()
            },
            Statement::Drop { names, .. } => SqlAnalysis {
                stmt_type: StatementType::Ddl,
                tables: names.iter().map(|n| n.to_string()).collect(),
                ..Default::default()
            },
            Statement::Truncate { table_name, .. } => SqlAnalysis {
                stmt_type: StatementType::Ddl,
                tables: vec![table_name.to_string()],
                ..Default::default()
            },
            Statement::SetVariable { .. } | Statement::SetNames { .. } => SqlAnalysis {
                stmt_type: StatementType::Set,
                ..Default::default()
            },
            Statement::ShowTables { .. }
            | Statement::ShowColumns { .. }
            | Statement::ShowVariables { .. }
            | Statement::ShowCreate { .. } => SqlAnalysis {
                stmt_type: StatementType::Show,
                is_read_only: true,
                ..Default::default()
            },
            Statement::Use { db_name } => SqlAnalysis {
                stmt_type: StatementType::Use,
                tables: vec![db_name.to_string()],
                ..Default::default()
            },
            _ => SqlAnalysis::default(),
        };

        debug!(stmt_type = ?analysis.stmt_type, tables = ?analysis.tables, "Analyzed statement");
        Ok(analysis)
    }

    fn analyze_query(&self, query: &Query) -> SqlAnalysis {
        let mut analysis = SqlAnalysis {
            stmt_type: StatementType::Select,
            is_read_only: true,
            ..Default::default()
        };

        if let SetExpr::Select(select) = query.body.as_ref() {
            for table_with_joins in &select.from {
                analysis.tables.extend(self.tables_of(table_with_joins));
            }
            if let Some(selection) = &select.selection {
                analysis.shard_keys = self.extract_shard_keys(selection);
            }
            self.analyze_projection(select, &mut analysis);
            self.analyze_order_by(select, &query.order_by, &mut analysis);
        }

        analysis.limit = Self::limit_clause(query.limit.as_ref(), query.offset.as_ref());
        analysis
    }

    fn analyze_projection(&self, select: &Select, analysis: &mut SqlAnalysis) {
        analysis.has_distinct = select.distinct.is_some();
        // GroupByExpr's shape differs between parser releases; its rendering does not
        analysis.has_group_by = select.to_string().contains(" GROUP BY ");

        let mut wildcard = false;
        for (position, item) in select.projection.iter().enumerate() {
            let expr = match item {
                SelectItem::UnnamedExpr(expr) => expr,
                SelectItem::ExprWithAlias { expr, .. } => expr,
                _ => {
                    wildcard = true;
                    continue;
                }
            };
            if let Expr::Function(func) = expr {
                let name = func.name.to_string();
                if let Some(func_type) = AggregateType::from_name(&name) {
                    let expr_str = func.to_string();
                    analysis.aggregates.push(AggregateInfo {
                        func_type,
                        position,
                        is_distinct: expr_str.to_uppercase().contains("(DISTINCT "),
                        expr_str,
                    });
                }
            }
        }
        if !wildcard {
            analysis.projection_len = Some(select.projection.len());
        }
    }

    fn analyze_order_by(&self, select: &Select, order_by: &[OrderByExpr], analysis: &mut SqlAnalysis) {
        for key in order_by {
            let descending = key.asc == Some(false);
            match Self::projection_position(select, &key.expr) {
                Some(position) => analysis.order_by.push(OrderKey {
                    position,
                    descending,
                }),
                None => analysis.order_by_unresolved = true,
            }
        }
    }

    /// Position of an ORDER BY key in the select list (by ordinal, alias or column name)
    fn projection_position(select: &Select, expr: &Expr) -> Option<usize> {
        if let Expr::Value(Value::Number(n, _)) = expr {
            let ordinal: usize = n.parse().ok()?;
            return ordinal.checked_sub(1).filter(|p| *p < select.projection.len());
        }
        let wanted = Self::column_name(expr)?;
        select.projection.iter().position(|item| match item {
            SelectItem::ExprWithAlias { alias, expr } => {
                alias.value.eq_ignore_ascii_case(&wanted)
                    || Self::column_name(expr).is_some_and(|c| c.eq_ignore_ascii_case(&wanted))
            }
            SelectItem::UnnamedExpr(expr) => {
                Self::column_name(expr).is_some_and(|c| c.eq_ignore_ascii_case(&wanted))
            }
            _ => false,
        })
    }

    fn column_name(expr: &Expr) -> Option<String> {
        match expr {
            Expr::Identifier(ident) => Some(ident.value.clone()),
            Expr::CompoundIdentifier(parts) => parts.last().map(|p| p.value.clone()),
            _ => None,
        }
    }

    fn limit_clause(limit: Option<&Expr>, offset: Option<&Offset>) -> Option<LimitClause> {
        let count = Self::unsigned_literal(limit?)?;
        let offset = match offset {
            Some(o) => Self::unsigned_literal(&o.value)?,
            None => 0,
        };
        Some(LimitClause { offset, count })
    }

    fn unsigned_literal(expr: &Expr) -> Option<u64> {
        match expr {
            Expr::Value(Value::Number(n, _)) => n.parse().ok(),
            _ => None,
        }
    }

    fn insert_shard_keys(cols: &[String], rows: &[Vec<Expr>]) -> Vec<(String, ShardKeyValue)> {
        let mut keys: Vec<(String, ShardKeyValue)> = Vec::new();
        for (idx, col) in cols.iter().enumerate() {
            let values: Option<Vec<ShardValue>> = rows
                .iter()
                .map(|row| row.get(idx).and_then(Self::literal_value))
                .collect();
            let value = match values {
                Some(mut values) if values.len() == 1 => ShardKeyValue::Single(values.remove(0)),
                Some(values) if !values.is_empty() => ShardKeyValue::Multiple(values),
                _ => ShardKeyValue::Unknown,
            };
            keys.push((col.clone(), value));
        }
        keys
    }

    fn tables_of(&self, table_with_joins: &TableWithJoins) -> Vec<String> {
        let mut tables = vec![];
        if let TableFactor::Table { name, .. } = &table_with_joins.relation {
            tables.push(name.to_string());
        }
        for join in &table_with_joins.joins {
            if let TableFactor::Table { name, .. } = &join.relation {
                tables.push(name.to_string());
            }
        }
        tables
    }

    fn extract_shard_keys(&self, expr: &Expr) -> Vec<(String, ShardKeyValue)> {
        let mut result = vec![];
        self.extract_shard_keys_recursive(expr, &mut result);
        result
    }

    fn extract_shard_keys_recursive(&self, expr: &Expr, result: &mut Vec<(String, ShardKeyValue)>) {
        match expr {
            Expr::BinaryOp { left, op, right } => match op {
                BinaryOperator::Eq => {
                    if let Some((col, val)) = Self::column_value_pair(left, right) {
                        result.push((col, ShardKeyValue::Single(val)));
                    }
                }
                BinaryOperator::And => {
                    self.extract_shard_keys_recursive(left, result);
                    self.extract_shard_keys_recursive(right, result);
                }
                _ => {}
            },
            Expr::InList {
                expr,
                list,
                negated: false,
            } => {
                if let Some(col) = Self::column_name(expr) {
                    let values: Option<Vec<ShardValue>> =
                        list.iter().map(Self::literal_value).collect();
                    if let Some(values) = values.filter(|v| !v.is_empty()) {
                        result.push((col, ShardKeyValue::Multiple(values)));
                    }
                }
            }
            Expr::Between {
                expr,
                low,
                high,
                negated: false,
            } => {
                if let Some(col) = Self::column_name(expr) {
                    let bounds = (
                        Self::literal_value(low).and_then(|v| v.as_i64()),
                        Self::literal_value(high).and_then(|v| v.as_i64()),
                    );
                    if let (Some(start), Some(end)) = bounds {
                        result.push((col, ShardKeyValue::Range { start, end }));
                    }
                }
            }
            Expr::Nested(inner) => self.extract_shard_keys_recursive(inner, result),
            _ => {}
        }
    }

    fn column_value_pair(left: &Expr, right: &Expr) -> Option<(String, ShardValue)> {
        if let (Some(col), Some(val)) = (Self::column_name(left), Self::literal_value(right)) {
            return Some((col, val));
        }
        if let (Some(col), Some(val)) = (Self::column_name(right), Self::literal_value(left)) {
            return Some((col, val));
        }
        None
    }

    fn literal_value(expr: &Expr) -> Option<ShardValue> {
        match expr {
            Expr::Value(Value::Number(n, _)) => n.parse::<i64>().ok().map(ShardValue::Integer),
            Expr::Value(Value::SingleQuotedString(s)) | Expr::Value(Value::DoubleQuotedString(s)) => {
                Some(ShardValue::String(s.clone()))
            }
            Expr::UnaryOp {
                op: UnaryOperator::Minus,
                expr,
            } => match expr.as_ref() {
                Expr::Value(Value::Number(n, _)) => n.parse::<i64>().ok().map(|v| ShardValue::Integer(-v)),
                _ => None,
            },
            Expr::Nested(inner) => Self::literal_value(inner),
            _ => None,
        }
    }
}

impl Default for SqlAnalyzer {
    fn default() -> Self {
        Self::new()
    }
}

/// Analyzer errors
#[derive(Debug, thiserror::Error)]
pub enum AnalyzerError {
    #[error("Failed to parse SQL: {0}")]
    ParseError(String),

    #[error("Empty statement")]
    EmptyStatement,

    #[error("{0} statements in one query")]
    MultipleStatements(usize),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_select_analysis() {
        let analyzer = SqlAnalyzer::new();

        let result = analyzer.analyze("SELECT * FROM users WHERE user_id = 123").unwrap();

        assert_eq!(result.stmt_type, StatementType::Select);
        assert_eq!(result.tables, vec!["users"]);
        assert!(result.is_read_only);
        assert_eq!(
            result.shard_keys,
            vec![("user_id".to_string(), ShardKeyValue::Single(ShardValue::Integer(123)))]
        );
        assert_eq!(result.projection_len, None);
    }

    #[test]
    fn test_string_shard_key() {
        let analyzer = SqlAnalyzer::new();
        let result = analyzer
            .analyze("SELECT name FROM users WHERE code = 'abc' AND id IN (1, 2)")
            .unwrap();
        assert_eq!(result.shard_keys.len(), 2);
        assert_eq!(
            result.shard_keys[0].1,
            ShardKeyValue::Single(ShardValue::String("abc".into()))
        );
        assert!(matches!(result.shard_keys[1].1, ShardKeyValue::Multiple(ref v) if v.len() == 2));
    }

    #[test]
    fn test_insert_analysis() {
        let analyzer = SqlAnalyzer::new();

        let result = analyzer
            .analyze("INSERT INTO users (user_id, name) VALUES (123, 'a'), (124, 'b')")
            .unwrap();

        assert_eq!(result.stmt_type, StatementType::Insert);
        assert!(result.stmt_type.is_write());
        assert_eq!(result.tables, vec!["users"]);
        assert_eq!(
            result.shard_keys[0].1,
            ShardKeyValue::Multiple(vec![ShardValue::Integer(123), ShardValue::Integer(124)])
        );
    }

    #[test]
    fn test_aggregates_and_limit() {
        let analyzer = SqlAnalyzer::new();
        let result = analyzer
            .analyze("SELECT COUNT(*), SUM(amount) AS total, MAX(amount) FROM orders LIMIT 5, 10")
            .unwrap();

        assert_eq!(result.aggregates.len(), 3);
        assert_eq!(result.aggregates[0].func_type, AggregateType::Count);
        assert_eq!(result.aggregates[1].position, 1);
        assert_eq!(result.aggregates[2].func_type, AggregateType::Max);
        assert!(!result.has_group_by);
        assert_eq!(result.projection_len, Some(3));
        assert_eq!(result.limit, Some(LimitClause { offset: 5, count: 10 }));
    }

    #[test]
    fn test_group_by_and_order_by() {
        let analyzer = SqlAnalyzer::new();
        let result = analyzer
            .analyze("SELECT dept, COUNT(*) AS n FROM emp GROUP BY dept ORDER BY n DESC, 1")
            .unwrap();
        assert!(result.has_group_by);
        assert_eq!(
            result.order_by,
            vec![
                OrderKey { position: 1, descending: true },
                OrderKey { position: 0, descending: false },
            ]
        );
        assert!(!result.order_by_unresolved);

        let result = analyzer.analyze("SELECT a FROM t ORDER BY b").unwrap();
        assert!(result.order_by_unresolved);
    }

    #[test]
    fn test_transaction_control() {
        let analyzer = SqlAnalyzer::new();

        assert_eq!(analyzer.analyze("BEGIN").unwrap().stmt_type, StatementType::Begin);
        assert_eq!(
            analyzer.analyze("start transaction").unwrap().stmt_type,
            StatementType::Begin
        );
        assert_eq!(analyzer.analyze("COMMIT").unwrap().stmt_type, StatementType::Commit);
        assert_eq!(analyzer.analyze("ROLLBACK").unwrap().stmt_type, StatementType::Rollback);
    }

    #[test]
    fn test_multiple_statements_rejected() {
        let analyzer = SqlAnalyzer::new();
        assert!(matches!(
            analyzer.analyze("SELECT 1; SELECT 2"),
            Err(AnalyzerError::MultipleStatements(2))
        ));
    }

    #[test]
    fn test_ddl() {
        let analyzer = SqlAnalyzer::new();
        let result = analyzer.analyze("CREATE TABLE t (id INT)").unwrap();
        assert_eq!(result.stmt_type, StatementType::Ddl);
        assert_eq!(result.tables, vec!["t"]);
    }
}
