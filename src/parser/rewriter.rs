use sqlparser::ast::{Expr, Statement, Value};
use sqlparser::dialect::MySqlDialect;
use sqlparser::parser::Parser;

use super::analyzer::LimitClause;

/// Per-shard SQL rewriting
pub struct SqlRewriter;

impl SqlRewriter {
    /// Rewrite `LIMIT offset, count` to `LIMIT offset + count` for shard fan-out.
    ///
    /// Each shard must return every row that could survive the global offset;
    /// the merger applies the real offset and count. Returns `None` when the
    /// statement needs no change or cannot be re-rendered.
    pub fn push_down_limit(sql: &str, limit: LimitClause) -> Option<String> {
        if limit.offset == 0 {
            return None;
        }
        let mut statements = Parser::parse_sql(&MySqlDialect {}, sql).ok()?;
        if statements.len() != 1 {
            return None;
        }
        let Statement::Query(query) = &mut statements[0] else {
            return None;
        };
        let total = limit.offset.checked_add(limit.count)?;
        query.limit = Some(Expr::Value(Value::Number(total.to_string(), false)));
        query.offset = None;
        Some(statements[0].to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_down_limit() {
        let sql = "SELECT id FROM users ORDER BY id LIMIT 10, 5";
        let rewritten = SqlRewriter::push_down_limit(
            sql,
            LimitClause {
                offset: 10,
                count: 5,
            },
        )
        .unwrap();
        assert_eq!(rewritten, "SELECT id FROM users ORDER BY id LIMIT 15");
    }

    #[test]
    fn test_no_offset_unchanged() {
        assert!(SqlRewriter::push_down_limit(
            "SELECT 1 LIMIT 3",
            LimitClause {
                offset: 0,
                count: 3,
            }
        )
        .is_none());
    }
}
