mod aggregator;
mod analyzer;
mod rewriter;

pub use aggregator::{compare_rows, encode_text_row, parse_text_row, AggregateFolder, Cell};
pub use analyzer::{
    AggregateInfo, AggregateType, AnalyzerError, LimitClause, OrderKey, ShardKeyValue, SqlAnalysis,
    SqlAnalyzer, StatementType,
};
pub use rewriter::SqlRewriter;
