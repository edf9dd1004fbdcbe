//! Sharding integration tests
//!
//! Statements are built by interpolation: shard keys are only read from
//! literal SQL.

use crate::{
    assert_query_error, calculate_shard, cleanup_user_ids, get_proxy_config, get_shard_count, parse_amount,
    skip_if_not_enabled,
};
use mysql::prelude::*;

const BASE_ID: i64 = 920_000;

/// Insert one row per shard (at least two rows); returns (user_id, amount)
fn setup_test_data(conn: &mut mysql::PooledConn, base: i64) -> Vec<(i64, i64)> {
    let shard_count = get_shard_count();
    let rows: Vec<(i64, i64)> = (0..shard_count.max(2) as i64)
        .map(|i| (base + i, (i + 1) * 100))
        .collect();

    let ids: Vec<i64> = rows.iter().map(|(id, _)| *id).collect();
    cleanup_user_ids(conn, &ids);

    for (user_id, amount) in &rows {
        let sql = format!(
            "INSERT INTO orders (user_id, order_no, amount) VALUES ({}, 'ORD_{}', {}.00)",
            user_id, user_id, amount
        );
        conn.query_drop(&sql).expect("Failed to insert test data");
    }
    let shards: std::collections::HashSet<usize> = ids.iter().map(|id| calculate_shard(*id, shard_count)).collect();
    assert_eq!(shards.len(), shard_count, "Test data should cover every shard");
    rows
}

#[test]
fn test_single_shard_query_with_shard_key() {
    skip_if_not_enabled!();

    let config = get_proxy_config();
    let mut conn = config.conn();
    let data = setup_test_data(&mut conn, BASE_ID);

    let (user_id, expected_amount) = data[0];
    let sql = format!("SELECT amount FROM orders WHERE user_id = {}", user_id);
    let result: Option<String> = conn.query_first(&sql).expect("Query should succeed");
    assert_eq!(result.map(|s| parse_amount(&s)), Some(expected_amount));

    let ids: Vec<i64> = data.iter().map(|(id, _)| *id).collect();
    cleanup_user_ids(&mut conn, &ids);
}

#[test]
fn test_scatter_select_returns_rows_from_every_shard() {
    skip_if_not_enabled!();

    let config = get_proxy_config();
    let mut conn = config.conn();
    let base = BASE_ID + 100;
    let data = setup_test_data(&mut conn, base);

    let sql = format!(
        "SELECT user_id FROM orders WHERE user_id BETWEEN {} AND {} ORDER BY user_id",
        base,
        base + data.len() as i64 - 1
    );
    let ids: Vec<i64> = conn.query(&sql).expect("Scatter query should succeed");
    let expected: Vec<i64> = data.iter().map(|(id, _)| *id).collect();
    assert_eq!(ids, expected, "Merged rows should be globally ordered");

    cleanup_user_ids(&mut conn, &expected);
}

#[test]
fn test_scatter_limit_applies_globally() {
    skip_if_not_enabled!();

    let config = get_proxy_config();
    let mut conn = config.conn();
    let base = BASE_ID + 200;
    let data = setup_test_data(&mut conn, base);

    let sql = format!(
        "SELECT user_id FROM orders WHERE user_id BETWEEN {} AND {} ORDER BY user_id LIMIT 1, 1",
        base,
        base + data.len() as i64 - 1
    );
    let ids: Vec<i64> = conn.query(&sql).expect("Scatter query should succeed");
    assert_eq!(ids, vec![base + 1]);

    let all: Vec<i64> = data.iter().map(|(id, _)| *id).collect();
    cleanup_user_ids(&mut conn, &all);
}

#[test]
fn test_aggregate_count_and_sum() {
    skip_if_not_enabled!();

    let config = get_proxy_config();
    let mut conn = config.conn();
    let base = BASE_ID + 300;
    let data = setup_test_data(&mut conn, base);

    let sql = format!(
        "SELECT COUNT(*), SUM(amount) FROM orders WHERE user_id BETWEEN {} AND {}",
        base,
        base + data.len() as i64 - 1
    );
    let row: Option<(i64, String)> = conn.query_first(&sql).expect("Aggregate should succeed");
    let (count, sum) = row.expect("Aggregate returns one row");
    assert_eq!(count, data.len() as i64);
    assert_eq!(parse_amount(&sum), data.iter().map(|(_, a)| a).sum::<i64>());

    let ids: Vec<i64> = data.iter().map(|(id, _)| *id).collect();
    cleanup_user_ids(&mut conn, &ids);
}

#[test]
fn test_insert_without_shard_key_rejected() {
    skip_if_not_enabled!();

    let config = get_proxy_config();
    let mut conn = config.conn();

    let result = conn.query_drop("INSERT INTO orders (order_no, amount) VALUES ('ORD_nokey', 1.00)");
    assert_query_error(result, 1064, "Sharding key");
}
