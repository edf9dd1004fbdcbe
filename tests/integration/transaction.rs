//! Transaction integration tests, including distributed (XA) transactions

use crate::{
    cleanup_user_ids, different_shard_user_ids, get_proxy_config, get_shard_count, parse_amount,
    skip_if_not_enabled,
};
use mysql::prelude::*;

const BASE_ID: i64 = 930_000;

fn insert(conn: &mut mysql::PooledConn, user_id: i64, amount: i64) -> Result<(), mysql::Error> {
    conn.query_drop(format!(
        "INSERT INTO orders (user_id, order_no, amount) VALUES ({}, 'ORD_tx_{}', {}.00)",
        user_id, user_id, amount
    ))
}

fn amount_of(conn: &mut mysql::PooledConn, user_id: i64) -> Option<i64> {
    let sql = format!("SELECT amount FROM orders WHERE user_id = {}", user_id);
    let result: Option<String> = conn.query_first(&sql).expect("SELECT should succeed");
    result.map(|s| parse_amount(&s))
}

#[test]
fn test_transaction_rollback() {
    skip_if_not_enabled!();

    let config = get_proxy_config();
    let mut conn = config.conn();
    let user_id = BASE_ID + 1;
    cleanup_user_ids(&mut conn, &[user_id]);

    conn.query_drop("BEGIN").expect("BEGIN should succeed");
    insert(&mut conn, user_id, 100).expect("INSERT should succeed");
    assert_eq!(amount_of(&mut conn, user_id), Some(100));
    conn.query_drop("ROLLBACK").expect("ROLLBACK should succeed");

    assert_eq!(amount_of(&mut conn, user_id), None, "Data should be rolled back");
}

#[test]
fn test_transaction_commit() {
    skip_if_not_enabled!();

    let config = get_proxy_config();
    let mut conn = config.conn();
    let user_id = BASE_ID + 2;
    cleanup_user_ids(&mut conn, &[user_id]);

    conn.query_drop("BEGIN").expect("BEGIN should succeed");
    insert(&mut conn, user_id, 200).expect("INSERT should succeed");
    conn.query_drop("COMMIT").expect("COMMIT should succeed");

    assert_eq!(amount_of(&mut conn, user_id), Some(200));
    cleanup_user_ids(&mut conn, &[user_id]);
}

#[test]
fn test_empty_transaction() {
    skip_if_not_enabled!();

    let config = get_proxy_config();
    let mut conn = config.conn();

    conn.query_drop("BEGIN").expect("BEGIN should succeed");
    conn.query_drop("COMMIT").expect("COMMIT should succeed");

    conn.query_drop("BEGIN").expect("BEGIN should succeed");
    conn.query_drop("ROLLBACK").expect("ROLLBACK should succeed");
}

#[test]
fn test_autocommit_off_then_on_commits() {
    skip_if_not_enabled!();

    let config = get_proxy_config();
    let mut conn = config.conn();
    let user_id = BASE_ID + 3;
    cleanup_user_ids(&mut conn, &[user_id]);

    conn.query_drop("SET AUTOCOMMIT=0").expect("SET AUTOCOMMIT=0 should succeed");
    insert(&mut conn, user_id, 300).expect("INSERT should succeed");
    conn.query_drop("SET AUTOCOMMIT=1").expect("SET AUTOCOMMIT=1 should succeed");

    let mut other = config.conn();
    assert_eq!(amount_of(&mut other, user_id), Some(300), "Re-enabling autocommit commits");
    cleanup_user_ids(&mut conn, &[user_id]);
}

#[test]
fn test_cross_shard_transaction_commits_on_every_shard() {
    skip_if_not_enabled!();

    let config = get_proxy_config();
    let mut conn = config.conn();
    let (a, b) = different_shard_user_ids(BASE_ID + 10, get_shard_count());
    cleanup_user_ids(&mut conn, &[a, b]);

    conn.query_drop("BEGIN").expect("BEGIN should succeed");
    insert(&mut conn, a, 100).expect("INSERT on first shard should succeed");
    insert(&mut conn, b, 200).expect("INSERT on second shard should succeed");
    conn.query_drop("COMMIT").expect("Distributed COMMIT should succeed");

    assert_eq!(amount_of(&mut conn, a), Some(100));
    assert_eq!(amount_of(&mut conn, b), Some(200));
    cleanup_user_ids(&mut conn, &[a, b]);
}

#[test]
fn test_cross_shard_transaction_rollback() {
    skip_if_not_enabled!();

    let config = get_proxy_config();
    let mut conn = config.conn();
    let (a, b) = different_shard_user_ids(BASE_ID + 20, get_shard_count());
    cleanup_user_ids(&mut conn, &[a, b]);

    conn.query_drop("BEGIN").expect("BEGIN should succeed");
    insert(&mut conn, a, 100).expect("INSERT should succeed");
    insert(&mut conn, b, 200).expect("INSERT should succeed");
    conn.query_drop("ROLLBACK").expect("Distributed ROLLBACK should succeed");

    assert_eq!(amount_of(&mut conn, a), None);
    assert_eq!(amount_of(&mut conn, b), None);
}

#[test]
fn test_multi_shard_autocommit_write_is_atomic() {
    skip_if_not_enabled!();

    let config = get_proxy_config();
    let mut conn = config.conn();
    let (a, b) = different_shard_user_ids(BASE_ID + 30, get_shard_count());
    cleanup_user_ids(&mut conn, &[a, b]);
    insert(&mut conn, a, 1).expect("INSERT should succeed");
    insert(&mut conn, b, 1).expect("INSERT should succeed");

    let sql = format!("UPDATE orders SET amount = 7.00 WHERE user_id IN ({}, {})", a, b);
    conn.query_drop(&sql).expect("Multi-shard UPDATE should succeed");

    assert_eq!(amount_of(&mut conn, a), Some(7));
    assert_eq!(amount_of(&mut conn, b), Some(7));
    cleanup_user_ids(&mut conn, &[a, b]);
}
