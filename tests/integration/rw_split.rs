//! Read-write split integration tests

use crate::{cleanup_user_ids, get_proxy_config, parse_amount, skip_if_not_enabled};
use mysql::prelude::*;

const BASE_ID: i64 = 910_000;

#[test]
fn test_reads_outside_transaction_succeed() {
    skip_if_not_enabled!();

    let config = get_proxy_config();
    let mut conn = config.conn();

    let mut server_ids = std::collections::HashSet::new();
    for _ in 0..10 {
        let server_id: Option<u64> = conn
            .query_first("SELECT @@server_id")
            .expect("SELECT @@server_id should succeed");
        if let Some(id) = server_id {
            server_ids.insert(id);
        }
    }

    if server_ids.len() > 1 {
        eprintln!("Read-write split detected: {} servers", server_ids.len());
    } else {
        eprintln!("No replica routing detected (expected without ro backends)");
    }
}

#[test]
fn test_write_then_read() {
    skip_if_not_enabled!();

    let config = get_proxy_config();
    let mut conn = config.conn();

    let user_id = BASE_ID + 1;
    cleanup_user_ids(&mut conn, &[user_id]);

    let sql = format!(
        "INSERT INTO orders (user_id, order_no, amount) VALUES ({}, 'ORD_rw_{}', 100.00)",
        user_id, user_id
    );
    conn.query_drop(&sql).expect("INSERT should succeed");

    let sql = format!("SELECT amount FROM orders WHERE user_id = {}", user_id);
    let result: Option<String> = conn.query_first(&sql).expect("SELECT should succeed");
    assert_eq!(result.map(|s| parse_amount(&s)), Some(100));

    cleanup_user_ids(&mut conn, &[user_id]);
}

#[test]
fn test_read_your_writes_in_transaction() {
    skip_if_not_enabled!();

    let config = get_proxy_config();
    let mut conn = config.conn();

    let user_id = BASE_ID + 2;
    cleanup_user_ids(&mut conn, &[user_id]);

    conn.query_drop("BEGIN").expect("BEGIN should succeed");

    let sql = format!(
        "INSERT INTO orders (user_id, order_no, amount) VALUES ({}, 'ORD_rw_{}', 100.00)",
        user_id, user_id
    );
    conn.query_drop(&sql).expect("INSERT should succeed");

    let select = format!("SELECT amount FROM orders WHERE user_id = {}", user_id);
    let v1: Option<String> = conn.query_first(&select).expect("SELECT should succeed");
    assert_eq!(v1.map(|s| parse_amount(&s)), Some(100));

    let sql = format!("UPDATE orders SET amount = 200.00 WHERE user_id = {}", user_id);
    conn.query_drop(&sql).expect("UPDATE should succeed");

    let v2: Option<String> = conn.query_first(&select).expect("SELECT should succeed");
    assert_eq!(v2.map(|s| parse_amount(&s)), Some(200));

    conn.query_drop("ROLLBACK").expect("ROLLBACK should succeed");

    let v3: Option<String> = conn.query_first(&select).expect("SELECT should succeed");
    assert_eq!(v3, None, "Data should be rolled back");
}

#[test]
fn test_use_database_survives_pooling() {
    skip_if_not_enabled!();

    let config = get_proxy_config();
    let mut conn = config.conn();

    for _ in 0..5 {
        let db: Option<String> = conn.query_first("SELECT DATABASE()").expect("SELECT should succeed");
        assert_eq!(db.as_deref(), Some(config.database.as_str()));
    }
}
