//! Integration tests against a running proxy
//!
//! Run with: CETUS_RUN_INTEGRATION_TESTS=1 cargo test --test integration
//!
//! The proxy must run in shard mode with XA enabled, with table `orders`
//! (`user_id BIGINT`, `order_no VARCHAR`, `amount DECIMAL`) sharded on
//! `user_id` by the `mod` algorithm.
//!
//! Environment variables:
//! - CETUS_RUN_INTEGRATION_TESTS: Set to "1" to enable integration tests
//! - CETUS_TEST_PROXY_HOST: Proxy host (default: 127.0.0.1)
//! - CETUS_TEST_PROXY_PORT: Proxy port (default: 3307)
//! - CETUS_TEST_PROXY_USER: Proxy user (default: app_user)
//! - CETUS_TEST_PROXY_PASS: Proxy password (default: test123)
//! - CETUS_TEST_PROXY_DB: Database (default: cetus_test)
//! - CETUS_TEST_SHARD_COUNT: Number of shard groups (default: 2)

mod rw_split;
mod sharding;
mod transaction;

use mysql::{Error as MySqlError, OptsBuilder, Pool, PooledConn};
use std::env;

/// Check if integration tests should run
pub fn should_run_integration_tests() -> bool {
    env::var("CETUS_RUN_INTEGRATION_TESTS")
        .map(|v| v == "1")
        .unwrap_or(false)
}

/// Skip test if integration tests are not enabled
#[macro_export]
macro_rules! skip_if_not_enabled {
    () => {
        if !crate::should_run_integration_tests() {
            eprintln!("Skipping integration test (set CETUS_RUN_INTEGRATION_TESTS=1 to run)");
            return;
        }
    };
}

/// Get proxy connection config from environment
pub fn get_proxy_config() -> ProxyTestConfig {
    ProxyTestConfig {
        host: env::var("CETUS_TEST_PROXY_HOST").unwrap_or_else(|_| "127.0.0.1".to_string()),
        port: env::var("CETUS_TEST_PROXY_PORT")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(3307),
        user: env::var("CETUS_TEST_PROXY_USER").unwrap_or_else(|_| "app_user".to_string()),
        password: env::var("CETUS_TEST_PROXY_PASS").unwrap_or_else(|_| "test123".to_string()),
        database: env::var("CETUS_TEST_PROXY_DB").unwrap_or_else(|_| "cetus_test".to_string()),
    }
}

pub fn get_shard_count() -> usize {
    env::var("CETUS_TEST_SHARD_COUNT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(2)
}

#[derive(Debug, Clone)]
pub struct ProxyTestConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub database: String,
}

impl ProxyTestConfig {
    pub fn pool(&self) -> Pool {
        let opts = OptsBuilder::new()
            .ip_or_hostname(Some(&self.host))
            .tcp_port(self.port)
            .user(Some(&self.user))
            .pass(Some(&self.password))
            .db_name(Some(&self.database));
        Pool::new(opts).expect("Failed to create connection pool")
    }

    pub fn conn(&self) -> PooledConn {
        self.pool().get_conn().expect("Failed to get connection")
    }
}

/// Shard index of an integer key under the `mod` algorithm
pub fn calculate_shard(user_id: i64, shard_count: usize) -> usize {
    user_id.rem_euclid(shard_count as i64) as usize
}

/// Two user ids from `base` upwards that live on different shards
pub fn different_shard_user_ids(base: i64, shard_count: usize) -> (i64, i64) {
    let first = base;
    let second = (base + 1..base + 1000)
        .find(|id| calculate_shard(*id, shard_count) != calculate_shard(first, shard_count))
        .expect("Could not find two user_ids on different shards");
    (first, second)
}

pub fn parse_amount(s: &str) -> i64 {
    s.parse::<f64>().unwrap_or(0.0) as i64
}

pub fn cleanup_user_ids(conn: &mut PooledConn, user_ids: &[i64]) {
    use mysql::prelude::Queryable;
    for user_id in user_ids {
        let _ = conn.query_drop(format!("DELETE FROM orders WHERE user_id = {}", user_id));
    }
}

/// Assert that a query result is a MySQL error with given code and message
pub fn assert_query_error<T: std::fmt::Debug>(
    result: Result<T, MySqlError>,
    expected_code: u16,
    expected_msg: &str,
) {
    match result {
        Ok(v) => panic!(
            "Expected MySQL error {} with message containing '{}', but got: {:?}",
            expected_code, expected_msg, v
        ),
        Err(MySqlError::MySqlError(ref e)) => {
            assert_eq!(
                e.code, expected_code,
                "Expected error code {}, got {}. Message: {}",
                expected_code, e.code, e.message
            );
            assert!(
                e.message.contains(expected_msg),
                "Expected message containing '{}', got: {}",
                expected_msg,
                e.message
            );
        }
        Err(e) => panic!(
            "Expected MySQL error {} with message containing '{}', got different error: {:?}",
            expected_code, expected_msg, e
        ),
    }
}
