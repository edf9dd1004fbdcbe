mod manager;

pub use manager::{backoff_delay, PoolError, PoolKey, PoolOptions, SessionPool};
