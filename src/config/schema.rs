use serde::Deserialize;

use crate::router::ShardingRule;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Behaviour plugin driving routing decisions
    #[serde(default)]
    pub mode: ProxyMode,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    #[serde(default)]
    pub pool: PoolConfig,
    /// Client accounts, also used to authenticate pooled backend connections
    #[serde(default)]
    pub users: Vec<UserConfig>,
    #[serde(default)]
    pub backends: Vec<BackendConfig>,
    #[serde(default)]
    pub streaming: StreamingConfig,
    #[serde(default)]
    pub xa: XaConfig,
    /// Health check configuration
    #[serde(default)]
    pub health: HealthCheckConfig,
    #[serde(default)]
    pub sharding: Vec<ShardingRule>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ProxyMode {
    /// Pass-through with read/write split
    #[default]
    Proxy,
    /// Sharding across backend groups
    Shard,
}

// ============================================================================
// Server
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,
    /// Runtime worker threads (0 = tokio default)
    #[serde(default)]
    pub worker_threads: usize,
    /// Largest logical packet accepted from a client
    #[serde(default = "default_max_packet_size")]
    pub max_packet_size: usize,
    #[serde(default = "default_server_version")]
    pub server_version: String,
    #[serde(default = "default_charset")]
    pub default_charset: String,
    /// Prometheus scrape endpoint, disabled when unset
    #[serde(default)]
    pub metrics_addr: Option<String>,
}

fn default_listen_addr() -> String {
    "127.0.0.1".to_string()
}

fn default_listen_port() -> u16 {
    3307
}

fn default_max_packet_size() -> usize {
    16 * 1024 * 1024
}

fn default_server_version() -> String {
    "5.7.25-cetus".to_string()
}

fn default_charset() -> String {
    "utf8mb4".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            listen_port: default_listen_port(),
            worker_threads: 0,
            max_packet_size: default_max_packet_size(),
            server_version: default_server_version(),
            default_charset: default_charset(),
            metrics_addr: None,
        }
    }
}

// ============================================================================
// Timeouts
// ============================================================================

/// Wait budgets, all in milliseconds
#[derive(Debug, Clone, Deserialize)]
pub struct TimeoutConfig {
    /// Idle client outside a transaction
    #[serde(default = "default_client_idle_ms")]
    pub client_idle_ms: u64,
    /// Idle client while its backend is in maintenance
    #[serde(default = "default_maintained_client_idle_ms")]
    pub maintained_client_idle_ms: u64,
    /// Idle client holding an open transaction
    #[serde(default = "default_incomplete_tran_idle_ms")]
    pub incomplete_tran_idle_ms: u64,
    /// Wait for the statement following BEGIN/START TRANSACTION
    #[serde(default = "default_short_wait_ms")]
    pub short_wait_ms: u64,
    #[serde(default = "default_backend_read_ms")]
    pub backend_read_ms: u64,
    #[serde(default = "default_backend_write_ms")]
    pub backend_write_ms: u64,
    #[serde(default = "default_connect_ms")]
    pub connect_ms: u64,
}

fn default_client_idle_ms() -> u64 {
    8 * 3600 * 1000
}

fn default_maintained_client_idle_ms() -> u64 {
    30 * 1000
}

fn default_incomplete_tran_idle_ms() -> u64 {
    3600 * 1000
}

fn default_short_wait_ms() -> u64 {
    1000
}

fn default_backend_read_ms() -> u64 {
    600 * 1000
}

fn default_backend_write_ms() -> u64 {
    30 * 1000
}

fn default_connect_ms() -> u64 {
    3000
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            client_idle_ms: default_client_idle_ms(),
            maintained_client_idle_ms: default_maintained_client_idle_ms(),
            incomplete_tran_idle_ms: default_incomplete_tran_idle_ms(),
            short_wait_ms: default_short_wait_ms(),
            backend_read_ms: default_backend_read_ms(),
            backend_write_ms: default_backend_write_ms(),
            connect_ms: default_connect_ms(),
        }
    }
}

// ============================================================================
// Pool
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct PoolConfig {
    /// Idle sessions kept per (backend, user)
    #[serde(default = "default_max_idle_per_key")]
    pub max_idle_per_key: usize,
    /// Open sessions (idle + checked out) per backend
    #[serde(default = "default_max_conns_per_backend")]
    pub max_conns_per_backend: usize,
    #[serde(default = "default_max_age_ms")]
    pub max_age_ms: u64,
    #[serde(default = "default_max_idle_time_ms")]
    pub max_idle_time_ms: u64,
    /// Checkout attempts before the client gets "service unavailable"
    #[serde(default = "default_retry_max_attempts")]
    pub retry_max_attempts: u32,
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
    #[serde(default = "default_retry_step_ms")]
    pub retry_step_ms: u64,
    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,
}

fn default_max_idle_per_key() -> usize {
    32
}

fn default_max_conns_per_backend() -> usize {
    256
}

fn default_max_age_ms() -> u64 {
    3600 * 1000
}

fn default_max_idle_time_ms() -> u64 {
    300 * 1000
}

fn default_retry_max_attempts() -> u32 {
    8
}

fn default_retry_base_delay_ms() -> u64 {
    10
}

fn default_retry_step_ms() -> u64 {
    10
}

fn default_retry_max_delay_ms() -> u64 {
    100
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_idle_per_key: default_max_idle_per_key(),
            max_conns_per_backend: default_max_conns_per_backend(),
            max_age_ms: default_max_age_ms(),
            max_idle_time_ms: default_max_idle_time_ms(),
            retry_max_attempts: default_retry_max_attempts(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            retry_step_ms: default_retry_step_ms(),
            retry_max_delay_ms: default_retry_max_delay_ms(),
        }
    }
}

// ============================================================================
// Users / Backends
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct UserConfig {
    pub name: String,
    #[serde(default)]
    pub password: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BackendConfig {
    /// host:port
    pub addr: String,
    #[serde(default)]
    pub role: BackendRole,
    /// Shard group this backend serves
    #[serde(default = "default_group")]
    pub group: String,
    #[serde(default)]
    pub state: BackendInitialState,
}

fn default_group() -> String {
    "default".to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackendRole {
    /// Read-write
    #[default]
    Rw,
    /// Read-only replica
    Ro,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackendInitialState {
    #[default]
    Up,
    /// Never receives new sessions
    Maintaining,
}

// ============================================================================
// Streaming
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct StreamingConfig {
    /// Forward single-backend SELECT results as bytes arrive
    #[serde(default = "default_fast_stream")]
    pub fast_stream: bool,
    /// Flush merged output to the client before the merge completes
    #[serde(default)]
    pub tcp_stream: bool,
    /// Buffered bytes that trigger an early client flush
    #[serde(default = "default_stream_threshold_bytes")]
    pub stream_threshold_bytes: usize,
    /// Merged bytes pending before the first early client flush; later flushes use `stream_threshold_bytes`
    #[serde(default = "default_header_size_threshold")]
    pub header_size_threshold: usize,
}

fn default_fast_stream() -> bool {
    true
}

fn default_stream_threshold_bytes() -> usize {
    64 * 1024
}

fn default_header_size_threshold() -> usize {
    1024 * 1024
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            fast_stream: default_fast_stream(),
            tcp_stream: false,
            stream_threshold_bytes: default_stream_threshold_bytes(),
            header_size_threshold: default_header_size_threshold(),
        }
    }
}

// ============================================================================
// XA
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct XaConfig {
    #[serde(default = "default_xa_enabled")]
    pub enabled: bool,
    /// Log every phase, not only multi-writer transactions
    #[serde(default)]
    pub detailed_log: bool,
    /// Append-only JSON Lines file for XA phases and mending entries
    #[serde(default = "default_xa_log_path")]
    pub log_path: String,
    #[serde(default = "default_xid_prefix")]
    pub xid_prefix: String,
    /// One xid branch per backend (`<xid>_<n>`)
    #[serde(default)]
    pub partitioned: bool,
}

fn default_xa_enabled() -> bool {
    true
}

fn default_xa_log_path() -> String {
    "logs/cetus_xa.log".to_string()
}

fn default_xid_prefix() -> String {
    "cetus".to_string()
}

impl Default for XaConfig {
    fn default() -> Self {
        Self {
            enabled: default_xa_enabled(),
            detailed_log: false,
            log_path: default_xa_log_path(),
            xid_prefix: default_xid_prefix(),
            partitioned: false,
        }
    }
}

// ============================================================================
// Health Check Configuration
// ============================================================================

/// Health check configuration for backends
#[derive(Debug, Clone, Deserialize)]
pub struct HealthCheckConfig {
    #[serde(default = "default_health_enabled")]
    pub enabled: bool,
    /// Interval between checks (milliseconds)
    #[serde(default = "default_check_interval_ms")]
    pub interval_ms: u64,
    /// Timeout for each check (milliseconds)
    #[serde(default = "default_check_timeout_ms")]
    pub timeout_ms: u64,
    /// Consecutive failures before a backend is marked down
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// Account used for probes; first configured user when unset
    #[serde(default)]
    pub user: Option<String>,
}

fn default_health_enabled() -> bool {
    true
}

fn default_check_interval_ms() -> u64 {
    5000
}

fn default_failure_threshold() -> u32 {
    3
}

fn default_check_timeout_ms() -> u64 {
    3000
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            enabled: default_health_enabled(),
            interval_ms: default_check_interval_ms(),
            timeout_ms: default_check_timeout_ms(),
            failure_threshold: default_failure_threshold(),
            user: None,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mode: ProxyMode::Proxy,
            server: ServerConfig::default(),
            timeouts: TimeoutConfig::default(),
            pool: PoolConfig::default(),
            users: vec![UserConfig {
                name: "root".to_string(),
                password: String::new(),
            }],
            backends: vec![BackendConfig {
                addr: "127.0.0.1:3306".to_string(),
                role: BackendRole::Rw,
                group: default_group(),
                state: BackendInitialState::Up,
            }],
            streaming: StreamingConfig::default(),
            xa: XaConfig::default(),
            health: HealthCheckConfig::default(),
            sharding: Vec::new(),
        }
    }
}

impl Config {
    /// Distinct backend groups in declaration order
    pub fn groups(&self) -> Vec<String> {
        let mut groups: Vec<String> = Vec::new();
        for backend in &self.backends {
            if !groups.contains(&backend.group) {
                groups.push(backend.group.clone());
            }
        }
        groups
    }

    pub fn validate(&self) -> Result<(), super::ConfigError> {
        use super::ConfigError::Invalid;

        if self.backends.is_empty() {
            return Err(Invalid("at least one backend is required".into()));
        }
        if self.users.is_empty() {
            return Err(Invalid("at least one user is required".into()));
        }

        let groups = self.groups();
        for group in &groups {
            let has_rw = self
                .backends
                .iter()
                .any(|b| &b.group == group && b.role == BackendRole::Rw);
            if !has_rw {
                return Err(Invalid(format!("group '{}' has no rw backend", group)));
            }
        }

        for rule in &self.sharding {
            if rule.groups.is_empty() {
                return Err(Invalid(format!("sharding rule '{}' lists no groups", rule.name)));
            }
            if let Some(missing) = rule.groups.iter().find(|g| !groups.contains(g)) {
                return Err(Invalid(format!(
                    "sharding rule '{}' references unknown group '{}'",
                    rule.name, missing
                )));
            }
            if rule.algorithm.eq_ignore_ascii_case("range")
                && rule.range_boundaries.len() + 1 != rule.groups.len()
            {
                return Err(Invalid(format!(
                    "sharding rule '{}' needs {} groups for {} range boundaries",
                    rule.name,
                    rule.range_boundaries.len() + 1,
                    rule.range_boundaries.len()
                )));
            }
        }

        if self.mode == ProxyMode::Shard && self.sharding.is_empty() {
            return Err(Invalid("shard mode needs at least one sharding rule".into()));
        }
        if self.xa.enabled && self.xa.log_path.trim().is_empty() {
            return Err(Invalid("xa.log_path is required when XA is enabled".into()));
        }
        if self.pool.retry_max_attempts == 0 {
            return Err(Invalid("pool.retry_max_attempts must be at least 1".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_minimal_config() {
        let toml = r#"
[server]
listen_addr = "0.0.0.0"

[[users]]
name = "app"
password = "secret"

[[backends]]
addr = "mysql.local:3306"
"#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.server.listen_addr, "0.0.0.0");
        assert_eq!(config.server.listen_port, 3307); // default
        assert_eq!(config.mode, ProxyMode::Proxy);
        assert_eq!(config.backends[0].group, "default");
        assert_eq!(config.backends[0].role, BackendRole::Rw);
        assert_eq!(config.pool.retry_base_delay_ms, 10);
        assert!(config.xa.enabled);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_shard_config() {
        let toml = r#"
mode = "shard"

[[users]]
name = "root"

[[backends]]
addr = "10.0.0.1:3306"
group = "g0"

[[backends]]
addr = "10.0.0.2:3306"
group = "g1"

[[backends]]
addr = "10.0.0.3:3306"
group = "g1"
role = "ro"
state = "maintaining"

[[sharding]]
name = "user_shard"
table_pattern = "users"
shard_column = "user_id"
algorithm = "mod"
groups = ["g0", "g1"]

[xa]
partitioned = true
xid_prefix = "node1"
"#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.mode, ProxyMode::Shard);
        assert_eq!(config.groups(), vec!["g0".to_string(), "g1".to_string()]);
        assert_eq!(config.backends[2].state, BackendInitialState::Maintaining);
        assert_eq!(config.sharding[0].groups.len(), 2);
        assert!(config.xa.partitioned);
        assert_eq!(config.xa.xid_prefix, "node1");
        assert_eq!(config.xa.log_path, "logs/cetus_xa.log");
        config.validate().unwrap();
    }

    #[test]
    fn test_validate_xa_needs_log_path() {
        let mut config = Config::default();
        config.xa.log_path = String::new();
        assert!(config.validate().is_err());
        config.xa.enabled = false;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_unknown_group() {
        let mut config = Config::default();
        config.sharding.push(ShardingRule {
            name: "orders".to_string(),
            table_pattern: "orders".to_string(),
            shard_column: "id".to_string(),
            algorithm: "hash".to_string(),
            range_boundaries: vec![],
            groups: vec!["missing".to_string()],
        });
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("unknown group"));
    }

    #[test]
    fn test_validate_group_without_rw() {
        let mut config = Config::default();
        config.backends.push(BackendConfig {
            addr: "10.0.0.9:3306".to_string(),
            role: BackendRole::Ro,
            group: "replicas".to_string(),
            state: BackendInitialState::Up,
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_range_boundaries() {
        let mut config = Config::default();
        config.sharding.push(ShardingRule {
            name: "r".to_string(),
            table_pattern: "t".to_string(),
            shard_column: "id".to_string(),
            algorithm: "range".to_string(),
            range_boundaries: vec![100, 200],
            groups: vec!["default".to_string()],
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_default() {
        let config = Config::default();
        assert_eq!(config.server.listen_port, 3307);
        assert_eq!(config.backends.len(), 1);
        assert_eq!(config.timeouts.short_wait_ms, 1000);
        assert!(config.sharding.is_empty());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_config_with_health() {
        let toml = r#"
[health]
enabled = true
interval_ms = 10000
failure_threshold = 5
timeout_ms = 500
"#;
        let config: Config = toml::from_str(toml).unwrap();
        assert!(config.health.enabled);
        assert_eq!(config.health.interval_ms, 10000);
        assert_eq!(config.health.failure_threshold, 5);
        assert_eq!(config.health.timeout_ms, 500);
    }
}
