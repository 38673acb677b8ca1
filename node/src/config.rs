//! `NodeConfig`: every tunable named as a magic number throughout §4/§5/§6,
//! collected into one serde-deserializable, TOML-backed struct, following
//! the typed-config-struct-with-defaults idiom `util/app-config`'s
//! `CKBAppConfig` uses.

use serde::Deserialize;
use std::path::Path;

/// Relay protocol budgets (§4.9).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub query_max_names: usize,
    pub query_max_block_names: usize,
    pub retry_base_secs: i64,
    pub retry_bytes_per_sec: i64,
    pub retry_time_max_secs: i64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        RelayConfig {
            query_max_names: cc_relay_store::RELAY_QUERY_MAX_NAMES,
            query_max_block_names: cc_relay_store::RELAY_QUERY_MAX_BLOCK_NAMES,
            retry_base_secs: 5,
            retry_bytes_per_sec: 2000,
            retry_time_max_secs: 15,
        }
    }
}

/// Socket and thread-pool tuning (§4.8).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen_addr: String,
    pub connection_pool_size: usize,
    pub max_incoming: usize,
    pub threads_per_server: usize,
    pub so_linger_secs: u16,
    pub tcp_nodelay: bool,
    pub recv_buf: Option<usize>,
    pub send_buf: Option<usize>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            listen_addr: "127.0.0.1:9434".into(),
            connection_pool_size: 64,
            max_incoming: 32,
            threads_per_server: 4,
            so_linger_secs: 15,
            tcp_nodelay: false,
            recv_buf: None,
            send_buf: None,
        }
    }
}

/// SQLite connection tuning shared by every store crate (§5, §6).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub data_dir: String,
    pub busy_timeout_ms: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig { data_dir: "./data".into(), busy_timeout_ms: 30_000 }
    }
}

/// Shutdown grace period (§5's global-shutdown contract).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ShutdownConfig {
    pub grace_period_secs: u64,
    pub poll_interval_millis: u64,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        ShutdownConfig { grace_period_secs: 10, poll_interval_millis: 600 }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub relay: RelayConfig,
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub shutdown: ShutdownConfig,
}

impl NodeConfig {
    /// Loads a `NodeConfig` from a TOML file, falling back to field-level
    /// defaults for anything the file omits. No CLI/argv parsing lives
    /// here — the caller's binary (out of this repository's scope) is
    /// responsible for turning a command line into a config path.
    pub fn load(path: impl AsRef<Path>) -> cc_error::Result<NodeConfig> {
        let text = std::fs::read_to_string(path).map_err(cc_error::Error::Transport)?;
        toml::from_str(&text).map_err(|e| cc_error::Error::InvalidObject(format!("invalid config: {e}")))
    }
}
