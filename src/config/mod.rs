use crate::utils::error::{MypoolerError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub proxy: ProxyConfig,
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    #[serde(default = "default_socket_path")]
    pub socket_path: String,
    #[serde(default)]
    pub debug: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Maximum number of upstream connections, idle and borrowed combined.
    #[serde(default = "default_max_size")]
    pub max_size: usize,
    /// Maximum connection lifetime in seconds. 0 disables expiry.
    #[serde(default = "default_max_lifetime_secs")]
    pub max_lifetime_secs: u64,
    /// How long an acquire may wait for a free connection, in milliseconds.
    #[serde(default = "default_wait_timeout_ms")]
    pub wait_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    3306
}

fn default_socket_path() -> String {
    format!("/tmp/{}.socket", env!("CARGO_PKG_NAME"))
}

fn default_max_size() -> usize {
    let cpus = std::thread::available_parallelism()
        .map(std::num::NonZeroUsize::get)
        .unwrap_or(1);
    cpus * 10
}

fn default_max_lifetime_secs() -> u64 {
    3600
}

fn default_wait_timeout_ms() -> u64 {
    3000
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            socket_path: default_socket_path(),
            debug: false,
        }
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_size: default_max_size(),
            max_lifetime_secs: default_max_lifetime_secs(),
            wait_timeout_ms: default_wait_timeout_ms(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| MypoolerError::Config(format!("Failed to read config file: {}", e)))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| MypoolerError::Config(format!("Failed to parse config file: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Check invariants that serde defaults alone cannot express.
    pub fn validate(&self) -> Result<()> {
        if self.pool.max_size == 0 {
            return Err(MypoolerError::Config(
                "pool.max_size must be at least 1".to_string(),
            ));
        }
        if self.proxy.socket_path.is_empty() {
            return Err(MypoolerError::Config(
                "proxy.socket_path must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    /// Log level after layering: debug mode wins, then an explicit CLI
    /// override, then the config file value.
    pub fn log_level(&self, cli_override: Option<&str>) -> String {
        if self.proxy.debug {
            "debug".to_string()
        } else if let Some(level) = cli_override {
            level.to_string()
        } else {
            self.logging.level.clone()
        }
    }

    pub fn max_lifetime(&self) -> Duration {
        Duration::from_secs(self.pool.max_lifetime_secs)
    }

    pub fn wait_timeout(&self) -> Duration {
        Duration::from_millis(self.pool.wait_timeout_ms)
    }
}
