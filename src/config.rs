//! Configuration management for Guardian.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use crate::error::{GuardianError, Result};
use crate::quota::{ConsistencyMode, QuotaDefaults};
use crate::store::StoreType;

/// Prefix of environment variables that override file settings, e.g.
/// `GUARDIAN__QUOTA__DEFAULT_REQUEST_QUOTA=100`.
const ENV_PREFIX: &str = "GUARDIAN";

/// Main configuration for the Guardian service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GuardianConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Quota configuration
    #[serde(default)]
    pub quota: QuotaConfig,

    /// Counter store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// gRPC server address
    #[serde(default = "default_grpc_addr")]
    pub grpc_addr: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            grpc_addr: default_grpc_addr(),
        }
    }
}

fn default_grpc_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8081))
}

/// Quota configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuotaConfig {
    /// Requests allowed per cycle for tokens without a provisioned total
    #[serde(default = "default_request_quota")]
    pub default_request_quota: i64,

    /// Bytes allowed per cycle for tokens without a provisioned total
    #[serde(default = "default_traffic_quota")]
    pub default_traffic_quota: i64,

    /// Cycle length in seconds
    #[serde(default = "default_reset_interval")]
    pub reset_interval_secs: u64,

    /// Counter update strategy
    #[serde(default)]
    pub consistency: ConsistencyMode,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            default_request_quota: default_request_quota(),
            default_traffic_quota: default_traffic_quota(),
            reset_interval_secs: default_reset_interval(),
            consistency: ConsistencyMode::default(),
        }
    }
}

impl QuotaConfig {
    /// Get the engine defaults.
    pub fn defaults(&self) -> QuotaDefaults {
        QuotaDefaults {
            request_quota: self.default_request_quota,
            traffic_quota: self.default_traffic_quota,
        }
    }

    /// Get the cycle length.
    pub fn reset_interval(&self) -> Duration {
        Duration::from_secs(self.reset_interval_secs)
    }
}

fn default_request_quota() -> i64 {
    1000
}

fn default_traffic_quota() -> i64 {
    10 * 1024 * 1024
}

fn default_reset_interval() -> u64 {
    60
}

/// Counter store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Which backend to use
    #[serde(default)]
    pub backend: StoreType,

    /// Redis connection URL, used by the redis backend
    #[serde(default = "default_redis_url")]
    pub redis_url: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreType::default(),
            redis_url: default_redis_url(),
        }
    }
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379/0".to_string()
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive; `RUST_LOG` takes precedence
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format
    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl GuardianConfig {
    /// Load configuration from an optional YAML file, then apply
    /// `GUARDIAN__`-prefixed environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).format(config::FileFormat::Yaml));
        }
        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let config: GuardianConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: GuardianConfig = serde_yaml::from_str(yaml)
            .map_err(|e| GuardianError::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the service cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.quota.default_request_quota < 0 {
            return Err(GuardianError::Config(
                "quota.default_request_quota must not be negative".to_string(),
            ));
        }
        if self.quota.default_traffic_quota < 0 {
            return Err(GuardianError::Config(
                "quota.default_traffic_quota must not be negative".to_string(),
            ));
        }
        if self.quota.reset_interval_secs == 0 {
            return Err(GuardianError::Config(
                "quota.reset_interval_secs must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}
