//! Relay configuration with YAML loading and validation.
//!
//! Compiled defaults (struct `Default` implementations) are overlaid by the
//! YAML file passed on the command line (default `config.yaml`). The same
//! loader serves startup and hot reload, so an edited file goes through
//! identical parsing and validation.
//!
//! # Validation
//!
//! Snapshots are validated at load time: endpoint URLs must be unique and
//! http(s), weights and TPS caps must be at least 1, cache TTLs at least one
//! second. An invalid snapshot is rejected as a whole; during hot reload the
//! previously published snapshot stays in effect.
//!
//! Unrecognized top-level keys are ignored with a warning so a config file
//! written for a newer relay still loads.
//!
//! # Example
//!
//! ```yaml
//! cache_ttl:
//!   eth_blockNumber: 1
//!   eth_call: 5
//!
//! rpc_endpoints:
//!   primary:
//!     - url: https://sepolia-rollup.arbitrum.io/rpc
//!       max_tps: 10
//!       weight: 3
//!   secondary:
//!     - url: https://arbitrum-sepolia.publicnode.com
//!       max_tps: 5
//!
//! relay:
//!   host: 0.0.0.0
//!   port: 8545
//!   monitor_interval: 5
//! ```

use serde::{Deserialize, Serialize};
use std::{collections::HashMap, fmt, path::Path, time::Duration};
use thiserror::Error;

/// Errors raised while loading or validating configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("failed to read configuration: {0}")]
    Read(#[from] std::io::Error),

    /// The document is not valid YAML or does not match the schema.
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] serde_yaml::Error),

    /// The snapshot violates a structural invariant.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Endpoint preference tier. Primaries are always preferred while at least
/// one of them is selectable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Primary,
    Secondary,
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Tier::Primary => write!(f, "primary"),
            Tier::Secondary => write!(f, "secondary"),
        }
    }
}

/// Configuration for a single upstream RPC endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointSpec {
    /// HTTP(S) JSON-RPC endpoint URL.
    pub url: String,

    /// Maximum outbound requests per second. Must be at least 1.
    pub max_tps: u32,

    /// Optional cap on outbound requests per minute.
    #[serde(default)]
    pub max_tpm: Option<u32>,

    /// Load balancing weight. Higher weights receive more traffic. Defaults to `1`.
    #[serde(default = "default_weight")]
    pub weight: u32,

    /// Optional EWMA latency ceiling; above it the endpoint is marked unhealthy.
    #[serde(default)]
    pub max_latency_ms: Option<u64>,
}

fn default_weight() -> u32 {
    1
}

/// Upstream endpoints grouped by tier.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RpcEndpoints {
    #[serde(default)]
    pub primary: Vec<EndpointSpec>,
    #[serde(default)]
    pub secondary: Vec<EndpointSpec>,
}

/// Health monitor thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthMonitorConfig {
    /// Blocks an endpoint may lag behind the freshest one before it is
    /// marked unhealthy. Defaults to `6`.
    #[serde(default = "default_max_blocks_behind")]
    pub max_blocks_behind: u64,
}

fn default_max_blocks_behind() -> u64 {
    6
}

impl Default for HealthMonitorConfig {
    fn default() -> Self {
        Self { max_blocks_behind: default_max_blocks_behind() }
    }
}

/// Relay server and dispatch settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelaySection {
    /// IP address to bind the server to. Defaults to `0.0.0.0`.
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on. Defaults to `8545`.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Optional global EWMA latency ceiling used by the balancer filter.
    #[serde(default)]
    pub latency_threshold_ms: Option<u64>,

    /// Health probe cadence in seconds. Must be at least 1. Defaults to `5`.
    #[serde(default = "default_monitor_interval")]
    pub monitor_interval: u64,

    /// Outbound request timeout in seconds. Defaults to `15`.
    #[serde(default = "default_request_timeout")]
    pub request_timeout: u64,

    /// Bound on how long a request waits for a selectable endpoint, in
    /// seconds. Defaults to `5`.
    #[serde(default = "default_selection_timeout")]
    pub selection_timeout: u64,

    /// Maximum concurrent outbound HTTP requests. Defaults to `100`.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8545
}

fn default_monitor_interval() -> u64 {
    5
}

fn default_request_timeout() -> u64 {
    15
}

fn default_selection_timeout() -> u64 {
    5
}

fn default_max_connections() -> usize {
    100
}

impl Default for RelaySection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            latency_threshold_ms: None,
            monitor_interval: default_monitor_interval(),
            request_timeout: default_request_timeout(),
            selection_timeout: default_selection_timeout(),
            max_connections: default_max_connections(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (e.g., "debug", "info", "warn"). Defaults to `"info"`.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format: `"json"` or `"pretty"`. Defaults to `"pretty"`.
    #[serde(default = "default_log_format")]
    pub format: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: default_log_level(), format: default_log_format() }
    }
}

/// Root relay configuration. Immutable once published; hot reload swaps in a
/// whole new instance.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Cacheable methods mapped to their TTL in seconds. Methods absent from
    /// the map are never cached.
    #[serde(default)]
    pub cache_ttl: HashMap<String, u64>,

    #[serde(default)]
    pub rpc_endpoints: RpcEndpoints,

    #[serde(default)]
    pub health_monitor: HealthMonitorConfig,

    #[serde(default)]
    pub relay: RelaySection,

    #[serde(default)]
    pub logging: LoggingConfig,
}

const KNOWN_KEYS: &[&str] = &["cache_ttl", "rpc_endpoints", "health_monitor", "relay", "logging"];

impl RelayConfig {
    /// Loads and validates configuration from a YAML file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the file cannot be read, parsed, or fails
    /// validation.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let document: serde_yaml::Value = serde_yaml::from_str(&raw)?;

        if let serde_yaml::Value::Mapping(mapping) = &document {
            for key in mapping.keys() {
                if let serde_yaml::Value::String(name) = key {
                    if !KNOWN_KEYS.contains(&name.as_str()) {
                        tracing::warn!(key = %name, "ignoring unknown configuration key");
                    }
                }
            }
        }

        let config: RelayConfig = serde_yaml::from_value(document)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks the structural invariants of a snapshot.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] naming the first violated invariant.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.rpc_endpoints.primary.is_empty() && self.rpc_endpoints.secondary.is_empty() {
            return Err(ConfigError::Invalid("no rpc endpoints configured".to_string()));
        }

        let mut seen = std::collections::HashSet::new();
        for (tier, spec) in self.endpoints() {
            if spec.url.is_empty() {
                return Err(ConfigError::Invalid(format!("{tier} endpoint with empty url")));
            }
            if !spec.url.starts_with("http://") && !spec.url.starts_with("https://") {
                return Err(ConfigError::Invalid(format!(
                    "endpoint url must be http(s): {}",
                    spec.url
                )));
            }
            if !seen.insert(spec.url.as_str()) {
                return Err(ConfigError::Invalid(format!("duplicate endpoint url: {}", spec.url)));
            }
            if spec.weight < 1 {
                return Err(ConfigError::Invalid(format!(
                    "endpoint {} has weight {}, must be at least 1",
                    spec.url, spec.weight
                )));
            }
            if spec.max_tps < 1 {
                return Err(ConfigError::Invalid(format!(
                    "endpoint {} has max_tps {}, must be at least 1",
                    spec.url, spec.max_tps
                )));
            }
            if spec.max_tpm.is_some_and(|tpm| tpm < 1) {
                return Err(ConfigError::Invalid(format!(
                    "endpoint {} has max_tpm 0, must be at least 1",
                    spec.url
                )));
            }
        }

        for (method, ttl) in &self.cache_ttl {
            if *ttl < 1 {
                return Err(ConfigError::Invalid(format!(
                    "cache_ttl for {method} must be at least 1 second"
                )));
            }
        }

        if self.relay.monitor_interval < 1 {
            return Err(ConfigError::Invalid(
                "relay.monitor_interval must be at least 1 second".to_string(),
            ));
        }
        if self.relay.max_connections < 1 {
            return Err(ConfigError::Invalid(
                "relay.max_connections must be at least 1".to_string(),
            ));
        }

        Ok(())
    }

    /// Iterates over all endpoint specs in snapshot order, primaries first.
    pub fn endpoints(&self) -> impl Iterator<Item = (Tier, &EndpointSpec)> {
        self.rpc_endpoints
            .primary
            .iter()
            .map(|spec| (Tier::Primary, spec))
            .chain(self.rpc_endpoints.secondary.iter().map(|spec| (Tier::Secondary, spec)))
    }

    /// Returns the TTL for a method, or `None` when the method is not cacheable.
    #[must_use]
    pub fn ttl_for(&self, method: &str) -> Option<Duration> {
        self.cache_ttl.get(method).map(|secs| Duration::from_secs(*secs))
    }
}
