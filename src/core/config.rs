//! Configuration parsing and validation.
//!
//! Trellis configuration is loaded from TOML files with CLI overrides.
//! Sections mirror the architectural components: the routed storage, the
//! backing store client, the union watch worker and telemetry.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Environment variable consulted when no backend endpoints are configured.
pub const ENDPOINTS_ENV: &str = "ETCD_SERVERS";

/// Top-level Trellis configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Routed storage configuration.
    pub storage: StorageConfig,

    /// Backing store client configuration.
    #[serde(default)]
    pub backend: BackendConfig,

    /// Union watch worker configuration.
    #[serde(default)]
    pub watch: WatchConfig,

    /// Telemetry configuration.
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

/// Tenancy strategy for non-root tenants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Strategy {
    /// One partition store per tenant.
    Dedicated,
    /// One shared union store for all tenants.
    Union,
}

impl std::fmt::Display for Strategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Dedicated => write!(f, "dedicated"),
            Self::Union => write!(f, "union"),
        }
    }
}

/// Routed storage configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Resource name (plural, e.g. "widgets").
    pub resource: String,

    /// API group of the resource ("" for core).
    #[serde(default)]
    pub group: String,

    /// Key prefix of the root partition.
    #[serde(default = "default_root_prefix")]
    pub root_prefix: String,

    /// Shared key prefix under which every tenant's data lives.
    #[serde(default = "default_tenant_prefix")]
    pub tenant_prefix: String,

    /// Tenancy strategy.
    #[serde(default = "default_strategy")]
    pub strategy: Strategy,
}

/// Backing store mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendMode {
    /// In-process revisioned store.
    Memory,
    /// etcd v3 over gRPC.
    Etcd,
}

/// Backing store client configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Backend mode.
    #[serde(default = "default_backend_mode")]
    pub mode: BackendMode,

    /// Endpoint URLs (e.g. "https://10.0.0.1:2379").
    #[serde(default)]
    pub endpoints: Vec<String>,

    /// Trusted CA bundle path.
    #[serde(default)]
    pub ca_file: Option<String>,

    /// Client certificate path for mTLS.
    #[serde(default)]
    pub cert_file: Option<String>,

    /// Client private key path for mTLS.
    #[serde(default)]
    pub key_file: Option<String>,

    /// Dial timeout in milliseconds.
    #[serde(default = "default_dial_timeout_ms")]
    pub dial_timeout_ms: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            mode: default_backend_mode(),
            endpoints: Vec::new(),
            ca_file: None,
            cert_file: None,
            key_file: None,
            dial_timeout_ms: default_dial_timeout_ms(),
        }
    }
}

impl BackendConfig {
    /// Dial timeout as a duration.
    pub fn dial_timeout(&self) -> Duration {
        Duration::from_millis(self.dial_timeout_ms)
    }

    /// Configured endpoints, falling back to [`ENDPOINTS_ENV`] when empty.
    pub fn resolved_endpoints(&self) -> Vec<String> {
        if !self.endpoints.is_empty() {
            return self.endpoints.clone();
        }
        std::env::var(ENDPOINTS_ENV)
            .map(|raw| split_csv(&raw))
            .unwrap_or_default()
    }
}

/// Split a comma-separated list, dropping empty entries.
pub fn split_csv(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Union watch worker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchConfig {
    /// Fixed backoff between retries of a transient watch error.
    #[serde(default = "default_transient_backoff_ms")]
    pub transient_backoff_ms: u64,

    /// Capacity of each outgoing watch channel.
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,

    /// Request progress notifications on backend watches.
    #[serde(default)]
    pub progress_notify: bool,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            transient_backoff_ms: default_transient_backoff_ms(),
            channel_capacity: default_channel_capacity(),
            progress_notify: false,
        }
    }
}

impl WatchConfig {
    /// Transient backoff as a duration.
    pub fn transient_backoff(&self) -> Duration {
        Duration::from_millis(self.transient_backoff_ms)
    }
}

/// Telemetry configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Log level: "trace", "debug", "info", "warn", "error".
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
        }
    }
}

// Default value functions

fn default_root_prefix() -> String {
    "/registry".to_string()
}

fn default_tenant_prefix() -> String {
    "/tenants".to_string()
}

fn default_strategy() -> Strategy {
    Strategy::Union
}

fn default_backend_mode() -> BackendMode {
    BackendMode::Memory
}

fn default_dial_timeout_ms() -> u64 {
    10_000
}

fn default_transient_backoff_ms() -> u64 {
    200
}

fn default_channel_capacity() -> usize {
    256
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Config =
            toml::from_str(&content).with_context(|| "failed to parse config file")?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML string.
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content).with_context(|| "failed to parse config")?;
        config.validate()?;
        Ok(config)
    }

    /// Apply CLI overrides to the configuration.
    pub fn apply_overrides(&mut self, overrides: &ConfigOverrides) {
        if let Some(ref log_level) = overrides.log_level {
            self.telemetry.log_level = log_level.clone();
        }
        if let Some(strategy) = overrides.strategy {
            self.storage.strategy = strategy;
        }
        if !overrides.endpoints.is_empty() {
            self.backend.endpoints = overrides.endpoints.clone();
        }
    }

    /// Validate configuration consistency.
    pub fn validate(&self) -> Result<()> {
        self.validate_storage()?;
        self.validate_backend()?;
        self.validate_watch()?;
        self.validate_telemetry()?;
        Ok(())
    }

    fn validate_storage(&self) -> Result<()> {
        let resource = self.storage.resource.trim_matches('/');
        if resource.is_empty() {
            anyhow::bail!("storage.resource must not be empty");
        }
        if resource.contains('/') {
            anyhow::bail!(
                "storage.resource must be a single path segment, got: {}",
                self.storage.resource
            );
        }

        let root = self.storage.root_prefix.trim_matches('/');
        let tenants = self.storage.tenant_prefix.trim_matches('/');
        if tenants.is_empty() {
            anyhow::bail!("storage.tenant_prefix must not be empty");
        }
        // Root keys must never fall inside the shared tenant range.
        if root == tenants || root.starts_with(&format!("{}/", tenants)) {
            anyhow::bail!(
                "storage.root_prefix ({}) must not live under storage.tenant_prefix ({})",
                self.storage.root_prefix,
                self.storage.tenant_prefix
            );
        }
        Ok(())
    }

    fn validate_backend(&self) -> Result<()> {
        if self.backend.mode == BackendMode::Etcd {
            for endpoint in &self.backend.endpoints {
                if !endpoint.starts_with("http://") && !endpoint.starts_with("https://") {
                    anyhow::bail!(
                        "backend.endpoints entries must start with http:// or https://, got: {}",
                        endpoint
                    );
                }
            }
        }

        // If either cert or key is specified, both must be specified
        match (&self.backend.cert_file, &self.backend.key_file) {
            (Some(_), None) => anyhow::bail!("backend.key_file required when cert_file is set"),
            (None, Some(_)) => anyhow::bail!("backend.cert_file required when key_file is set"),
            _ => {}
        }

        if self.backend.dial_timeout_ms == 0 {
            anyhow::bail!("backend.dial_timeout_ms must be > 0");
        }
        Ok(())
    }

    fn validate_watch(&self) -> Result<()> {
        if self.watch.channel_capacity == 0 {
            anyhow::bail!("watch.channel_capacity must be > 0");
        }
        // The reconnect backoff is a short fixed pause, not a timeout.
        if self.watch.transient_backoff_ms > 5_000 {
            anyhow::bail!(
                "watch.transient_backoff_ms must be <= 5000, got: {}",
                self.watch.transient_backoff_ms
            );
        }
        Ok(())
    }

    fn validate_telemetry(&self) -> Result<()> {
        if !crate::ops::telemetry::is_valid_level(&self.telemetry.log_level) {
            anyhow::bail!(
                "telemetry.log_level must be one of trace, debug, info, warn, error; got: {}",
                self.telemetry.log_level
            );
        }
        Ok(())
    }
}

/// CLI override options that can be applied to configuration.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    /// Override log level.
    pub log_level: Option<String>,
    /// Override tenancy strategy.
    pub strategy: Option<Strategy>,
    /// Override backend endpoints.
    pub endpoints: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
[storage]
resource = "widgets"
"#;

    #[test]
    fn test_minimal_config_defaults() {
        let config = Config::from_toml(MINIMAL).unwrap();
        assert_eq!(config.storage.root_prefix, "/registry");
        assert_eq!(config.storage.tenant_prefix, "/tenants");
        assert_eq!(config.storage.strategy, Strategy::Union);
        assert_eq!(config.backend.mode, BackendMode::Memory);
        assert_eq!(config.backend.dial_timeout(), Duration::from_secs(10));
        assert_eq!(config.watch.transient_backoff(), Duration::from_millis(200));
    }

    #[test]
    fn test_root_prefix_inside_tenant_prefix_rejected() {
        let toml = r#"
[storage]
resource = "widgets"
root_prefix = "/tenants/root"
tenant_prefix = "/tenants"
"#;
        assert!(Config::from_toml(toml).is_err());
    }

    #[test]
    fn test_cert_without_key_rejected() {
        let toml = r#"
[storage]
resource = "widgets"

[backend]
cert_file = "/etc/trellis/client.crt"
"#;
        assert!(Config::from_toml(toml).is_err());
    }

    #[test]
    fn test_split_csv_drops_blanks() {
        assert_eq!(
            split_csv(" https://a:2379, ,https://b:2379,"),
            vec!["https://a:2379".to_string(), "https://b:2379".to_string()]
        );
    }

    #[test]
    fn test_overrides_apply() {
        let mut config = Config::from_toml(MINIMAL).unwrap();
        config.apply_overrides(&ConfigOverrides {
            log_level: Some("debug".into()),
            strategy: Some(Strategy::Dedicated),
            endpoints: vec!["https://etcd:2379".into()],
        });
        assert_eq!(config.telemetry.log_level, "debug");
        assert_eq!(config.storage.strategy, Strategy::Dedicated);
        assert_eq!(config.backend.endpoints.len(), 1);
    }
}
