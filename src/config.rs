//! Configuration for the sync engine.
//!
//! Supports YAML file and environment variable overrides.

use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Engine configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// REST backend configuration.
    pub api: ApiConfig,
    /// Realtime socket configuration.
    pub socket: SocketConfig,
    /// Cache behavior.
    pub cache: CacheConfig,
    /// Override-workflow policy knobs.
    pub override_policy: OverridePolicy,
}

/// REST backend configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// Base URL for REST endpoints.
    pub base_url: String,
    /// Bearer token attached to every request.
    pub token: String,
    /// Per-request timeout in seconds.
    pub timeout_secs: u64,
    /// Maximum automatic retries for queries (mutations never retry).
    pub query_retries: usize,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8000/api".to_string(),
            token: String::new(),
            timeout_secs: 30,
            query_retries: 2,
        }
    }
}

impl ApiConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Realtime socket configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SocketConfig {
    /// Base URL for websocket channels.
    pub base_url: String,
    /// Initial reconnect delay in milliseconds.
    pub reconnect_base_ms: u64,
    /// Reconnect delay ceiling in milliseconds.
    pub reconnect_cap_ms: u64,
    /// Reconnect attempts before the channel gives up.
    pub max_reconnect_attempts: u32,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            base_url: "ws://localhost:8000/ws".to_string(),
            reconnect_base_ms: 1000,
            reconnect_cap_ms: 30_000,
            max_reconnect_attempts: 5,
        }
    }
}

impl SocketConfig {
    pub fn reconnect_base(&self) -> Duration {
        Duration::from_millis(self.reconnect_base_ms)
    }

    pub fn reconnect_cap(&self) -> Duration {
        Duration::from_millis(self.reconnect_cap_ms)
    }
}

/// Cache behavior configuration.
///
/// Staleness is infinite by design: entries refresh only on explicit
/// invalidation or a realtime patch. The reconciliation interval is a
/// safety net independent of socket health.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Periodic whole-cache invalidation interval in seconds.
    /// `None` disables reconciliation.
    pub reconcile_interval_secs: Option<u64>,
}

impl CacheConfig {
    pub fn reconcile_interval(&self) -> Option<Duration> {
        self.reconcile_interval_secs.map(Duration::from_secs)
    }
}

/// Override-workflow policy.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OverridePolicy {
    /// Accept override requests with an empty change-set (a
    /// "flag for re-review" request with no concrete change).
    pub allow_empty_changes: bool,
}

impl Default for OverridePolicy {
    fn default() -> Self {
        Self {
            allow_empty_changes: true,
        }
    }
}

impl Config {
    /// Load configuration from file and environment.
    ///
    /// Priority (highest to lowest):
    /// 1. Environment variables
    /// 2. Config file (`FUNDSYNC_CONFIG`, default `fundsync.yaml`)
    /// 3. Defaults
    pub fn load() -> Result<Self, ConfigError> {
        let config_path =
            std::env::var("FUNDSYNC_CONFIG").unwrap_or_else(|_| "fundsync.yaml".to_string());

        let mut config = if Path::new(&config_path).exists() {
            Self::from_file(&config_path)?
        } else {
            Self::default()
        };

        config.apply_env_overrides();

        Ok(config)
    }

    /// Load configuration from a YAML file.
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::FileRead(path.to_string(), e.to_string()))?;

        serde_yaml::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Apply environment variable overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(url) = std::env::var("FUNDSYNC_API_URL") {
            self.api.base_url = url;
        }

        if let Ok(url) = std::env::var("FUNDSYNC_SOCKET_URL") {
            self.socket.base_url = url;
        }

        if let Ok(token) = std::env::var("FUNDSYNC_TOKEN") {
            self.api.token = token;
        }

        if let Ok(secs) = std::env::var("FUNDSYNC_RECONCILE_SECS") {
            if let Ok(s) = secs.parse() {
                self.cache.reconcile_interval_secs = Some(s);
            }
        }
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{0}': {1}")]
    FileRead(String, String),

    #[error("Failed to parse config: {0}")]
    Parse(String),
}
