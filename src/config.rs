//! Configuration management for zlimit.
//!
//! Settings come from an optional YAML file, then `ZLIMIT__*` environment
//! variables (e.g. `ZLIMIT__LIMITS__MAX_REQUESTS=50`), on top of the defaults
//! below.

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use chrono::{TimeDelta, Utc};
use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{Result, ZlimitError};
use crate::ratelimit::AdmissionRequest;

/// Main configuration for the zlimit service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ZlimitConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Shared store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Quota applied to every caller
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Headers joined to build the caller key
    #[serde(default = "default_key_headers")]
    pub key_headers: Vec<String>,

    /// What to do with a request when the rate limiter itself fails
    #[serde(default)]
    pub failure_policy: FailurePolicy,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP server address
    #[serde(default = "default_http_addr")]
    pub http_addr: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: default_http_addr(),
        }
    }
}

/// Which shared store backs the activity records.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend {
    /// Redis sorted sets, shared by every instance.
    #[default]
    Redis,
    /// In-process sets; only correct for a single instance.
    Memory,
}

/// Shared store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,

    /// Redis connection URL
    #[serde(default = "default_redis_url")]
    pub redis_url: String,

    /// Namespace prepended to every caller key
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Upper bound on each store round trip, in milliseconds
    #[serde(default = "default_operation_timeout_ms")]
    pub operation_timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            redis_url: default_redis_url(),
            key_prefix: default_key_prefix(),
            operation_timeout_ms: default_operation_timeout_ms(),
        }
    }
}

impl StoreConfig {
    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }
}

/// Admission algorithm.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    /// Pipelined prune/insert/count; approximate under same-key concurrency.
    #[default]
    SlidingWindow,
    /// Atomic server-side script; exact, Redis only.
    Scripted,
}

/// Quota configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Maximum admitted requests per window
    #[serde(default = "default_max_requests")]
    pub max_requests: u64,

    /// Window duration in milliseconds
    #[serde(default = "default_window_ms")]
    pub window_ms: u64,

    #[serde(default)]
    pub strategy: StrategyKind,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_requests: default_max_requests(),
            window_ms: default_window_ms(),
            strategy: StrategyKind::default(),
        }
    }
}

impl LimitsConfig {
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }
}

/// Behavior when evaluating a request fails (store down, timeout).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Reject the request with a server error.
    #[default]
    Closed,
    /// Log the failure and let the request through.
    Open,
}

fn default_http_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8080))
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379/".to_string()
}

fn default_key_prefix() -> String {
    crate::store::DEFAULT_KEY_PREFIX.to_string()
}

fn default_operation_timeout_ms() -> u64 {
    250
}

fn default_max_requests() -> u64 {
    100
}

fn default_window_ms() -> u64 {
    60_000
}

fn default_key_headers() -> Vec<String> {
    vec!["x-api-key".to_string()]
}

impl Default for ZlimitConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            store: StoreConfig::default(),
            limits: LimitsConfig::default(),
            key_headers: default_key_headers(),
            failure_policy: FailurePolicy::default(),
        }
    }
}

fn environment() -> Environment {
    Environment::with_prefix("ZLIMIT")
        .separator("__")
        .try_parsing(true)
        .list_separator(",")
        .with_list_parse_key("key_headers")
}

impl ZlimitConfig {
    /// Load configuration from an optional file path plus the environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            info!(path = %path.display(), "Loading configuration file");
            builder = builder.add_source(File::from(path).format(FileFormat::Yaml));
        }

        let config: ZlimitConfig = builder
            .add_source(environment())
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a YAML string, without environment overrides.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: ZlimitConfig = Config::builder()
            .add_source(File::from_str(yaml, FileFormat::Yaml))
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings that cannot produce a working limiter.
    pub fn validate(&self) -> Result<()> {
        if self.limits.max_requests == 0 {
            return Err(ZlimitError::Config("limits.max_requests must be positive".into()));
        }
        if self.limits.window_ms == 0 {
            return Err(ZlimitError::Config("limits.window_ms must be positive".into()));
        }
        let request = AdmissionRequest::new("validate", self.limits.max_requests, self.limits.window())
            .map_err(|e| ZlimitError::Config(format!("limits are unusable: {}", e)))?;
        if Utc::now()
            .checked_add_signed(TimeDelta::milliseconds(request.window_ms()))
            .is_none()
        {
            return Err(ZlimitError::Config(format!(
                "limits.window_ms {} is too large",
                self.limits.window_ms
            )));
        }
        if self.store.operation_timeout_ms == 0 {
            return Err(ZlimitError::Config(
                "store.operation_timeout_ms must be positive".into(),
            ));
        }
        if self.key_headers.is_empty() || self.key_headers.iter().any(|h| h.trim().is_empty()) {
            return Err(ZlimitError::Config(
                "key_headers must list at least one non-empty header".into(),
            ));
        }
        if self.limits.strategy == StrategyKind::Scripted && self.store.backend != StoreBackend::Redis {
            return Err(ZlimitError::Config(
                "the scripted strategy requires the redis store backend".into(),
            ));
        }
        Ok(())
    }
}
