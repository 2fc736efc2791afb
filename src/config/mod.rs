//! Configuration Module
//!
//! JSON (or TOML) configuration for the bridge:
//! - Source and sink connection settings
//! - Routes with filters and destination mappings
//! - Worker pool and buffer sizing
//! - Health endpoint
//!
//! `${VAR}` and `${VAR:-default}` references are substituted from the
//! environment before parsing.

use std::path::Path;
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use serde::Deserialize;
use thiserror::Error;

use crate::broker::{
    BrokerConfig, DEFAULT_BUFFER_SIZE, DEFAULT_PUBLISH_TIMEOUT, DEFAULT_READY_TIMEOUT,
    DEFAULT_SAMPLE_INTERVAL, DEFAULT_WORKER_COUNT,
};
use crate::routing::Router;

pub use health::HealthConfig;
pub use remote::{parse_endpoint, ConnectionConfig, SinkConfig, SourceConfig, DEFAULT_PORT};
pub use route::{DestinationMapping, FilterSpec, RouteSpec, TransformKind};

mod health;
mod remote;
mod route;


static ENV_VAR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{([^}:]+)(?::-([^}]*))?\}").expect("env var pattern is valid")
});

/// Substitute environment variables in a string.
/// Supports `${VAR}` and `${VAR:-default}` syntax.
fn substitute_env_vars(content: &str) -> String {
    ENV_VAR
        .replace_all(content, |caps: &regex::Captures| {
            let var_name = &caps[1];
            let default = caps.get(2).map(|m| m.as_str()).unwrap_or("");
            std::env::var(var_name).unwrap_or_else(|_| default.to_string())
        })
        .to_string()
}

/// Configuration error types
#[derive(Debug, Error)]
pub enum ConfigError {
    /// IO error reading config file
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// JSON parsing error
    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),
    /// TOML parsing error
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    /// A filter pattern failed to compile
    #[error("invalid pattern in {context}: {source}")]
    Regex {
        context: String,
        #[source]
        source: regex::Error,
    },
    /// Validation error
    #[error("validation error: {0}")]
    Validation(String),
}

/// Root configuration structure
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Logging configuration
    #[serde(default)]
    pub log: LogConfig,

    pub source: SourceConfig,

    pub sink: SinkConfig,

    pub routes: Vec<RouteSpec>,

    /// Number of concurrent workers
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,

    /// Capacity of the hand-off queue
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,

    /// Bound on a single sink publish
    #[serde(default = "default_publish_timeout", with = "humantime_serde")]
    pub publish_timeout: Duration,

    /// Metrics sampling period
    #[serde(default = "default_sample_interval", with = "humantime_serde")]
    pub sample_interval: Duration,

    /// How long start waits for the source subscription to become live
    #[serde(default = "default_ready_timeout", with = "humantime_serde")]
    pub ready_timeout: Duration,

    #[serde(default)]
    pub health: HealthConfig,
}

fn default_worker_count() -> usize {
    DEFAULT_WORKER_COUNT
}
fn default_buffer_size() -> usize {
    DEFAULT_BUFFER_SIZE
}
fn default_publish_timeout() -> Duration {
    DEFAULT_PUBLISH_TIMEOUT
}
fn default_sample_interval() -> Duration {
    DEFAULT_SAMPLE_INTERVAL
}
fn default_ready_timeout() -> Duration {
    DEFAULT_READY_TIMEOUT
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level: error, warn, info, debug, trace
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from a file with environment variable substitution.
    ///
    /// Files ending in `.toml` are parsed as TOML, anything else as JSON.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let substituted = substitute_env_vars(&content);

        match path.extension().and_then(|ext| ext.to_str()) {
            Some("toml") => Self::parse_toml(&substituted),
            _ => Self::parse(&substituted),
        }
    }

    /// Parse JSON configuration from a string (no env var support)
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Config = serde_json::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse TOML configuration from a string (no env var support)
    pub fn parse_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.source.endpoints.is_empty() || self.source.endpoints.iter().any(|e| e.is_empty())
        {
            return Err(ConfigError::Validation(
                "source.endpoints must list at least one non-empty endpoint".to_string(),
            ));
        }
        if self.source.subscriptions.is_empty()
            || self.source.subscriptions.iter().any(|s| s.is_empty())
        {
            return Err(ConfigError::Validation(
                "source.subscriptions must list at least one non-empty topic filter".to_string(),
            ));
        }
        if self.source.channel_capacity == 0 {
            return Err(ConfigError::Validation(
                "source.channelCapacity must be at least 1".to_string(),
            ));
        }
        if self.sink.endpoint.is_empty() {
            return Err(ConfigError::Validation(
                "sink.endpoint is required".to_string(),
            ));
        }

        for (name, qos) in [("source.qos", self.source.qos), ("sink.qos", self.sink.qos)] {
            if qos > 2 {
                return Err(ConfigError::Validation(format!(
                    "{} must be 0, 1, or 2",
                    name
                )));
            }
        }

        for (name, connection) in [
            ("source", &self.source.connection),
            ("sink", &self.sink.connection),
        ] {
            if connection.protocol().is_none() {
                return Err(ConfigError::Validation(format!(
                    "{}.protocolVersion must be 4 or 5",
                    name
                )));
            }
        }

        let broker_config = self.broker_config();
        broker_config.validate()?;
        Router::new(broker_config.routes)?;

        Ok(())
    }

    /// Pipeline settings handed to the broker
    pub fn broker_config(&self) -> BrokerConfig {
        BrokerConfig {
            routes: self.routes.clone(),
            worker_count: self.worker_count,
            buffer_size: self.buffer_size,
            publish_qos: self.sink.qos(),
            publish_retain: self.sink.retained,
            publish_timeout: self.publish_timeout,
            sample_interval: self.sample_interval,
            ready_timeout: self.ready_timeout,
            health: self.health.clone(),
        }
    }
}
