//! Health endpoint configuration

use serde::Deserialize;

/// HTTP health and metrics endpoint
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Whether to serve the endpoint
    pub enabled: bool,
    /// Bind host
    pub host: String,
    /// Bind port (0 picks a free port)
    pub port: u16,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            host: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

impl HealthConfig {
    /// `host:port` suitable for binding
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
