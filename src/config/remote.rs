//! Source and Sink Configuration
//!
//! Connection settings for the two pub/sub systems the bridge sits between.

use std::time::Duration;

use serde::Deserialize;

use crate::protocol::{ProtocolVersion, QoS};

/// Default broker port when an endpoint omits it
pub const DEFAULT_PORT: u16 = 1883;

/// Settings shared by the source and sink connections
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionConfig {
    /// Client ID; a per-process default is derived when unset
    #[serde(default)]
    pub client_id: Option<String>,

    #[serde(default)]
    pub username: Option<String>,

    #[serde(default)]
    pub password: Option<String>,

    /// Keep-alive interval in seconds
    #[serde(default = "default_keep_alive")]
    pub keep_alive: u16,

    #[serde(default = "default_connect_timeout", with = "humantime_serde")]
    pub connect_timeout: Duration,

    /// Initial reconnect delay after a lost connection
    #[serde(default = "default_reconnect_interval", with = "humantime_serde")]
    pub reconnect_interval: Duration,

    /// Backoff ceiling
    #[serde(default = "default_max_reconnect_interval", with = "humantime_serde")]
    pub max_reconnect_interval: Duration,

    /// 4 (v3.1.1) or 5 (v5.0)
    #[serde(default = "default_protocol_version")]
    pub protocol_version: u8,
}

fn default_keep_alive() -> u16 {
    60
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_reconnect_interval() -> Duration {
    Duration::from_secs(5)
}

fn default_max_reconnect_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_protocol_version() -> u8 {
    5
}

fn default_qos() -> u8 {
    1
}

fn default_channel_capacity() -> usize {
    1024
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            client_id: None,
            username: None,
            password: None,
            keep_alive: default_keep_alive(),
            connect_timeout: default_connect_timeout(),
            reconnect_interval: default_reconnect_interval(),
            max_reconnect_interval: default_max_reconnect_interval(),
            protocol_version: default_protocol_version(),
        }
    }
}

impl ConnectionConfig {
    /// Configured client ID, or `vibebridge-{role}-{pid}`
    pub fn client_id_or_default(&self, role: &str) -> String {
        self.client_id
            .clone()
            .unwrap_or_else(|| format!("vibebridge-{}-{}", role, std::process::id()))
    }

    pub fn protocol(&self) -> Option<ProtocolVersion> {
        ProtocolVersion::from_u8(self.protocol_version)
    }
}

/// Split `[scheme://]host[:port]` into host and port
pub fn parse_endpoint(endpoint: &str) -> (String, u16) {
    let address = endpoint
        .split_once("://")
        .map(|(_, rest)| rest)
        .unwrap_or(endpoint)
        .trim_end_matches('/');

    if let Some((host, port_str)) = address.rsplit_once(':') {
        if let Ok(port) = port_str.parse::<u16>() {
            return (host.to_string(), port);
        }
    }
    (address.to_string(), DEFAULT_PORT)
}

/// Where messages are consumed from
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceConfig {
    /// Brokers tried in order until one accepts the connection
    pub endpoints: Vec<String>,

    /// Topic filters to consume
    pub subscriptions: Vec<String>,

    /// Consumer group; members share the subscriptions
    #[serde(default)]
    pub group_id: Option<String>,

    /// Resume from the stored session instead of starting fresh
    #[serde(default)]
    pub start_from_oldest: bool,

    /// Subscription QoS
    #[serde(default = "default_qos")]
    pub qos: u8,

    /// Buffer between the connection and the ingest loop
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,

    #[serde(flatten)]
    pub connection: ConnectionConfig,
}

impl SourceConfig {
    pub fn new(endpoint: impl Into<String>, subscription: impl Into<String>) -> Self {
        Self {
            endpoints: vec![endpoint.into()],
            subscriptions: vec![subscription.into()],
            group_id: None,
            start_from_oldest: false,
            qos: default_qos(),
            channel_capacity: default_channel_capacity(),
            connection: ConnectionConfig::default(),
        }
    }

    pub fn qos(&self) -> QoS {
        QoS::from_u8(self.qos).unwrap_or(QoS::AtLeastOnce)
    }

    /// Subscription filters, prefixed with `$share/{groupId}/` when grouped
    pub fn topic_filters(&self) -> Vec<String> {
        match self.group_id.as_deref() {
            Some(group) if !group.is_empty() => self
                .subscriptions
                .iter()
                .map(|filter| format!("$share/{}/{}", group, filter))
                .collect(),
            _ => self.subscriptions.clone(),
        }
    }
}

/// Where messages are published to
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SinkConfig {
    pub endpoint: String,

    /// Publish QoS
    #[serde(default = "default_qos")]
    pub qos: u8,

    /// Publish with the retain flag
    #[serde(default)]
    pub retained: bool,

    #[serde(flatten)]
    pub connection: ConnectionConfig,
}

impl SinkConfig {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            qos: default_qos(),
            retained: false,
            connection: ConnectionConfig::default(),
        }
    }

    pub fn qos(&self) -> QoS {
        QoS::from_u8(self.qos).unwrap_or(QoS::AtLeastOnce)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_endpoint_with_port() {
        assert_eq!(
            parse_endpoint("broker.example.com:8883"),
            ("broker.example.com".to_string(), 8883)
        );
    }

    #[test]
    fn test_parse_endpoint_scheme_and_default_port() {
        assert_eq!(
            parse_endpoint("tcp://broker.example.com"),
            ("broker.example.com".to_string(), DEFAULT_PORT)
        );
        assert_eq!(
            parse_endpoint("mqtt://10.0.0.1:1884/"),
            ("10.0.0.1".to_string(), 1884)
        );
    }

    #[test]
    fn test_shared_subscription_filters() {
        let mut source = SourceConfig::new("localhost", "logs/#");
        assert_eq!(source.topic_filters(), vec!["logs/#".to_string()]);

        source.group_id = Some("bridge".to_string());
        assert_eq!(source.topic_filters(), vec!["$share/bridge/logs/#".to_string()]);
    }

    #[test]
    fn test_flattened_connection_settings() {
        let sink: SinkConfig = serde_json::from_str(
            r#"{"endpoint": "out:1883", "clientId": "bridge-out", "keepAlive": 15,
                "connectTimeout": "2s", "retained": true}"#,
        )
        .unwrap();
        assert_eq!(sink.connection.client_id.as_deref(), Some("bridge-out"));
        assert_eq!(sink.connection.keep_alive, 15);
        assert_eq!(sink.connection.connect_timeout, Duration::from_secs(2));
        assert_eq!(sink.qos(), QoS::AtLeastOnce);
        assert!(sink.retained);
    }

    #[test]
    fn test_default_client_id_includes_role() {
        let config = ConnectionConfig::default();
        assert!(config.client_id_or_default("sink").starts_with("vibebridge-sink-"));
    }
}
