//! MQTT sink: republishes routed messages to a remote broker

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use tracing::info;

use super::client::{ClientOptions, MqttClient};
use crate::config::{parse_endpoint, SinkConfig};
use crate::protocol::QoS;
use crate::remote::{RemoteError, RemotePeerStatus, Sink};

pub struct MqttSink {
    name: String,
    config: SinkConfig,
    client: RwLock<Option<Arc<MqttClient>>>,
}

impl MqttSink {
    pub fn new(config: SinkConfig) -> Self {
        Self {
            name: format!("sink:{}", config.endpoint),
            config,
            client: RwLock::new(None),
        }
    }

    fn client(&self) -> Option<Arc<MqttClient>> {
        self.client.read().clone()
    }
}

#[async_trait]
impl Sink for MqttSink {
    fn name(&self) -> &str {
        &self.name
    }

    fn status(&self) -> RemotePeerStatus {
        self.client()
            .map(|client| client.status())
            .unwrap_or(RemotePeerStatus::Disconnected)
    }

    async fn connect(&self) -> Result<(), RemoteError> {
        let (host, port) = parse_endpoint(&self.config.endpoint);
        let options =
            ClientOptions::from_config(&self.name, host, port, &self.config.connection, "sink");
        let client = MqttClient::connect(options, None).await?;

        let previous = self.client.write().replace(Arc::new(client));
        if let Some(previous) = previous {
            previous.disconnect().await;
        }
        info!("Sink '{}': Connected", self.name);
        Ok(())
    }

    async fn publish(
        &self,
        topic: &str,
        payload: Bytes,
        qos: QoS,
        retain: bool,
    ) -> Result<(), RemoteError> {
        let client = self.client().ok_or(RemoteError::NotConnected)?;
        client.publish(topic, payload, qos, retain).await
    }

    async fn disconnect(&self) -> Result<(), RemoteError> {
        let client = self.client.write().take();
        if let Some(client) = client {
            client.disconnect().await;
            info!("Sink '{}': Disconnected", self.name);
        }
        Ok(())
    }
}
