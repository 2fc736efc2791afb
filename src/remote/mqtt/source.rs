//! MQTT source: consumes the configured subscriptions from a remote broker

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use super::client::{ClientOptions, MqttClient};
use crate::config::{parse_endpoint, SourceConfig};
use crate::protocol::REASON_FAILURE_THRESHOLD;
use crate::remote::{InboundMessage, RemoteError, RemotePeerStatus, Source, SourceSubscription};

pub struct MqttSource {
    name: String,
    config: SourceConfig,
    client: RwLock<Option<Arc<MqttClient>>>,
    messages: Mutex<Option<mpsc::Receiver<InboundMessage>>>,
}

impl MqttSource {
    pub fn new(config: SourceConfig) -> Self {
        let name = match config.endpoints.first() {
            Some(endpoint) => format!("source:{}", endpoint),
            None => "source".to_string(),
        };
        Self {
            name,
            config,
            client: RwLock::new(None),
            messages: Mutex::new(None),
        }
    }

    fn client(&self) -> Option<Arc<MqttClient>> {
        self.client.read().clone()
    }
}

#[async_trait]
impl Source for MqttSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn status(&self) -> RemotePeerStatus {
        self.client()
            .map(|client| client.status())
            .unwrap_or(RemotePeerStatus::Disconnected)
    }

    /// Try each endpoint in order; the first accepted connection wins
    async fn connect(&self) -> Result<(), RemoteError> {
        let (tx, rx) = mpsc::channel(self.config.channel_capacity.max(1));
        let mut last_error = RemoteError::Connect("no endpoints configured".to_string());

        for endpoint in &self.config.endpoints {
            let (host, port) = parse_endpoint(endpoint);
            let mut options =
                ClientOptions::from_config(&self.name, host, port, &self.config.connection, "source");
            options.clean_start = !self.config.start_from_oldest;

            match MqttClient::connect(options, Some(tx.clone())).await {
                Ok(client) => {
                    let previous = self.client.write().replace(Arc::new(client));
                    if let Some(previous) = previous {
                        previous.disconnect().await;
                    }
                    *self.messages.lock() = Some(rx);
                    info!("Source '{}': Connected to {}", self.name, endpoint);
                    return Ok(());
                }
                Err(e) => {
                    warn!("Source '{}': {} unavailable: {}", self.name, endpoint, e);
                    last_error = e;
                }
            }
        }

        Err(last_error)
    }

    async fn subscribe(&self) -> Result<SourceSubscription, RemoteError> {
        let client = self.client().ok_or(RemoteError::NotConnected)?;
        let messages = self
            .messages
            .lock()
            .take()
            .ok_or_else(|| RemoteError::Rejected("already subscribed".to_string()))?;

        let qos = self.config.qos();
        let filters: Vec<_> = self
            .config
            .topic_filters()
            .into_iter()
            .map(|filter| (filter, qos))
            .collect();
        let count = filters.len();
        let suback = client.subscribe(filters).await?;

        let (ready_tx, ready) = oneshot::channel();
        let name = self.name.clone();
        tokio::spawn(async move {
            match suback.await {
                Ok(Ok(codes)) if codes.iter().any(|c| *c < REASON_FAILURE_THRESHOLD) => {
                    debug!("Source '{}': Subscribed to {} filters", name, count);
                    let _ = ready_tx.send(());
                }
                Ok(Ok(_)) => warn!("Source '{}': Every subscription was rejected", name),
                Ok(Err(e)) => warn!("Source '{}': Subscribe failed: {}", name, e),
                Err(_) => debug!("Source '{}': Connection closed before SUBACK", name),
            }
        });

        Ok(SourceSubscription { ready, messages })
    }

    fn mark_processed(&self, msg: &InboundMessage) {
        if let Some(client) = self.client() {
            client.ack(&msg.topic, msg.offset);
        }
    }

    async fn disconnect(&self) -> Result<(), RemoteError> {
        let client = self.client.write().take();
        self.messages.lock().take();
        if let Some(client) = client {
            client.disconnect().await;
            info!("Source '{}': Disconnected", self.name);
        }
        Ok(())
    }
}
