//! In-process Source and Sink
//!
//! Collaborators that never leave the process. Used by the integration
//! tests and by embedders that feed the bridge from their own code.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::debug;

use super::{InboundMessage, RemoteError, RemotePeerStatus, Sink, Source, SourceSubscription};
use crate::protocol::QoS;

/// Default capacity of the injection channel
const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Source fed through an in-process channel
pub struct MemorySource {
    name: String,
    status: RwLock<RemotePeerStatus>,
    tx: Mutex<Option<mpsc::Sender<InboundMessage>>>,
    rx: Mutex<Option<mpsc::Receiver<InboundMessage>>>,
    acked: Mutex<Vec<(String, i32, i64)>>,
    fail_connect: AtomicBool,
    hold_ready: AtomicBool,
    /// Keeps a withheld ready signal pending instead of cancelled
    pending_ready: Mutex<Option<oneshot::Sender<()>>>,
}

impl MemorySource {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_capacity(name, DEFAULT_CHANNEL_CAPACITY)
    }

    pub fn with_capacity(name: impl Into<String>, capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        Self {
            name: name.into(),
            status: RwLock::new(RemotePeerStatus::Disconnected),
            tx: Mutex::new(Some(tx)),
            rx: Mutex::new(Some(rx)),
            acked: Mutex::new(Vec::new()),
            fail_connect: AtomicBool::new(false),
            hold_ready: AtomicBool::new(false),
            pending_ready: Mutex::new(None),
        }
    }

    /// Sender for injecting messages. Returns `None` after disconnect.
    pub fn sender(&self) -> Option<mpsc::Sender<InboundMessage>> {
        self.tx.lock().clone()
    }

    /// Make the next `connect` fail
    pub fn set_fail_connect(&self, fail: bool) {
        self.fail_connect.store(fail, Ordering::SeqCst);
    }

    /// Never fire the ready signal of the next subscription
    pub fn set_hold_ready(&self, hold: bool) {
        self.hold_ready.store(hold, Ordering::SeqCst);
    }

    /// Override the reported status
    pub fn set_status(&self, status: RemotePeerStatus) {
        *self.status.write() = status;
    }

    /// Acknowledged (topic, partition, offset) triples in ack order
    pub fn acked(&self) -> Vec<(String, i32, i64)> {
        self.acked.lock().clone()
    }
}

#[async_trait]
impl Source for MemorySource {
    fn name(&self) -> &str {
        &self.name
    }

    fn status(&self) -> RemotePeerStatus {
        *self.status.read()
    }

    async fn connect(&self) -> Result<(), RemoteError> {
        if self.fail_connect.load(Ordering::SeqCst) {
            return Err(RemoteError::Connect(format!(
                "{}: connection refused",
                self.name
            )));
        }
        *self.status.write() = RemotePeerStatus::Connected;
        Ok(())
    }

    async fn subscribe(&self) -> Result<SourceSubscription, RemoteError> {
        if !self.status().is_connected() {
            return Err(RemoteError::NotConnected);
        }
        let messages = self
            .rx
            .lock()
            .take()
            .ok_or_else(|| RemoteError::Rejected("already subscribed".to_string()))?;

        let (ready_tx, ready) = oneshot::channel();
        if self.hold_ready.load(Ordering::SeqCst) {
            *self.pending_ready.lock() = Some(ready_tx);
        } else {
            let _ = ready_tx.send(());
        }

        Ok(SourceSubscription { ready, messages })
    }

    fn mark_processed(&self, msg: &InboundMessage) {
        self.acked
            .lock()
            .push((msg.topic.clone(), msg.partition, msg.offset));
    }

    async fn disconnect(&self) -> Result<(), RemoteError> {
        self.tx.lock().take();
        self.pending_ready.lock().take();
        *self.status.write() = RemotePeerStatus::Disconnected;
        debug!("Source '{}': Disconnected", self.name);
        Ok(())
    }
}

/// A message captured by [`MemorySink`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
}

/// Sink that records every publish
pub struct MemorySink {
    name: String,
    status: RwLock<RemotePeerStatus>,
    published: Mutex<Vec<PublishedMessage>>,
    fail_connect: AtomicBool,
    fail_publish: AtomicBool,
    publish_delay: Mutex<Duration>,
    gate: watch::Sender<bool>,
}

impl MemorySink {
    pub fn new(name: impl Into<String>) -> Self {
        let (gate, _) = watch::channel(true);
        Self {
            name: name.into(),
            status: RwLock::new(RemotePeerStatus::Disconnected),
            published: Mutex::new(Vec::new()),
            fail_connect: AtomicBool::new(false),
            fail_publish: AtomicBool::new(false),
            publish_delay: Mutex::new(Duration::ZERO),
            gate,
        }
    }

    pub fn set_fail_connect(&self, fail: bool) {
        self.fail_connect.store(fail, Ordering::SeqCst);
    }

    /// Make every publish fail with `Rejected`
    pub fn set_fail_publish(&self, fail: bool) {
        self.fail_publish.store(fail, Ordering::SeqCst);
    }

    /// Delay every publish by `delay` before it completes
    pub fn set_publish_delay(&self, delay: Duration) {
        *self.publish_delay.lock() = delay;
    }

    /// Hold all publishes until [`MemorySink::open_gate`] is called
    pub fn close_gate(&self) {
        self.gate.send_replace(false);
    }

    pub fn open_gate(&self) {
        self.gate.send_replace(true);
    }

    pub fn set_status(&self, status: RemotePeerStatus) {
        *self.status.write() = status;
    }

    pub fn published(&self) -> Vec<PublishedMessage> {
        self.published.lock().clone()
    }

    pub fn published_count(&self) -> usize {
        self.published.lock().len()
    }

    /// Wait until at least `count` messages were published, up to `limit`
    pub async fn wait_for_published(&self, count: usize, limit: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + limit;
        loop {
            if self.published_count() >= count {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

#[async_trait]
impl Sink for MemorySink {
    fn name(&self) -> &str {
        &self.name
    }

    fn status(&self) -> RemotePeerStatus {
        *self.status.read()
    }

    async fn connect(&self) -> Result<(), RemoteError> {
        if self.fail_connect.load(Ordering::SeqCst) {
            return Err(RemoteError::Connect(format!(
                "{}: connection refused",
                self.name
            )));
        }
        *self.status.write() = RemotePeerStatus::Connected;
        Ok(())
    }

    async fn publish(
        &self,
        topic: &str,
        payload: Bytes,
        qos: QoS,
        retain: bool,
    ) -> Result<(), RemoteError> {
        let mut gate = self.gate.subscribe();
        // Sender lives in self, so the channel cannot close here
        let _ = gate.wait_for(|open| *open).await;

        let delay = *self.publish_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        if self.fail_publish.load(Ordering::SeqCst) {
            return Err(RemoteError::Rejected(format!("{}: publish refused", topic)));
        }

        self.published.lock().push(PublishedMessage {
            topic: topic.to_string(),
            payload,
            qos,
            retain,
        });
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), RemoteError> {
        *self.status.write() = RemotePeerStatus::Disconnected;
        debug!("Sink '{}': Disconnected", self.name);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_source_subscribe_once() {
        let source = MemorySource::new("mem");
        source.connect().await.unwrap();

        let mut sub = source.subscribe().await.unwrap();
        assert!(sub.ready.try_recv().is_ok());
        assert!(matches!(
            source.subscribe().await,
            Err(RemoteError::Rejected(_))
        ));
    }

    #[tokio::test]
    async fn test_source_stream_ends_on_disconnect() {
        let source = MemorySource::new("mem");
        source.connect().await.unwrap();
        let mut sub = source.subscribe().await.unwrap();

        let tx = source.sender().unwrap();
        tx.send(InboundMessage::new("a", "1")).await.unwrap();
        drop(tx);
        source.disconnect().await.unwrap();

        assert_eq!(sub.messages.recv().await.unwrap().topic, "a");
        assert!(sub.messages.recv().await.is_none());
        assert!(source.sender().is_none());
    }

    #[tokio::test]
    async fn test_sink_gate_holds_publish() {
        let sink = std::sync::Arc::new(MemorySink::new("mem"));
        sink.connect().await.unwrap();
        sink.close_gate();

        let publishing = {
            let sink = sink.clone();
            tokio::spawn(async move {
                sink.publish("t", Bytes::from_static(b"x"), QoS::AtMostOnce, false)
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(sink.published_count(), 0);

        sink.open_gate();
        publishing.await.unwrap().unwrap();
        assert_eq!(sink.published_count(), 1);
    }

    #[tokio::test]
    async fn test_sink_fail_publish() {
        let sink = MemorySink::new("mem");
        sink.set_fail_publish(true);
        let result = sink
            .publish("t", Bytes::new(), QoS::AtLeastOnce, false)
            .await;
        assert!(matches!(result, Err(RemoteError::Rejected(_))));
        assert!(sink.published().is_empty());
    }
}
