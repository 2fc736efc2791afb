//! Source and Sink Abstractions
//!
//! Narrow interfaces to the two external pub/sub systems the bridge sits
//! between. Concrete implementations talk MQTT (`remote::mqtt`) or stay
//! in-process (`remote::memory`).

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use super::InboundMessage;
use crate::protocol::QoS;

/// Error type for source and sink operations
#[derive(Debug, Clone, Error)]
pub enum RemoteError {
    /// Connection could not be established
    #[error("connect failed: {0}")]
    Connect(String),
    /// Connection to the remote peer was lost
    #[error("connection lost: {0}")]
    ConnectionLost(String),
    /// Remote peer rejected the operation
    #[error("rejected: {0}")]
    Rejected(String),
    /// Operation timed out
    #[error("operation timed out")]
    Timeout,
    /// Operation is not valid in the current state
    #[error("not connected")]
    NotConnected,
    /// Wire protocol violation
    #[error("protocol error: {0}")]
    Protocol(String),
}

/// Status of a remote peer connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemotePeerStatus {
    /// Not connected
    Disconnected,
    /// Currently connecting
    Connecting,
    /// Connected and operational
    Connected,
    /// Connection lost, backing off before retry
    Backoff,
}

impl RemotePeerStatus {
    pub fn is_connected(self) -> bool {
        self == RemotePeerStatus::Connected
    }
}

/// Handle returned by [`Source::subscribe`]
pub struct SourceSubscription {
    /// Fires once the subscription is live
    pub ready: oneshot::Receiver<()>,
    /// Stream of consumed messages; ends when the source shuts down
    pub messages: mpsc::Receiver<InboundMessage>,
}

/// The system messages are consumed from
#[async_trait]
pub trait Source: Send + Sync {
    /// Name used in logs and errors
    fn name(&self) -> &str;

    fn status(&self) -> RemotePeerStatus;

    async fn connect(&self) -> Result<(), RemoteError>;

    /// Start consuming. May be called once per connection.
    async fn subscribe(&self) -> Result<SourceSubscription, RemoteError>;

    /// Acknowledge that `msg` has been handed off and need not be redelivered
    fn mark_processed(&self, msg: &InboundMessage);

    async fn disconnect(&self) -> Result<(), RemoteError>;
}

/// The system messages are republished to
#[async_trait]
pub trait Sink: Send + Sync {
    /// Name used in logs and errors
    fn name(&self) -> &str;

    fn status(&self) -> RemotePeerStatus;

    async fn connect(&self) -> Result<(), RemoteError>;

    /// Publish and wait for the delivery acknowledgement of the given QoS.
    /// Callers bound the wait.
    async fn publish(
        &self,
        topic: &str,
        payload: Bytes,
        qos: QoS,
        retain: bool,
    ) -> Result<(), RemoteError>;

    async fn disconnect(&self) -> Result<(), RemoteError>;
}
