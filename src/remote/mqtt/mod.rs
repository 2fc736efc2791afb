//! MQTT Collaborators
//!
//! Source and sink implementations that talk MQTT v3.1.1 or v5.0 to
//! remote brokers over TCP.

mod client;
mod sink;
mod source;

pub use client::{ClientOptions, MqttClient, SubAckReceiver};
pub use sink::MqttSink;
pub use source::MqttSource;
