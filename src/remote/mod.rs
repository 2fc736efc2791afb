//! Remote Broker Communication
//!
//! The two collaborators of a bridge: the source messages are consumed
//! from and the sink they are republished to. Traits and shared types live
//! here; `mqtt` talks to real brokers and `memory` stays in-process.

mod message;
mod peer;

pub mod memory;
pub mod mqtt;

pub use memory::{MemorySink, MemorySource, PublishedMessage};
pub use message::InboundMessage;
pub use mqtt::{MqttSink, MqttSource};
pub use peer::{RemoteError, RemotePeerStatus, Sink, Source, SourceSubscription};
