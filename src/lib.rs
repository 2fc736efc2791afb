//! VibeBridge - priority-routed MQTT bridge broker
//!
//! Consumes messages from a source broker, picks a route for each one by
//! priority-ordered filters, optionally wraps it in a JSON envelope and
//! republishes it to a sink broker through a bounded worker pool that
//! drops on overload instead of blocking the source.

pub mod broker;
pub mod codec;
pub mod config;
pub mod metrics;
pub mod pipeline;
pub mod protocol;
pub mod queue;
pub mod rate_limited_logger;
pub mod remote;
pub mod routing;
pub mod transform;

pub use broker::{Broker, BrokerConfig, BrokerError, BrokerState};
pub use config::{Config, ConfigError, FilterSpec, RouteSpec, TransformKind};
pub use metrics::{HealthServer, Metrics, MetricsSnapshot};
pub use protocol::{ProtocolVersion, QoS};
pub use remote::{InboundMessage, RemoteError, RemotePeerStatus, Sink, Source};
pub use routing::{Route, Router};
