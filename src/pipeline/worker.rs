//! Routing, transform and publish workers

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::metrics::Metrics;
use crate::protocol::QoS;
use crate::queue::BoundedQueue;
use crate::rate_limited_logger::RateLimitedLogger;
use crate::remote::{InboundMessage, RemoteError, Sink};
use crate::routing::Router;
use crate::transform::{TopicResolver, TransformError, Transformer};

/// Per-message failure; never stops a worker
#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("no route matches message on '{topic}'")]
    NoRouteMatch { topic: String },

    #[error("route '{route}' failed to transform message: {source}")]
    Transform {
        route: String,
        #[source]
        source: TransformError,
    },

    #[error("publish to '{topic}' timed out after {timeout:?}")]
    PublishTimeout { topic: String, timeout: Duration },

    #[error("publish to '{topic}' failed: {source}")]
    Publish {
        topic: String,
        #[source]
        source: RemoteError,
    },
}

/// State shared by every worker of a broker
pub struct WorkerContext {
    router: Arc<Router>,
    sink: Arc<dyn Sink>,
    metrics: Arc<Metrics>,
    qos: QoS,
    retain: bool,
    publish_timeout: Duration,
    // One logger per kind so a flood of one failure never hides another
    no_route_logger: RateLimitedLogger,
    transform_logger: RateLimitedLogger,
    publish_logger: RateLimitedLogger,
}

impl WorkerContext {
    pub fn new(
        router: Arc<Router>,
        sink: Arc<dyn Sink>,
        metrics: Arc<Metrics>,
        qos: QoS,
        retain: bool,
        publish_timeout: Duration,
    ) -> Self {
        Self {
            router,
            sink,
            metrics,
            qos,
            retain,
            publish_timeout,
            no_route_logger: RateLimitedLogger::default(),
            transform_logger: RateLimitedLogger::default(),
            publish_logger: RateLimitedLogger::default(),
        }
    }

    /// Route, transform and publish a single message
    pub async fn process(&self, msg: &InboundMessage) -> Result<(), ProcessError> {
        let route = self
            .router
            .find_route(msg)
            .ok_or_else(|| ProcessError::NoRouteMatch {
                topic: msg.topic.clone(),
            })?;

        let mapping = route.mapping();
        let payload =
            Transformer::apply(mapping.transform, msg).map_err(|source| ProcessError::Transform {
                route: route.name().to_string(),
                source,
            })?;
        let topic = TopicResolver::resolve(&mapping.destination_template, msg);
        self.metrics.message_processed();

        debug!(
            route = route.name(),
            source_topic = %msg.topic,
            offset = msg.offset,
            "Publishing to '{}'",
            topic
        );

        let publish = self.sink.publish(&topic, payload, self.qos, self.retain);
        match tokio::time::timeout(self.publish_timeout, publish).await {
            Ok(Ok(())) => {
                self.metrics.message_published();
                Ok(())
            }
            Ok(Err(source)) => Err(ProcessError::Publish { topic, source }),
            Err(_) => Err(ProcessError::PublishTimeout {
                topic,
                timeout: self.publish_timeout,
            }),
        }
    }

    /// Count and log a failed message
    pub fn record_failure(&self, err: &ProcessError) {
        let logger = match err {
            ProcessError::NoRouteMatch { .. } => {
                self.metrics.route_missed();
                &self.no_route_logger
            }
            ProcessError::Transform { .. } => {
                self.metrics.transform_failed();
                &self.transform_logger
            }
            ProcessError::PublishTimeout { .. } | ProcessError::Publish { .. } => {
                self.metrics.publish_failed();
                &self.publish_logger
            }
        };
        logger.warn("Failed to process message", err);
    }
}

/// One member of the worker pool
pub struct Worker {
    id: usize,
    ctx: Arc<WorkerContext>,
    queue: Arc<BoundedQueue<InboundMessage>>,
}

impl Worker {
    pub fn new(id: usize, ctx: Arc<WorkerContext>, queue: Arc<BoundedQueue<InboundMessage>>) -> Self {
        Self { id, ctx, queue }
    }

    /// Drain the queue until cancelled or the queue is closed and empty.
    /// A message already taken is always finished before exiting.
    pub async fn run(self, cancel: CancellationToken) {
        debug!("Worker {} started", self.id);
        loop {
            let msg = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                next = self.queue.pop() => match next {
                    Some(msg) => msg,
                    None => break,
                },
            };

            self.ctx.metrics.active_workers.inc();
            if let Err(e) = self.ctx.process(&msg).await {
                self.ctx.record_failure(&e);
            }
            self.ctx.metrics.active_workers.dec();
        }
        debug!("Worker {} stopped", self.id);
    }
}
