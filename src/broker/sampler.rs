//! Periodic metrics sampling

use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::metrics::Metrics;
use crate::queue::BoundedQueue;
use crate::remote::{InboundMessage, Sink, Source};

/// Refresh rates, buffer utilization and connection flags every `interval`.
/// A peer seen connected on one tick and not on the next counts as an error.
pub async fn run(
    metrics: Arc<Metrics>,
    queue: Arc<BoundedQueue<InboundMessage>>,
    source: Arc<dyn Source>,
    sink: Arc<dyn Sink>,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut source_up = source.status().is_connected();
    let mut sink_up = sink.status().is_connected();

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let source_now = source.status();
                let sink_now = sink.status();
                if source_up && !source_now.is_connected() {
                    warn!("Source '{}': Connection lost ({:?})", source.name(), source_now);
                    metrics.source_error();
                }
                if sink_up && !sink_now.is_connected() {
                    warn!("Sink '{}': Connection lost ({:?})", sink.name(), sink_now);
                    metrics.sink_error();
                }
                source_up = source_now.is_connected();
                sink_up = sink_now.is_connected();

                metrics.set_connection_status(source_up, sink_up);
                metrics.sample(queue.len(), queue.capacity());
            }
            _ = cancel.cancelled() => {
                debug!("Metrics sampler shutting down");
                break;
            }
        }
    }
}
