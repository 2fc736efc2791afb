//! Source-to-queue hand-off

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::metrics::Metrics;
use crate::queue::{BoundedQueue, PushError};
use crate::rate_limited_logger::RateLimitedLogger;
use crate::remote::{InboundMessage, Source};

/// What happened to a message offered to the queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Offer {
    Queued,
    /// Buffer full; the message was discarded
    Dropped,
    /// Queue closed for shutdown
    Closed,
}

/// Pulls messages from the source and offers them to the worker queue
pub struct IngestLoop {
    source: Arc<dyn Source>,
    messages: mpsc::Receiver<InboundMessage>,
    queue: Arc<BoundedQueue<InboundMessage>>,
    metrics: Arc<Metrics>,
    drop_logger: RateLimitedLogger,
}

impl IngestLoop {
    pub fn new(
        source: Arc<dyn Source>,
        messages: mpsc::Receiver<InboundMessage>,
        queue: Arc<BoundedQueue<InboundMessage>>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            source,
            messages,
            queue,
            metrics,
            drop_logger: RateLimitedLogger::default(),
        }
    }

    /// Run until cancelled, the source stream ends or the queue closes
    pub async fn run(mut self, cancel: CancellationToken) {
        loop {
            let msg = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                next = self.messages.recv() => match next {
                    Some(msg) => msg,
                    None => {
                        debug!("Source '{}': message stream ended", self.source.name());
                        break;
                    }
                },
            };

            if self.offer(msg) == Offer::Closed {
                break;
            }
        }
        debug!("Ingest loop stopped");
    }

    /// Hand one message to the queue without blocking.
    ///
    /// Messages are acknowledged to the source as they are handed off,
    /// including the ones dropped on a full buffer. Nothing is acknowledged
    /// once the queue is closed for shutdown.
    pub fn offer(&self, msg: InboundMessage) -> Offer {
        self.metrics.message_received();

        if self.queue.is_closed() {
            return Offer::Closed;
        }
        self.source.mark_processed(&msg);

        match self.queue.try_push(msg) {
            Ok(()) => Offer::Queued,
            Err(PushError::Full(msg)) => {
                self.metrics.message_dropped();
                self.drop_logger.warn(
                    "Buffer full, dropping message",
                    &format_args!("topic={} offset={}", msg.topic, msg.offset),
                );
                Offer::Dropped
            }
            Err(PushError::Closed(msg)) => {
                debug!(
                    "Queue closed while offering message on '{}' offset {}",
                    msg.topic, msg.offset
                );
                Offer::Closed
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::MemorySource;
    use pretty_assertions::assert_eq;

    async fn subscribed_source() -> (Arc<MemorySource>, mpsc::Receiver<InboundMessage>) {
        let source = Arc::new(MemorySource::new("test-source"));
        source.connect().await.unwrap();
        let sub = source.subscribe().await.unwrap();
        (source, sub.messages)
    }

    #[tokio::test]
    async fn test_overflow_drops_exactly_one() {
        const N: usize = 8;
        let (source, messages) = subscribed_source().await;
        let queue = Arc::new(BoundedQueue::new(N));
        let metrics = Arc::new(Metrics::new().unwrap());

        let sender = source.sender().unwrap();
        for i in 0..=N {
            sender
                .send(InboundMessage::new("in", "x").with_offset(i as i64))
                .await
                .unwrap();
        }
        drop(sender);
        source.disconnect().await.unwrap();

        let ingest = IngestLoop::new(source.clone(), messages, queue.clone(), metrics.clone());
        ingest.run(CancellationToken::new()).await;

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.received, N as u64 + 1);
        assert_eq!(snapshot.dropped, 1);
        assert_eq!(queue.len(), N);
        assert_eq!(source.acked().len(), N + 1);
        assert_eq!(source.acked()[N].2, N as i64);
    }

    #[tokio::test]
    async fn test_offer_reports_closed_queue() {
        let (source, messages) = subscribed_source().await;
        let queue = Arc::new(BoundedQueue::new(4));
        let metrics = Arc::new(Metrics::new().unwrap());
        let ingest = IngestLoop::new(source.clone(), messages, queue.clone(), metrics);

        assert_eq!(ingest.offer(InboundMessage::new("in", "a")), Offer::Queued);
        queue.close();
        assert_eq!(ingest.offer(InboundMessage::new("in", "b")), Offer::Closed);
        assert_eq!(source.acked().len(), 1);
    }

    #[tokio::test]
    async fn test_exits_on_cancel() {
        let (source, messages) = subscribed_source().await;
        let queue = Arc::new(BoundedQueue::new(4));
        let metrics = Arc::new(Metrics::new().unwrap());
        let ingest = IngestLoop::new(source, messages, queue, metrics);

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(ingest.run(cancel.clone()));
        cancel.cancel();
        tokio::time::timeout(std::time::Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
