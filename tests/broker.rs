//! Broker Integration Tests
//!
//! Drive a full broker (router, queue, worker pool, ingest loop, sampler)
//! with the in-process source and sink.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use pretty_assertions::assert_eq;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use vibebridge::broker::{Broker, BrokerConfig, BrokerError, BrokerState};
use vibebridge::config::{FilterSpec, HealthConfig, RouteSpec, TransformKind};
use vibebridge::remote::{InboundMessage, MemorySink, MemorySource, RemotePeerStatus, Sink, Source};

const WAIT: Duration = Duration::from_secs(5);

struct Harness {
    broker: Arc<Broker>,
    source: Arc<MemorySource>,
    sink: Arc<MemorySink>,
}

impl Harness {
    fn new(config: BrokerConfig) -> Self {
        let source = Arc::new(MemorySource::new("memory-source"));
        let sink = Arc::new(MemorySink::new("memory-sink"));
        let broker = Broker::new(config, source.clone(), sink.clone()).expect("valid config");
        Self {
            broker: Arc::new(broker),
            source,
            sink,
        }
    }

    async fn send(&self, msg: InboundMessage) {
        self.source
            .sender()
            .expect("source connected")
            .send(msg)
            .await
            .expect("ingest loop running");
    }
}

async fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + WAIT;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}

fn catch_all() -> RouteSpec {
    RouteSpec::new("catch-all", "out/{sourceTopic}")
}

#[tokio::test]
async fn test_scenario_a_wildcard_route() {
    let h = Harness::new(BrokerConfig::new(vec![catch_all()]).with_workers(2));
    h.broker.start().await.unwrap();
    assert_eq!(h.broker.state(), BrokerState::Started);

    h.send(InboundMessage::new("x", "hi")).await;
    assert!(h.sink.wait_for_published(1, WAIT).await);

    let published = h.sink.published();
    assert_eq!(published[0].topic, "out/x");
    assert_eq!(published[0].payload, Bytes::from_static(b"hi"));

    h.broker.stop().await.unwrap();
    let snapshot = h.broker.snapshot();
    assert_eq!(snapshot.received, 1);
    assert_eq!(snapshot.processed, 1);
    assert_eq!(snapshot.published, 1);
    assert_eq!(snapshot.failed, 0);
}

#[tokio::test]
async fn test_scenario_b_priority_fallthrough() {
    let critical = RouteSpec::new("critical", "alerts/{sourceTopic}")
        .with_priority(10)
        .with_filter(FilterSpec::Topic {
            pattern: r"^logs\.".to_string(),
        })
        .with_filter(FilterSpec::Value {
            pattern: "CRITICAL|ERROR".to_string(),
            json_path: Some("level".to_string()),
        })
        .with_transform(TransformKind::Json);
    let rest = RouteSpec::new("rest", "archive/{sourceTopic}").with_priority(1);

    let h = Harness::new(BrokerConfig::new(vec![rest, critical]).with_workers(1));
    h.broker.start().await.unwrap();

    h.send(InboundMessage::new("logs.app", r#"{"level":"CRITICAL"}"#)).await;
    assert!(h.sink.wait_for_published(1, WAIT).await);
    h.send(InboundMessage::new("logs.app", r#"{"level":"INFO"}"#)).await;
    assert!(h.sink.wait_for_published(2, WAIT).await);

    let published = h.sink.published();
    assert_eq!(published[0].topic, "alerts/logs.app");
    let envelope: serde_json::Value = serde_json::from_slice(&published[0].payload).unwrap();
    assert_eq!(envelope["value"], r#"{"level":"CRITICAL"}"#);

    assert_eq!(published[1].topic, "archive/logs.app");
    assert_eq!(published[1].payload, Bytes::from_static(br#"{"level":"INFO"}"#));

    h.broker.stop().await.unwrap();
}

#[tokio::test]
async fn test_scenario_c_stop_joins_everything() {
    let h = Harness::new(BrokerConfig::new(vec![catch_all()]).with_workers(4));
    h.broker.start().await.unwrap();
    // 4 workers, ingest loop and sampler
    assert_eq!(h.broker.active_tasks(), 6);

    for i in 0..20 {
        h.send(InboundMessage::new("t", "v").with_offset(i)).await;
    }
    h.broker.stop().await.unwrap();

    assert_eq!(h.broker.state(), BrokerState::Stopped);
    assert_eq!(h.broker.active_tasks(), 0);
    assert!(h.source.sender().is_none());
    assert_eq!(h.sink.status(), RemotePeerStatus::Disconnected);
    assert!(!h.broker.metrics().is_healthy());
}

#[tokio::test]
async fn test_backpressure_drops_without_blocking() {
    let config = BrokerConfig::new(vec![catch_all()])
        .with_workers(1)
        .with_buffer_size(2)
        .with_publish_timeout(Duration::from_secs(30));
    let h = Harness::new(config);
    h.sink.close_gate();
    h.broker.start().await.unwrap();
    let metrics = h.broker.metrics();

    // Park the only worker on a publish that cannot complete
    h.send(InboundMessage::new("t", "0")).await;
    assert!(wait_until(|| metrics.active_workers.get() == 1).await);

    for i in 1..=5 {
        h.send(InboundMessage::new("t", "x").with_offset(i)).await;
    }
    assert!(wait_until(|| metrics.received.get() == 6).await);

    let snapshot = h.broker.snapshot();
    assert_eq!(snapshot.dropped, 3);
    assert_eq!(snapshot.published, 0);
    // Dropped messages are acknowledged too
    assert!(wait_until(|| h.source.acked().len() == 6).await);

    h.sink.open_gate();
    assert!(h.sink.wait_for_published(3, WAIT).await);
    h.broker.stop().await.unwrap();
    assert_eq!(h.broker.snapshot().published, 3);
}

#[tokio::test]
async fn test_unrouted_and_failed_messages_are_counted() {
    let route = RouteSpec::new("orders", "out/orders").with_filter(FilterSpec::Topic {
        pattern: "^orders$".to_string(),
    });
    let h = Harness::new(BrokerConfig::new(vec![route]).with_workers(1));
    h.broker.start().await.unwrap();
    let metrics = h.broker.metrics();

    h.send(InboundMessage::new("payments", "x")).await;
    assert!(wait_until(|| metrics.failed.get() == 1).await);

    h.sink.set_fail_publish(true);
    h.send(InboundMessage::new("orders", "x")).await;
    assert!(wait_until(|| metrics.failed.get() == 2).await);

    h.sink.set_fail_publish(false);
    h.send(InboundMessage::new("orders", "y")).await;
    assert!(h.sink.wait_for_published(1, WAIT).await);

    h.broker.stop().await.unwrap();
    let snapshot = h.broker.snapshot();
    assert_eq!(snapshot.received, 3);
    assert_eq!(snapshot.processed, 2);
    assert_eq!(snapshot.published, 1);
    assert_eq!(snapshot.sink_errors, 1);
}

#[tokio::test]
async fn test_sink_connect_failure() {
    let h = Harness::new(BrokerConfig::new(vec![catch_all()]));
    h.sink.set_fail_connect(true);

    let err = h.broker.start().await.unwrap_err();
    assert!(matches!(err, BrokerError::Connection { ref peer, .. } if peer == "memory-sink"));
    assert_eq!(h.broker.state(), BrokerState::Stopped);
    assert_eq!(h.broker.active_tasks(), 0);
    assert_eq!(h.broker.snapshot().sink_errors, 1);
    assert_eq!(h.broker.snapshot().source_errors, 0);
}

#[tokio::test]
async fn test_source_connect_failure_disconnects_sink() {
    let h = Harness::new(BrokerConfig::new(vec![catch_all()]));
    h.source.set_fail_connect(true);

    let err = h.broker.start().await.unwrap_err();
    assert!(matches!(err, BrokerError::Connection { ref peer, .. } if peer == "memory-source"));
    assert_eq!(h.sink.status(), RemotePeerStatus::Disconnected);
    assert_eq!(h.broker.state(), BrokerState::Stopped);
    assert_eq!(h.broker.snapshot().source_errors, 1);
}

#[tokio::test]
async fn test_ready_timeout_tears_down() {
    let config =
        BrokerConfig::new(vec![catch_all()]).with_ready_timeout(Duration::from_millis(50));
    let h = Harness::new(config);
    h.source.set_hold_ready(true);

    let err = h.broker.start().await.unwrap_err();
    assert!(matches!(err, BrokerError::ReadyTimeout(_)));
    assert_eq!(h.broker.state(), BrokerState::Stopped);
    assert_eq!(h.broker.active_tasks(), 0);
    assert!(h.source.sender().is_none());
    assert_eq!(h.broker.snapshot().source_errors, 1);
}

#[tokio::test]
async fn test_stop_during_start_aborts_and_tears_down() {
    let config = BrokerConfig::new(vec![catch_all()]).with_ready_timeout(Duration::from_secs(30));
    let h = Harness::new(config);
    h.source.set_hold_ready(true);

    let start = tokio::spawn({
        let broker = h.broker.clone();
        async move { broker.start().await }
    });
    assert!(
        wait_until(|| h.broker.state() == BrokerState::Starting
            && h.source.status() == RemotePeerStatus::Connected)
        .await
    );

    // Returns long before the ready timeout, with everything down
    tokio::time::timeout(WAIT, h.broker.stop())
        .await
        .expect("stop waits for the aborted start, not the ready timeout")
        .unwrap();
    assert_eq!(h.broker.state(), BrokerState::Stopped);
    assert_eq!(h.sink.status(), RemotePeerStatus::Disconnected);
    assert!(h.source.sender().is_none());
    assert_eq!(h.broker.active_tasks(), 0);

    let result = start.await.unwrap();
    assert!(matches!(result, Err(BrokerError::StartAborted)));
    assert!(matches!(
        h.broker.start().await,
        Err(BrokerError::InvalidState {
            state: BrokerState::Stopped,
            ..
        })
    ));
}

#[tokio::test]
async fn test_start_twice_is_rejected() {
    let h = Harness::new(BrokerConfig::new(vec![catch_all()]));
    h.broker.start().await.unwrap();

    let err = h.broker.start().await.unwrap_err();
    assert!(matches!(
        err,
        BrokerError::InvalidState {
            state: BrokerState::Started,
            ..
        }
    ));
    h.broker.stop().await.unwrap();
}

#[tokio::test]
async fn test_concurrent_stop_is_idempotent() {
    let h = Harness::new(BrokerConfig::new(vec![catch_all()]));
    h.broker.start().await.unwrap();

    let a = tokio::spawn({
        let broker = h.broker.clone();
        async move { broker.stop().await }
    });
    let b = tokio::spawn({
        let broker = h.broker.clone();
        async move { broker.stop().await }
    });
    a.await.unwrap().unwrap();
    b.await.unwrap().unwrap();

    assert!(wait_until(|| h.broker.state() == BrokerState::Stopped).await);
    h.broker.stop().await.unwrap();
    assert_eq!(h.broker.state(), BrokerState::Stopped);
    assert_eq!(h.broker.active_tasks(), 0);
}

async fn http_get(addr: SocketAddr, path: &str) -> (u16, serde_json::Value) {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let request = format!(
        "GET {} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
        path
    );
    stream.write_all(request.as_bytes()).await.unwrap();

    let mut raw = Vec::new();
    stream.read_to_end(&mut raw).await.unwrap();
    let text = String::from_utf8(raw).unwrap();
    let status = text
        .split_whitespace()
        .nth(1)
        .and_then(|code| code.parse().ok())
        .unwrap();
    let body = text.split_once("\r\n\r\n").map(|(_, b)| b).unwrap_or("");
    (status, serde_json::from_str(body).unwrap_or(serde_json::Value::Null))
}

#[tokio::test]
async fn test_health_endpoint_follows_lifecycle() {
    let health = HealthConfig {
        enabled: true,
        host: "127.0.0.1".to_string(),
        port: 0,
    };
    let h = Harness::new(BrokerConfig::new(vec![catch_all()]).with_health(health));
    h.broker.start().await.unwrap();
    let addr = h.broker.health_addr().expect("health server bound");

    let (status, body) = http_get(addr, "/health").await;
    assert_eq!(status, 200);
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["routes"], 1);

    h.send(InboundMessage::new("x", "hi")).await;
    assert!(h.sink.wait_for_published(1, WAIT).await);
    let (status, body) = http_get(addr, "/metrics").await;
    assert_eq!(status, 200);
    assert_eq!(body["published"], 1);

    h.broker.stop().await.unwrap();
    assert_eq!(h.broker.health_addr(), None);
    assert!(TcpStream::connect(addr).await.is_err());
}
