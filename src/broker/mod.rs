//! Bridge Broker
//!
//! Owns the pipeline and its lifecycle: connects the sink and source,
//! spawns the worker pool, the ingest loop and the metrics sampler, and
//! tears everything down again in a fixed order on stop.
//!
//! ```text
//! Created --start--> Starting --> Started --stop--> Stopping --> Stopped
//!    |                     |                            ^              ^
//!    |                     +---- stop (aborts start) ---+              |
//!    +---------------------- stop / failed start ----------------------+
//! ```

mod sampler;

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::{ConfigError, HealthConfig, RouteSpec};
use crate::metrics::{HealthServer, Metrics, MetricsSnapshot};
use crate::pipeline::{IngestLoop, Worker, WorkerContext};
use crate::protocol::QoS;
use crate::queue::BoundedQueue;
use crate::remote::{InboundMessage, RemoteError, Sink, Source, SourceSubscription};
use crate::routing::Router;

pub const DEFAULT_WORKER_COUNT: usize = 4;
pub const DEFAULT_BUFFER_SIZE: usize = 1000;
pub const DEFAULT_PUBLISH_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_SAMPLE_INTERVAL: Duration = Duration::from_secs(1);
pub const DEFAULT_READY_TIMEOUT: Duration = Duration::from_secs(30);

/// Lower bound on the sampling period
const MIN_SAMPLE_INTERVAL: Duration = Duration::from_secs(1);

/// Pipeline settings
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub routes: Vec<RouteSpec>,
    pub worker_count: usize,
    pub buffer_size: usize,
    pub publish_qos: QoS,
    pub publish_retain: bool,
    pub publish_timeout: Duration,
    pub sample_interval: Duration,
    pub ready_timeout: Duration,
    pub health: HealthConfig,
}

impl BrokerConfig {
    pub fn new(routes: Vec<RouteSpec>) -> Self {
        Self {
            routes,
            worker_count: DEFAULT_WORKER_COUNT,
            buffer_size: DEFAULT_BUFFER_SIZE,
            publish_qos: QoS::AtLeastOnce,
            publish_retain: false,
            publish_timeout: DEFAULT_PUBLISH_TIMEOUT,
            sample_interval: DEFAULT_SAMPLE_INTERVAL,
            ready_timeout: DEFAULT_READY_TIMEOUT,
            health: HealthConfig::default(),
        }
    }

    pub fn with_workers(mut self, worker_count: usize) -> Self {
        self.worker_count = worker_count;
        self
    }

    pub fn with_buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size;
        self
    }

    pub fn with_publish_timeout(mut self, timeout: Duration) -> Self {
        self.publish_timeout = timeout;
        self
    }

    pub fn with_ready_timeout(mut self, timeout: Duration) -> Self {
        self.ready_timeout = timeout;
        self
    }

    pub fn with_health(mut self, health: HealthConfig) -> Self {
        self.health = health;
        self
    }

    /// Check the pipeline settings; routes are checked by [`Router::new`]
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.worker_count == 0 {
            return Err(ConfigError::Validation(
                "workerCount must be at least 1".to_string(),
            ));
        }
        if self.buffer_size == 0 {
            return Err(ConfigError::Validation(
                "bufferSize must be at least 1".to_string(),
            ));
        }
        if self.sample_interval < MIN_SAMPLE_INTERVAL {
            return Err(ConfigError::Validation(format!(
                "sampleInterval must be at least {:?}",
                MIN_SAMPLE_INTERVAL
            )));
        }
        Ok(())
    }
}

/// Lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerState {
    Created,
    /// Connecting peers and waiting for the source to become ready
    Starting,
    Started,
    Stopping,
    /// Terminal
    Stopped,
}

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("failed to connect {peer}: {source}")]
    Connection {
        peer: String,
        #[source]
        source: RemoteError,
    },

    #[error("cannot {operation} a broker in state {state:?}")]
    InvalidState {
        operation: &'static str,
        state: BrokerState,
    },

    #[error("source subscription not ready after {0:?}")]
    ReadyTimeout(Duration),

    #[error("start aborted by stop")]
    StartAborted,

    #[error("metrics registry error: {0}")]
    Metrics(#[from] prometheus::Error),

    #[error("health server error: {0}")]
    Health(#[from] std::io::Error),
}

/// Everything spawned by a successful start
struct Runtime {
    cancel: CancellationToken,
    queue: Arc<BoundedQueue<InboundMessage>>,
    tasks: Vec<JoinHandle<()>>,
    health_addr: Option<SocketAddr>,
}

pub struct Broker {
    config: BrokerConfig,
    router: Arc<Router>,
    metrics: Arc<Metrics>,
    source: Arc<dyn Source>,
    sink: Arc<dyn Sink>,
    state: watch::Sender<BrokerState>,
    /// Fired by `stop`; aborts a start in progress and ends every task
    cancel: CancellationToken,
    runtime: Mutex<Option<Runtime>>,
}

impl Broker {
    /// Validate the configuration and build the router. No I/O.
    pub fn new(
        config: BrokerConfig,
        source: Arc<dyn Source>,
        sink: Arc<dyn Sink>,
    ) -> Result<Self, BrokerError> {
        config.validate()?;
        let router = Arc::new(Router::new(config.routes.clone())?);
        let metrics = Arc::new(Metrics::new()?);
        let (state, _) = watch::channel(BrokerState::Created);

        Ok(Self {
            config,
            router,
            metrics,
            source,
            sink,
            state,
            cancel: CancellationToken::new(),
            runtime: Mutex::new(None),
        })
    }

    pub fn state(&self) -> BrokerState {
        *self.state.borrow()
    }

    /// Apply `next` atomically and return the state it was applied to
    fn transition(&self, next: impl FnOnce(BrokerState) -> Option<BrokerState>) -> BrokerState {
        let mut previous = BrokerState::Created;
        self.state.send_if_modified(|state| {
            previous = *state;
            match next(*state) {
                Some(to) => {
                    *state = to;
                    true
                }
                None => false,
            }
        });
        previous
    }

    fn set_state(&self, state: BrokerState) {
        self.state.send_replace(state);
    }

    async fn wait_stopped(&self) {
        let mut rx = self.state.subscribe();
        let _ = rx.wait_for(|state| *state == BrokerState::Stopped).await;
    }

    pub fn metrics(&self) -> Arc<Metrics> {
        self.metrics.clone()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn route_count(&self) -> usize {
        self.router.route_count()
    }

    /// Bound address of the health server, when enabled and running
    pub fn health_addr(&self) -> Option<SocketAddr> {
        self.runtime.lock().as_ref().and_then(|rt| rt.health_addr)
    }

    /// Spawned tasks that have not finished yet
    pub fn active_tasks(&self) -> usize {
        self.runtime
            .lock()
            .as_ref()
            .map(|rt| rt.tasks.iter().filter(|task| !task.is_finished()).count())
            .unwrap_or(0)
    }

    /// Connect both sides and start processing.
    ///
    /// Only valid from `Created`. On failure everything already started is
    /// torn down and the broker ends in `Stopped`. A concurrent `stop`
    /// aborts the start with [`BrokerError::StartAborted`].
    pub async fn start(&self) -> Result<(), BrokerError> {
        let previous = self.transition(|state| {
            (state == BrokerState::Created).then_some(BrokerState::Starting)
        });
        if previous != BrokerState::Created {
            return Err(BrokerError::InvalidState {
                operation: "start",
                state: previous,
            });
        }

        info!(
            "Starting bridge with {} routes, {} workers, buffer size {}",
            self.router.route_count(),
            self.config.worker_count,
            self.config.buffer_size
        );

        let runtime = match self.launch().await {
            Ok(runtime) => runtime,
            Err(e) => {
                if matches!(e, BrokerError::StartAborted) {
                    info!("Bridge start aborted");
                } else {
                    error!("Bridge failed to start: {}", e);
                }
                self.set_state(BrokerState::Stopped);
                return Err(e);
            }
        };

        *self.runtime.lock() = Some(runtime);
        let previous = self.transition(|state| {
            (state == BrokerState::Starting).then_some(BrokerState::Started)
        });
        if previous != BrokerState::Starting {
            // stop() arrived after the last cancellation point
            let runtime = self.runtime.lock().take();
            if let Some(runtime) = runtime {
                self.shutdown(runtime).await;
            }
            self.set_state(BrokerState::Stopped);
            info!("Bridge start aborted");
            return Err(BrokerError::StartAborted);
        }

        info!("Bridge started");
        Ok(())
    }

    /// Resolve `fut` unless `stop` fires first
    async fn unless_stopped<F: Future>(&self, fut: F) -> Result<F::Output, BrokerError> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(BrokerError::StartAborted),
            out = fut => Ok(out),
        }
    }

    async fn connect_peers(&self) -> Result<SourceSubscription, BrokerError> {
        if let Err(source) = self.unless_stopped(self.sink.connect()).await? {
            self.metrics.sink_error();
            return Err(BrokerError::Connection {
                peer: self.sink.name().to_string(),
                source,
            });
        }

        if let Err(source) = self.unless_stopped(self.source.connect()).await? {
            self.metrics.source_error();
            return Err(BrokerError::Connection {
                peer: self.source.name().to_string(),
                source,
            });
        }

        self.unless_stopped(self.source.subscribe())
            .await?
            .map_err(|source| {
                self.metrics.source_error();
                BrokerError::Connection {
                    peer: self.source.name().to_string(),
                    source,
                }
            })
    }

    async fn launch(&self) -> Result<Runtime, BrokerError> {
        let subscription = match self.connect_peers().await {
            Ok(subscription) => subscription,
            Err(e) => {
                self.disconnect_peers().await;
                return Err(e);
            }
        };

        self.metrics.set_connection_status(
            self.source.status().is_connected(),
            self.sink.status().is_connected(),
        );

        let cancel = self.cancel.clone();
        let queue = Arc::new(BoundedQueue::new(self.config.buffer_size));
        let mut tasks = Vec::with_capacity(self.config.worker_count + 3);

        let ctx = Arc::new(WorkerContext::new(
            self.router.clone(),
            self.sink.clone(),
            self.metrics.clone(),
            self.config.publish_qos,
            self.config.publish_retain,
            self.config.publish_timeout,
        ));
        for id in 0..self.config.worker_count {
            let worker = Worker::new(id, ctx.clone(), queue.clone());
            tasks.push(tokio::spawn(worker.run(cancel.clone())));
        }

        let ingest = IngestLoop::new(
            self.source.clone(),
            subscription.messages,
            queue.clone(),
            self.metrics.clone(),
        );
        tasks.push(tokio::spawn(ingest.run(cancel.clone())));

        tasks.push(tokio::spawn(sampler::run(
            self.metrics.clone(),
            queue.clone(),
            self.source.clone(),
            self.sink.clone(),
            self.config.sample_interval,
            cancel.clone(),
        )));

        let mut runtime = Runtime {
            cancel,
            queue,
            tasks,
            health_addr: None,
        };

        let ready = tokio::time::timeout(self.config.ready_timeout, subscription.ready);
        let failure = match self.unless_stopped(ready).await {
            Ok(Ok(Ok(()))) => None,
            Ok(Ok(Err(_))) => {
                self.metrics.source_error();
                Some(BrokerError::Connection {
                    peer: self.source.name().to_string(),
                    source: RemoteError::ConnectionLost(
                        "subscription closed before it became ready".to_string(),
                    ),
                })
            }
            Ok(Err(_)) => {
                self.metrics.source_error();
                Some(BrokerError::ReadyTimeout(self.config.ready_timeout))
            }
            Err(aborted) => Some(aborted),
        };
        if let Some(e) = failure {
            self.shutdown(runtime).await;
            return Err(e);
        }

        if self.config.health.enabled {
            let bound = HealthServer::bind(
                &self.config.health.bind_address(),
                self.metrics.clone(),
                self.router.route_count(),
            )
            .await;
            match bound {
                Ok(server) => {
                    runtime.health_addr = server.local_addr().ok();
                    runtime
                        .tasks
                        .push(tokio::spawn(server.run(runtime.cancel.clone())));
                }
                Err(e) => {
                    self.shutdown(runtime).await;
                    return Err(BrokerError::Health(e));
                }
            }
        }

        Ok(runtime)
    }

    /// Stop processing and disconnect.
    ///
    /// Idempotent: only the first call on a started broker does the work
    /// and every other call waits until the broker is `Stopped`. Stopping
    /// during `start` aborts it and waits for its teardown. Stopping a
    /// broker that never started moves it straight to `Stopped`.
    pub async fn stop(&self) -> Result<(), BrokerError> {
        let previous = self.transition(|state| match state {
            BrokerState::Created => Some(BrokerState::Stopped),
            BrokerState::Starting | BrokerState::Started => Some(BrokerState::Stopping),
            BrokerState::Stopping | BrokerState::Stopped => None,
        });
        match previous {
            BrokerState::Created | BrokerState::Stopped => return Ok(()),
            BrokerState::Starting => {
                info!("Stop requested while starting");
                self.cancel.cancel();
                self.wait_stopped().await;
                return Ok(());
            }
            BrokerState::Stopping => {
                self.wait_stopped().await;
                return Ok(());
            }
            BrokerState::Started => {}
        }

        info!("Stopping bridge");
        let runtime = self.runtime.lock().take();
        if let Some(runtime) = runtime {
            self.shutdown(runtime).await;
        }
        self.set_state(BrokerState::Stopped);

        let snapshot = self.metrics.snapshot();
        info!(
            received = snapshot.received,
            published = snapshot.published,
            dropped = snapshot.dropped,
            failed = snapshot.failed,
            "Bridge stopped"
        );
        Ok(())
    }

    /// Cancel, close the queue, join every task, then disconnect
    async fn shutdown(&self, runtime: Runtime) {
        runtime.cancel.cancel();
        runtime.queue.close();

        for task in runtime.tasks {
            if let Err(e) = task.await {
                warn!("Bridge task ended abnormally: {}", e);
            }
        }

        self.disconnect_peers().await;
    }

    async fn disconnect_peers(&self) {
        if let Err(e) = self.sink.disconnect().await {
            warn!("Sink '{}': Disconnect failed: {}", self.sink.name(), e);
        }
        if let Err(e) = self.source.disconnect().await {
            warn!("Source '{}': Disconnect failed: {}", self.source.name(), e);
        }
        self.metrics.set_connection_status(false, false);
    }

    /// Start, wait for Ctrl+C or SIGTERM, then stop
    pub async fn run_until_shutdown(&self) -> Result<(), BrokerError> {
        self.start().await?;
        shutdown_signal().await;
        info!("Shutdown signal received");
        self.stop().await
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
