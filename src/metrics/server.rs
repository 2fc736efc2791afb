//! HTTP server for health and metrics endpoints

use std::convert::Infallible;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use prometheus::{Encoder, TextEncoder};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::{Metrics, MetricsSnapshot};

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct HealthResponse {
    status: &'static str,
    source_connected: bool,
    sink_connected: bool,
    routes: usize,
    uptime_seconds: u64,
}

#[derive(Serialize)]
struct MetricsResponse {
    status: &'static str,
    routes: usize,
    #[serde(flatten)]
    metrics: MetricsSnapshot,
}

/// HTTP server exposing `/health`, `/metrics` and `/metrics/prometheus`
pub struct HealthServer {
    listener: TcpListener,
    metrics: Arc<Metrics>,
    route_count: usize,
}

impl HealthServer {
    /// Bind the listener; accepts `host:port` including host names
    pub async fn bind(addr: &str, metrics: Arc<Metrics>, route_count: usize) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            metrics,
            route_count,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Serve until cancelled
    pub async fn run(self, cancel: CancellationToken) {
        if let Ok(addr) = self.listener.local_addr() {
            info!("Health server listening on http://{}/health", addr);
        }

        loop {
            let stream = tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, _)) => stream,
                    Err(e) => {
                        error!("Health server accept error: {}", e);
                        continue;
                    }
                },
            };

            let io = TokioIo::new(stream);
            let metrics = self.metrics.clone();
            let route_count = self.route_count;
            let cancel = cancel.clone();

            tokio::spawn(async move {
                let service = service_fn(move |req| {
                    let metrics = metrics.clone();
                    async move { handle_request(req, &metrics, route_count) }
                });

                let conn = http1::Builder::new().serve_connection(io, service);
                tokio::select! {
                    _ = cancel.cancelled() => {}
                    result = conn => {
                        if let Err(err) = result {
                            debug!("Error serving health connection: {:?}", err);
                        }
                    }
                }
            });
        }

        debug!("Health server stopped");
    }
}

fn status_label(healthy: bool) -> &'static str {
    if healthy {
        "healthy"
    } else {
        "unhealthy"
    }
}

fn handle_request(
    req: Request<hyper::body::Incoming>,
    metrics: &Metrics,
    route_count: usize,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let response = match req.uri().path() {
        "/health" => {
            let snapshot = metrics.snapshot();
            let healthy = snapshot.source_connected && snapshot.sink_connected;
            let body = HealthResponse {
                status: status_label(healthy),
                source_connected: snapshot.source_connected,
                sink_connected: snapshot.sink_connected,
                routes: route_count,
                uptime_seconds: snapshot.uptime_seconds,
            };
            let status = if healthy {
                StatusCode::OK
            } else {
                StatusCode::SERVICE_UNAVAILABLE
            };
            json_response(status, &body)
        }
        "/metrics" => {
            let snapshot = metrics.snapshot();
            let healthy = snapshot.source_connected && snapshot.sink_connected;
            let body = MetricsResponse {
                status: status_label(healthy),
                routes: route_count,
                metrics: snapshot,
            };
            json_response(StatusCode::OK, &body)
        }
        "/metrics/prometheus" => {
            let encoder = TextEncoder::new();
            let mut buffer = Vec::new();
            match encoder.encode(&metrics.registry().gather(), &mut buffer) {
                Ok(()) => {
                    let mut resp = Response::new(Full::new(Bytes::from(buffer)));
                    resp.headers_mut()
                        .insert(CONTENT_TYPE, HeaderValue::from_static(prometheus::TEXT_FORMAT));
                    resp
                }
                Err(e) => {
                    error!("Failed to encode metrics: {}", e);
                    text_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to encode metrics")
                }
            }
        }
        _ => text_response(StatusCode::NOT_FOUND, "Not Found"),
    };

    Ok(response)
}

fn json_response<T: Serialize>(status: StatusCode, body: &T) -> Response<Full<Bytes>> {
    match serde_json::to_vec(body) {
        Ok(encoded) => {
            let mut resp = Response::new(Full::new(Bytes::from(encoded)));
            *resp.status_mut() = status;
            resp.headers_mut()
                .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
            resp
        }
        Err(e) => {
            error!("Failed to encode response: {}", e);
            text_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to encode response")
        }
    }
}

fn text_response(status: StatusCode, body: &'static str) -> Response<Full<Bytes>> {
    let mut resp = Response::new(Full::new(Bytes::from_static(body.as_bytes())));
    *resp.status_mut() = status;
    resp
}
