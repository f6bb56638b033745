//! HTTP surface for the health endpoints.
//!
//! - `GET /health`  → JSON report; 200 when healthy or degraded, 503 when unhealthy
//! - `GET /metrics` → JSON snapshot
//! - `GET /ready`   → 200 `ready` / 503 `not ready`

use crate::error::HealthServerError;
use crate::health::HealthCheck;
use bytes::Bytes;
use http_body_util::Full;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use serde::Serialize;
use std::convert::Infallible;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

pub const HEALTH_PATH: &str = "/health";
pub const METRICS_PATH: &str = "/metrics";
pub const READY_PATH: &str = "/ready";

/// How long a client may take to send complete request headers.
pub const DEFAULT_HEADER_READ_TIMEOUT: Duration = Duration::from_secs(5);

/// Routes one request to the matching endpoint.
pub fn route(method: &Method, path: &str, check: &HealthCheck) -> Response<Full<Bytes>> {
    if !matches!(path, HEALTH_PATH | METRICS_PATH | READY_PATH) {
        return text_response(StatusCode::NOT_FOUND, "not found");
    }
    if method != Method::GET {
        return text_response(StatusCode::METHOD_NOT_ALLOWED, "method not allowed");
    }

    match path {
        HEALTH_PATH => {
            let report = check.health();
            let status = if report.status.is_serving() {
                StatusCode::OK
            } else {
                StatusCode::SERVICE_UNAVAILABLE
            };
            json_response(status, &report)
        }
        METRICS_PATH => json_response(StatusCode::OK, &check.metrics()),
        _ => {
            if check.is_ready() {
                text_response(StatusCode::OK, "ready")
            } else {
                text_response(StatusCode::SERVICE_UNAVAILABLE, "not ready")
            }
        }
    }
}

fn json_response<T: Serialize>(status: StatusCode, body: &T) -> Response<Full<Bytes>> {
    match serde_json::to_vec(body) {
        Ok(bytes) => {
            let mut response = Response::new(Full::new(Bytes::from(bytes)));
            *response.status_mut() = status;
            response
                .headers_mut()
                .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
            response
        }
        Err(e) => {
            error!("Failed to serialize health response: {e}");
            text_response(StatusCode::INTERNAL_SERVER_ERROR, "serialization error")
        }
    }
}

fn text_response(status: StatusCode, body: &'static str) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from_static(body.as_bytes())));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
    response
}

/// A bound health endpoint. Readiness is reported from bind until `serve` returns.
pub struct HealthServer {
    listener: TcpListener,
    check: Arc<HealthCheck>,
    header_read_timeout: Duration,
}

impl HealthServer {
    pub async fn bind(addr: SocketAddr, check: Arc<HealthCheck>) -> Result<Self, HealthServerError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| HealthServerError::Bind { addr, source })?;
        check.mark_ready();
        info!("Health endpoint listening on {}", listener.local_addr()?);
        Ok(Self {
            listener,
            check,
            header_read_timeout: DEFAULT_HEADER_READ_TIMEOUT,
        })
    }

    /// Connections that do not deliver request headers in time are closed,
    /// including idle keep-alive connections.
    pub fn with_header_read_timeout(mut self, timeout: Duration) -> Self {
        self.header_read_timeout = timeout;
        self
    }

    pub fn local_addr(&self) -> Result<SocketAddr, HealthServerError> {
        Ok(self.listener.local_addr()?)
    }

    /// Serves requests until `cancel` fires.
    pub async fn serve(self, cancel: CancellationToken) -> Result<(), HealthServerError> {
        let mut server = hyper::server::conn::http1::Builder::new();
        server
            .timer(hyper_util::rt::TokioTimer::new())
            .header_read_timeout(self.header_read_timeout);
        let mut connections = JoinSet::new();
        let check = self.check;

        let result = loop {
            let conn = tokio::select! {
                () = cancel.cancelled() => break Ok(()),
                accepted = self.listener.accept() => match accepted {
                    Err(e)
                        if matches!(
                            e.kind(),
                            io::ErrorKind::ConnectionAborted
                                | io::ErrorKind::ConnectionReset
                                | io::ErrorKind::ConnectionRefused
                        ) =>
                    {
                        continue;
                    }
                    Err(e) => {
                        error!("Health server error: {e}");
                        break Err(e.into());
                    }
                    Ok((conn, _)) => conn,
                },
                Some(finished) = connections.join_next(), if !connections.is_empty() => {
                    if let Err(e) = finished {
                        if e.is_panic() {
                            error!("Health connection handler panicked: {:?}", e);
                        }
                    }
                    continue;
                }
            };

            let io = hyper_util::rt::TokioIo::new(conn);
            let server = server.clone();
            let check = Arc::clone(&check);
            connections.spawn(async move {
                let service = service_fn(move |req: Request<hyper::body::Incoming>| {
                    let response = route(req.method(), req.uri().path(), &check);
                    async move { Ok::<_, Infallible>(response) }
                });
                if let Err(e) = server.serve_connection(io, service).await {
                    debug!("Health connection error: {e}");
                }
            });
        };

        check.mark_not_ready();
        connections.shutdown().await;
        info!("Health endpoint stopped");
        result
    }
}
