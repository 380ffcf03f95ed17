use crate::diagnostics::Diagnostics;
use crate::error::{json_error_response, ProxyErrorCode};
use crate::lifecycle::LifecycleError;
use crate::pool::ProxyBody;
use crate::router::Router;
use crate::tenant::TenantId;
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::header::{HeaderMap, AUTHORIZATION};
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Version information for the gateway
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");

const REMOVED_HOOK_PREFIX: &str = "/instances/";
const REMOVED_HOOK_SUFFIX: &str = "/removed";

/// The gateway's single listener: operator endpoints plus tenant traffic
pub struct ProxyServer {
    bind_addr: SocketAddr,
    router: Arc<Router>,
    diagnostics: Arc<Diagnostics>,
    stats_token: Option<Arc<String>>,
    shutdown_rx: watch::Receiver<bool>,
}

impl ProxyServer {
    pub fn new(
        bind_addr: SocketAddr,
        router: Arc<Router>,
        diagnostics: Arc<Diagnostics>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            bind_addr,
            router,
            diagnostics,
            stats_token: None,
            shutdown_rx,
        }
    }

    /// Require `Authorization: Bearer <token>` on /stats and the removal hook
    pub fn with_stats_token(mut self, token: Option<String>) -> Self {
        self.stats_token = token.filter(|t| !t.is_empty()).map(Arc::new);
        self
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        info!(addr = %self.bind_addr, "Gateway listening (HTTP/1.1 and HTTP/2)");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let router = Arc::clone(&self.router);
                            let diagnostics = Arc::clone(&self.diagnostics);
                            let stats_token = self.stats_token.clone();

                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, addr, router, diagnostics, stats_token).await {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Gateway shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn handle_connection<S>(
    stream: S,
    addr: SocketAddr,
    router: Arc<Router>,
    diagnostics: Arc<Diagnostics>,
    stats_token: Option<Arc<String>>,
) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let router = Arc::clone(&router);
        let diagnostics = Arc::clone(&diagnostics);
        let stats_token = stats_token.clone();
        async move { handle_request(req, router, diagnostics, stats_token, addr).await }
    });

    // HTTP/1.1 connections can still carry upgrades; HTTP/2 arrives as h2c
    AutoBuilder::new(TokioExecutor::new())
        .http1()
        .preserve_header_case(true)
        .http2()
        .max_concurrent_streams(250)
        .serve_connection_with_upgrades(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

    Ok(())
}

async fn handle_request(
    req: Request<Incoming>,
    router: Arc<Router>,
    diagnostics: Arc<Diagnostics>,
    stats_token: Option<Arc<String>>,
    client_addr: SocketAddr,
) -> Result<Response<ProxyBody>, hyper::Error> {
    let path = req.uri().path();

    let response = match (req.method(), path) {
        // Health check (no auth required)
        (&Method::GET, "/health") => {
            let report = diagnostics.health().await;
            let status = if report.is_healthy() {
                StatusCode::OK
            } else {
                StatusCode::SERVICE_UNAVAILABLE
            };
            json_response(status, &report)
        }

        (&Method::GET, "/stats") => {
            if !check_auth(req.headers(), stats_token.as_deref()) {
                warn!(path, "Unauthorized stats request");
                json_error_response(ProxyErrorCode::Forbidden, "Operator token required")
            } else {
                json_response(StatusCode::OK, &diagnostics.stats())
            }
        }

        (&Method::POST, path) if path.starts_with(REMOVED_HOOK_PREFIX) && path.ends_with(REMOVED_HOOK_SUFFIX) => {
            if !check_auth(req.headers(), stats_token.as_deref()) {
                warn!(path, "Unauthorized removal notification");
                json_error_response(ProxyErrorCode::Forbidden, "Operator token required")
            } else {
                let id = path
                    .trim_start_matches(REMOVED_HOOK_PREFIX)
                    .trim_end_matches(REMOVED_HOOK_SUFFIX);
                handle_removed(&router, id).await
            }
        }

        _ => router.handle(req, client_addr).await,
    };

    Ok(response)
}

/// Reset a tenant whose stopped container was reclaimed out of band
async fn handle_removed(router: &Router, id: &str) -> Response<ProxyBody> {
    let Some(tenant) = TenantId::parse(id) else {
        return json_response(
            StatusCode::BAD_REQUEST,
            &serde_json::json!({ "error": "invalid tenant id" }),
        );
    };

    match router.lifecycle().notify_removed(&tenant).await {
        Ok(released_port) => {
            router.sessions().evict(&tenant);
            json_response(
                StatusCode::OK,
                &serde_json::json!({
                    "tenant_id": tenant.as_str(),
                    "state": "absent",
                    "released_port": released_port,
                }),
            )
        }
        Err(LifecycleError::InvalidState(msg)) => {
            json_response(StatusCode::CONFLICT, &serde_json::json!({ "error": msg }))
        }
        Err(e) => {
            error!(tenant = %tenant, error = %e, "Failed to reset removed instance");
            json_error_response(ProxyErrorCode::InternalError, "Failed to reset instance")
        }
    }
}

/// With no token configured, operator auth is left to the front-end proxy
fn check_auth(headers: &HeaderMap, expected_token: Option<&String>) -> bool {
    let Some(expected) = expected_token else {
        return true;
    };
    headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|auth| auth.strip_prefix("Bearer "))
        .map(|token| constant_time_eq(token, expected))
        .unwrap_or(false)
}

/// Compare without an early exit on the first differing byte
fn constant_time_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.as_bytes()
        .iter()
        .zip(b.as_bytes())
        .fold(0u8, |acc, (x, y)| acc | (x ^ y))
        == 0
}

fn json_response<T: serde::Serialize>(status: StatusCode, value: &T) -> Response<ProxyBody> {
    let body = serde_json::to_string(value).unwrap_or_else(|_| "{}".to_string());
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .header("server", format!("{}/{}", PKG_NAME, VERSION))
        .body(Full::new(Bytes::from(body)).map_err(|never| match never {}).boxed())
        .expect("valid response with StatusCode enum and static header")
}
