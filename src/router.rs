//! Request router
//!
//! Serves one tenant request end to end: validate the credential, make sure
//! the tenant's instance runs, attach the pooled backend session, forward,
//! capture any new session token and relay the streamed response.

use crate::config::{Config, ProxyConfig, SessionConfig};
use crate::error::GatewayError;
use crate::lifecycle::{LifecycleError, LifecycleManager};
use crate::pool::{ConnectionPool, ProxyBody};
use crate::runtime::RuntimeError;
use crate::session::{attach_session, extract_session, SessionPool};
use crate::tenant::TenantId;
use crate::validator::{CredentialValidator, ValidationError};
use http::request::Parts;
use http_body_util::{BodyExt, Empty, Full, Limited};
use hyper::body::{Bytes, Incoming};
use hyper::header::{HeaderMap, HeaderName, HeaderValue};
use hyper::upgrade::Upgraded;
use hyper::{Request, Response, StatusCode, Uri};
use hyper_util::rt::TokioIo;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Header name for request ID
const X_REQUEST_ID: &str = "x-request-id";
/// Header name for forwarded-for
const X_FORWARDED_FOR: &str = "x-forwarded-for";
/// Header name for forwarded proto
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";

/// How often a relayed upgrade connection counts as instance activity
const UPGRADE_TOUCH_INTERVAL: Duration = Duration::from_secs(30);

pub struct Router {
    validator: Arc<dyn CredentialValidator>,
    lifecycle: Arc<LifecycleManager>,
    sessions: Arc<SessionPool>,
    pool: Arc<ConnectionPool>,
    credential_header: HeaderName,
    session_header: HeaderName,
    session_config: SessionConfig,
    proxy_config: ProxyConfig,
}

/// Request body as it will be sent on the first hop
enum OutboundBody {
    /// Held in memory so the hop can be repeated
    Replayable(Bytes),
    /// Streamed straight through; cannot be repeated
    Streaming(Incoming),
}

/// Outcome of a failed hop
enum HopError {
    /// Nothing reached the instance; it has been marked as crashed
    Refused(String),
    Failed(GatewayError),
}

impl HopError {
    fn into_gateway_error(self) -> GatewayError {
        match self {
            HopError::Refused(reason) => {
                GatewayError::InstanceUnavailable(format!("instance is not accepting connections: {}", reason))
            }
            HopError::Failed(e) => e,
        }
    }
}

impl Router {
    pub fn new(
        config: &Config,
        validator: Arc<dyn CredentialValidator>,
        lifecycle: Arc<LifecycleManager>,
        sessions: Arc<SessionPool>,
        pool: Arc<ConnectionPool>,
    ) -> anyhow::Result<Self> {
        let credential_header = HeaderName::from_bytes(config.auth.credential_header.to_lowercase().as_bytes())
            .map_err(|e| anyhow::anyhow!("Invalid credential header: {}", e))?;
        let session_header = HeaderName::from_bytes(config.sessions.header.to_lowercase().as_bytes())
            .map_err(|e| anyhow::anyhow!("Invalid session header: {}", e))?;

        Ok(Self {
            validator,
            lifecycle,
            sessions,
            pool,
            credential_header,
            session_header,
            session_config: config.sessions.clone(),
            proxy_config: config.proxy.clone(),
        })
    }

    pub fn sessions(&self) -> &Arc<SessionPool> {
        &self.sessions
    }

    pub fn lifecycle(&self) -> &Arc<LifecycleManager> {
        &self.lifecycle
    }

    /// Serve a tenant request. Every failure becomes a JSON error response.
    pub async fn handle(&self, req: Request<Incoming>, client_addr: SocketAddr) -> Response<ProxyBody> {
        let request_id = req
            .headers()
            .get(X_REQUEST_ID)
            .and_then(|v| v.to_str().ok())
            .map(String::from)
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        match self.route(req, client_addr, &request_id).await {
            Ok(response) => response,
            Err(e) => {
                match &e {
                    GatewayError::MissingCredential | GatewayError::Unauthorized => {
                        debug!(request_id, error = %e, "Request rejected")
                    }
                    GatewayError::SessionRejected | GatewayError::RequestTimeout(_) => {
                        warn!(request_id, error = %e, "Request failed")
                    }
                    _ => error!(request_id, error = %e, "Request failed"),
                }
                e.into_response()
            }
        }
    }

    async fn route(
        &self,
        mut req: Request<Incoming>,
        client_addr: SocketAddr,
        request_id: &str,
    ) -> Result<Response<ProxyBody>, GatewayError> {
        let credential = req
            .headers()
            .get(&self.credential_header)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(String::from)
            .ok_or(GatewayError::MissingCredential)?;

        let tenant = self
            .validator
            .validate(&credential)
            .await
            .map_err(|e| match e {
                ValidationError::Unauthorized(_) => GatewayError::Unauthorized,
                ValidationError::Unavailable(msg) => GatewayError::UpstreamUnreachable(msg),
            })?;

        let port = self.ensure_port(&tenant, &credential).await?;

        debug!(
            tenant = %tenant,
            port,
            method = %req.method(),
            uri = %req.uri(),
            request_id,
            "Incoming request"
        );

        self.prepare_request(&mut req, client_addr, request_id);

        if is_upgrade_request(&req) {
            return self
                .handle_upgrade(req, tenant, &credential, port, request_id.to_string())
                .await;
        }

        let token = self.sessions.get(&tenant);
        let (parts, body) = req.into_parts();

        let body = match replayable_len(&parts.headers) {
            Some(len) if len <= self.session_config.max_replay_body_bytes => {
                let collected = Limited::new(body, self.session_config.max_replay_body_bytes)
                    .collect()
                    .await
                    .map_err(|e| GatewayError::Internal(format!("failed to read request body: {}", e)))?;
                OutboundBody::Replayable(collected.to_bytes())
            }
            _ => OutboundBody::Streaming(body),
        };

        self.finish(&tenant, &credential, &parts, body, port, token).await
    }

    /// Start or adopt the tenant's instance and return its port
    async fn ensure_port(&self, tenant: &TenantId, credential: &str) -> Result<u16, GatewayError> {
        self.lifecycle
            .ensure_running(tenant, credential)
            .await
            .map_err(|e| match e {
                LifecycleError::Runtime(RuntimeError::Unreachable(msg)) => GatewayError::UpstreamUnreachable(msg),
                other => GatewayError::InstanceUnavailable(other.to_string()),
            })
    }

    /// Forward the request, recovering once from an instance that went away
    /// and once from a rejected session, then update bookkeeping from the
    /// response that gets relayed
    async fn finish(
        &self,
        tenant: &TenantId,
        credential: &str,
        parts: &Parts,
        body: OutboundBody,
        port: u16,
        token: Option<String>,
    ) -> Result<Response<ProxyBody>, GatewayError> {
        let (first, replay) = match body {
            OutboundBody::Replayable(bytes) => (full(bytes.clone()), Some(bytes)),
            OutboundBody::Streaming(incoming) => (incoming.boxed(), None),
        };
        let hop = self.build_hop(parts, first, token.as_deref());

        let (mut response, port) = match self.forward(tenant, hop, port).await {
            Ok(response) => (response, port),
            Err(HopError::Refused(reason)) => {
                let Some(bytes) = replay.clone() else {
                    return Err(GatewayError::InstanceUnavailable(format!(
                        "instance stopped while the request was streaming: {}",
                        reason
                    )));
                };
                info!(tenant = %tenant, port, "Instance went away, restarting before retry");
                let port = self.ensure_port(tenant, credential).await?;
                let hop = self.build_hop(parts, full(bytes), token.as_deref());
                let response = self
                    .forward(tenant, hop, port)
                    .await
                    .map_err(HopError::into_gateway_error)?;
                (response, port)
            }
            Err(HopError::Failed(e)) => return Err(e),
        };

        if let Some(previous) = token.as_deref().filter(|_| self.is_session_rejection(response.status())) {
            self.sessions.evict(tenant);
            let Some(bytes) = replay else {
                warn!(tenant = %tenant, "Backend rejected session and the request cannot be replayed");
                return Err(GatewayError::SessionRejected);
            };

            info!(tenant = %tenant, status = %response.status(), "Backend rejected session, retrying without it");
            self.pool.stats().record_session_retry();
            drop(response);

            let retry = self.build_hop(parts, full(bytes), None);
            response = self
                .forward(tenant, retry, port)
                .await
                .map_err(HopError::into_gateway_error)?;

            // Same answer without a session: the route itself said so
            if self.is_session_rejection(response.status())
                && extract_session(response.headers(), &self.session_header).is_none()
            {
                debug!(tenant = %tenant, status = %response.status(), "Status came from the route, keeping session");
                self.sessions.restore(tenant, previous);
            }
        }

        match extract_session(response.headers(), &self.session_header) {
            Some(new_token) => self.sessions.put(tenant, &new_token),
            None => self.sessions.touch(tenant),
        }
        self.lifecycle.registry().touch(tenant);

        response.headers_mut().remove(&self.session_header);
        Ok(self.track_stream(tenant, response))
    }

    async fn forward(
        &self,
        tenant: &TenantId,
        hop: Request<ProxyBody>,
        port: u16,
    ) -> Result<Response<ProxyBody>, HopError> {
        let request_timeout = self.proxy_config.request_timeout();

        match tokio::time::timeout(request_timeout, self.pool.send_request(hop, port)).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(e)) if e.is_connect() => {
                self.lifecycle.mark_crashed(tenant, port).await;
                Err(HopError::Refused(e.to_string()))
            }
            Ok(Err(e)) => Err(HopError::Failed(GatewayError::ConnectionFailed(e.to_string()))),
            Err(_) => {
                warn!(
                    tenant = %tenant,
                    port,
                    timeout_secs = request_timeout.as_secs(),
                    "Request timed out"
                );
                Err(HopError::Failed(GatewayError::RequestTimeout(request_timeout.as_secs())))
            }
        }
    }

    fn build_hop(&self, parts: &Parts, body: ProxyBody, token: Option<&str>) -> Request<ProxyBody> {
        let mut hop = Request::new(body);
        *hop.method_mut() = parts.method.clone();
        *hop.uri_mut() = parts.uri.clone();
        *hop.headers_mut() = parts.headers.clone();
        attach_session(hop, &self.session_header, token)
    }

    /// Every relayed chunk of a long-lived response counts as activity, and
    /// the instance is not idle-stopped while the body is still open
    fn track_stream(&self, tenant: &TenantId, response: Response<ProxyBody>) -> Response<ProxyBody> {
        let Some(slot) = self.lifecycle.registry().existing_slot(tenant) else {
            return response;
        };
        let stream = slot.open_stream();
        response.map(|body| {
            body.map_frame(move |frame| {
                stream.touch();
                frame
            })
            .boxed()
        })
    }

    fn is_session_rejection(&self, status: StatusCode) -> bool {
        self.session_config.rejected_statuses.contains(&status.as_u16())
    }

    /// Rewrite the caller's request into the form the instance expects
    fn prepare_request<B>(&self, req: &mut Request<B>, client_addr: SocketAddr, request_id: &str) {
        if let Some(root) = self.proxy_config.root_path.as_deref() {
            if let Some(uri) = apply_root_alias(req.uri(), root) {
                *req.uri_mut() = uri;
            }
        }

        let headers = req.headers_mut();
        headers.remove(&self.credential_header);
        headers.remove(&self.session_header);

        if let Ok(value) = HeaderValue::from_str(request_id) {
            headers.insert(X_REQUEST_ID, value);
        }

        // Append to the chain started by the front-end proxy
        let client_ip = client_addr.ip().to_string();
        let forwarded_for = match headers.get(X_FORWARDED_FOR).and_then(|v| v.to_str().ok()) {
            Some(existing) => format!("{}, {}", existing, client_ip),
            None => client_ip,
        };
        if let Ok(value) = HeaderValue::from_str(&forwarded_for) {
            headers.insert(X_FORWARDED_FOR, value);
        }

        if !headers.contains_key(X_FORWARDED_PROTO) {
            headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static("http"));
        }

        if !headers.contains_key(hyper::header::ACCEPT) {
            if let Some(accept) = self
                .proxy_config
                .default_accept
                .as_deref()
                .and_then(|a| HeaderValue::from_str(a).ok())
            {
                headers.insert(hyper::header::ACCEPT, accept);
            }
        }
    }

    /// Relay an upgrade handshake over a dedicated instance connection, then
    /// splice the two upgraded streams together
    async fn handle_upgrade(
        &self,
        mut req: Request<Incoming>,
        tenant: TenantId,
        credential: &str,
        port: u16,
        request_id: String,
    ) -> Result<Response<ProxyBody>, GatewayError> {
        let upgrade_type = get_upgrade_type(&req).unwrap_or_else(|| "unknown".to_string());
        debug!(tenant = %tenant, request_id, upgrade_type, "Handling upgrade request");

        let client_upgrade = hyper::upgrade::on(&mut req);

        let (stream, port) = match connect_instance(port).await {
            Ok(stream) => (stream, port),
            Err(e) if e.kind() == std::io::ErrorKind::ConnectionRefused => {
                self.lifecycle.mark_crashed(&tenant, port).await;
                info!(tenant = %tenant, port, "Instance went away, restarting before upgrade");
                let port = self.ensure_port(&tenant, credential).await?;
                let stream = connect_instance(port).await.map_err(|e| {
                    GatewayError::InstanceUnavailable(format!("upgrade connect to port {}: {}", port, e))
                })?;
                (stream, port)
            }
            Err(e) => {
                return Err(GatewayError::ConnectionFailed(format!(
                    "upgrade connect to port {}: {}",
                    port, e
                )))
            }
        };

        let token = self.sessions.get(&tenant);
        let (parts, body) = req.into_parts();
        let mut hop = self.build_hop(&parts, body.boxed(), token.as_deref());
        if let Some(path) = parts.uri.path_and_query() {
            if let Ok(uri) = Uri::builder().path_and_query(path.as_str()).build() {
                *hop.uri_mut() = uri;
            }
        }
        if let Ok(host) = HeaderValue::from_str(&format!("127.0.0.1:{}", port)) {
            hop.headers_mut().insert(hyper::header::HOST, host);
        }

        let request_timeout = self.proxy_config.request_timeout();
        let (response, backend_upgrade) = tokio::time::timeout(request_timeout, send_upgrade(stream, hop))
            .await
            .map_err(|_| GatewayError::RequestTimeout(request_timeout.as_secs()))?
            .map_err(|e| GatewayError::ConnectionFailed(format!("upgrade exchange with instance: {}", e)))?;

        let (mut head, body) = response.into_parts();
        match extract_session(&head.headers, &self.session_header) {
            Some(issued) => self.sessions.put(&tenant, &issued),
            None => self.sessions.touch(&tenant),
        }
        head.headers.remove(&self.session_header);
        self.lifecycle.registry().touch(&tenant);

        let Some(backend_upgrade) = backend_upgrade else {
            warn!(tenant = %tenant, status = %head.status, "Instance rejected upgrade request");
            return Ok(self.track_stream(&tenant, Response::from_parts(head, body.boxed())));
        };

        info!(tenant = %tenant, request_id, upgrade_type, "Upgrade successful");
        head.headers.remove(hyper::header::CONTENT_LENGTH);
        head.headers.remove(hyper::header::TRANSFER_ENCODING);

        let stream = self
            .lifecycle
            .registry()
            .existing_slot(&tenant)
            .map(|slot| slot.open_stream());
        tokio::spawn(async move {
            match client_upgrade.await {
                Ok(client) => {
                    forward_bidirectional(client, backend_upgrade, &tenant, &request_id, || {
                        if let Some(stream) = &stream {
                            stream.touch();
                        }
                    })
                    .await;
                }
                Err(e) => {
                    error!(tenant = %tenant, error = %e, "Failed to upgrade client connection");
                }
            }
        });

        Ok(Response::from_parts(head, empty()))
    }
}

fn full(bytes: Bytes) -> ProxyBody {
    Full::new(bytes).map_err(|never| match never {}).boxed()
}

fn empty() -> ProxyBody {
    Empty::<Bytes>::new().map_err(|never| match never {}).boxed()
}

/// Length of a request body that can be held for replay, if known up front.
/// A request with neither Content-Length nor Transfer-Encoding has no body.
fn replayable_len(headers: &HeaderMap) -> Option<usize> {
    if let Some(length) = headers.get(hyper::header::CONTENT_LENGTH) {
        return length.to_str().ok()?.parse().ok();
    }
    if headers.contains_key(hyper::header::TRANSFER_ENCODING) {
        return None;
    }
    Some(0)
}

/// Map the bare root onto the backend's endpoint path, keeping the query
fn apply_root_alias(uri: &Uri, root: &str) -> Option<Uri> {
    if uri.path() != "/" || root.is_empty() || root == "/" {
        return None;
    }
    let path_and_query = match uri.query() {
        Some(query) => format!("{}?{}", root, query),
        None => root.to_string(),
    };
    path_and_query.parse().ok()
}

/// Check if a request is an upgrade request
fn is_upgrade_request<B>(req: &Request<B>) -> bool {
    let has_upgrade_connection = req
        .headers()
        .get(hyper::header::CONNECTION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_lowercase().contains("upgrade"))
        .unwrap_or(false);

    has_upgrade_connection && req.headers().contains_key(hyper::header::UPGRADE)
}

fn get_upgrade_type<B>(req: &Request<B>) -> Option<String> {
    req.headers()
        .get(hyper::header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_lowercase())
}

async fn connect_instance(port: u16) -> std::io::Result<TcpStream> {
    TcpStream::connect(("127.0.0.1", port)).await
}

/// Send an upgrade request on its own HTTP/1 connection. On 101 the
/// instance side is taken over before returning, including any bytes the
/// instance sent right behind the response head.
async fn send_upgrade(
    stream: TcpStream,
    hop: Request<ProxyBody>,
) -> Result<(Response<Incoming>, Option<Upgraded>), hyper::Error> {
    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream)).await?;
    tokio::spawn(async move {
        if let Err(e) = conn.with_upgrades().await {
            debug!(error = %e, "Instance upgrade connection closed with error");
        }
    });

    let mut response = sender.send_request(hop).await?;
    if response.status() != StatusCode::SWITCHING_PROTOCOLS {
        return Ok((response, None));
    }
    let upgraded = hyper::upgrade::on(&mut response).await?;
    Ok((response, Some(upgraded)))
}

/// Splice client and instance connections until either side closes,
/// reporting activity periodically
async fn forward_bidirectional<F: Fn()>(
    client: Upgraded,
    backend: Upgraded,
    tenant: &TenantId,
    request_id: &str,
    on_activity: F,
) {
    let mut client_io = TokioIo::new(client);
    let mut backend_io = TokioIo::new(backend);

    let copy = tokio::io::copy_bidirectional(&mut client_io, &mut backend_io);
    tokio::pin!(copy);
    let mut ticker = tokio::time::interval(UPGRADE_TOUCH_INTERVAL);

    loop {
        tokio::select! {
            result = &mut copy => {
                match result {
                    Ok((client_to_backend, backend_to_client)) => {
                        debug!(
                            tenant = %tenant,
                            request_id,
                            client_to_backend,
                            backend_to_client,
                            "Upgraded connection closed normally"
                        );
                    }
                    Err(e) => {
                        debug!(tenant = %tenant, request_id, error = %e, "Upgraded connection closed with error");
                    }
                }
                break;
            }
            _ = ticker.tick() => on_activity(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[test]
    fn test_apply_root_alias() {
        let uri: Uri = "/".parse().unwrap();
        assert_eq!(apply_root_alias(&uri, "/mcp").unwrap(), "/mcp");

        let uri: Uri = "/?stream=1".parse().unwrap();
        assert_eq!(apply_root_alias(&uri, "/mcp").unwrap(), "/mcp?stream=1");

        let uri: Uri = "/other".parse().unwrap();
        assert!(apply_root_alias(&uri, "/mcp").is_none());

        let uri: Uri = "/".parse().unwrap();
        assert!(apply_root_alias(&uri, "").is_none());
    }

    #[test]
    fn test_replayable_len() {
        let mut headers = HeaderMap::new();
        assert_eq!(replayable_len(&headers), Some(0));

        headers.insert(hyper::header::TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
        assert_eq!(replayable_len(&headers), None);

        headers.insert(hyper::header::CONTENT_LENGTH, HeaderValue::from_static("42"));
        assert_eq!(replayable_len(&headers), Some(42));
    }

    #[test]
    fn test_is_upgrade_request() {
        let req = Request::builder()
            .header("Connection", "keep-alive, Upgrade")
            .header("Upgrade", "websocket")
            .body(())
            .unwrap();
        assert!(is_upgrade_request(&req));
        assert_eq!(get_upgrade_type(&req).as_deref(), Some("websocket"));

        let req = Request::builder().header("Upgrade", "websocket").body(()).unwrap();
        assert!(!is_upgrade_request(&req));
    }

    /// An instance that reads one request head and answers with the given
    /// writes, pausing between them
    async fn scripted_instance(writes: Vec<&'static [u8]>) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut head = Vec::new();
            let mut buf = [0u8; 1024];
            while !head.windows(4).any(|w| w == b"\r\n\r\n") {
                let n = stream.read(&mut buf).await.unwrap();
                if n == 0 {
                    return;
                }
                head.extend_from_slice(&buf[..n]);
            }
            for chunk in writes {
                stream.write_all(chunk).await.unwrap();
                stream.flush().await.unwrap();
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
            tokio::time::sleep(Duration::from_millis(500)).await;
        });
        port
    }

    fn upgrade_hop(port: u16) -> Request<ProxyBody> {
        Request::builder()
            .uri("/mcp")
            .header("host", format!("127.0.0.1:{}", port))
            .header("connection", "upgrade")
            .header("upgrade", "echo")
            .body(empty())
            .unwrap()
    }

    #[tokio::test]
    async fn test_send_upgrade_keeps_bytes_behind_head() {
        let port = scripted_instance(vec![
            &b"HTTP/1.1 101 Switching Protocols\r\nConnection: upgrade\r\nUpgrade: echo\r\n\r\nfirst-frame"[..],
        ])
        .await;

        let stream = connect_instance(port).await.unwrap();
        let (response, upgraded) = send_upgrade(stream, upgrade_hop(port)).await.unwrap();
        assert_eq!(response.status(), StatusCode::SWITCHING_PROTOCOLS);

        let mut io = TokioIo::new(upgraded.unwrap());
        let mut frame = [0u8; 11];
        io.read_exact(&mut frame).await.unwrap();
        assert_eq!(&frame, b"first-frame");
    }

    #[tokio::test]
    async fn test_send_upgrade_reads_head_split_across_writes() {
        let port = scripted_instance(vec![
            &b"HTTP/1.1 101 Switching Protocols\r\nConn"[..],
            &b"ection: upgrade\r\nUpgrade: echo\r\n\r\n"[..],
        ])
        .await;

        let stream = connect_instance(port).await.unwrap();
        let (response, upgraded) = send_upgrade(stream, upgrade_hop(port)).await.unwrap();
        assert_eq!(response.status(), StatusCode::SWITCHING_PROTOCOLS);
        assert_eq!(response.headers().get("upgrade").unwrap(), "echo");
        assert!(upgraded.is_some());
    }

    #[tokio::test]
    async fn test_send_upgrade_relays_refusal_body() {
        let port = scripted_instance(vec![&b"HTTP/1.1 403 Forbidden\r\nContent-Length: 6\r\n\r\ndenied"[..]]).await;

        let stream = connect_instance(port).await.unwrap();
        let (response, upgraded) = send_upgrade(stream, upgrade_hop(port)).await.unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert!(upgraded.is_none());

        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"denied");
    }
}
