//! Shared fixtures for the end-to-end tests
//!
//! Containers are simulated in-process: starting one spawns a small HTTP
//! backend that hands out session ids and forgets them on every restart.
//!
//! Routes beyond the session echo:
//! - `/missing` always answers 404 on its own account
//! - `/rotate` replaces a known session with a new one
//! - `/forgetful` never remembers the sessions it issues
//! - `/events` streams one event, then a second once `release` is notified
//! - any upgrade request switches to a line echo after a `welcome` line

#![allow(dead_code)]

use async_trait::async_trait;
use futures::stream;
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Full, StreamBody};
use hyper::body::{Bytes, Frame, Incoming};
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::convert::Infallible;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tenantgate::config::Config;
use tenantgate::gateway::Gateway;
use tenantgate::runtime::{ContainerRuntime, ContainerSpec, ContainerStatus, RuntimeError};
use tenantgate::tenant::TenantId;
use tenantgate::validator::{CredentialValidator, ValidationError};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;

pub const SESSION_HEADER: &str = "mcp-session-id";
pub const CREDENTIAL_HEADER: &str = "x-outline-api-key";
pub const STATS_TOKEN: &str = "operator-secret";

struct MockContainer {
    port: u16,
    tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
    running: bool,
}

impl MockContainer {
    fn halt(&mut self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        self.running = false;
    }
}

/// Container runtime backed by in-process mock instances
#[derive(Default)]
pub struct MockRuntime {
    pub creates: AtomicUsize,
    pub starts: AtomicUsize,
    pub stops: AtomicUsize,
    /// Requests that reached any instance
    pub hits: Arc<AtomicUsize>,
    /// Lets `/events` send its second event
    pub release: Arc<Notify>,
    containers: Mutex<HashMap<String, MockContainer>>,
    session_counter: Arc<AtomicUsize>,
}

impl MockRuntime {
    pub fn container_count(&self) -> usize {
        self.containers.lock().len()
    }
}

#[async_trait]
impl ContainerRuntime for MockRuntime {
    async fn ping(&self) -> Result<(), RuntimeError> {
        Ok(())
    }

    async fn create(&self, spec: &ContainerSpec) -> Result<(), RuntimeError> {
        self.creates.fetch_add(1, Ordering::SeqCst);
        let mut containers = self.containers.lock();
        if containers.contains_key(&spec.name) {
            return Err(RuntimeError::Other(format!("name {} in use", spec.name)));
        }
        containers.insert(
            spec.name.clone(),
            MockContainer {
                port: spec.host_port,
                tasks: Arc::new(Mutex::new(Vec::new())),
                running: false,
            },
        );
        Ok(())
    }

    async fn start(&self, name: &str) -> Result<(), RuntimeError> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        let (port, tasks) = {
            let containers = self.containers.lock();
            let c = containers
                .get(name)
                .ok_or_else(|| RuntimeError::NotFound(name.to_string()))?;
            (c.port, Arc::clone(&c.tasks))
        };

        let mut bound = None;
        for _ in 0..50 {
            if let Ok(listener) = TcpListener::bind(("127.0.0.1", port)).await {
                bound = Some(listener);
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let listener = bound.ok_or(RuntimeError::PortConflict(port))?;

        let backend = Arc::new(MockBackend {
            sessions: Mutex::new(HashSet::new()),
            counter: Arc::clone(&self.session_counter),
            hits: Arc::clone(&self.hits),
            release: Arc::clone(&self.release),
        });
        let accept_tasks = Arc::clone(&tasks);
        let accept = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let backend = Arc::clone(&backend);
                let conn = tokio::spawn(async move {
                    let service = service_fn(move |req| {
                        let backend = Arc::clone(&backend);
                        async move { backend.handle(req).await }
                    });
                    let _ = AutoBuilder::new(TokioExecutor::new())
                        .serve_connection_with_upgrades(TokioIo::new(stream), service)
                        .await;
                });
                accept_tasks.lock().push(conn);
            }
        });
        tasks.lock().push(accept);

        if let Some(c) = self.containers.lock().get_mut(name) {
            c.running = true;
        }
        Ok(())
    }

    async fn stop(&self, name: &str, _grace: Duration) -> Result<(), RuntimeError> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        if let Some(c) = self.containers.lock().get_mut(name) {
            c.halt();
        }
        Ok(())
    }

    async fn remove(&self, name: &str) -> Result<(), RuntimeError> {
        if let Some(mut c) = self.containers.lock().remove(name) {
            c.halt();
        }
        Ok(())
    }

    async fn inspect(&self, name: &str) -> Result<Option<ContainerStatus>, RuntimeError> {
        Ok(self.containers.lock().get(name).map(|c| ContainerStatus {
            name: name.to_string(),
            running: c.running,
            host_port: Some(c.port),
        }))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ContainerStatus>, RuntimeError> {
        Ok(self
            .containers
            .lock()
            .iter()
            .filter(|(name, _)| name.starts_with(prefix))
            .map(|(name, c)| ContainerStatus {
                name: name.clone(),
                running: c.running,
                host_port: Some(c.port),
            })
            .collect())
    }
}

type MockBody = UnsyncBoxBody<Bytes, Infallible>;

fn text(status: StatusCode, body: impl Into<Bytes>) -> Response<MockBody> {
    Response::builder()
        .status(status)
        .body(Full::new(body.into()).boxed_unsync())
        .expect("valid response")
}

/// One running instance. Sessions live only as long as the process.
struct MockBackend {
    sessions: Mutex<HashSet<String>>,
    counter: Arc<AtomicUsize>,
    hits: Arc<AtomicUsize>,
    release: Arc<Notify>,
}

impl MockBackend {
    fn next_session(&self) -> String {
        format!("sess-{}", self.counter.fetch_add(1, Ordering::SeqCst) + 1)
    }

    async fn handle(&self, mut req: Request<Incoming>) -> Result<Response<MockBody>, Infallible> {
        self.hits.fetch_add(1, Ordering::SeqCst);

        let path = req
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_default();
        let credential = req.headers().contains_key(CREDENTIAL_HEADER);
        let forwarded_for = req
            .headers()
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("-")
            .to_string();
        let presented = req
            .headers()
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(String::from);

        if req.uri().path() == "/missing" {
            return Ok(text(StatusCode::NOT_FOUND, "no such route"));
        }

        if req.headers().contains_key("upgrade") {
            return Ok(self.upgrade(&mut req));
        }

        let forgetful = req.uri().path() == "/forgetful";
        let mut response = Response::builder();
        let session = match presented {
            Some(id) => {
                if !self.sessions.lock().contains(&id) {
                    return Ok(text(StatusCode::NOT_FOUND, "unknown session"));
                }
                if req.uri().path() == "/rotate" {
                    let new_id = self.next_session();
                    self.sessions.lock().insert(new_id.clone());
                    response = response.header(SESSION_HEADER, new_id.as_str());
                    format!("session={} rotated_to={}", id, new_id)
                } else {
                    format!("session={} issued=false", id)
                }
            }
            None => {
                let id = self.next_session();
                if !forgetful {
                    self.sessions.lock().insert(id.clone());
                }
                response = response.header(SESSION_HEADER, id.as_str());
                format!("session={} issued=true", id)
            }
        };

        if req.uri().path() == "/events" {
            return Ok(response
                .status(StatusCode::OK)
                .header("content-type", "text/event-stream")
                .body(self.events())
                .expect("valid response"));
        }

        let body = format!(
            "path={} {} credential={} forwarded_for={}",
            path, session, credential, forwarded_for
        );
        Ok(response
            .status(StatusCode::OK)
            .body(Full::new(Bytes::from(body)).boxed_unsync())
            .expect("valid response"))
    }

    /// Two events with a pause the test controls in between
    fn events(&self) -> MockBody {
        let release = Arc::clone(&self.release);
        let events = stream::unfold(0u8, move |step| {
            let release = Arc::clone(&release);
            async move {
                match step {
                    0 => Some((Ok::<_, Infallible>(Frame::data(Bytes::from("data: one\n\n"))), 1)),
                    1 => {
                        release.notified().await;
                        Some((Ok::<_, Infallible>(Frame::data(Bytes::from("data: two\n\n"))), 2))
                    }
                    _ => None,
                }
            }
        });
        StreamBody::new(events).boxed_unsync()
    }

    /// Switch to a line echo that greets first
    fn upgrade(&self, req: &mut Request<Incoming>) -> Response<MockBody> {
        let on_upgrade = hyper::upgrade::on(req);
        tokio::spawn(async move {
            let Ok(upgraded) = on_upgrade.await else {
                return;
            };
            let (reader, mut writer) = tokio::io::split(TokioIo::new(upgraded));
            if writer.write_all(b"welcome\n").await.is_err() {
                return;
            }
            let mut lines = BufReader::new(reader).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if writer.write_all(format!("echo {}\n", line).as_bytes()).await.is_err() {
                    break;
                }
            }
        });

        Response::builder()
            .status(StatusCode::SWITCHING_PROTOCOLS)
            .header("connection", "upgrade")
            .header("upgrade", "echo")
            .body(Full::new(Bytes::new()).boxed_unsync())
            .expect("valid response")
    }
}

/// Accepts a fixed set of credentials; "identity-down" simulates an outage
pub struct StaticValidator {
    accepted: HashSet<String>,
}

impl StaticValidator {
    pub fn new(accepted: &[&str]) -> Self {
        Self {
            accepted: accepted.iter().map(|s| s.to_string()).collect(),
        }
    }
}

#[async_trait]
impl CredentialValidator for StaticValidator {
    async fn validate(&self, credential: &str) -> Result<TenantId, ValidationError> {
        if credential == "identity-down" {
            return Err(ValidationError::Unavailable("connection refused".to_string()));
        }
        if self.accepted.contains(credential) {
            Ok(TenantId::from_credential(credential))
        } else {
            Err(ValidationError::Unauthorized(401))
        }
    }
}

/// A gateway listening on a fixed port, shut down on drop
pub struct TestGateway {
    pub port: u16,
    pub gateway: Gateway,
    pub runtime: Arc<MockRuntime>,
    shutdown_tx: watch::Sender<bool>,
}

impl Drop for TestGateway {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
    }
}

pub fn test_config(port: u16, instance_ports: u16) -> Config {
    let mut config = Config::default();
    config.server.bind = "127.0.0.1".to_string();
    config.server.port = port;
    config.server.stats_token = Some(STATS_TOKEN.to_string());
    config.instances.port_range_start = instance_ports;
    config.instances.port_range_end = instance_ports + 10;
    config.instances.readiness_interval_ms = 10;
    config.instances.creation_timeout_secs = 5;
    config.instances.restart_timeout_secs = 5;
    config.proxy.request_timeout_secs = 5;
    config
}

pub async fn start_gateway(config: Config) -> TestGateway {
    let port = config.server.port;
    let runtime = Arc::new(MockRuntime::default());
    let validator = Arc::new(StaticValidator::new(&["alpha", "beta"]));
    let gateway = Gateway::build(config, runtime.clone(), validator).unwrap();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let server = gateway.server(format!("127.0.0.1:{}", port).parse().unwrap(), shutdown_rx);
    tokio::spawn(async move {
        let _ = server.run().await;
    });
    assert!(wait_for_port(port, Duration::from_secs(5)).await, "gateway did not start");

    TestGateway {
        port,
        gateway,
        runtime,
        shutdown_tx,
    }
}

/// Wait for a port to become available (server listening)
pub async fn wait_for_port(port: u16, timeout: Duration) -> bool {
    let start = std::time::Instant::now();
    while start.elapsed() < timeout {
        if TcpStream::connect(format!("127.0.0.1:{}", port)).await.is_ok() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

/// Send a raw HTTP/1.1 request and read the whole response
pub async fn http_request(
    port: u16,
    method: &str,
    path: &str,
    headers: &[(&str, &str)],
    body: &str,
) -> Result<String, Box<dyn std::error::Error>> {
    let mut stream = TcpStream::connect(format!("127.0.0.1:{}", port)).await?;

    let mut request = format!(
        "{} {} HTTP/1.1\r\nHost: 127.0.0.1:{}\r\nConnection: close\r\nContent-Length: {}\r\n",
        method,
        path,
        port,
        body.len()
    );
    for (name, value) in headers {
        request.push_str(&format!("{}: {}\r\n", name, value));
    }
    request.push_str("\r\n");
    request.push_str(body);
    stream.write_all(request.as_bytes()).await?;

    let mut response = String::new();
    stream.read_to_string(&mut response).await?;
    Ok(response)
}

/// Write a request verbatim and read until the connection closes
pub async fn raw_exchange(port: u16, request: &str) -> String {
    let mut stream = TcpStream::connect(format!("127.0.0.1:{}", port)).await.unwrap();
    stream.write_all(request.as_bytes()).await.unwrap();
    let mut response = Vec::new();
    stream.read_to_end(&mut response).await.unwrap();
    String::from_utf8_lossy(&response).into_owned()
}

/// Read from `stream` into `seen` until it contains `needle`
pub async fn read_until(stream: &mut TcpStream, seen: &mut Vec<u8>, needle: &str) {
    let mut buf = [0u8; 1024];
    let deadline = Duration::from_secs(5);
    while !String::from_utf8_lossy(seen).contains(needle) {
        let n = tokio::time::timeout(deadline, stream.read(&mut buf))
            .await
            .expect("timed out waiting for data")
            .unwrap();
        assert!(n > 0, "connection closed before {:?} arrived", needle);
        seen.extend_from_slice(&buf[..n]);
    }
}

/// GET with a tenant credential
pub async fn tenant_get(port: u16, path: &str, credential: &str) -> String {
    http_request(port, "GET", path, &[(CREDENTIAL_HEADER, credential)], "")
        .await
        .unwrap()
}

pub fn status_of(response: &str) -> u16 {
    response
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .unwrap_or(0)
}

pub fn header_of<'a>(response: &'a str, name: &str) -> Option<&'a str> {
    let head = response.split("\r\n\r\n").next()?;
    head.lines().skip(1).find_map(|line| {
        let (key, value) = line.split_once(':')?;
        key.trim().eq_ignore_ascii_case(name).then(|| value.trim())
    })
}
