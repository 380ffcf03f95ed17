//! Container runtime seam
//!
//! The lifecycle manager drives tenant containers only through
//! [`ContainerRuntime`], so the Docker implementation can be swapped for an
//! in-process fake in tests.

use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;

/// Everything needed to create one tenant container
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    /// Deterministic name derived from the tenant id
    pub name: String,
    pub image: String,
    /// Port the backend listens on inside the container
    pub container_port: u16,
    /// Host port published on 127.0.0.1
    pub host_port: u16,
    /// Memory cap in bytes
    pub memory_bytes: i64,
    /// CPU cap in nano-CPUs
    pub nano_cpus: i64,
    pub network: String,
    pub env: HashMap<String, String>,
}

/// Observed state of a container
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerStatus {
    pub name: String,
    pub running: bool,
    /// Published host port, if the container has a usable binding
    pub host_port: Option<u16>,
}

#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    /// The published host port is held by something else
    #[error("host port {0} is already in use")]
    PortConflict(u16),
    #[error("container '{0}' not found")]
    NotFound(String),
    /// The runtime daemon could not be reached at all
    #[error("container runtime unreachable: {0}")]
    Unreachable(String),
    #[error("{0}")]
    Other(String),
}

/// Create/start/stop/inspect operations keyed by container name.
///
/// Calls for different names may run fully in parallel; the caller serialises
/// calls for the same name.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Verify the runtime is reachable
    async fn ping(&self) -> Result<(), RuntimeError>;

    /// Create (but do not start) a container
    async fn create(&self, spec: &ContainerSpec) -> Result<(), RuntimeError>;

    async fn start(&self, name: &str) -> Result<(), RuntimeError>;

    /// Stop gracefully, killing after `grace`. Stopping a stopped container is Ok.
    async fn stop(&self, name: &str, grace: Duration) -> Result<(), RuntimeError>;

    /// Remove forcefully. Removing a missing container is Ok.
    async fn remove(&self, name: &str) -> Result<(), RuntimeError>;

    /// `Ok(None)` when no container with this name exists
    async fn inspect(&self, name: &str) -> Result<Option<ContainerStatus>, RuntimeError>;

    /// All containers whose name starts with `prefix`
    async fn list(&self, prefix: &str) -> Result<Vec<ContainerStatus>, RuntimeError>;
}

/// Parse memory limit string (e.g., "512m", "1g") to bytes
pub fn parse_memory_limit(limit: &str) -> anyhow::Result<i64> {
    let limit = limit.trim().to_lowercase();
    let (num_str, multiplier) = if limit.ends_with('g') || limit.ends_with("gb") {
        let num = limit.trim_end_matches("gb").trim_end_matches('g');
        (num, 1024 * 1024 * 1024i64)
    } else if limit.ends_with('m') || limit.ends_with("mb") {
        let num = limit.trim_end_matches("mb").trim_end_matches('m');
        (num, 1024 * 1024i64)
    } else if limit.ends_with('k') || limit.ends_with("kb") {
        let num = limit.trim_end_matches("kb").trim_end_matches('k');
        (num, 1024i64)
    } else {
        (limit.as_str(), 1i64)
    };

    let num: f64 = num_str
        .parse()
        .map_err(|_| anyhow::anyhow!("Invalid memory limit: {}", limit))?;

    Ok((num * multiplier as f64) as i64)
}

/// Parse a fractional CPU count (e.g. "0.3") to nano-CPUs
pub fn parse_cpu_limit(cpus: &str) -> anyhow::Result<i64> {
    let count: f64 = cpus
        .trim()
        .parse()
        .map_err(|_| anyhow::anyhow!("Invalid CPU limit: {}", cpus))?;
    if count <= 0.0 {
        anyhow::bail!("CPU limit must be positive: {}", cpus);
    }
    Ok((count * 1_000_000_000.0).round() as i64)
}
