//! Instance lifecycle manager
//!
//! Creates, starts and stops tenant containers through a [`ContainerRuntime`]
//! and drives the registry state machine. Every state-changing operation runs
//! under the tenant's lifecycle lock; operations on different tenants never
//! share a lock.

use crate::config::InstanceConfig;
use crate::ports::PortAllocator;
use crate::registry::{InstanceRegistry, InstanceState, TenantSlot, TransitionError};
use crate::runtime::{parse_cpu_limit, parse_memory_limit, ContainerRuntime, ContainerSpec, RuntimeError};
use crate::tenant::TenantId;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

/// Per-attempt bound on a readiness check
const READY_CHECK_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    #[error("instance did not become ready within {0:?}")]
    Timeout(Duration),

    #[error("instance keeps failing to start, retry in {0:?}")]
    CoolingDown(Duration),

    #[error("no free host port in range")]
    PortsExhausted,

    #[error(transparent)]
    Runtime(#[from] RuntimeError),

    #[error("{0}")]
    InvalidState(String),

    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error("lifecycle task aborted: {0}")]
    Aborted(String),
}

impl LifecycleError {
    /// Whether this failure counts against the tenant's start-failure budget.
    /// Runtime outages and port exhaustion are not the tenant's fault.
    fn counts_as_start_failure(&self) -> bool {
        !matches!(
            self,
            LifecycleError::Runtime(RuntimeError::Unreachable(_))
                | LifecycleError::PortsExhausted
                | LifecycleError::CoolingDown(_)
        )
    }
}

pub struct LifecycleManager {
    registry: Arc<InstanceRegistry>,
    runtime: Arc<dyn ContainerRuntime>,
    ports: PortAllocator,
    config: InstanceConfig,
    memory_bytes: i64,
    nano_cpus: i64,
    /// Containers found at start-up, by name, with the port reserved for them
    recovered: Mutex<HashMap<String, u16>>,
}

impl LifecycleManager {
    pub fn new(
        registry: Arc<InstanceRegistry>,
        runtime: Arc<dyn ContainerRuntime>,
        config: InstanceConfig,
    ) -> anyhow::Result<Self> {
        let memory_bytes = parse_memory_limit(&config.memory)?;
        let nano_cpus = parse_cpu_limit(&config.cpus)?;
        let ports = PortAllocator::new(config.port_range_start, config.port_range_end);

        Ok(Self {
            registry,
            runtime,
            ports,
            config,
            memory_bytes,
            nano_cpus,
            recovered: Mutex::new(HashMap::new()),
        })
    }

    pub fn registry(&self) -> &Arc<InstanceRegistry> {
        &self.registry
    }

    pub fn runtime(&self) -> &Arc<dyn ContainerRuntime> {
        &self.runtime
    }

    pub fn ports(&self) -> &PortAllocator {
        &self.ports
    }

    pub fn config(&self) -> &InstanceConfig {
        &self.config
    }

    /// Reserve the published ports of containers that survived a restart of
    /// the gateway, so fresh allocations never collide with them.
    pub async fn recover(&self) -> Result<usize, RuntimeError> {
        let containers = self.runtime.list(&self.config.name_prefix).await?;

        let mut recovered = self.recovered.lock();
        for container in containers {
            let Some(port) = container.host_port else {
                debug!(container = %container.name, "Existing container has no port binding");
                continue;
            };
            if self.ports.reserve(port) {
                debug!(container = %container.name, port, "Reserved port of existing container");
                recovered.insert(container.name, port);
            } else {
                warn!(
                    container = %container.name,
                    port,
                    "Existing container port is outside the range or already taken"
                );
            }
        }

        if !recovered.is_empty() {
            info!(count = recovered.len(), "Found existing instance containers");
        }
        Ok(recovered.len())
    }

    /// Make sure the tenant's instance is Running and return its port.
    ///
    /// The Running case is answered from the registry without taking the
    /// lifecycle lock. Anything else runs in its own task so a caller that
    /// disconnects cannot cancel a creation halfway through.
    pub async fn ensure_running(
        self: &Arc<Self>,
        tenant: &TenantId,
        credential: &str,
    ) -> Result<u16, LifecycleError> {
        if let Some(port) = self.registry.claim_running(tenant) {
            return Ok(port);
        }

        let manager = Arc::clone(self);
        let tenant = tenant.clone();
        let credential = credential.to_string();
        tokio::spawn(async move { manager.ensure_running_locked(&tenant, &credential).await })
            .await
            .map_err(|e| LifecycleError::Aborted(e.to_string()))?
    }

    async fn ensure_running_locked(
        &self,
        tenant: &TenantId,
        credential: &str,
    ) -> Result<u16, LifecycleError> {
        let slot = self.registry.slot(tenant);
        let _guard = slot.lock_lifecycle().await;

        let now = Instant::now();
        let (state, port) = {
            let record = slot.record();
            (record.state, record.assigned_port)
        };

        // Another request finished the work while we waited for the lock
        if let (InstanceState::Running, Some(port)) = (state, port) {
            slot.touch_at(now);
            return Ok(port);
        }

        if let Some(remaining) = slot.cooldown_remaining(now) {
            debug!(tenant = %tenant, remaining_secs = remaining.as_secs(), "Instance start cooling down");
            return Err(LifecycleError::CoolingDown(remaining));
        }

        let result = match state {
            InstanceState::Absent => self.create(&slot, tenant, credential).await,
            InstanceState::Stopped => self.restart(&slot, tenant, credential).await,
            InstanceState::Stopping => {
                // A stop that never finished; the container may be in any state
                slot.transition(InstanceState::Stopped)?;
                self.restart(&slot, tenant, credential).await
            }
            InstanceState::Creating | InstanceState::Removed => {
                // A creation that never finished, or a removal never reset
                warn!(tenant = %tenant, %state, "Resetting stale instance record");
                if let Some(port) = slot.reset_absent()? {
                    self.ports.release(port);
                }
                self.create(&slot, tenant, credential).await
            }
            InstanceState::Running => Err(LifecycleError::InvalidState(
                "running instance has no port".to_string(),
            )),
        };

        match &result {
            Ok(_) => slot.record_start_success(),
            Err(e) if e.counts_as_start_failure() => {
                let failures = slot.record_start_failure(
                    self.config.max_start_failures,
                    self.config.failure_cooldown(),
                );
                warn!(tenant = %tenant, failures, error = %e, "Instance failed to start");
                if failures >= self.config.max_start_failures {
                    error!(
                        tenant = %tenant,
                        cooldown_secs = self.config.failure_cooldown_secs,
                        "Too many failed starts, failing fast"
                    );
                }
            }
            Err(e) => warn!(tenant = %tenant, error = %e, "Instance unavailable"),
        }

        result
    }

    /// Absent -> Creating -> Running. On any failure the record goes back to
    /// Absent, the port is released and the half-made container is removed.
    async fn create(
        &self,
        slot: &TenantSlot,
        tenant: &TenantId,
        credential: &str,
    ) -> Result<u16, LifecycleError> {
        slot.transition(InstanceState::Creating)?;
        let name = tenant.container_name(&self.config.name_prefix);
        let creation_timeout = self.config.creation_timeout();

        let err = match timeout(creation_timeout, self.provision(slot, tenant, &name, credential)).await {
            Ok(Ok(port)) => {
                info!(tenant = %tenant, container = %name, port, "Instance running");
                return Ok(port);
            }
            Ok(Err(e)) => e,
            Err(_) => LifecycleError::Timeout(creation_timeout),
        };

        if let Err(e) = self.runtime.remove(&name).await {
            warn!(container = %name, error = %e, "Failed to remove container after failed creation");
        }
        if let Some(port) = slot.reset_absent()? {
            self.ports.release(port);
        }
        Err(err)
    }

    async fn provision(
        &self,
        slot: &TenantSlot,
        tenant: &TenantId,
        name: &str,
        credential: &str,
    ) -> Result<u16, LifecycleError> {
        if let Some(port) = self.adopt_existing(slot, name).await? {
            info!(tenant = %tenant, container = name, port, "Adopted existing container");
            return Ok(port);
        }

        let port = self.ports.allocate().ok_or(LifecycleError::PortsExhausted)?;
        slot.set_port(port);

        let port = match self.launch(name, port, credential).await {
            Ok(()) => port,
            Err(LifecycleError::Runtime(RuntimeError::PortConflict(_))) => {
                warn!(tenant = %tenant, port, "Assigned port is occupied, retrying on the next free port");
                self.runtime.remove(name).await?;
                let next = self.ports.allocate().ok_or(LifecycleError::PortsExhausted)?;
                self.ports.release(port);
                slot.set_port(next);
                self.launch(name, next, credential).await?;
                next
            }
            Err(e) => return Err(e),
        };

        self.wait_ready(port).await;
        slot.mark_created(port)?;
        Ok(port)
    }

    /// Take over a container left behind under the tenant's name, if it has
    /// a usable port binding. One without is removed so it can be recreated.
    async fn adopt_existing(&self, slot: &TenantSlot, name: &str) -> Result<Option<u16>, LifecycleError> {
        let Some(existing) = self.runtime.inspect(name).await? else {
            return Ok(None);
        };

        let recovered = self.recovered.lock().remove(name);
        if let Some(stale) = recovered.filter(|p| Some(*p) != existing.host_port) {
            self.ports.release(stale);
        }

        let claimed = match existing.host_port {
            Some(port) if recovered == Some(port) || self.ports.reserve(port) => Some(port),
            _ => None,
        };

        let Some(port) = claimed else {
            info!(container = name, "Removing existing container without a usable port");
            self.runtime.remove(name).await?;
            return Ok(None);
        };

        slot.set_port(port);
        if !existing.running {
            self.runtime.start(name).await?;
        }
        self.wait_ready(port).await;
        slot.mark_created(port)?;
        Ok(Some(port))
    }

    async fn launch(&self, name: &str, port: u16, credential: &str) -> Result<(), LifecycleError> {
        let spec = self.container_spec(name, port, credential);
        self.runtime.create(&spec).await?;
        self.runtime.start(name).await?;
        Ok(())
    }

    fn container_spec(&self, name: &str, port: u16, credential: &str) -> ContainerSpec {
        let mut env = self.config.env.clone();
        env.insert(self.config.credential_env.clone(), credential.to_string());

        ContainerSpec {
            name: name.to_string(),
            image: self.config.image.clone(),
            container_port: self.config.container_port,
            host_port: port,
            memory_bytes: self.memory_bytes,
            nano_cpus: self.nano_cpus,
            network: self.config.network.clone(),
            env,
        }
    }

    /// Stopped -> Running on the same port
    async fn restart(
        &self,
        slot: &TenantSlot,
        tenant: &TenantId,
        credential: &str,
    ) -> Result<u16, LifecycleError> {
        let name = tenant.container_name(&self.config.name_prefix);
        let assigned = slot.record().assigned_port;
        let Some(port) = assigned else {
            return self.recreate(slot, tenant, credential).await;
        };

        let restart_timeout = self.config.restart_timeout();
        let outcome = timeout(restart_timeout, async {
            self.runtime.start(&name).await?;
            self.wait_ready(port).await;
            Ok::<(), LifecycleError>(())
        })
        .await;

        match outcome {
            Ok(Ok(())) => {
                slot.transition(InstanceState::Running)?;
                slot.touch_at(Instant::now());
                info!(tenant = %tenant, container = %name, port, "Instance restarted");
                Ok(port)
            }
            Ok(Err(LifecycleError::Runtime(RuntimeError::NotFound(_)))) => {
                info!(tenant = %tenant, container = %name, "Stopped container is gone, recreating");
                self.recreate(slot, tenant, credential).await
            }
            Ok(Err(LifecycleError::Runtime(RuntimeError::PortConflict(_)))) => {
                warn!(tenant = %tenant, port, "Port taken while instance was stopped, recreating");
                self.runtime.remove(&name).await?;
                self.recreate(slot, tenant, credential).await
            }
            Ok(Err(e)) => {
                self.stop_quietly(&name).await;
                Err(e)
            }
            Err(_) => {
                self.stop_quietly(&name).await;
                Err(LifecycleError::Timeout(restart_timeout))
            }
        }
    }

    /// Stopped -> Removed -> Absent -> create
    async fn recreate(
        &self,
        slot: &TenantSlot,
        tenant: &TenantId,
        credential: &str,
    ) -> Result<u16, LifecycleError> {
        slot.transition(InstanceState::Removed)?;
        if let Some(port) = slot.reset_absent()? {
            self.ports.release(port);
        }
        self.create(slot, tenant, credential).await
    }

    async fn stop_quietly(&self, name: &str) {
        if let Err(e) = self.runtime.stop(name, self.config.stop_grace_period()).await {
            debug!(container = name, error = %e, "Stop after failed start also failed");
        }
    }

    /// Poll until the instance answers. Bounded by the caller's timeout.
    async fn wait_ready(&self, port: u16) {
        let interval = self.config.readiness_interval();
        loop {
            if self.check_ready(port).await {
                debug!(port, "Instance is ready");
                return;
            }
            tokio::time::sleep(interval).await;
        }
    }

    /// TCP connect, or an HTTP GET when a readiness path is configured.
    /// Any status below 500 counts as ready.
    async fn check_ready(&self, port: u16) -> bool {
        let addr = format!("127.0.0.1:{}", port);
        let mut stream = match timeout(READY_CHECK_TIMEOUT, TcpStream::connect(&addr)).await {
            Ok(Ok(stream)) => stream,
            _ => return false,
        };

        let Some(path) = self.config.readiness_path.as_deref() else {
            return true;
        };

        let request = format!(
            "GET {} HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n",
            path, addr
        );
        if stream.write_all(request.as_bytes()).await.is_err() {
            return false;
        }

        let read_result = timeout(READY_CHECK_TIMEOUT, async {
            let mut reader = BufReader::new(stream);
            let mut status_line = String::new();
            reader.read_line(&mut status_line).await?;
            Ok::<_, std::io::Error>(status_line)
        })
        .await;

        match read_result {
            Ok(Ok(status_line)) => status_line
                .split_whitespace()
                .nth(1)
                .and_then(|code| code.parse::<u16>().ok())
                .map(|code| code < 500)
                .unwrap_or(false),
            _ => false,
        }
    }

    /// Running -> Stopping -> Stopped if the instance is still idle beyond
    /// `idle` as seen from `now`. Skips tenants whose lifecycle lock is busy.
    ///
    /// Returns whether a stop was issued. The record ends up Stopped even if
    /// the runtime call fails, so the next request restarts it.
    pub async fn mark_idle_stop(
        &self,
        tenant: &TenantId,
        idle: Duration,
        now: Instant,
    ) -> Result<bool, LifecycleError> {
        let Some(slot) = self.registry.existing_slot(tenant) else {
            return Ok(false);
        };
        let Some(_guard) = slot.try_lock_lifecycle() else {
            debug!(tenant = %tenant, "Lifecycle busy, skipping idle check");
            return Ok(false);
        };

        if !slot.begin_idle_stop(idle, now) {
            return Ok(false);
        }

        let name = tenant.container_name(&self.config.name_prefix);
        let result = self.runtime.stop(&name, self.config.stop_grace_period()).await;
        slot.transition(InstanceState::Stopped)?;

        match result {
            Ok(()) => {
                info!(tenant = %tenant, container = %name, "Stopped idle instance");
                Ok(true)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Running -> Stopped after the instance refused a connection on `port`
    pub async fn mark_crashed(&self, tenant: &TenantId, port: u16) {
        let Some(slot) = self.registry.existing_slot(tenant) else {
            return;
        };
        let _guard = slot.lock_lifecycle().await;

        let still_running = {
            let record = slot.record();
            record.state == InstanceState::Running && record.assigned_port == Some(port)
        };
        if still_running && slot.transition(InstanceState::Stopped).is_ok() {
            warn!(tenant = %tenant, port, "Instance refused connection, marked stopped");
        }
    }

    /// The external reclamation sweep removed the tenant's stopped container:
    /// reset the record to Absent and free its port.
    pub async fn notify_removed(&self, tenant: &TenantId) -> Result<Option<u16>, LifecycleError> {
        let Some(slot) = self.registry.existing_slot(tenant) else {
            return Ok(None);
        };
        let _guard = slot.lock_lifecycle().await;

        match slot.state() {
            InstanceState::Absent => Ok(None),
            InstanceState::Stopped | InstanceState::Removed => {
                if slot.state() == InstanceState::Stopped {
                    slot.transition(InstanceState::Removed)?;
                }
                let port = slot.reset_absent()?;
                if let Some(port) = port {
                    self.ports.release(port);
                }
                info!(tenant = %tenant, ?port, "Instance removed, record reset");
                Ok(port)
            }
            other => Err(LifecycleError::InvalidState(format!(
                "instance is {}, only stopped instances can be removed",
                other
            ))),
        }
    }

    /// Stop every running instance, in parallel
    pub async fn stop_all(&self) {
        let tenants = self.registry.tenants_in(InstanceState::Running);
        info!(count = tenants.len(), "Stopping all running instances");

        let stops = tenants.into_iter().map(|tenant| async move {
            let Some(slot) = self.registry.existing_slot(&tenant) else {
                return;
            };
            let _guard = slot.lock_lifecycle().await;
            if slot.transition(InstanceState::Stopping).is_err() {
                return;
            }
            let name = tenant.container_name(&self.config.name_prefix);
            if let Err(e) = self.runtime.stop(&name, self.config.stop_grace_period()).await {
                error!(tenant = %tenant, error = %e, "Failed to stop instance");
            }
            let _ = slot.transition(InstanceState::Stopped);
        });

        futures::future::join_all(stops).await;
    }
}
