//! Docker implementation of the container runtime

use crate::config::PullPolicy;
use crate::runtime::{ContainerRuntime, ContainerSpec, ContainerStatus, RuntimeError};
use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, ListContainersOptions,
    RemoveContainerOptions, StartContainerOptions, StopContainerOptions,
};
use bollard::errors::Error as BollardError;
use bollard::image::CreateImageOptions;
use bollard::models::{ContainerInspectResponse, HostConfig, PortBinding};
use bollard::Docker;
use futures::StreamExt;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Seconds bollard waits on a single daemon call
const DOCKER_TIMEOUT_SECS: u64 = 120;

/// Tenant containers managed through the Docker daemon
pub struct DockerRuntime {
    client: Docker,
    pull_policy: PullPolicy,
}

impl DockerRuntime {
    /// Connect to the Docker daemon
    ///
    /// Connection priority:
    /// 1. Explicit docker_host parameter
    /// 2. DOCKER_HOST environment variable
    /// 3. bollard's platform default socket
    pub async fn connect(docker_host: Option<&str>, pull_policy: PullPolicy) -> anyhow::Result<Self> {
        let client = match docker_host
            .map(str::to_string)
            .or_else(|| std::env::var("DOCKER_HOST").ok())
        {
            Some(host) => Self::connect_to_host(&host)?,
            None => Docker::connect_with_socket_defaults().map_err(|e| {
                anyhow::anyhow!(
                    "Cannot connect to Docker daemon: {}. \
                     Start dockerd or set DOCKER_HOST / instances.docker_host.",
                    e
                )
            })?,
        };

        // An unreachable daemon degrades /health instead of aborting startup
        match client.ping().await {
            Ok(_) => debug!("Connected to Docker daemon"),
            Err(e) => warn!(error = %e, "Docker daemon is not responding, serving degraded"),
        }

        Ok(Self { client, pull_policy })
    }

    fn connect_to_host(host: &str) -> anyhow::Result<Docker> {
        if let Some(socket_path) = host.strip_prefix("unix://") {
            Docker::connect_with_socket(socket_path, DOCKER_TIMEOUT_SECS, bollard::API_DEFAULT_VERSION)
                .map_err(|e| anyhow::anyhow!("Cannot connect to Unix socket '{}': {}", socket_path, e))
        } else if host.starts_with("tcp://") || host.starts_with("http://") {
            Docker::connect_with_http(host, DOCKER_TIMEOUT_SECS, bollard::API_DEFAULT_VERSION)
                .map_err(|e| anyhow::anyhow!("Cannot connect to TCP endpoint '{}': {}", host, e))
        } else {
            anyhow::bail!(
                "Invalid docker_host format: '{}'. Expected 'unix:///path/to/socket' or 'tcp://host:port'",
                host
            )
        }
    }

    /// Pull the image if the pull policy asks for it
    async fn pull_image_if_needed(&self, image: &str) -> Result<(), RuntimeError> {
        let should_pull = match self.pull_policy {
            PullPolicy::Always => true,
            PullPolicy::Never => {
                if self.client.inspect_image(image).await.is_err() {
                    return Err(RuntimeError::Other(format!(
                        "Image '{}' not found locally and pull_policy is 'never'",
                        image
                    )));
                }
                false
            }
            PullPolicy::IfNotPresent => self.client.inspect_image(image).await.is_err(),
        };

        if !should_pull {
            debug!(image, "Image exists locally, skipping pull");
            return Ok(());
        }

        info!(image, "Pulling Docker image");
        let options = CreateImageOptions {
            from_image: image,
            ..Default::default()
        };

        let mut stream = self.client.create_image(Some(options), None, None);
        while let Some(result) = stream.next().await {
            match result {
                Ok(progress) => {
                    if let Some(error) = progress.error {
                        return Err(RuntimeError::Other(format!(
                            "Failed to pull image '{}': {}",
                            image, error
                        )));
                    }
                    if let Some(status) = progress.status {
                        debug!(image, status, "Pull progress");
                    }
                }
                Err(e) => return Err(map_error(e, image, None)),
            }
        }

        info!(image, "Image pulled successfully");
        Ok(())
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn ping(&self) -> Result<(), RuntimeError> {
        self.client
            .ping()
            .await
            .map(|_| ())
            .map_err(|e| RuntimeError::Unreachable(e.to_string()))
    }

    async fn create(&self, spec: &ContainerSpec) -> Result<(), RuntimeError> {
        self.pull_image_if_needed(&spec.image).await?;

        let env: Vec<String> = spec
            .env
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();

        // Publish only the backend port, and only on loopback
        let port_key = format!("{}/tcp", spec.container_port);
        let mut port_bindings: HashMap<String, Option<Vec<PortBinding>>> = HashMap::new();
        port_bindings.insert(
            port_key.clone(),
            Some(vec![PortBinding {
                host_ip: Some("127.0.0.1".to_string()),
                host_port: Some(spec.host_port.to_string()),
            }]),
        );

        let mut exposed_ports: HashMap<String, HashMap<(), ()>> = HashMap::new();
        exposed_ports.insert(port_key, HashMap::new());

        let host_config = HostConfig {
            port_bindings: Some(port_bindings),
            network_mode: Some(spec.network.clone()),
            memory: Some(spec.memory_bytes),
            memory_swap: Some(spec.memory_bytes),
            nano_cpus: Some(spec.nano_cpus),
            ..Default::default()
        };

        let container_config = Config {
            image: Some(spec.image.clone()),
            env: Some(env),
            exposed_ports: Some(exposed_ports),
            host_config: Some(host_config),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: spec.name.clone(),
            platform: None,
        };

        let response = self
            .client
            .create_container(Some(options), container_config)
            .await
            .map_err(|e| map_error(e, &spec.name, Some(spec.host_port)))?;

        info!(
            container = %spec.name,
            container_id = %response.id,
            image = %spec.image,
            host_port = spec.host_port,
            "Created Docker container"
        );
        Ok(())
    }

    async fn start(&self, name: &str) -> Result<(), RuntimeError> {
        match self
            .client
            .start_container(name, None::<StartContainerOptions<String>>)
            .await
        {
            Ok(()) => {
                info!(container = name, "Started Docker container");
                Ok(())
            }
            Err(BollardError::DockerResponseServerError { status_code: 304, .. }) => {
                debug!(container = name, "Container was already running");
                Ok(())
            }
            Err(e) => {
                let port = self.inspect(name).await.ok().flatten().and_then(|s| s.host_port);
                Err(map_error(e, name, port))
            }
        }
    }

    async fn stop(&self, name: &str, grace: Duration) -> Result<(), RuntimeError> {
        let options = StopContainerOptions {
            t: grace.as_secs() as i64,
        };

        match self.client.stop_container(name, Some(options)).await {
            Ok(()) => {
                info!(container = name, "Stopped Docker container");
                Ok(())
            }
            Err(BollardError::DockerResponseServerError { status_code: 304, .. }) => {
                debug!(container = name, "Container was already stopped");
                Ok(())
            }
            Err(BollardError::DockerResponseServerError { status_code: 404, .. }) => {
                debug!(container = name, "Container not found");
                Ok(())
            }
            Err(e) => {
                warn!(container = name, error = %e, "Error stopping container, forcing kill");
                self.client
                    .kill_container::<String>(name, None)
                    .await
                    .map_err(|e| map_error(e, name, None))
            }
        }
    }

    async fn remove(&self, name: &str) -> Result<(), RuntimeError> {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };

        match self.client.remove_container(name, Some(options)).await {
            Ok(()) => {
                debug!(container = name, "Removed Docker container");
                Ok(())
            }
            Err(BollardError::DockerResponseServerError { status_code: 404, .. }) => Ok(()),
            Err(e) => Err(map_error(e, name, None)),
        }
    }

    async fn inspect(&self, name: &str) -> Result<Option<ContainerStatus>, RuntimeError> {
        match self
            .client
            .inspect_container(name, None::<InspectContainerOptions>)
            .await
        {
            Ok(info) => Ok(Some(status_from_inspect(name, &info))),
            Err(BollardError::DockerResponseServerError { status_code: 404, .. }) => Ok(None),
            Err(e) => Err(map_error(e, name, None)),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ContainerStatus>, RuntimeError> {
        let mut filters = HashMap::new();
        filters.insert("name".to_string(), vec![prefix.to_string()]);
        let options = ListContainersOptions {
            all: true,
            filters,
            ..Default::default()
        };

        let summaries = self
            .client
            .list_containers(Some(options))
            .await
            .map_err(|e| map_error(e, prefix, None))?;

        // The name filter is a substring match; keep true prefix matches only
        let names: Vec<String> = summaries
            .into_iter()
            .flat_map(|s| s.names.unwrap_or_default())
            .map(|n| n.trim_start_matches('/').to_string())
            .filter(|n| n.starts_with(prefix))
            .collect();

        let mut statuses = Vec::with_capacity(names.len());
        for name in names {
            if let Some(status) = self.inspect(&name).await? {
                statuses.push(status);
            }
        }
        Ok(statuses)
    }
}

fn status_from_inspect(name: &str, info: &ContainerInspectResponse) -> ContainerStatus {
    let running = info
        .state
        .as_ref()
        .and_then(|s| s.running)
        .unwrap_or(false);

    let host_port = info
        .host_config
        .as_ref()
        .and_then(|hc| hc.port_bindings.as_ref())
        .and_then(|bindings| {
            bindings
                .values()
                .flatten()
                .flatten()
                .find_map(|b| b.host_port.as_deref().and_then(|p| p.parse::<u16>().ok()))
        });

    ContainerStatus {
        name: name.to_string(),
        running,
        host_port,
    }
}

/// Translate a bollard error into the runtime taxonomy
fn map_error(error: BollardError, name: &str, port: Option<u16>) -> RuntimeError {
    match error {
        BollardError::DockerResponseServerError {
            status_code,
            message,
        } => {
            let lower = message.to_lowercase();
            if lower.contains("port is already allocated") || lower.contains("address already in use") {
                RuntimeError::PortConflict(port.unwrap_or_default())
            } else if status_code == 404 {
                RuntimeError::NotFound(name.to_string())
            } else {
                RuntimeError::Other(format!("{} ({}): {}", name, status_code, message))
            }
        }
        BollardError::JsonDataError { .. } | BollardError::JsonSerdeError { .. } => {
            RuntimeError::Other(error.to_string())
        }
        other => RuntimeError::Unreachable(other.to_string()),
    }
}
