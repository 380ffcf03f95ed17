use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tenantgate::config::Config;
use tenantgate::docker::DockerRuntime;
use tenantgate::gateway::Gateway;
use tenantgate::proxy::{PKG_NAME, VERSION};
use tenantgate::validator::HttpCredentialValidator;
use tokio::sync::watch;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("tenantgate=debug".parse().expect("valid log directive")),
        )
        .init();

    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    let config = Config::load(&config_path).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        e
    })?;

    info!(path = %config_path.display(), "Configuration loaded");
    print_startup_banner(&config);

    // Write PID file if configured (with exclusive lock on Unix)
    let pid_file_path = config.server.pid_file.as_ref().map(PathBuf::from);
    let _pid_file = if let Some(ref path) = pid_file_path {
        let pid_file = write_pid_file(path)?;
        info!(path = %path.display(), "PID file written and locked");
        Some(pid_file)
    } else {
        None
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let runtime = Arc::new(
        DockerRuntime::connect(
            config.instances.docker_host.as_deref(),
            config.instances.pull_policy.clone(),
        )
        .await?,
    );
    let validator = Arc::new(HttpCredentialValidator::new(&config.auth)?);

    let bind_addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port)
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid bind address: {}", e))?;
    let stop_on_shutdown = config.server.stop_instances_on_shutdown;

    let gateway = Gateway::build(config, runtime, validator)?;

    match gateway.lifecycle().recover().await {
        Ok(count) => info!(count, "Reserved ports of existing containers"),
        Err(e) => warn!(error = %e, "Could not list existing containers"),
    }

    let reaper_handle = gateway.reaper().spawn(shutdown_rx.clone());

    let server = gateway.server(bind_addr, shutdown_rx);
    let server_handle = tokio::spawn(async move {
        if let Err(e) = server.run().await {
            error!(error = %e, "Gateway server error");
        }
    });

    // Wait for shutdown signal (Ctrl+C or SIGTERM)
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())
            .expect("Failed to install SIGTERM handler");

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT (Ctrl+C), shutting down...");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.expect("Failed to listen for Ctrl+C");
        info!("Received Ctrl+C, shutting down...");
    }

    let _ = shutdown_tx.send(true);

    if stop_on_shutdown {
        gateway.lifecycle().stop_all().await;
    } else {
        info!("Leaving instances running; they will be adopted on next start");
    }

    // Wait for tasks to stop (with timeout)
    let _ = tokio::time::timeout(Duration::from_secs(5), async {
        let _ = server_handle.await;
        let _ = reaper_handle.await;
    })
    .await;

    if let Some(ref path) = pid_file_path {
        if let Err(e) = std::fs::remove_file(path) {
            warn!(path = %path.display(), error = %e, "Failed to remove PID file");
        }
    }

    info!("Shutdown complete");
    Ok(())
}

/// PID file handle that maintains an exclusive lock
#[cfg(unix)]
struct PidFile {
    _file: std::fs::File,
}

#[cfg(unix)]
impl PidFile {
    fn create(path: &Path) -> anyhow::Result<Self> {
        use std::os::unix::io::AsRawFd;

        let file = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;

        // Try to acquire exclusive lock (non-blocking)
        let fd = file.as_raw_fd();
        let result = unsafe { libc::flock(fd, libc::LOCK_EX | libc::LOCK_NB) };

        if result != 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::WouldBlock {
                anyhow::bail!("Another gateway is already running (PID file is locked)");
            }
            return Err(err.into());
        }

        let pid = std::process::id();
        use std::io::Write;
        writeln!(&file, "{}", pid)?;

        // Keep the file handle open to maintain the lock
        Ok(Self { _file: file })
    }
}

#[cfg(not(unix))]
struct PidFile;

#[cfg(not(unix))]
impl PidFile {
    fn create(path: &Path) -> anyhow::Result<Self> {
        let pid = std::process::id();
        let mut file = std::fs::File::create(path)?;
        use std::io::Write;
        writeln!(file, "{}", pid)?;
        Ok(Self)
    }
}

fn write_pid_file(path: &Path) -> anyhow::Result<PidFile> {
    PidFile::create(path)
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting gateway");
    info!(
        bind = %config.server.bind,
        port = config.server.port,
        stats_auth = config.server.stats_token.is_some(),
        "Server configuration"
    );
    info!(
        identity_url = %config.auth.identity_url,
        credential_header = %config.auth.credential_header,
        identity_timeout_secs = config.auth.identity_timeout_secs,
        "Credential validation"
    );
    info!(
        image = %config.instances.image,
        memory = %config.instances.memory,
        cpus = %config.instances.cpus,
        port_range = %format!("{}-{}", config.instances.port_range_start, config.instances.port_range_end),
        idle_timeout_secs = config.instances.idle_timeout_secs,
        creation_timeout_secs = config.instances.creation_timeout_secs,
        "Instance settings"
    );
    info!(
        session_header = %config.sessions.header,
        session_idle_timeout_secs = config.sessions.idle_timeout_secs,
        request_timeout_secs = config.proxy.request_timeout_secs,
        reaper_interval_secs = config.proxy.reaper_interval_secs,
        "Proxy settings"
    );
}
