//! Wiring of the gateway components

use crate::config::Config;
use crate::diagnostics::Diagnostics;
use crate::lifecycle::LifecycleManager;
use crate::pool::{ConnectionPool, PoolConfig};
use crate::proxy::ProxyServer;
use crate::reaper::Reaper;
use crate::registry::InstanceRegistry;
use crate::router::Router;
use crate::runtime::ContainerRuntime;
use crate::session::SessionPool;
use crate::validator::CredentialValidator;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::watch;

/// Every shared component, built once at process start
pub struct Gateway {
    config: Config,
    lifecycle: Arc<LifecycleManager>,
    sessions: Arc<SessionPool>,
    router: Arc<Router>,
    diagnostics: Arc<Diagnostics>,
}

impl Gateway {
    pub fn build(
        config: Config,
        runtime: Arc<dyn ContainerRuntime>,
        validator: Arc<dyn CredentialValidator>,
    ) -> anyhow::Result<Self> {
        let registry = Arc::new(InstanceRegistry::new());
        let lifecycle = Arc::new(LifecycleManager::new(registry, runtime, config.instances.clone())?);
        let sessions = Arc::new(SessionPool::new());
        let pool = Arc::new(ConnectionPool::new(PoolConfig::from(&config.server)));

        let diagnostics = Arc::new(Diagnostics::new(
            Arc::clone(&lifecycle),
            Arc::clone(&sessions),
            pool.stats(),
        ));
        let router = Arc::new(Router::new(
            &config,
            validator,
            Arc::clone(&lifecycle),
            Arc::clone(&sessions),
            pool,
        )?);

        Ok(Self {
            config,
            lifecycle,
            sessions,
            router,
            diagnostics,
        })
    }

    pub fn lifecycle(&self) -> &Arc<LifecycleManager> {
        &self.lifecycle
    }

    pub fn sessions(&self) -> &Arc<SessionPool> {
        &self.sessions
    }

    pub fn diagnostics(&self) -> &Arc<Diagnostics> {
        &self.diagnostics
    }

    pub fn server(&self, bind_addr: SocketAddr, shutdown_rx: watch::Receiver<bool>) -> ProxyServer {
        ProxyServer::new(
            bind_addr,
            Arc::clone(&self.router),
            Arc::clone(&self.diagnostics),
            shutdown_rx,
        )
        .with_stats_token(self.config.server.stats_token.clone())
    }

    pub fn reaper(&self) -> Reaper {
        Reaper::new(
            Arc::clone(&self.lifecycle),
            Arc::clone(&self.sessions),
            self.config.instances.idle_timeout(),
            self.config.sessions.idle_timeout(),
            self.config.proxy.reaper_interval(),
        )
    }
}
