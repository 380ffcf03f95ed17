//! Periodic idle sweep
//!
//! Stops instances idle past the instance timeout and evicts sessions idle
//! past the session timeout. Runs on its own timer and is cancelled through
//! a watch channel, so tests can drive single sweeps without a server.

use crate::lifecycle::LifecycleManager;
use crate::registry::InstanceState;
use crate::session::SessionPool;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Outcome of one sweep
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    pub stopped: usize,
    pub failed: usize,
    pub sessions_evicted: usize,
}

pub struct Reaper {
    lifecycle: Arc<LifecycleManager>,
    sessions: Arc<SessionPool>,
    instance_idle: Duration,
    session_idle: Duration,
    interval: Duration,
}

impl Reaper {
    pub fn new(
        lifecycle: Arc<LifecycleManager>,
        sessions: Arc<SessionPool>,
        instance_idle: Duration,
        session_idle: Duration,
        interval: Duration,
    ) -> Self {
        Self {
            lifecycle,
            sessions,
            instance_idle,
            session_idle,
            interval,
        }
    }

    /// Start the sweep loop on its own task
    pub fn spawn(self, shutdown_rx: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown_rx))
    }

    pub async fn run(self, mut shutdown_rx: watch::Receiver<bool>) {
        info!(
            interval_secs = self.interval.as_secs(),
            idle_timeout_secs = self.instance_idle.as_secs(),
            session_idle_timeout_secs = self.session_idle.as_secs(),
            "Reaper started"
        );

        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {
                    self.sweep().await;
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Reaper shutting down");
                        break;
                    }
                }
            }
        }
    }

    pub async fn sweep(&self) -> SweepReport {
        self.sweep_at(Instant::now()).await
    }

    /// One pass over every running instance and every session, judged as of
    /// `now`. A failing tenant is logged and skipped.
    pub async fn sweep_at(&self, now: Instant) -> SweepReport {
        let mut report = SweepReport::default();

        let candidates: Vec<_> = self
            .lifecycle
            .registry()
            .snapshot()
            .into_iter()
            .filter(|r| r.state == InstanceState::Running && r.idle_for(now) > self.instance_idle)
            .map(|r| r.tenant_id)
            .collect();

        // Stops for different tenants run side by side
        let stops = candidates.iter().map(|tenant| async move {
            let result = self.lifecycle.mark_idle_stop(tenant, self.instance_idle, now).await;
            (tenant, result)
        });

        for (tenant, result) in futures::future::join_all(stops).await {
            match result {
                Ok(true) => report.stopped += 1,
                Ok(false) => debug!(tenant = %tenant, "Instance no longer idle, skipped"),
                Err(e) => {
                    report.failed += 1;
                    warn!(tenant = %tenant, error = %e, "Failed to stop idle instance");
                }
            }
        }

        let evicted = self.sessions.evict_idle_at(self.session_idle, now);
        report.sessions_evicted = evicted.len();

        if report != SweepReport::default() {
            info!(
                stopped = report.stopped,
                failed = report.failed,
                sessions_evicted = report.sessions_evicted,
                "Idle sweep finished"
            );
        }
        report
    }
}
