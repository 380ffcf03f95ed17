//! Read-only health and stats snapshots
//!
//! Built from registry snapshots only; never waits on a lifecycle lock, so
//! the numbers may be a moment stale.

use crate::lifecycle::LifecycleManager;
use crate::pool::PoolStats;
use crate::registry::{InstanceRecord, InstanceState};
use crate::session::SessionPool;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::warn;

/// Bound on the runtime ping behind /health
const PING_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Serialize)]
pub struct HealthReport {
    /// "ok", or "degraded" when the container runtime does not answer
    pub status: &'static str,
    pub tracked_count: usize,
    pub running_count: usize,
}

impl HealthReport {
    pub fn is_healthy(&self) -> bool {
        self.status == "ok"
    }
}

#[derive(Debug, Serialize)]
pub struct InstanceSummary {
    pub tenant_id: String,
    pub container: String,
    pub state: InstanceState,
    pub port: Option<u16>,
    pub created_at: String,
    pub last_used_at: String,
    pub age_secs: u64,
    pub idle_secs: u64,
    pub has_session: bool,
    pub start_failures: u32,
}

#[derive(Debug, Serialize)]
pub struct StatsReport {
    pub tracked_count: usize,
    pub counts: BTreeMap<&'static str, usize>,
    pub sessions: usize,
    pub ports_allocated: usize,
    pub ports_capacity: usize,
    pub requests: u64,
    pub session_retries: u64,
    pub connect_failures: u64,
    pub instances: Vec<InstanceSummary>,
}

pub struct Diagnostics {
    lifecycle: Arc<LifecycleManager>,
    sessions: Arc<SessionPool>,
    pool_stats: Arc<PoolStats>,
}

impl Diagnostics {
    pub fn new(lifecycle: Arc<LifecycleManager>, sessions: Arc<SessionPool>, pool_stats: Arc<PoolStats>) -> Self {
        Self {
            lifecycle,
            sessions,
            pool_stats,
        }
    }

    pub async fn health(&self) -> HealthReport {
        let records = self.lifecycle.registry().snapshot();
        let counts = count_states(&records);

        let runtime_ok = match tokio::time::timeout(PING_TIMEOUT, self.lifecycle.runtime().ping()).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                warn!(error = %e, "Container runtime ping failed");
                false
            }
            Err(_) => {
                warn!("Container runtime ping timed out");
                false
            }
        };

        HealthReport {
            status: if runtime_ok { "ok" } else { "degraded" },
            tracked_count: tracked(&counts),
            running_count: counts.get(InstanceState::Running.as_str()).copied().unwrap_or(0),
        }
    }

    pub fn stats(&self) -> StatsReport {
        self.stats_at(Instant::now())
    }

    pub fn stats_at(&self, now: Instant) -> StatsReport {
        let mut records = self.lifecycle.registry().snapshot();
        records.sort_by(|a, b| a.tenant_id.cmp(&b.tenant_id));
        let counts = count_states(&records);
        let prefix = &self.lifecycle.config().name_prefix;

        let instances = records
            .iter()
            .filter(|r| r.state != InstanceState::Absent)
            .map(|r| InstanceSummary {
                tenant_id: r.tenant_id.as_str().to_string(),
                container: r.tenant_id.container_name(prefix),
                state: r.state,
                port: r.assigned_port,
                created_at: r.created_wall.to_rfc3339(),
                last_used_at: r.last_used_wall.to_rfc3339(),
                age_secs: now.saturating_duration_since(r.created_at).as_secs(),
                idle_secs: r.idle_for(now).as_secs(),
                has_session: self.sessions.contains(&r.tenant_id),
                start_failures: r.start_failures,
            })
            .collect();

        StatsReport {
            tracked_count: tracked(&counts),
            counts,
            sessions: self.sessions.len(),
            ports_allocated: self.lifecycle.ports().allocated_count(),
            ports_capacity: self.lifecycle.ports().capacity(),
            requests: self.pool_stats.get_total_requests(),
            session_retries: self.pool_stats.get_session_retries(),
            connect_failures: self.pool_stats.get_connect_failures(),
            instances,
        }
    }
}

/// Count per state, every state present even at zero
fn count_states(records: &[InstanceRecord]) -> BTreeMap<&'static str, usize> {
    let mut counts: BTreeMap<&'static str, usize> =
        InstanceState::ALL.iter().map(|s| (s.as_str(), 0)).collect();
    for record in records {
        *counts.entry(record.state.as_str()).or_default() += 1;
    }
    counts
}

/// Tenants with an instance in some state other than Absent
fn tracked(counts: &BTreeMap<&'static str, usize>) -> usize {
    counts
        .iter()
        .filter(|(state, _)| **state != InstanceState::Absent.as_str())
        .map(|(_, n)| n)
        .sum()
}
