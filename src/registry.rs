//! In-memory instance registry: the single source of truth for lifecycle state

use crate::tenant::TenantId;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::{Mutex, MutexGuard};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// Lifecycle state of a tenant instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceState {
    /// No container; the next request creates one
    Absent,
    /// Container being created and waited on
    Creating,
    /// Container up and accepting traffic
    Running,
    /// Idle stop in progress
    Stopping,
    /// Container exists but is not running; keeps its port
    Stopped,
    /// Reclaimed out of band; reset to Absent right away
    Removed,
}

impl InstanceState {
    pub const ALL: [InstanceState; 6] = [
        InstanceState::Absent,
        InstanceState::Creating,
        InstanceState::Running,
        InstanceState::Stopping,
        InstanceState::Stopped,
        InstanceState::Removed,
    ];

    /// Whether `self -> next` is an edge of the lifecycle state machine
    pub fn can_transition_to(self, next: InstanceState) -> bool {
        use InstanceState::*;
        matches!(
            (self, next),
            (Absent, Creating)
                | (Creating, Running)
                | (Creating, Absent)
                | (Running, Stopping)
                | (Running, Stopped)
                | (Stopping, Stopped)
                | (Stopped, Running)
                | (Stopped, Removed)
                | (Removed, Absent)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            InstanceState::Absent => "absent",
            InstanceState::Creating => "creating",
            InstanceState::Running => "running",
            InstanceState::Stopping => "stopping",
            InstanceState::Stopped => "stopped",
            InstanceState::Removed => "removed",
        }
    }
}

impl std::fmt::Display for InstanceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("invalid transition {from} -> {to} for tenant {tenant}")]
pub struct TransitionError {
    pub tenant: TenantId,
    pub from: InstanceState,
    pub to: InstanceState,
}

/// Bookkeeping for one tenant
#[derive(Debug, Clone)]
pub struct InstanceRecord {
    pub tenant_id: TenantId,
    /// Host port; kept across stop/start, released when the record returns to Absent
    pub assigned_port: Option<u16>,
    pub state: InstanceState,
    pub created_at: Instant,
    /// Never moves backwards while the record exists
    pub last_used_at: Instant,
    pub created_wall: DateTime<Utc>,
    pub last_used_wall: DateTime<Utc>,
    /// Consecutive failed creates/starts
    pub start_failures: u32,
    /// Fail fast until this instant after too many failed starts
    pub cooldown_until: Option<Instant>,
}

impl InstanceRecord {
    fn new(tenant_id: TenantId) -> Self {
        let now = Instant::now();
        let wall = Utc::now();
        Self {
            tenant_id,
            assigned_port: None,
            state: InstanceState::Absent,
            created_at: now,
            last_used_at: now,
            created_wall: wall,
            last_used_wall: wall,
            start_failures: 0,
            cooldown_until: None,
        }
    }

    /// Time since last use as seen from `now` (zero if used after `now`)
    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_used_at)
    }

    fn touch_at(&mut self, at: Instant) {
        if at > self.last_used_at {
            let delta = at - self.last_used_at;
            self.last_used_at = at;
            self.last_used_wall += chrono::Duration::from_std(delta).unwrap_or_else(|_| chrono::Duration::zero());
        }
    }
}

/// Registry entry: a lifecycle lock plus the record it guards.
///
/// The async `lifecycle` lock serialises create/start/stop for the tenant and
/// may be held across runtime calls. The inner `record` mutex is only held for
/// short synchronous reads and updates, so readers never wait on a slow
/// lifecycle operation.
pub struct TenantSlot {
    lifecycle: tokio::sync::Mutex<()>,
    record: Mutex<InstanceRecord>,
    /// Responses and upgraded connections still being relayed
    open_streams: AtomicUsize,
}

impl TenantSlot {
    fn new(tenant_id: TenantId) -> Self {
        Self {
            lifecycle: tokio::sync::Mutex::new(()),
            record: Mutex::new(InstanceRecord::new(tenant_id)),
            open_streams: AtomicUsize::new(0),
        }
    }

    /// Count a relayed stream as activity until the guard is dropped
    pub fn open_stream(self: &Arc<Self>) -> StreamGuard {
        self.open_streams.fetch_add(1, Ordering::SeqCst);
        StreamGuard { slot: Arc::clone(self) }
    }

    pub fn open_streams(&self) -> usize {
        self.open_streams.load(Ordering::SeqCst)
    }

    /// Acquire the per-tenant lifecycle lock
    pub async fn lock_lifecycle(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.lifecycle.lock().await
    }

    /// Acquire the lifecycle lock only if nobody holds it
    pub fn try_lock_lifecycle(&self) -> Option<tokio::sync::MutexGuard<'_, ()>> {
        self.lifecycle.try_lock().ok()
    }

    pub fn record(&self) -> MutexGuard<'_, InstanceRecord> {
        self.record.lock()
    }

    pub fn snapshot(&self) -> InstanceRecord {
        self.record.lock().clone()
    }

    pub fn state(&self) -> InstanceState {
        self.record.lock().state
    }

    /// Move along a state machine edge
    pub fn transition(&self, next: InstanceState) -> Result<(), TransitionError> {
        let mut record = self.record.lock();
        apply_transition(&mut record, next)
    }

    /// Running -> Stopping, only if the instance has been idle longer than `idle`
    /// as seen from `now`. The check and the transition happen atomically.
    pub fn begin_idle_stop(&self, idle: Duration, now: Instant) -> bool {
        let mut record = self.record.lock();
        if record.state != InstanceState::Running || record.idle_for(now) <= idle {
            return false;
        }
        if self.open_streams() > 0 {
            return false;
        }
        apply_transition(&mut record, InstanceState::Stopping).is_ok()
    }

    pub fn set_port(&self, port: u16) {
        self.record.lock().assigned_port = Some(port);
    }

    /// Creating -> Running on `port`, starting a fresh record lifetime
    pub fn mark_created(&self, port: u16) -> Result<(), TransitionError> {
        let mut record = self.record.lock();
        apply_transition(&mut record, InstanceState::Running)?;
        record.assigned_port = Some(port);
        record.touch_at(Instant::now());
        Ok(())
    }

    /// Return to Absent from Creating or Removed, handing back the port that was held
    pub fn reset_absent(&self) -> Result<Option<u16>, TransitionError> {
        let mut record = self.record.lock();
        apply_transition(&mut record, InstanceState::Absent)?;
        Ok(record.assigned_port.take())
    }

    pub fn touch_at(&self, at: Instant) {
        self.record.lock().touch_at(at);
    }

    pub fn record_start_success(&self) {
        let mut record = self.record.lock();
        record.start_failures = 0;
        record.cooldown_until = None;
    }

    /// Count a failed start; trips the cooldown once `max_failures` is reached
    pub fn record_start_failure(&self, max_failures: u32, cooldown: Duration) -> u32 {
        let mut record = self.record.lock();
        record.start_failures = record.start_failures.saturating_add(1);
        if record.start_failures >= max_failures {
            record.cooldown_until = Some(Instant::now() + cooldown);
        }
        record.start_failures
    }

    /// Remaining cooldown, if the tenant is currently failing fast
    pub fn cooldown_remaining(&self, now: Instant) -> Option<Duration> {
        self.record
            .lock()
            .cooldown_until
            .filter(|until| *until > now)
            .map(|until| until - now)
    }
}

/// Held for the life of a relayed response body or upgraded connection.
/// Keeps the instance from being judged idle and refreshes its last use.
pub struct StreamGuard {
    slot: Arc<TenantSlot>,
}

impl StreamGuard {
    pub fn touch(&self) {
        self.slot.touch_at(Instant::now());
    }
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        self.slot.touch_at(Instant::now());
        self.slot.open_streams.fetch_sub(1, Ordering::SeqCst);
    }
}

fn apply_transition(record: &mut InstanceRecord, next: InstanceState) -> Result<(), TransitionError> {
    if !record.state.can_transition_to(next) {
        return Err(TransitionError {
            tenant: record.tenant_id.clone(),
            from: record.state,
            to: next,
        });
    }
    debug!(tenant = %record.tenant_id, from = %record.state, to = %next, "Instance state transition");
    if next == InstanceState::Creating {
        record.created_at = Instant::now();
        record.created_wall = Utc::now();
    }
    record.state = next;
    Ok(())
}

/// Map from tenant to slot. At most one slot exists per tenant.
#[derive(Default)]
pub struct InstanceRegistry {
    slots: DashMap<TenantId, Arc<TenantSlot>>,
}

impl InstanceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the slot for a tenant, inserting an Absent record on first sight
    pub fn slot(&self, tenant: &TenantId) -> Arc<TenantSlot> {
        if let Some(slot) = self.slots.get(tenant) {
            return Arc::clone(slot.value());
        }
        let slot = self
            .slots
            .entry(tenant.clone())
            .or_insert_with(|| Arc::new(TenantSlot::new(tenant.clone())));
        Arc::clone(slot.value())
    }

    /// Get the slot only if the tenant has been seen before
    pub fn existing_slot(&self, tenant: &TenantId) -> Option<Arc<TenantSlot>> {
        self.slots.get(tenant).map(|s| Arc::clone(s.value()))
    }

    pub fn get(&self, tenant: &TenantId) -> Option<InstanceRecord> {
        self.slots.get(tenant).map(|s| s.snapshot())
    }

    pub fn state(&self, tenant: &TenantId) -> InstanceState {
        self.slots
            .get(tenant)
            .map(|s| s.state())
            .unwrap_or(InstanceState::Absent)
    }

    /// Steady-state fast path: if Running, bump `last_used_at` and return the port.
    ///
    /// Takes no lifecycle lock. The check and the bump share one short critical
    /// section with [`TenantSlot::begin_idle_stop`], so an instance handed out
    /// here is never judged idle by a sweep that started earlier.
    pub fn claim_running(&self, tenant: &TenantId) -> Option<u16> {
        let slot = self.slots.get(tenant)?;
        let mut record = slot.record();
        if record.state != InstanceState::Running {
            return None;
        }
        record.touch_at(Instant::now());
        record.assigned_port
    }

    pub fn touch(&self, tenant: &TenantId) {
        self.touch_at(tenant, Instant::now());
    }

    pub fn touch_at(&self, tenant: &TenantId, at: Instant) {
        if let Some(slot) = self.slots.get(tenant) {
            slot.touch_at(at);
        }
    }

    /// Tenants currently in `state`
    pub fn tenants_in(&self, state: InstanceState) -> Vec<TenantId> {
        self.slots
            .iter()
            .filter(|entry| entry.value().state() == state)
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Best-effort copy of every record. Never waits on a lifecycle lock.
    pub fn snapshot(&self) -> Vec<InstanceRecord> {
        self.slots.iter().map(|entry| entry.value().snapshot()).collect()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tenant(name: &str) -> TenantId {
        TenantId::from_credential(name)
    }

    #[test]
    fn test_state_machine_edges() {
        use InstanceState::*;
        assert!(Absent.can_transition_to(Creating));
        assert!(Creating.can_transition_to(Running));
        assert!(Creating.can_transition_to(Absent));
        assert!(Running.can_transition_to(Stopping));
        assert!(Stopping.can_transition_to(Stopped));
        assert!(Stopped.can_transition_to(Running));
        assert!(Running.can_transition_to(Stopped));
        assert!(Stopped.can_transition_to(Removed));
        assert!(Removed.can_transition_to(Absent));

        assert!(!Absent.can_transition_to(Running));
        assert!(!Running.can_transition_to(Creating));
        assert!(!Stopped.can_transition_to(Creating));
        assert!(!Running.can_transition_to(Absent));
        assert!(!Removed.can_transition_to(Running));
    }

    #[test]
    fn test_slot_is_unique_per_tenant() {
        let registry = InstanceRegistry::new();
        let a = registry.slot(&tenant("a"));
        let a2 = registry.slot(&tenant("a"));
        let _b = registry.slot(&tenant("b"));

        assert!(Arc::ptr_eq(&a, &a2));
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.state(&tenant("a")), InstanceState::Absent);
        assert_eq!(registry.state(&tenant("unknown")), InstanceState::Absent);
        assert!(registry.get(&tenant("unknown")).is_none());
    }

    #[test]
    fn test_invalid_transition_is_rejected() {
        let registry = InstanceRegistry::new();
        let slot = registry.slot(&tenant("a"));

        let err = slot.transition(InstanceState::Running).unwrap_err();
        assert_eq!(err.from, InstanceState::Absent);
        assert_eq!(err.to, InstanceState::Running);
        assert_eq!(slot.state(), InstanceState::Absent);
    }

    #[test]
    fn test_create_and_reset_round() {
        let registry = InstanceRegistry::new();
        let t = tenant("a");
        let slot = registry.slot(&t);

        slot.transition(InstanceState::Creating).unwrap();
        slot.set_port(4000);
        assert_eq!(registry.claim_running(&t), None);

        assert_eq!(slot.reset_absent().unwrap(), Some(4000));
        assert_eq!(slot.snapshot().assigned_port, None);

        slot.transition(InstanceState::Creating).unwrap();
        slot.mark_created(4001).unwrap();
        assert_eq!(registry.claim_running(&t), Some(4001));
        assert_eq!(registry.tenants_in(InstanceState::Running), vec![t]);
    }

    #[test]
    fn test_last_used_is_monotonic() {
        let registry = InstanceRegistry::new();
        let t = tenant("a");
        let slot = registry.slot(&t);

        let later = Instant::now() + Duration::from_secs(60);
        registry.touch_at(&t, later);
        registry.touch_at(&t, later - Duration::from_secs(30));
        registry.touch(&t);

        assert_eq!(slot.snapshot().last_used_at, later);
    }

    #[test]
    fn test_begin_idle_stop_rechecks_idleness() {
        let registry = InstanceRegistry::new();
        let t = tenant("a");
        let slot = registry.slot(&t);
        slot.transition(InstanceState::Creating).unwrap();
        slot.mark_created(4000).unwrap();

        let used = slot.snapshot().last_used_at;
        let idle = Duration::from_secs(900);

        assert!(!slot.begin_idle_stop(idle, used + idle - Duration::from_secs(1)));
        assert_eq!(slot.state(), InstanceState::Running);

        assert!(slot.begin_idle_stop(idle, used + idle + Duration::from_secs(1)));
        assert_eq!(slot.state(), InstanceState::Stopping);

        // No longer Running, so a second sweep does nothing
        assert!(!slot.begin_idle_stop(idle, used + idle * 2));
    }

    #[test]
    fn test_start_failure_cooldown() {
        let registry = InstanceRegistry::new();
        let slot = registry.slot(&tenant("a"));
        let cooldown = Duration::from_secs(60);

        assert_eq!(slot.record_start_failure(3, cooldown), 1);
        assert_eq!(slot.record_start_failure(3, cooldown), 2);
        assert!(slot.cooldown_remaining(Instant::now()).is_none());

        assert_eq!(slot.record_start_failure(3, cooldown), 3);
        assert!(slot.cooldown_remaining(Instant::now()).is_some());
        assert!(slot
            .cooldown_remaining(Instant::now() + cooldown + Duration::from_secs(1))
            .is_none());

        slot.record_start_success();
        assert!(slot.cooldown_remaining(Instant::now()).is_none());
        assert_eq!(slot.snapshot().start_failures, 0);
    }

    #[tokio::test]
    async fn test_try_lock_lifecycle_when_busy() {
        let registry = InstanceRegistry::new();
        let slot = registry.slot(&tenant("a"));

        let guard = slot.lock_lifecycle().await;
        assert!(slot.try_lock_lifecycle().is_none());
        drop(guard);
        assert!(slot.try_lock_lifecycle().is_some());
    }

    #[test]
    fn test_open_stream_blocks_idle_stop() {
        let registry = InstanceRegistry::new();
        let t = tenant("a");
        let slot = registry.slot(&t);
        slot.transition(InstanceState::Creating).unwrap();
        slot.mark_created(4000).unwrap();

        let later = Instant::now() + Duration::from_secs(3600);
        let guard = slot.open_stream();
        assert_eq!(slot.open_streams(), 1);
        assert!(!slot.begin_idle_stop(Duration::from_secs(60), later));
        assert_eq!(slot.state(), InstanceState::Running);

        drop(guard);
        assert_eq!(slot.open_streams(), 0);
        assert!(slot.begin_idle_stop(Duration::from_secs(60), later));
        assert_eq!(slot.state(), InstanceState::Stopping);
    }
}
