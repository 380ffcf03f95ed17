//! Session pool: one cached backend session token per tenant
//!
//! The backend protocol is stateful, callers are not. The router attaches
//! the cached token to each outbound request and stores whatever token the
//! backend hands back, so every tenant keeps talking to the same backend
//! session across independent requests.

use crate::tenant::TenantId;
use dashmap::DashMap;
use hyper::header::{HeaderMap, HeaderName, HeaderValue};
use hyper::Request;
use std::time::{Duration, Instant};
use tracing::debug;

#[derive(Debug, Clone)]
pub struct SessionRecord {
    pub tenant_id: TenantId,
    pub session_token: String,
    pub created_at: Instant,
    pub last_used_at: Instant,
}

/// In-memory token cache. No I/O.
#[derive(Default)]
pub struct SessionPool {
    sessions: DashMap<TenantId, SessionRecord>,
}

impl SessionPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, tenant: &TenantId) -> Option<String> {
        self.sessions.get(tenant).map(|s| s.session_token.clone())
    }

    /// Store the latest token for a tenant, replacing any previous one
    pub fn put(&self, tenant: &TenantId, token: &str) {
        let now = Instant::now();
        self.sessions
            .entry(tenant.clone())
            .and_modify(|record| {
                if record.session_token != token {
                    debug!(tenant = %tenant, "Backend issued a new session");
                    record.session_token = token.to_string();
                    record.created_at = now;
                }
                record.last_used_at = record.last_used_at.max(now);
            })
            .or_insert_with(|| {
                debug!(tenant = %tenant, "Backend session established");
                SessionRecord {
                    tenant_id: tenant.clone(),
                    session_token: token.to_string(),
                    created_at: now,
                    last_used_at: now,
                }
            });
    }

    /// Put back a token evicted on a false alarm, unless a newer one has
    /// been stored since
    pub fn restore(&self, tenant: &TenantId, token: &str) {
        let now = Instant::now();
        self.sessions
            .entry(tenant.clone())
            .or_insert_with(|| SessionRecord {
                tenant_id: tenant.clone(),
                session_token: token.to_string(),
                created_at: now,
                last_used_at: now,
            });
    }

    /// Drop the tenant's token. Evicting an absent token is a no-op.
    pub fn evict(&self, tenant: &TenantId) {
        if self.sessions.remove(tenant).is_some() {
            debug!(tenant = %tenant, "Session evicted");
        }
    }

    pub fn touch(&self, tenant: &TenantId) {
        if let Some(mut record) = self.sessions.get_mut(tenant) {
            record.last_used_at = record.last_used_at.max(Instant::now());
        }
    }

    /// Evict every session idle longer than `idle` as seen from `now`.
    /// The age is re-checked atomically with the removal, so a session used
    /// in the meantime survives.
    pub fn evict_idle_at(&self, idle: Duration, now: Instant) -> Vec<TenantId> {
        let candidates: Vec<TenantId> = self
            .sessions
            .iter()
            .filter(|entry| now.saturating_duration_since(entry.last_used_at) > idle)
            .map(|entry| entry.key().clone())
            .collect();

        candidates
            .into_iter()
            .filter(|tenant| {
                self.sessions
                    .remove_if(tenant, |_, record| {
                        now.saturating_duration_since(record.last_used_at) > idle
                    })
                    .is_some()
            })
            .collect()
    }

    pub fn contains(&self, tenant: &TenantId) -> bool {
        self.sessions.contains_key(tenant)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

/// Set the session header on an outbound request.
///
/// Any session header the caller sent is dropped first: callers never choose
/// the backend session. With no token the request leaves without one.
pub fn attach_session<B>(mut request: Request<B>, header: &HeaderName, token: Option<&str>) -> Request<B> {
    let headers = request.headers_mut();
    headers.remove(header);
    if let Some(value) = token.and_then(|t| HeaderValue::from_str(t).ok()) {
        headers.insert(header.clone(), value);
    }
    request
}

/// Session token carried by a backend response, if any
pub fn extract_session(headers: &HeaderMap, header: &HeaderName) -> Option<String> {
    headers
        .get(header)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}
