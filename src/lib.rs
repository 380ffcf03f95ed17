//! Tenantgate - a multi-tenant gateway with one on-demand container per credential
//!
//! This library provides a reverse proxy that:
//! - Validates every request's credential against an identity service
//! - Creates a dedicated container per tenant on first use and restarts it on demand
//! - Stops containers after a period of inactivity
//! - Pools one backend session per tenant so callers can stay stateless
//! - Streams responses and relays upgrade connections without buffering

pub mod config;
pub mod diagnostics;
pub mod docker;
pub mod error;
pub mod gateway;
pub mod lifecycle;
pub mod pool;
pub mod ports;
pub mod proxy;
pub mod reaper;
pub mod registry;
pub mod router;
pub mod runtime;
pub mod session;
pub mod tenant;
pub mod validator;
