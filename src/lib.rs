//! Deploygate - an origin-validated reverse proxy with a deployment control plane
//!
//! This library provides:
//! - A reverse proxy to one fixed local upstream, gated by a TCP liveness probe
//! - Origin/Referer allow-listing with label-boundary subdomain matching
//! - Per-client sliding window rate limiting and CORS header injection
//! - A JSON control API that drives an external deployment CLI
//! - Optional supervision of the upstream process

pub mod config;
pub mod control;
pub mod cors;
pub mod deploy;
pub mod error;
pub mod forward;
pub mod origin;
pub mod probe;
pub mod proxy;
pub mod rate_limit;
pub mod supervisor;
pub mod transport;
