//! Per-client sliding window rate limiting
//!
//! Each client keeps a log of request instants inside the current window.
//! A request is admitted when fewer than `limit` instants remain after
//! dropping the stale ones. Denied requests are not recorded.

use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::config::RateLimitConfig;

pub struct SlidingWindowLimiter {
    limit: usize,
    window: Duration,
    enabled: bool,
    clients: Mutex<HashMap<String, VecDeque<Instant>>>,
}

impl SlidingWindowLimiter {
    pub fn new(limit: usize, window: Duration) -> Self {
        Self {
            limit,
            window,
            enabled: limit > 0 && !window.is_zero(),
            clients: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_config(config: &RateLimitConfig) -> Self {
        let mut limiter = Self::new(config.count, config.window());
        limiter.enabled &= config.enabled;
        limiter
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Check and record a request from `client` at the current instant
    pub fn allow(&self, client: &str) -> bool {
        self.allow_at(client, Instant::now())
    }

    /// Check and record a request from `client` at `now`
    pub fn allow_at(&self, client: &str, now: Instant) -> bool {
        if !self.enabled {
            return true;
        }

        let mut clients = self.clients.lock();
        let log = clients.entry(client.to_string()).or_default();

        while let Some(&oldest) = log.front() {
            if now.saturating_duration_since(oldest) >= self.window {
                log.pop_front();
            } else {
                break;
            }
        }

        if log.len() < self.limit {
            log.push_back(now);
            debug!(client, used = log.len(), limit = self.limit, "Rate limit check passed");
            true
        } else {
            warn!(client, limit = self.limit, window_secs = self.window.as_secs(), "Rate limit exceeded");
            false
        }
    }

    /// Drop clients whose whole log has aged out of the window
    pub fn purge_idle(&self) -> usize {
        self.purge_idle_at(Instant::now())
    }

    pub fn purge_idle_at(&self, now: Instant) -> usize {
        let mut clients = self.clients.lock();
        let before = clients.len();
        clients.retain(|_, log| {
            log.back()
                .is_some_and(|&last| now.saturating_duration_since(last) < self.window)
        });
        let purged = before - clients.len();
        if purged > 0 {
            debug!(purged, remaining = clients.len(), "Purged idle rate limit entries");
        }
        purged
    }

    /// Number of clients currently holding a request log
    pub fn tracked_clients(&self) -> usize {
        self.clients.lock().len()
    }
}
