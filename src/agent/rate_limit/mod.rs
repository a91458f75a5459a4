use crate::config::{RateLimitConfig, RateLimitScope};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const GLOBAL_KEY: &str = "__global__";

/// Outcome of an admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitDecision {
    pub allowed: bool,
    /// Requests still available in the current window.
    pub remaining: u32,
    /// Time until the current window closes.
    pub reset_in: Duration,
}

#[derive(Debug, Clone)]
struct RateLimitEntry {
    window_start: Instant,
    count: u32,
}

/// Limits that may change on config reload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Limits {
    enabled: bool,
    scope: RateLimitScope,
    window: Duration,
    max_requests: u32,
}

impl From<&RateLimitConfig> for Limits {
    fn from(c: &RateLimitConfig) -> Self {
        Self {
            enabled: c.enabled,
            scope: c.scope,
            window: Duration::from_millis(c.window_ms),
            max_requests: c.max_requests,
        }
    }
}

/// Windowed admission control keyed by participant (or one global key).
///
/// Each key's window opens on its first request and admits `max_requests`
/// until `window` has elapsed. Entries for elapsed windows are dropped by
/// [`RateLimiter::sweep`].
pub struct RateLimiter {
    limits: Mutex<Limits>,
    entries: Mutex<HashMap<String, RateLimitEntry>>,
}

impl RateLimiter {
    pub fn new(config: &RateLimitConfig) -> Self {
        Self {
            limits: Mutex::new(Limits::from(config)),
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn limits(&self) -> Limits {
        match self.limits.lock() {
            Ok(l) => *l,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    /// Map a participant to the counter key for the configured scope.
    pub fn key_for(&self, participant_id: &str) -> String {
        match self.limits().scope {
            RateLimitScope::Participant => participant_id.to_string(),
            RateLimitScope::Global => GLOBAL_KEY.to_string(),
        }
    }

    /// Count one request against `key`.
    pub fn check(&self, key: &str) -> RateLimitDecision {
        let limits = self.limits();
        if !limits.enabled {
            return RateLimitDecision {
                allowed: true,
                remaining: limits.max_requests,
                reset_in: Duration::ZERO,
            };
        }

        let now = Instant::now();
        let mut entries = match self.entries.lock() {
            Ok(e) => e,
            Err(poisoned) => {
                warn!("rate limiter entries mutex poisoned, recovering");
                poisoned.into_inner()
            }
        };
        let entry = entries
            .entry(key.to_string())
            .or_insert(RateLimitEntry {
                window_start: now,
                count: 0,
            });

        if now.duration_since(entry.window_start) >= limits.window {
            entry.window_start = now;
            entry.count = 0;
        }
        let reset_in = limits
            .window
            .saturating_sub(now.duration_since(entry.window_start));

        if entry.count < limits.max_requests {
            entry.count += 1;
            RateLimitDecision {
                allowed: true,
                remaining: limits.max_requests - entry.count,
                reset_in,
            }
        } else {
            debug!(key = %key, "rate limit exceeded, resets in {:?}", reset_in);
            RateLimitDecision {
                allowed: false,
                remaining: 0,
                reset_in,
            }
        }
    }

    /// Hot-reload thresholds. Counts for windows still open are kept and
    /// judged against the new limits. Returns whether anything changed.
    pub fn update_limits(&self, config: &RateLimitConfig) -> bool {
        let new = Limits::from(config);
        let Ok(mut limits) = self.limits.lock() else {
            warn!("rate limiter limits mutex poisoned, skipping hot-reload");
            return false;
        };
        if *limits == new {
            return false;
        }
        if limits.window != new.window || limits.max_requests != new.max_requests {
            info!(
                "rate limit updated: {} per {:?} -> {} per {:?}",
                limits.max_requests, limits.window, new.max_requests, new.window
            );
        }
        if limits.enabled != new.enabled {
            info!("rate limiting {}", if new.enabled { "enabled" } else { "disabled" });
        }
        if limits.scope != new.scope {
            info!("rate limit scope changed to {:?}", new.scope);
        }
        *limits = new;
        true
    }

    /// Drop entries whose window has fully elapsed. Returns the number evicted.
    pub fn sweep(&self) -> usize {
        let window = self.limits().window;
        let now = Instant::now();
        let Ok(mut entries) = self.entries.lock() else {
            return 0;
        };
        let before = entries.len();
        entries.retain(|_, e| now.duration_since(e.window_start) < window);
        let evicted = before - entries.len();
        if evicted > 0 {
            debug!("rate limiter swept {} expired entries", evicted);
        }
        evicted
    }

    pub fn tracked_keys(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    /// Run [`RateLimiter::sweep`] every `interval` until the handle is aborted.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let limiter = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(limiter) = limiter.upgrade() else {
                    break;
                };
                limiter.sweep();
            }
        })
    }
}

#[cfg(test)]
mod tests;
