//! Sliding-window rate limiter.
//!
//! Best-effort by design: two concurrent requests may both pass
//! `check_limit` before either records usage. The router consults it per
//! failover candidate and records usage only on successful attempts.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use crate::models::RateLimitInfo;

#[derive(Debug, Clone, Copy)]
struct LimitConfig {
    limit: u64,
    window: Duration,
}

#[derive(Debug)]
struct Usage {
    /// (timestamp, cost) entries inside the current window, oldest first.
    entries: VecDeque<(Instant, u64)>,
}

impl Usage {
    fn new() -> Self {
        Self {
            entries: VecDeque::new(),
        }
    }

    /// Drop entries older than `window`. Pruning is lazy; it happens on
    /// check and record, never on a timer.
    fn prune(&mut self, now: Instant, window: Duration) {
        while let Some((at, _)) = self.entries.front() {
            if now.duration_since(*at) >= window {
                self.entries.pop_front();
            } else {
                break;
            }
        }
    }

    fn total(&self) -> u64 {
        self.entries.iter().map(|(_, cost)| cost).sum()
    }
}

#[derive(Debug)]
struct Inner {
    limits: HashMap<String, LimitConfig>,
    usage: HashMap<String, Usage>,
}

/// Tracks a sliding usage window per key. Shared across concurrently
/// executing requests; all access goes through one mutex.
#[derive(Debug)]
pub struct RateLimiter {
    inner: Mutex<Inner>,
    /// Applied to keys without an explicit `set_limit`. `None` means
    /// unconfigured keys are unlimited.
    default_limit: Option<LimitConfig>,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

impl RateLimiter {
    /// Limiter where keys are unlimited until `set_limit` is called.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                limits: HashMap::new(),
                usage: HashMap::new(),
            }),
            default_limit: None,
        }
    }

    /// Limiter applying `limit` per `window` to every key by default.
    pub fn with_default_limit(limit: u64, window: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner {
                limits: HashMap::new(),
                usage: HashMap::new(),
            }),
            default_limit: Some(LimitConfig { limit, window }),
        }
    }

    fn config_for(&self, inner: &Inner, key: &str) -> Option<LimitConfig> {
        inner.limits.get(key).copied().or(self.default_limit)
    }

    /// Check whether `key` is currently limited. Prunes expired entries as
    /// a side effect.
    pub fn check_limit(&self, key: &str) -> RateLimitInfo {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let Some(cfg) = self.config_for(&inner, key) else {
            return RateLimitInfo::unlimited();
        };

        let now = Instant::now();
        let usage = inner.usage.entry(key.to_string()).or_insert_with(Usage::new);
        usage.prune(now, cfg.window);

        let used = usage.total();
        let reset_at = usage.entries.front().map(|(oldest, _)| {
            let elapsed = now.duration_since(*oldest);
            let until_reset = cfg.window.saturating_sub(elapsed);
            unix_now().saturating_add(until_reset.as_secs())
        });

        RateLimitInfo {
            is_limited: used >= cfg.limit,
            remaining: Some(cfg.limit.saturating_sub(used)),
            reset_at,
            limit: Some(cfg.limit),
            time_window: Some(cfg.window.as_secs()),
        }
    }

    /// Record `cost` units of usage against `key`. No-op for keys without
    /// a configured or default limit, so unlimited keys never accumulate
    /// entries that nothing would ever prune.
    pub fn record_usage(&self, key: &str, cost: u64) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let Some(cfg) = self.config_for(&inner, key) else {
            return;
        };

        let now = Instant::now();
        let usage = inner.usage.entry(key.to_string()).or_insert_with(Usage::new);
        usage.prune(now, cfg.window);
        usage.entries.push_back((now, cost));
    }

    /// Configure (or replace) the limit for `key`.
    pub fn set_limit(&self, key: &str, limit: u64, window: Duration) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner
            .limits
            .insert(key.to_string(), LimitConfig { limit, window });
    }

    /// Forget all recorded usage for `key`. The configured limit stays.
    pub fn reset(&self, key: &str) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.usage.remove(key);
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
