//! Multi-scope rate limiting for message admission
//!
//! Independent buckets per scope, consumed in a fixed order for every
//! message: global/minute, global/hour, client/minute, client/hour,
//! then method/minute and method/hour for methods with configured
//! limits. The first exhausted bucket short-circuits the decision;
//! buckets consumed before it are not rolled back — a cheap over-count
//! on the denial path.
//!
//! An exhausted bucket blocks for one full window. Idle buckets are
//! garbage collected after two windows without a touch.

use crate::config::{RateLimitingConfig, RateWindowConfig};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

const MINUTE: Duration = Duration::from_secs(60);
const HOUR: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RateDecision {
    Ok,
    /// `scope` names the bucket that denied admission.
    Throttled { scope: String },
}

impl RateDecision {
    pub fn is_ok(&self) -> bool {
        matches!(self, RateDecision::Ok)
    }
}

#[derive(Debug)]
struct RateBucket {
    capacity: u32,
    window: Duration,
    remaining: u32,
    window_start: Instant,
    blocked_until: Option<Instant>,
    last_touched: Instant,
}

impl RateBucket {
    fn new(capacity: u32, window: Duration) -> Self {
        let now = Instant::now();
        Self {
            capacity,
            window,
            remaining: capacity,
            window_start: now,
            blocked_until: None,
            last_touched: now,
        }
    }

    fn try_consume(&mut self) -> bool {
        let now = Instant::now();
        self.last_touched = now;
        if let Some(until) = self.blocked_until {
            if now < until {
                return false;
            }
            self.blocked_until = None;
            self.remaining = self.capacity;
            self.window_start = now;
        }
        if now.duration_since(self.window_start) >= self.window {
            self.remaining = self.capacity;
            self.window_start = now;
        }
        if self.remaining > 0 {
            self.remaining -= 1;
            true
        } else {
            // Block for a full window from the moment of exhaustion.
            self.blocked_until = Some(now + self.window);
            false
        }
    }

    fn idle_for(&self, now: Instant) -> Duration {
        now.duration_since(self.last_touched)
    }
}

/// Shared across all connections. The bucket map takes a short lock per
/// check; nothing awaits while holding it.
pub struct RateLimiter {
    enabled: bool,
    global: RateWindowConfig,
    per_client: RateWindowConfig,
    per_method: HashMap<String, RateWindowConfig>,
    buckets: Mutex<HashMap<String, RateBucket>>,
}

impl RateLimiter {
    pub fn new(config: &RateLimitingConfig) -> Self {
        Self {
            enabled: config.enabled,
            global: config.global,
            per_client: config.per_client,
            per_method: config.per_method.clone(),
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Admit or throttle one message.
    pub fn check(&self, connection_id: &str, method: Option<&str>) -> RateDecision {
        if !self.enabled {
            return RateDecision::Ok;
        }
        let mut plan: Vec<(String, u32, Duration)> = vec![
            ("global:minute".to_string(), self.global.requests_per_minute, MINUTE),
            ("global:hour".to_string(), self.global.requests_per_hour, HOUR),
            (
                format!("{connection_id}:minute"),
                self.per_client.requests_per_minute,
                MINUTE,
            ),
            (
                format!("{connection_id}:hour"),
                self.per_client.requests_per_hour,
                HOUR,
            ),
        ];
        if let Some(method) = method {
            if let Some(limits) = self.per_method.get(method) {
                plan.push((
                    format!("{connection_id}:{method}:minute"),
                    limits.requests_per_minute,
                    MINUTE,
                ));
                plan.push((
                    format!("{connection_id}:{method}:hour"),
                    limits.requests_per_hour,
                    HOUR,
                ));
            }
        }

        let mut buckets = self.buckets.lock().expect("rate limiter lock poisoned");
        for (key, capacity, window) in plan {
            // Zero capacity means the scope is unlimited.
            if capacity == 0 {
                continue;
            }
            let bucket = buckets
                .entry(key.clone())
                .or_insert_with(|| RateBucket::new(capacity, window));
            if !bucket.try_consume() {
                return RateDecision::Throttled { scope: key };
            }
        }
        RateDecision::Ok
    }

    /// Drop buckets idle for at least two full windows.
    pub fn gc(&self) -> usize {
        let now = Instant::now();
        let mut buckets = self.buckets.lock().expect("rate limiter lock poisoned");
        let before = buckets.len();
        buckets.retain(|_, b| b.idle_for(now) < b.window * 2);
        before - buckets.len()
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.lock().expect("rate limiter lock poisoned").len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RateLimitingConfig;

    fn limiter(per_client_minute: u32) -> RateLimiter {
        let config = RateLimitingConfig {
            enabled: true,
            global: RateWindowConfig { requests_per_minute: 1000, requests_per_hour: 0 },
            per_client: RateWindowConfig {
                requests_per_minute: per_client_minute,
                requests_per_hour: 0,
            },
            per_method: HashMap::new(),
        };
        RateLimiter::new(&config)
    }

    #[test]
    fn admissions_stop_at_capacity() {
        let limiter = limiter(2);
        assert!(limiter.check("conn-1", None).is_ok());
        assert!(limiter.check("conn-1", None).is_ok());
        let denied = limiter.check("conn-1", None);
        assert_eq!(denied, RateDecision::Throttled { scope: "conn-1:minute".to_string() });
    }

    #[test]
    fn connections_have_independent_buckets() {
        let limiter = limiter(1);
        assert!(limiter.check("conn-1", None).is_ok());
        assert!(!limiter.check("conn-1", None).is_ok());
        assert!(limiter.check("conn-2", None).is_ok());
    }

    #[test]
    fn method_scope_only_for_configured_methods() {
        let mut per_method = HashMap::new();
        per_method.insert(
            "tools/call".to_string(),
            RateWindowConfig { requests_per_minute: 1, requests_per_hour: 0 },
        );
        let config = RateLimitingConfig {
            enabled: true,
            global: RateWindowConfig { requests_per_minute: 1000, requests_per_hour: 0 },
            per_client: RateWindowConfig { requests_per_minute: 100, requests_per_hour: 0 },
            per_method,
        };
        let limiter = RateLimiter::new(&config);
        assert!(limiter.check("conn-1", Some("tools/call")).is_ok());
        let denied = limiter.check("conn-1", Some("tools/call"));
        assert_eq!(
            denied,
            RateDecision::Throttled { scope: "conn-1:tools/call:minute".to_string() }
        );
        // Unlisted methods only consume client + global scopes.
        for _ in 0..10 {
            assert!(limiter.check("conn-1", Some("other/method")).is_ok());
        }
    }

    #[test]
    fn disabled_limiter_admits_everything() {
        let config = RateLimitingConfig { enabled: false, ..RateLimitingConfig::default() };
        let limiter = RateLimiter::new(&config);
        for _ in 0..10_000 {
            assert!(limiter.check("conn-1", None).is_ok());
        }
        assert_eq!(limiter.bucket_count(), 0);
    }

    #[test]
    fn exhausted_bucket_blocks_for_a_window() {
        let limiter = limiter(1);
        assert!(limiter.check("conn-1", None).is_ok());
        assert!(!limiter.check("conn-1", None).is_ok());
        // Still blocked immediately after: blockDuration == window.
        assert!(!limiter.check("conn-1", None).is_ok());
    }

    #[test]
    fn gc_keeps_recent_buckets() {
        let limiter = limiter(5);
        limiter.check("conn-1", None);
        assert!(limiter.bucket_count() >= 2);
        assert_eq!(limiter.gc(), 0);
        assert!(limiter.bucket_count() >= 2);
    }
}
