use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::config::RateLimitRule;

pub const SCOPE_AGENTS_WRITE: &str = "marketplace:agents:write";
pub const SCOPE_AGENTS_READ: &str = "marketplace:agents:read";
pub const SCOPE_DISCOVER_READ: &str = "marketplace:discover:read";
pub const SCOPE_HIRES_WRITE: &str = "marketplace:hires:write";
pub const SCOPE_HIRES_READ: &str = "marketplace:hires:read";
pub const SCOPE_RUNS_WRITE: &str = "marketplace:runs:write";
pub const SCOPE_RUNS_READ: &str = "marketplace:runs:read";
pub const SCOPE_METRICS_READ: &str = "marketplace:metrics:read";

#[derive(Debug, Clone, Copy)]
struct Bucket {
    window_start: DateTime<Utc>,
    window_ms: i64,
    count: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateDecision {
    pub allowed: bool,
    pub retry_after_seconds: i64,
}

/// Fixed-window counters keyed by `{scope, actor}`.
///
/// All buckets share one mutex; the critical section is pure bookkeeping and
/// never spans I/O. Stale buckets are dropped whenever the map is scanned,
/// once they have sat idle for two full windows.
#[derive(Clone, Default)]
pub struct RateLimiter {
    buckets: Arc<Mutex<HashMap<String, Bucket>>>,
}

impl RateLimiter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn consume(
        &self,
        scope: &str,
        actor: &str,
        rule: RateLimitRule,
        now: DateTime<Utc>,
    ) -> RateDecision {
        let key = format!("{scope}:{actor}");

        let mut buckets = self.buckets.lock().await;
        buckets.retain(|_, bucket| {
            (now - bucket.window_start).num_milliseconds() < bucket.window_ms * 2
        });

        let bucket = buckets.entry(key).or_insert(Bucket {
            window_start: now,
            window_ms: rule.window_ms,
            count: 0,
        });

        let elapsed_ms = (now - bucket.window_start).num_milliseconds();
        if elapsed_ms >= rule.window_ms {
            bucket.window_start = now;
            bucket.window_ms = rule.window_ms;
            bucket.count = 0;
        }

        if bucket.count >= rule.limit {
            let remaining_ms = rule.window_ms - (now - bucket.window_start).num_milliseconds();
            let retry_after_seconds = ((remaining_ms + 999) / 1_000).max(1);
            return RateDecision {
                allowed: false,
                retry_after_seconds,
            };
        }

        bucket.count += 1;
        RateDecision {
            allowed: true,
            retry_after_seconds: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};

    use super::{RateLimiter, SCOPE_DISCOVER_READ};
    use crate::config::RateLimitRule;

    const RULE: RateLimitRule = RateLimitRule {
        limit: 2,
        window_ms: 60_000,
    };

    #[tokio::test]
    async fn denies_after_limit_and_reports_positive_retry_after() {
        let limiter = RateLimiter::new();
        let now = Utc::now();

        for _ in 0..RULE.limit {
            let decision = limiter
                .consume(SCOPE_DISCOVER_READ, "0xoperator", RULE, now)
                .await;
            assert!(decision.allowed);
        }

        let denied = limiter
            .consume(SCOPE_DISCOVER_READ, "0xoperator", RULE, now)
            .await;
        assert!(!denied.allowed);
        assert!(denied.retry_after_seconds > 0);
        assert!(denied.retry_after_seconds <= 60);
    }

    #[tokio::test]
    async fn window_elapse_grants_a_fresh_allowance() {
        let limiter = RateLimiter::new();
        let now = Utc::now();

        for _ in 0..=RULE.limit {
            limiter
                .consume(SCOPE_DISCOVER_READ, "0xoperator", RULE, now)
                .await;
        }

        let later = now + Duration::milliseconds(RULE.window_ms + 1);
        let decision = limiter
            .consume(SCOPE_DISCOVER_READ, "0xoperator", RULE, later)
            .await;
        assert!(decision.allowed);
    }

    #[tokio::test]
    async fn buckets_are_independent_per_actor_and_scope() {
        let limiter = RateLimiter::new();
        let now = Utc::now();

        for _ in 0..RULE.limit {
            limiter
                .consume(SCOPE_DISCOVER_READ, "0xoperator", RULE, now)
                .await;
        }
        let denied = limiter
            .consume(SCOPE_DISCOVER_READ, "0xoperator", RULE, now)
            .await;
        assert!(!denied.allowed);

        let other_actor = limiter
            .consume(SCOPE_DISCOVER_READ, "0xrival", RULE, now)
            .await;
        assert!(other_actor.allowed);

        let other_scope = limiter
            .consume("marketplace:agents:read", "0xoperator", RULE, now)
            .await;
        assert!(other_scope.allowed);
    }

    #[tokio::test]
    async fn idle_buckets_are_collected_after_two_windows() {
        let limiter = RateLimiter::new();
        let now = Utc::now();

        limiter
            .consume(SCOPE_DISCOVER_READ, "0xoperator", RULE, now)
            .await;
        assert_eq!(limiter.buckets.lock().await.len(), 1);

        let later = now + Duration::milliseconds(RULE.window_ms * 2 + 1);
        limiter
            .consume(SCOPE_DISCOVER_READ, "0xrival", RULE, later)
            .await;

        let buckets = limiter.buckets.lock().await;
        assert_eq!(buckets.len(), 1);
        assert!(buckets.keys().all(|key| key.ends_with("0xrival")));
    }
}
