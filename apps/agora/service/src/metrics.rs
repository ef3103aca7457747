use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;

pub const METRIC_PROFILES_REGISTERED: &str = "profiles_registered";
pub const METRIC_PROFILES_UPDATED: &str = "profiles_updated";
pub const METRIC_ONCHAIN_REFRESHES: &str = "onchain_refreshes";
pub const METRIC_DISCOVERY_QUERIES: &str = "discovery_queries";
pub const METRIC_HIRES_CREATED: &str = "hires_created";
pub const METRIC_RUNS_CREATED: &str = "runs_created";
pub const METRIC_RUNS_COMPLETED: &str = "runs_completed";
pub const METRIC_RUNS_FAILED: &str = "runs_failed";
pub const METRIC_CHALLENGES_ISSUED: &str = "challenges_issued";
pub const METRIC_PAYMENTS_SETTLED: &str = "payments_settled";

/// Monotonic counters backing `/marketplace/metrics`.
#[derive(Clone, Default)]
pub struct RegistryMetrics {
    counters: Arc<Mutex<BTreeMap<&'static str, u64>>>,
}

impl RegistryMetrics {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn increment(&self, counter: &'static str) {
        let mut counters = self.counters.lock().await;
        *counters.entry(counter).or_insert(0) += 1;
    }

    pub async fn snapshot(&self) -> BTreeMap<&'static str, u64> {
        self.counters.lock().await.clone()
    }

    pub async fn value(&self, counter: &'static str) -> u64 {
        self.counters
            .lock()
            .await
            .get(counter)
            .copied()
            .unwrap_or(0)
    }
}

/// Registry freshness summary included in the metrics response.
#[derive(Debug, Clone, Serialize)]
pub struct FreshnessSnapshot {
    pub profiles_total: usize,
    pub profiles_active: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stalest_indexed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub freshest_indexed_at: Option<DateTime<Utc>>,
    pub generated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::{METRIC_DISCOVERY_QUERIES, METRIC_PROFILES_REGISTERED, RegistryMetrics};

    #[tokio::test]
    async fn counters_increment_independently() {
        let metrics = RegistryMetrics::new();

        metrics.increment(METRIC_PROFILES_REGISTERED).await;
        metrics.increment(METRIC_PROFILES_REGISTERED).await;
        metrics.increment(METRIC_DISCOVERY_QUERIES).await;

        assert_eq!(metrics.value(METRIC_PROFILES_REGISTERED).await, 2);
        assert_eq!(metrics.value(METRIC_DISCOVERY_QUERIES).await, 1);
        assert_eq!(metrics.value("never_touched").await, 0);

        let snapshot = metrics.snapshot().await;
        assert_eq!(snapshot.get(METRIC_PROFILES_REGISTERED), Some(&2));
    }
}
