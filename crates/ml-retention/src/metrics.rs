//! Hit/miss accounting and the append-only performance metrics series.

use crate::backend::memory::MemoryStore;
use crate::backend::MetricsSink;
use crate::clock::{Clock, SystemClock};
use crate::error::Result;
use crate::health::{StorageGuard, StorageHealth};
use chrono::{DateTime, Utc};
use ml_retention_db::{DailyMetricAggregate, MetricType, NewMetric, Tier};
use serde::Serialize;
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use ts_rs::TS;

#[derive(Debug, Default)]
struct TierCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    time_saved_us: AtomicU64,
    total_hits: AtomicU64,
    total_misses: AtomicU64,
    total_time_saved_us: AtomicU64,
}

/// Cumulative in-process hit rate of one tier
#[derive(Debug, Clone, PartialEq, Serialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export, export_to = "bindings/")]
pub struct TierHitRate {
    pub tier: Tier,
    pub hits: u64,
    pub misses: u64,
    pub hit_ratio: f64,
    pub time_saved_ms: f64,
}

pub struct MetricsRecorder {
    sink: Arc<dyn MetricsSink>,
    clock: Arc<dyn Clock>,
    guard: StorageGuard,
    counters: HashMap<Tier, TierCounters>,
}

fn to_micros(ms: f64) -> u64 {
    if ms.is_finite() && ms > 0.0 {
        (ms * 1000.0).round() as u64
    } else {
        0
    }
}

impl MetricsRecorder {
    pub fn new(sink: Arc<dyn MetricsSink>, clock: Arc<dyn Clock>, guard: StorageGuard) -> Self {
        let counters = Tier::ALL
            .iter()
            .map(|tier| (*tier, TierCounters::default()))
            .collect();
        Self {
            sink,
            clock,
            guard,
            counters,
        }
    }

    /// A recorder writing into its own in-memory sink
    pub fn detached() -> Self {
        let guard = StorageGuard::new(Duration::from_secs(5), Arc::new(StorageHealth::new(3)));
        Self::new(Arc::new(MemoryStore::new()), Arc::new(SystemClock), guard)
    }

    fn counters(&self, tier: Tier) -> Option<&TierCounters> {
        self.counters.get(&tier)
    }

    pub fn record_hit(&self, tier: Tier) {
        if let Some(c) = self.counters(tier) {
            c.hits.fetch_add(1, Ordering::Relaxed);
            c.total_hits.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_miss(&self, tier: Tier) {
        if let Some(c) = self.counters(tier) {
            c.misses.fetch_add(1, Ordering::Relaxed);
            c.total_misses.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_time_saved(&self, tier: Tier, ms: f64) {
        let us = to_micros(ms);
        if let Some(c) = self.counters(tier) {
            c.time_saved_us.fetch_add(us, Ordering::Relaxed);
            c.total_time_saved_us.fetch_add(us, Ordering::Relaxed);
        }
    }

    async fn append(&self, metric: NewMetric) {
        let metric_type = metric.metric_type;
        if let Err(e) = self
            .guard
            .run("metrics_append", self.sink.append(&metric))
            .await
        {
            warn!(metric = %metric_type, error = %e, "Failed to record metric");
        }
    }

    /// Record how long a training dataset took to prepare on a cache miss
    pub async fn record_preparation(&self, model_type: &str, elapsed_ms: f64) {
        self.append(NewMetric {
            metric_type: MetricType::PreparationTimeMs,
            value: elapsed_ms,
            unit: "ms".into(),
            model_type: Some(model_type.to_string()),
            operation_type: Some(Tier::TrainingCache.to_string()),
            recorded_at: self.clock.now(),
            metadata: json!({}),
        })
        .await;
    }

    /// Record a policy run's eviction count and estimated space freed
    pub async fn record_eviction(
        &self,
        policy_id: &str,
        tier: Tier,
        evicted: u64,
        space_freed_mb: f64,
    ) {
        let now = self.clock.now();
        let metadata = json!({ "policyId": policy_id, "tier": tier });

        self.append(NewMetric {
            metric_type: MetricType::RecordsEvicted,
            value: evicted as f64,
            unit: "records".into(),
            model_type: None,
            operation_type: Some(tier.to_string()),
            recorded_at: now,
            metadata: metadata.clone(),
        })
        .await;
        self.append(NewMetric {
            metric_type: MetricType::SpaceFreedMb,
            value: space_freed_mb,
            unit: "mb".into(),
            model_type: None,
            operation_type: Some(tier.to_string()),
            recorded_at: now,
            metadata,
        })
        .await;
    }

    pub async fn record_policy_failure(&self, policy_id: &str, tier: Tier, reason: &str) {
        self.append(NewMetric {
            metric_type: MetricType::PolicyFailure,
            value: 1.0,
            unit: "count".into(),
            model_type: None,
            operation_type: Some(tier.to_string()),
            recorded_at: self.clock.now(),
            metadata: json!({ "policyId": policy_id, "error": reason }),
        })
        .await;
    }

    /// Write accumulated hit ratios and time saved as metric rows, then reset the window.
    ///
    /// Counts from a window whose write fails are folded back for the next flush.
    pub async fn flush(&self) -> Result<usize> {
        let now = self.clock.now();
        let mut written = 0;

        for tier in Tier::ALL {
            let Some(c) = self.counters(*tier) else {
                continue;
            };
            let hits = c.hits.swap(0, Ordering::Relaxed);
            let misses = c.misses.swap(0, Ordering::Relaxed);
            let saved_us = c.time_saved_us.swap(0, Ordering::Relaxed);

            if hits + misses > 0 {
                let ratio = NewMetric {
                    metric_type: MetricType::CacheHitRatio,
                    value: hits as f64 / (hits + misses) as f64,
                    unit: "ratio".into(),
                    model_type: None,
                    operation_type: Some(tier.to_string()),
                    recorded_at: now,
                    metadata: json!({ "hits": hits, "misses": misses }),
                };
                if let Err(e) = self.guard.run("metrics_flush", self.sink.append(&ratio)).await {
                    c.hits.fetch_add(hits, Ordering::Relaxed);
                    c.misses.fetch_add(misses, Ordering::Relaxed);
                    c.time_saved_us.fetch_add(saved_us, Ordering::Relaxed);
                    return Err(e);
                }
                written += 1;
            }

            if saved_us > 0 {
                let saved = NewMetric {
                    metric_type: MetricType::TimeSavedMs,
                    value: saved_us as f64 / 1000.0,
                    unit: "ms".into(),
                    model_type: None,
                    operation_type: Some(tier.to_string()),
                    recorded_at: now,
                    metadata: json!({}),
                };
                if let Err(e) = self.guard.run("metrics_flush", self.sink.append(&saved)).await {
                    c.time_saved_us.fetch_add(saved_us, Ordering::Relaxed);
                    return Err(e);
                }
                written += 1;
            }
        }

        debug!(rows = written, "Flushed cache metrics");
        Ok(written)
    }

    /// Hit rates accumulated since process start
    pub fn snapshot(&self) -> Vec<TierHitRate> {
        Tier::ALL
            .iter()
            .filter_map(|tier| {
                let c = self.counters(*tier)?;
                let hits = c.total_hits.load(Ordering::Relaxed);
                let misses = c.total_misses.load(Ordering::Relaxed);
                let lookups = hits + misses;
                Some(TierHitRate {
                    tier: *tier,
                    hits,
                    misses,
                    hit_ratio: if lookups > 0 {
                        hits as f64 / lookups as f64
                    } else {
                        0.0
                    },
                    time_saved_ms: c.total_time_saved_us.load(Ordering::Relaxed) as f64 / 1000.0,
                })
            })
            .collect()
    }

    /// Daily rollups of every metric type since `since`
    pub async fn daily(&self, since: DateTime<Utc>) -> Result<Vec<DailyMetricAggregate>> {
        self.guard
            .run("metrics_daily", self.sink.daily_aggregates(since))
            .await
    }
}
