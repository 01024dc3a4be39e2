//! In-process backends built on `moka::future::Cache`.
//!
//! Caches are unbounded: entries leave only through retention policies or
//! explicit invalidation. Same-key mutations go through `and_compute_with`, which
//! serializes them per key without a global lock.

mod control;
mod tiers;

use super::RetentionTarget;
use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use ml_retention_db::{
    AggregatedSeriesEntry, EvictionCriteria, FeatureEntry, FeatureType, InferenceCacheEntry,
    MetricRecord, Retainable, RetentionPolicy, SourceType, Tier, TierStats, TimeWindow,
    TrainingCacheEntry,
};
use moka::future::Cache;
use moka::ops::compute::{CompResult, Op};
use std::collections::{BTreeMap, HashMap};
use std::hash::Hash;
use std::sync::atomic::AtomicI64;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

/// One tier held in a moka cache
#[derive(Clone)]
pub struct MemoryTier<K, V>
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    tier: Tier,
    cache: Cache<K, V>,
}

impl<K, V> MemoryTier<K, V>
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
    V: Retainable + Clone + Send + Sync + 'static,
{
    fn new(tier: Tier) -> Self {
        Self {
            tier,
            cache: Cache::builder().build(),
        }
    }

    fn keys_where(&self, pred: impl Fn(&V) -> bool) -> Vec<K> {
        self.cache
            .iter()
            .filter(|(_, v)| pred(v))
            .map(|(k, _)| k.as_ref().clone())
            .collect()
    }

    fn values_where(&self, pred: impl Fn(&V) -> bool) -> Vec<V> {
        self.cache
            .iter()
            .filter(|(_, v)| pred(v))
            .map(|(_, v)| v)
            .collect()
    }

    /// Remove `key` only if its current value still satisfies `pred`
    async fn remove_if<F>(&self, key: K, pred: F) -> bool
    where
        F: FnOnce(&V) -> bool + Send,
    {
        let result = self
            .cache
            .entry(key)
            .and_compute_with(|entry| {
                let op = match entry {
                    Some(e) if pred(e.value()) => Op::Remove,
                    _ => Op::Nop,
                };
                std::future::ready(op)
            })
            .await;
        matches!(result, CompResult::Removed(_))
    }

    pub fn len(&self) -> usize {
        self.cache.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl<K, V> RetentionTarget for MemoryTier<K, V>
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
    V: Retainable + Clone + Send + Sync + 'static,
{
    async fn count_matching(&self, criteria: &EvictionCriteria) -> Result<u64> {
        let count = self
            .cache
            .iter()
            .filter(|(_, v)| criteria.matches(&v.retention_view()))
            .count();
        Ok(count as u64)
    }

    async fn evict_batch(&self, criteria: &EvictionCriteria, limit: u64) -> Result<u64> {
        let candidates = self.keys_where(|v| criteria.matches(&v.retention_view()));
        let mut evicted = 0;
        for key in candidates {
            if evicted >= limit {
                break;
            }
            // re-checked under the key's lock so a concurrent touch wins
            if self
                .remove_if(key, |v| criteria.matches(&v.retention_view()))
                .await
            {
                evicted += 1;
            }
        }
        Ok(evicted)
    }

    async fn stats(&self, now: DateTime<Utc>) -> Result<TierStats> {
        let active_since = now - Duration::days(7);
        let mut total = 0i64;
        let mut active = 0i64;
        let mut access = (0i64, 0i64);
        let mut quality = (0f64, 0i64);

        for (_, value) in self.cache.iter() {
            let view = value.retention_view();
            total += 1;
            if view.clock > active_since {
                active += 1;
            }
            if let Some(count) = view.access_count {
                access.0 += count;
                access.1 += 1;
            }
            if let Some(q) = view.quality {
                quality.0 += q;
                quality.1 += 1;
            }
        }

        let has_score = matches!(self.tier, Tier::FeatureStore | Tier::InferenceCache);
        Ok(TierStats {
            tier: self.tier,
            total_entries: total,
            avg_access_count: (access.1 > 0).then(|| access.0 as f64 / access.1 as f64),
            active_entries: active,
            avg_quality: (has_score && quality.1 > 0).then(|| quality.0 / quality.1 as f64),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct FeatureKey {
    source_id: String,
    feature_type: FeatureType,
    content_hash: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct AggregateKey {
    source_type: SourceType,
    location_grid: String,
    time_window: TimeWindow,
    start_date: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct Lease {
    holder: String,
    expires_at: DateTime<Utc>,
}

/// Every tier plus policies, metrics and leases, held in process
pub struct MemoryStore {
    features: MemoryTier<FeatureKey, FeatureEntry>,
    training: MemoryTier<(String, String), TrainingCacheEntry>,
    inference: MemoryTier<String, InferenceCacheEntry>,
    aggregates: MemoryTier<AggregateKey, AggregatedSeriesEntry>,
    metrics: MemoryTier<i64, MetricRecord>,
    policies: RwLock<BTreeMap<String, RetentionPolicy>>,
    leases: Mutex<HashMap<String, Lease>>,
    next_feature_id: AtomicI64,
    next_aggregate_id: AtomicI64,
    next_metric_id: AtomicI64,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            features: MemoryTier::new(Tier::FeatureStore),
            training: MemoryTier::new(Tier::TrainingCache),
            inference: MemoryTier::new(Tier::InferenceCache),
            aggregates: MemoryTier::new(Tier::AggregatedSeries),
            metrics: MemoryTier::new(Tier::PerformanceMetrics),
            policies: RwLock::new(BTreeMap::new()),
            leases: Mutex::new(HashMap::new()),
            next_feature_id: AtomicI64::new(0),
            next_aggregate_id: AtomicI64::new(0),
            next_metric_id: AtomicI64::new(0),
        }
    }

    pub fn retention_target(&self, tier: Tier) -> Arc<dyn RetentionTarget> {
        match tier {
            Tier::FeatureStore => Arc::new(self.features.clone()),
            Tier::TrainingCache => Arc::new(self.training.clone()),
            Tier::InferenceCache => Arc::new(self.inference.clone()),
            Tier::AggregatedSeries => Arc::new(self.aggregates.clone()),
            Tier::PerformanceMetrics => Arc::new(self.metrics.clone()),
        }
    }

    /// Number of entries currently held in a tier
    pub fn tier_len(&self, tier: Tier) -> usize {
        match tier {
            Tier::FeatureStore => self.features.len(),
            Tier::TrainingCache => self.training.len(),
            Tier::InferenceCache => self.inference.len(),
            Tier::AggregatedSeries => self.aggregates.len(),
            Tier::PerformanceMetrics => self.metrics.len(),
        }
    }

    /// Every stored metric row, oldest first
    pub fn metric_records(&self) -> Vec<MetricRecord> {
        let mut records = self.metrics.values_where(|_| true);
        records.sort_by_key(|m| m.id);
        records
    }
}

fn day_of(at: DateTime<Utc>) -> NaiveDate {
    at.date_naive()
}
