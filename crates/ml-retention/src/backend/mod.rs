//! Storage seams for the tier services and the retention engine.
//!
//! Every tier has a Postgres implementation ([`postgres`]) and an in-memory one
//! ([`memory`]) with identical semantics.

pub mod memory;
pub mod postgres;

use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ml_retention_db::{
    AggregateFilter, AggregatedSeriesEntry, DailyMetricAggregate, EvictionCriteria,
    FeatureEntry, FeatureFilter, FeatureType, InferenceCacheEntry, NewMetric, RetentionPolicy,
    TierStats, TrainingCacheEntry, UpsertAggregateParams, UpsertFeatureParams,
    UpsertInferenceParams, UpsertTrainingParams,
};

#[async_trait]
pub trait FeatureBackend: Send + Sync {
    /// Insert, or touch the entry with the same identity. `true` when inserted.
    async fn upsert(
        &self,
        params: &UpsertFeatureParams,
        now: DateTime<Utc>,
    ) -> Result<(FeatureEntry, bool)>;

    async fn get_and_touch(
        &self,
        source_id: &str,
        feature_type: FeatureType,
        content_hash: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<FeatureEntry>>;

    /// Entries with `id > after_id` in id order, without touching access stats
    async fn query_page(
        &self,
        filter: &FeatureFilter,
        after_id: i64,
        limit: i64,
    ) -> Result<Vec<FeatureEntry>>;
}

#[async_trait]
pub trait TrainingBackend: Send + Sync {
    async fn upsert(
        &self,
        params: &UpsertTrainingParams,
        now: DateTime<Utc>,
    ) -> Result<TrainingCacheEntry>;

    /// Unexpired entry with its hit recorded
    async fn get_and_touch(
        &self,
        model_type: &str,
        dataset_version: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<TrainingCacheEntry>>;

    async fn delete(&self, model_type: &str, dataset_version: &str) -> Result<bool>;
}

#[async_trait]
pub trait InferenceBackend: Send + Sync {
    async fn upsert(
        &self,
        params: &UpsertInferenceParams,
        now: DateTime<Utc>,
    ) -> Result<InferenceCacheEntry>;

    /// Valid, unexpired entry with its hit recorded
    async fn get_and_touch(
        &self,
        cache_key: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<InferenceCacheEntry>>;

    async fn delete_for_model(&self, model_id: &str) -> Result<u64>;

    async fn invalidate_bucket(&self, spatial_bucket: &str) -> Result<u64>;
}

#[async_trait]
pub trait AggregatedBackend: Send + Sync {
    async fn upsert(&self, params: &UpsertAggregateParams, now: DateTime<Utc>) -> Result<i64>;

    /// Entries after the `(start_date, id)` cursor, in that order
    async fn query_page(
        &self,
        filter: &AggregateFilter,
        after: Option<(DateTime<Utc>, i64)>,
        limit: i64,
    ) -> Result<Vec<AggregatedSeriesEntry>>;
}

#[async_trait]
pub trait MetricsSink: Send + Sync {
    async fn append(&self, metric: &NewMetric) -> Result<()>;

    async fn daily_aggregates(&self, since: DateTime<Utc>) -> Result<Vec<DailyMetricAggregate>>;
}

#[async_trait]
pub trait PolicyStore: Send + Sync {
    async fn list(&self) -> Result<Vec<RetentionPolicy>>;

    async fn get(&self, policy_id: &str) -> Result<Option<RetentionPolicy>>;

    /// `false` when a policy with the same id already exists
    async fn insert(&self, policy: &RetentionPolicy) -> Result<bool>;

    /// Replace the definition, keeping counters and schedule. `false` when unknown.
    async fn update_definition(&self, policy: &RetentionPolicy) -> Result<bool>;

    async fn reschedule(&self, policy_id: &str, next_execution: DateTime<Utc>) -> Result<bool>;

    async fn delete(&self, policy_id: &str) -> Result<bool>;

    async fn record_success(
        &self,
        policy_id: &str,
        records_evicted: i64,
        space_freed_mb: f64,
        executed_at: DateTime<Utc>,
        next_execution: DateTime<Utc>,
    ) -> Result<()>;

    /// Record a failed run without advancing its schedule. `records_evicted` counts
    /// deletions that committed before the failure.
    async fn record_failure(
        &self,
        policy_id: &str,
        error: &str,
        records_evicted: i64,
        space_freed_mb: f64,
    ) -> Result<()>;
}

#[async_trait]
pub trait LeaseManager: Send + Sync {
    /// Take the lease unless an unexpired one exists, whoever holds it
    async fn try_acquire(
        &self,
        policy_id: &str,
        holder: &str,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<bool>;

    async fn release(&self, policy_id: &str, holder: &str) -> Result<()>;
}

/// A tier as seen by the retention engine
#[async_trait]
pub trait RetentionTarget: Send + Sync {
    async fn count_matching(&self, criteria: &EvictionCriteria) -> Result<u64>;

    /// Delete up to `limit` entries still matching at deletion time; returns how many went
    async fn evict_batch(&self, criteria: &EvictionCriteria, limit: u64) -> Result<u64>;

    async fn stats(&self, now: DateTime<Utc>) -> Result<TierStats>;
}
