//! Postgres backends delegating to `ml_retention_db` query functions.

use super::{
    AggregatedBackend, FeatureBackend, InferenceBackend, LeaseManager, MetricsSink, PolicyStore,
    RetentionTarget, TrainingBackend,
};
use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ml_retention_db::{
    aggregated, features, inference, leases, metrics, policies, retention, training,
    AggregateFilter, AggregatedSeriesEntry, DailyMetricAggregate, EvictionCriteria,
    FeatureEntry, FeatureFilter, FeatureType, InferenceCacheEntry, NewMetric, RetentionPolicy,
    Tier, TierStats, TrainingCacheEntry, UpsertAggregateParams, UpsertFeatureParams,
    UpsertInferenceParams, UpsertTrainingParams,
};
use sqlx::PgPool;
use tracing::debug;

/// All tier, policy, metric and lease storage over one pool
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl FeatureBackend for PgStore {
    async fn upsert(
        &self,
        params: &UpsertFeatureParams,
        now: DateTime<Utc>,
    ) -> Result<(FeatureEntry, bool)> {
        Ok(features::upsert(&self.pool, params, now).await?)
    }

    async fn get_and_touch(
        &self,
        source_id: &str,
        feature_type: FeatureType,
        content_hash: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<FeatureEntry>> {
        Ok(features::get_and_touch(&self.pool, source_id, feature_type, content_hash, now).await?)
    }

    async fn query_page(
        &self,
        filter: &FeatureFilter,
        after_id: i64,
        limit: i64,
    ) -> Result<Vec<FeatureEntry>> {
        Ok(features::query_page(&self.pool, filter, after_id, limit).await?)
    }
}

#[async_trait]
impl TrainingBackend for PgStore {
    async fn upsert(
        &self,
        params: &UpsertTrainingParams,
        now: DateTime<Utc>,
    ) -> Result<TrainingCacheEntry> {
        Ok(training::upsert(&self.pool, params, now).await?)
    }

    async fn get_and_touch(
        &self,
        model_type: &str,
        dataset_version: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<TrainingCacheEntry>> {
        Ok(training::get_and_touch(&self.pool, model_type, dataset_version, now).await?)
    }

    async fn delete(&self, model_type: &str, dataset_version: &str) -> Result<bool> {
        Ok(training::delete(&self.pool, model_type, dataset_version).await?)
    }
}

#[async_trait]
impl InferenceBackend for PgStore {
    async fn upsert(
        &self,
        params: &UpsertInferenceParams,
        now: DateTime<Utc>,
    ) -> Result<InferenceCacheEntry> {
        Ok(inference::upsert(&self.pool, params, now).await?)
    }

    async fn get_and_touch(
        &self,
        cache_key: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<InferenceCacheEntry>> {
        Ok(inference::get_and_touch(&self.pool, cache_key, now).await?)
    }

    async fn delete_for_model(&self, model_id: &str) -> Result<u64> {
        Ok(inference::delete_for_model(&self.pool, model_id).await?)
    }

    async fn invalidate_bucket(&self, spatial_bucket: &str) -> Result<u64> {
        Ok(inference::invalidate_bucket(&self.pool, spatial_bucket).await?)
    }
}

#[async_trait]
impl AggregatedBackend for PgStore {
    async fn upsert(&self, params: &UpsertAggregateParams, now: DateTime<Utc>) -> Result<i64> {
        Ok(aggregated::upsert(&self.pool, params, now).await?)
    }

    async fn query_page(
        &self,
        filter: &AggregateFilter,
        after: Option<(DateTime<Utc>, i64)>,
        limit: i64,
    ) -> Result<Vec<AggregatedSeriesEntry>> {
        Ok(aggregated::query_page(&self.pool, filter, after, limit).await?)
    }
}

#[async_trait]
impl MetricsSink for PgStore {
    async fn append(&self, metric: &NewMetric) -> Result<()> {
        Ok(metrics::insert(&self.pool, metric).await?)
    }

    async fn daily_aggregates(&self, since: DateTime<Utc>) -> Result<Vec<DailyMetricAggregate>> {
        Ok(metrics::daily_aggregates(&self.pool, since).await?)
    }
}

#[async_trait]
impl PolicyStore for PgStore {
    async fn list(&self) -> Result<Vec<RetentionPolicy>> {
        Ok(policies::list(&self.pool).await?)
    }

    async fn get(&self, policy_id: &str) -> Result<Option<RetentionPolicy>> {
        Ok(policies::get(&self.pool, policy_id).await?)
    }

    async fn insert(&self, policy: &RetentionPolicy) -> Result<bool> {
        Ok(policies::insert(&self.pool, policy).await?)
    }

    async fn update_definition(&self, policy: &RetentionPolicy) -> Result<bool> {
        Ok(policies::update_definition(&self.pool, policy).await?)
    }

    async fn reschedule(&self, policy_id: &str, next_execution: DateTime<Utc>) -> Result<bool> {
        Ok(policies::reschedule(&self.pool, policy_id, next_execution).await?)
    }

    async fn delete(&self, policy_id: &str) -> Result<bool> {
        Ok(policies::delete(&self.pool, policy_id).await?)
    }

    async fn record_success(
        &self,
        policy_id: &str,
        records_evicted: i64,
        space_freed_mb: f64,
        executed_at: DateTime<Utc>,
        next_execution: DateTime<Utc>,
    ) -> Result<()> {
        Ok(policies::record_success(
            &self.pool,
            policy_id,
            records_evicted,
            space_freed_mb,
            executed_at,
            next_execution,
        )
        .await?)
    }

    async fn record_failure(
        &self,
        policy_id: &str,
        error: &str,
        records_evicted: i64,
        space_freed_mb: f64,
    ) -> Result<()> {
        Ok(policies::record_failure(
            &self.pool,
            policy_id,
            error,
            records_evicted,
            space_freed_mb,
        )
        .await?)
    }
}

#[async_trait]
impl LeaseManager for PgStore {
    async fn try_acquire(
        &self,
        policy_id: &str,
        holder: &str,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<bool> {
        Ok(leases::try_acquire(&self.pool, policy_id, holder, now, expires_at).await?)
    }

    async fn release(&self, policy_id: &str, holder: &str) -> Result<()> {
        Ok(leases::release(&self.pool, policy_id, holder).await?)
    }
}

/// One tier's table as a retention target. Each batch is its own statement, so
/// row locks are held only for one batch.
#[derive(Debug, Clone)]
pub struct PgRetentionTarget {
    pool: PgPool,
    tier: Tier,
}

impl PgRetentionTarget {
    pub fn new(pool: PgPool, tier: Tier) -> Self {
        Self { pool, tier }
    }
}

#[async_trait]
impl RetentionTarget for PgRetentionTarget {
    async fn count_matching(&self, criteria: &EvictionCriteria) -> Result<u64> {
        let count = retention::count_matching(&self.pool, criteria).await?;
        Ok(count.max(0) as u64)
    }

    async fn evict_batch(&self, criteria: &EvictionCriteria, limit: u64) -> Result<u64> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let deleted = retention::evict_batch(&self.pool, criteria, limit).await?;
        debug!(tier = %self.tier, deleted, "Deleted retention batch");
        Ok(deleted)
    }

    async fn stats(&self, now: DateTime<Utc>) -> Result<TierStats> {
        Ok(retention::tier_stats(&self.pool, self.tier, now).await?)
    }
}
