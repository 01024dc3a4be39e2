use super::{day_of, AggregateKey, FeatureKey, MemoryStore};
use crate::backend::{
    AggregatedBackend, FeatureBackend, InferenceBackend, MetricsSink, TrainingBackend,
};
use crate::error::{CacheError, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use ml_retention_db::{
    AggregateFilter, AggregatedSeriesEntry, DailyMetricAggregate, FeatureEntry, FeatureFilter,
    FeatureType, InferenceCacheEntry, MetricRecord, NewMetric, TrainingCacheEntry,
    UpsertAggregateParams, UpsertFeatureParams, UpsertInferenceParams, UpsertTrainingParams,
};
use moka::ops::compute::{CompResult, Op};
use std::collections::BTreeMap;
use std::future::ready;
use std::sync::atomic::Ordering;

fn no_entry(operation: &str) -> CacheError {
    CacheError::StorageUnavailable(format!("{} produced no entry", operation))
}

#[async_trait]
impl FeatureBackend for MemoryStore {
    async fn upsert(
        &self,
        p: &UpsertFeatureParams,
        now: DateTime<Utc>,
    ) -> Result<(FeatureEntry, bool)> {
        let key = FeatureKey {
            source_id: p.source_id.clone(),
            feature_type: p.feature_type,
            content_hash: p.content_hash.clone(),
        };

        let result = self
            .features
            .cache
            .entry(key)
            .and_compute_with(|existing| {
                let entry = match existing {
                    Some(e) => {
                        let mut entry = e.into_value();
                        entry.access_count += 1;
                        entry.last_accessed = now;
                        entry
                    }
                    None => FeatureEntry {
                        id: self.next_feature_id.fetch_add(1, Ordering::SeqCst) + 1,
                        source_id: p.source_id.clone(),
                        source_table: p.source_table.clone(),
                        feature_type: p.feature_type,
                        feature_vector: p.feature_vector.clone(),
                        content_hash: p.content_hash.clone(),
                        temporal_window: p.temporal_window.clone(),
                        spatial_resolution: p.spatial_resolution,
                        location_bucket: p.location_bucket.clone(),
                        quality_score: p.quality_score,
                        computed_at: now,
                        last_accessed: now,
                        access_count: 0,
                        retention_days: p.retention_days,
                        priority: p.priority,
                    },
                };
                ready(Op::Put(entry))
            })
            .await;

        match result {
            CompResult::Inserted(e) => Ok((e.into_value(), true)),
            CompResult::ReplacedWith(e) => Ok((e.into_value(), false)),
            _ => Err(no_entry("feature upsert")),
        }
    }

    async fn get_and_touch(
        &self,
        source_id: &str,
        feature_type: FeatureType,
        content_hash: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<FeatureEntry>> {
        let key = FeatureKey {
            source_id: source_id.to_string(),
            feature_type,
            content_hash: content_hash.to_string(),
        };

        let result = self
            .features
            .cache
            .entry(key)
            .and_compute_with(|existing| {
                let op = match existing {
                    Some(e) => {
                        let mut entry = e.into_value();
                        entry.access_count += 1;
                        entry.last_accessed = now;
                        Op::Put(entry)
                    }
                    None => Op::Nop,
                };
                ready(op)
            })
            .await;

        Ok(match result {
            CompResult::ReplacedWith(e) => Some(e.into_value()),
            _ => None,
        })
    }

    async fn query_page(
        &self,
        filter: &FeatureFilter,
        after_id: i64,
        limit: i64,
    ) -> Result<Vec<FeatureEntry>> {
        let mut page = self
            .features
            .values_where(|f| f.id > after_id && filter.matches(f));
        page.sort_by_key(|f| f.id);
        page.truncate(limit.max(0) as usize);
        Ok(page)
    }
}

#[async_trait]
impl TrainingBackend for MemoryStore {
    async fn upsert(
        &self,
        p: &UpsertTrainingParams,
        now: DateTime<Utc>,
    ) -> Result<TrainingCacheEntry> {
        let entry = TrainingCacheEntry {
            cache_id: p.cache_id.clone(),
            model_type: p.model_type.clone(),
            dataset_version: p.dataset_version.clone(),
            training_matrix: p.training_matrix.clone(),
            target_vector: p.target_vector.clone(),
            validation_split: p.validation_split.clone(),
            preprocessing_pipeline: p.preprocessing_pipeline.clone(),
            feature_names: p.feature_names.clone(),
            scaler_params: p.scaler_params.clone(),
            sample_count: p.sample_count,
            feature_count: p.feature_count,
            class_distribution: p.class_distribution.clone(),
            created_at: now,
            last_accessed: now,
            hit_count: 0,
            expires_at: p.expires_at,
            auto_refresh: p.auto_refresh,
        };
        let key = (p.model_type.clone(), p.dataset_version.clone());
        self.training.cache.insert(key, entry.clone()).await;
        Ok(entry)
    }

    async fn get_and_touch(
        &self,
        model_type: &str,
        dataset_version: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<TrainingCacheEntry>> {
        let key = (model_type.to_string(), dataset_version.to_string());

        let result = self
            .training
            .cache
            .entry(key)
            .and_compute_with(|existing| {
                let op = match existing {
                    Some(e) if !e.value().is_expired(now) => {
                        let mut entry = e.into_value();
                        entry.hit_count += 1;
                        entry.last_accessed = now;
                        Op::Put(entry)
                    }
                    _ => Op::Nop,
                };
                ready(op)
            })
            .await;

        Ok(match result {
            CompResult::ReplacedWith(e) => Some(e.into_value()),
            _ => None,
        })
    }

    async fn delete(&self, model_type: &str, dataset_version: &str) -> Result<bool> {
        let key = (model_type.to_string(), dataset_version.to_string());
        Ok(self.training.cache.remove(&key).await.is_some())
    }
}

#[async_trait]
impl InferenceBackend for MemoryStore {
    async fn upsert(
        &self,
        p: &UpsertInferenceParams,
        now: DateTime<Utc>,
    ) -> Result<InferenceCacheEntry> {
        let entry = InferenceCacheEntry {
            cache_key: p.cache_key.clone(),
            model_id: p.model_id.clone(),
            input_hash: p.input_hash.clone(),
            input_summary: p.input_summary.clone(),
            prediction: p.prediction.clone(),
            confidence: p.confidence,
            latitude: p.latitude,
            longitude: p.longitude,
            spatial_bucket: p.spatial_bucket.clone(),
            created_at: now,
            last_accessed: now,
            hit_count: 0,
            computation_time_ms: p.computation_time_ms,
            expires_at: p.expires_at,
            is_valid: true,
        };
        self.inference
            .cache
            .insert(p.cache_key.clone(), entry.clone())
            .await;
        Ok(entry)
    }

    async fn get_and_touch(
        &self,
        cache_key: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<InferenceCacheEntry>> {
        let result = self
            .inference
            .cache
            .entry(cache_key.to_string())
            .and_compute_with(|existing| {
                let op = match existing {
                    Some(e) if e.value().is_servable(now) => {
                        let mut entry = e.into_value();
                        entry.hit_count += 1;
                        entry.last_accessed = now;
                        Op::Put(entry)
                    }
                    _ => Op::Nop,
                };
                ready(op)
            })
            .await;

        Ok(match result {
            CompResult::ReplacedWith(e) => Some(e.into_value()),
            _ => None,
        })
    }

    async fn delete_for_model(&self, model_id: &str) -> Result<u64> {
        let keys = self.inference.keys_where(|e| e.model_id == model_id);
        let mut deleted = 0;
        for key in keys {
            if self.inference.remove_if(key, |e| e.model_id == model_id).await {
                deleted += 1;
            }
        }
        Ok(deleted)
    }

    async fn invalidate_bucket(&self, spatial_bucket: &str) -> Result<u64> {
        let in_bucket =
            |e: &InferenceCacheEntry| e.is_valid && e.spatial_bucket.as_deref() == Some(spatial_bucket);

        let mut invalidated = 0;
        for key in self.inference.keys_where(in_bucket) {
            let result = self
                .inference
                .cache
                .entry(key)
                .and_compute_with(|existing| {
                    let op = match existing {
                        Some(e) if in_bucket(e.value()) => {
                            let mut entry = e.into_value();
                            entry.is_valid = false;
                            Op::Put(entry)
                        }
                        _ => Op::Nop,
                    };
                    ready(op)
                })
                .await;
            if matches!(result, CompResult::ReplacedWith(_)) {
                invalidated += 1;
            }
        }
        Ok(invalidated)
    }
}

#[async_trait]
impl AggregatedBackend for MemoryStore {
    async fn upsert(&self, p: &UpsertAggregateParams, now: DateTime<Utc>) -> Result<i64> {
        let key = AggregateKey {
            source_type: p.source_type,
            location_grid: p.location_grid.clone(),
            time_window: p.time_window,
            start_date: p.start_date,
        };

        let result = self
            .aggregates
            .cache
            .entry(key)
            .and_compute_with(|existing| {
                let (id, created_at) = match existing {
                    Some(e) => (e.value().id, e.value().created_at),
                    None => (
                        self.next_aggregate_id.fetch_add(1, Ordering::SeqCst) + 1,
                        now,
                    ),
                };
                ready(Op::Put(AggregatedSeriesEntry {
                    id,
                    source_type: p.source_type,
                    location_grid: p.location_grid.clone(),
                    center_lat: p.center_lat,
                    center_lon: p.center_lon,
                    bucket_size: p.bucket_size,
                    time_window: p.time_window,
                    start_date: p.start_date,
                    end_date: p.end_date,
                    sample_count: p.sample_count,
                    statistics: p.statistics.clone(),
                    derived_indices: p.derived_indices.clone(),
                    provenance: p.provenance.clone(),
                    created_at,
                    last_updated: now,
                }))
            })
            .await;

        match result {
            CompResult::Inserted(e) | CompResult::ReplacedWith(e) => Ok(e.value().id),
            _ => Err(no_entry("aggregate upsert")),
        }
    }

    async fn query_page(
        &self,
        filter: &AggregateFilter,
        after: Option<(DateTime<Utc>, i64)>,
        limit: i64,
    ) -> Result<Vec<AggregatedSeriesEntry>> {
        let mut page = self.aggregates.values_where(|a| {
            filter.matches(a) && after.is_none_or(|cursor| (a.start_date, a.id) > cursor)
        });
        page.sort_by_key(|a| (a.start_date, a.id));
        page.truncate(limit.max(0) as usize);
        Ok(page)
    }
}

#[async_trait]
impl MetricsSink for MemoryStore {
    async fn append(&self, m: &NewMetric) -> Result<()> {
        let id = self.next_metric_id.fetch_add(1, Ordering::SeqCst) + 1;
        let record = MetricRecord {
            id,
            metric_type: m.metric_type,
            value: m.value,
            unit: m.unit.clone(),
            model_type: m.model_type.clone(),
            operation_type: m.operation_type.clone(),
            recorded_at: m.recorded_at,
            metadata: m.metadata.clone(),
        };
        self.metrics.cache.insert(id, record).await;
        Ok(())
    }

    async fn daily_aggregates(&self, since: DateTime<Utc>) -> Result<Vec<DailyMetricAggregate>> {
        let mut groups: BTreeMap<(NaiveDate, String), (f64, f64, f64, i64)> = BTreeMap::new();

        for record in self.metrics.values_where(|m| m.recorded_at >= since) {
            let key = (day_of(record.recorded_at), record.metric_type.to_string());
            let group = groups
                .entry(key)
                .or_insert((0.0, f64::NEG_INFINITY, f64::INFINITY, 0));
            group.0 += record.value;
            group.1 = group.1.max(record.value);
            group.2 = group.2.min(record.value);
            group.3 += 1;
        }

        Ok(groups
            .into_iter()
            .map(|((day, metric_type), (sum, max, min, count))| DailyMetricAggregate {
                day,
                metric_type,
                avg_value: sum / count as f64,
                max_value: max,
                min_value: min,
                sample_count: count,
            })
            .collect())
    }
}
