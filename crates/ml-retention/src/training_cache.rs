//! Prepared training datasets keyed by (model type, dataset version).

use crate::backend::TrainingBackend;
use crate::clock::Clock;
use crate::config::expires_after;
use crate::content::training_cache_id;
use crate::error::{CacheError, Result};
use crate::health::StorageGuard;
use crate::metrics::MetricsRecorder;
use chrono::{DateTime, Utc};
use ml_retention_db::{PipelineStep, Tier, TrainingCacheEntry, UpsertTrainingParams};
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// A prepared dataset ready to be cached
#[derive(Debug, Clone, PartialEq)]
pub struct TrainingDataset {
    pub model_type: String,
    pub dataset_version: String,
    pub training_matrix: Vec<u8>,
    pub target_vector: Vec<u8>,
    pub validation_split: Value,
    pub preprocessing_pipeline: Vec<PipelineStep>,
    pub feature_names: Vec<String>,
    pub scaler_params: Value,
    pub sample_count: i64,
    pub feature_count: i64,
    pub class_distribution: Option<Value>,
    /// Ignored when `auto_refresh` is set
    pub expires_at: Option<DateTime<Utc>>,
    pub auto_refresh: bool,
}

pub struct TrainingCache {
    backend: Arc<dyn TrainingBackend>,
    guard: StorageGuard,
    clock: Arc<dyn Clock>,
    metrics: Arc<MetricsRecorder>,
    ttl: Duration,
}

impl TrainingCache {
    pub fn new(
        backend: Arc<dyn TrainingBackend>,
        guard: StorageGuard,
        clock: Arc<dyn Clock>,
        metrics: Arc<MetricsRecorder>,
        ttl: Duration,
    ) -> Self {
        Self {
            backend,
            guard,
            clock,
            metrics,
            ttl,
        }
    }

    async fn store(&self, dataset: TrainingDataset) -> Result<TrainingCacheEntry> {
        if dataset.model_type.is_empty() || dataset.dataset_version.is_empty() {
            return Err(CacheError::InvalidFeature(
                "model type and dataset version are required".into(),
            ));
        }

        let now = self.clock.now();
        let expires_at = if dataset.auto_refresh {
            Some(expires_after(now, self.ttl).ok_or_else(|| {
                CacheError::InvalidFeature(format!(
                    "training ttl of {}s is out of range",
                    self.ttl.as_secs()
                ))
            })?)
        } else {
            dataset.expires_at
        };

        let params = UpsertTrainingParams {
            cache_id: training_cache_id(&dataset.model_type, &dataset.dataset_version),
            model_type: dataset.model_type,
            dataset_version: dataset.dataset_version,
            training_matrix: dataset.training_matrix,
            target_vector: dataset.target_vector,
            validation_split: dataset.validation_split,
            preprocessing_pipeline: dataset.preprocessing_pipeline,
            feature_names: dataset.feature_names,
            scaler_params: dataset.scaler_params,
            sample_count: dataset.sample_count,
            feature_count: dataset.feature_count,
            class_distribution: dataset.class_distribution,
            expires_at,
            auto_refresh: dataset.auto_refresh,
        };

        let entry = self
            .guard
            .run("training_put", self.backend.upsert(&params, now))
            .await?;
        info!(
            model_type = %entry.model_type,
            dataset_version = %entry.dataset_version,
            samples = entry.sample_count,
            "Cached training dataset"
        );
        Ok(entry)
    }

    /// Store a dataset, replacing any previous one for the same version. Returns the cache id.
    pub async fn put(&self, dataset: TrainingDataset) -> Result<String> {
        Ok(self.store(dataset).await?.cache_id)
    }

    /// Unexpired dataset for this version; a hit records the access
    pub async fn get(
        &self,
        model_type: &str,
        dataset_version: &str,
    ) -> Result<Option<TrainingCacheEntry>> {
        let now = self.clock.now();
        let entry = self
            .guard
            .run(
                "training_get",
                self.backend.get_and_touch(model_type, dataset_version, now),
            )
            .await?;

        match &entry {
            Some(_) => self.metrics.record_hit(Tier::TrainingCache),
            None => self.metrics.record_miss(Tier::TrainingCache),
        }
        Ok(entry)
    }

    pub async fn invalidate(&self, model_type: &str, dataset_version: &str) -> Result<bool> {
        let removed = self
            .guard
            .run(
                "training_invalidate",
                self.backend.delete(model_type, dataset_version),
            )
            .await?;
        debug!(model_type, dataset_version, removed, "Invalidated training dataset");
        Ok(removed)
    }

    /// Return the cached dataset, or run `prepare`, cache its result and return that
    pub async fn get_or_prepare<F, Fut>(
        &self,
        model_type: &str,
        dataset_version: &str,
        prepare: F,
    ) -> Result<TrainingCacheEntry>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<TrainingDataset>>,
    {
        if let Some(entry) = self.get(model_type, dataset_version).await? {
            return Ok(entry);
        }

        let started = Instant::now();
        let dataset = prepare().await?;
        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;

        if dataset.model_type != model_type || dataset.dataset_version != dataset_version {
            return Err(CacheError::InvalidFeature(format!(
                "prepared dataset {}/{} does not match requested {}/{}",
                dataset.model_type, dataset.dataset_version, model_type, dataset_version
            )));
        }

        let entry = self.store(dataset).await?;
        self.metrics.record_preparation(model_type, elapsed_ms).await;
        Ok(entry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::MemoryStore;
    use crate::clock::ManualClock;
    use crate::health::StorageHealth;
    use chrono::Duration as ChronoDuration;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn cache() -> (TrainingCache, Arc<ManualClock>) {
        let start = DateTime::parse_from_rfc3339("2025-04-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let clock = Arc::new(ManualClock::new(start));
        let guard = StorageGuard::new(Duration::from_secs(5), Arc::new(StorageHealth::new(3)));
        let cache = TrainingCache::new(
            Arc::new(MemoryStore::new()),
            guard,
            clock.clone(),
            Arc::new(MetricsRecorder::detached()),
            Duration::from_secs(30 * 86400),
        );
        (cache, clock)
    }

    fn dataset(version: &str, matrix: &[u8]) -> TrainingDataset {
        TrainingDataset {
            model_type: "species_distribution".into(),
            dataset_version: version.into(),
            training_matrix: matrix.to_vec(),
            target_vector: vec![0, 1, 1],
            validation_split: json!({"test_size": 0.2}),
            preprocessing_pipeline: vec![
                PipelineStep {
                    name: "impute".into(),
                    params: json!({"strategy": "median"}),
                },
                PipelineStep {
                    name: "standard_scaler".into(),
                    params: json!({}),
                },
            ],
            feature_names: vec!["sst".into(), "depth".into()],
            scaler_params: json!({"mean": [18.2, 40.0]}),
            sample_count: 3,
            feature_count: 2,
            class_distribution: Some(json!({"0": 1, "1": 2})),
            expires_at: None,
            auto_refresh: false,
        }
    }

    #[tokio::test]
    async fn test_second_put_overwrites_payload() {
        let (cache, _) = cache();
        let first = cache.put(dataset("v1", &[1, 2, 3])).await.unwrap();
        cache.get("species_distribution", "v1").await.unwrap();
        let second = cache.put(dataset("v1", &[9, 9])).await.unwrap();
        assert_eq!(first, second);

        let entry = cache
            .get("species_distribution", "v1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(entry.training_matrix, vec![9, 9]);
        // overwrite reset the counter; this get is the first hit since
        assert_eq!(entry.hit_count, 1);
        assert_eq!(entry.preprocessing_pipeline, dataset("v1", &[]).preprocessing_pipeline);
    }

    #[tokio::test]
    async fn test_auto_refresh_sets_expiry_and_expired_is_miss() {
        let (cache, clock) = cache();
        let mut ds = dataset("v2", &[1]);
        ds.auto_refresh = true;
        cache.put(ds).await.unwrap();

        let entry = cache
            .get("species_distribution", "v2")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(entry.expires_at, Some(clock.now() + ChronoDuration::days(30)));

        clock.advance(ChronoDuration::days(30));
        assert!(cache
            .get("species_distribution", "v2")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_invalidate() {
        let (cache, _) = cache();
        cache.put(dataset("v1", &[1])).await.unwrap();
        assert!(cache.invalidate("species_distribution", "v1").await.unwrap());
        assert!(!cache.invalidate("species_distribution", "v1").await.unwrap());
        assert!(cache
            .get("species_distribution", "v1")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_get_or_prepare_runs_once() {
        let (cache, _) = cache();
        let calls = AtomicUsize::new(0);

        for _ in 0..3 {
            let entry = cache
                .get_or_prepare("species_distribution", "v3", || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(dataset("v3", &[4, 5, 6]))
                })
                .await
                .unwrap();
            assert_eq!(entry.training_matrix, vec![4, 5, 6]);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_get_or_prepare_rejects_mismatched_dataset() {
        let (cache, _) = cache();
        let err = cache
            .get_or_prepare("species_distribution", "v4", || async {
                Ok(dataset("v5", &[1]))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, CacheError::InvalidFeature(_)));
    }

    #[tokio::test]
    async fn test_auto_refresh_with_out_of_range_ttl_is_rejected() {
        let start = DateTime::parse_from_rfc3339("2025-04-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let cache = TrainingCache::new(
            Arc::new(MemoryStore::new()),
            StorageGuard::new(Duration::from_secs(5), Arc::new(StorageHealth::new(3))),
            Arc::new(ManualClock::new(start)),
            Arc::new(MetricsRecorder::detached()),
            Duration::MAX,
        );
        let err = cache
            .put(TrainingDataset {
                auto_refresh: true,
                ..dataset("v1", &[1])
            })
            .await
            .unwrap_err();
        assert!(matches!(err, CacheError::InvalidFeature(_)));
        assert!(cache.get("species_distribution", "v1").await.unwrap().is_none());
    }
}
