//! Memoized model predictions with explicit TTLs and model-level invalidation.

use crate::backend::InferenceBackend;
use crate::clock::Clock;
use crate::config::expires_after;
use crate::content::{inference_key, SpatialBucket};
use crate::error::{CacheError, Result};
use crate::health::StorageGuard;
use crate::metrics::MetricsRecorder;
use ml_retention_db::{InferenceCacheEntry, Tier, UpsertInferenceParams};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{error, info, warn};

/// A cached prediction served to a caller
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CachedPrediction {
    pub cache_key: String,
    pub prediction: Value,
    pub confidence: Option<f64>,
}

impl From<InferenceCacheEntry> for CachedPrediction {
    fn from(entry: InferenceCacheEntry) -> Self {
        Self {
            cache_key: entry.cache_key,
            prediction: entry.prediction,
            confidence: entry.confidence,
        }
    }
}

/// Optional attributes of a stored prediction
#[derive(Debug, Clone, Default)]
pub struct PredictionOptions {
    /// Defaults to the configured inference TTL
    pub ttl: Option<Duration>,
    pub location: Option<(f64, f64)>,
    /// Derived from `location` on a one-degree grid when absent
    pub spatial_bucket: Option<String>,
    pub computation_time_ms: Option<f64>,
}

pub struct InferenceCache {
    backend: Arc<dyn InferenceBackend>,
    guard: StorageGuard,
    clock: Arc<dyn Clock>,
    metrics: Arc<MetricsRecorder>,
    default_ttl: Duration,
    /// Models whose cascade delete has not completed; their entries are misses
    pending_invalidations: RwLock<HashSet<String>>,
}

impl InferenceCache {
    pub fn new(
        backend: Arc<dyn InferenceBackend>,
        guard: StorageGuard,
        clock: Arc<dyn Clock>,
        metrics: Arc<MetricsRecorder>,
        default_ttl: Duration,
    ) -> Self {
        Self {
            backend,
            guard,
            clock,
            metrics,
            default_ttl,
            pending_invalidations: RwLock::new(HashSet::new()),
        }
    }

    async fn is_pending(&self, model_id: &str) -> bool {
        self.pending_invalidations.read().await.contains(model_id)
    }

    /// Cached prediction for this model and input, if valid and unexpired
    pub async fn get(&self, model_id: &str, input: &Value) -> Result<Option<CachedPrediction>> {
        if self.is_pending(model_id).await {
            self.metrics.record_miss(Tier::InferenceCache);
            return Ok(None);
        }

        let key = inference_key(model_id, input);
        let now = self.clock.now();
        let entry = self
            .guard
            .run(
                "inference_get",
                self.backend.get_and_touch(&key.cache_key, now),
            )
            .await?
            .filter(|e| e.model_id == model_id);

        match entry {
            Some(entry) => {
                self.metrics.record_hit(Tier::InferenceCache);
                if let Some(ms) = entry.computation_time_ms {
                    self.metrics.record_time_saved(Tier::InferenceCache, ms);
                }
                Ok(Some(entry.into()))
            }
            None => {
                self.metrics.record_miss(Tier::InferenceCache);
                Ok(None)
            }
        }
    }

    /// Store a prediction, overwriting any entry for the same model and input
    pub async fn put(
        &self,
        model_id: &str,
        input: &Value,
        prediction: Value,
        confidence: Option<f64>,
        options: PredictionOptions,
    ) -> Result<String> {
        if model_id.is_empty() {
            return Err(CacheError::InvalidFeature("model id is empty".into()));
        }

        let key = inference_key(model_id, input);
        let now = self.clock.now();
        let ttl = options.ttl.unwrap_or(self.default_ttl);
        let expires_at = expires_after(now, ttl).ok_or_else(|| {
            CacheError::InvalidFeature(format!("ttl of {}s is out of range", ttl.as_secs()))
        })?;
        let spatial_bucket = options.spatial_bucket.or_else(|| {
            options
                .location
                .map(|(lat, lon)| SpatialBucket::from_point(lat, lon, 1.0).label())
        });

        let params = UpsertInferenceParams {
            cache_key: key.cache_key,
            model_id: model_id.to_string(),
            input_hash: key.input_hash,
            input_summary: input.clone(),
            prediction,
            confidence,
            latitude: options.location.map(|(lat, _)| lat),
            longitude: options.location.map(|(_, lon)| lon),
            spatial_bucket,
            computation_time_ms: options.computation_time_ms,
            expires_at,
        };

        let entry = self
            .guard
            .run("inference_put", self.backend.upsert(&params, now))
            .await?;
        Ok(entry.cache_key)
    }

    /// Delete every cached prediction of a model.
    ///
    /// The model is treated as invalidated from the moment this is called. If the
    /// delete fails it stays pending and [`Self::retry_pending_invalidations`]
    /// finishes the job.
    pub async fn invalidate_model(&self, model_id: &str) -> Result<u64> {
        self.pending_invalidations
            .write()
            .await
            .insert(model_id.to_string());

        match self
            .guard
            .run(
                "inference_invalidate_model",
                self.backend.delete_for_model(model_id),
            )
            .await
        {
            Ok(deleted) => {
                self.pending_invalidations.write().await.remove(model_id);
                info!(model_id, deleted, "Invalidated model predictions");
                Ok(deleted)
            }
            Err(e) => {
                error!(model_id, error = %e, "Cascade delete failed, will retry");
                Err(CacheError::CascadeDeleteFailed {
                    model_id: model_id.to_string(),
                    reason: e.to_string(),
                })
            }
        }
    }

    /// Retry cascade deletes that previously failed; returns how many completed
    pub async fn retry_pending_invalidations(&self) -> usize {
        let pending: Vec<String> = self
            .pending_invalidations
            .read()
            .await
            .iter()
            .cloned()
            .collect();

        let mut completed = 0;
        for model_id in pending {
            match self
                .guard
                .run(
                    "inference_invalidate_model",
                    self.backend.delete_for_model(&model_id),
                )
                .await
            {
                Ok(deleted) => {
                    self.pending_invalidations.write().await.remove(&model_id);
                    info!(model_id = %model_id, deleted, "Completed pending model invalidation");
                    completed += 1;
                }
                Err(e) => warn!(model_id = %model_id, error = %e, "Pending model invalidation failed"),
            }
        }
        completed
    }

    pub async fn pending_invalidations(&self) -> Vec<String> {
        let mut pending: Vec<String> = self
            .pending_invalidations
            .read()
            .await
            .iter()
            .cloned()
            .collect();
        pending.sort();
        pending
    }

    /// Mark every prediction in a spatial bucket invalid
    pub async fn invalidate_bucket(&self, spatial_bucket: &str) -> Result<u64> {
        let invalidated = self
            .guard
            .run(
                "inference_invalidate_bucket",
                self.backend.invalidate_bucket(spatial_bucket),
            )
            .await?;
        info!(spatial_bucket, invalidated, "Invalidated spatial bucket");
        Ok(invalidated)
    }

    /// Return the cached prediction, or run `predict` and cache its output
    pub async fn get_or_predict<F, Fut>(
        &self,
        model_id: &str,
        input: &Value,
        options: PredictionOptions,
        predict: F,
    ) -> Result<CachedPrediction>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<(Value, Option<f64>)>>,
    {
        if let Some(hit) = self.get(model_id, input).await? {
            return Ok(hit);
        }

        let started = Instant::now();
        let (prediction, confidence) = predict().await?;
        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;

        let options = PredictionOptions {
            computation_time_ms: options.computation_time_ms.or(Some(elapsed_ms)),
            ..options
        };
        let cache_key = self
            .put(model_id, input, prediction.clone(), confidence, options)
            .await?;

        Ok(CachedPrediction {
            cache_key,
            prediction,
            confidence,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::MemoryStore;
    use crate::backend::InferenceBackend;
    use crate::clock::ManualClock;
    use crate::health::StorageHealth;
    use async_trait::async_trait;
    use chrono::{DateTime, Duration as ChronoDuration, Utc};
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn start() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2025-07-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    fn cache_over(backend: Arc<dyn InferenceBackend>) -> (InferenceCache, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(start()));
        let guard = StorageGuard::new(Duration::from_secs(5), Arc::new(StorageHealth::new(3)));
        let cache = InferenceCache::new(
            backend,
            guard,
            clock.clone(),
            Arc::new(MetricsRecorder::detached()),
            Duration::from_secs(6 * 3600),
        );
        (cache, clock)
    }

    fn input() -> Value {
        json!({"lat": -12.4, "lon": 18.2, "sst": 24.0})
    }

    #[tokio::test]
    async fn test_hit_until_ttl_then_miss() {
        let (cache, clock) = cache_over(Arc::new(MemoryStore::new()));
        cache
            .put("sdm-v1", &input(), json!({"presence": 0.82}), Some(0.82), PredictionOptions::default())
            .await
            .unwrap();

        clock.advance(ChronoDuration::hours(6));
        let hit = cache.get("sdm-v1", &input()).await.unwrap().unwrap();
        assert_eq!(hit.prediction, json!({"presence": 0.82}));
        assert_eq!(hit.confidence, Some(0.82));

        clock.advance(ChronoDuration::milliseconds(1));
        assert!(cache.get("sdm-v1", &input()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_out_of_range_ttl_is_rejected() {
        let (cache, _) = cache_over(Arc::new(MemoryStore::new()));
        let options = PredictionOptions {
            ttl: Some(Duration::from_secs(10_000_000_000_000)),
            ..Default::default()
        };
        let err = cache
            .put("sdm-v1", &input(), json!(1), None, options)
            .await
            .unwrap_err();
        assert!(matches!(err, CacheError::InvalidFeature(_)));
        assert!(cache.get("sdm-v1", &input()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_key_is_model_specific() {
        let (cache, _) = cache_over(Arc::new(MemoryStore::new()));
        cache
            .put("sdm-v1", &input(), json!(1), None, PredictionOptions::default())
            .await
            .unwrap();
        assert!(cache.get("sdm-v2", &input()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_invalidate_model_cascades() {
        let (cache, _) = cache_over(Arc::new(MemoryStore::new()));
        for i in 0..3 {
            cache
                .put("sdm-v1", &json!({"i": i}), json!(i), None, PredictionOptions::default())
                .await
                .unwrap();
        }
        cache
            .put("other", &json!({"i": 0}), json!(0), None, PredictionOptions::default())
            .await
            .unwrap();

        assert_eq!(cache.invalidate_model("sdm-v1").await.unwrap(), 3);
        for i in 0..3 {
            assert!(cache.get("sdm-v1", &json!({"i": i})).await.unwrap().is_none());
        }
        assert!(cache.get("other", &json!({"i": 0})).await.unwrap().is_some());
        assert!(cache.pending_invalidations().await.is_empty());
    }

    #[tokio::test]
    async fn test_invalidate_bucket_turns_entries_into_misses() {
        let (cache, _) = cache_over(Arc::new(MemoryStore::new()));
        let options = PredictionOptions {
            location: Some((-11.4, 18.9)),
            ..Default::default()
        };
        cache
            .put("sdm-v1", &input(), json!(1), None, options)
            .await
            .unwrap();

        assert_eq!(cache.invalidate_bucket("lat_-12_lon_18").await.unwrap(), 1);
        assert!(cache.get("sdm-v1", &input()).await.unwrap().is_none());
        assert_eq!(cache.invalidate_bucket("lat_-12_lon_18").await.unwrap(), 0);
    }

    /// Delegates to memory but fails model deletes while `failing` is set
    struct FlakyBackend {
        inner: MemoryStore,
        failing: AtomicBool,
    }

    #[async_trait]
    impl InferenceBackend for FlakyBackend {
        async fn upsert(
            &self,
            params: &UpsertInferenceParams,
            now: DateTime<Utc>,
        ) -> Result<InferenceCacheEntry> {
            InferenceBackend::upsert(&self.inner, params, now).await
        }

        async fn get_and_touch(
            &self,
            cache_key: &str,
            now: DateTime<Utc>,
        ) -> Result<Option<InferenceCacheEntry>> {
            InferenceBackend::get_and_touch(&self.inner, cache_key, now).await
        }

        async fn delete_for_model(&self, model_id: &str) -> Result<u64> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(CacheError::StorageUnavailable("connection reset".into()));
            }
            self.inner.delete_for_model(model_id).await
        }

        async fn invalidate_bucket(&self, spatial_bucket: &str) -> Result<u64> {
            self.inner.invalidate_bucket(spatial_bucket).await
        }
    }

    #[tokio::test]
    async fn test_failed_cascade_hides_model_until_retry_succeeds() {
        let backend = Arc::new(FlakyBackend {
            inner: MemoryStore::new(),
            failing: AtomicBool::new(true),
        });
        let (cache, _) = cache_over(backend.clone());
        cache
            .put("sdm-v1", &input(), json!(1), None, PredictionOptions::default())
            .await
            .unwrap();

        let err = cache.invalidate_model("sdm-v1").await.unwrap_err();
        assert!(matches!(err, CacheError::CascadeDeleteFailed { .. }));
        assert!(cache.get("sdm-v1", &input()).await.unwrap().is_none());
        assert_eq!(cache.pending_invalidations().await, vec!["sdm-v1".to_string()]);

        assert_eq!(cache.retry_pending_invalidations().await, 0);

        backend.failing.store(false, Ordering::SeqCst);
        assert_eq!(cache.retry_pending_invalidations().await, 1);
        assert!(cache.pending_invalidations().await.is_empty());
        assert!(cache.get("sdm-v1", &input()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_get_or_predict_memoizes() {
        let (cache, _) = cache_over(Arc::new(MemoryStore::new()));
        let calls = std::sync::atomic::AtomicUsize::new(0);

        for _ in 0..2 {
            let result = cache
                .get_or_predict("sdm-v1", &input(), PredictionOptions::default(), || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok((json!({"presence": 0.4}), Some(0.4)))
                })
                .await
                .unwrap();
            assert_eq!(result.prediction, json!({"presence": 0.4}));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
