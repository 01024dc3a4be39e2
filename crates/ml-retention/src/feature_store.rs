//! Durable store of extracted feature vectors, deduplicated by content hash.

use crate::backend::FeatureBackend;
use crate::clock::Clock;
use crate::content::content_hash;
use crate::error::{CacheError, Result};
use crate::health::StorageGuard;
use crate::metrics::MetricsRecorder;
use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use ml_retention_db::{FeatureEntry, FeatureFilter, FeatureType, Priority, Tier, UpsertFeatureParams};
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

/// A freshly computed feature vector and its provenance
#[derive(Debug, Clone)]
pub struct FeatureInput {
    pub source_id: String,
    pub source_table: String,
    pub feature_type: FeatureType,
    pub vector: Value,
    pub quality_score: f64,
    pub temporal_window: Option<String>,
    pub location_bucket: Option<String>,
    pub spatial_resolution: Option<f64>,
}

/// Outcome of [`FeatureStore::put`]
#[derive(Debug, Clone, PartialEq)]
pub struct StoredFeature {
    pub id: i64,
    pub content_hash: String,
    /// `false` when an identical entry already existed and was touched instead
    pub inserted: bool,
}

pub struct FeatureStore {
    backend: Arc<dyn FeatureBackend>,
    guard: StorageGuard,
    clock: Arc<dyn Clock>,
    metrics: Arc<MetricsRecorder>,
    page_size: i64,
}

fn is_empty_vector(vector: &Value) -> bool {
    match vector {
        Value::Null => true,
        Value::Array(items) => items.is_empty(),
        Value::Object(map) => map.is_empty(),
        Value::String(s) => s.is_empty(),
        _ => false,
    }
}

impl FeatureStore {
    pub fn new(
        backend: Arc<dyn FeatureBackend>,
        guard: StorageGuard,
        clock: Arc<dyn Clock>,
        metrics: Arc<MetricsRecorder>,
        page_size: i64,
    ) -> Self {
        Self {
            backend,
            guard,
            clock,
            metrics,
            page_size: page_size.max(1),
        }
    }

    fn validate(input: &FeatureInput) -> Result<()> {
        if input.source_id.trim().is_empty() {
            return Err(CacheError::InvalidFeature("source id is empty".into()));
        }
        if is_empty_vector(&input.vector) {
            return Err(CacheError::InvalidFeature("feature vector is empty".into()));
        }
        if !(0.0..=1.0).contains(&input.quality_score) {
            return Err(CacheError::InvalidFeature(format!(
                "quality score {} outside [0, 1]",
                input.quality_score
            )));
        }
        Ok(())
    }

    /// Store a feature vector, or touch the identical one already stored
    pub async fn put(&self, input: FeatureInput) -> Result<StoredFeature> {
        Self::validate(&input)?;

        let hash = content_hash(&input.vector);
        let (priority, retention_days) = Priority::from_quality(input.quality_score);
        let params = UpsertFeatureParams {
            source_id: input.source_id,
            source_table: input.source_table,
            feature_type: input.feature_type,
            feature_vector: input.vector,
            content_hash: hash,
            temporal_window: input.temporal_window,
            spatial_resolution: input.spatial_resolution,
            location_bucket: input.location_bucket,
            quality_score: input.quality_score,
            retention_days,
            priority,
        };

        let now = self.clock.now();
        let (entry, inserted) = self
            .guard
            .run("feature_put", self.backend.upsert(&params, now))
            .await?;

        debug!(
            id = entry.id,
            source_id = %entry.source_id,
            inserted,
            access_count = entry.access_count,
            "Stored feature"
        );
        Ok(StoredFeature {
            id: entry.id,
            content_hash: entry.content_hash,
            inserted,
        })
    }

    /// Look up a feature by identity; a hit records the access
    pub async fn get(
        &self,
        source_id: &str,
        feature_type: FeatureType,
        content_hash: &str,
    ) -> Result<Option<FeatureEntry>> {
        let now = self.clock.now();
        let entry = self
            .guard
            .run(
                "feature_get",
                self.backend
                    .get_and_touch(source_id, feature_type, content_hash, now),
            )
            .await?;

        match &entry {
            Some(_) => self.metrics.record_hit(Tier::FeatureStore),
            None => self.metrics.record_miss(Tier::FeatureStore),
        }
        Ok(entry)
    }

    /// A restartable scan over features matching the filter
    pub fn query(&self, filter: FeatureFilter) -> FeatureQuery {
        FeatureQuery {
            backend: self.backend.clone(),
            guard: self.guard.clone(),
            filter,
            page_size: self.page_size,
        }
    }
}

/// Lazily paged feature scan. Each call to [`FeatureQuery::stream`] starts over.
#[derive(Clone)]
pub struct FeatureQuery {
    backend: Arc<dyn FeatureBackend>,
    guard: StorageGuard,
    filter: FeatureFilter,
    page_size: i64,
}

impl FeatureQuery {
    pub fn stream(&self) -> BoxStream<'static, Result<FeatureEntry>> {
        self.stream_after(0)
    }

    /// Resume a scan after the last id already consumed
    pub fn stream_after(&self, after_id: i64) -> BoxStream<'static, Result<FeatureEntry>> {
        let backend = self.backend.clone();
        let guard = self.guard.clone();
        let filter = self.filter.clone();
        let page_size = self.page_size;

        stream::try_unfold(Some(after_id), move |cursor| {
            let backend = backend.clone();
            let guard = guard.clone();
            let filter = filter.clone();
            async move {
                let Some(after) = cursor else {
                    return Ok(None);
                };
                let page = guard
                    .run(
                        "feature_query",
                        backend.query_page(&filter, after, page_size),
                    )
                    .await?;
                let next = if (page.len() as i64) < page_size {
                    None
                } else {
                    page.last().map(|f| f.id)
                };
                let items = stream::iter(page.into_iter().map(Ok::<FeatureEntry, CacheError>));
                Ok::<_, CacheError>(Some((items, next)))
            }
        })
        .try_flatten()
        .boxed()
    }

    /// Drain the scan into memory
    pub async fn collect(&self) -> Result<Vec<FeatureEntry>> {
        self.stream().try_collect().await
    }
}
