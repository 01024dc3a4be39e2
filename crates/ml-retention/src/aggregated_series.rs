//! Pre-computed statistics per spatial bucket and time window.

use crate::backend::AggregatedBackend;
use crate::clock::Clock;
use crate::content::SpatialBucket;
use crate::error::{CacheError, Result};
use crate::health::StorageGuard;
use chrono::{DateTime, Utc};
use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use ml_retention_db::{
    AggregateFilter, AggregatedSeriesEntry, SourceType, StatSummary, TimeWindow,
    UpsertAggregateParams,
};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

/// One aggregation window for a grid cell
#[derive(Debug, Clone)]
pub struct AggregateInput {
    pub source_type: SourceType,
    pub bucket: SpatialBucket,
    pub time_window: TimeWindow,
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
    pub statistics: BTreeMap<String, StatSummary>,
    pub derived_indices: Value,
    pub sample_count: i64,
    pub provenance: Vec<String>,
}

pub struct AggregatedSeriesStore {
    backend: Arc<dyn AggregatedBackend>,
    guard: StorageGuard,
    clock: Arc<dyn Clock>,
    page_size: i64,
}

impl AggregatedSeriesStore {
    pub fn new(
        backend: Arc<dyn AggregatedBackend>,
        guard: StorageGuard,
        clock: Arc<dyn Clock>,
        page_size: i64,
    ) -> Self {
        Self {
            backend,
            guard,
            clock,
            page_size: page_size.max(1),
        }
    }

    /// Insert a window, or replace the one with the same source, bucket, window and start
    pub async fn upsert(&self, input: AggregateInput) -> Result<i64> {
        if input.end_date <= input.start_date {
            return Err(CacheError::InvalidFeature(format!(
                "aggregation window ends at {} before it starts at {}",
                input.end_date, input.start_date
            )));
        }
        if input.sample_count < 0 {
            return Err(CacheError::InvalidFeature(format!(
                "negative sample count {}",
                input.sample_count
            )));
        }

        let params = UpsertAggregateParams {
            source_type: input.source_type,
            location_grid: input.bucket.label(),
            center_lat: input.bucket.center_lat,
            center_lon: input.bucket.center_lon,
            bucket_size: input.bucket.size_degrees,
            time_window: input.time_window,
            start_date: input.start_date,
            end_date: input.end_date,
            sample_count: input.sample_count,
            statistics: input.statistics,
            derived_indices: input.derived_indices,
            provenance: input.provenance,
        };

        let now = self.clock.now();
        let id = self
            .guard
            .run("aggregate_upsert", self.backend.upsert(&params, now))
            .await?;
        debug!(id, location_grid = %params.location_grid, time_window = %params.time_window, "Stored aggregate");
        Ok(id)
    }

    pub fn query(&self, filter: AggregateFilter) -> AggregateQuery {
        AggregateQuery {
            backend: self.backend.clone(),
            guard: self.guard.clone(),
            filter,
            page_size: self.page_size,
        }
    }
}

/// Paged scan ordered by start date. Each call to [`AggregateQuery::stream`] starts over.
#[derive(Clone)]
pub struct AggregateQuery {
    backend: Arc<dyn AggregatedBackend>,
    guard: StorageGuard,
    filter: AggregateFilter,
    page_size: i64,
}

impl AggregateQuery {
    pub fn stream(&self) -> BoxStream<'static, Result<AggregatedSeriesEntry>> {
        self.scan(None)
    }

    /// Resume after the `(start_date, id)` of the last entry consumed
    pub fn stream_after(
        &self,
        start_date: DateTime<Utc>,
        id: i64,
    ) -> BoxStream<'static, Result<AggregatedSeriesEntry>> {
        self.scan(Some((start_date, id)))
    }

    fn scan(
        &self,
        after: Option<(DateTime<Utc>, i64)>,
    ) -> BoxStream<'static, Result<AggregatedSeriesEntry>> {
        let backend = self.backend.clone();
        let guard = self.guard.clone();
        let filter = self.filter.clone();
        let page_size = self.page_size;

        // Outer None ends the scan; inner None is the beginning
        stream::try_unfold(Some(after), move |cursor| {
            let backend = backend.clone();
            let guard = guard.clone();
            let filter = filter.clone();
            async move {
                let Some(after) = cursor else {
                    return Ok(None);
                };
                let page = guard
                    .run(
                        "aggregate_query",
                        backend.query_page(&filter, after, page_size),
                    )
                    .await?;
                let next = if (page.len() as i64) < page_size {
                    None
                } else {
                    page.last().map(|a| Some((a.start_date, a.id)))
                };
                let items =
                    stream::iter(page.into_iter().map(Ok::<AggregatedSeriesEntry, CacheError>));
                Ok::<_, CacheError>(Some((items, next)))
            }
        })
        .try_flatten()
        .boxed()
    }

    pub async fn collect(&self) -> Result<Vec<AggregatedSeriesEntry>> {
        self.stream().try_collect().await
    }
}
