use crate::types::{AggregateFilter, AggregatedSeriesEntry, UpsertAggregateParams};
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::{Postgres, QueryBuilder};

/// Insert or replace a window's statistics; returns the row id.
///
/// The id and `created_at` of an existing window are preserved.
pub async fn upsert(
    executor: impl sqlx::PgExecutor<'_>,
    p: &UpsertAggregateParams,
    now: DateTime<Utc>,
) -> Result<i64, sqlx::Error> {
    sqlx::query_scalar::<_, i64>(
        r#"
        INSERT INTO aggregated_time_series (
            source_type, location_grid, center_lat, center_lon, bucket_size,
            time_window, start_date, end_date, sample_count, statistics,
            derived_indices, provenance, created_at, last_updated
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $13)
        ON CONFLICT (source_type, location_grid, time_window, start_date) DO UPDATE SET
            center_lat = EXCLUDED.center_lat,
            center_lon = EXCLUDED.center_lon,
            bucket_size = EXCLUDED.bucket_size,
            end_date = EXCLUDED.end_date,
            sample_count = EXCLUDED.sample_count,
            statistics = EXCLUDED.statistics,
            derived_indices = EXCLUDED.derived_indices,
            provenance = EXCLUDED.provenance,
            last_updated = EXCLUDED.last_updated
        RETURNING id
        "#,
    )
    .bind(p.source_type.as_str())
    .bind(&p.location_grid)
    .bind(p.center_lat)
    .bind(p.center_lon)
    .bind(p.bucket_size)
    .bind(p.time_window.as_str())
    .bind(p.start_date)
    .bind(p.end_date)
    .bind(p.sample_count)
    .bind(Json(&p.statistics))
    .bind(&p.derived_indices)
    .bind(&p.provenance)
    .bind(now)
    .fetch_one(executor)
    .await
}

/// One page of a filtered scan ordered by `(start_date, id)`
pub async fn query_page(
    executor: impl sqlx::PgExecutor<'_>,
    filter: &AggregateFilter,
    after: Option<(DateTime<Utc>, i64)>,
    limit: i64,
) -> Result<Vec<AggregatedSeriesEntry>, sqlx::Error> {
    let mut qb = QueryBuilder::<Postgres>::new(
        r#"
        SELECT
            id, source_type, location_grid, center_lat, center_lon, bucket_size,
            time_window, start_date, end_date, sample_count, statistics,
            derived_indices, provenance, created_at, last_updated
        FROM aggregated_time_series
        WHERE source_type = "#,
    );
    qb.push_bind(filter.source_type.as_str());

    if let Some(grid) = &filter.location_grid {
        qb.push(" AND location_grid = ");
        qb.push_bind(grid.clone());
    }
    if let Some(window) = filter.time_window {
        qb.push(" AND time_window = ");
        qb.push_bind(window.as_str());
    }
    if let Some(from) = filter.from {
        qb.push(" AND end_date > ");
        qb.push_bind(from);
    }
    if let Some(to) = filter.to {
        qb.push(" AND start_date < ");
        qb.push_bind(to);
    }
    if let Some((start_date, id)) = after {
        qb.push(" AND (start_date, id) > (");
        qb.push_bind(start_date);
        qb.push(", ");
        qb.push_bind(id);
        qb.push(")");
    }

    qb.push(" ORDER BY start_date, id LIMIT ");
    qb.push_bind(limit);

    qb.build_query_as::<AggregatedSeriesEntry>()
        .fetch_all(executor)
        .await
}
