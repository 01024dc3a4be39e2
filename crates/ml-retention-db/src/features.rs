use crate::types::{FeatureEntry, FeatureFilter, FeatureType, UpsertFeatureParams};
use chrono::{DateTime, Utc};
use sqlx::{FromRow, Postgres, QueryBuilder};

/// Column list for feature store SELECT / RETURNING clauses.
macro_rules! feature_columns {
    () => {
        r#"
            id, source_id, source_table, feature_type, feature_vector, content_hash,
            temporal_window, spatial_resolution, location_bucket, quality_score,
            computed_at, last_accessed, access_count, retention_days, priority
        "#
    };
}

#[derive(FromRow)]
struct UpsertedFeature {
    #[sqlx(flatten)]
    entry: FeatureEntry,
    inserted: bool,
}

/// Insert a feature, or touch the existing entry with the same identity.
///
/// An existing entry keeps its payload; only its access counter and
/// `last_accessed` change. Returns the stored entry and whether it was new.
pub async fn upsert(
    executor: impl sqlx::PgExecutor<'_>,
    p: &UpsertFeatureParams,
    now: DateTime<Utc>,
) -> Result<(FeatureEntry, bool), sqlx::Error> {
    let row = sqlx::query_as::<_, UpsertedFeature>(concat!(
        r#"
        INSERT INTO ml_feature_store (
            source_id, source_table, feature_type, feature_vector, content_hash,
            temporal_window, spatial_resolution, location_bucket, quality_score,
            retention_days, priority, computed_at, last_accessed, access_count
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $12, 0)
        ON CONFLICT (source_id, feature_type, content_hash) DO UPDATE SET
            access_count = ml_feature_store.access_count + 1,
            last_accessed = EXCLUDED.last_accessed
        RETURNING (xmax = 0) AS inserted,
        "#,
        feature_columns!()
    ))
    .bind(&p.source_id)
    .bind(&p.source_table)
    .bind(p.feature_type.as_str())
    .bind(&p.feature_vector)
    .bind(&p.content_hash)
    .bind(&p.temporal_window)
    .bind(p.spatial_resolution)
    .bind(&p.location_bucket)
    .bind(p.quality_score)
    .bind(p.retention_days)
    .bind(p.priority.as_str())
    .bind(now)
    .fetch_one(executor)
    .await?;

    Ok((row.entry, row.inserted))
}

/// Fetch a feature by identity, recording the access atomically
pub async fn get_and_touch(
    executor: impl sqlx::PgExecutor<'_>,
    source_id: &str,
    feature_type: FeatureType,
    content_hash: &str,
    now: DateTime<Utc>,
) -> Result<Option<FeatureEntry>, sqlx::Error> {
    sqlx::query_as::<_, FeatureEntry>(concat!(
        r#"
        UPDATE ml_feature_store
        SET access_count = access_count + 1, last_accessed = $4
        WHERE source_id = $1 AND feature_type = $2 AND content_hash = $3
        RETURNING
        "#,
        feature_columns!()
    ))
    .bind(source_id)
    .bind(feature_type.as_str())
    .bind(content_hash)
    .bind(now)
    .fetch_optional(executor)
    .await
}

/// One page of a filtered scan, keyed by id so a scan can resume after a failure
pub async fn query_page(
    executor: impl sqlx::PgExecutor<'_>,
    filter: &FeatureFilter,
    after_id: i64,
    limit: i64,
) -> Result<Vec<FeatureEntry>, sqlx::Error> {
    let mut qb = QueryBuilder::<Postgres>::new(concat!(
        "SELECT",
        feature_columns!(),
        "FROM ml_feature_store WHERE feature_type = "
    ));
    qb.push_bind(filter.feature_type.as_str());

    if let Some(window) = &filter.temporal_window {
        qb.push(" AND temporal_window = ");
        qb.push_bind(window.clone());
    }
    if let Some(bucket) = &filter.location_bucket {
        qb.push(" AND location_bucket = ");
        qb.push_bind(bucket.clone());
    }

    qb.push(" AND id > ");
    qb.push_bind(after_id);
    qb.push(" ORDER BY id LIMIT ");
    qb.push_bind(limit);

    qb.build_query_as::<FeatureEntry>().fetch_all(executor).await
}
