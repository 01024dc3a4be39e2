use crate::types::{InferenceCacheEntry, UpsertInferenceParams};
use chrono::{DateTime, Utc};

macro_rules! inference_columns {
    () => {
        r#"
            cache_key, model_id, input_hash, input_summary, prediction, confidence,
            latitude, longitude, spatial_bucket, created_at, last_accessed, hit_count,
            computation_time_ms, expires_at, is_valid
        "#
    };
}

/// Store a prediction, fully overwriting any entry under the same key
pub async fn upsert(
    executor: impl sqlx::PgExecutor<'_>,
    p: &UpsertInferenceParams,
    now: DateTime<Utc>,
) -> Result<InferenceCacheEntry, sqlx::Error> {
    sqlx::query_as::<_, InferenceCacheEntry>(concat!(
        r#"
        INSERT INTO ml_inference_cache (
            cache_key, model_id, input_hash, input_summary, prediction, confidence,
            latitude, longitude, spatial_bucket, created_at, last_accessed, hit_count,
            computation_time_ms, expires_at, is_valid
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $10, 0, $11, $12, TRUE)
        ON CONFLICT (cache_key) DO UPDATE SET
            model_id = EXCLUDED.model_id,
            input_hash = EXCLUDED.input_hash,
            input_summary = EXCLUDED.input_summary,
            prediction = EXCLUDED.prediction,
            confidence = EXCLUDED.confidence,
            latitude = EXCLUDED.latitude,
            longitude = EXCLUDED.longitude,
            spatial_bucket = EXCLUDED.spatial_bucket,
            created_at = EXCLUDED.created_at,
            last_accessed = EXCLUDED.last_accessed,
            hit_count = 0,
            computation_time_ms = EXCLUDED.computation_time_ms,
            expires_at = EXCLUDED.expires_at,
            is_valid = TRUE
        RETURNING
        "#,
        inference_columns!()
    ))
    .bind(&p.cache_key)
    .bind(&p.model_id)
    .bind(&p.input_hash)
    .bind(&p.input_summary)
    .bind(&p.prediction)
    .bind(p.confidence)
    .bind(p.latitude)
    .bind(p.longitude)
    .bind(&p.spatial_bucket)
    .bind(now)
    .bind(p.computation_time_ms)
    .bind(p.expires_at)
    .fetch_one(executor)
    .await
}

/// Fetch a valid, unexpired prediction, recording the hit atomically
pub async fn get_and_touch(
    executor: impl sqlx::PgExecutor<'_>,
    cache_key: &str,
    now: DateTime<Utc>,
) -> Result<Option<InferenceCacheEntry>, sqlx::Error> {
    sqlx::query_as::<_, InferenceCacheEntry>(concat!(
        r#"
        UPDATE ml_inference_cache
        SET hit_count = hit_count + 1, last_accessed = $2
        WHERE cache_key = $1 AND is_valid AND expires_at >= $2
        RETURNING
        "#,
        inference_columns!()
    ))
    .bind(cache_key)
    .bind(now)
    .fetch_optional(executor)
    .await
}

/// Delete every prediction produced by a model
pub async fn delete_for_model(
    executor: impl sqlx::PgExecutor<'_>,
    model_id: &str,
) -> Result<u64, sqlx::Error> {
    let result = sqlx::query("DELETE FROM ml_inference_cache WHERE model_id = $1")
        .bind(model_id)
        .execute(executor)
        .await?;
    Ok(result.rows_affected())
}

/// Mark every valid prediction in a spatial bucket invalid
pub async fn invalidate_bucket(
    executor: impl sqlx::PgExecutor<'_>,
    spatial_bucket: &str,
) -> Result<u64, sqlx::Error> {
    let result = sqlx::query(
        "UPDATE ml_inference_cache SET is_valid = FALSE WHERE spatial_bucket = $1 AND is_valid",
    )
    .bind(spatial_bucket)
    .execute(executor)
    .await?;
    Ok(result.rows_affected())
}
