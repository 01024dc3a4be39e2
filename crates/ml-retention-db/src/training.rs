use crate::types::{TrainingCacheEntry, UpsertTrainingParams};
use chrono::{DateTime, Utc};
use sqlx::types::Json;

macro_rules! training_columns {
    () => {
        r#"
            cache_id, model_type, dataset_version, training_matrix, target_vector,
            validation_split, preprocessing_pipeline, feature_names, scaler_params,
            sample_count, feature_count, class_distribution, created_at, last_accessed,
            hit_count, expires_at, auto_refresh
        "#
    };
}

/// Store a prepared dataset, replacing any entry for the same model type and version.
///
/// Replacement resets the hit counter and both timestamps.
pub async fn upsert(
    executor: impl sqlx::PgExecutor<'_>,
    p: &UpsertTrainingParams,
    now: DateTime<Utc>,
) -> Result<TrainingCacheEntry, sqlx::Error> {
    sqlx::query_as::<_, TrainingCacheEntry>(concat!(
        r#"
        INSERT INTO ml_training_cache (
            cache_id, model_type, dataset_version, training_matrix, target_vector,
            validation_split, preprocessing_pipeline, feature_names, scaler_params,
            sample_count, feature_count, class_distribution, created_at, last_accessed,
            hit_count, expires_at, auto_refresh
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $13, 0, $14, $15)
        ON CONFLICT (model_type, dataset_version) DO UPDATE SET
            training_matrix = EXCLUDED.training_matrix,
            target_vector = EXCLUDED.target_vector,
            validation_split = EXCLUDED.validation_split,
            preprocessing_pipeline = EXCLUDED.preprocessing_pipeline,
            feature_names = EXCLUDED.feature_names,
            scaler_params = EXCLUDED.scaler_params,
            sample_count = EXCLUDED.sample_count,
            feature_count = EXCLUDED.feature_count,
            class_distribution = EXCLUDED.class_distribution,
            created_at = EXCLUDED.created_at,
            last_accessed = EXCLUDED.last_accessed,
            hit_count = 0,
            expires_at = EXCLUDED.expires_at,
            auto_refresh = EXCLUDED.auto_refresh
        RETURNING
        "#,
        training_columns!()
    ))
    .bind(&p.cache_id)
    .bind(&p.model_type)
    .bind(&p.dataset_version)
    .bind(&p.training_matrix)
    .bind(&p.target_vector)
    .bind(&p.validation_split)
    .bind(Json(&p.preprocessing_pipeline))
    .bind(&p.feature_names)
    .bind(&p.scaler_params)
    .bind(p.sample_count)
    .bind(p.feature_count)
    .bind(&p.class_distribution)
    .bind(now)
    .bind(p.expires_at)
    .bind(p.auto_refresh)
    .fetch_one(executor)
    .await
}

/// Fetch an unexpired dataset, recording the hit atomically
pub async fn get_and_touch(
    executor: impl sqlx::PgExecutor<'_>,
    model_type: &str,
    dataset_version: &str,
    now: DateTime<Utc>,
) -> Result<Option<TrainingCacheEntry>, sqlx::Error> {
    sqlx::query_as::<_, TrainingCacheEntry>(concat!(
        r#"
        UPDATE ml_training_cache
        SET hit_count = hit_count + 1, last_accessed = $3
        WHERE model_type = $1 AND dataset_version = $2
          AND (expires_at IS NULL OR expires_at > $3)
        RETURNING
        "#,
        training_columns!()
    ))
    .bind(model_type)
    .bind(dataset_version)
    .bind(now)
    .fetch_optional(executor)
    .await
}

/// Delete a dataset; returns whether an entry existed
pub async fn delete(
    executor: impl sqlx::PgExecutor<'_>,
    model_type: &str,
    dataset_version: &str,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        "DELETE FROM ml_training_cache WHERE model_type = $1 AND dataset_version = $2",
    )
    .bind(model_type)
    .bind(dataset_version)
    .execute(executor)
    .await?;
    Ok(result.rows_affected() > 0)
}
