use crate::types::{DailyMetricAggregate, NewMetric};
use chrono::{DateTime, Utc};

/// Append a metric row
pub async fn insert(executor: impl sqlx::PgExecutor<'_>, m: &NewMetric) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO ml_performance_metrics (
            metric_type, value, unit, model_type, operation_type, recorded_at, metadata
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        "#,
    )
    .bind(m.metric_type.as_str())
    .bind(m.value)
    .bind(&m.unit)
    .bind(&m.model_type)
    .bind(&m.operation_type)
    .bind(m.recorded_at)
    .bind(&m.metadata)
    .execute(executor)
    .await?;
    Ok(())
}

/// Per-day rollups of every metric type recorded since `since`
pub async fn daily_aggregates(
    executor: impl sqlx::PgExecutor<'_>,
    since: DateTime<Utc>,
) -> Result<Vec<DailyMetricAggregate>, sqlx::Error> {
    sqlx::query_as::<_, DailyMetricAggregate>(
        r#"
        SELECT
            (recorded_at AT TIME ZONE 'UTC')::date AS day,
            metric_type,
            AVG(value)::float8 AS avg_value,
            MAX(value) AS max_value,
            MIN(value) AS min_value,
            COUNT(*)::bigint AS sample_count
        FROM ml_performance_metrics
        WHERE recorded_at >= $1
        GROUP BY day, metric_type
        ORDER BY day, metric_type
        "#,
    )
    .bind(since)
    .fetch_all(executor)
    .await
}
