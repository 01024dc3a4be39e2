use crate::types::RetentionPolicy;
use chrono::{DateTime, Utc};

macro_rules! policy_columns {
    () => {
        r#"
            policy_id, name, description, tier, retention_days, min_access_count,
            min_quality_score, priority_threshold, time_window, action, enabled,
            execution_interval_hours, last_executed, next_execution, last_error,
            records_processed, records_deleted, space_freed_mb
        "#
    };
}

/// All policies ordered by id
pub async fn list(executor: impl sqlx::PgExecutor<'_>) -> Result<Vec<RetentionPolicy>, sqlx::Error> {
    sqlx::query_as::<_, RetentionPolicy>(concat!(
        "SELECT",
        policy_columns!(),
        "FROM retention_policies ORDER BY policy_id"
    ))
    .fetch_all(executor)
    .await
}

pub async fn get(
    executor: impl sqlx::PgExecutor<'_>,
    policy_id: &str,
) -> Result<Option<RetentionPolicy>, sqlx::Error> {
    sqlx::query_as::<_, RetentionPolicy>(concat!(
        "SELECT",
        policy_columns!(),
        "FROM retention_policies WHERE policy_id = $1"
    ))
    .bind(policy_id)
    .fetch_optional(executor)
    .await
}

/// Insert a policy unless one with the same id exists; returns whether it was inserted
pub async fn insert(
    executor: impl sqlx::PgExecutor<'_>,
    p: &RetentionPolicy,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        r#"
        INSERT INTO retention_policies (
            policy_id, name, description, tier, retention_days, min_access_count,
            min_quality_score, priority_threshold, time_window, action, enabled,
            execution_interval_hours, last_executed, next_execution, last_error,
            records_processed, records_deleted, space_freed_mb
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18)
        ON CONFLICT (policy_id) DO NOTHING
        "#,
    )
    .bind(&p.policy_id)
    .bind(&p.name)
    .bind(&p.description)
    .bind(p.tier.as_str())
    .bind(p.retention_days)
    .bind(p.min_access_count)
    .bind(p.min_quality_score)
    .bind(p.priority_threshold.map(|t| t.as_str()))
    .bind(&p.time_window)
    .bind(p.action.as_str())
    .bind(p.enabled)
    .bind(p.execution_interval_hours)
    .bind(p.last_executed)
    .bind(p.next_execution)
    .bind(&p.last_error)
    .bind(p.records_processed)
    .bind(p.records_deleted)
    .bind(p.space_freed_mb)
    .execute(executor)
    .await?;
    Ok(result.rows_affected() > 0)
}

/// Replace a policy's definition. Counters and schedule are untouched, so a run
/// finishing concurrently keeps its `next_execution`.
pub async fn update_definition(
    executor: impl sqlx::PgExecutor<'_>,
    p: &RetentionPolicy,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        r#"
        UPDATE retention_policies SET
            name = $2,
            description = $3,
            tier = $4,
            retention_days = $5,
            min_access_count = $6,
            min_quality_score = $7,
            priority_threshold = $8,
            time_window = $9,
            action = $10,
            enabled = $11,
            execution_interval_hours = $12
        WHERE policy_id = $1
        "#,
    )
    .bind(&p.policy_id)
    .bind(&p.name)
    .bind(&p.description)
    .bind(p.tier.as_str())
    .bind(p.retention_days)
    .bind(p.min_access_count)
    .bind(p.min_quality_score)
    .bind(p.priority_threshold.map(|t| t.as_str()))
    .bind(&p.time_window)
    .bind(p.action.as_str())
    .bind(p.enabled)
    .bind(p.execution_interval_hours)
    .execute(executor)
    .await?;
    Ok(result.rows_affected() > 0)
}

/// Move a policy's next run, e.g. after its interval changed
pub async fn reschedule(
    executor: impl sqlx::PgExecutor<'_>,
    policy_id: &str,
    next_execution: DateTime<Utc>,
) -> Result<bool, sqlx::Error> {
    let result =
        sqlx::query("UPDATE retention_policies SET next_execution = $2 WHERE policy_id = $1")
            .bind(policy_id)
            .bind(next_execution)
            .execute(executor)
            .await?;
    Ok(result.rows_affected() > 0)
}

pub async fn delete(executor: impl sqlx::PgExecutor<'_>, policy_id: &str) -> Result<bool, sqlx::Error> {
    let result = sqlx::query("DELETE FROM retention_policies WHERE policy_id = $1")
        .bind(policy_id)
        .execute(executor)
        .await?;
    Ok(result.rows_affected() > 0)
}

/// Fold a successful run into the policy's counters and schedule the next one
pub async fn record_success(
    executor: impl sqlx::PgExecutor<'_>,
    policy_id: &str,
    records_evicted: i64,
    space_freed_mb: f64,
    executed_at: DateTime<Utc>,
    next_execution: DateTime<Utc>,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        UPDATE retention_policies SET
            records_processed = records_processed + $2,
            records_deleted = records_deleted + $2,
            space_freed_mb = space_freed_mb + $3,
            last_executed = $4,
            next_execution = $5,
            last_error = NULL
        WHERE policy_id = $1
        "#,
    )
    .bind(policy_id)
    .bind(records_evicted)
    .bind(space_freed_mb)
    .bind(executed_at)
    .bind(next_execution)
    .execute(executor)
    .await?;
    Ok(())
}

/// Record a failed run. The schedule is left as-is so the policy is retried next
/// cycle; batches deleted before the failure still count.
pub async fn record_failure(
    executor: impl sqlx::PgExecutor<'_>,
    policy_id: &str,
    error: &str,
    records_evicted: i64,
    space_freed_mb: f64,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        UPDATE retention_policies SET
            records_processed = records_processed + $3,
            records_deleted = records_deleted + $3,
            space_freed_mb = space_freed_mb + $4,
            last_error = $2
        WHERE policy_id = $1
        "#,
    )
    .bind(policy_id)
    .bind(error)
    .bind(records_evicted)
    .bind(space_freed_mb)
    .execute(executor)
    .await?;
    Ok(())
}
