use chrono::{DateTime, Utc};

/// Take the execution lease for a policy.
///
/// Succeeds only when no lease exists or the current one has expired. Holders are
/// per-run tokens and a lease is never reentrant, so a second run is refused even
/// when it comes from the same process.
pub async fn try_acquire(
    executor: impl sqlx::PgExecutor<'_>,
    policy_id: &str,
    holder: &str,
    now: DateTime<Utc>,
    expires_at: DateTime<Utc>,
) -> Result<bool, sqlx::Error> {
    let row: Option<String> = sqlx::query_scalar(
        r#"
        INSERT INTO retention_leases (policy_id, holder, acquired_at, expires_at)
        VALUES ($1, $2, $3, $4)
        ON CONFLICT (policy_id) DO UPDATE SET
            holder = EXCLUDED.holder,
            acquired_at = EXCLUDED.acquired_at,
            expires_at = EXCLUDED.expires_at
        WHERE retention_leases.expires_at < $3
        RETURNING holder
        "#,
    )
    .bind(policy_id)
    .bind(holder)
    .bind(now)
    .bind(expires_at)
    .fetch_optional(executor)
    .await?;
    Ok(row.is_some())
}

/// Release a lease, but only while `holder` still owns it
pub async fn release(
    executor: impl sqlx::PgExecutor<'_>,
    policy_id: &str,
    holder: &str,
) -> Result<(), sqlx::Error> {
    sqlx::query("DELETE FROM retention_leases WHERE policy_id = $1 AND holder = $2")
        .bind(policy_id)
        .bind(holder)
        .execute(executor)
        .await?;
    Ok(())
}
