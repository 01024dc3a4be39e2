//! Eviction criteria shared by the Postgres and in-memory backends.
//!
//! A policy compiles into an [`EvictionCriteria`]: a conjunction of clauses that
//! are only present when the policy's threshold is positive and the tier has the
//! column the clause reads. The same criteria can be pushed into SQL or evaluated
//! against a [`RetentionView`] of an in-memory entry.

use crate::types::{
    AggregatedSeriesEntry, FeatureEntry, InferenceCacheEntry, MetricRecord, Priority,
    RetentionPolicy, Tier, TierStats, TrainingCacheEntry,
};
use chrono::{DateTime, Duration, Utc};
use sqlx::{Postgres, QueryBuilder};

/// Physical layout of a tier's table, as far as retention cares
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TierColumns {
    pub table: &'static str,
    pub key: &'static str,
    /// Timestamp that ages an entry (last access, or creation for write-once tiers)
    pub clock: &'static str,
    pub access_count: Option<&'static str>,
    pub quality: Option<&'static str>,
    pub priority: Option<&'static str>,
    pub time_window: Option<&'static str>,
    pub expiry: bool,
}

impl Tier {
    pub fn columns(&self) -> TierColumns {
        match self {
            Tier::FeatureStore => TierColumns {
                table: "ml_feature_store",
                key: "id",
                clock: "last_accessed",
                access_count: Some("access_count"),
                quality: Some("quality_score"),
                priority: Some("priority"),
                time_window: None,
                expiry: false,
            },
            Tier::TrainingCache => TierColumns {
                table: "ml_training_cache",
                key: "cache_id",
                clock: "last_accessed",
                access_count: Some("hit_count"),
                quality: None,
                priority: None,
                time_window: None,
                expiry: false,
            },
            Tier::InferenceCache => TierColumns {
                table: "ml_inference_cache",
                key: "cache_key",
                clock: "last_accessed",
                access_count: Some("hit_count"),
                quality: None,
                priority: None,
                time_window: None,
                expiry: true,
            },
            Tier::AggregatedSeries => TierColumns {
                table: "aggregated_time_series",
                key: "id",
                clock: "last_updated",
                access_count: None,
                quality: None,
                priority: None,
                time_window: Some("time_window"),
                expiry: false,
            },
            Tier::PerformanceMetrics => TierColumns {
                table: "ml_performance_metrics",
                key: "id",
                clock: "recorded_at",
                access_count: None,
                quality: None,
                priority: None,
                time_window: None,
                expiry: false,
            },
        }
    }

    /// Column averaged into [`TierStats::avg_quality`]
    fn score_column(&self) -> Option<&'static str> {
        match self {
            Tier::FeatureStore => Some("quality_score"),
            Tier::InferenceCache => Some("confidence"),
            _ => None,
        }
    }

    /// Estimated storage footprint of one entry, in megabytes
    pub fn estimated_record_mb(&self) -> f64 {
        match self {
            Tier::FeatureStore => 0.002,
            Tier::TrainingCache => 0.1,
            Tier::InferenceCache => 0.0005,
            Tier::AggregatedSeries => 0.001,
            Tier::PerformanceMetrics => 0.0001,
        }
    }
}

/// The retention-relevant fields of one stored entry
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetentionView<'a> {
    pub clock: DateTime<Utc>,
    pub access_count: Option<i64>,
    pub quality: Option<f64>,
    pub priority: Option<Priority>,
    pub time_window: Option<&'a str>,
    pub expires_at: Option<DateTime<Utc>>,
    pub is_valid: bool,
}

/// Entries that retention policies can evaluate
pub trait Retainable {
    fn retention_view(&self) -> RetentionView<'_>;
}

impl Retainable for FeatureEntry {
    fn retention_view(&self) -> RetentionView<'_> {
        RetentionView {
            clock: self.last_accessed,
            access_count: Some(self.access_count),
            quality: Some(self.quality_score),
            priority: Some(self.priority),
            time_window: None,
            expires_at: None,
            is_valid: true,
        }
    }
}

impl Retainable for TrainingCacheEntry {
    fn retention_view(&self) -> RetentionView<'_> {
        RetentionView {
            clock: self.last_accessed,
            access_count: Some(self.hit_count),
            quality: None,
            priority: None,
            time_window: None,
            expires_at: self.expires_at,
            is_valid: true,
        }
    }
}

impl Retainable for InferenceCacheEntry {
    fn retention_view(&self) -> RetentionView<'_> {
        RetentionView {
            clock: self.last_accessed,
            access_count: Some(self.hit_count),
            quality: self.confidence,
            priority: None,
            time_window: None,
            expires_at: Some(self.expires_at),
            is_valid: self.is_valid,
        }
    }
}

impl Retainable for AggregatedSeriesEntry {
    fn retention_view(&self) -> RetentionView<'_> {
        RetentionView {
            clock: self.last_updated,
            access_count: None,
            quality: None,
            priority: None,
            time_window: Some(self.time_window.as_str()),
            expires_at: None,
            is_valid: true,
        }
    }
}

impl Retainable for MetricRecord {
    fn retention_view(&self) -> RetentionView<'_> {
        RetentionView {
            clock: self.recorded_at,
            access_count: None,
            quality: None,
            priority: None,
            time_window: None,
            expires_at: None,
            is_valid: true,
        }
    }
}

/// Conjunction of eviction clauses for one tier
#[derive(Debug, Clone, PartialEq)]
pub struct EvictionCriteria {
    pub tier: Tier,
    pub accessed_before: Option<DateTime<Utc>>,
    pub access_count_below: Option<i64>,
    pub quality_below: Option<f64>,
    /// Priorities eligible for eviction, lowest first
    pub priorities: Option<Vec<Priority>>,
    pub time_window: Option<String>,
    /// Inference only: expired as of this instant, or invalidated
    pub expired_as_of: Option<DateTime<Utc>>,
}

impl EvictionCriteria {
    pub fn for_policy(policy: &RetentionPolicy, now: DateTime<Utc>) -> Self {
        let columns = policy.tier.columns();

        let accessed_before =
            (policy.retention_days > 0).then(|| now - Duration::days(policy.retention_days as i64));
        let access_count_below = (policy.min_access_count > 0 && columns.access_count.is_some())
            .then_some(policy.min_access_count);
        let quality_below = (policy.min_quality_score > 0.0 && columns.quality.is_some())
            .then_some(policy.min_quality_score);
        let priorities = policy
            .priority_threshold
            .filter(|threshold| *threshold < Priority::Critical && columns.priority.is_some())
            .map(|threshold| {
                Priority::ALL
                    .iter()
                    .copied()
                    .filter(|p| *p <= threshold)
                    .collect()
            });
        let time_window = policy
            .time_window
            .clone()
            .filter(|w| !w.is_empty() && columns.time_window.is_some());
        let expired_as_of = columns.expiry.then_some(now);

        Self {
            tier: policy.tier,
            accessed_before,
            access_count_below,
            quality_below,
            priorities,
            time_window,
            expired_as_of,
        }
    }

    /// True when no clause constrains the match, i.e. it would select the whole tier
    pub fn is_unbounded(&self) -> bool {
        self.accessed_before.is_none()
            && self.access_count_below.is_none()
            && self.quality_below.is_none()
            && self.priorities.is_none()
            && self.time_window.is_none()
            && self.expired_as_of.is_none()
    }

    pub fn matches(&self, view: &RetentionView<'_>) -> bool {
        if let Some(cutoff) = self.accessed_before {
            if view.clock >= cutoff {
                return false;
            }
        }
        if let Some(min) = self.access_count_below {
            if view.access_count.is_none_or(|count| count >= min) {
                return false;
            }
        }
        if let Some(min) = self.quality_below {
            if view.quality.is_none_or(|quality| quality >= min) {
                return false;
            }
        }
        if let Some(priorities) = &self.priorities {
            if view.priority.is_none_or(|p| !priorities.contains(&p)) {
                return false;
            }
        }
        if let Some(window) = &self.time_window {
            if view.time_window != Some(window.as_str()) {
                return false;
            }
        }
        if let Some(now) = self.expired_as_of {
            let expired = view.expires_at.is_some_and(|at| at < now);
            if !(expired || !view.is_valid) {
                return false;
            }
        }
        true
    }

    /// Append `TRUE AND <clause> AND ...` to a WHERE clause
    pub fn push_conditions(&self, qb: &mut QueryBuilder<'_, Postgres>) {
        let columns = self.tier.columns();
        qb.push(" TRUE");

        if let Some(cutoff) = self.accessed_before {
            qb.push(format!(" AND {} < ", columns.clock));
            qb.push_bind(cutoff);
        }
        if let (Some(min), Some(column)) = (self.access_count_below, columns.access_count) {
            qb.push(format!(" AND {} < ", column));
            qb.push_bind(min);
        }
        if let (Some(min), Some(column)) = (self.quality_below, columns.quality) {
            qb.push(format!(" AND {} < ", column));
            qb.push_bind(min);
        }
        if let (Some(priorities), Some(column)) = (&self.priorities, columns.priority) {
            let names: Vec<String> = priorities.iter().map(|p| p.as_str().to_string()).collect();
            qb.push(format!(" AND {} = ANY(", column));
            qb.push_bind(names);
            qb.push(")");
        }
        if let (Some(window), Some(column)) = (&self.time_window, columns.time_window) {
            qb.push(format!(" AND {} = ", column));
            qb.push_bind(window.clone());
        }
        if let Some(now) = self.expired_as_of {
            qb.push(" AND (expires_at < ");
            qb.push_bind(now);
            qb.push(" OR NOT is_valid)");
        }
    }
}

/// Count entries matching the criteria
pub async fn count_matching(
    executor: impl sqlx::PgExecutor<'_>,
    criteria: &EvictionCriteria,
) -> Result<i64, sqlx::Error> {
    let columns = criteria.tier.columns();
    let mut qb = QueryBuilder::<Postgres>::new(format!(
        "SELECT COUNT(*) FROM {} WHERE",
        columns.table
    ));
    criteria.push_conditions(&mut qb);
    qb.build_query_scalar::<i64>().fetch_one(executor).await
}

/// Delete up to `batch_size` matching entries.
///
/// The criteria are re-applied to the outer DELETE so a row touched between the
/// inner SELECT and the delete is skipped.
pub async fn evict_batch(
    executor: impl sqlx::PgExecutor<'_>,
    criteria: &EvictionCriteria,
    batch_size: i64,
) -> Result<u64, sqlx::Error> {
    let columns = criteria.tier.columns();
    let mut qb = QueryBuilder::<Postgres>::new(format!(
        "DELETE FROM {table} WHERE {key} IN (SELECT {key} FROM {table} WHERE",
        table = columns.table,
        key = columns.key,
    ));
    criteria.push_conditions(&mut qb);
    qb.push(" LIMIT ");
    qb.push_bind(batch_size);
    qb.push(") AND");
    criteria.push_conditions(&mut qb);

    let result = qb.build().execute(executor).await?;
    Ok(result.rows_affected())
}

/// Occupancy statistics for a tier
pub async fn tier_stats(
    executor: impl sqlx::PgExecutor<'_>,
    tier: Tier,
    now: DateTime<Utc>,
) -> Result<TierStats, sqlx::Error> {
    let columns = tier.columns();
    let avg_access = columns
        .access_count
        .map(|c| format!("AVG({})::float8", c))
        .unwrap_or_else(|| "NULL::float8".to_string());
    let avg_quality = tier
        .score_column()
        .map(|c| format!("AVG({})::float8", c))
        .unwrap_or_else(|| "NULL::float8".to_string());

    let sql = format!(
        r#"
        SELECT
            COUNT(*)::bigint,
            {avg_access},
            COUNT(*) FILTER (WHERE {clock} > $1)::bigint,
            {avg_quality}
        FROM {table}
        "#,
        clock = columns.clock,
        table = columns.table,
    );

    let (total_entries, avg_access_count, active_entries, avg_quality): (
        i64,
        Option<f64>,
        i64,
        Option<f64>,
    ) = sqlx::query_as(&sql)
        .bind(now - Duration::days(7))
        .fetch_one(executor)
        .await?;

    Ok(TierStats {
        tier,
        total_entries,
        avg_access_count,
        active_entries,
        avg_quality,
    })
}
