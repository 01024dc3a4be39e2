use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgRow;
use sqlx::{FromRow, Row};
use std::collections::BTreeMap;
use ts_rs::TS;

/// Declares a closed string enum stored as TEXT.
///
/// Generates `as_str`, `ALL`, `Display`, `FromStr` and `TryFrom<String>` so the
/// enum can be bound by its text form and decoded with `#[sqlx(try_from = "String")]`.
macro_rules! text_enum {
    (
        $(#[$meta:meta])*
        pub enum $name:ident { $($variant:ident => $text:literal),+ $(,)? }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
        #[ts(export, export_to = "bindings/")]
        pub enum $name {
            $(
                #[serde(rename = $text)]
                $variant,
            )+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text,)+
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl std::str::FromStr for $name {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(format!("unknown {} '{}'", stringify!($name), other)),
                }
            }
        }

        impl TryFrom<String> for $name {
            type Error = String;

            fn try_from(s: String) -> Result<Self, Self::Error> {
                s.parse()
            }
        }
    };
}

text_enum! {
    /// Storage tier managed by the engine
    pub enum Tier {
        FeatureStore => "feature_store",
        TrainingCache => "training_cache",
        InferenceCache => "inference_cache",
        AggregatedSeries => "aggregated_series",
        PerformanceMetrics => "performance_metrics",
    }
}

text_enum! {
    pub enum FeatureType {
        Environmental => "environmental",
        Spatial => "spatial",
        Temporal => "temporal",
        Species => "species",
        Aggregated => "aggregated",
    }
}

text_enum! {
    /// Retention priority, ordered `Low < Normal < High < Critical`
    #[derive(PartialOrd, Ord)]
    pub enum Priority {
        Low => "low",
        Normal => "normal",
        High => "high",
        Critical => "critical",
    }
}

text_enum! {
    pub enum SourceType {
        Climate => "climate",
        Ecoregion => "ecoregion",
        Species => "species",
        Mixed => "mixed",
    }
}

text_enum! {
    pub enum TimeWindow {
        Daily => "daily",
        Weekly => "weekly",
        Monthly => "monthly",
        Seasonal => "seasonal",
        Yearly => "yearly",
    }
}

text_enum! {
    pub enum PolicyAction {
        Delete => "delete",
        Archive => "archive",
        Compress => "compress",
    }
}

text_enum! {
    pub enum MetricType {
        CacheHitRatio => "cache_hit_ratio",
        TimeSavedMs => "time_saved_ms",
        PreparationTimeMs => "preparation_time_ms",
        RecordsEvicted => "records_evicted",
        SpaceFreedMb => "space_freed_mb",
        PolicyFailure => "policy_failure",
    }
}

impl Priority {
    /// Priority derived from a feature's quality score, with its retention horizon in days
    pub fn from_quality(quality_score: f64) -> (Priority, i32) {
        if quality_score >= 0.9 {
            (Priority::Critical, 730)
        } else if quality_score >= 0.7 {
            (Priority::High, 365)
        } else if quality_score >= 0.5 {
            (Priority::Normal, 180)
        } else {
            (Priority::Low, 90)
        }
    }
}

// ---------------------------------------------------------------------------
// Feature store
// ---------------------------------------------------------------------------

/// Feature store row returned from SELECT queries
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct FeatureEntry {
    pub id: i64,
    pub source_id: String,
    pub source_table: String,
    #[sqlx(try_from = "String")]
    pub feature_type: FeatureType,
    pub feature_vector: serde_json::Value,
    pub content_hash: String,
    pub temporal_window: Option<String>,
    pub spatial_resolution: Option<f64>,
    pub location_bucket: Option<String>,
    pub quality_score: f64,
    pub computed_at: DateTime<Utc>,
    pub last_accessed: DateTime<Utc>,
    pub access_count: i64,
    pub retention_days: i32,
    #[sqlx(try_from = "String")]
    pub priority: Priority,
}

/// Parameters for inserting a feature entry
#[derive(Debug, Clone)]
pub struct UpsertFeatureParams {
    pub source_id: String,
    pub source_table: String,
    pub feature_type: FeatureType,
    pub feature_vector: serde_json::Value,
    pub content_hash: String,
    pub temporal_window: Option<String>,
    pub spatial_resolution: Option<f64>,
    pub location_bucket: Option<String>,
    pub quality_score: f64,
    pub retention_days: i32,
    pub priority: Priority,
}

/// Filter for feature store scans
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureFilter {
    pub feature_type: FeatureType,
    pub temporal_window: Option<String>,
    pub location_bucket: Option<String>,
}

impl FeatureFilter {
    pub fn matches(&self, entry: &FeatureEntry) -> bool {
        entry.feature_type == self.feature_type
            && self
                .temporal_window
                .as_deref()
                .is_none_or(|w| entry.temporal_window.as_deref() == Some(w))
            && self
                .location_bucket
                .as_deref()
                .is_none_or(|b| entry.location_bucket.as_deref() == Some(b))
    }
}

// ---------------------------------------------------------------------------
// Training cache
// ---------------------------------------------------------------------------

/// A single named preprocessing step and its parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineStep {
    pub name: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

/// Training cache row returned from SELECT queries
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct TrainingCacheEntry {
    pub cache_id: String,
    pub model_type: String,
    pub dataset_version: String,
    pub training_matrix: Vec<u8>,
    pub target_vector: Vec<u8>,
    pub validation_split: serde_json::Value,
    #[sqlx(json)]
    pub preprocessing_pipeline: Vec<PipelineStep>,
    pub feature_names: Vec<String>,
    pub scaler_params: serde_json::Value,
    pub sample_count: i64,
    pub feature_count: i64,
    pub class_distribution: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub last_accessed: DateTime<Utc>,
    pub hit_count: i64,
    pub expires_at: Option<DateTime<Utc>>,
    pub auto_refresh: bool,
}

impl TrainingCacheEntry {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// Parameters for storing a prepared dataset (overwrites any existing version)
#[derive(Debug, Clone)]
pub struct UpsertTrainingParams {
    pub cache_id: String,
    pub model_type: String,
    pub dataset_version: String,
    pub training_matrix: Vec<u8>,
    pub target_vector: Vec<u8>,
    pub validation_split: serde_json::Value,
    pub preprocessing_pipeline: Vec<PipelineStep>,
    pub feature_names: Vec<String>,
    pub scaler_params: serde_json::Value,
    pub sample_count: i64,
    pub feature_count: i64,
    pub class_distribution: Option<serde_json::Value>,
    pub expires_at: Option<DateTime<Utc>>,
    pub auto_refresh: bool,
}

// ---------------------------------------------------------------------------
// Inference cache
// ---------------------------------------------------------------------------

/// Inference cache row returned from SELECT queries
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct InferenceCacheEntry {
    pub cache_key: String,
    pub model_id: String,
    pub input_hash: String,
    pub input_summary: serde_json::Value,
    pub prediction: serde_json::Value,
    pub confidence: Option<f64>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub spatial_bucket: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_accessed: DateTime<Utc>,
    pub hit_count: i64,
    pub computation_time_ms: Option<f64>,
    pub expires_at: DateTime<Utc>,
    pub is_valid: bool,
}

impl InferenceCacheEntry {
    /// Whether a Get at `now` may serve this entry
    pub fn is_servable(&self, now: DateTime<Utc>) -> bool {
        self.is_valid && now <= self.expires_at
    }
}

#[derive(Debug, Clone)]
pub struct UpsertInferenceParams {
    pub cache_key: String,
    pub model_id: String,
    pub input_hash: String,
    pub input_summary: serde_json::Value,
    pub prediction: serde_json::Value,
    pub confidence: Option<f64>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub spatial_bucket: Option<String>,
    pub computation_time_ms: Option<f64>,
    pub expires_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Aggregated time series
// ---------------------------------------------------------------------------

/// Summary statistics for one variable within an aggregation window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct StatSummary {
    pub mean: f64,
    pub min: f64,
    pub max: f64,
    pub std: f64,
    pub count: i64,
}

/// Aggregated series row returned from SELECT queries
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct AggregatedSeriesEntry {
    pub id: i64,
    #[sqlx(try_from = "String")]
    pub source_type: SourceType,
    pub location_grid: String,
    pub center_lat: f64,
    pub center_lon: f64,
    pub bucket_size: f64,
    #[sqlx(try_from = "String")]
    pub time_window: TimeWindow,
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
    pub sample_count: i64,
    #[sqlx(json)]
    pub statistics: BTreeMap<String, StatSummary>,
    pub derived_indices: serde_json::Value,
    pub provenance: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct UpsertAggregateParams {
    pub source_type: SourceType,
    pub location_grid: String,
    pub center_lat: f64,
    pub center_lon: f64,
    pub bucket_size: f64,
    pub time_window: TimeWindow,
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
    pub sample_count: i64,
    pub statistics: BTreeMap<String, StatSummary>,
    pub derived_indices: serde_json::Value,
    pub provenance: Vec<String>,
}

/// Filter for aggregated series scans.
///
/// The date range selects windows overlapping `[from, to)`.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregateFilter {
    pub source_type: SourceType,
    pub location_grid: Option<String>,
    pub time_window: Option<TimeWindow>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
}

impl AggregateFilter {
    pub fn matches(&self, entry: &AggregatedSeriesEntry) -> bool {
        entry.source_type == self.source_type
            && self
                .location_grid
                .as_deref()
                .is_none_or(|g| entry.location_grid == g)
            && self.time_window.is_none_or(|w| entry.time_window == w)
            && self.from.is_none_or(|from| entry.end_date > from)
            && self.to.is_none_or(|to| entry.start_date < to)
    }
}

// ---------------------------------------------------------------------------
// Performance metrics
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct MetricRecord {
    pub id: i64,
    #[sqlx(try_from = "String")]
    pub metric_type: MetricType,
    pub value: f64,
    pub unit: String,
    pub model_type: Option<String>,
    pub operation_type: Option<String>,
    pub recorded_at: DateTime<Utc>,
    pub metadata: serde_json::Value,
}

#[derive(Debug, Clone)]
pub struct NewMetric {
    pub metric_type: MetricType,
    pub value: f64,
    pub unit: String,
    pub model_type: Option<String>,
    pub operation_type: Option<String>,
    pub recorded_at: DateTime<Utc>,
    pub metadata: serde_json::Value,
}

/// Daily rollup of one metric type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export, export_to = "bindings/")]
pub struct DailyMetricAggregate {
    pub day: NaiveDate,
    pub metric_type: String,
    pub avg_value: f64,
    pub max_value: f64,
    pub min_value: f64,
    pub sample_count: i64,
}

// ---------------------------------------------------------------------------
// Retention policies
// ---------------------------------------------------------------------------

/// A declarative eviction rule bound to one tier, plus its running counters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export, export_to = "bindings/")]
pub struct RetentionPolicy {
    pub policy_id: String,
    pub name: String,
    pub description: String,
    pub tier: Tier,
    pub retention_days: i32,
    pub min_access_count: i64,
    pub min_quality_score: f64,
    #[ts(optional)]
    pub priority_threshold: Option<Priority>,
    #[ts(optional)]
    pub time_window: Option<String>,
    pub action: PolicyAction,
    pub enabled: bool,
    pub execution_interval_hours: i32,
    #[ts(optional)]
    pub last_executed: Option<DateTime<Utc>>,
    #[ts(optional)]
    pub next_execution: Option<DateTime<Utc>>,
    #[ts(optional)]
    pub last_error: Option<String>,
    pub records_processed: i64,
    pub records_deleted: i64,
    pub space_freed_mb: f64,
}

impl RetentionPolicy {
    /// A policy with every threshold disabled and no execution history
    pub fn new(policy_id: &str, name: &str, tier: Tier, retention_days: i32) -> Self {
        Self {
            policy_id: policy_id.to_string(),
            name: name.to_string(),
            description: String::new(),
            tier,
            retention_days,
            min_access_count: 0,
            min_quality_score: 0.0,
            priority_threshold: None,
            time_window: None,
            action: PolicyAction::Delete,
            enabled: true,
            execution_interval_hours: 24,
            last_executed: None,
            next_execution: None,
            last_error: None,
            records_processed: 0,
            records_deleted: 0,
            space_freed_mb: 0.0,
        }
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.enabled && self.next_execution.is_none_or(|next| next <= now)
    }
}

fn decode_text<T>(row: &PgRow, column: &str) -> Result<T, sqlx::Error>
where
    T: std::str::FromStr<Err = String>,
{
    let raw: String = row.try_get(column)?;
    raw.parse().map_err(|e: String| sqlx::Error::ColumnDecode {
        index: column.to_string(),
        source: e.into(),
    })
}

impl<'r> FromRow<'r, PgRow> for RetentionPolicy {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        let priority_threshold = row
            .try_get::<Option<String>, _>("priority_threshold")?
            .map(|raw| {
                raw.parse::<Priority>()
                    .map_err(|e| sqlx::Error::ColumnDecode {
                        index: "priority_threshold".to_string(),
                        source: e.into(),
                    })
            })
            .transpose()?;

        Ok(Self {
            policy_id: row.try_get("policy_id")?,
            name: row.try_get("name")?,
            description: row.try_get("description")?,
            tier: decode_text(row, "tier")?,
            retention_days: row.try_get("retention_days")?,
            min_access_count: row.try_get("min_access_count")?,
            min_quality_score: row.try_get("min_quality_score")?,
            priority_threshold,
            time_window: row.try_get("time_window")?,
            action: decode_text(row, "action")?,
            enabled: row.try_get("enabled")?,
            execution_interval_hours: row.try_get("execution_interval_hours")?,
            last_executed: row.try_get("last_executed")?,
            next_execution: row.try_get("next_execution")?,
            last_error: row.try_get("last_error")?,
            records_processed: row.try_get("records_processed")?,
            records_deleted: row.try_get("records_deleted")?,
            space_freed_mb: row.try_get("space_freed_mb")?,
        })
    }
}

// ---------------------------------------------------------------------------
// Statistics
// ---------------------------------------------------------------------------

/// Per-tier occupancy snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export, export_to = "bindings/")]
pub struct TierStats {
    pub tier: Tier,
    pub total_entries: i64,
    #[ts(optional)]
    pub avg_access_count: Option<f64>,
    /// Entries touched within the last seven days
    pub active_entries: i64,
    /// Average quality score (features) or confidence (inference)
    #[ts(optional)]
    pub avg_quality: Option<f64>,
}
