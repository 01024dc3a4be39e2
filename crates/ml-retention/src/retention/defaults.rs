//! The policy set installed on a fresh deployment.

use chrono::{DateTime, Duration, Utc};
use ml_retention_db::{Priority, RetentionPolicy, Tier, TimeWindow};

struct Seed {
    id: &'static str,
    name: &'static str,
    description: &'static str,
    tier: Tier,
    retention_days: i32,
    min_access_count: i64,
    min_quality_score: f64,
    priority_threshold: Option<Priority>,
    time_window: Option<TimeWindow>,
    interval_hours: i32,
}

const SEEDS: &[Seed] = &[
    Seed {
        id: "fs_high_quality",
        name: "Feature store: high quality",
        description: "Keep high quality features for two years unless rarely used",
        tier: Tier::FeatureStore,
        retention_days: 730,
        min_access_count: 5,
        min_quality_score: 0.8,
        priority_threshold: Some(Priority::High),
        time_window: None,
        interval_hours: 24,
    },
    Seed {
        id: "fs_medium_quality",
        name: "Feature store: medium quality",
        description: "Keep medium quality features for one year",
        tier: Tier::FeatureStore,
        retention_days: 365,
        min_access_count: 2,
        min_quality_score: 0.6,
        priority_threshold: Some(Priority::Normal),
        time_window: None,
        interval_hours: 24,
    },
    Seed {
        id: "fs_low_quality",
        name: "Feature store: low quality",
        description: "Drop low quality, unused features after 90 days",
        tier: Tier::FeatureStore,
        retention_days: 90,
        min_access_count: 1,
        min_quality_score: 0.3,
        priority_threshold: Some(Priority::Low),
        time_window: None,
        interval_hours: 12,
    },
    Seed {
        id: "tc_frequent",
        name: "Training cache: frequent",
        description: "Datasets idle for six months with fewer than ten hits",
        tier: Tier::TrainingCache,
        retention_days: 180,
        min_access_count: 10,
        min_quality_score: 0.0,
        priority_threshold: None,
        time_window: None,
        interval_hours: 48,
    },
    Seed {
        id: "tc_occasional",
        name: "Training cache: occasional",
        description: "Datasets idle for 90 days with fewer than three hits",
        tier: Tier::TrainingCache,
        retention_days: 90,
        min_access_count: 3,
        min_quality_score: 0.0,
        priority_threshold: None,
        time_window: None,
        interval_hours: 24,
    },
    Seed {
        id: "ic_expired",
        name: "Inference cache: expired",
        description: "Reclaim expired or invalidated predictions",
        tier: Tier::InferenceCache,
        retention_days: 0,
        min_access_count: 0,
        min_quality_score: 0.0,
        priority_threshold: None,
        time_window: None,
        interval_hours: 6,
    },
    Seed {
        id: "ic_old_unused",
        name: "Inference cache: old unused",
        description: "Reclaim dead predictions untouched for a week",
        tier: Tier::InferenceCache,
        retention_days: 7,
        min_access_count: 0,
        min_quality_score: 0.0,
        priority_threshold: None,
        time_window: None,
        interval_hours: 12,
    },
    Seed {
        id: "as_seasonal",
        name: "Aggregated series: seasonal",
        description: "Seasonal aggregates not rebuilt in five years",
        tier: Tier::AggregatedSeries,
        retention_days: 1825,
        min_access_count: 1,
        min_quality_score: 0.0,
        priority_threshold: None,
        time_window: Some(TimeWindow::Seasonal),
        interval_hours: 168,
    },
    Seed {
        id: "pm_old_metrics",
        name: "Performance metrics: old",
        description: "Metric rows older than 90 days",
        tier: Tier::PerformanceMetrics,
        retention_days: 90,
        min_access_count: 0,
        min_quality_score: 0.0,
        priority_threshold: None,
        time_window: None,
        interval_hours: 24,
    },
];

/// Default policies, each first due one interval after `now`
pub fn default_policies(now: DateTime<Utc>) -> Vec<RetentionPolicy> {
    SEEDS
        .iter()
        .map(|seed| RetentionPolicy {
            description: seed.description.to_string(),
            min_access_count: seed.min_access_count,
            min_quality_score: seed.min_quality_score,
            priority_threshold: seed.priority_threshold,
            time_window: seed.time_window.map(|w| w.to_string()),
            execution_interval_hours: seed.interval_hours,
            next_execution: Some(now + Duration::hours(seed.interval_hours as i64)),
            ..RetentionPolicy::new(seed.id, seed.name, seed.tier, seed.retention_days)
        })
        .collect()
}
