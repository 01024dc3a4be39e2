//! Threshold alerts over cache performance.
//!
//! An [`Observation`] is taken from hit counters, tier occupancy and storage
//! latency, evaluated against [`AlertThresholds`], and each (metric, level) pair
//! is raised at most once per cooldown.

use crate::error::Result;
use crate::health::{HealthStatus, StorageHealth};
use crate::metrics::{MetricsRecorder, TierHitRate};
use crate::retention::RetentionEngine;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use ml_retention_db::{DailyMetricAggregate, MetricType, Tier, TierStats};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use tokio::sync::Mutex;
use tracing::{error, warn};
use ts_rs::TS;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, TS)]
#[serde(rename_all = "lowercase")]
#[ts(export, export_to = "bindings/")]
pub enum AlertLevel {
    Warning,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, TS)]
#[serde(rename_all = "snake_case")]
#[ts(export, export_to = "bindings/")]
pub enum AlertMetric {
    CacheHitRatio,
    ResponseTime,
    SpaceUsage,
    DataQuality,
}

impl AlertMetric {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertMetric::CacheHitRatio => "cache_hit_ratio",
            AlertMetric::ResponseTime => "response_time",
            AlertMetric::SpaceUsage => "space_usage",
            AlertMetric::DataQuality => "data_quality",
        }
    }
}

impl fmt::Display for AlertMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Warning and error bounds of one metric
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bound {
    pub warn: f64,
    pub error: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AlertThresholds {
    /// Warns below `warn`, errors at or below `error`
    pub hit_ratio: Bound,
    /// Warns above `warn`, errors at or above `error`
    pub response_time_ms: Bound,
    /// Estimated footprint of all tiers. Warns above `warn`, errors at or above `error`
    pub space_gb: Bound,
    /// Mean feature quality. Warns below `warn`, errors at or below `error`
    pub quality: Bound,
}

impl Default for AlertThresholds {
    fn default() -> Self {
        Self {
            hit_ratio: Bound { warn: 0.6, error: 0.4 },
            response_time_ms: Bound { warn: 500.0, error: 1000.0 },
            space_gb: Bound { warn: 10.0, error: 15.0 },
            quality: Bound { warn: 0.7, error: 0.5 },
        }
    }
}

/// Inputs alerts are evaluated on. An absent input raises nothing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export, export_to = "bindings/")]
pub struct Observation {
    #[ts(optional)]
    pub hit_ratio: Option<f64>,
    #[ts(optional)]
    pub response_time_ms: Option<f64>,
    #[ts(optional)]
    pub space_mb: Option<f64>,
    #[ts(optional)]
    pub quality: Option<f64>,
}

impl Observation {
    pub fn from_parts(
        hit_rates: &[TierHitRate],
        tiers: &[TierStats],
        response_time_ms: Option<f64>,
    ) -> Self {
        let (hits, misses) = hit_rates
            .iter()
            .fold((0u64, 0u64), |(h, m), rate| (h + rate.hits, m + rate.misses));
        let lookups = hits + misses;

        let space_mb = (!tiers.is_empty()).then(|| {
            tiers
                .iter()
                .map(|s| s.total_entries.max(0) as f64 * s.tier.estimated_record_mb())
                .sum()
        });
        let quality = tiers
            .iter()
            .find(|s| s.tier == Tier::FeatureStore)
            .and_then(|s| s.avg_quality);

        Self {
            hit_ratio: (lookups > 0).then(|| hits as f64 / lookups as f64),
            response_time_ms,
            space_mb,
            quality,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export, export_to = "bindings/")]
pub struct Alert {
    pub metric: AlertMetric,
    pub level: AlertLevel,
    pub value: f64,
    pub threshold: f64,
    pub message: String,
    pub raised_at: DateTime<Utc>,
}

/// Every alert the observation currently warrants, ignoring cooldowns
pub fn evaluate(
    observation: &Observation,
    thresholds: &AlertThresholds,
    now: DateTime<Utc>,
) -> Vec<Alert> {
    let mut alerts = Vec::new();
    let mut raise = |metric, level, value, threshold, message| {
        alerts.push(Alert {
            metric,
            level,
            value,
            threshold,
            message,
            raised_at: now,
        })
    };

    if let Some(ratio) = observation.hit_ratio {
        let bound = thresholds.hit_ratio;
        if ratio < bound.warn {
            let level = if ratio <= bound.error { AlertLevel::Error } else { AlertLevel::Warning };
            raise(
                AlertMetric::CacheHitRatio,
                level,
                ratio,
                bound.warn,
                format!(
                    "cache hit ratio {:.1}% is below {:.1}%",
                    ratio * 100.0,
                    bound.warn * 100.0
                ),
            );
        }
    }

    if let Some(ms) = observation.response_time_ms {
        let bound = thresholds.response_time_ms;
        if ms > bound.warn {
            let level = if ms >= bound.error { AlertLevel::Error } else { AlertLevel::Warning };
            raise(
                AlertMetric::ResponseTime,
                level,
                ms,
                bound.warn,
                format!("storage response time {:.1}ms exceeds {:.0}ms", ms, bound.warn),
            );
        }
    }

    if let Some(mb) = observation.space_mb {
        let gb = mb / 1024.0;
        let bound = thresholds.space_gb;
        if gb > bound.warn {
            let level = if gb >= bound.error { AlertLevel::Error } else { AlertLevel::Warning };
            raise(
                AlertMetric::SpaceUsage,
                level,
                gb,
                bound.warn,
                format!("estimated cache size {:.1}GB exceeds {:.0}GB", gb, bound.warn),
            );
        }
    }

    if let Some(quality) = observation.quality {
        let bound = thresholds.quality;
        if quality < bound.warn {
            let level = if quality <= bound.error { AlertLevel::Error } else { AlertLevel::Warning };
            raise(
                AlertMetric::DataQuality,
                level,
                quality,
                bound.warn,
                format!("mean feature quality {:.2} is below {:.2}", quality, bound.warn),
            );
        }
    }

    alerts
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, TS)]
#[serde(rename_all = "lowercase")]
#[ts(export, export_to = "bindings/")]
pub enum Trend {
    Improving,
    Stable,
    Degrading,
}

/// Mean of the later half of a series against the earlier half, with a 5% dead band
pub fn trend(values: &[f64]) -> Trend {
    if values.len() < 2 {
        return Trend::Stable;
    }
    let mean = |s: &[f64]| s.iter().sum::<f64>() / s.len() as f64;
    let mid = values.len() / 2;
    let (earlier, later) = (mean(&values[..mid]), mean(&values[mid..]));

    if later > earlier * 1.05 {
        Trend::Improving
    } else if later < earlier * 0.95 {
        Trend::Degrading
    } else {
        Trend::Stable
    }
}

/// Daily mean hit ratios, oldest first
pub fn daily_hit_ratios(daily: &[DailyMetricAggregate]) -> Vec<f64> {
    let mut days: Vec<_> = daily
        .iter()
        .filter(|d| d.metric_type == MetricType::CacheHitRatio.as_str())
        .map(|d| (d.day, d.avg_value))
        .collect();
    days.sort_by_key(|(day, _)| *day);
    days.into_iter().map(|(_, ratio)| ratio).collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, TS)]
#[serde(rename_all = "lowercase")]
#[ts(export, export_to = "bindings/")]
pub enum SystemStatus {
    Healthy,
    Degraded,
    Critical,
}

/// Error-level alerts make the system critical; warnings or failing storage degrade it
pub fn rollup(storage: HealthStatus, alerts: &[Alert]) -> SystemStatus {
    if alerts.iter().any(|a| a.level == AlertLevel::Error) {
        SystemStatus::Critical
    } else if storage == HealthStatus::Degraded || !alerts.is_empty() {
        SystemStatus::Degraded
    } else {
        SystemStatus::Healthy
    }
}

pub fn recommendations(alerts: &[Alert]) -> Vec<String> {
    let mut out = Vec::new();
    for metric in [
        AlertMetric::CacheHitRatio,
        AlertMetric::ResponseTime,
        AlertMetric::SpaceUsage,
        AlertMetric::DataQuality,
    ] {
        if !alerts.iter().any(|a| a.metric == metric) {
            continue;
        }
        let advice: &[&str] = match metric {
            AlertMetric::CacheHitRatio => &[
                "Raise the inference cache TTL",
                "Relax feature store policies for frequently reused sources",
            ],
            AlertMetric::ResponseTime => &[
                "Check database load and connection pool size",
                "Lower the eviction batch size if retention runs overlap with peak traffic",
            ],
            AlertMetric::SpaceUsage => &[
                "Run retention policies more often",
                "Shorten retention windows on the largest tiers",
            ],
            AlertMetric::DataQuality => &["Review the producers of low-quality features"],
        };
        out.extend(advice.iter().map(|s| s.to_string()));
    }
    if out.is_empty() {
        out.push("No action needed".to_string());
    }
    out
}

#[derive(Debug, Clone, PartialEq, Serialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export, export_to = "bindings/")]
pub struct PerformanceReport {
    pub generated_at: DateTime<Utc>,
    pub period_days: i64,
    pub status: SystemStatus,
    pub observation: Observation,
    pub hit_ratio_trend: Trend,
    pub alerts: Vec<Alert>,
    pub recent_alerts: Vec<Alert>,
    pub recommendations: Vec<String>,
}

#[derive(Default)]
struct MonitorState {
    last_raised: HashMap<(AlertMetric, AlertLevel), DateTime<Utc>>,
    latest: Observation,
    active: Vec<Alert>,
    history: VecDeque<Alert>,
}

/// Evaluates observations and keeps the alerts they raised
pub struct AlertMonitor {
    thresholds: AlertThresholds,
    cooldown: ChronoDuration,
    history_limit: usize,
    state: Mutex<MonitorState>,
}

impl AlertMonitor {
    pub fn new(thresholds: AlertThresholds, cooldown: ChronoDuration, history_limit: usize) -> Self {
        Self {
            thresholds,
            cooldown,
            history_limit: history_limit.max(1),
            state: Mutex::new(MonitorState::default()),
        }
    }

    /// Evaluate and return the alerts that were raised now, i.e. not still
    /// cooling down from an earlier raise of the same metric and level
    pub async fn check(&self, observation: Observation, now: DateTime<Utc>) -> Vec<Alert> {
        let alerts = evaluate(&observation, &self.thresholds, now);
        let mut state = self.state.lock().await;
        let mut raised = Vec::new();

        for alert in &alerts {
            let key = (alert.metric, alert.level);
            if state
                .last_raised
                .get(&key)
                .is_some_and(|at| now - *at <= self.cooldown)
            {
                continue;
            }
            state.last_raised.insert(key, now);

            match alert.level {
                AlertLevel::Warning => warn!(
                    metric = %alert.metric,
                    value = alert.value,
                    threshold = alert.threshold,
                    message = %alert.message,
                    "Performance alert"
                ),
                AlertLevel::Error => error!(
                    metric = %alert.metric,
                    value = alert.value,
                    threshold = alert.threshold,
                    message = %alert.message,
                    "Performance alert"
                ),
            }
            state.history.push_front(alert.clone());
            raised.push(alert.clone());
        }
        let limit = self.history_limit;
        state.history.truncate(limit);

        state.latest = observation;
        state.active = alerts;
        raised
    }

    /// Alerts warranted by the latest observation
    pub async fn active(&self) -> Vec<Alert> {
        self.state.lock().await.active.clone()
    }

    pub async fn latest(&self) -> Observation {
        self.state.lock().await.latest.clone()
    }

    /// Raised alerts, newest first
    pub async fn history(&self, limit: usize) -> Vec<Alert> {
        self.state
            .lock()
            .await
            .history
            .iter()
            .take(limit)
            .cloned()
            .collect()
    }
}

/// Read the current inputs. This starts a new storage latency window.
pub async fn observe(
    retention: &RetentionEngine,
    metrics: &MetricsRecorder,
    health: &StorageHealth,
) -> Result<Observation> {
    let tiers = retention.tier_stats().await?;
    Ok(Observation::from_parts(
        &metrics.snapshot(),
        &tiers,
        health.take_latency_ms(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn now() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2025-03-01T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    fn level_for(observation: Observation) -> Option<AlertLevel> {
        let alerts = evaluate(&observation, &AlertThresholds::default(), now());
        assert!(alerts.len() <= 1);
        alerts.first().map(|a| a.level)
    }

    fn hit(ratio: f64) -> Observation {
        Observation {
            hit_ratio: Some(ratio),
            ..Default::default()
        }
    }

    #[test]
    fn test_hit_ratio_boundaries() {
        assert_eq!(level_for(hit(0.6)), None);
        assert_eq!(level_for(hit(0.59)), Some(AlertLevel::Warning));
        assert_eq!(level_for(hit(0.41)), Some(AlertLevel::Warning));
        assert_eq!(level_for(hit(0.4)), Some(AlertLevel::Error));
    }

    #[test]
    fn test_response_time_boundaries() {
        let at = |ms: f64| Observation {
            response_time_ms: Some(ms),
            ..Default::default()
        };
        assert_eq!(level_for(at(500.0)), None);
        assert_eq!(level_for(at(500.1)), Some(AlertLevel::Warning));
        assert_eq!(level_for(at(999.9)), Some(AlertLevel::Warning));
        assert_eq!(level_for(at(1000.0)), Some(AlertLevel::Error));
    }

    #[test]
    fn test_space_boundaries_in_gigabytes() {
        let at = |gb: f64| Observation {
            space_mb: Some(gb * 1024.0),
            ..Default::default()
        };
        assert_eq!(level_for(at(10.0)), None);
        assert_eq!(level_for(at(10.5)), Some(AlertLevel::Warning));
        assert_eq!(level_for(at(15.0)), Some(AlertLevel::Error));
    }

    #[test]
    fn test_quality_boundaries() {
        let at = |q: f64| Observation {
            quality: Some(q),
            ..Default::default()
        };
        assert_eq!(level_for(at(0.7)), None);
        assert_eq!(level_for(at(0.69)), Some(AlertLevel::Warning));
        assert_eq!(level_for(at(0.5)), Some(AlertLevel::Error));
    }

    #[test]
    fn test_missing_inputs_raise_nothing() {
        assert!(evaluate(&Observation::default(), &AlertThresholds::default(), now()).is_empty());
    }

    #[test]
    fn test_observation_from_parts() {
        let rates = vec![
            TierHitRate {
                tier: Tier::FeatureStore,
                hits: 3,
                misses: 1,
                hit_ratio: 0.75,
                time_saved_ms: 0.0,
            },
            TierHitRate {
                tier: Tier::InferenceCache,
                hits: 0,
                misses: 4,
                hit_ratio: 0.0,
                time_saved_ms: 0.0,
            },
        ];
        let tiers = vec![
            TierStats {
                tier: Tier::FeatureStore,
                total_entries: 1000,
                avg_access_count: Some(2.0),
                active_entries: 10,
                avg_quality: Some(0.8),
            },
            TierStats {
                tier: Tier::TrainingCache,
                total_entries: 10,
                avg_access_count: None,
                active_entries: 0,
                avg_quality: None,
            },
        ];

        let observation = Observation::from_parts(&rates, &tiers, Some(12.0));
        assert_eq!(observation.hit_ratio, Some(3.0 / 8.0));
        assert!((observation.space_mb.unwrap() - 3.0).abs() < 1e-9);
        assert_eq!(observation.quality, Some(0.8));
        assert_eq!(observation.response_time_ms, Some(12.0));

        let idle = Observation::from_parts(&[], &[], None);
        assert_eq!(idle, Observation::default());
    }

    #[tokio::test]
    async fn test_cooldown_suppresses_repeats() {
        let monitor = AlertMonitor::new(AlertThresholds::default(), ChronoDuration::minutes(15), 10);

        assert_eq!(monitor.check(hit(0.5), now()).await.len(), 1);
        // same metric and level within the cooldown
        let later = now() + ChronoDuration::minutes(15);
        assert!(monitor.check(hit(0.45), later).await.is_empty());
        assert_eq!(monitor.active().await.len(), 1);
        // escalation is a different key
        assert_eq!(monitor.check(hit(0.3), later).await.len(), 1);

        let after = now() + ChronoDuration::minutes(16);
        assert_eq!(monitor.check(hit(0.5), after).await.len(), 1);
        assert_eq!(monitor.history(10).await.len(), 3);

        // recovery clears the active set but keeps history
        monitor.check(hit(0.9), after).await;
        assert!(monitor.active().await.is_empty());
        assert_eq!(monitor.latest().await.hit_ratio, Some(0.9));
        assert_eq!(monitor.history(10).await.len(), 3);
    }

    #[test]
    fn test_trend_with_dead_band() {
        assert_eq!(trend(&[]), Trend::Stable);
        assert_eq!(trend(&[0.5]), Trend::Stable);
        assert_eq!(trend(&[0.5, 0.5, 0.6, 0.6]), Trend::Improving);
        assert_eq!(trend(&[0.8, 0.8, 0.6, 0.6]), Trend::Degrading);
        assert_eq!(trend(&[0.80, 0.82]), Trend::Stable);
    }

    #[test]
    fn test_daily_hit_ratios_sorted_by_day() {
        let row = |day: u32, metric: MetricType, avg: f64| DailyMetricAggregate {
            day: NaiveDate::from_ymd_opt(2025, 3, day).unwrap(),
            metric_type: metric.as_str().to_string(),
            avg_value: avg,
            max_value: avg,
            min_value: avg,
            sample_count: 1,
        };
        let daily = vec![
            row(3, MetricType::CacheHitRatio, 0.9),
            row(1, MetricType::CacheHitRatio, 0.5),
            row(2, MetricType::RecordsEvicted, 40.0),
        ];
        assert_eq!(daily_hit_ratios(&daily), vec![0.5, 0.9]);
    }

    #[test]
    fn test_rollup() {
        let warning = evaluate(&hit(0.5), &AlertThresholds::default(), now());
        let error = evaluate(&hit(0.1), &AlertThresholds::default(), now());
        assert_eq!(rollup(HealthStatus::Ok, &[]), SystemStatus::Healthy);
        assert_eq!(rollup(HealthStatus::Degraded, &[]), SystemStatus::Degraded);
        assert_eq!(rollup(HealthStatus::Ok, &warning), SystemStatus::Degraded);
        assert_eq!(rollup(HealthStatus::Ok, &error), SystemStatus::Critical);
    }

    #[test]
    fn test_recommendations_follow_alerts() {
        assert_eq!(recommendations(&[]), vec!["No action needed".to_string()]);
        let alerts = evaluate(&hit(0.5), &AlertThresholds::default(), now());
        let advice = recommendations(&alerts);
        assert_eq!(advice.len(), 2);
        assert!(advice[0].contains("TTL"));
    }
}
