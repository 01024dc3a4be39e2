//! Wires tier services, retention and metrics onto one storage backend.

use crate::aggregated_series::AggregatedSeriesStore;
use crate::backend::memory::MemoryStore;
use crate::backend::postgres::{PgRetentionTarget, PgStore};
use crate::backend::{
    AggregatedBackend, FeatureBackend, InferenceBackend, LeaseManager, MetricsSink, PolicyStore,
    RetentionTarget, TrainingBackend,
};
use crate::clock::{Clock, SystemClock};
use crate::config::EngineConfig;
use crate::error::Result;
use crate::feature_store::FeatureStore;
use crate::health::{HealthReport, StorageGuard, StorageHealth};
use crate::inference_cache::InferenceCache;
use crate::metrics::{MetricsRecorder, TierHitRate};
use crate::monitoring::{
    self, daily_hit_ratios, recommendations, rollup, trend, Alert, AlertMonitor, AlertThresholds,
    PerformanceReport,
};
use crate::retention::{spawn_scheduler, RetentionEngine, SchedulerHandle};
use crate::training_cache::TrainingCache;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use ml_retention_db::{PgPool, Tier, TierStats};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use ts_rs::TS;

/// Everything the ops statistics endpoint reports
#[derive(Debug, Clone, Serialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export, export_to = "bindings/")]
pub struct EngineStatistics {
    pub generated_at: DateTime<Utc>,
    pub tiers: Vec<TierStats>,
    pub hit_rates: Vec<TierHitRate>,
    pub pending_invalidations: Vec<String>,
    /// Alerts warranted by the latest performance check
    pub alerts: Vec<Alert>,
}

struct Backends {
    features: Arc<dyn FeatureBackend>,
    training: Arc<dyn TrainingBackend>,
    inference: Arc<dyn InferenceBackend>,
    aggregates: Arc<dyn AggregatedBackend>,
    metrics: Arc<dyn MetricsSink>,
    policies: Arc<dyn PolicyStore>,
    leases: Arc<dyn LeaseManager>,
    targets: HashMap<Tier, Arc<dyn RetentionTarget>>,
}

pub struct CacheEngine {
    config: EngineConfig,
    clock: Arc<dyn Clock>,
    health: Arc<StorageHealth>,
    features: Arc<FeatureStore>,
    training: Arc<TrainingCache>,
    inference: Arc<InferenceCache>,
    aggregates: Arc<AggregatedSeriesStore>,
    retention: Arc<RetentionEngine>,
    metrics: Arc<MetricsRecorder>,
    monitor: Arc<AlertMonitor>,
}

impl CacheEngine {
    /// An engine whose tiers live in process memory
    pub fn in_memory(config: EngineConfig) -> Self {
        Self::in_memory_with_clock(config, Arc::new(SystemClock))
    }

    pub fn in_memory_with_clock(config: EngineConfig, clock: Arc<dyn Clock>) -> Self {
        let store = Arc::new(MemoryStore::new());
        let targets = Tier::ALL
            .iter()
            .map(|tier| (*tier, store.retention_target(*tier)))
            .collect();
        let backends = Backends {
            features: store.clone(),
            training: store.clone(),
            inference: store.clone(),
            aggregates: store.clone(),
            metrics: store.clone(),
            policies: store.clone(),
            leases: store,
            targets,
        };
        Self::assemble(config, clock, backends)
    }

    /// An engine backed by Postgres. Run migrations on the pool first.
    pub fn postgres(pool: PgPool, config: EngineConfig) -> Self {
        let store = Arc::new(PgStore::new(pool.clone()));
        let targets = Tier::ALL
            .iter()
            .map(|tier| {
                let target: Arc<dyn RetentionTarget> =
                    Arc::new(PgRetentionTarget::new(pool.clone(), *tier));
                (*tier, target)
            })
            .collect();
        let backends = Backends {
            features: store.clone(),
            training: store.clone(),
            inference: store.clone(),
            aggregates: store.clone(),
            metrics: store.clone(),
            policies: store.clone(),
            leases: store,
            targets,
        };
        Self::assemble(config, Arc::new(SystemClock), backends)
    }

    fn assemble(config: EngineConfig, clock: Arc<dyn Clock>, backends: Backends) -> Self {
        let health = Arc::new(StorageHealth::new(config.degraded_after));
        let guard = StorageGuard::new(config.storage_timeout, health.clone());
        let metrics = Arc::new(MetricsRecorder::new(
            backends.metrics,
            clock.clone(),
            guard.clone(),
        ));

        let features = Arc::new(FeatureStore::new(
            backends.features,
            guard.clone(),
            clock.clone(),
            metrics.clone(),
            config.query_page_size,
        ));
        let training = Arc::new(TrainingCache::new(
            backends.training,
            guard.clone(),
            clock.clone(),
            metrics.clone(),
            config.training_ttl,
        ));
        let inference = Arc::new(InferenceCache::new(
            backends.inference,
            guard.clone(),
            clock.clone(),
            metrics.clone(),
            config.inference_ttl,
        ));
        let aggregates = Arc::new(AggregatedSeriesStore::new(
            backends.aggregates,
            guard.clone(),
            clock.clone(),
            config.query_page_size,
        ));
        let retention = Arc::new(RetentionEngine::new(
            backends.policies,
            backends.leases,
            backends.targets,
            metrics.clone(),
            clock.clone(),
            guard,
            &config,
        ));
        let cooldown =
            ChronoDuration::from_std(config.alert_cooldown).unwrap_or_else(|_| ChronoDuration::days(1));
        let monitor = Arc::new(AlertMonitor::new(
            AlertThresholds::default(),
            cooldown,
            config.history_limit,
        ));

        Self {
            config,
            clock,
            health,
            features,
            training,
            inference,
            aggregates,
            retention,
            metrics,
            monitor,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn features(&self) -> &Arc<FeatureStore> {
        &self.features
    }

    pub fn training(&self) -> &Arc<TrainingCache> {
        &self.training
    }

    pub fn inference(&self) -> &Arc<InferenceCache> {
        &self.inference
    }

    pub fn aggregates(&self) -> &Arc<AggregatedSeriesStore> {
        &self.aggregates
    }

    pub fn retention(&self) -> &Arc<RetentionEngine> {
        &self.retention
    }

    pub fn metrics(&self) -> &Arc<MetricsRecorder> {
        &self.metrics
    }

    pub fn health(&self) -> HealthReport {
        self.health.report()
    }

    pub async fn statistics(&self) -> Result<EngineStatistics> {
        Ok(EngineStatistics {
            generated_at: self.clock.now(),
            tiers: self.retention.tier_stats().await?,
            hit_rates: self.metrics.snapshot(),
            pending_invalidations: self.inference.pending_invalidations().await,
            alerts: self.monitor.active().await,
        })
    }

    /// Evaluate current performance and return the alerts raised by this check
    pub async fn check_alerts(&self) -> Result<Vec<Alert>> {
        let observation =
            monitoring::observe(&self.retention, &self.metrics, &self.health).await?;
        Ok(self.monitor.check(observation, self.clock.now()).await)
    }

    /// Status, hit ratio trend over `days` and advice, after a fresh check
    pub async fn performance_report(&self, days: i64) -> Result<PerformanceReport> {
        self.check_alerts().await?;
        let now = self.clock.now();
        let daily = self.metrics.daily(now - ChronoDuration::days(days)).await?;
        let alerts = self.monitor.active().await;

        Ok(PerformanceReport {
            generated_at: now,
            period_days: days,
            status: rollup(self.health.report().status, &alerts),
            observation: self.monitor.latest().await,
            hit_ratio_trend: trend(&daily_hit_ratios(&daily)),
            recommendations: recommendations(&alerts),
            recent_alerts: self.monitor.history(20).await,
            alerts,
        })
    }

    /// Start the background retention loop on the current tokio runtime
    pub fn start_scheduler(&self) -> SchedulerHandle {
        spawn_scheduler(
            self.retention.clone(),
            self.inference.clone(),
            self.metrics.clone(),
            self.monitor.clone(),
            self.health.clone(),
            self.clock.clone(),
            &self.config,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::feature_store::FeatureInput;
    use crate::health::HealthStatus;
    use crate::inference_cache::PredictionOptions;
    use crate::monitoring::{AlertLevel, AlertMetric, SystemStatus, Trend};
    use chrono::Duration as ChronoDuration;
    use ml_retention_db::FeatureType;
    use serde_json::json;

    fn engine() -> (CacheEngine, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(
            DateTime::parse_from_rfc3339("2025-05-01T00:00:00Z")
                .unwrap()
                .with_timezone(&Utc),
        ));
        (
            CacheEngine::in_memory_with_clock(EngineConfig::default(), clock.clone()),
            clock,
        )
    }

    #[tokio::test]
    async fn test_statistics_reflect_tier_activity() {
        let (engine, _) = engine();
        let stored = engine
            .features()
            .put(FeatureInput {
                source_id: "obs-123".into(),
                source_table: "biodiversity_studies".into(),
                feature_type: FeatureType::Spatial,
                vector: json!([0.1, 0.2]),
                quality_score: 0.9,
                temporal_window: Some("1week".into()),
                location_bucket: Some("lat_-12_lon_18".into()),
                spatial_resolution: None,
            })
            .await
            .unwrap();
        engine
            .features()
            .get("obs-123", FeatureType::Spatial, &stored.content_hash)
            .await
            .unwrap();

        let stats = engine.statistics().await.unwrap();
        let features = stats
            .tiers
            .iter()
            .find(|s| s.tier == Tier::FeatureStore)
            .unwrap();
        assert_eq!(features.total_entries, 1);
        assert_eq!(features.avg_access_count, Some(1.0));

        let hits = stats
            .hit_rates
            .iter()
            .find(|h| h.tier == Tier::FeatureStore)
            .unwrap();
        assert_eq!(hits.hits, 1);
        assert!(stats.pending_invalidations.is_empty());
    }

    #[tokio::test]
    async fn test_expired_inference_reclaimed_by_default_policy() {
        let (engine, clock) = engine();
        engine.retention().seed_defaults().await.unwrap();
        engine
            .inference()
            .put(
                "sdm-v1",
                &json!({"x": 1}),
                json!(0.3),
                Some(0.3),
                PredictionOptions::default(),
            )
            .await
            .unwrap();

        clock.advance(ChronoDuration::hours(7));
        let run = engine.retention().run_policy("ic_expired", false).await.unwrap();
        assert_eq!(run.records_affected, 1);
    }

    #[tokio::test]
    async fn test_performance_report_flags_falling_hit_ratio() {
        let (engine, clock) = engine();
        let metrics = engine.metrics();
        for _ in 0..4 {
            metrics.record_hit(Tier::InferenceCache);
        }
        metrics.flush().await.unwrap();

        clock.advance(ChronoDuration::days(1));
        metrics.record_hit(Tier::InferenceCache);
        for _ in 0..4 {
            metrics.record_miss(Tier::InferenceCache);
        }
        metrics.flush().await.unwrap();

        // 5 hits out of 9 lookups since start
        let report = engine.performance_report(7).await.unwrap();
        assert_eq!(report.status, SystemStatus::Degraded);
        assert_eq!(report.hit_ratio_trend, Trend::Degrading);
        assert_eq!(report.alerts.len(), 1);
        assert_eq!(report.alerts[0].metric, AlertMetric::CacheHitRatio);
        assert_eq!(report.alerts[0].level, AlertLevel::Warning);
        assert_eq!(report.recent_alerts.len(), 1);
        assert_eq!(report.recommendations.len(), 2);

        // the same warning is not raised again within the cooldown
        assert!(engine.check_alerts().await.unwrap().is_empty());
        assert_eq!(engine.statistics().await.unwrap().alerts.len(), 1);
    }

    #[tokio::test]
    async fn test_quiet_engine_is_healthy() {
        let (engine, _) = engine();
        let report = engine.performance_report(7).await.unwrap();
        assert_eq!(report.status, SystemStatus::Healthy);
        assert_eq!(report.hit_ratio_trend, Trend::Stable);
        assert_eq!(report.recommendations, vec!["No action needed".to_string()]);
    }

    #[tokio::test]
    async fn test_health_starts_ok() {
        let (engine, _) = engine();
        assert_eq!(engine.health().status, HealthStatus::Ok);
    }
}
