//! Multi-tier cache for ML pipelines with policy-driven retention
//!
//! Four tier services (features, training datasets, inference results and
//! aggregated series) share one storage backend, either Postgres or in-process
//! moka caches. A retention engine evicts entries according to declarative
//! per-tier policies on a schedule. A metrics recorder keeps hit ratios and
//! eviction outcomes, which an alert monitor checks against thresholds.

pub mod aggregated_series;
pub mod backend;
pub mod clock;
pub mod config;
pub mod content;
mod engine;
pub mod error;
pub mod feature_store;
pub mod health;
pub mod inference_cache;
pub mod metrics;
pub mod monitoring;
pub mod retention;
pub mod training_cache;

pub use aggregated_series::{AggregateInput, AggregateQuery, AggregatedSeriesStore};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::EngineConfig;
pub use content::{canonical_json, content_hash, SpatialBucket};
pub use engine::{CacheEngine, EngineStatistics};
pub use error::{CacheError, Result};
pub use feature_store::{FeatureInput, FeatureQuery, FeatureStore, StoredFeature};
pub use health::{HealthReport, HealthStatus};
pub use inference_cache::{CachedPrediction, InferenceCache, PredictionOptions};
pub use metrics::{MetricsRecorder, TierHitRate};
pub use monitoring::{
    Alert, AlertLevel, AlertMetric, AlertMonitor, AlertThresholds, Observation, PerformanceReport,
    SystemStatus, Trend,
};
pub use retention::{PolicyExecution, PolicyPhase, PolicyUpdate, RetentionEngine, SchedulerHandle};
pub use training_cache::{TrainingCache, TrainingDataset};
