use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::Json;
use chrono::{Duration, Utc};
use ml_retention::{EngineStatistics, HealthReport, HealthStatus, PerformanceReport};
use ml_retention_db::DailyMetricAggregate;
use serde::Deserialize;

use crate::error::AppError;
use crate::state::AppState;

pub async fn health(State(state): State<AppState>) -> (StatusCode, Json<HealthReport>) {
    let report = state.engine.health();
    let status = match report.status {
        HealthStatus::Ok => StatusCode::OK,
        HealthStatus::Degraded => StatusCode::SERVICE_UNAVAILABLE,
    };
    (status, Json(report))
}

pub async fn statistics(
    State(state): State<AppState>,
) -> Result<Json<EngineStatistics>, AppError> {
    Ok(Json(state.engine.statistics().await?))
}

#[derive(Debug, Deserialize)]
pub struct DailyParams {
    days: Option<i64>,
}

/// Per-day rollups of the performance metrics series
pub async fn daily_metrics(
    State(state): State<AppState>,
    Query(params): Query<DailyParams>,
) -> Result<Json<Vec<DailyMetricAggregate>>, AppError> {
    let days = params.days.unwrap_or(7).clamp(1, 365);
    let since = Utc::now() - Duration::days(days);
    Ok(Json(state.engine.metrics().daily(since).await?))
}

/// Health rollup, active alerts and hit ratio trend over the last `days`
pub async fn performance_report(
    State(state): State<AppState>,
    Query(params): Query<DailyParams>,
) -> Result<Json<PerformanceReport>, AppError> {
    let days = params.days.unwrap_or(7).clamp(1, 365);
    Ok(Json(state.engine.performance_report(days).await?))
}
