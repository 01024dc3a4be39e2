use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use ml_retention::{PolicyExecution, PolicyUpdate};
use ml_retention_db::{PolicyAction, Priority, RetentionPolicy, Tier};
use serde::Deserialize;
use tracing::info;
use ts_rs::TS;

use crate::error::AppError;
use crate::state::AppState;

const DEFAULT_HISTORY_LIMIT: usize = 50;

#[derive(Debug, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export, export_to = "bindings/")]
pub struct CreatePolicyRequest {
    policy_id: String,
    name: String,
    #[serde(default)]
    #[ts(optional)]
    description: Option<String>,
    tier: Tier,
    retention_days: i32,
    #[serde(default)]
    #[ts(optional)]
    min_access_count: Option<i64>,
    #[serde(default)]
    #[ts(optional)]
    min_quality_score: Option<f64>,
    #[serde(default)]
    #[ts(optional)]
    priority_threshold: Option<Priority>,
    #[serde(default)]
    #[ts(optional)]
    time_window: Option<String>,
    #[serde(default)]
    #[ts(optional)]
    action: Option<PolicyAction>,
    #[serde(default)]
    #[ts(optional)]
    enabled: Option<bool>,
    #[serde(default)]
    #[ts(optional)]
    execution_interval_hours: Option<i32>,
}

impl From<CreatePolicyRequest> for RetentionPolicy {
    fn from(req: CreatePolicyRequest) -> Self {
        let base = RetentionPolicy::new(&req.policy_id, &req.name, req.tier, req.retention_days);
        RetentionPolicy {
            description: req.description.unwrap_or_default(),
            min_access_count: req.min_access_count.unwrap_or(base.min_access_count),
            min_quality_score: req.min_quality_score.unwrap_or(base.min_quality_score),
            priority_threshold: req.priority_threshold,
            time_window: req.time_window,
            action: req.action.unwrap_or(base.action),
            enabled: req.enabled.unwrap_or(base.enabled),
            execution_interval_hours: req
                .execution_interval_hours
                .unwrap_or(base.execution_interval_hours),
            ..base
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct RunParams {
    #[serde(default)]
    dry_run: bool,
}

#[derive(Debug, Deserialize)]
pub struct HistoryParams {
    limit: Option<usize>,
}

pub async fn list_policies(
    State(state): State<AppState>,
) -> Result<Json<Vec<RetentionPolicy>>, AppError> {
    Ok(Json(state.engine.retention().list_policies().await?))
}

pub async fn get_policy(
    State(state): State<AppState>,
    Path(policy_id): Path<String>,
) -> Result<Json<RetentionPolicy>, AppError> {
    Ok(Json(state.engine.retention().get_policy(&policy_id).await?))
}

pub async fn create_policy(
    State(state): State<AppState>,
    Json(body): Json<CreatePolicyRequest>,
) -> Result<(StatusCode, Json<RetentionPolicy>), AppError> {
    let policy = state.engine.retention().create_policy(body.into()).await?;
    Ok((StatusCode::CREATED, Json(policy)))
}

pub async fn update_policy(
    State(state): State<AppState>,
    Path(policy_id): Path<String>,
    Json(update): Json<PolicyUpdate>,
) -> Result<Json<RetentionPolicy>, AppError> {
    Ok(Json(
        state
            .engine
            .retention()
            .update_policy(&policy_id, update)
            .await?,
    ))
}

pub async fn enable_policy(
    State(state): State<AppState>,
    Path(policy_id): Path<String>,
) -> Result<Json<RetentionPolicy>, AppError> {
    Ok(Json(
        state
            .engine
            .retention()
            .set_enabled(&policy_id, true)
            .await?,
    ))
}

pub async fn disable_policy(
    State(state): State<AppState>,
    Path(policy_id): Path<String>,
) -> Result<Json<RetentionPolicy>, AppError> {
    Ok(Json(
        state
            .engine
            .retention()
            .set_enabled(&policy_id, false)
            .await?,
    ))
}

pub async fn delete_policy(
    State(state): State<AppState>,
    Path(policy_id): Path<String>,
) -> Result<StatusCode, AppError> {
    state.engine.retention().delete_policy(&policy_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Run a policy immediately; `?dry_run=true` only counts candidates
pub async fn run_policy(
    State(state): State<AppState>,
    Path(policy_id): Path<String>,
    Query(params): Query<RunParams>,
) -> Result<Json<PolicyExecution>, AppError> {
    info!(policy_id = %policy_id, dry_run = params.dry_run, "Manual policy run");
    Ok(Json(
        state
            .engine
            .retention()
            .run_policy(&policy_id, params.dry_run)
            .await?,
    ))
}

pub async fn list_executions(
    State(state): State<AppState>,
    Query(params): Query<HistoryParams>,
) -> Json<Vec<PolicyExecution>> {
    let limit = params.limit.unwrap_or(DEFAULT_HISTORY_LIMIT);
    Json(state.engine.retention().history(limit).await)
}
