use axum::extract::{Path, State};
use axum::Json;
use serde_json::{json, Value};
use tracing::info;

use crate::error::AppError;
use crate::state::AppState;

/// Model registry callback: drop every cached prediction of a model
pub async fn invalidate_model(
    State(state): State<AppState>,
    Path(model_id): Path<String>,
) -> Result<Json<Value>, AppError> {
    let deleted = state.engine.inference().invalidate_model(&model_id).await?;
    info!(model_id = %model_id, deleted, "Model invalidated via API");
    Ok(Json(json!({ "modelId": model_id, "deleted": deleted })))
}

pub async fn invalidate_bucket(
    State(state): State<AppState>,
    Path(bucket): Path<String>,
) -> Result<Json<Value>, AppError> {
    let invalidated = state.engine.inference().invalidate_bucket(&bucket).await?;
    Ok(Json(
        json!({ "spatialBucket": bucket, "invalidated": invalidated }),
    ))
}
