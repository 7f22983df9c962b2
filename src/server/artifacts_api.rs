use super::ServerState;
use crate::errors::GatewayResult;
use axum::extract::{Path, State};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterBody {
    pub task_id: i64,
    #[serde(rename = "type")]
    pub artifact_type: String,
    pub path: String,
    #[serde(default)]
    pub meta: Option<Value>,
    #[serde(default)]
    pub category: Option<String>,
}

pub async fn register_artifact(
    State(state): State<Arc<ServerState>>,
    Json(body): Json<RegisterBody>,
) -> GatewayResult<Json<Value>> {
    let artifact = state
        .artifacts
        .register(
            body.task_id,
            &body.artifact_type,
            &body.path,
            body.meta.as_ref(),
            body.category.as_deref(),
        )
        .await?;
    Ok(Json(json!({ "artifact": artifact })))
}

pub async fn list_task_artifacts(
    State(state): State<Arc<ServerState>>,
    Path(task_id): Path<i64>,
) -> GatewayResult<Json<Value>> {
    Ok(Json(json!({ "artifacts": state.artifacts.list_task_artifacts(task_id)? })))
}

pub async fn validate_artifact(
    State(state): State<Arc<ServerState>>,
    Path(artifact_id): Path<i64>,
) -> GatewayResult<Json<Value>> {
    let valid = state.artifacts.validate(artifact_id).await?;
    Ok(Json(json!({ "valid": valid })))
}
