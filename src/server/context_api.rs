use super::ServerState;
use crate::errors::GatewayResult;
use axum::extract::{Path, Query, State};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScopeParams {
    #[serde(default = "default_scope")]
    pub scope: String,
    #[serde(default)]
    pub task_id: Option<i64>,
    #[serde(default = "default_limit")]
    pub limit: usize,
}

fn default_scope() -> String {
    "global".to_string()
}

fn default_limit() -> usize {
    20
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateContextBody {
    pub content: Value,
    #[serde(default = "default_scope")]
    pub scope: String,
    #[serde(default)]
    pub task_id: Option<i64>,
    #[serde(default)]
    pub created_by: Option<String>,
}

pub async fn get_active_context(
    State(state): State<Arc<ServerState>>,
    Path(project_id): Path<String>,
    Query(params): Query<ScopeParams>,
) -> GatewayResult<Json<Value>> {
    let content = state
        .context
        .get_active(&project_id, &params.scope, params.task_id)?;
    Ok(Json(json!({ "context": content })))
}

pub async fn create_context(
    State(state): State<Arc<ServerState>>,
    Path(project_id): Path<String>,
    Json(body): Json<CreateContextBody>,
) -> GatewayResult<Json<Value>> {
    let created_by = body.created_by.unwrap_or_else(|| "user".to_string());
    let row = state
        .context
        .create(&project_id, &body.content, &body.scope, body.task_id, &created_by)
        .await?;
    Ok(Json(json!({ "context": row })))
}

pub async fn context_history(
    State(state): State<Arc<ServerState>>,
    Path(project_id): Path<String>,
    Query(params): Query<ScopeParams>,
) -> GatewayResult<Json<Value>> {
    let rows = state
        .context
        .list_history(&project_id, &params.scope, params.limit)?;
    Ok(Json(json!({ "history": rows })))
}
