use super::ServerState;
use crate::errors::GatewayResult;
use axum::extract::{Path, State};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

#[derive(Deserialize)]
pub struct CompleteBody {
    #[serde(default)]
    pub evidence: Option<Value>,
}

#[derive(Deserialize)]
pub struct BlockBody {
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Deserialize)]
pub struct ProgressBody {
    pub note: String,
}

pub async fn list_tasks(
    State(state): State<Arc<ServerState>>,
    Path(project_id): Path<String>,
) -> GatewayResult<Json<Value>> {
    Ok(Json(json!({ "tasks": state.tasks.list_tasks(&project_id)? })))
}

pub async fn next_task(
    State(state): State<Arc<ServerState>>,
    Path(project_id): Path<String>,
) -> GatewayResult<Json<Value>> {
    Ok(Json(json!({ "task": state.tasks.next_available_task(&project_id)? })))
}

pub async fn start_task(
    State(state): State<Arc<ServerState>>,
    Path(task_id): Path<i64>,
) -> GatewayResult<Json<Value>> {
    let task = state.tasks.start_task(task_id).await?;
    Ok(Json(json!({ "task": task })))
}

pub async fn complete_task(
    State(state): State<Arc<ServerState>>,
    Path(task_id): Path<i64>,
    Json(body): Json<CompleteBody>,
) -> GatewayResult<Json<Value>> {
    let evidence = body.evidence.unwrap_or(json!([]));
    let task = state
        .tasks
        .complete_task(task_id, &evidence, &state.context, Some(&state.session))
        .await?;
    Ok(Json(json!({ "task": task })))
}

pub async fn block_task(
    State(state): State<Arc<ServerState>>,
    Path(task_id): Path<i64>,
    Json(body): Json<BlockBody>,
) -> GatewayResult<Json<Value>> {
    let task = state.tasks.block_task(task_id, body.reason.as_deref()).await?;
    Ok(Json(json!({ "task": task })))
}

pub async fn report_progress(
    State(state): State<Arc<ServerState>>,
    Path(task_id): Path<i64>,
    Json(body): Json<ProgressBody>,
) -> GatewayResult<Json<Value>> {
    state.tasks.report_progress(task_id, &body.note).await?;
    Ok(Json(json!({ "reported": true })))
}
