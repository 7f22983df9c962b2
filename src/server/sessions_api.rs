use super::ServerState;
use crate::errors::{GatewayError, GatewayResult};
use axum::extract::{Path, Query, State};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

#[derive(Deserialize)]
pub struct ListParams {
    #[serde(default = "default_limit")]
    pub limit: usize,
}

fn default_limit() -> usize {
    20
}

#[derive(Deserialize)]
pub struct SummaryBody {
    pub summary: String,
}

pub async fn list_sessions(
    State(state): State<Arc<ServerState>>,
    Path(project_id): Path<String>,
    Query(params): Query<ListParams>,
) -> GatewayResult<Json<Value>> {
    Ok(Json(json!({ "sessions": state.db.list_sessions(&project_id, params.limit)? })))
}

pub async fn session_messages(
    State(state): State<Arc<ServerState>>,
    Path(session_id): Path<i64>,
    Query(params): Query<ListParams>,
) -> GatewayResult<Json<Value>> {
    Ok(Json(json!({ "messages": state.db.list_agent_messages(session_id, params.limit.max(50))? })))
}

pub async fn set_session_summary(
    State(state): State<Arc<ServerState>>,
    Path(session_id): Path<i64>,
    Json(body): Json<SummaryBody>,
) -> GatewayResult<Json<Value>> {
    if body.summary.trim().is_empty() {
        return Err(GatewayError::SchemaViolation("summary must not be empty".into()));
    }
    state.db.update_session_summary(session_id, &body.summary)?;
    Ok(Json(json!({ "sessionId": session_id })))
}

pub async fn list_event_log(
    State(state): State<Arc<ServerState>>,
    Path(project_id): Path<String>,
    Query(params): Query<ListParams>,
) -> GatewayResult<Json<Value>> {
    Ok(Json(json!({ "events": state.db.list_event_log(&project_id, params.limit.max(100))? })))
}
