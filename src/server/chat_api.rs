use super::ServerState;
use crate::errors::GatewayResult;
use axum::extract::{Path, Query, State};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryParams {
    #[serde(default = "default_limit")]
    pub limit: usize,
    #[serde(default)]
    pub task_id: Option<i64>,
}

fn default_limit() -> usize {
    50
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendChatBody {
    pub text: String,
    #[serde(default)]
    pub correlation_id: Option<String>,
}

pub async fn chat_history(
    State(state): State<Arc<ServerState>>,
    Path(project_id): Path<String>,
    Query(params): Query<HistoryParams>,
) -> GatewayResult<Json<Value>> {
    let messages = state
        .db
        .list_chat_messages(&project_id, params.limit, params.task_id)?;
    Ok(Json(json!({ "messages": messages })))
}

/// Sends user chat through the running agent session; persistence and the
/// chat broadcast happen inside `send`.
pub async fn send_chat(
    State(state): State<Arc<ServerState>>,
    Path(_project_id): Path<String>,
    Json(body): Json<SendChatBody>,
) -> GatewayResult<Json<Value>> {
    let ack = state
        .session
        .send(&body.text, body.correlation_id.as_deref())
        .await?;
    Ok(Json(json!(ack)))
}
