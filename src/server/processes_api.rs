use super::ServerState;
use crate::errors::GatewayResult;
use axum::extract::{Query, State};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartParams {
    #[serde(default)]
    pub project_id: Option<String>,
}

pub async fn start_sequence(
    State(state): State<Arc<ServerState>>,
    Query(params): Query<StartParams>,
) -> GatewayResult<Json<Value>> {
    let steps = state
        .supervisor
        .start_sequence(params.project_id.as_deref())
        .await?;
    Ok(Json(json!({ "steps": steps })))
}

pub async fn stop_all(State(state): State<Arc<ServerState>>) -> Json<Value> {
    state.supervisor.stop_all().await;
    Json(json!({ "stopped": true }))
}

pub async fn processes_status(State(state): State<Arc<ServerState>>) -> Json<Value> {
    let statuses = state.supervisor.status().await;
    let adapter = state.supervisor.adapter_status();
    Json(json!({ "processes": statuses, "adapter": adapter }))
}
