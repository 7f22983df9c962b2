use super::ServerState;
use crate::actions::PlanStep;
use crate::errors::GatewayResult;
use crate::timeline;
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
    100
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordEventBody {
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(default)]
    pub related_ids: Vec<String>,
    #[serde(default)]
    pub correlation_id: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunPlanBody {
    pub plan: Vec<PlanStep>,
    #[serde(default)]
    pub correlation_id: Option<String>,
}

pub async fn list_timeline(
    State(state): State<Arc<ServerState>>,
    Path(project_id): Path<String>,
    Query(params): Query<ListParams>,
) -> GatewayResult<Json<Value>> {
    let items = timeline::list(&state.db, &project_id, params.limit)?;
    Ok(Json(json!({ "timeline": items })))
}

pub async fn record_event(
    State(state): State<Arc<ServerState>>,
    Path(project_id): Path<String>,
    Json(body): Json<RecordEventBody>,
) -> GatewayResult<Json<Value>> {
    let item = timeline::record_event(
        &state.db,
        &state.broker,
        &project_id,
        &body.event_type,
        body.payload,
        body.related_ids,
        body.correlation_id.as_deref(),
    )
    .await?;
    Ok(Json(json!({ "event": item })))
}

pub async fn revert_event(
    State(state): State<Arc<ServerState>>,
    Path(event_id): Path<i64>,
) -> GatewayResult<Json<Value>> {
    let outcome = state.orchestrator.revert(event_id).await?;
    Ok(Json(outcome))
}

pub async fn run_plan(
    State(state): State<Arc<ServerState>>,
    Path(project_id): Path<String>,
    Json(body): Json<RunPlanBody>,
) -> GatewayResult<Json<Value>> {
    let summary = state
        .orchestrator
        .run_plan(&project_id, body.plan, body.correlation_id.as_deref())
        .await?;
    Ok(Json(json!(summary)))
}
