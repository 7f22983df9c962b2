use super::ServerState;
use crate::errors::{GatewayError, GatewayResult};
use axum::extract::{Path, State};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatePlanBody {
    pub tasks: Vec<Value>,
    #[serde(default)]
    pub created_by: Option<String>,
}

pub async fn list_plans(
    State(state): State<Arc<ServerState>>,
    Path(project_id): Path<String>,
) -> GatewayResult<Json<Value>> {
    Ok(Json(json!({ "plans": state.plans.list_plans(&project_id)? })))
}

pub async fn create_plan(
    State(state): State<Arc<ServerState>>,
    Path(project_id): Path<String>,
    Json(body): Json<CreatePlanBody>,
) -> GatewayResult<Json<Value>> {
    if state.projects.get_project(&project_id)?.is_none() {
        return Err(GatewayError::NotFound(format!("project '{project_id}'")));
    }
    let created_by = body.created_by.unwrap_or_else(|| "ai".to_string());
    let (plan, warnings) = state
        .plans
        .create_plan(&project_id, &body.tasks, &created_by)
        .await?;
    Ok(Json(json!({ "plan": plan, "warnings": warnings })))
}

pub async fn plan_tasks(
    State(state): State<Arc<ServerState>>,
    Path(plan_id): Path<i64>,
) -> GatewayResult<Json<Value>> {
    Ok(Json(json!({ "tasks": state.plans.plan_tasks(plan_id)? })))
}

pub async fn accept_plan(
    State(state): State<Arc<ServerState>>,
    Path(plan_id): Path<i64>,
) -> GatewayResult<Json<Value>> {
    let plan = state.plans.accept_plan(plan_id).await?;
    Ok(Json(json!({ "plan": plan })))
}

pub async fn refine_plan(
    State(state): State<Arc<ServerState>>,
    Path(plan_id): Path<i64>,
    Json(body): Json<CreatePlanBody>,
) -> GatewayResult<Json<Value>> {
    let (plan, warnings) = state.plans.refine_plan(plan_id, &body.tasks).await?;
    Ok(Json(json!({ "plan": plan, "warnings": warnings })))
}

pub async fn edit_plan(
    State(state): State<Arc<ServerState>>,
    Path(plan_id): Path<i64>,
    Json(body): Json<CreatePlanBody>,
) -> GatewayResult<Json<Value>> {
    let (plan, warnings) = state.plans.edit_plan(plan_id, &body.tasks).await?;
    Ok(Json(json!({ "plan": plan, "warnings": warnings })))
}
