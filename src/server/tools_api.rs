use super::ServerState;
use crate::agent::ToolCatalog;
use crate::errors::{GatewayError, GatewayResult};
use axum::extract::State;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunToolBody {
    pub name: String,
    #[serde(default)]
    pub args: Value,
    #[serde(default)]
    pub correlation_id: Option<String>,
}

pub async fn list_tools(State(_state): State<Arc<ServerState>>) -> Json<Value> {
    let catalog = ToolCatalog::builtin();
    let tools: Vec<Value> = catalog
        .function_schema
        .iter()
        .map(|t| json!({"name": t.name, "parameters": t.parameters}))
        .collect();
    Json(json!({ "functionSchema": tools }))
}

/// Direct tool invocation outside an agent turn; the same catalog gating
/// as the shim applies.
pub async fn run_tool(
    State(state): State<Arc<ServerState>>,
    Json(body): Json<RunToolBody>,
) -> GatewayResult<Json<Value>> {
    let catalog = ToolCatalog::builtin();
    if !catalog.allows(&body.name) {
        return Err(GatewayError::ToolNotAllowed(body.name));
    }
    let args = if body.args.is_object() {
        body.args.clone()
    } else {
        json!({})
    };
    catalog
        .validate_args(&body.name, &args)
        .map_err(GatewayError::SchemaViolation)?;
    let project = state
        .projects
        .get_active_project()?
        .ok_or_else(|| GatewayError::NotFound("active project".to_string()))?;
    let result = state
        .orchestrator
        .run_plan(
            &project.id,
            vec![crate::actions::PlanStep {
                tool: body.name,
                args,
            }],
            body.correlation_id.as_deref(),
        )
        .await?;
    Ok(Json(json!(result)))
}
