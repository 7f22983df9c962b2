use super::ServerState;
use crate::errors::{GatewayError, GatewayResult};
use axum::extract::State;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::info;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartBody {
    pub project_id: String,
    #[serde(default)]
    pub provider: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendBody {
    pub text: String,
    #[serde(default)]
    pub correlation_id: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AskBody {
    pub session_id: String,
    pub question: String,
}

pub async fn start_agent(
    State(state): State<Arc<ServerState>>,
    Json(body): Json<StartBody>,
) -> GatewayResult<Json<Value>> {
    let provider = body.provider.unwrap_or_else(|| "gemini_cli".to_string());
    let project = state
        .projects
        .get_project(&body.project_id)?
        .ok_or_else(|| GatewayError::NotFound(format!("project '{}'", body.project_id)))?;
    info!("[/agent/start] project={} provider={provider}", project.id);
    let status = state.session.start(&project.id, &provider).await?;
    Ok(Json(json!({ "status": status, "provider": provider })))
}

pub async fn stop_agent(State(state): State<Arc<ServerState>>) -> GatewayResult<Json<Value>> {
    let status = state.session.stop().await?;
    Ok(Json(json!({ "status": status })))
}

pub async fn agent_status(State(state): State<Arc<ServerState>>) -> Json<Value> {
    let status = state.session.status().await;
    let adapter = state.supervisor.adapter_status();
    Json(json!({ "status": status, "adapter": adapter }))
}

pub async fn send_to_agent(
    State(state): State<Arc<ServerState>>,
    Json(body): Json<SendBody>,
) -> GatewayResult<Json<Value>> {
    let ack = state
        .session
        .send(&body.text, body.correlation_id.as_deref())
        .await?;
    Ok(Json(json!(ack)))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WaitToolResultBody {
    pub name: String,
    #[serde(default)]
    pub correlation_id: Option<String>,
    #[serde(default = "default_wait_ms")]
    pub timeout_ms: u64,
}

fn default_wait_ms() -> u64 {
    5000
}

/// Awaits the next matching tool result from the shim's in-process queue;
/// used by self-tests and synchronous callers.
pub async fn wait_tool_result(
    State(state): State<Arc<ServerState>>,
    Json(body): Json<WaitToolResultBody>,
) -> GatewayResult<Json<Value>> {
    let result = state
        .session
        .shim()
        .wait_tool_result(
            &body.name,
            body.correlation_id.as_deref(),
            std::time::Duration::from_millis(body.timeout_ms.clamp(100, 60_000)),
        )
        .await;
    match result {
        Some(value) => Ok(Json(json!({ "result": value }))),
        None => Err(GatewayError::Timeout(format!("tool result '{}'", body.name))),
    }
}

pub async fn ask_one_shot(
    State(state): State<Arc<ServerState>>,
    Json(body): Json<AskBody>,
) -> GatewayResult<Json<Value>> {
    let (answer, error) = state
        .session
        .ask_one_shot(&body.session_id, &body.question)
        .await;
    Ok(Json(json!({ "answer": answer, "error": error })))
}
