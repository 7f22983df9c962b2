use super::ServerState;
use crate::config;
use crate::errors::GatewayResult;
use axum::extract::{Query, State};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

#[derive(Deserialize)]
pub struct GetParams {
    /// Secrets are masked unless explicitly requested otherwise.
    #[serde(default = "default_mask")]
    pub mask: bool,
}

fn default_mask() -> bool {
    true
}

pub async fn get_config(
    State(state): State<Arc<ServerState>>,
    Query(params): Query<GetParams>,
) -> Json<Value> {
    Json(json!({ "config": state.config.get_all(params.mask) }))
}

pub async fn update_config(
    State(state): State<Arc<ServerState>>,
    Json(partial): Json<Value>,
) -> GatewayResult<Json<Value>> {
    let updated = state.config.update(partial)?;
    Ok(Json(json!({ "config": updated })))
}

pub async fn validate_config(State(state): State<Arc<ServerState>>) -> Json<Value> {
    let settings = state.config.get_all(false);
    let issues = config::validate(&settings);
    Json(json!({ "valid": issues.is_empty(), "errors": issues }))
}
