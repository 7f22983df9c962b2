use super::ServerState;
use crate::errors::{GatewayError, GatewayResult};
use crate::ws::{Envelope, EventType};
use axum::extract::{Path, Query, State};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

#[derive(Deserialize)]
pub struct CreateProjectBody {
    pub name: String,
    #[serde(default)]
    pub settings: Option<Value>,
}

#[derive(Deserialize)]
pub struct DeleteParams {
    #[serde(default)]
    pub purge: bool,
}

pub async fn list_projects(
    State(state): State<Arc<ServerState>>,
) -> GatewayResult<Json<Value>> {
    let projects = state.projects.list_projects()?;
    Ok(Json(json!({ "projects": projects })))
}

pub async fn create_project(
    State(state): State<Arc<ServerState>>,
    Json(body): Json<CreateProjectBody>,
) -> GatewayResult<Json<Value>> {
    let project = state.projects.create_project(&body.name, body.settings.as_ref())?;
    let envelope = Envelope::new(
        EventType::Project,
        Some(project.id.clone()),
        json!({"event": "created", "projectId": project.id, "name": project.name}),
        None,
    );
    state.broker.broadcast_all(&envelope).await;
    Ok(Json(json!({ "project": project })))
}

pub async fn get_project(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
) -> GatewayResult<Json<Value>> {
    let project = state
        .projects
        .get_project(&id)?
        .ok_or_else(|| GatewayError::NotFound(format!("project '{id}'")))?;
    let manifest = state.projects.project_manifest(&id);
    Ok(Json(json!({ "project": project, "manifest": manifest })))
}

pub async fn get_active_project(
    State(state): State<Arc<ServerState>>,
) -> GatewayResult<Json<Value>> {
    Ok(Json(json!({ "project": state.projects.get_active_project()? })))
}

pub async fn select_project(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
) -> GatewayResult<Json<Value>> {
    state.projects.select_active_project(&id)?;
    let envelope = Envelope::new(
        EventType::Project,
        Some(id.clone()),
        json!({"event": "selected", "projectId": id}),
        None,
    );
    state.broker.broadcast_all(&envelope).await;
    Ok(Json(json!({ "active": id })))
}

pub async fn delete_project(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
    Query(params): Query<DeleteParams>,
) -> GatewayResult<Json<Value>> {
    let deleted = state.projects.delete_project(&id, params.purge)?;
    if !deleted {
        return Err(GatewayError::NotFound(format!("project '{id}'")));
    }
    Ok(Json(json!({ "deleted": id, "purged": params.purge })))
}
