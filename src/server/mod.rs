mod agent_api;
mod artifacts_api;
mod chat_api;
mod config_api;
mod context_api;
mod plans_api;
mod processes_api;
mod projects_api;
mod sessions_api;
mod tasks_api;
mod timeline_api;
mod tools_api;
mod ws_api;

use crate::actions::ActionOrchestrator;
use crate::agent::AgentSession;
use crate::config::ConfigStore;
use crate::db::Db;
use crate::services::{ArtifactService, ContextService, PlanService, ProjectService, TaskService};
use crate::supervisor::Supervisor;
use crate::ws::Broker;
use axum::routing::{delete, get, post};
use axum::Router;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing::info;

pub struct ServerState {
    pub db: Arc<Db>,
    pub config: Arc<ConfigStore>,
    pub broker: Arc<Broker>,
    pub supervisor: Arc<Supervisor>,
    pub session: Arc<AgentSession>,
    pub orchestrator: ActionOrchestrator,
    pub projects: ProjectService,
    pub tasks: TaskService,
    pub plans: PlanService,
    pub context: ContextService,
    pub artifacts: ArtifactService,
}

pub fn build_router(state: Arc<ServerState>) -> Router {
    Router::new()
        .route("/api/projects", get(projects_api::list_projects))
        .route("/api/projects", post(projects_api::create_project))
        .route("/api/projects/active", get(projects_api::get_active_project))
        .route("/api/projects/{id}", get(projects_api::get_project))
        .route("/api/projects/{id}", delete(projects_api::delete_project))
        .route("/api/projects/{id}/select", post(projects_api::select_project))
        .route("/api/agent/start", post(agent_api::start_agent))
        .route("/api/agent/stop", post(agent_api::stop_agent))
        .route("/api/agent/status", get(agent_api::agent_status))
        .route("/api/agent/send", post(agent_api::send_to_agent))
        .route("/api/agent/ask", post(agent_api::ask_one_shot))
        .route("/api/agent/tool-result", post(agent_api::wait_tool_result))
        .route("/api/projects/{id}/plans", get(plans_api::list_plans))
        .route("/api/projects/{id}/plans", post(plans_api::create_plan))
        .route("/api/projects/{id}/tasks", get(tasks_api::list_tasks))
        .route("/api/projects/{id}/tasks/next", get(tasks_api::next_task))
        .route("/api/projects/{id}/sessions", get(sessions_api::list_sessions))
        .route("/api/chat/{project_id}", get(chat_api::chat_history))
        .route("/api/chat/{project_id}", post(chat_api::send_chat))
        .route("/api/plans/{plan_id}/tasks", get(plans_api::plan_tasks))
        .route("/api/plans/{plan_id}/accept", post(plans_api::accept_plan))
        .route("/api/plans/{plan_id}/refine", post(plans_api::refine_plan))
        .route("/api/plans/{plan_id}/edit", post(plans_api::edit_plan))
        .route("/api/tasks/{task_id}/start", post(tasks_api::start_task))
        .route("/api/tasks/{task_id}/complete", post(tasks_api::complete_task))
        .route("/api/tasks/{task_id}/block", post(tasks_api::block_task))
        .route("/api/tasks/{task_id}/progress", post(tasks_api::report_progress))
        .route("/api/timeline/{project_id}", get(timeline_api::list_timeline))
        .route("/api/timeline/{project_id}/events", post(timeline_api::record_event))
        .route("/api/timeline/revert/{event_id}", post(timeline_api::revert_event))
        .route("/api/actions/{project_id}/run", post(timeline_api::run_plan))
        .route("/api/config", get(config_api::get_config))
        .route("/api/config", post(config_api::update_config))
        .route("/api/config/validate", post(config_api::validate_config))
        .route("/api/tools", get(tools_api::list_tools))
        .route("/api/tools/run", post(tools_api::run_tool))
        .route("/api/context/{project_id}", get(context_api::get_active_context))
        .route("/api/context/{project_id}", post(context_api::create_context))
        .route("/api/context/{project_id}/history", get(context_api::context_history))
        .route("/api/artifacts", post(artifacts_api::register_artifact))
        .route("/api/artifacts/task/{task_id}", get(artifacts_api::list_task_artifacts))
        .route("/api/artifacts/{artifact_id}/validate", post(artifacts_api::validate_artifact))
        .route("/api/sessions/{session_id}/messages", get(sessions_api::session_messages))
        .route("/api/sessions/{session_id}/summary", post(sessions_api::set_session_summary))
        .route("/api/events/{project_id}", get(sessions_api::list_event_log))
        .route("/api/processes/start", post(processes_api::start_sequence))
        .route("/api/processes/stop", post(processes_api::stop_all))
        .route("/api/processes/status", get(processes_api::processes_status))
        .route("/ws", get(ws_api::ws_handler))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

pub async fn start_server(state: Arc<ServerState>, port: u16) -> anyhow::Result<()> {
    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind(format!("127.0.0.1:{port}")).await?;
    info!("Gateway listening on http://127.0.0.1:{port}");
    axum::serve(listener, app).await?;
    Ok(())
}
