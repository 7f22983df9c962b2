use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Project {
    pub id: String,
    pub name: String,
    pub path: String,
    pub active: bool,
    /// draft|consensus|active|completed
    pub status: String,
    pub active_context_id: Option<i64>,
    pub active_plan_id: Option<i64>,
    pub current_task_id: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: i64,
    pub msg_id: String,
    pub project_id: String,
    pub task_id: Option<i64>,
    /// user|agent|system
    pub role: String,
    pub content: String,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TimelineEvent {
    pub id: i64,
    pub project_id: String,
    /// >= 0 for plan steps; -1 for generic events
    pub step_index: i64,
    pub tool: String,
    pub args_json: String,
    /// running|success|error|event
    pub status: String,
    pub result_json: Option<String>,
    pub correlation_id: Option<String>,
    pub started_at: String,
    pub finished_at: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRow {
    pub id: i64,
    pub project_id: String,
    pub provider: String,
    pub started_at: String,
    pub ended_at: Option<String>,
    pub summary_text: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentMessage {
    pub id: i64,
    pub session_id: i64,
    /// user|assistant|tool
    pub role: String,
    pub content: String,
    pub ts: String,
    pub tool_name: Option<String>,
    pub tool_args_json: Option<String>,
    pub tool_result_json: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Artifact {
    pub id: i64,
    pub session_id: Option<i64>,
    pub task_id: Option<i64>,
    #[serde(rename = "type")]
    pub kind: String,
    pub path: String,
    /// code|asset|document|screenshot
    pub category: Option<String>,
    pub meta_json: Option<String>,
    /// pending|valid|invalid
    pub validation_status: String,
    pub size_bytes: Option<i64>,
    pub ts: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: i64,
    pub project_id: String,
    pub plan_id: Option<i64>,
    pub idx: i64,
    /// Stable code like T-001, unique within the project
    pub code: String,
    pub title: String,
    pub description: String,
    pub acceptance: String,
    /// pending|in_progress|blocked|done
    pub status: String,
    pub deps_json: String,
    pub mcp_tools_json: String,
    pub deliverables_json: String,
    pub estimates_json: String,
    pub evidence_json: Option<String>,
    pub priority: i64,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskPlan {
    pub id: i64,
    pub project_id: String,
    pub version: i64,
    /// proposed|accepted|superseded
    pub status: String,
    pub summary: Option<String>,
    /// ai|user|system
    pub created_by: String,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextRow {
    pub id: i64,
    pub project_id: String,
    /// global|task
    pub scope: String,
    pub task_id: Option<i64>,
    pub content: String,
    pub created_by: String,
    pub source: Option<String>,
    pub version: i64,
    pub is_active: bool,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EventLogEntry {
    pub id: i64,
    pub project_id: String,
    pub event_type: String,
    pub payload_json: String,
    pub created_at: String,
}
