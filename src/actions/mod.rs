//! Action orchestrator: validates and executes agent plans sequentially,
//! persisting a timeline row per step and broadcasting progress. Aborts on
//! the first failed step and supports a best-effort revert.

use crate::agent::ToolCatalog;
use crate::db::Db;
use crate::errors::{GatewayError, GatewayResult};
use crate::mcp::{destroy_instances_code, McpClient};
use crate::timeline;
use crate::ws::{Broker, Envelope, EventType};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, warn};
use uuid::Uuid;

const MAX_STRING_LEN: usize = 1024;
const MAX_COLLECTION_LEN: usize = 100;
const MAX_KEY_LEN: usize = 64;
const MAX_DEPTH: usize = 5;
const MAX_PAYLOAD_BYTES: usize = 64 * 1024;

#[derive(Debug, Clone, Deserialize)]
pub struct PlanStep {
    pub tool: String,
    #[serde(default)]
    pub args: Value,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StepResult {
    pub index: usize,
    pub tool: String,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PlanSummary {
    pub steps: Vec<StepResult>,
}

/// Clamps tool arguments to JSON primitives within the documented limits.
/// Anything deeper than `MAX_DEPTH` or non-representable becomes null.
pub fn sanitize_args(args: &Value) -> Value {
    fn sanitize(value: &Value, depth: usize) -> Value {
        if depth > MAX_DEPTH {
            return Value::Null;
        }
        match value {
            Value::Bool(_) | Value::Number(_) | Value::Null => value.clone(),
            Value::String(s) => {
                let mut end = s.len().min(MAX_STRING_LEN);
                while !s.is_char_boundary(end) {
                    end -= 1;
                }
                Value::String(s[..end].to_string())
            }
            Value::Array(items) => Value::Array(
                items
                    .iter()
                    .take(MAX_COLLECTION_LEN)
                    .map(|v| sanitize(v, depth + 1))
                    .collect(),
            ),
            Value::Object(map) => {
                let mut out = Map::new();
                for (k, v) in map.iter().take(MAX_COLLECTION_LEN) {
                    let mut key_end = k.len().min(MAX_KEY_LEN);
                    while !k.is_char_boundary(key_end) {
                        key_end -= 1;
                    }
                    out.insert(k[..key_end].to_string(), sanitize(v, depth + 1));
                }
                Value::Object(out)
            }
        }
    }
    match args {
        Value::Object(_) => sanitize(args, 0),
        _ => json!({}),
    }
}

pub struct ActionOrchestrator {
    db: Arc<Db>,
    broker: Arc<Broker>,
    mcp: Arc<McpClient>,
    catalog: &'static ToolCatalog,
    config: Arc<crate::config::ConfigStore>,
}

impl ActionOrchestrator {
    pub fn new(
        db: Arc<Db>,
        broker: Arc<Broker>,
        mcp: Arc<McpClient>,
        config: Arc<crate::config::ConfigStore>,
    ) -> Self {
        Self {
            db,
            broker,
            mcp,
            catalog: ToolCatalog::builtin(),
            config,
        }
    }

    fn step_timeout(&self, tool: &str) -> Duration {
        let timeouts = self.config.get_all(false).timeouts;
        let secs = if tool.starts_with("blender") {
            timeouts.blender_addon
        } else {
            timeouts.unity_editor
        };
        Duration::from_secs_f64(secs.max(0.1))
    }

    /// Validates and executes the plan sequentially. The first failing
    /// step aborts the rest; the summary carries per-step statuses.
    pub async fn run_plan(
        &self,
        project_id: &str,
        plan: Vec<PlanStep>,
        correlation_id: Option<&str>,
    ) -> GatewayResult<PlanSummary> {
        let payload_size = serde_json::to_vec(&plan.iter().map(|s| &s.args).collect::<Vec<_>>())
            .map(|v| v.len())
            .unwrap_or(0);
        if payload_size > MAX_PAYLOAD_BYTES {
            return Err(GatewayError::SchemaViolation(format!(
                "plan payload exceeds {MAX_PAYLOAD_BYTES} bytes"
            )));
        }

        let mut summary = Vec::new();
        for (index, step) in plan.into_iter().enumerate() {
            if !self.catalog.allows(&step.tool) {
                let err = format!("Tool not allowed: {}", step.tool);
                self.broadcast_error(project_id, &err, correlation_id).await;
                summary.push(StepResult {
                    index,
                    tool: step.tool,
                    status: "error".to_string(),
                    result: None,
                    error: Some(err),
                });
                break;
            }

            let args = sanitize_args(&step.args);
            let row_id = self.db.add_timeline_event(
                project_id,
                index as i64,
                &step.tool,
                &args.to_string(),
                "running",
                None,
                correlation_id,
                &crate::db::now_ts(),
                None,
            )?;

            self.broadcast_action(project_id, index, &step.tool, &args, correlation_id)
                .await;
            self.broadcast_timeline(project_id, index, &step.tool, "running", None, correlation_id)
                .await;

            let timeout = self.step_timeout(&step.tool);
            let executed = tokio::time::timeout(
                timeout,
                self.execute_step(project_id, &step.tool, &args),
            )
            .await;

            match executed {
                Ok(Ok(result)) => {
                    self.db
                        .finish_timeline_event(row_id, "success", &result.to_string())?;
                    self.broadcast_timeline(
                        project_id,
                        index,
                        &step.tool,
                        "success",
                        Some(&result),
                        correlation_id,
                    )
                    .await;
                    self.broadcast_update(project_id, &step.tool, &result, correlation_id)
                        .await;
                    summary.push(StepResult {
                        index,
                        tool: step.tool,
                        status: "success".to_string(),
                        result: Some(result),
                        error: None,
                    });
                }
                Ok(Err(e)) => {
                    let err = e.to_string();
                    self.finalize_error(project_id, row_id, index, &step.tool, &err, correlation_id)
                        .await;
                    summary.push(StepResult {
                        index,
                        tool: step.tool,
                        status: "error".to_string(),
                        result: None,
                        error: Some(err),
                    });
                    break;
                }
                Err(_) => {
                    let err = format!("Step {index} timed out");
                    self.finalize_error(project_id, row_id, index, &step.tool, &err, correlation_id)
                        .await;
                    summary.push(StepResult {
                        index,
                        tool: step.tool,
                        status: "error".to_string(),
                        result: None,
                        error: Some(err),
                    });
                    break;
                }
            }
        }
        Ok(PlanSummary { steps: summary })
    }

    /// Typed dispatch per whitelisted tool. File-producing tools back up
    /// preexisting targets so revert can restore them.
    async fn execute_step(
        &self,
        project_id: &str,
        tool: &str,
        args: &Value,
    ) -> GatewayResult<Value> {
        match tool {
            "blender.create_primitive" => {
                let kind = args.get("type").and_then(Value::as_str).unwrap_or("cube");
                let size = args.get("size").and_then(Value::as_f64).unwrap_or(1.0);
                let name = args.get("name").and_then(Value::as_str);
                self.mcp.create_primitive(kind, size, name).await
            }
            "blender.export_fbx" => {
                let outfile = args
                    .get("outfile")
                    .and_then(Value::as_str)
                    .unwrap_or("Assets/Generated/agent_export.fbx");
                let compensate = self.backup_export_target(project_id, outfile);
                let mut result = self.mcp.export_fbx(outfile).await?;
                if let Some(obj) = result.as_object_mut() {
                    obj.insert("exported".to_string(), json!(outfile));
                    obj.insert("compensate".to_string(), compensate);
                }
                Ok(result)
            }
            "unity.instantiate_fbx" => {
                let asset = args
                    .get("asset")
                    .and_then(Value::as_str)
                    .unwrap_or("Assets/Generated/agent_export.fbx");
                self.mcp.instantiate_prefab(asset).await
            }
            "unity.get_scene_hierarchy" => self.mcp.get_scene_hierarchy().await,
            "unity.capture_screenshot" => self.mcp.capture_screenshot().await,
            "project.create_from_template" => {
                let name = args.get("name").and_then(Value::as_str).unwrap_or("Untitled");
                let projects =
                    crate::services::ProjectService::new(self.db.clone(), self.config.clone());
                let project = projects.create_project(name, None)?;
                Ok(json!({"projectId": project.id, "name": project.name}))
            }
            "ping" => Ok(json!({"mcp_ping": "pong"})),
            other => self.mcp.run_tool(other, args, None).await,
        }
    }

    /// Copies a preexisting export target into the project's backups
    /// folder and returns the compensate record for revert.
    fn backup_export_target(&self, project_id: &str, outfile: &str) -> Value {
        let abs_path = if Path::new(outfile).is_absolute() {
            PathBuf::from(outfile)
        } else {
            std::env::current_dir()
                .unwrap_or_else(|_| PathBuf::from("."))
                .join(outfile)
        };
        let existed = abs_path.exists();
        let mut backup_path: Option<String> = None;
        if existed {
            let root = self.config.get_all(false).projects.root;
            let backup_dir = Path::new(&root).join(project_id).join("context").join("backups");
            if std::fs::create_dir_all(&backup_dir).is_ok() {
                let file_name = abs_path
                    .file_name()
                    .map(|n| n.to_string_lossy().to_string())
                    .unwrap_or_else(|| "export".to_string());
                let target = backup_dir.join(format!("{}_{file_name}", Uuid::new_v4().simple()));
                match std::fs::copy(&abs_path, &target) {
                    Ok(_) => backup_path = Some(target.display().to_string()),
                    Err(e) => warn!("export backup failed for {}: {e}", abs_path.display()),
                }
            }
        }
        json!({
            "type": "file",
            "op": "export",
            "path": abs_path.display().to_string(),
            "existed": existed,
            "backup_path": backup_path,
        })
    }

    /// Best-effort revert of a timeline step. Known reversible tools act;
    /// everything else records a pending revert.
    pub async fn revert(&self, event_id: i64) -> GatewayResult<Value> {
        let ev = self
            .db
            .get_timeline_event(event_id)?
            .ok_or_else(|| GatewayError::NotFound(format!("timeline event {event_id}")))?;

        let mut reverted = false;
        let mut note: Option<String> = None;
        let result: Option<Value> = ev
            .result_json
            .as_deref()
            .and_then(|raw| serde_json::from_str(raw).ok());

        match ev.tool.as_str() {
            "unity.instantiate_fbx" => {
                let asset = result
                    .as_ref()
                    .and_then(|r| r.get("instantiated"))
                    .and_then(Value::as_str);
                if let Some(asset) = asset {
                    match self.mcp.unity_command(&destroy_instances_code(asset)).await {
                        Ok(_) => {
                            reverted = true;
                            note = Some("Destroyed GameObjects matching asset name".to_string());
                        }
                        Err(e) => warn!("revert attempt failed: {e}"),
                    }
                }
            }
            "blender.export_fbx" => {
                let compensate = result.as_ref().and_then(|r| r.get("compensate"));
                if let Some(comp) = compensate {
                    let path = comp.get("path").and_then(Value::as_str);
                    let backup = comp.get("backup_path").and_then(Value::as_str);
                    let existed = comp.get("existed").and_then(Value::as_bool).unwrap_or(false);
                    match (path, backup, existed) {
                        (Some(path), Some(backup), true) => {
                            match std::fs::copy(backup, path) {
                                Ok(_) => {
                                    reverted = true;
                                    note = Some("Restored previous export from backup".to_string());
                                }
                                Err(e) => warn!("backup restore failed: {e}"),
                            }
                        }
                        (Some(path), None, false) => {
                            // Nothing existed before the export; remove it.
                            if std::fs::remove_file(path).is_ok() {
                                reverted = true;
                                note = Some("Removed exported file".to_string());
                            }
                        }
                        _ => {}
                    }
                }
            }
            _ => {}
        }

        let status = if reverted { "reverted" } else { "pending" };
        timeline::record_event(
            &self.db,
            &self.broker,
            &ev.project_id,
            &format!("revert-{status}"),
            json!({"target": ev.id, "note": note}),
            vec![ev.id.to_string()],
            ev.correlation_id.as_deref(),
        )
        .await?;
        Ok(json!({"status": status, "note": note}))
    }

    async fn finalize_error(
        &self,
        project_id: &str,
        row_id: i64,
        index: usize,
        tool: &str,
        err: &str,
        correlation_id: Option<&str>,
    ) {
        if let Err(e) = self
            .db
            .finish_timeline_event(row_id, "error", &json!({"error": err}).to_string())
        {
            error!("failed updating timeline on error: {e}");
        }
        self.broadcast_timeline(
            project_id,
            index,
            tool,
            "error",
            Some(&json!({"error": err})),
            correlation_id,
        )
        .await;
        self.broadcast_error(project_id, err, correlation_id).await;
    }

    async fn broadcast_timeline(
        &self,
        project_id: &str,
        index: usize,
        tool: &str,
        status: &str,
        result: Option<&Value>,
        correlation_id: Option<&str>,
    ) {
        let envelope = Envelope::new(
            EventType::Timeline,
            Some(project_id.to_string()),
            json!({
                "index": index,
                "tool": tool,
                "status": status,
                "result": result,
                "timestamp": crate::db::now_ts(),
                "correlationId": correlation_id,
            }),
            correlation_id.map(str::to_string),
        );
        self.broker.broadcast_project(project_id, &envelope).await;
    }

    async fn broadcast_action(
        &self,
        project_id: &str,
        index: usize,
        tool: &str,
        args: &Value,
        correlation_id: Option<&str>,
    ) {
        let envelope = Envelope::new(
            EventType::Action,
            Some(project_id.to_string()),
            json!({
                "index": index,
                "tool": tool,
                "args": args,
                "timestamp": crate::db::now_ts(),
                "correlationId": correlation_id,
            }),
            correlation_id.map(str::to_string),
        );
        self.broker.broadcast_project(project_id, &envelope).await;
    }

    async fn broadcast_update(
        &self,
        project_id: &str,
        tool: &str,
        result: &Value,
        correlation_id: Option<&str>,
    ) {
        // Scene reads go out on the scene stream; everything else is a
        // generic update.
        let event_type = if tool == "unity.get_scene_hierarchy" {
            EventType::Scene
        } else {
            EventType::Update
        };
        let envelope = Envelope::new(
            event_type,
            Some(project_id.to_string()),
            json!({
                "tool": tool,
                "data": result,
                "timestamp": crate::db::now_ts(),
                "correlationId": correlation_id,
            }),
            correlation_id.map(str::to_string),
        );
        self.broker.broadcast_project(project_id, &envelope).await;
    }

    async fn broadcast_error(&self, project_id: &str, message: &str, correlation_id: Option<&str>) {
        let envelope = Envelope::new(
            EventType::Error,
            Some(project_id.to_string()),
            json!({
                "error": message,
                "timestamp": crate::db::now_ts(),
                "correlationId": correlation_id,
            }),
            correlation_id.map(str::to_string),
        );
        self.broker.broadcast_project(project_id, &envelope).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigStore;

    fn orchestrator(dir: &Path, blender_timeout: f64) -> (ActionOrchestrator, Arc<Db>, Arc<Broker>) {
        let config = Arc::new(ConfigStore::open(dir.join("settings.toml")).unwrap());
        config
            .update(json!({
                "projects": {"root": dir.join("projects").to_string_lossy()},
                "timeouts": {"blender_addon": blender_timeout, "unity_editor": blender_timeout},
            }))
            .unwrap();
        let db = Arc::new(Db::open_in_memory().unwrap());
        db.create_project("p", "P", "p").unwrap();
        let broker = Arc::new(Broker::new());
        // Nothing listens on this port; adapter calls fail after retries.
        let mcp = Arc::new(McpClient::new("http://127.0.0.1:1", config.clone()));
        (
            ActionOrchestrator::new(db.clone(), broker.clone(), mcp, config),
            db,
            broker,
        )
    }

    #[test]
    fn sanitizer_clamps_strings_lists_and_depth() {
        let long = "x".repeat(5000);
        let deep = json!({"a": {"b": {"c": {"d": {"e": {"f": {"g": 1}}}}}}});
        let many: Vec<i32> = (0..500).collect();
        let args = json!({"s": long, "deep": deep, "list": many});
        let out = sanitize_args(&args);
        assert_eq!(out["s"].as_str().unwrap().len(), MAX_STRING_LEN);
        assert_eq!(out["list"].as_array().unwrap().len(), MAX_COLLECTION_LEN);
        // Depth overflow becomes null.
        assert!(out["deep"]["a"]["b"]["c"]["d"]["e"]["f"].is_null());
        // Non-object args collapse to an empty object.
        assert_eq!(sanitize_args(&json!([1, 2, 3])), json!({}));
    }

    #[tokio::test]
    async fn unknown_tool_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (orch, db, _broker) = orchestrator(dir.path(), 5.0);
        let summary = orch
            .run_plan(
                "p",
                vec![PlanStep {
                    tool: "filesystem.rm_rf".to_string(),
                    args: json!({}),
                }],
                None,
            )
            .await
            .unwrap();
        assert_eq!(summary.steps.len(), 1);
        assert_eq!(summary.steps[0].status, "error");
        assert!(summary.steps[0].error.as_ref().unwrap().contains("not allowed"));
        // Rejected before any timeline row was written.
        assert!(db.list_timeline_events("p", 10).unwrap().is_empty());
    }

    #[tokio::test]
    async fn ping_plan_succeeds_and_persists_rows() {
        let dir = tempfile::tempdir().unwrap();
        let (orch, db, broker) = orchestrator(dir.path(), 5.0);
        let (_h, mut rx) = broker.join(Some("p".to_string())).await;

        let summary = orch
            .run_plan(
                "p",
                vec![PlanStep {
                    tool: "ping".to_string(),
                    args: json!({}),
                }],
                Some("corr-1"),
            )
            .await
            .unwrap();
        assert_eq!(summary.steps[0].status, "success");

        let events = db.list_timeline_events("p", 10).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].status, "success");
        assert_eq!(events[0].step_index, 0);
        assert_eq!(events[0].correlation_id.as_deref(), Some("corr-1"));
        assert!(events[0].finished_at.is_some());

        // action, timeline(running), timeline(success), update
        let mut types = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            let v: Value = serde_json::from_str(&msg).unwrap();
            types.push(v["type"].as_str().unwrap().to_string());
        }
        assert_eq!(types, vec!["action", "timeline", "timeline", "update"]);
    }

    #[tokio::test]
    async fn failing_step_aborts_plan() {
        let dir = tempfile::tempdir().unwrap();
        let (orch, db, _broker) = orchestrator(dir.path(), 2.0);
        let summary = orch
            .run_plan(
                "p",
                vec![
                    PlanStep {
                        // Adapter unreachable: upstream failure.
                        tool: "unity.get_scene_hierarchy".to_string(),
                        args: json!({}),
                    },
                    PlanStep {
                        tool: "ping".to_string(),
                        args: json!({}),
                    },
                ],
                None,
            )
            .await
            .unwrap();
        assert_eq!(summary.steps.len(), 1);
        assert_eq!(summary.steps[0].status, "error");
        let events = db.list_timeline_events("p", 10).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].status, "error");
        assert!(events[0].result_json.as_ref().unwrap().contains("error"));
    }

    #[tokio::test]
    async fn hanging_step_times_out_and_aborts() {
        let dir = tempfile::tempdir().unwrap();
        // A listener that accepts but never answers simulates a hung tool.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((socket, _)) = listener.accept().await else { break };
                // Hold the socket open without replying.
                tokio::spawn(async move {
                    let _socket = socket;
                    tokio::time::sleep(Duration::from_secs(30)).await;
                });
            }
        });

        let config = Arc::new(ConfigStore::open(dir.path().join("settings.toml")).unwrap());
        config
            .update(json!({
                "projects": {"root": dir.path().join("projects").to_string_lossy()},
                "timeouts": {"blender_addon": 1.0},
            }))
            .unwrap();
        let db = Arc::new(Db::open_in_memory().unwrap());
        db.create_project("p", "P", "p").unwrap();
        let broker = Arc::new(Broker::new());
        let mcp = Arc::new(McpClient::new(format!("http://{addr}"), config.clone()));
        let orch = ActionOrchestrator::new(db.clone(), broker, mcp, config);

        let summary = orch
            .run_plan(
                "p",
                vec![PlanStep {
                    tool: "blender.export_fbx".to_string(),
                    args: json!({"outfile": "out.fbx"}),
                }],
                None,
            )
            .await
            .unwrap();
        assert_eq!(summary.steps.len(), 1);
        assert_eq!(summary.steps[0].status, "error");
        assert_eq!(summary.steps[0].error.as_deref(), Some("Step 0 timed out"));

        let events = db.list_timeline_events("p", 10).unwrap();
        assert_eq!(events[0].status, "error");
        assert!(events[0].result_json.as_ref().unwrap().contains("error"));
    }

    #[tokio::test]
    async fn revert_of_unknown_tool_is_pending() {
        let dir = tempfile::tempdir().unwrap();
        let (orch, db, _broker) = orchestrator(dir.path(), 5.0);
        let id = db
            .add_timeline_event("p", 0, "blender.create_primitive", "{}", "success", Some("{}"), None, &crate::db::now_ts(), Some(&crate::db::now_ts()))
            .unwrap();
        let out = orch.revert(id).await.unwrap();
        assert_eq!(out["status"], "pending");
        let events = db.list_timeline_events("p", 10).unwrap();
        assert!(events.iter().any(|e| e.tool == "event:revert-pending"));
    }

    #[tokio::test]
    async fn revert_export_restores_backup() {
        let dir = tempfile::tempdir().unwrap();
        let (orch, db, _broker) = orchestrator(dir.path(), 5.0);

        let target = dir.path().join("out.fbx");
        std::fs::write(&target, b"overwritten contents").unwrap();
        let backup = dir.path().join("backup.fbx");
        std::fs::write(&backup, b"original contents").unwrap();

        let result = json!({
            "compensate": {
                "type": "file",
                "op": "export",
                "path": target.display().to_string(),
                "existed": true,
                "backup_path": backup.display().to_string(),
            }
        });
        let id = db
            .add_timeline_event("p", 0, "blender.export_fbx", "{}", "success", Some(&result.to_string()), None, &crate::db::now_ts(), Some(&crate::db::now_ts()))
            .unwrap();

        let out = orch.revert(id).await.unwrap();
        assert_eq!(out["status"], "reverted");
        assert_eq!(std::fs::read(&target).unwrap(), b"original contents");
    }
}
