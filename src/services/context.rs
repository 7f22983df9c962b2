//! Versioned project and task contexts. Creation deactivates the previous
//! active version atomically; generation after a completed task asks the
//! agent one-shot and falls back to a deterministic heuristic.

use super::tasks::next_available;
use crate::agent::AgentSession;
use crate::config::ConfigStore;
use crate::db::{ContextRow, Db, Task};
use crate::errors::{GatewayError, GatewayResult};
use crate::ws::{Broker, Envelope, EventType};
use serde_json::{json, Map, Value};
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;
use tracing::warn;

const AI_ATTEMPTS: usize = 2;

pub struct ContextService {
    db: Arc<Db>,
    broker: Arc<Broker>,
    config: Arc<ConfigStore>,
}

impl ContextService {
    pub fn new(db: Arc<Db>, broker: Arc<Broker>, config: Arc<ConfigStore>) -> Self {
        Self { db, broker, config }
    }

    pub fn get_active(
        &self,
        project_id: &str,
        scope: &str,
        task_id: Option<i64>,
    ) -> GatewayResult<Option<Value>> {
        let row = self.db.get_active_context(project_id, scope, task_id)?;
        Ok(row.and_then(|r| serde_json::from_str(&r.content).ok()))
    }

    pub fn list_history(
        &self,
        project_id: &str,
        scope: &str,
        limit: usize,
    ) -> GatewayResult<Vec<ContextRow>> {
        self.db.list_context_history(project_id, scope, limit)
    }

    /// Persists a new context version, mirrors it to the project's
    /// context directory and announces the update.
    pub async fn create(
        &self,
        project_id: &str,
        content: &Value,
        scope: &str,
        task_id: Option<i64>,
        created_by: &str,
    ) -> GatewayResult<ContextRow> {
        if scope == "task" && task_id.is_none() {
            return Err(GatewayError::SchemaViolation(
                "task-scoped context requires a task id".to_string(),
            ));
        }
        let source = if created_by == "user" {
            "manual-edit"
        } else {
            "ai-generate"
        };
        let rendered = serde_json::to_string_pretty(content)?;
        let row = self.db.create_context(
            project_id,
            scope,
            if scope == "task" { task_id } else { None },
            &rendered,
            created_by,
            Some(source),
        )?;
        if let Err(e) = self.sync_to_files(project_id, scope, content, task_id) {
            warn!("context file sync failed: {e}");
        }
        let envelope = Envelope::new(
            EventType::ContextUpdated,
            Some(project_id.to_string()),
            json!({"scope": scope, "taskId": task_id, "version": row.version, "createdBy": created_by}),
            None,
        );
        self.broker.broadcast_project(project_id, &envelope).await;
        Ok(row)
    }

    /// Builds the post-task context snapshot. The one-shot agent gets two
    /// attempts; any failure falls back to the heuristic update so the
    /// pipeline never stalls on AI availability.
    pub async fn generate_after_task(
        &self,
        project_id: &str,
        task_id: i64,
        session: Option<&AgentSession>,
    ) -> GatewayResult<Value> {
        let task = self
            .db
            .get_task(task_id)?
            .ok_or_else(|| GatewayError::NotFound(format!("task {task_id}")))?;

        let artifacts: Vec<Value> = self
            .db
            .list_task_artifacts(task_id)?
            .iter()
            .map(|a| {
                json!({
                    "type": a.kind,
                    "path": a.path,
                    "category": a.category,
                    "ts": a.ts,
                })
            })
            .collect();

        let old_global = self
            .get_active(project_id, "global", None)?
            .unwrap_or(json!({}));
        let all_tasks = self.db.list_tasks(project_id)?;
        let done_codes: BTreeSet<String> = all_tasks
            .iter()
            .filter(|t| t.status == "done")
            .map(|t| t.code.clone())
            .collect();
        let pending_count = all_tasks.iter().filter(|t| t.status != "done").count();
        let next_task = next_available(&all_tasks);

        let mut generated: Option<Value> = None;
        if let Some(session) = session {
            let prompt = build_generation_prompt(&task, &artifacts, &old_global);
            for attempt in 1..=AI_ATTEMPTS {
                let (answer, error) = session.ask_one_shot(project_id, &prompt).await;
                if let Some(answer) = answer {
                    match serde_json::from_str::<Value>(&answer) {
                        Ok(parsed) if parsed.is_object() => {
                            generated = Some(parsed);
                            break;
                        }
                        Ok(_) | Err(_) => {
                            warn!("context generation returned non-object (attempt {attempt})");
                        }
                    }
                }
                if let Some(error) = error {
                    warn!("AI context generation error (attempt {attempt}): {error}");
                }
            }
        }

        let version = old_global
            .get("version")
            .and_then(Value::as_i64)
            .unwrap_or(0)
            + 1;
        let mut content = generated.unwrap_or_else(|| {
            heuristic_fallback(&old_global, &task, &done_codes, pending_count, next_task.as_ref())
        });
        if let Some(obj) = content.as_object_mut() {
            normalize_generated(obj, version, &old_global, &done_codes, pending_count, next_task.as_ref());
        }

        let created = self.create(project_id, &content, "global", None, "ai").await?;

        // Brief task-scoped snapshot for the completed task.
        let task_snapshot = json!({
            "summary": format!("Task {} completed", task.code),
            "artifacts": artifacts.iter().take(10).collect::<Vec<_>>(),
            "completed_at": crate::db::now_ts(),
        });
        if let Err(e) = self.create(project_id, &task_snapshot, "task", Some(task_id), "ai").await {
            warn!("task context snapshot failed: {e}");
        }

        let envelope = Envelope::new(
            EventType::ContextGenerated,
            Some(project_id.to_string()),
            json!({"scope": "global", "version": created.version}),
            None,
        );
        self.broker.broadcast_project(project_id, &envelope).await;

        Ok(content)
    }

    /// Mirrors context content under `projects/<id>/context/`.
    fn sync_to_files(
        &self,
        project_id: &str,
        scope: &str,
        content: &Value,
        task_id: Option<i64>,
    ) -> GatewayResult<()> {
        let root = self.config.get_all(false).projects.root;
        let project_dir = Path::new(&root).join(project_id);
        match scope {
            "global" => {
                let context_dir = project_dir.join("context");
                std::fs::create_dir_all(&context_dir)?;
                std::fs::write(
                    context_dir.join("active_context.json"),
                    serde_json::to_string_pretty(content)?,
                )?;
                let history_dir = context_dir.join("history");
                std::fs::create_dir_all(&history_dir)?;
                let version = content.get("version").and_then(Value::as_i64).unwrap_or(1);
                std::fs::write(
                    history_dir.join(format!("context_v{version}.json")),
                    serde_json::to_string_pretty(content)?,
                )?;
            }
            "task" => {
                if let Some(tid) = task_id {
                    if let Some(task) = self.db.get_task(tid)? {
                        let task_dir = project_dir.join("context").join("tasks").join(&task.code);
                        std::fs::create_dir_all(&task_dir)?;
                        std::fs::write(
                            task_dir.join("active.json"),
                            serde_json::to_string_pretty(content)?,
                        )?;
                    }
                }
            }
            _ => {}
        }
        Ok(())
    }
}

fn build_generation_prompt(task: &Task, artifacts: &[Value], old_global: &Value) -> String {
    format!(
        "Task completed: {}\n\nGenerated artifacts: {}\n\nPrevious global context: {}\n\n\
         Produce an updated context as JSON with fields: version, current_task, done_tasks, \
         pending_tasks, summary, decisions, open_questions, risks.",
        json!({
            "code": task.code,
            "title": task.title,
            "description": task.description,
            "acceptance": task.acceptance,
            "status": task.status,
        }),
        json!(artifacts),
        old_global
    )
}

fn heuristic_fallback(
    old_global: &Value,
    task: &Task,
    done_codes: &BTreeSet<String>,
    pending_count: usize,
    next_task: Option<&Task>,
) -> Value {
    let mut done: BTreeSet<String> = old_global
        .get("done_tasks")
        .and_then(Value::as_array)
        .map(|arr| {
            arr.iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default();
    done.extend(done_codes.iter().cloned());

    let old_summary = old_global
        .get("summary")
        .and_then(Value::as_str)
        .unwrap_or("");
    json!({
        "current_task": next_task.map(|t| t.code.clone()),
        "done_tasks": done.iter().collect::<Vec<_>>(),
        "pending_tasks": pending_count,
        "summary": format!("{old_summary}\nCompleted {}: {}", task.code, task.title),
        "decisions": old_global.get("decisions").cloned().unwrap_or(json!([])),
        "open_questions": old_global.get("open_questions").cloned().unwrap_or(json!([])),
        "risks": old_global.get("risks").cloned().unwrap_or(json!([])),
    })
}

/// Missing baseline fields are filled regardless of how the content was
/// produced, and version/last_update are always stamped by the service.
fn normalize_generated(
    obj: &mut Map<String, Value>,
    version: i64,
    old_global: &Value,
    done_codes: &BTreeSet<String>,
    pending_count: usize,
    next_task: Option<&Task>,
) {
    obj.insert("version".to_string(), json!(version));
    obj.entry("current_task".to_string())
        .or_insert_with(|| json!(next_task.map(|t| t.code.clone())));
    if !obj.contains_key("done_tasks") {
        let mut done: BTreeSet<String> = old_global
            .get("done_tasks")
            .and_then(Value::as_array)
            .map(|arr| {
                arr.iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();
        done.extend(done_codes.iter().cloned());
        obj.insert("done_tasks".to_string(), json!(done.iter().collect::<Vec<_>>()));
    }
    obj.entry("pending_tasks".to_string())
        .or_insert_with(|| json!(pending_count));
    obj.insert("last_update".to_string(), json!(crate::db::now_ts()));
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service(dir: &Path) -> (ContextService, Arc<Db>) {
        let config = Arc::new(ConfigStore::open(dir.join("settings.toml")).unwrap());
        config
            .update(json!({"projects": {"root": dir.join("projects").to_string_lossy()}}))
            .unwrap();
        let db = Arc::new(Db::open_in_memory().unwrap());
        db.create_project("p", "P", "p").unwrap();
        (
            ContextService::new(db.clone(), Arc::new(Broker::new()), config),
            db,
        )
    }

    #[tokio::test]
    async fn create_activates_exclusively_and_syncs_files() {
        let dir = tempfile::tempdir().unwrap();
        let (svc, db) = service(dir.path());
        svc.create("p", &json!({"version": 1}), "global", None, "system")
            .await
            .unwrap();
        svc.create("p", &json!({"version": 2}), "global", None, "user")
            .await
            .unwrap();

        let active = db.get_active_context("p", "global", None).unwrap().unwrap();
        assert_eq!(active.version, 2);
        assert_eq!(active.source.as_deref(), Some("manual-edit"));

        let context_dir = dir.path().join("projects").join("p").join("context");
        assert!(context_dir.join("active_context.json").is_file());
        assert!(context_dir.join("history").join("context_v2.json").is_file());
    }

    #[tokio::test]
    async fn task_scope_requires_task_id() {
        let dir = tempfile::tempdir().unwrap();
        let (svc, _db) = service(dir.path());
        let err = svc
            .create("p", &json!({}), "task", None, "system")
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::SchemaViolation(_)));
    }

    #[tokio::test]
    async fn context_current_task_follows_the_shared_ranking() {
        let dir = tempfile::tempdir().unwrap();
        let (svc, db) = service(dir.path());
        let done_id = db
            .add_task("p", None, 0, "T-001", "Done", "", "", "[]", "[]", "[]", "{}", 1)
            .unwrap();
        db.mark_task_done(done_id, "[]").unwrap();
        // Same priority; the higher-value task must win in both the
        // context snapshot and the task auto-advance.
        db.add_task("p", None, 1, "T-002", "Small", "", "", "[]", "[]", "[]", "{\"story_points\": 3}", 1)
            .unwrap();
        db.add_task("p", None, 2, "T-003", "Big", "", "", "[]", "[]", "[]", "{\"story_points\": 8}", 1)
            .unwrap();

        let content = svc.generate_after_task("p", done_id, None).await.unwrap();
        assert_eq!(content["current_task"], "T-003");
    }

    #[tokio::test]
    async fn heuristic_generation_produces_baseline_fields() {
        let dir = tempfile::tempdir().unwrap();
        let (svc, db) = service(dir.path());
        let done_id = db
            .add_task("p", None, 0, "T-001", "Make cube", "", "", "[]", "[]", "[]", "{}", 1)
            .unwrap();
        db.mark_task_done(done_id, "[]").unwrap();
        db.add_task("p", None, 1, "T-002", "Export", "", "", "[\"T-001\"]", "[]", "[]", "{}", 1)
            .unwrap();

        let content = svc.generate_after_task("p", done_id, None).await.unwrap();
        assert_eq!(content["version"], 1);
        assert_eq!(content["current_task"], "T-002");
        assert_eq!(content["pending_tasks"], 1);
        assert!(content["done_tasks"]
            .as_array()
            .unwrap()
            .iter()
            .any(|v| v == "T-001"));
        assert!(content.get("last_update").is_some());
        assert!(content.get("summary").is_some());
        assert!(content.get("decisions").is_some());
        assert!(content.get("open_questions").is_some());
        assert!(content.get("risks").is_some());

        // Version advances on repeated generation.
        let again = svc.generate_after_task("p", done_id, None).await.unwrap();
        assert_eq!(again["version"], 2);

        // A task-scoped snapshot was recorded for the completed task.
        assert!(db
            .get_active_context("p", "task", Some(done_id))
            .unwrap()
            .is_some());
    }
}
