//! Task execution flow: next-task selection by score, the
//! pending → in_progress → done state machine, and the post-completion
//! context regeneration plus auto-advance.

use super::context::ContextService;
use crate::agent::AgentSession;
use crate::db::{Db, Task};
use crate::errors::{GatewayError, GatewayResult};
use crate::ws::{Broker, Envelope, EventType};
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::warn;

pub struct TaskService {
    db: Arc<Db>,
    broker: Arc<Broker>,
}

impl TaskService {
    pub fn new(db: Arc<Db>, broker: Arc<Broker>) -> Self {
        Self { db, broker }
    }

    pub fn list_tasks(&self, project_id: &str) -> GatewayResult<Vec<Task>> {
        self.db.list_tasks(project_id)
    }

    pub fn get_task(&self, task_id: i64) -> GatewayResult<Option<Task>> {
        self.db.get_task(task_id)
    }

    /// Next pending task whose dependencies are all done, under the
    /// shared ranking.
    pub fn next_available_task(&self, project_id: &str) -> GatewayResult<Option<Task>> {
        let tasks = self.db.list_tasks(project_id)?;
        Ok(next_available(&tasks))
    }

    /// Moves a pending task to in_progress and points the project's
    /// current task at it. At most one task per project may be in
    /// progress; callers must block or complete the current one first.
    pub async fn start_task(&self, task_id: i64) -> GatewayResult<Task> {
        let task = self
            .db
            .get_task(task_id)?
            .ok_or_else(|| GatewayError::NotFound(format!("task {task_id}")))?;
        if task.status == "done" {
            return Err(GatewayError::Conflict(format!(
                "task {} is already done",
                task.code
            )));
        }
        let in_progress = self
            .db
            .list_tasks(&task.project_id)?
            .into_iter()
            .find(|t| t.status == "in_progress" && t.id != task_id);
        if let Some(current) = in_progress {
            return Err(GatewayError::Conflict(format!(
                "task {} is already in progress; block or complete it first",
                current.code
            )));
        }
        self.db.mark_task_started(task_id)?;
        self.db.set_current_task(&task.project_id, Some(task_id))?;

        let task = self
            .db
            .get_task(task_id)?
            .ok_or_else(|| GatewayError::NotFound(format!("task {task_id}")))?;
        self.emit_task_event(&task, EventType::TaskStarted, json!({}))
            .await;
        Ok(task)
    }

    /// Completes a task: stamps it done, regenerates the project context,
    /// auto-starts the next available task and announces both.
    pub async fn complete_task(
        &self,
        task_id: i64,
        evidence: &Value,
        context_service: &ContextService,
        session: Option<&AgentSession>,
    ) -> GatewayResult<Task> {
        let task = self
            .db
            .get_task(task_id)?
            .ok_or_else(|| GatewayError::NotFound(format!("task {task_id}")))?;
        self.db
            .mark_task_done(task_id, &evidence.to_string())?;
        self.db.set_current_task(&task.project_id, None)?;

        if let Err(e) = context_service
            .generate_after_task(&task.project_id, task_id, session)
            .await
        {
            warn!("context generation after task {task_id} failed: {e}");
        }

        let remaining = self.db.list_tasks(&task.project_id)?;
        let next = if remaining.iter().any(|t| t.status == "in_progress") {
            // Another task is mid-flight; leave the pipeline alone.
            None
        } else {
            next_available(&remaining)
        };
        if let Some(next_task) = &next {
            if let Err(e) = self.start_task(next_task.id).await {
                warn!("auto-start of task {} failed: {e}", next_task.code);
            }
        }

        let task = self
            .db
            .get_task(task_id)?
            .ok_or_else(|| GatewayError::NotFound(format!("task {task_id}")))?;
        self.emit_task_event(
            &task,
            EventType::TaskCompleted,
            json!({"next_task": next.as_ref().map(|t| t.code.clone())}),
        )
        .await;
        Ok(task)
    }

    /// Marks a task blocked; the project's current task pointer is
    /// cleared if it pointed here.
    pub async fn block_task(&self, task_id: i64, reason: Option<&str>) -> GatewayResult<Task> {
        let task = self
            .db
            .get_task(task_id)?
            .ok_or_else(|| GatewayError::NotFound(format!("task {task_id}")))?;
        if task.status == "done" {
            return Err(GatewayError::Conflict(format!(
                "task {} is already done",
                task.code
            )));
        }
        self.db.set_task_status(task_id, "blocked")?;
        let project = self.db.get_project(&task.project_id)?;
        if project.and_then(|p| p.current_task_id) == Some(task_id) {
            self.db.set_current_task(&task.project_id, None)?;
        }
        let task = self
            .db
            .get_task(task_id)?
            .ok_or_else(|| GatewayError::NotFound(format!("task {task_id}")))?;
        self.emit_task_event(&task, EventType::TaskBlocked, json!({"reason": reason}))
            .await;
        Ok(task)
    }

    /// Relays a progress note for an in-flight task to subscribed clients.
    pub async fn report_progress(&self, task_id: i64, note: &str) -> GatewayResult<()> {
        let task = self
            .db
            .get_task(task_id)?
            .ok_or_else(|| GatewayError::NotFound(format!("task {task_id}")))?;
        self.emit_task_event(&task, EventType::TaskProgress, json!({"note": note}))
            .await;
        Ok(())
    }

    async fn emit_task_event(&self, task: &Task, event_type: EventType, extra: Value) {
        let mut payload = json!({
            "task": {
                "id": task.id,
                "code": task.code,
                "title": task.title,
                "status": task.status,
            }
        });
        if let (Some(obj), Some(extra_obj)) = (payload.as_object_mut(), extra.as_object()) {
            for (k, v) in extra_obj {
                obj.insert(k.clone(), v.clone());
            }
        }
        let envelope = Envelope::new(event_type, Some(task.project_id.clone()), payload, None);
        self.broker
            .broadcast_project(&task.project_id, &envelope)
            .await;
    }
}

/// Spec ranking over a project's tasks: the next pending task whose
/// dependencies are all done, by priority ascending, then story points
/// descending (more value first), then plan order.
pub fn next_available(tasks: &[Task]) -> Option<Task> {
    let done_codes: HashSet<String> = tasks
        .iter()
        .filter(|t| t.status == "done")
        .map(|t| t.code.clone())
        .collect();
    let mut available: Vec<&Task> = tasks
        .iter()
        .filter(|t| t.status == "pending")
        .filter(|t| deps_met(t, &done_codes))
        .collect();
    available.sort_by_key(|t| (t.priority, -story_points(t), t.idx));
    available.first().map(|t| (*t).clone())
}

fn deps_met(task: &Task, done_codes: &HashSet<String>) -> bool {
    match serde_json::from_str::<Vec<String>>(&task.deps_json) {
        Ok(deps) => deps.iter().all(|d| done_codes.contains(d)),
        // Malformed dependency lists keep the task blocked.
        Err(_) => false,
    }
}

fn story_points(task: &Task) -> i64 {
    serde_json::from_str::<Value>(&task.estimates_json)
        .ok()
        .and_then(|v| v.get("story_points").and_then(Value::as_i64))
        .unwrap_or(5)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigStore;

    struct Fixture {
        tasks: TaskService,
        context: ContextService,
        db: Arc<Db>,
        _dir: tempfile::TempDir,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let config = Arc::new(
            ConfigStore::open(dir.path().join("settings.toml")).unwrap(),
        );
        config
            .update(json!({"projects": {"root": dir.path().join("projects").to_string_lossy()}}))
            .unwrap();
        let db = Arc::new(Db::open_in_memory().unwrap());
        db.create_project("p", "P", "p").unwrap();
        let broker = Arc::new(Broker::new());
        Fixture {
            tasks: TaskService::new(db.clone(), broker.clone()),
            context: ContextService::new(db.clone(), broker, config),
            db,
            _dir: dir,
        }
    }

    fn add_task(db: &Db, idx: i64, code: &str, deps: &str, priority: i64, points: i64) -> i64 {
        db.add_task(
            "p",
            None,
            idx,
            code,
            code,
            "",
            "",
            deps,
            "[]",
            "[]",
            &format!("{{\"story_points\": {points}}}"),
            priority,
        )
        .unwrap()
    }

    #[test]
    fn next_task_ranks_priority_then_points_then_idx() {
        let fx = fixture();
        add_task(&fx.db, 0, "T-001", "[]", 2, 8);
        add_task(&fx.db, 1, "T-002", "[]", 1, 3);
        add_task(&fx.db, 2, "T-003", "[]", 1, 8);
        let next = fx.tasks.next_available_task("p").unwrap().unwrap();
        // Priority 1 wins; among those, more story points first.
        assert_eq!(next.code, "T-003");
    }

    #[test]
    fn blocked_tasks_are_skipped_until_deps_done() {
        let fx = fixture();
        let first = add_task(&fx.db, 0, "T-001", "[]", 1, 5);
        add_task(&fx.db, 1, "T-002", "[\"T-001\"]", 1, 5);
        assert_eq!(
            fx.tasks.next_available_task("p").unwrap().unwrap().code,
            "T-001"
        );
        fx.db.mark_task_done(first, "[]").unwrap();
        assert_eq!(
            fx.tasks.next_available_task("p").unwrap().unwrap().code,
            "T-002"
        );
    }

    #[tokio::test]
    async fn start_task_sets_current_task_invariant() {
        let fx = fixture();
        let id = add_task(&fx.db, 0, "T-001", "[]", 1, 5);
        let task = fx.tasks.start_task(id).await.unwrap();
        assert_eq!(task.status, "in_progress");
        assert!(task.started_at.is_some());
        let project = fx.db.get_project("p").unwrap().unwrap();
        assert_eq!(project.current_task_id, Some(id));
    }

    #[tokio::test]
    async fn completing_a_done_task_again_conflicts_on_start() {
        let fx = fixture();
        let id = add_task(&fx.db, 0, "T-001", "[]", 1, 5);
        fx.db.mark_task_done(id, "[]").unwrap();
        let err = fx.tasks.start_task(id).await.unwrap_err();
        assert!(matches!(err, GatewayError::Conflict(_)));
    }

    #[tokio::test]
    async fn second_start_conflicts_while_one_is_in_progress() {
        let fx = fixture();
        let first = add_task(&fx.db, 0, "T-001", "[]", 1, 5);
        let second = add_task(&fx.db, 1, "T-002", "[]", 1, 5);
        fx.tasks.start_task(first).await.unwrap();

        let err = fx.tasks.start_task(second).await.unwrap_err();
        assert!(matches!(err, GatewayError::Conflict(_)));
        // Only one task is in progress and the pointer still names it.
        let tasks = fx.db.list_tasks("p").unwrap();
        assert_eq!(tasks.iter().filter(|t| t.status == "in_progress").count(), 1);
        let project = fx.db.get_project("p").unwrap().unwrap();
        assert_eq!(project.current_task_id, Some(first));

        // Blocking the current task frees the slot.
        fx.tasks.block_task(first, None).await.unwrap();
        fx.tasks.start_task(second).await.unwrap();
        let project = fx.db.get_project("p").unwrap().unwrap();
        assert_eq!(project.current_task_id, Some(second));
    }

    #[tokio::test]
    async fn blocking_clears_current_task_pointer() {
        let fx = fixture();
        let id = add_task(&fx.db, 0, "T-001", "[]", 1, 5);
        fx.tasks.start_task(id).await.unwrap();
        let task = fx.tasks.block_task(id, Some("waiting on asset")).await.unwrap();
        assert_eq!(task.status, "blocked");
        let project = fx.db.get_project("p").unwrap().unwrap();
        assert_eq!(project.current_task_id, None);
    }

    #[tokio::test]
    async fn complete_regenerates_context_and_auto_starts_next() {
        let fx = fixture();
        let first = add_task(&fx.db, 0, "T-001", "[]", 1, 5);
        let second = add_task(&fx.db, 1, "T-002", "[\"T-001\"]", 1, 5);
        fx.tasks.start_task(first).await.unwrap();

        let done = fx
            .tasks
            .complete_task(first, &json!([{"kind": "screenshot"}]), &fx.context, None)
            .await
            .unwrap();
        assert_eq!(done.status, "done");
        assert!(done.completed_at.is_some());

        // Next task auto-started and stamped on the project.
        let next = fx.db.get_task(second).unwrap().unwrap();
        assert_eq!(next.status, "in_progress");
        let project = fx.db.get_project("p").unwrap().unwrap();
        assert_eq!(project.current_task_id, Some(second));

        // Context was regenerated for the project.
        assert!(fx
            .db
            .get_active_context("p", "global", None)
            .unwrap()
            .is_some());
    }
}
