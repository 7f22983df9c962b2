//! Versioned task plans: validation with auto-repair, cycle rejection,
//! acceptance with supersession, and a JSON export mirrored to disk.

use crate::config::ConfigStore;
use crate::db::{Db, Task, TaskPlan};
use crate::errors::{GatewayError, GatewayResult};
use crate::ws::{Broker, Envelope, EventType};
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;

/// A task dict after validation and repair.
#[derive(Debug, Clone)]
pub struct RepairedTask {
    pub code: String,
    pub title: String,
    pub description: String,
    pub acceptance_criteria: Vec<String>,
    pub dependencies: Vec<String>,
    pub mcp_tools: Vec<Value>,
    pub deliverables: Vec<Value>,
    pub estimates: Value,
    pub priority: i64,
}

pub struct PlanService {
    db: Arc<Db>,
    broker: Arc<Broker>,
    config: Arc<ConfigStore>,
}

impl PlanService {
    pub fn new(db: Arc<Db>, broker: Arc<Broker>, config: Arc<ConfigStore>) -> Self {
        Self { db, broker, config }
    }

    /// Creates a new plan version from raw task dicts. Tasks are repaired
    /// where possible; cycles reject the whole plan with `Conflict`.
    pub async fn create_plan(
        &self,
        project_id: &str,
        tasks: &[Value],
        created_by: &str,
    ) -> GatewayResult<(TaskPlan, Vec<String>)> {
        let (repaired, warnings) = validate_and_repair(tasks)?;
        if has_circular_dependencies(&repaired) {
            return Err(GatewayError::Conflict(
                "Plan rejected: circular dependencies detected".to_string(),
            ));
        }

        let version = self.db.max_plan_version(project_id)? + 1;
        let plan = self.db.create_task_plan(
            project_id,
            version,
            Some(&format!("Plan v{version} generated")),
            created_by,
        )?;

        for (idx, task) in repaired.iter().enumerate() {
            self.db.add_task(
                project_id,
                Some(plan.id),
                idx as i64,
                &task.code,
                &task.title,
                &task.description,
                &task.acceptance_criteria.join("\n"),
                &serde_json::to_string(&task.dependencies)?,
                &serde_json::to_string(&task.mcp_tools)?,
                &serde_json::to_string(&task.deliverables)?,
                &task.estimates.to_string(),
                task.priority,
            )?;
        }

        self.export_plan_to_json(project_id, &plan)?;

        let envelope = Envelope::new(
            EventType::PlanGenerated,
            Some(project_id.to_string()),
            json!({"planId": plan.id, "version": plan.version, "taskCount": repaired.len()}),
            None,
        );
        self.broker.broadcast_project(project_id, &envelope).await;

        Ok((plan, warnings))
    }

    /// Accepts a plan; prior accepted plans become superseded and the
    /// project points at the new one.
    pub async fn accept_plan(&self, plan_id: i64) -> GatewayResult<TaskPlan> {
        let plan = self.db.accept_plan(plan_id)?;
        self.export_plan_to_json(&plan.project_id, &plan)?;
        let envelope = Envelope::new(
            EventType::PlanAccepted,
            Some(plan.project_id.clone()),
            json!({"planId": plan.id, "version": plan.version}),
            None,
        );
        self.broker.broadcast_project(&plan.project_id, &envelope).await;
        Ok(plan)
    }

    /// A refinement is a new AI-produced version of an existing plan.
    pub async fn refine_plan(
        &self,
        plan_id: i64,
        tasks: &[Value],
    ) -> GatewayResult<(TaskPlan, Vec<String>)> {
        self.new_version_from(plan_id, tasks, "ai", EventType::PlanRefined)
            .await
    }

    /// A manual edit produces a new user-authored version.
    pub async fn edit_plan(
        &self,
        plan_id: i64,
        tasks: &[Value],
    ) -> GatewayResult<(TaskPlan, Vec<String>)> {
        self.new_version_from(plan_id, tasks, "user", EventType::PlanEdited)
            .await
    }

    async fn new_version_from(
        &self,
        plan_id: i64,
        tasks: &[Value],
        created_by: &str,
        event_type: EventType,
    ) -> GatewayResult<(TaskPlan, Vec<String>)> {
        let base = self
            .db
            .get_plan(plan_id)?
            .ok_or_else(|| GatewayError::NotFound(format!("plan {plan_id}")))?;
        let (plan, warnings) = self.create_plan(&base.project_id, tasks, created_by).await?;
        let envelope = Envelope::new(
            event_type,
            Some(base.project_id.clone()),
            json!({"planId": plan.id, "version": plan.version, "basedOn": base.id}),
            None,
        );
        self.broker.broadcast_project(&base.project_id, &envelope).await;
        Ok((plan, warnings))
    }

    pub fn list_plans(&self, project_id: &str) -> GatewayResult<Vec<TaskPlan>> {
        self.db.list_plans(project_id)
    }

    pub fn plan_tasks(&self, plan_id: i64) -> GatewayResult<Vec<Task>> {
        self.db.list_plan_tasks(plan_id)
    }

    /// Mirrors the plan into `projects/<id>/plans/plan_v<n>.json`.
    fn export_plan_to_json(&self, project_id: &str, plan: &TaskPlan) -> GatewayResult<()> {
        let root = self.config.get_all(false).projects.root;
        let plans_dir = Path::new(&root).join(project_id).join("plans");
        std::fs::create_dir_all(&plans_dir)?;

        let tasks = self.db.list_plan_tasks(plan.id)?;
        let rendered = json!({
            "version": plan.version,
            "status": plan.status,
            "summary": plan.summary,
            "created_by": plan.created_by,
            "created_at": plan.created_at,
            "tasks": tasks.iter().map(|t| json!({
                "code": t.code,
                "title": t.title,
                "description": t.description,
                "dependencies": parse_or_empty_array(&t.deps_json),
                "mcp_tools": parse_or_empty_array(&t.mcp_tools_json),
                "deliverables": parse_or_empty_array(&t.deliverables_json),
                "estimates": serde_json::from_str::<Value>(&t.estimates_json).unwrap_or(json!({})),
                "priority": t.priority,
            })).collect::<Vec<_>>(),
        });
        std::fs::write(
            plans_dir.join(format!("plan_v{}.json", plan.version)),
            serde_json::to_string_pretty(&rendered)?,
        )?;
        Ok(())
    }
}

fn parse_or_empty_array(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or(json!([]))
}

fn mk_code(n: usize) -> String {
    format!("T-{n:03}")
}

fn is_valid_code(code: &str) -> bool {
    code.len() == 5
        && code.starts_with("T-")
        && code[2..].chars().all(|c| c.is_ascii_digit())
}

/// Normalizes raw task dicts: assigns unique `T-###` codes, defaults and
/// clamps titles, coerces acceptance criteria to a list, deduplicates
/// dependencies to known codes with self-references dropped, and clamps
/// priority into [1..5].
pub fn validate_and_repair(tasks: &[Value]) -> GatewayResult<(Vec<RepairedTask>, Vec<String>)> {
    let mut warnings = Vec::new();
    let mut repaired = Vec::new();
    let mut codes = HashSet::new();

    for (i, raw) in tasks.iter().enumerate() {
        let obj = raw.as_object().ok_or_else(|| {
            GatewayError::SchemaViolation(format!("Task at index {i} is not an object"))
        })?;

        let raw_code = obj
            .get("code")
            .and_then(Value::as_str)
            .unwrap_or("")
            .trim()
            .to_string();
        let mut n = i + 1;
        let mut code = if is_valid_code(&raw_code) {
            raw_code
        } else {
            mk_code(n)
        };
        while codes.contains(&code) {
            n += 1;
            code = mk_code(n);
        }
        codes.insert(code.clone());

        let mut title = obj
            .get("title")
            .and_then(Value::as_str)
            .unwrap_or("")
            .trim()
            .to_string();
        if title.is_empty() {
            title = format!("Task {code}");
        } else if title.len() < 3 {
            title.push_str("...");
        }
        title.truncate(200);

        let acceptance_criteria = match obj.get("acceptance_criteria") {
            Some(Value::String(s)) => vec![s.clone()],
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect(),
            _ => Vec::new(),
        };

        let mut seen_deps = HashSet::new();
        let dependencies: Vec<String> = obj
            .get("dependencies")
            .and_then(Value::as_array)
            .map(|deps| {
                deps.iter()
                    .filter_map(|d| d.as_str().map(str::to_string))
                    .filter(|d| !d.is_empty() && seen_deps.insert(d.clone()))
                    .collect()
            })
            .unwrap_or_default();

        let priority_raw = obj.get("priority").and_then(Value::as_i64).unwrap_or(1);
        let priority = priority_raw.clamp(1, 5);
        if priority != priority_raw {
            warnings.push(format!("Task {code}: priority clamped to {priority}"));
        }

        repaired.push(RepairedTask {
            code,
            title,
            description: obj
                .get("description")
                .and_then(Value::as_str)
                .unwrap_or("")
                .to_string(),
            acceptance_criteria,
            dependencies,
            mcp_tools: obj
                .get("mcp_tools")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default(),
            deliverables: obj
                .get("deliverables")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default(),
            estimates: obj.get("estimates").cloned().unwrap_or(json!({})),
            priority,
        });
    }

    // Dependencies normalize to known codes; self-references are dropped.
    let known: HashSet<String> = codes;
    for task in &mut repaired {
        task.dependencies
            .retain(|d| d != &task.code && known.contains(d));
    }

    Ok((repaired, warnings))
}

/// DFS cycle detection over the dependency graph.
pub fn has_circular_dependencies(tasks: &[RepairedTask]) -> bool {
    let graph: HashMap<&str, &Vec<String>> = tasks
        .iter()
        .map(|t| (t.code.as_str(), &t.dependencies))
        .collect();

    fn visit<'a>(
        node: &'a str,
        graph: &HashMap<&'a str, &'a Vec<String>>,
        visiting: &mut HashSet<&'a str>,
        visited: &mut HashSet<&'a str>,
    ) -> bool {
        visiting.insert(node);
        if let Some(deps) = graph.get(node) {
            for dep in deps.iter() {
                if visiting.contains(dep.as_str()) {
                    return true;
                }
                if !visited.contains(dep.as_str())
                    && graph.contains_key(dep.as_str())
                    && visit(dep, graph, visiting, visited)
                {
                    return true;
                }
            }
        }
        visiting.remove(node);
        visited.insert(node);
        false
    }

    let mut visited = HashSet::new();
    for code in graph.keys().copied() {
        if !visited.contains(code) {
            let mut visiting = HashSet::new();
            if visit(code, &graph, &mut visiting, &mut visited) {
                return true;
            }
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service(dir: &Path) -> PlanService {
        let config = Arc::new(ConfigStore::open(dir.join("settings.toml")).unwrap());
        config
            .update(json!({"projects": {"root": dir.join("projects").to_string_lossy()}}))
            .unwrap();
        let db = Arc::new(Db::open_in_memory().unwrap());
        db.create_project("p", "P", "p").unwrap();
        PlanService::new(db, Arc::new(Broker::new()), config)
    }

    #[test]
    fn repair_assigns_codes_and_drops_self_refs() {
        let input = vec![
            json!({"title": "A", "acceptance_criteria": "x"}),
            json!({"code": "T-002", "title": "B", "dependencies": ["T-001", "T-002"]}),
        ];
        let (repaired, _warnings) = validate_and_repair(&input).unwrap();
        assert!(repaired[0].code.starts_with("T-"));
        assert_ne!(repaired[0].code, repaired[1].code);
        assert_eq!(repaired[0].acceptance_criteria, vec!["x".to_string()]);
        assert_eq!(repaired[1].dependencies, vec!["T-001".to_string()]);
    }

    #[test]
    fn repair_clamps_priority_and_titles() {
        let input = vec![json!({"title": "ab", "priority": 99})];
        let (repaired, warnings) = validate_and_repair(&input).unwrap();
        assert_eq!(repaired[0].priority, 5);
        assert_eq!(repaired[0].title, "ab...");
        assert!(!warnings.is_empty());
    }

    #[test]
    fn unknown_dependencies_are_dropped() {
        let input = vec![json!({"code": "T-001", "title": "A", "dependencies": ["T-404"]})];
        let (repaired, _) = validate_and_repair(&input).unwrap();
        assert!(repaired[0].dependencies.is_empty());
    }

    #[test]
    fn cycles_are_detected() {
        let input = vec![
            json!({"code": "T-001", "title": "A", "dependencies": ["T-002"]}),
            json!({"code": "T-002", "title": "B", "dependencies": ["T-001"]}),
        ];
        let (repaired, _) = validate_and_repair(&input).unwrap();
        assert!(has_circular_dependencies(&repaired));

        let acyclic = vec![
            json!({"code": "T-001", "title": "A"}),
            json!({"code": "T-002", "title": "B", "dependencies": ["T-001"]}),
        ];
        let (repaired, _) = validate_and_repair(&acyclic).unwrap();
        assert!(!has_circular_dependencies(&repaired));
    }

    #[tokio::test]
    async fn cyclic_plan_is_rejected_with_conflict() {
        let dir = tempfile::tempdir().unwrap();
        let svc = service(dir.path());
        let input = vec![
            json!({"code": "T-001", "title": "A", "dependencies": ["T-002"]}),
            json!({"code": "T-002", "title": "B", "dependencies": ["T-001"]}),
        ];
        let err = svc.create_plan("p", &input, "ai").await.unwrap_err();
        assert!(matches!(err, GatewayError::Conflict(_)));
    }

    #[tokio::test]
    async fn versioning_and_acceptance() {
        let dir = tempfile::tempdir().unwrap();
        let svc = service(dir.path());
        let tasks = vec![json!({"title": "Build the cube"})];

        let (v1, _) = svc.create_plan("p", &tasks, "ai").await.unwrap();
        assert_eq!(v1.version, 1);
        svc.accept_plan(v1.id).await.unwrap();

        let (v2, _) = svc.create_plan("p", &tasks, "ai").await.unwrap();
        assert_eq!(v2.version, 2);
        svc.accept_plan(v2.id).await.unwrap();

        let plans = svc.list_plans("p").unwrap();
        assert_eq!(plans[0].status, "superseded");
        assert_eq!(plans[1].status, "accepted");

        // Disk export mirrors the accepted plan.
        assert!(dir
            .path()
            .join("projects")
            .join("p")
            .join("plans")
            .join("plan_v2.json")
            .is_file());
    }

    #[tokio::test]
    async fn plan_tasks_are_persisted_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let svc = service(dir.path());
        let tasks = vec![
            json!({"title": "first"}),
            json!({"title": "second", "dependencies": ["T-001"]}),
        ];
        let (plan, _) = svc.create_plan("p", &tasks, "user").await.unwrap();
        let rows = svc.plan_tasks(plan.id).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].code, "T-001");
        assert_eq!(rows[1].code, "T-002");
        assert_eq!(rows[1].deps_json, "[\"T-001\"]");
        assert_eq!(rows[0].status, "pending");
    }
}
