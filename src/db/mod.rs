//! Embedded relational store. Schema is created from code; all multi-row
//! mutations (active-project swap, context activation, plan acceptance,
//! project cascade delete) run inside a single transaction.

mod rows;

pub use rows::*;

use crate::errors::{GatewayError, GatewayResult};
use chrono::Utc;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::Mutex;

/// SQLite caps host parameters near 999; keep IN(...) expansions under it.
const IN_CHUNK: usize = 900;

pub fn now_ts() -> String {
    Utc::now().to_rfc3339()
}

pub struct Db {
    conn: Mutex<Connection>,
}

impl Db {
    pub fn open(path: impl AsRef<Path>) -> GatewayResult<Self> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> GatewayResult<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> GatewayResult<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    // ------------------------------ projects ------------------------------

    pub fn create_project(&self, id: &str, name: &str, path: &str) -> GatewayResult<Project> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO projects (id, name, path, active, status) VALUES (?1, ?2, ?3, 0, 'draft')",
            params![id, name, path],
        )?;
        drop(conn);
        self.get_project(id)?
            .ok_or_else(|| GatewayError::Internal("project vanished after insert".into()))
    }

    pub fn get_project(&self, id: &str) -> GatewayResult<Option<Project>> {
        let conn = self.lock();
        let row = conn
            .query_row(
                "SELECT id, name, path, active, status, active_context_id, active_plan_id, current_task_id
                 FROM projects WHERE id = ?1",
                params![id],
                map_project,
            )
            .optional()?;
        Ok(row)
    }

    pub fn list_projects(&self) -> GatewayResult<Vec<Project>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT id, name, path, active, status, active_context_id, active_plan_id, current_task_id
             FROM projects ORDER BY id ASC",
        )?;
        let rows = stmt.query_map([], map_project)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn get_active_project(&self) -> GatewayResult<Option<Project>> {
        let conn = self.lock();
        let row = conn
            .query_row(
                "SELECT id, name, path, active, status, active_context_id, active_plan_id, current_task_id
                 FROM projects WHERE active = 1",
                [],
                map_project,
            )
            .optional()?;
        Ok(row)
    }

    /// Deactivates every project then activates the target, in one
    /// transaction. Rolls back with `NotFound` if the target is missing.
    pub fn set_active_project(&self, id: &str) -> GatewayResult<()> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        tx.execute("UPDATE projects SET active = 0", [])?;
        let changed = tx.execute("UPDATE projects SET active = 1 WHERE id = ?1", params![id])?;
        if changed == 0 {
            return Err(GatewayError::NotFound(format!("project '{id}'")));
        }
        tx.commit()?;
        Ok(())
    }

    pub fn set_current_task(&self, project_id: &str, task_id: Option<i64>) -> GatewayResult<()> {
        let conn = self.lock();
        conn.execute(
            "UPDATE projects SET current_task_id = ?2 WHERE id = ?1",
            params![project_id, task_id],
        )?;
        Ok(())
    }

    /// Deletes the project and every child row in one transaction.
    /// Agent messages and artifacts hang off sessions, so their deletes go
    /// through the collected session ids, chunked for the parameter cap.
    pub fn delete_project(&self, project_id: &str) -> GatewayResult<bool> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;

        let exists: Option<String> = tx
            .query_row(
                "SELECT id FROM projects WHERE id = ?1",
                params![project_id],
                |r| r.get(0),
            )
            .optional()?;
        if exists.is_none() {
            return Ok(false);
        }

        let session_ids: Vec<i64> = {
            let mut stmt = tx.prepare("SELECT id FROM sessions WHERE project_id = ?1")?;
            let ids = stmt.query_map(params![project_id], |r| r.get(0))?;
            ids.collect::<Result<Vec<_>, _>>()?
        };

        for chunk in session_ids.chunks(IN_CHUNK) {
            let placeholders = vec!["?"; chunk.len()].join(",");
            tx.execute(
                &format!("DELETE FROM agent_messages WHERE session_id IN ({placeholders})"),
                params_from_iter(chunk.iter()),
            )?;
            tx.execute(
                &format!("DELETE FROM artifacts WHERE session_id IN ({placeholders})"),
                params_from_iter(chunk.iter()),
            )?;
        }

        for table in [
            "event_log",
            "contexts",
            "task_plans",
            "tasks",
            "sessions",
            "timeline_events",
            "chat_messages",
        ] {
            tx.execute(
                &format!("DELETE FROM {table} WHERE project_id = ?1"),
                params![project_id],
            )?;
        }
        tx.execute("DELETE FROM projects WHERE id = ?1", params![project_id])?;
        tx.commit()?;
        Ok(true)
    }

    // ---------------------------- chat messages ---------------------------

    pub fn add_chat_message(
        &self,
        project_id: &str,
        task_id: Option<i64>,
        role: &str,
        content: &str,
        msg_id: &str,
    ) -> GatewayResult<ChatMessage> {
        let ts = now_ts();
        let conn = self.lock();
        conn.execute(
            "INSERT INTO chat_messages (msg_id, project_id, task_id, role, content, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![msg_id, project_id, task_id, role, content, ts],
        )?;
        let id = conn.last_insert_rowid();
        Ok(ChatMessage {
            id,
            msg_id: msg_id.to_string(),
            project_id: project_id.to_string(),
            task_id,
            role: role.to_string(),
            content: content.to_string(),
            created_at: ts,
        })
    }

    /// Newest-first listing, deduplicated by msg_id (chat and agent rows
    /// may both record the same turn).
    pub fn list_chat_messages(
        &self,
        project_id: &str,
        limit: usize,
        task_id: Option<i64>,
    ) -> GatewayResult<Vec<ChatMessage>> {
        let conn = self.lock();
        let mut out: Vec<ChatMessage> = Vec::new();
        let mut seen = std::collections::HashSet::new();
        let mut push = |m: ChatMessage| {
            if seen.insert(m.msg_id.clone()) && out.len() < limit {
                out.push(m);
            }
        };
        if let Some(tid) = task_id {
            let mut stmt = conn.prepare(
                "SELECT id, msg_id, project_id, task_id, role, content, created_at
                 FROM chat_messages WHERE project_id = ?1 AND task_id = ?2
                 ORDER BY created_at DESC, id DESC",
            )?;
            let rows = stmt.query_map(params![project_id, tid], map_chat_message)?;
            for row in rows {
                push(row?);
            }
        } else {
            let mut stmt = conn.prepare(
                "SELECT id, msg_id, project_id, task_id, role, content, created_at
                 FROM chat_messages WHERE project_id = ?1
                 ORDER BY created_at DESC, id DESC",
            )?;
            let rows = stmt.query_map(params![project_id], map_chat_message)?;
            for row in rows {
                push(row?);
            }
        }
        Ok(out)
    }

    // ------------------------------ timeline ------------------------------

    #[allow(clippy::too_many_arguments)]
    pub fn add_timeline_event(
        &self,
        project_id: &str,
        step_index: i64,
        tool: &str,
        args_json: &str,
        status: &str,
        result_json: Option<&str>,
        correlation_id: Option<&str>,
        started_at: &str,
        finished_at: Option<&str>,
    ) -> GatewayResult<i64> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO timeline_events
             (project_id, step_index, tool, args_json, status, result_json, correlation_id, started_at, finished_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                project_id,
                step_index,
                tool,
                args_json,
                status,
                result_json,
                correlation_id,
                started_at,
                finished_at
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn finish_timeline_event(
        &self,
        id: i64,
        status: &str,
        result_json: &str,
    ) -> GatewayResult<()> {
        let conn = self.lock();
        conn.execute(
            "UPDATE timeline_events SET status = ?2, result_json = ?3, finished_at = ?4 WHERE id = ?1",
            params![id, status, result_json, now_ts()],
        )?;
        Ok(())
    }

    pub fn get_timeline_event(&self, id: i64) -> GatewayResult<Option<TimelineEvent>> {
        let conn = self.lock();
        let row = conn
            .query_row(
                "SELECT id, project_id, step_index, tool, args_json, status, result_json, correlation_id, started_at, finished_at
                 FROM timeline_events WHERE id = ?1",
                params![id],
                map_timeline_event,
            )
            .optional()?;
        Ok(row)
    }

    pub fn list_timeline_events(
        &self,
        project_id: &str,
        limit: usize,
    ) -> GatewayResult<Vec<TimelineEvent>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT id, project_id, step_index, tool, args_json, status, result_json, correlation_id, started_at, finished_at
             FROM timeline_events WHERE project_id = ?1
             ORDER BY started_at DESC, id DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![project_id, limit as i64], map_timeline_event)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    // ------------------------------ sessions ------------------------------

    pub fn create_session(&self, project_id: &str, provider: &str) -> GatewayResult<SessionRow> {
        let ts = now_ts();
        let conn = self.lock();
        conn.execute(
            "INSERT INTO sessions (project_id, provider, started_at) VALUES (?1, ?2, ?3)",
            params![project_id, provider, ts],
        )?;
        Ok(SessionRow {
            id: conn.last_insert_rowid(),
            project_id: project_id.to_string(),
            provider: provider.to_string(),
            started_at: ts,
            ended_at: None,
            summary_text: None,
        })
    }

    pub fn end_session(&self, id: i64) -> GatewayResult<()> {
        let conn = self.lock();
        conn.execute(
            "UPDATE sessions SET ended_at = ?2 WHERE id = ?1",
            params![id, now_ts()],
        )?;
        Ok(())
    }

    pub fn update_session_summary(&self, id: i64, summary: &str) -> GatewayResult<()> {
        let conn = self.lock();
        conn.execute(
            "UPDATE sessions SET summary_text = ?2 WHERE id = ?1",
            params![id, summary],
        )?;
        Ok(())
    }

    pub fn list_sessions(&self, project_id: &str, limit: usize) -> GatewayResult<Vec<SessionRow>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT id, project_id, provider, started_at, ended_at, summary_text
             FROM sessions WHERE project_id = ?1 ORDER BY started_at DESC, id DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![project_id, limit as i64], map_session)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn get_last_session(&self, project_id: &str) -> GatewayResult<Option<SessionRow>> {
        Ok(self.list_sessions(project_id, 1)?.into_iter().next())
    }

    // --------------------------- agent messages ---------------------------

    #[allow(clippy::too_many_arguments)]
    pub fn add_agent_message(
        &self,
        session_id: i64,
        role: &str,
        content: &str,
        tool_name: Option<&str>,
        tool_args_json: Option<&str>,
        tool_result_json: Option<&str>,
    ) -> GatewayResult<i64> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO agent_messages (session_id, role, content, ts, tool_name, tool_args_json, tool_result_json)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                session_id,
                role,
                content,
                now_ts(),
                tool_name,
                tool_args_json,
                tool_result_json
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn list_agent_messages(
        &self,
        session_id: i64,
        limit: usize,
    ) -> GatewayResult<Vec<AgentMessage>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT id, session_id, role, content, ts, tool_name, tool_args_json, tool_result_json
             FROM agent_messages WHERE session_id = ?1 ORDER BY ts DESC, id DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![session_id, limit as i64], map_agent_message)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    // ------------------------------ artifacts -----------------------------

    #[allow(clippy::too_many_arguments)]
    pub fn add_artifact(
        &self,
        session_id: Option<i64>,
        task_id: Option<i64>,
        kind: &str,
        path: &str,
        category: Option<&str>,
        meta_json: Option<&str>,
        size_bytes: Option<i64>,
    ) -> GatewayResult<Artifact> {
        let ts = now_ts();
        let conn = self.lock();
        conn.execute(
            "INSERT INTO artifacts (session_id, task_id, type, path, category, meta_json, validation_status, size_bytes, ts)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'pending', ?7, ?8)",
            params![session_id, task_id, kind, path, category, meta_json, size_bytes, ts],
        )?;
        Ok(Artifact {
            id: conn.last_insert_rowid(),
            session_id,
            task_id,
            kind: kind.to_string(),
            path: path.to_string(),
            category: category.map(str::to_string),
            meta_json: meta_json.map(str::to_string),
            validation_status: "pending".to_string(),
            size_bytes,
            ts,
        })
    }

    pub fn get_artifact(&self, id: i64) -> GatewayResult<Option<Artifact>> {
        let conn = self.lock();
        let row = conn
            .query_row(
                "SELECT id, session_id, task_id, type, path, category, meta_json, validation_status, size_bytes, ts
                 FROM artifacts WHERE id = ?1",
                params![id],
                map_artifact,
            )
            .optional()?;
        Ok(row)
    }

    pub fn list_task_artifacts(&self, task_id: i64) -> GatewayResult<Vec<Artifact>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT id, session_id, task_id, type, path, category, meta_json, validation_status, size_bytes, ts
             FROM artifacts WHERE task_id = ?1 ORDER BY ts DESC, id DESC",
        )?;
        let rows = stmt.query_map(params![task_id], map_artifact)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn set_artifact_validation(&self, id: i64, status: &str) -> GatewayResult<()> {
        let conn = self.lock();
        conn.execute(
            "UPDATE artifacts SET validation_status = ?2 WHERE id = ?1",
            params![id, status],
        )?;
        Ok(())
    }

    // -------------------------------- tasks -------------------------------

    #[allow(clippy::too_many_arguments)]
    pub fn add_task(
        &self,
        project_id: &str,
        plan_id: Option<i64>,
        idx: i64,
        code: &str,
        title: &str,
        description: &str,
        acceptance: &str,
        deps_json: &str,
        mcp_tools_json: &str,
        deliverables_json: &str,
        estimates_json: &str,
        priority: i64,
    ) -> GatewayResult<i64> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO tasks (project_id, plan_id, idx, code, title, description, acceptance, status,
                                deps_json, mcp_tools_json, deliverables_json, estimates_json, priority)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 'pending', ?8, ?9, ?10, ?11, ?12)",
            params![
                project_id,
                plan_id,
                idx,
                code,
                title,
                description,
                acceptance,
                deps_json,
                mcp_tools_json,
                deliverables_json,
                estimates_json,
                priority
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn get_task(&self, id: i64) -> GatewayResult<Option<Task>> {
        let conn = self.lock();
        let row = conn
            .query_row(
                &format!("{TASK_SELECT} WHERE id = ?1"),
                params![id],
                map_task,
            )
            .optional()?;
        Ok(row)
    }

    pub fn list_tasks(&self, project_id: &str) -> GatewayResult<Vec<Task>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!(
            "{TASK_SELECT} WHERE project_id = ?1 ORDER BY id ASC"
        ))?;
        let rows = stmt.query_map(params![project_id], map_task)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn list_plan_tasks(&self, plan_id: i64) -> GatewayResult<Vec<Task>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!(
            "{TASK_SELECT} WHERE plan_id = ?1 ORDER BY idx ASC"
        ))?;
        let rows = stmt.query_map(params![plan_id], map_task)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn mark_task_started(&self, id: i64) -> GatewayResult<()> {
        let conn = self.lock();
        let changed = conn.execute(
            "UPDATE tasks SET status = 'in_progress', started_at = ?2 WHERE id = ?1",
            params![id, now_ts()],
        )?;
        if changed == 0 {
            return Err(GatewayError::NotFound(format!("task {id}")));
        }
        Ok(())
    }

    pub fn mark_task_done(&self, id: i64, evidence_json: &str) -> GatewayResult<()> {
        let conn = self.lock();
        let changed = conn.execute(
            "UPDATE tasks SET status = 'done', completed_at = ?2, evidence_json = ?3 WHERE id = ?1",
            params![id, now_ts(), evidence_json],
        )?;
        if changed == 0 {
            return Err(GatewayError::NotFound(format!("task {id}")));
        }
        Ok(())
    }

    pub fn set_task_status(&self, id: i64, status: &str) -> GatewayResult<()> {
        let conn = self.lock();
        conn.execute(
            "UPDATE tasks SET status = ?2 WHERE id = ?1",
            params![id, status],
        )?;
        Ok(())
    }

    // -------------------------------- plans -------------------------------

    pub fn max_plan_version(&self, project_id: &str) -> GatewayResult<i64> {
        let conn = self.lock();
        let version: Option<i64> = conn.query_row(
            "SELECT MAX(version) FROM task_plans WHERE project_id = ?1",
            params![project_id],
            |r| r.get(0),
        )?;
        Ok(version.unwrap_or(0))
    }

    pub fn create_task_plan(
        &self,
        project_id: &str,
        version: i64,
        summary: Option<&str>,
        created_by: &str,
    ) -> GatewayResult<TaskPlan> {
        let ts = now_ts();
        let conn = self.lock();
        conn.execute(
            "INSERT INTO task_plans (project_id, version, status, summary, created_by, created_at)
             VALUES (?1, ?2, 'proposed', ?3, ?4, ?5)",
            params![project_id, version, summary, created_by, ts],
        )?;
        Ok(TaskPlan {
            id: conn.last_insert_rowid(),
            project_id: project_id.to_string(),
            version,
            status: "proposed".to_string(),
            summary: summary.map(str::to_string),
            created_by: created_by.to_string(),
            created_at: ts,
        })
    }

    pub fn get_plan(&self, id: i64) -> GatewayResult<Option<TaskPlan>> {
        let conn = self.lock();
        let row = conn
            .query_row(
                "SELECT id, project_id, version, status, summary, created_by, created_at
                 FROM task_plans WHERE id = ?1",
                params![id],
                map_plan,
            )
            .optional()?;
        Ok(row)
    }

    pub fn list_plans(&self, project_id: &str) -> GatewayResult<Vec<TaskPlan>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT id, project_id, version, status, summary, created_by, created_at
             FROM task_plans WHERE project_id = ?1 ORDER BY version ASC",
        )?;
        let rows = stmt.query_map(params![project_id], map_plan)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Accepts a plan, superseding any other accepted plan of the project
    /// and stamping it on the project row, in one transaction.
    pub fn accept_plan(&self, plan_id: i64) -> GatewayResult<TaskPlan> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        let plan = tx
            .query_row(
                "SELECT id, project_id, version, status, summary, created_by, created_at
                 FROM task_plans WHERE id = ?1",
                params![plan_id],
                map_plan,
            )
            .optional()?
            .ok_or_else(|| GatewayError::NotFound(format!("plan {plan_id}")))?;

        tx.execute(
            "UPDATE task_plans SET status = 'superseded'
             WHERE project_id = ?1 AND id != ?2 AND status = 'accepted'",
            params![plan.project_id, plan_id],
        )?;
        tx.execute(
            "UPDATE task_plans SET status = 'accepted' WHERE id = ?1",
            params![plan_id],
        )?;
        tx.execute(
            "UPDATE projects SET active_plan_id = ?2,
                    status = CASE WHEN status IN ('draft','consensus') THEN 'active' ELSE status END
             WHERE id = ?1",
            params![plan.project_id, plan_id],
        )?;
        tx.commit()?;
        self.get_plan(plan_id)?
            .ok_or_else(|| GatewayError::Internal("plan vanished after accept".into()))
    }

    // ------------------------------ contexts ------------------------------

    pub fn get_active_context(
        &self,
        project_id: &str,
        scope: &str,
        task_id: Option<i64>,
    ) -> GatewayResult<Option<ContextRow>> {
        let conn = self.lock();
        let row = match task_id {
            Some(tid) => conn
                .query_row(
                    &format!("{CONTEXT_SELECT} WHERE project_id = ?1 AND scope = ?2 AND task_id = ?3 AND is_active = 1"),
                    params![project_id, scope, tid],
                    map_context,
                )
                .optional()?,
            None => conn
                .query_row(
                    &format!("{CONTEXT_SELECT} WHERE project_id = ?1 AND scope = ?2 AND task_id IS NULL AND is_active = 1"),
                    params![project_id, scope],
                    map_context,
                )
                .optional()?,
        };
        Ok(row)
    }

    /// Inserts a new context version and deactivates the previous active
    /// rows of the same (scope, task) in the same transaction.
    pub fn create_context(
        &self,
        project_id: &str,
        scope: &str,
        task_id: Option<i64>,
        content: &str,
        created_by: &str,
        source: Option<&str>,
    ) -> GatewayResult<ContextRow> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        let (max_version, deactivate_sql): (Option<i64>, &str) = match task_id {
            Some(tid) => (
                tx.query_row(
                    "SELECT MAX(version) FROM contexts WHERE project_id = ?1 AND scope = ?2 AND task_id = ?3",
                    params![project_id, scope, tid],
                    |r| r.get(0),
                )?,
                "UPDATE contexts SET is_active = 0 WHERE project_id = ?1 AND scope = ?2 AND task_id = ?3 AND is_active = 1",
            ),
            None => (
                tx.query_row(
                    "SELECT MAX(version) FROM contexts WHERE project_id = ?1 AND scope = ?2",
                    params![project_id, scope],
                    |r| r.get(0),
                )?,
                "UPDATE contexts SET is_active = 0 WHERE project_id = ?1 AND scope = ?2 AND task_id IS NULL AND is_active = 1",
            ),
        };
        match task_id {
            Some(tid) => tx.execute(deactivate_sql, params![project_id, scope, tid])?,
            None => tx.execute(deactivate_sql, params![project_id, scope])?,
        };
        let version = max_version.unwrap_or(0) + 1;
        let ts = now_ts();
        tx.execute(
            "INSERT INTO contexts (project_id, scope, task_id, content, created_by, source, version, is_active, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 1, ?8)",
            params![project_id, scope, task_id, content, created_by, source, version, ts],
        )?;
        let id = tx.last_insert_rowid();
        tx.commit()?;
        Ok(ContextRow {
            id,
            project_id: project_id.to_string(),
            scope: scope.to_string(),
            task_id,
            content: content.to_string(),
            created_by: created_by.to_string(),
            source: source.map(str::to_string),
            version,
            is_active: true,
            created_at: ts,
        })
    }

    pub fn list_context_history(
        &self,
        project_id: &str,
        scope: &str,
        limit: usize,
    ) -> GatewayResult<Vec<ContextRow>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!(
            "{CONTEXT_SELECT} WHERE project_id = ?1 AND scope = ?2 ORDER BY version DESC LIMIT ?3"
        ))?;
        let rows = stmt.query_map(params![project_id, scope, limit as i64], map_context)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    // ------------------------------ event log -----------------------------

    pub fn add_event_log(
        &self,
        project_id: &str,
        event_type: &str,
        payload_json: &str,
    ) -> GatewayResult<i64> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO event_log (project_id, event_type, payload_json, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![project_id, event_type, payload_json, now_ts()],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn list_event_log(
        &self,
        project_id: &str,
        limit: usize,
    ) -> GatewayResult<Vec<EventLogEntry>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT id, project_id, event_type, payload_json, created_at
             FROM event_log WHERE project_id = ?1 ORDER BY id DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![project_id, limit as i64], |r| {
            Ok(EventLogEntry {
                id: r.get(0)?,
                project_id: r.get(1)?,
                event_type: r.get(2)?,
                payload_json: r.get(3)?,
                created_at: r.get(4)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    #[cfg(test)]
    pub fn count(&self, table: &str) -> i64 {
        let conn = self.lock();
        conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |r| r.get(0))
            .unwrap_or(0)
    }
}

const TASK_SELECT: &str = "SELECT id, project_id, plan_id, idx, code, title, description, acceptance, status,
    deps_json, mcp_tools_json, deliverables_json, estimates_json, evidence_json, priority, started_at, completed_at
    FROM tasks";

const CONTEXT_SELECT: &str = "SELECT id, project_id, scope, task_id, content, created_by, source, version, is_active, created_at
    FROM contexts";

fn map_project(r: &Row<'_>) -> rusqlite::Result<Project> {
    Ok(Project {
        id: r.get(0)?,
        name: r.get(1)?,
        path: r.get(2)?,
        active: r.get(3)?,
        status: r.get(4)?,
        active_context_id: r.get(5)?,
        active_plan_id: r.get(6)?,
        current_task_id: r.get(7)?,
    })
}

fn map_chat_message(r: &Row<'_>) -> rusqlite::Result<ChatMessage> {
    Ok(ChatMessage {
        id: r.get(0)?,
        msg_id: r.get(1)?,
        project_id: r.get(2)?,
        task_id: r.get(3)?,
        role: r.get(4)?,
        content: r.get(5)?,
        created_at: r.get(6)?,
    })
}

fn map_timeline_event(r: &Row<'_>) -> rusqlite::Result<TimelineEvent> {
    Ok(TimelineEvent {
        id: r.get(0)?,
        project_id: r.get(1)?,
        step_index: r.get(2)?,
        tool: r.get(3)?,
        args_json: r.get(4)?,
        status: r.get(5)?,
        result_json: r.get(6)?,
        correlation_id: r.get(7)?,
        started_at: r.get(8)?,
        finished_at: r.get(9)?,
    })
}

fn map_session(r: &Row<'_>) -> rusqlite::Result<SessionRow> {
    Ok(SessionRow {
        id: r.get(0)?,
        project_id: r.get(1)?,
        provider: r.get(2)?,
        started_at: r.get(3)?,
        ended_at: r.get(4)?,
        summary_text: r.get(5)?,
    })
}

fn map_agent_message(r: &Row<'_>) -> rusqlite::Result<AgentMessage> {
    Ok(AgentMessage {
        id: r.get(0)?,
        session_id: r.get(1)?,
        role: r.get(2)?,
        content: r.get(3)?,
        ts: r.get(4)?,
        tool_name: r.get(5)?,
        tool_args_json: r.get(6)?,
        tool_result_json: r.get(7)?,
    })
}

fn map_artifact(r: &Row<'_>) -> rusqlite::Result<Artifact> {
    Ok(Artifact {
        id: r.get(0)?,
        session_id: r.get(1)?,
        task_id: r.get(2)?,
        kind: r.get(3)?,
        path: r.get(4)?,
        category: r.get(5)?,
        meta_json: r.get(6)?,
        validation_status: r.get(7)?,
        size_bytes: r.get(8)?,
        ts: r.get(9)?,
    })
}

fn map_task(r: &Row<'_>) -> rusqlite::Result<Task> {
    Ok(Task {
        id: r.get(0)?,
        project_id: r.get(1)?,
        plan_id: r.get(2)?,
        idx: r.get(3)?,
        code: r.get(4)?,
        title: r.get(5)?,
        description: r.get(6)?,
        acceptance: r.get(7)?,
        status: r.get(8)?,
        deps_json: r.get(9)?,
        mcp_tools_json: r.get(10)?,
        deliverables_json: r.get(11)?,
        estimates_json: r.get(12)?,
        evidence_json: r.get(13)?,
        priority: r.get(14)?,
        started_at: r.get(15)?,
        completed_at: r.get(16)?,
    })
}

fn map_plan(r: &Row<'_>) -> rusqlite::Result<TaskPlan> {
    Ok(TaskPlan {
        id: r.get(0)?,
        project_id: r.get(1)?,
        version: r.get(2)?,
        status: r.get(3)?,
        summary: r.get(4)?,
        created_by: r.get(5)?,
        created_at: r.get(6)?,
    })
}

fn map_context(r: &Row<'_>) -> rusqlite::Result<ContextRow> {
    Ok(ContextRow {
        id: r.get(0)?,
        project_id: r.get(1)?,
        scope: r.get(2)?,
        task_id: r.get(3)?,
        content: r.get(4)?,
        created_by: r.get(5)?,
        source: r.get(6)?,
        version: r.get(7)?,
        is_active: r.get(8)?,
        created_at: r.get(9)?,
    })
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS projects (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    path TEXT NOT NULL,
    active INTEGER NOT NULL DEFAULT 0,
    status TEXT NOT NULL DEFAULT 'draft',
    active_context_id INTEGER,
    active_plan_id INTEGER,
    current_task_id INTEGER
);

CREATE TABLE IF NOT EXISTS chat_messages (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    msg_id TEXT NOT NULL,
    project_id TEXT NOT NULL,
    task_id INTEGER,
    role TEXT NOT NULL,
    content TEXT NOT NULL,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_chat_messages_project ON chat_messages(project_id);
CREATE INDEX IF NOT EXISTS idx_chat_messages_msg_id ON chat_messages(msg_id);

CREATE TABLE IF NOT EXISTS timeline_events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    project_id TEXT NOT NULL,
    step_index INTEGER NOT NULL,
    tool TEXT NOT NULL,
    args_json TEXT NOT NULL,
    status TEXT NOT NULL,
    result_json TEXT,
    correlation_id TEXT,
    started_at TEXT NOT NULL,
    finished_at TEXT
);
CREATE INDEX IF NOT EXISTS idx_timeline_events_project ON timeline_events(project_id);

CREATE TABLE IF NOT EXISTS sessions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    project_id TEXT NOT NULL,
    provider TEXT NOT NULL DEFAULT 'gemini_cli',
    started_at TEXT NOT NULL,
    ended_at TEXT,
    summary_text TEXT
);
CREATE INDEX IF NOT EXISTS idx_sessions_project ON sessions(project_id);

CREATE TABLE IF NOT EXISTS agent_messages (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id INTEGER NOT NULL,
    role TEXT NOT NULL,
    content TEXT NOT NULL DEFAULT '',
    ts TEXT NOT NULL,
    tool_name TEXT,
    tool_args_json TEXT,
    tool_result_json TEXT
);
CREATE INDEX IF NOT EXISTS idx_agent_messages_session ON agent_messages(session_id);

CREATE TABLE IF NOT EXISTS artifacts (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id INTEGER,
    task_id INTEGER,
    type TEXT NOT NULL,
    path TEXT NOT NULL,
    category TEXT,
    meta_json TEXT,
    validation_status TEXT NOT NULL DEFAULT 'pending',
    size_bytes INTEGER,
    ts TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_artifacts_session ON artifacts(session_id);
CREATE INDEX IF NOT EXISTS idx_artifacts_task ON artifacts(task_id);

CREATE TABLE IF NOT EXISTS tasks (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    project_id TEXT NOT NULL,
    plan_id INTEGER,
    idx INTEGER NOT NULL DEFAULT 0,
    code TEXT NOT NULL,
    title TEXT NOT NULL,
    description TEXT NOT NULL DEFAULT '',
    acceptance TEXT NOT NULL DEFAULT '',
    status TEXT NOT NULL DEFAULT 'pending',
    deps_json TEXT NOT NULL DEFAULT '[]',
    mcp_tools_json TEXT NOT NULL DEFAULT '[]',
    deliverables_json TEXT NOT NULL DEFAULT '[]',
    estimates_json TEXT NOT NULL DEFAULT '{}',
    evidence_json TEXT,
    priority INTEGER NOT NULL DEFAULT 1,
    started_at TEXT,
    completed_at TEXT
);
CREATE INDEX IF NOT EXISTS idx_tasks_project ON tasks(project_id);
CREATE INDEX IF NOT EXISTS idx_tasks_plan ON tasks(plan_id);

CREATE TABLE IF NOT EXISTS task_plans (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    project_id TEXT NOT NULL,
    version INTEGER NOT NULL,
    status TEXT NOT NULL DEFAULT 'proposed',
    summary TEXT,
    created_by TEXT NOT NULL DEFAULT 'ai',
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_task_plans_project ON task_plans(project_id);

CREATE TABLE IF NOT EXISTS contexts (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    project_id TEXT NOT NULL,
    scope TEXT NOT NULL,
    task_id INTEGER,
    content TEXT NOT NULL,
    created_by TEXT NOT NULL DEFAULT 'system',
    source TEXT,
    version INTEGER NOT NULL DEFAULT 1,
    is_active INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_contexts_project ON contexts(project_id);

CREATE TABLE IF NOT EXISTS event_log (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    project_id TEXT NOT NULL,
    event_type TEXT NOT NULL,
    payload_json TEXT NOT NULL,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_event_log_project ON event_log(project_id);
"#;

#[cfg(test)]
mod tests {
    use super::*;

    fn db() -> Db {
        Db::open_in_memory().unwrap()
    }

    #[test]
    fn active_project_is_unique() {
        let db = db();
        db.create_project("alpha", "Alpha", "alpha").unwrap();
        db.create_project("beta", "Beta", "beta").unwrap();

        db.set_active_project("alpha").unwrap();
        assert_eq!(db.get_active_project().unwrap().unwrap().id, "alpha");
        let active: Vec<_> = db
            .list_projects()
            .unwrap()
            .into_iter()
            .filter(|p| p.active)
            .collect();
        assert_eq!(active.len(), 1);

        db.set_active_project("beta").unwrap();
        assert_eq!(db.get_active_project().unwrap().unwrap().id, "beta");
        assert!(!db.get_project("alpha").unwrap().unwrap().active);
    }

    #[test]
    fn set_active_project_missing_rolls_back() {
        let db = db();
        db.create_project("alpha", "Alpha", "alpha").unwrap();
        db.set_active_project("alpha").unwrap();
        let err = db.set_active_project("ghost").unwrap_err();
        assert!(matches!(err, GatewayError::NotFound(_)));
        // Rollback preserved the previous active flag.
        assert_eq!(db.get_active_project().unwrap().unwrap().id, "alpha");
    }

    #[test]
    fn delete_project_cascades_without_orphans() {
        let db = db();
        db.create_project("x", "X", "x").unwrap();
        let s1 = db.create_session("x", "gemini_cli").unwrap();
        let s2 = db.create_session("x", "gemini_cli").unwrap();
        for i in 0..5 {
            let sid = if i % 2 == 0 { s1.id } else { s2.id };
            db.add_agent_message(sid, "assistant", "m", None, None, None)
                .unwrap();
        }
        for i in 0..3 {
            db.add_artifact(Some(s1.id), None, "fbx", &format!("a{i}.fbx"), None, None, None)
                .unwrap();
        }
        for i in 0..10 {
            db.add_chat_message("x", None, "user", &format!("hi {i}"), &format!("m{i}"))
                .unwrap();
        }
        for i in 0..4 {
            db.add_timeline_event("x", i, "ping", "{}", "success", None, None, &now_ts(), None)
                .unwrap();
        }
        db.create_task_plan("x", 1, None, "ai").unwrap();
        for i in 0..6 {
            db.add_task("x", None, i, &format!("T-{:03}", i + 1), "t", "", "", "[]", "[]", "[]", "{}", 1)
                .unwrap();
        }
        db.create_context("x", "global", None, "{}", "system", None)
            .unwrap();
        db.create_context("x", "global", None, "{}", "system", None)
            .unwrap();
        for _ in 0..3 {
            db.add_event_log("x", "test", "{}").unwrap();
        }

        assert!(db.delete_project("x").unwrap());
        for table in [
            "projects",
            "sessions",
            "agent_messages",
            "artifacts",
            "chat_messages",
            "timeline_events",
            "task_plans",
            "tasks",
            "contexts",
            "event_log",
        ] {
            assert_eq!(db.count(table), 0, "orphans left in {table}");
        }
        assert!(!db.delete_project("x").unwrap());
    }

    #[test]
    fn context_activation_is_exclusive() {
        let db = db();
        db.create_project("p", "P", "p").unwrap();
        let c1 = db
            .create_context("p", "global", None, "{\"v\":1}", "system", None)
            .unwrap();
        assert_eq!(c1.version, 1);
        assert!(c1.is_active);
        let c2 = db
            .create_context("p", "global", None, "{\"v\":2}", "ai", None)
            .unwrap();
        assert_eq!(c2.version, 2);

        let active = db.get_active_context("p", "global", None).unwrap().unwrap();
        assert_eq!(active.id, c2.id);
        let history = db.list_context_history("p", "global", 10).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history.iter().filter(|c| c.is_active).count(), 1);

        // Task-scoped contexts do not interfere with global scope.
        let t = db
            .create_context("p", "task", Some(7), "{}", "ai", None)
            .unwrap();
        assert!(t.is_active);
        assert_eq!(
            db.get_active_context("p", "global", None).unwrap().unwrap().id,
            c2.id
        );
    }

    #[test]
    fn plan_acceptance_supersedes() {
        let db = db();
        db.create_project("p", "P", "p").unwrap();
        let v1 = db.create_task_plan("p", 1, Some("v1"), "ai").unwrap();
        db.accept_plan(v1.id).unwrap();
        let v2 = db.create_task_plan("p", 2, Some("v2"), "ai").unwrap();
        db.accept_plan(v2.id).unwrap();

        let plans = db.list_plans("p").unwrap();
        assert_eq!(plans[0].status, "superseded");
        assert_eq!(plans[1].status, "accepted");
        let project = db.get_project("p").unwrap().unwrap();
        assert_eq!(project.active_plan_id, Some(v2.id));
        assert_eq!(project.status, "active");
    }

    #[test]
    fn chat_history_deduplicates_by_msg_id() {
        let db = db();
        db.create_project("p", "P", "p").unwrap();
        db.add_chat_message("p", None, "user", "hello", "m-1").unwrap();
        db.add_chat_message("p", None, "user", "hello", "m-1").unwrap();
        db.add_chat_message("p", None, "agent", "hi", "m-2").unwrap();
        let msgs = db.list_chat_messages("p", 50, None).unwrap();
        assert_eq!(msgs.len(), 2);
    }

    #[test]
    fn timeline_event_lifecycle() {
        let db = db();
        db.create_project("p", "P", "p").unwrap();
        let id = db
            .add_timeline_event("p", 0, "blender.export_fbx", "{}", "running", None, Some("c-1"), &now_ts(), None)
            .unwrap();
        db.finish_timeline_event(id, "success", "{\"ok\":true}")
            .unwrap();
        let ev = db.get_timeline_event(id).unwrap().unwrap();
        assert_eq!(ev.status, "success");
        assert!(ev.finished_at.is_some());
        assert!(ev.finished_at.as_deref().unwrap() >= ev.started_at.as_str());
    }
}
