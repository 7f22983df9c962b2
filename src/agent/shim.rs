//! Tool-call shim: validates tool requests from the agent stream against
//! the catalog, enforces the per-turn budget, executes via the MCP client
//! and feeds a `tool_result` line back into the agent's stdin. A broken
//! tool event never takes the session down.

use super::catalog::ToolCatalog;
use super::{write_stdin_line, StdinWriter};
use crate::config::ConfigStore;
use crate::db::Db;
use crate::mcp::McpClient;
use crate::timeline;
use crate::ws::Broker;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, warn};
use uuid::Uuid;

const RESULT_QUEUE_CAPACITY: usize = 64;

#[derive(Default)]
struct TurnState {
    id: Option<String>,
    calls: u32,
}

pub struct ToolShim {
    db: Arc<Db>,
    broker: Arc<Broker>,
    mcp: Arc<McpClient>,
    catalog: &'static ToolCatalog,
    config: Arc<ConfigStore>,
    turn: Mutex<TurnState>,
    results: Mutex<VecDeque<Value>>,
}

impl ToolShim {
    pub fn new(
        db: Arc<Db>,
        broker: Arc<Broker>,
        mcp: Arc<McpClient>,
        config: Arc<ConfigStore>,
    ) -> Self {
        Self {
            db,
            broker,
            mcp,
            catalog: ToolCatalog::builtin(),
            config,
            turn: Mutex::new(TurnState::default()),
            results: Mutex::new(VecDeque::new()),
        }
    }

    pub fn catalog(&self) -> &'static ToolCatalog {
        self.catalog
    }

    /// Starts a fresh turn; called when a user message is sent.
    pub fn begin_turn(&self) -> String {
        let id = Uuid::new_v4().simple().to_string();
        let mut turn = self.turn.lock().unwrap_or_else(|e| e.into_inner());
        turn.id = Some(id.clone());
        turn.calls = 0;
        id
    }

    fn limits(&self) -> (u32, Duration) {
        let shim = self.config.get_all(false).agents.tool_shim;
        (
            shim.max_calls_per_turn.max(1),
            Duration::from_secs_f64(shim.tool_timeout_seconds.max(1.0)),
        )
    }

    /// Handles one `tool_call` event from the provider stream.
    pub async fn handle_tool_call(
        &self,
        stdin: &StdinWriter,
        project_id: &str,
        payload: &Value,
        correlation_id: Option<&str>,
    ) {
        let request_id = Uuid::new_v4().simple().to_string()[..8].to_string();
        let name = payload
            .get("name")
            .and_then(Value::as_str)
            .unwrap_or("")
            .trim()
            .to_string();
        let args = payload.get("args").cloned().unwrap_or(json!({}));

        let (max_calls, tool_timeout) = self.limits();

        self.record_started(project_id, &name, &args, &request_id, correlation_id)
            .await;

        // Per-turn budget; exceeding stops the tool before validation.
        let exceeded = {
            let mut turn = self.turn.lock().unwrap_or_else(|e| e.into_inner());
            if turn.id.is_none() {
                turn.id = Some(Uuid::new_v4().simple().to_string());
                turn.calls = 0;
            }
            turn.calls >= max_calls
        };
        if exceeded {
            let error = format!("maxCallsPerTurn exceeded ({max_calls})");
            self.inject(stdin, json!({"ok": false, "error": error}), correlation_id)
                .await;
            self.record_finished(
                project_id,
                &name,
                false,
                None,
                Some(&error),
                0,
                &request_id,
                correlation_id,
            )
            .await;
            return;
        }

        // Catalog validation; violations and unknown tools count as attempts.
        if let Err(verror) = self.catalog.validate_args(&name, &args) {
            self.inject(
                stdin,
                json!({"name": name, "ok": false, "error": verror}),
                correlation_id,
            )
            .await;
            self.record_finished(
                project_id,
                &name,
                false,
                None,
                Some(&verror),
                0,
                &request_id,
                correlation_id,
            )
            .await;
            self.count_attempt();
            return;
        }

        let started = Instant::now();
        let outcome = if name == "ping" {
            // Deterministic local answer; no adapter round trip.
            Ok(json!({"mcp_ping": "pong"}))
        } else {
            match tokio::time::timeout(
                tool_timeout,
                self.mcp.run_tool(&name, &args, correlation_id),
            )
            .await
            {
                Ok(result) => result.map_err(|e| e.to_string()),
                Err(_) => Err("timeout".to_string()),
            }
        };
        let duration_ms = started.elapsed().as_millis() as i64;

        match outcome {
            Ok(result) => {
                self.inject(
                    stdin,
                    json!({"name": name, "ok": true, "result": result}),
                    correlation_id,
                )
                .await;
                self.record_finished(
                    project_id,
                    &name,
                    true,
                    Some(&result),
                    None,
                    duration_ms,
                    &request_id,
                    correlation_id,
                )
                .await;
            }
            Err(error) => {
                self.inject(
                    stdin,
                    json!({"name": name, "ok": false, "error": error}),
                    correlation_id,
                )
                .await;
                self.record_finished(
                    project_id,
                    &name,
                    false,
                    None,
                    Some(&error),
                    duration_ms,
                    &request_id,
                    correlation_id,
                )
                .await;
            }
        }
        self.count_attempt();
    }

    fn count_attempt(&self) {
        let mut turn = self.turn.lock().unwrap_or_else(|e| e.into_inner());
        turn.calls += 1;
    }

    async fn record_started(
        &self,
        project_id: &str,
        name: &str,
        args: &Value,
        request_id: &str,
        correlation_id: Option<&str>,
    ) {
        let payload = json!({"name": name, "args": args, "requestId": request_id});
        if let Err(e) = timeline::record_event(
            &self.db,
            &self.broker,
            project_id,
            "tool_call.started",
            payload,
            Vec::new(),
            correlation_id,
        )
        .await
        {
            warn!("failed to record tool_call.started: {e}");
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn record_finished(
        &self,
        project_id: &str,
        name: &str,
        ok: bool,
        result: Option<&Value>,
        error: Option<&str>,
        duration_ms: i64,
        request_id: &str,
        correlation_id: Option<&str>,
    ) {
        let payload = json!({
            "name": name,
            "ok": ok,
            "durationMs": duration_ms,
            "requestId": request_id,
            "result": result,
            "error": error,
        });
        if let Err(e) = timeline::record_event(
            &self.db,
            &self.broker,
            project_id,
            "tool_call.finished",
            payload,
            Vec::new(),
            correlation_id,
        )
        .await
        {
            warn!("failed to record tool_call.finished: {e}");
        }
    }

    /// Writes the result line into the agent stdin and mirrors it on the
    /// in-process queue for awaiters. Injection failures are logged only;
    /// the agent keeps running.
    async fn inject(&self, stdin: &StdinWriter, data: Value, correlation_id: Option<&str>) {
        let line = json!({"tool_result": data.clone()}).to_string();
        if let Err(e) = write_stdin_line(stdin, &line).await {
            debug!("tool_result injection skipped: {e}");
        }
        let turn_id = self
            .turn
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .id
            .clone();
        let mut entry = data;
        if let Some(obj) = entry.as_object_mut() {
            obj.insert(
                "correlationId".to_string(),
                correlation_id.map(|c| json!(c)).unwrap_or(Value::Null),
            );
            obj.insert(
                "turnId".to_string(),
                turn_id.map(|t| json!(t)).unwrap_or(Value::Null),
            );
        }
        let mut results = self.results.lock().unwrap_or_else(|e| e.into_inner());
        if results.len() >= RESULT_QUEUE_CAPACITY {
            warn!("tool result queue full, dropping oldest entry");
            results.pop_front();
        }
        results.push_back(entry);
    }

    /// Awaits a matching tool result for self-tests and synchronous
    /// callers; polls the bounded queue until the deadline.
    pub async fn wait_tool_result(
        &self,
        name: &str,
        correlation_id: Option<&str>,
        timeout: Duration,
    ) -> Option<Value> {
        let deadline = Instant::now() + timeout;
        loop {
            {
                let mut results = self.results.lock().unwrap_or_else(|e| e.into_inner());
                if let Some(pos) = results.iter().position(|r| {
                    r.get("name").and_then(Value::as_str) == Some(name)
                        && (correlation_id.is_none()
                            || r.get("correlationId").and_then(Value::as_str) == correlation_id)
                }) {
                    return results.remove(pos);
                }
            }
            if Instant::now() >= deadline {
                return None;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }

    #[cfg(test)]
    pub fn drain_results(&self) -> Vec<Value> {
        let mut results = self.results.lock().unwrap_or_else(|e| e.into_inner());
        results.drain(..).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::new_stdin_writer;
    use serde_json::json;

    fn shim_fixture(max_calls: u32) -> (ToolShim, Arc<Db>) {
        let dir = tempfile::tempdir().unwrap();
        let config = Arc::new(
            ConfigStore::open(dir.path().join("settings.toml")).unwrap(),
        );
        config
            .update(json!({
                "projects": {"root": dir.path().join("projects").to_string_lossy()},
                "agents": {"toolShim": {"maxCallsPerTurn": max_calls}}
            }))
            .unwrap();
        let db = Arc::new(Db::open_in_memory().unwrap());
        db.create_project("p", "P", "p").unwrap();
        let broker = Arc::new(Broker::new());
        let mcp = Arc::new(McpClient::new("http://127.0.0.1:1", config.clone()));
        (ToolShim::new(db.clone(), broker, mcp, config), db)
    }

    #[tokio::test]
    async fn turn_budget_is_enforced() {
        let (shim, db) = shim_fixture(2);
        let stdin = new_stdin_writer();
        shim.begin_turn();

        for _ in 0..3 {
            shim.handle_tool_call(&stdin, "p", &json!({"name": "ping", "args": {}}), Some("c-1"))
                .await;
        }

        let results = shim.drain_results();
        assert_eq!(results.len(), 3);
        assert_eq!(results[0]["ok"], true);
        assert_eq!(results[1]["ok"], true);
        assert_eq!(results[2]["ok"], false);
        assert_eq!(results[2]["error"], "maxCallsPerTurn exceeded (2)");

        let events = db.list_timeline_events("p", 50).unwrap();
        let started = events
            .iter()
            .filter(|e| e.tool == "event:tool_call.started")
            .count();
        let finished: Vec<_> = events
            .iter()
            .filter(|e| e.tool == "event:tool_call.finished")
            .collect();
        assert_eq!(started, 3);
        assert_eq!(finished.len(), 3);
        let errored = finished
            .iter()
            .filter(|e| {
                e.result_json
                    .as_deref()
                    .map(|r| r.contains("maxCallsPerTurn"))
                    .unwrap_or(false)
            })
            .count();
        assert_eq!(errored, 1);
    }

    #[tokio::test]
    async fn new_turn_resets_the_budget() {
        let (shim, _db) = shim_fixture(1);
        let stdin = new_stdin_writer();
        shim.begin_turn();
        shim.handle_tool_call(&stdin, "p", &json!({"name": "ping", "args": {}}), None)
            .await;
        shim.handle_tool_call(&stdin, "p", &json!({"name": "ping", "args": {}}), None)
            .await;
        let first = shim.drain_results();
        assert_eq!(first[1]["ok"], false);

        shim.begin_turn();
        shim.handle_tool_call(&stdin, "p", &json!({"name": "ping", "args": {}}), None)
            .await;
        let second = shim.drain_results();
        assert_eq!(second[0]["ok"], true);
    }

    #[tokio::test]
    async fn unknown_tool_counts_as_attempt() {
        let (shim, _db) = shim_fixture(2);
        let stdin = new_stdin_writer();
        shim.begin_turn();
        shim.handle_tool_call(&stdin, "p", &json!({"name": "bogus", "args": {}}), None)
            .await;
        let results = shim.drain_results();
        assert_eq!(results[0]["ok"], false);
        assert_eq!(results[0]["error"], "unknown tool");

        // One attempt burned: only one budgeted call remains.
        shim.handle_tool_call(&stdin, "p", &json!({"name": "ping", "args": {}}), None)
            .await;
        shim.handle_tool_call(&stdin, "p", &json!({"name": "ping", "args": {}}), None)
            .await;
        let rest = shim.drain_results();
        assert_eq!(rest[0]["ok"], true);
        assert_eq!(rest[1]["ok"], false);
    }

    #[tokio::test]
    async fn schema_violation_reported_to_agent() {
        let (shim, _db) = shim_fixture(4);
        let stdin = new_stdin_writer();
        shim.begin_turn();
        shim.handle_tool_call(
            &stdin,
            "p",
            &json!({"name": "blender.export_fbx", "args": {}}),
            None,
        )
        .await;
        let results = shim.drain_results();
        assert_eq!(results[0]["ok"], false);
        assert!(results[0]["error"]
            .as_str()
            .unwrap()
            .contains("missing required arg"));
    }

    #[tokio::test]
    async fn malformed_payload_does_not_crash() {
        let (shim, _db) = shim_fixture(4);
        let stdin = new_stdin_writer();
        shim.begin_turn();
        shim.handle_tool_call(&stdin, "p", &json!("not an object"), None)
            .await;
        let results = shim.drain_results();
        assert_eq!(results[0]["ok"], false);
    }

    #[tokio::test]
    async fn wait_tool_result_matches_by_name_and_correlation() {
        let (shim, _db) = shim_fixture(4);
        let stdin = new_stdin_writer();
        shim.begin_turn();
        shim.handle_tool_call(&stdin, "p", &json!({"name": "ping", "args": {}}), Some("c-7"))
            .await;
        let found = shim
            .wait_tool_result("ping", Some("c-7"), Duration::from_millis(200))
            .await;
        assert!(found.is_some());
        let missing = shim
            .wait_tool_result("ping", Some("other"), Duration::from_millis(50))
            .await;
        assert!(missing.is_none());
    }
}
