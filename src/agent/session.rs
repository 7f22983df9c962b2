//! Per-project agent session. Owns one AI CLI subprocess: serialized
//! stdin, two line readers feeding the provider adapter, chat persistence
//! and broadcast, and a one-shot ask path with a hashed context prefix.

use super::provider::{is_benign_stderr, ProviderAdapter, ProviderEvent};
use super::shim::ToolShim;
use super::{new_stdin_writer, write_stdin_line, StdinWriter};
use crate::config::ConfigStore;
use crate::db::Db;
use crate::errors::{GatewayError, GatewayResult};
use crate::supervisor::Supervisor;
use crate::ws::{Broker, Envelope, EventType};
use serde::Serialize;
use serde_json::json;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

const BRIDGE_PROBE_TIMEOUT: Duration = Duration::from_millis(1500);
const ONE_SHOT_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    Idle,
    Starting,
    Running,
    Stopping,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatus {
    pub running: bool,
    pub pid: Option<u32>,
    pub cwd: Option<String>,
    pub provider: Option<String>,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SendAck {
    pub queued: bool,
    pub msg_id: String,
}

struct Inner {
    state: SessionState,
    child: Option<Child>,
    pid: Option<u32>,
    cwd: Option<PathBuf>,
    project_id: Option<String>,
    provider: Option<String>,
    session_row: Option<i64>,
    last_error: Option<String>,
    readers: Vec<JoinHandle<()>>,
}

struct CachedPrompt {
    project_id: String,
    input_hash: u64,
    prefix: String,
}

/// Shared context handed to the reader tasks.
#[derive(Clone)]
struct ReaderCtx {
    db: Arc<Db>,
    broker: Arc<Broker>,
    shim: Arc<ToolShim>,
    stdin: StdinWriter,
    adapter: Arc<dyn ProviderAdapter>,
    project_id: String,
    session_row: Option<i64>,
    last_correlation: Arc<StdMutex<Option<String>>>,
}

pub struct AgentSession {
    inner: Mutex<Inner>,
    stdin: StdinWriter,
    last_correlation: Arc<StdMutex<Option<String>>>,
    db: Arc<Db>,
    broker: Arc<Broker>,
    config: Arc<ConfigStore>,
    supervisor: Arc<Supervisor>,
    shim: Arc<ToolShim>,
    adapter: Arc<dyn ProviderAdapter>,
    prompt_cache: StdMutex<Option<CachedPrompt>>,
}

impl AgentSession {
    pub fn new(
        db: Arc<Db>,
        broker: Arc<Broker>,
        config: Arc<ConfigStore>,
        supervisor: Arc<Supervisor>,
        shim: Arc<ToolShim>,
        adapter: Arc<dyn ProviderAdapter>,
    ) -> Self {
        Self {
            inner: Mutex::new(Inner {
                state: SessionState::Idle,
                child: None,
                pid: None,
                cwd: None,
                project_id: None,
                provider: None,
                session_row: None,
                last_error: None,
                readers: Vec::new(),
            }),
            stdin: new_stdin_writer(),
            last_correlation: Arc::new(StdMutex::new(None)),
            db,
            broker,
            config,
            supervisor,
            shim,
            adapter,
            prompt_cache: StdMutex::new(None),
        }
    }

    pub fn shim(&self) -> Arc<ToolShim> {
        self.shim.clone()
    }

    /// Starts the CLI for the given project. Idempotent while running.
    pub async fn start(&self, project_id: &str, provider: &str) -> GatewayResult<SessionStatus> {
        let mut inner = self.inner.lock().await;
        if inner.state == SessionState::Running {
            return Ok(Self::snapshot(&mut inner));
        }
        inner.state = SessionState::Starting;

        let settings = self.config.get_all(false);
        let cwd = Path::new(&settings.projects.root).join(project_id);
        if !cwd.is_dir() {
            inner.state = SessionState::Idle;
            return Err(GatewayError::NotFound(format!(
                "project directory {}",
                cwd.display()
            )));
        }

        // Preconditions: a live adapter, or at least a bridge handshake.
        let mut precondition_error: Option<String> = None;
        match self.supervisor.ensure_mcp_adapter().await {
            Ok(status) if status.running => {}
            other => {
                let adapter_err = match other {
                    Ok(_) => "adapter lock not held".to_string(),
                    Err(e) => e.to_string(),
                };
                match probe_bridge_handshake(settings.bridges.unity_bridge_port).await {
                    Ok(()) => {
                        warn!("adapter not detected but bridge handshake succeeded; continuing");
                    }
                    Err(probe_err) => {
                        precondition_error = Some(format!(
                            "MCP adapter not ready ({adapter_err}) and bridge probe failed: {probe_err}"
                        ));
                    }
                }
            }
        }
        if let Some(msg) = precondition_error {
            inner.last_error = Some(msg.clone());
            if !settings.agents.mcp.proceed_without_bridges {
                inner.state = SessionState::Idle;
                return Err(GatewayError::BridgesNotReady(msg));
            }
            warn!("starting session despite failed preconditions: {msg}");
        }

        let command = build_provider_command(&settings.providers.gemini_cli.command)?;
        info!(
            "starting agent CLI {:?} (cwd={}) for project {project_id}",
            command,
            cwd.display()
        );
        let mut cmd = Command::new(&command[0]);
        cmd.args(&command[1..])
            .current_dir(&cwd)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        let mut child = cmd.spawn().map_err(|e| {
            GatewayError::Internal(format!("failed to start agent CLI {:?}: {e}", command[0]))
        })?;

        *self.stdin.lock().await = child.stdin.take();
        let session_row = match self.db.create_session(project_id, provider) {
            Ok(row) => Some(row.id),
            Err(e) => {
                warn!("failed to persist session row: {e}");
                None
            }
        };

        let ctx = ReaderCtx {
            db: self.db.clone(),
            broker: self.broker.clone(),
            shim: self.shim.clone(),
            stdin: self.stdin.clone(),
            adapter: self.adapter.clone(),
            project_id: project_id.to_string(),
            session_row,
            last_correlation: self.last_correlation.clone(),
        };
        let mut readers = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            readers.push(spawn_line_reader(stdout, ctx.clone(), StreamTag::Stdout));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(spawn_line_reader(stderr, ctx, StreamTag::Stderr));
        }

        inner.pid = child.id();
        inner.child = Some(child);
        inner.cwd = Some(cwd);
        inner.project_id = Some(project_id.to_string());
        inner.provider = Some(provider.to_string());
        inner.session_row = session_row;
        inner.readers = readers;
        inner.state = SessionState::Running;
        Ok(Self::snapshot(&mut inner))
    }

    /// Stops the CLI: cancel readers, close stdin, terminate then kill.
    pub async fn stop(&self) -> GatewayResult<SessionStatus> {
        let mut inner = self.inner.lock().await;
        if inner.state == SessionState::Idle {
            return Ok(Self::snapshot(&mut inner));
        }
        inner.state = SessionState::Stopping;

        for reader in inner.readers.drain(..) {
            reader.abort();
        }
        // Dropping the writer closes the pipe and unblocks the child.
        self.stdin.lock().await.take();

        if let Some(mut child) = inner.child.take() {
            let grace = Duration::from_secs_f64(
                self.config.get_all(false).timeouts.terminate_grace.max(0.5),
            );
            terminate_child(&child);
            if tokio::time::timeout(grace, child.wait()).await.is_err() {
                warn!("terminate timed out; killing agent CLI pid={:?}", inner.pid);
                let _ = child.start_kill();
                let _ = tokio::time::timeout(Duration::from_secs(2), child.wait()).await;
            }
        }
        if let Some(session_id) = inner.session_row.take() {
            if let Err(e) = self.db.end_session(session_id) {
                warn!("failed to close session row: {e}");
            }
        }
        self.supervisor.stop_adapter_if_owned().await;

        inner.pid = None;
        inner.provider = None;
        inner.state = SessionState::Idle;
        Ok(Self::snapshot(&mut inner))
    }

    /// Queues one line of user text to the CLI. The write is serialized by
    /// the stdin mutex; persistence and broadcast happen before returning.
    pub async fn send(&self, text: &str, correlation_id: Option<&str>) -> GatewayResult<SendAck> {
        let (project_id, session_row) = {
            let mut inner = self.inner.lock().await;
            if inner.state != SessionState::Running || !Self::child_alive(&mut inner) {
                return Err(GatewayError::NotRunning);
            }
            (
                inner.project_id.clone().unwrap_or_default(),
                inner.session_row,
            )
        };

        *self
            .last_correlation
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = correlation_id.map(str::to_string);
        self.shim.begin_turn();

        let prepared = self.adapter.prepare_input(text);
        write_stdin_line(&self.stdin, &prepared).await?;
        debug!("[{}] >> {}", correlation_id.unwrap_or("-"), mask_secrets(text));

        let msg_id = Uuid::new_v4().to_string();
        if let Err(e) = self
            .db
            .add_chat_message(&project_id, None, "user", text, &msg_id)
        {
            warn!("failed to persist user chat message: {e}");
        }
        if let Some(session_id) = session_row {
            if let Err(e) = self
                .db
                .add_agent_message(session_id, "user", text, None, None, None)
            {
                warn!("failed to persist user agent message: {e}");
            }
        }
        let envelope = Envelope::new(
            EventType::Chat,
            Some(project_id.clone()),
            json!({"role": "user", "content": text, "msgId": msg_id}),
            correlation_id.map(str::to_string),
        );
        self.broker.broadcast_project(&project_id, &envelope).await;

        Ok(SendAck {
            queued: true,
            msg_id,
        })
    }

    pub async fn status(&self) -> SessionStatus {
        let mut inner = self.inner.lock().await;
        Self::snapshot(&mut inner)
    }

    fn child_alive(inner: &mut Inner) -> bool {
        match inner.child.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    fn snapshot(inner: &mut Inner) -> SessionStatus {
        let running = inner.state == SessionState::Running && Self::child_alive(inner);
        SessionStatus {
            running,
            pid: if running { inner.pid } else { None },
            cwd: inner.cwd.as_ref().map(|p| p.display().to_string()),
            provider: inner.provider.clone(),
            last_error: inner.last_error.clone(),
        }
    }

    /// Single-turn invocation: run the CLI once with an enriched prompt
    /// and capture stdout. Returns (answer, error); both may be present,
    /// in which case the error is a warning.
    pub async fn ask_one_shot(
        &self,
        session_key: &str,
        prompt: &str,
    ) -> (Option<String>, Option<String>) {
        let settings = self.config.get_all(false);
        let prefix = self.context_prefix(session_key);
        let full_prompt = if prefix.is_empty() {
            prompt.to_string()
        } else {
            format!("{prefix}\n\n{prompt}")
        };

        let work_dir = Path::new(&settings.projects.root).join(session_key);
        if let Err(e) = std::fs::create_dir_all(&work_dir) {
            return (None, Some(format!("cannot create work dir: {e}")));
        }
        let command = match build_provider_command(&settings.providers.gemini_cli.command) {
            Ok(c) => c,
            Err(e) => return (None, Some(e.to_string())),
        };

        let mut cmd = Command::new(&command[0]);
        cmd.args(&command[1..])
            .current_dir(&work_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        let mut child = match cmd.spawn() {
            Ok(c) => c,
            Err(e) => return (None, Some(format!("failed to start provider: {e}"))),
        };
        if let Some(mut stdin) = child.stdin.take() {
            let payload = format!("{full_prompt}\n");
            if let Err(e) = stdin.write_all(payload.as_bytes()).await {
                return (None, Some(format!("failed to write prompt: {e}")));
            }
            // Closing stdin lets one-shot CLIs run to completion.
            drop(stdin);
        }
        match tokio::time::timeout(ONE_SHOT_TIMEOUT, child.wait_with_output()).await {
            Ok(Ok(output)) => {
                let answer = String::from_utf8_lossy(&output.stdout).trim().to_string();
                let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
                let error = if stderr.is_empty() { None } else { Some(stderr) };
                if answer.is_empty() {
                    (None, error.or_else(|| Some("empty answer".to_string())))
                } else {
                    (Some(answer), error)
                }
            }
            Ok(Err(e)) => (None, Some(format!("provider failed: {e}"))),
            Err(_) => (None, Some("one-shot timed out".to_string())),
        }
    }

    /// Builds the prompt prefix from the active global context, the
    /// current task and its task-scoped context. Cached per project by a
    /// hash of those inputs.
    fn context_prefix(&self, project_id: &str) -> String {
        let global = self
            .db
            .get_active_context(project_id, "global", None)
            .ok()
            .flatten()
            .map(|c| c.content)
            .unwrap_or_default();
        let task = self
            .db
            .get_project(project_id)
            .ok()
            .flatten()
            .and_then(|p| p.current_task_id)
            .and_then(|tid| self.db.get_task(tid).ok().flatten());
        let task_meta = task
            .as_ref()
            .map(|t| format!("{} {} [{}]", t.code, t.title, t.status))
            .unwrap_or_default();
        let task_context = task
            .as_ref()
            .and_then(|t| {
                self.db
                    .get_active_context(project_id, "task", Some(t.id))
                    .ok()
                    .flatten()
            })
            .map(|c| c.content)
            .unwrap_or_default();

        let mut hasher = DefaultHasher::new();
        global.hash(&mut hasher);
        task_meta.hash(&mut hasher);
        task_context.hash(&mut hasher);
        let input_hash = hasher.finish();

        {
            let cache = self.prompt_cache.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(cached) = cache.as_ref() {
                if cached.project_id == project_id && cached.input_hash == input_hash {
                    return cached.prefix.clone();
                }
            }
        }

        let mut sections = Vec::new();
        if !global.is_empty() {
            sections.push(format!("PROJECT CONTEXT:\n{global}"));
        }
        if !task_meta.is_empty() {
            sections.push(format!("CURRENT TASK: {task_meta}"));
        }
        if !task_context.is_empty() {
            sections.push(format!("TASK CONTEXT:\n{task_context}"));
        }
        let prefix = sections.join("\n\n");

        *self.prompt_cache.lock().unwrap_or_else(|e| e.into_inner()) = Some(CachedPrompt {
            project_id: project_id.to_string(),
            input_hash,
            prefix: prefix.clone(),
        });
        prefix
    }
}

#[derive(Clone, Copy)]
enum StreamTag {
    Stdout,
    Stderr,
}

fn spawn_line_reader<R>(stream: R, ctx: ReaderCtx, tag: StreamTag) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(stream);
        let mut raw = Vec::new();
        loop {
            raw.clear();
            match reader.read_until(b'\n', &mut raw).await {
                Ok(0) => break,
                Ok(_) => {
                    let line = String::from_utf8_lossy(&raw)
                        .trim_end_matches(['\r', '\n'])
                        .to_string();
                    if line.is_empty() {
                        continue;
                    }
                    match tag {
                        StreamTag::Stdout => handle_stdout_line(&ctx, &line).await,
                        StreamTag::Stderr => handle_stderr_line(&ctx, &line).await,
                    }
                }
                Err(e) => {
                    debug!("agent reader error: {e}");
                    break;
                }
            }
        }
    })
}

async fn handle_stdout_line(ctx: &ReaderCtx, line: &str) {
    let correlation = ctx
        .last_correlation
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .clone();
    for event in ctx.adapter.parse_line(line) {
        match event {
            ProviderEvent::ToolCall { name, args } => {
                if let Some(session_id) = ctx.session_row {
                    let _ = ctx.db.add_agent_message(
                        session_id,
                        "tool",
                        "",
                        Some(&name),
                        Some(&args.to_string()),
                        None,
                    );
                }
                let payload = json!({"name": name, "args": args});
                ctx.shim
                    .handle_tool_call(&ctx.stdin, &ctx.project_id, &payload, correlation.as_deref())
                    .await;
            }
            ProviderEvent::Token { content } => {
                if content.is_empty() {
                    continue;
                }
                emit_agent_chat(ctx, &content, correlation.as_deref()).await;
            }
            ProviderEvent::Final { content } => {
                if let Some(content) = content {
                    if !content.is_empty() {
                        emit_agent_chat(ctx, &content, correlation.as_deref()).await;
                    }
                }
            }
            ProviderEvent::Error { message } => {
                broadcast_log(ctx, &message, correlation.as_deref()).await;
            }
        }
    }
}

async fn handle_stderr_line(ctx: &ReaderCtx, line: &str) {
    if is_benign_stderr(line) {
        debug!("agent stderr (benign): {line}");
        return;
    }
    broadcast_log(ctx, line, None).await;
}

async fn emit_agent_chat(ctx: &ReaderCtx, content: &str, correlation: Option<&str>) {
    let msg_id = Uuid::new_v4().to_string();
    if let Err(e) = ctx
        .db
        .add_chat_message(&ctx.project_id, None, "agent", content, &msg_id)
    {
        warn!("failed to persist agent chat message: {e}");
    }
    if let Some(session_id) = ctx.session_row {
        let _ = ctx
            .db
            .add_agent_message(session_id, "assistant", content, None, None, None);
    }
    let envelope = Envelope::new(
        EventType::Chat,
        Some(ctx.project_id.clone()),
        json!({"role": "agent", "content": content, "msgId": msg_id}),
        correlation.map(str::to_string),
    );
    ctx.broker.broadcast_project(&ctx.project_id, &envelope).await;
}

async fn broadcast_log(ctx: &ReaderCtx, message: &str, correlation: Option<&str>) {
    let envelope = Envelope::new(
        EventType::Log,
        Some(ctx.project_id.clone()),
        json!({"level": "error", "message": message}),
        correlation.map(str::to_string),
    );
    ctx.broker.broadcast_project(&ctx.project_id, &envelope).await;
}

#[cfg(unix)]
fn terminate_child(child: &Child) {
    if let Some(pid) = child.id() {
        let _ = std::process::Command::new("kill")
            .args(["-TERM", &pid.to_string()])
            .output();
    }
}

#[cfg(not(unix))]
fn terminate_child(_child: &Child) {}

/// Splits the configured launch command and applies platform wrapping for
/// script interpreters on Windows.
fn build_provider_command(configured: &str) -> GatewayResult<Vec<String>> {
    let parts: Vec<String> = configured
        .split_whitespace()
        .map(str::to_string)
        .collect();
    if parts.is_empty() {
        return Err(GatewayError::ConfigInvalid(vec![
            crate::errors::ConfigIssue::new(
                "providers.geminiCli.command",
                "agent CLI command not configured",
            ),
        ]));
    }
    Ok(wrap_for_platform(parts))
}

#[cfg(windows)]
fn wrap_for_platform(command: Vec<String>) -> Vec<String> {
    let lower = command[0].to_ascii_lowercase();
    if lower.ends_with(".cmd") || lower.ends_with(".bat") {
        let mut wrapped = vec!["cmd.exe".to_string(), "/c".to_string()];
        wrapped.extend(command);
        wrapped
    } else if lower.ends_with(".ps1") {
        let mut wrapped = vec![
            "powershell.exe".to_string(),
            "-NoProfile".to_string(),
            "-ExecutionPolicy".to_string(),
            "Bypass".to_string(),
            "-File".to_string(),
        ];
        wrapped.extend(command);
        wrapped
    } else {
        command
    }
}

#[cfg(not(windows))]
fn wrap_for_platform(command: Vec<String>) -> Vec<String> {
    command
}

/// Redacts api keys and tokens before a line reaches the logs.
fn mask_secrets(s: &str) -> String {
    static PATTERN: std::sync::OnceLock<regex::Regex> = std::sync::OnceLock::new();
    let re = PATTERN.get_or_init(|| {
        regex::Regex::new(r"(?i)(api[-_ ]?key|token|secret)\s*[:=]\s*\S+")
            .unwrap_or_else(|_| regex::Regex::new("$^").unwrap())
    });
    let redacted = re.replace_all(s, "$1=[REDACTED]").to_string();
    if redacted.len() > 120 {
        let mut end = 120;
        while !redacted.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}…", &redacted[..end])
    } else {
        redacted
    }
}

/// Minimal WebSocket handshake against the unity bridge, used as a health
/// probe when the adapter lockfile is not trustworthy.
async fn probe_bridge_handshake(port: u16) -> Result<(), String> {
    let url = format!("ws://127.0.0.1:{port}/ws/agent_adapter");
    match tokio::time::timeout(BRIDGE_PROBE_TIMEOUT, tokio_tungstenite::connect_async(url)).await {
        Ok(Ok((mut ws, _))) => {
            use futures_util::SinkExt;
            let _ = ws
                .send(tokio_tungstenite::tungstenite::Message::Text("{}".into()))
                .await;
            let _ = ws.close(None).await;
            Ok(())
        }
        Ok(Err(e)) => Err(e.to_string()),
        Err(_) => Err("handshake timed out".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::JsonLinesAdapter;
    use crate::supervisor::AdapterLock;
    use serde_json::json;

    struct Fixture {
        session: AgentSession,
        db: Arc<Db>,
        config: Arc<ConfigStore>,
        _dir: tempfile::TempDir,
    }

    fn fixture(provider_command: &str) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let projects_root = dir.path().join("projects");
        std::fs::create_dir_all(projects_root.join("demo")).unwrap();

        let config = Arc::new(ConfigStore::open(dir.path().join("settings.toml")).unwrap());
        config
            .update(json!({
                "projects": {"root": projects_root.to_string_lossy()},
                "providers": {"geminiCli": {"command": provider_command}},
            }))
            .unwrap();

        let db = Arc::new(Db::open_in_memory().unwrap());
        db.create_project("demo", "Demo", "demo").unwrap();
        let broker = Arc::new(Broker::new());
        let supervisor = Arc::new(Supervisor::new(
            config.clone(),
            AdapterLock::new(dir.path().join("adapter.lock")),
        ));
        let mcp = Arc::new(crate::mcp::McpClient::new("http://127.0.0.1:1", config.clone()));
        let shim = Arc::new(ToolShim::new(
            db.clone(),
            broker.clone(),
            mcp,
            config.clone(),
        ));
        let session = AgentSession::new(
            db.clone(),
            broker,
            config.clone(),
            supervisor,
            shim,
            Arc::new(JsonLinesAdapter),
        );
        Fixture {
            session,
            db,
            config,
            _dir: dir,
        }
    }

    #[tokio::test]
    async fn send_without_start_fails() {
        let fx = fixture("cat");
        let err = fx.session.send("hello", None).await.unwrap_err();
        assert!(matches!(err, GatewayError::NotRunning));
    }

    #[tokio::test]
    async fn start_send_echo_stop() {
        let fx = fixture("cat");
        let status = fx.session.start("demo", "gemini_cli").await.unwrap();
        assert!(status.running);
        assert!(status.pid.is_some());
        // Bridge preconditions failed but the session proceeded.
        assert!(status.last_error.is_some());

        let ack = fx.session.send("hello agent", Some("c-1")).await.unwrap();
        assert!(ack.queued);

        // `cat` echoes stdin; the reader should persist the echo as an
        // agent chat message.
        let mut echoed = false;
        for _ in 0..50 {
            let msgs = fx.db.list_chat_messages("demo", 50, None).unwrap();
            if msgs
                .iter()
                .any(|m| m.role == "agent" && m.content == "hello agent")
            {
                echoed = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(echoed, "agent echo was not persisted");

        // User message persisted in both stores.
        let msgs = fx.db.list_chat_messages("demo", 50, None).unwrap();
        assert!(msgs.iter().any(|m| m.role == "user"));
        let sessions = fx.db.list_sessions("demo", 5).unwrap();
        assert_eq!(sessions.len(), 1);
        assert!(fx.db.list_agent_messages(sessions[0].id, 10).unwrap().len() >= 2);

        let stopped = fx.session.stop().await.unwrap();
        assert!(!stopped.running);
        let sessions = fx.db.list_sessions("demo", 5).unwrap();
        assert!(sessions[0].ended_at.is_some());
    }

    #[tokio::test]
    async fn start_unknown_project_fails() {
        let fx = fixture("cat");
        let err = fx.session.start("ghost", "gemini_cli").await.unwrap_err();
        assert!(matches!(err, GatewayError::NotFound(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn tool_call_lines_reach_the_shim() {
        use std::os::unix::fs::PermissionsExt;
        let fx = fixture("placeholder");
        // Script emits one tool_call then idles so the pipe stays open.
        let script = fx._dir.path().join("fake-agent.sh");
        std::fs::write(
            &script,
            "#!/bin/sh\necho '{\"tool_call\":{\"name\":\"ping\",\"args\":{}}}'\nsleep 30\n",
        )
        .unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        fx.config
            .update(json!({"providers": {"geminiCli": {"command": script.to_string_lossy()}}}))
            .unwrap();

        fx.session.start("demo", "gemini_cli").await.unwrap();
        let result = fx
            .session
            .shim()
            .wait_tool_result("ping", None, Duration::from_secs(3))
            .await;
        assert!(result.is_some(), "ping tool_result not observed");
        assert_eq!(result.unwrap()["ok"], true);
        fx.session.stop().await.unwrap();
    }

    #[tokio::test]
    async fn ask_one_shot_echoes_prompt() {
        let fx = fixture("cat");
        let (answer, _err) = fx.session.ask_one_shot("demo", "what is up").await;
        assert_eq!(answer.as_deref(), Some("what is up"));
    }

    #[test]
    fn provider_command_splits() {
        let cmd = build_provider_command("gemini --yolo").unwrap();
        assert_eq!(cmd, vec!["gemini".to_string(), "--yolo".to_string()]);
        assert!(build_provider_command("   ").is_err());
    }

    #[test]
    fn secrets_are_masked_in_logs() {
        let masked = mask_secrets("using api_key=sk-super-secret rest");
        assert!(!masked.contains("sk-super-secret"));
        assert!(masked.contains("[REDACTED]"));
    }
}
