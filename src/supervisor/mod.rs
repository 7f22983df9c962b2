//! Process supervisor for the engine, modeler, their bridges and the MCP
//! adapter: launch, port preflight, sequenced startup, line-decoded output
//! capture in ring buffers, and graceful reverse-order shutdown.

pub mod lockfile;

pub use lockfile::{AdapterLock, AdapterStatus};

use crate::config::{ConfigStore, Settings};
use crate::errors::{GatewayError, GatewayResult};
use chrono::Utc;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const RING_CAPACITY_BYTES: usize = 10 * 1024;
const TAIL_BYTES: usize = 1024;

/// Byte-capped line buffer; oldest lines fall off first.
pub struct RingBuffer {
    lines: VecDeque<String>,
    bytes: usize,
    max_bytes: usize,
}

impl RingBuffer {
    pub fn new(max_bytes: usize) -> Self {
        Self {
            lines: VecDeque::new(),
            bytes: 0,
            max_bytes,
        }
    }

    pub fn push(&mut self, line: String) {
        self.bytes += line.len();
        self.lines.push_back(line);
        while self.bytes > self.max_bytes && self.lines.len() > 1 {
            if let Some(removed) = self.lines.pop_front() {
                self.bytes -= removed.len();
            }
        }
    }

    /// Concatenated contents, truncated to the trailing `limit` bytes on a
    /// char boundary.
    pub fn tail(&self, limit: usize) -> String {
        let joined: String = self
            .lines
            .iter()
            .map(|l| l.as_str())
            .collect::<Vec<_>>()
            .join("\n");
        if joined.len() <= limit {
            return joined;
        }
        let mut start = joined.len() - limit;
        while !joined.is_char_boundary(start) {
            start += 1;
        }
        joined[start..].to_string()
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessStatusSnapshot {
    pub name: String,
    pub running: bool,
    pub pid: Option<u32>,
    pub return_code: Option<i32>,
    pub started_at: Option<String>,
    pub last_output: String,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SequenceStep {
    pub name: String,
    pub running: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Launch description for one supervised process.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub name: String,
    pub command: Vec<String>,
    pub env: Vec<(String, String)>,
    pub cwd: Option<PathBuf>,
    pub start_timeout: Duration,
    pub stop_grace: Duration,
}

struct ManagedProcess {
    spec: LaunchSpec,
    child: Option<Child>,
    started_at: Option<String>,
    last_error: Option<String>,
    stdout_buf: Arc<StdMutex<RingBuffer>>,
    stderr_buf: Arc<StdMutex<RingBuffer>>,
    readers: Vec<JoinHandle<()>>,
}

impl ManagedProcess {
    fn new(spec: LaunchSpec) -> Self {
        Self {
            spec,
            child: None,
            started_at: None,
            last_error: None,
            stdout_buf: Arc::new(StdMutex::new(RingBuffer::new(RING_CAPACITY_BYTES))),
            stderr_buf: Arc::new(StdMutex::new(RingBuffer::new(RING_CAPACITY_BYTES))),
            readers: Vec::new(),
        }
    }

    fn start(&mut self) -> GatewayResult<()> {
        if self.child.is_some() {
            return Ok(());
        }
        let exe = self
            .spec
            .command
            .first()
            .ok_or_else(|| GatewayError::Internal("empty launch command".into()))?;
        let exe_path = Path::new(exe);
        if (exe.contains('/') || exe.contains('\\')) && !exe_path.exists() {
            let msg = format!("Executable not found at path: {exe}");
            self.last_error = Some(msg.clone());
            return Err(GatewayError::NotFound(msg));
        }

        info!("[{}] starting: {:?}", self.spec.name, self.spec.command);
        let mut cmd = Command::new(exe);
        cmd.args(&self.spec.command[1..])
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .stdin(Stdio::null())
            .kill_on_drop(true);
        for (k, v) in &self.spec.env {
            cmd.env(k, v);
        }
        if let Some(cwd) = &self.spec.cwd {
            cmd.current_dir(cwd);
        }
        let mut child = cmd.spawn().map_err(|e| {
            let msg = format!("failed to spawn {}: {e}", self.spec.name);
            self.last_error = Some(msg.clone());
            GatewayError::Internal(msg)
        })?;

        self.started_at = Some(Utc::now().to_rfc3339());
        info!("[{}] started pid {:?}", self.spec.name, child.id());

        if let Some(stdout) = child.stdout.take() {
            self.readers.push(spawn_buffer_reader(
                stdout,
                self.stdout_buf.clone(),
                self.spec.name.clone(),
                "stdout",
            ));
        }
        if let Some(stderr) = child.stderr.take() {
            self.readers.push(spawn_buffer_reader(
                stderr,
                self.stderr_buf.clone(),
                self.spec.name.clone(),
                "stderr",
            ));
        }
        self.child = Some(child);
        Ok(())
    }

    async fn stop(&mut self) {
        let Some(mut child) = self.child.take() else {
            return;
        };
        let name = self.spec.name.clone();
        let pid = child.id();
        info!("[{name}] stopping pid {pid:?}");
        terminate(&child);
        match tokio::time::timeout(self.spec.stop_grace, child.wait()).await {
            Ok(_) => {}
            Err(_) => {
                warn!("[{name}] terminate timed out, killing");
                let _ = child.start_kill();
                let _ = tokio::time::timeout(Duration::from_secs(2), child.wait()).await;
            }
        }
        for handle in self.readers.drain(..) {
            handle.abort();
        }
    }

    fn status(&mut self) -> ProcessStatusSnapshot {
        let mut running = false;
        let mut pid = None;
        let mut return_code = None;
        if let Some(child) = self.child.as_mut() {
            match child.try_wait() {
                Ok(None) => {
                    running = true;
                    pid = child.id();
                }
                Ok(Some(status)) => {
                    return_code = status.code();
                }
                Err(e) => {
                    debug!("[{}] try_wait failed: {e}", self.spec.name);
                }
            }
        }
        let stdout_tail = self
            .stdout_buf
            .lock()
            .map(|b| b.tail(TAIL_BYTES))
            .unwrap_or_default();
        let stderr_tail = self
            .stderr_buf
            .lock()
            .map(|b| b.tail(TAIL_BYTES))
            .unwrap_or_default();
        let last_error = self.last_error.clone().or(if !running && !stderr_tail.is_empty() {
            Some(stderr_tail)
        } else {
            None
        });
        ProcessStatusSnapshot {
            name: self.spec.name.clone(),
            running,
            pid,
            return_code,
            started_at: self.started_at.clone(),
            last_output: stdout_tail,
            last_error,
        }
    }
}

#[cfg(unix)]
fn terminate(child: &Child) {
    if let Some(pid) = child.id() {
        let _ = std::process::Command::new("kill")
            .args(["-TERM", &pid.to_string()])
            .output();
    }
}

#[cfg(not(unix))]
fn terminate(child: &Child) {
    // No portable soft-terminate; the kill fallback follows the grace wait.
    let _ = child;
}

fn spawn_buffer_reader<R>(
    stream: R,
    buf: Arc<StdMutex<RingBuffer>>,
    name: String,
    label: &'static str,
) -> JoinHandle<()>
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
                    debug!("[{name}/{label}] {line}");
                    if let Ok(mut guard) = buf.lock() {
                        guard.push(line);
                    }
                }
                Err(e) => {
                    debug!("[{name}/{label}] reader error: {e}");
                    break;
                }
            }
        }
    })
}

/// Probes whether something is already listening on host:port. Uses a
/// plain connect, never a bind, so the target socket is left untouched.
pub async fn port_in_use(host: &str, port: u16) -> bool {
    matches!(
        tokio::time::timeout(
            Duration::from_millis(500),
            tokio::net::TcpStream::connect((host, port)),
        )
        .await,
        Ok(Ok(_))
    )
}

pub struct Supervisor {
    procs: Mutex<HashMap<String, ManagedProcess>>,
    config: Arc<ConfigStore>,
    adapter_lock: AdapterLock,
    adapter_owned: StdMutex<bool>,
}

impl Supervisor {
    pub fn new(config: Arc<ConfigStore>, adapter_lock: AdapterLock) -> Self {
        Self {
            procs: Mutex::new(HashMap::new()),
            config,
            adapter_lock,
            adapter_owned: StdMutex::new(false),
        }
    }

    pub fn adapter_status(&self) -> AdapterStatus {
        self.adapter_lock.status()
    }

    fn stop_grace(settings: &Settings) -> Duration {
        Duration::from_secs_f64(settings.timeouts.terminate_grace.max(0.5))
    }

    fn start_timeout(settings: &Settings, name: &str, default_secs: f64) -> Duration {
        let secs = settings
            .processes
            .get(name)
            .and_then(|p| p.timeout)
            .unwrap_or(default_secs);
        Duration::from_secs_f64(secs.clamp(0.0, 60.0))
    }

    fn build_unity_spec(settings: &Settings, project_id: Option<&str>) -> GatewayResult<LaunchSpec> {
        let exe = settings.executables.unity_executable_path.clone();
        if exe.is_empty() {
            return Err(GatewayError::ConfigInvalid(vec![
                crate::errors::ConfigIssue::new(
                    "executables.unityExecutablePath",
                    "Unity executable path not configured",
                ),
            ]));
        }
        let mut command = vec![exe];
        if let Some(spec) = settings.processes.get("unity") {
            command.extend(spec.args.iter().cloned());
        }
        if let Some(pid) = project_id {
            command.push("-projectPath".to_string());
            command.push(
                Path::new(&settings.projects.root)
                    .join(pid)
                    .to_string_lossy()
                    .to_string(),
            );
        }
        Ok(LaunchSpec {
            name: "unity".to_string(),
            command,
            env: Vec::new(),
            cwd: None,
            start_timeout: Self::start_timeout(settings, "unity", 15.0),
            stop_grace: Self::stop_grace(settings),
        })
    }

    fn build_bridge_spec(settings: &Settings, name: &str, port: u16) -> GatewayResult<LaunchSpec> {
        let proc_cfg = settings.processes.get(name).cloned().unwrap_or_default();
        if proc_cfg.exe.is_empty() {
            return Err(GatewayError::ConfigInvalid(vec![
                crate::errors::ConfigIssue::new(
                    format!("processes.{name}.exe"),
                    format!("{name} launcher not configured"),
                ),
            ]));
        }
        let mut command = vec![proc_cfg.exe.clone()];
        command.extend(proc_cfg.args.iter().cloned());
        if let Some(script) = &proc_cfg.script_path {
            command.push("--python".to_string());
            command.push(script.clone());
            command.push("--".to_string());
        }
        command.push("--host".to_string());
        command.push(proc_cfg.host.clone().unwrap_or_else(|| "127.0.0.1".to_string()));
        command.push("--port".to_string());
        command.push(port.to_string());
        Ok(LaunchSpec {
            name: name.to_string(),
            command,
            env: Vec::new(),
            cwd: None,
            start_timeout: Self::start_timeout(settings, name, 15.0),
            stop_grace: Self::stop_grace(settings),
        })
    }

    fn build_blender_spec(settings: &Settings) -> GatewayResult<LaunchSpec> {
        let exe = settings.executables.blender_executable_path.clone();
        if exe.is_empty() {
            return Err(GatewayError::ConfigInvalid(vec![
                crate::errors::ConfigIssue::new(
                    "executables.blenderExecutablePath",
                    "Blender executable path not configured",
                ),
            ]));
        }
        let mut command = vec![exe];
        if let Some(spec) = settings.processes.get("blender") {
            command.extend(spec.args.iter().cloned());
        }
        Ok(LaunchSpec {
            name: "blender".to_string(),
            command,
            env: Vec::new(),
            cwd: None,
            start_timeout: Self::start_timeout(settings, "blender", 20.0),
            stop_grace: Self::stop_grace(settings),
        })
    }

    pub async fn spawn(&self, spec: LaunchSpec) -> GatewayResult<ProcessStatusSnapshot> {
        let mut procs = self.procs.lock().await;
        let entry = procs
            .entry(spec.name.clone())
            .or_insert_with(|| ManagedProcess::new(spec.clone()));
        if entry.child.is_none() {
            entry.spec = spec;
            entry.start()?;
            // Bounded settle wait so the first status snapshot reflects an
            // immediate crash instead of a half-started process.
            let settle = entry.spec.start_timeout.min(Duration::from_secs(2));
            if !settle.is_zero() {
                tokio::time::sleep(settle).await;
            }
        }
        Ok(entry.status())
    }

    pub async fn start_unity(&self, project_id: Option<&str>) -> GatewayResult<ProcessStatusSnapshot> {
        let settings = self.config.get_all(false);
        let spec = Self::build_unity_spec(&settings, project_id)?;
        self.spawn(spec).await
    }

    pub async fn start_unity_bridge(&self) -> GatewayResult<ProcessStatusSnapshot> {
        let settings = self.config.get_all(false);
        let port = settings.bridges.unity_bridge_port;
        if port_in_use("127.0.0.1", port).await {
            return Err(GatewayError::PortInUse(format!("unity_bridge 127.0.0.1:{port}")));
        }
        let spec = Self::build_bridge_spec(&settings, "unity_bridge", port)?;
        self.spawn(spec).await
    }

    pub async fn start_blender(&self) -> GatewayResult<ProcessStatusSnapshot> {
        let settings = self.config.get_all(false);
        let spec = Self::build_blender_spec(&settings)?;
        self.spawn(spec).await
    }

    pub async fn start_blender_bridge(&self) -> GatewayResult<ProcessStatusSnapshot> {
        let settings = self.config.get_all(false);
        let port = settings.bridges.blender_bridge_port;
        if port_in_use("127.0.0.1", port).await {
            return Err(GatewayError::PortInUse(format!("blender_bridge 127.0.0.1:{port}")));
        }
        let spec = Self::build_bridge_spec(&settings, "blender_bridge", port)?;
        self.spawn(spec).await
    }

    /// Starts the pipeline in order: unity, unity_bridge, blender,
    /// blender_bridge. Failure of a required step (unity, unity_bridge)
    /// aborts; the optional modeler steps record their error and the
    /// sequence continues.
    pub async fn start_sequence(&self, project_id: Option<&str>) -> GatewayResult<Vec<SequenceStep>> {
        let mut steps = Vec::new();

        for (name, result) in [
            ("unity", self.start_unity(project_id).await),
            ("unity_bridge", self.start_unity_bridge().await),
        ] {
            let st = result?;
            steps.push(SequenceStep {
                name: name.to_string(),
                running: st.running,
                error: st.last_error,
            });
        }

        for (name, result) in [
            ("blender", self.start_blender().await),
            ("blender_bridge", self.start_blender_bridge().await),
        ] {
            match result {
                Ok(st) => steps.push(SequenceStep {
                    name: name.to_string(),
                    running: st.running,
                    error: st.last_error,
                }),
                Err(e) => {
                    warn!("{name} start failed (non-critical): {e}");
                    steps.push(SequenceStep {
                        name: name.to_string(),
                        running: false,
                        error: Some(e.to_string()),
                    });
                }
            }
        }
        Ok(steps)
    }

    pub async fn stop(&self, name: &str) {
        let mut procs = self.procs.lock().await;
        if let Some(mut proc) = procs.remove(name) {
            proc.stop().await;
        }
    }

    /// Stops everything in reverse startup order; the MCP adapter only if
    /// this instance owns it.
    pub async fn stop_all(&self) {
        for name in ["blender_bridge", "unity_bridge", "blender", "unity"] {
            self.stop(name).await;
        }
        self.stop_adapter_if_owned().await;
        let mut procs = self.procs.lock().await;
        let leftovers: Vec<String> = procs.keys().cloned().collect();
        drop(procs);
        for name in leftovers {
            self.stop(&name).await;
        }
    }

    pub async fn status(&self) -> Vec<ProcessStatusSnapshot> {
        let mut procs = self.procs.lock().await;
        let mut out: Vec<ProcessStatusSnapshot> =
            procs.values_mut().map(|p| p.status()).collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    /// Spawns the MCP adapter when this instance is configured to own it
    /// and no live instance holds the lockfile; attaches otherwise.
    pub async fn ensure_mcp_adapter(&self) -> GatewayResult<AdapterStatus> {
        let settings = self.config.get_all(false);
        if settings.agents.mcp.adapter_ownership != "agent_runner_only" {
            return Ok(self.adapter_lock.status());
        }
        let current = self.adapter_lock.status();
        if current.running {
            // Someone else runs it; attach without respawning.
            *self.adapter_owned.lock().unwrap_or_else(|e| e.into_inner()) = false;
            return Ok(current);
        }

        let proc_cfg = settings.processes.get("mcp_adapter").cloned().unwrap_or_default();
        if proc_cfg.exe.is_empty() {
            return Err(GatewayError::BridgesNotReady(
                "mcp_adapter launcher not configured".to_string(),
            ));
        }
        let mut command = vec![proc_cfg.exe.clone()];
        command.extend(proc_cfg.args.iter().cloned());
        let env = vec![
            (
                "MCP_SERVER_URL".to_string(),
                format!(
                    "ws://127.0.0.1:{}/ws/agent_adapter",
                    settings.bridges.unity_bridge_port
                ),
            ),
            (
                "BLENDER_SERVER_URL".to_string(),
                format!("ws://127.0.0.1:{}", settings.bridges.blender_bridge_port),
            ),
        ];
        let snapshot = self
            .spawn(LaunchSpec {
                name: "mcp_adapter".to_string(),
                command,
                env,
                cwd: None,
                start_timeout: Self::start_timeout(&settings, "mcp_adapter", 5.0),
                stop_grace: Self::stop_grace(&settings),
            })
            .await?;
        if let Some(pid) = snapshot.pid {
            if let Err(e) = self.adapter_lock.write(pid) {
                warn!("failed to write adapter lockfile: {e}");
            }
        }
        *self.adapter_owned.lock().unwrap_or_else(|e| e.into_inner()) = true;
        Ok(self.adapter_lock.status())
    }

    pub async fn stop_adapter_if_owned(&self) {
        let owned = {
            let mut guard = self.adapter_owned.lock().unwrap_or_else(|e| e.into_inner());
            std::mem::replace(&mut *guard, false)
        };
        if !owned {
            return;
        }
        self.stop("mcp_adapter").await;
        self.adapter_lock.clear();
    }

    #[cfg(test)]
    pub async fn spawn_raw(&self, name: &str, command: Vec<String>) -> GatewayResult<ProcessStatusSnapshot> {
        self.spawn(LaunchSpec {
            name: name.to_string(),
            command,
            env: Vec::new(),
            cwd: None,
            start_timeout: Duration::ZERO,
            stop_grace: Duration::from_millis(500),
        })
        .await
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        if let Ok(owned) = self.adapter_owned.lock() {
            if *owned {
                self.adapter_lock.clear();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_buffer_caps_bytes() {
        let mut buf = RingBuffer::new(64);
        for i in 0..32 {
            buf.push(format!("line-{i:04}-padding"));
        }
        let tail = buf.tail(1024);
        assert!(tail.len() <= 64 + 16);
        assert!(tail.contains("line-0031"));
        assert!(!tail.contains("line-0000"));
    }

    #[test]
    fn ring_buffer_tail_respects_limit() {
        let mut buf = RingBuffer::new(10 * 1024);
        buf.push("a".repeat(2000));
        assert_eq!(buf.tail(100).len(), 100);
    }

    #[tokio::test]
    async fn spawn_status_and_stop() {
        let dir = tempfile::tempdir().unwrap();
        let config = Arc::new(
            ConfigStore::open(dir.path().join("settings.toml")).unwrap(),
        );
        let sup = Supervisor::new(config, AdapterLock::new(dir.path().join("adapter.lock")));

        let st = sup
            .spawn_raw("sleeper", vec!["sleep".to_string(), "30".to_string()])
            .await
            .unwrap();
        assert!(st.running);
        assert!(st.pid.is_some());

        sup.stop("sleeper").await;
        assert!(sup.status().await.is_empty());
    }

    #[tokio::test]
    async fn spawn_captures_output() {
        let dir = tempfile::tempdir().unwrap();
        let config = Arc::new(
            ConfigStore::open(dir.path().join("settings.toml")).unwrap(),
        );
        let sup = Supervisor::new(config, AdapterLock::new(dir.path().join("adapter.lock")));
        sup.spawn_raw(
            "echoer",
            vec!["sh".to_string(), "-c".to_string(), "echo hello-capture".to_string()],
        )
        .await
        .unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        let status = sup.status().await;
        assert_eq!(status.len(), 1);
        assert!(status[0].last_output.contains("hello-capture"));
        sup.stop_all().await;
    }

    #[tokio::test]
    async fn missing_executable_fails_with_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let config = Arc::new(
            ConfigStore::open(dir.path().join("settings.toml")).unwrap(),
        );
        let sup = Supervisor::new(config, AdapterLock::new(dir.path().join("adapter.lock")));
        let err = sup
            .spawn_raw("ghost", vec!["/no/such/binary".to_string()])
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::NotFound(_)));
    }

    #[tokio::test]
    async fn busy_port_fails_preflight() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        assert!(port_in_use("127.0.0.1", port).await);
        drop(listener);
        assert!(!port_in_use("127.0.0.1", port).await);
    }
}
