//! Advisory lockfile for the MCP adapter. The file is a hint: a dead pid
//! invalidates the lock, and real ownership is decided by who spawned the
//! process in this gateway instance.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockInfo {
    pub pid: u32,
    pub started_at: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AdapterStatus {
    pub running: bool,
    pub pid: Option<u32>,
    pub started_at: Option<String>,
}

pub struct AdapterLock {
    path: PathBuf,
}

impl AdapterLock {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn at_default_path() -> Self {
        Self::new(crate::paths::adapter_lock_file())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read(&self) -> Option<LockInfo> {
        let raw = std::fs::read_to_string(&self.path).ok()?;
        serde_json::from_str(&raw).ok()
    }

    /// Reports whether a live adapter holds the lock. Stale entries (pid
    /// no longer running) are treated as absent.
    pub fn status(&self) -> AdapterStatus {
        match self.read() {
            Some(info) if pid_alive(info.pid) => AdapterStatus {
                running: true,
                pid: Some(info.pid),
                started_at: Some(info.started_at),
            },
            _ => AdapterStatus {
                running: false,
                pid: None,
                started_at: None,
            },
        }
    }

    pub fn write(&self, pid: u32) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let info = LockInfo {
            pid,
            started_at: Utc::now().to_rfc3339(),
        };
        std::fs::write(&self.path, serde_json::to_string(&info)?)
    }

    pub fn clear(&self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

#[cfg(unix)]
pub fn pid_alive(pid: u32) -> bool {
    std::process::Command::new("kill")
        .args(["-0", &pid.to_string()])
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

#[cfg(not(unix))]
pub fn pid_alive(pid: u32) -> bool {
    std::process::Command::new("tasklist")
        .args(["/FI", &format!("PID eq {pid}"), "/NH"])
        .output()
        .map(|o| String::from_utf8_lossy(&o.stdout).contains(&pid.to_string()))
        .unwrap_or(false)
}
