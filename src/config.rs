//! Centralized settings store: typed sections, atomic persistence with a
//! `.bak` sibling, secret masking on read paths, and validation split into
//! path / port / shape / key checks.

use crate::errors::{ConfigIssue, GatewayError, GatewayResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct Executables {
    pub unity_executable_path: String,
    pub blender_executable_path: String,
    pub unity_project_root: String,
}

impl Default for Executables {
    fn default() -> Self {
        Self {
            unity_executable_path: String::new(),
            blender_executable_path: String::new(),
            unity_project_root: "projects".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct Bridges {
    pub unity_bridge_port: u16,
    pub blender_bridge_port: u16,
}

impl Default for Bridges {
    fn default() -> Self {
        Self {
            unity_bridge_port: 8001,
            blender_bridge_port: 8002,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct ProviderLaunch {
    pub command: String,
}

impl Default for ProviderLaunch {
    fn default() -> Self {
        Self {
            command: "gemini".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct Providers {
    pub gemini_cli: ProviderLaunch,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct Integration {
    pub api_key: String,
    pub default_model: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Integrations {
    pub gemini: Integration,
    pub openai: Integration,
    pub anthropic: Integration,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ProjectsSection {
    pub root: String,
}

impl Default for ProjectsSection {
    fn default() -> Self {
        Self {
            root: "projects".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct Dependencies {
    pub requirement_files: Vec<String>,
    pub extra_allowed: Vec<String>,
    pub minimal_packages: Vec<String>,
}

impl Default for Dependencies {
    fn default() -> Self {
        Self {
            requirement_files: vec!["bridges/requirements.txt".to_string()],
            extra_allowed: vec!["mcp".to_string(), "websockets".to_string()],
            minimal_packages: vec!["websockets".to_string()],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct ToolShimConfig {
    pub max_calls_per_turn: u32,
    pub tool_timeout_seconds: f64,
}

impl Default for ToolShimConfig {
    fn default() -> Self {
        Self {
            max_calls_per_turn: 4,
            tool_timeout_seconds: 15.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct McpOwnership {
    /// `agent_runner_only` means the agent session spawns and owns the
    /// adapter unless a live instance already holds the lockfile.
    pub adapter_ownership: String,
    /// Allow starting a session even when neither the adapter nor the
    /// bridge handshake is reachable.
    pub proceed_without_bridges: bool,
}

impl Default for McpOwnership {
    fn default() -> Self {
        Self {
            adapter_ownership: "agent_runner_only".to_string(),
            proceed_without_bridges: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct AgentsSection {
    pub default: String,
    pub tool_shim: ToolShimConfig,
    pub mcp: McpOwnership,
}

impl Default for AgentsSection {
    fn default() -> Self {
        Self {
            default: "gemini".to_string(),
            tool_shim: ToolShimConfig::default(),
            mcp: McpOwnership::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Timeouts {
    pub blender_addon: f64,
    pub unity_editor: f64,
    pub terminate_grace: f64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            blender_addon: 20.0,
            unity_editor: 15.0,
            terminate_grace: 3.0,
        }
    }
}

/// Legacy launch description for one supervised process. The `update` path
/// keeps this section in sync with `executables` and `bridges` so older
/// tooling reading the same file keeps working.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct ProcessSpec {
    pub exe: String,
    pub args: Vec<String>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub timeout: Option<f64>,
    pub script_path: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Settings {
    pub executables: Executables,
    pub bridges: Bridges,
    pub providers: Providers,
    pub integrations: Integrations,
    pub projects: ProjectsSection,
    pub dependencies: Dependencies,
    pub agents: AgentsSection,
    pub timeouts: Timeouts,
    pub processes: BTreeMap<String, ProcessSpec>,
}

fn mask_key(v: &str) -> String {
    if v.is_empty() {
        return String::new();
    }
    if v.len() <= 4 {
        return "****".to_string();
    }
    format!("****{}", &v[v.len() - 4..])
}

fn is_masked(v: &str) -> bool {
    v.starts_with("***")
}

impl Settings {
    pub fn masked(&self) -> Settings {
        let mut out = self.clone();
        for integ in [
            &mut out.integrations.gemini,
            &mut out.integrations.openai,
            &mut out.integrations.anthropic,
        ] {
            integ.api_key = mask_key(&integ.api_key);
        }
        out
    }
}

/// Process-wide configuration store backed by a single TOML file.
pub struct ConfigStore {
    path: PathBuf,
    inner: RwLock<Settings>,
}

impl ConfigStore {
    /// Loads settings from `path`, merging defaults beneath stored values.
    /// A missing file yields defaults without creating it.
    pub fn open(path: impl Into<PathBuf>) -> GatewayResult<Self> {
        let path = path.into();
        let settings = if path.exists() {
            let raw = std::fs::read_to_string(&path)?;
            toml::from_str::<Settings>(&raw)
                .map_err(|e| GatewayError::Internal(format!("settings parse error: {e}")))?
        } else {
            Settings::default()
        };
        Ok(Self {
            path,
            inner: RwLock::new(settings),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get_all(&self, mask_secrets: bool) -> Settings {
        let guard = self.inner.read().unwrap_or_else(|e| e.into_inner());
        if mask_secrets {
            guard.masked()
        } else {
            guard.clone()
        }
    }

    /// Deep-merges `partial` over the stored settings, validates, persists
    /// atomically and returns the masked result. Masked secret values in
    /// `partial` keep the stored secret. All-or-nothing: validation errors
    /// leave both memory and disk untouched.
    pub fn update(&self, partial: Value) -> GatewayResult<Settings> {
        let mut guard = self.inner.write().unwrap_or_else(|e| e.into_inner());
        let mut merged = serde_json::to_value(&*guard)?;
        deep_merge(&mut merged, &partial);
        let mut candidate: Settings = serde_json::from_value(merged)
            .map_err(|e| GatewayError::ConfigInvalid(vec![ConfigIssue::new("$", e.to_string())]))?;

        // Masked api keys mean "keep existing".
        restore_masked_secrets(&mut candidate, &guard);
        sync_legacy_processes(&mut candidate);

        let issues = validate(&candidate);
        if !issues.is_empty() {
            return Err(GatewayError::ConfigInvalid(issues));
        }

        save_atomic(&self.path, &candidate)?;
        *guard = candidate.clone();
        Ok(candidate.masked())
    }
}

fn restore_masked_secrets(candidate: &mut Settings, stored: &Settings) {
    let pairs = [
        (
            &mut candidate.integrations.gemini.api_key,
            &stored.integrations.gemini.api_key,
        ),
        (
            &mut candidate.integrations.openai.api_key,
            &stored.integrations.openai.api_key,
        ),
        (
            &mut candidate.integrations.anthropic.api_key,
            &stored.integrations.anthropic.api_key,
        ),
    ];
    for (new, old) in pairs {
        if is_masked(new) {
            *new = old.clone();
        }
    }
}

/// Mirrors executables and bridge ports into the legacy `processes` table.
fn sync_legacy_processes(settings: &mut Settings) {
    if !settings.executables.unity_executable_path.is_empty() {
        settings
            .processes
            .entry("unity".to_string())
            .or_default()
            .exe = settings.executables.unity_executable_path.clone();
    }
    if !settings.executables.blender_executable_path.is_empty() {
        settings
            .processes
            .entry("blender".to_string())
            .or_default()
            .exe = settings.executables.blender_executable_path.clone();
    }
    settings
        .processes
        .entry("unity_bridge".to_string())
        .or_default()
        .port = Some(settings.bridges.unity_bridge_port);
    settings
        .processes
        .entry("blender_bridge".to_string())
        .or_default()
        .port = Some(settings.bridges.blender_bridge_port);
}

fn deep_merge(dst: &mut Value, src: &Value) {
    match (dst, src) {
        (Value::Object(dst_map), Value::Object(src_map)) => {
            for (k, v) in src_map {
                match dst_map.get_mut(k) {
                    Some(slot) if slot.is_object() && v.is_object() => deep_merge(slot, v),
                    _ => {
                        dst_map.insert(k.clone(), v.clone());
                    }
                }
            }
        }
        (dst_slot, src_val) => *dst_slot = src_val.clone(),
    }
}

fn save_atomic(path: &Path, settings: &Settings) -> GatewayResult<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let rendered = toml::to_string_pretty(settings)
        .map_err(|e| GatewayError::Internal(format!("settings render error: {e}")))?;
    if path.exists() {
        let backup = path.with_extension("toml.bak");
        if let Err(e) = std::fs::copy(path, &backup) {
            tracing::warn!("failed to write settings backup {:?}: {e}", backup);
        }
    }
    let tmp = path.with_extension("toml.tmp");
    std::fs::write(&tmp, rendered)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

pub fn validate(settings: &Settings) -> Vec<ConfigIssue> {
    let mut issues = Vec::new();
    validate_paths(settings, &mut issues);
    validate_ports(settings, &mut issues);
    validate_keys(settings, &mut issues);
    issues
}

fn validate_paths(settings: &Settings, issues: &mut Vec<ConfigIssue>) {
    let unity = &settings.executables.unity_executable_path;
    if !unity.is_empty() && !Path::new(unity).exists() {
        issues.push(ConfigIssue::new(
            "executables.unityExecutablePath",
            format!("Unity executable not found: {unity}"),
        ));
    }
    let blender = &settings.executables.blender_executable_path;
    if !blender.is_empty() && !Path::new(blender).exists() {
        issues.push(ConfigIssue::new(
            "executables.blenderExecutablePath",
            format!("Blender executable not found: {blender}"),
        ));
    }
    let root = &settings.projects.root;
    if !root.is_empty() {
        let p = Path::new(root);
        if !p.exists() && std::fs::create_dir_all(p).is_err() {
            issues.push(ConfigIssue::new(
                "projects.root",
                format!("Cannot access or create project root: {root}"),
            ));
        }
    }
    // Provider command: only check existence when it looks like a path.
    let cmd = &settings.providers.gemini_cli.command;
    if (cmd.contains('/') || cmd.contains('\\')) && !Path::new(cmd).exists() {
        issues.push(ConfigIssue::new(
            "providers.geminiCli.command",
            format!("Gemini CLI command not found: {cmd}"),
        ));
    }
}

fn port_free(port: u16) -> bool {
    std::net::TcpListener::bind(("127.0.0.1", port)).is_ok()
}

fn validate_ports(settings: &Settings, issues: &mut Vec<ConfigIssue>) {
    for (field, port) in [
        ("bridges.unityBridgePort", settings.bridges.unity_bridge_port),
        (
            "bridges.blenderBridgePort",
            settings.bridges.blender_bridge_port,
        ),
    ] {
        if port == 0 {
            issues.push(ConfigIssue::new(field, "Invalid port"));
        } else if !port_free(port) {
            issues.push(ConfigIssue::new(field, "Port is not available"));
        }
    }
}

fn validate_keys(settings: &Settings, issues: &mut Vec<ConfigIssue>) {
    let key = &settings.integrations.openai.api_key;
    if !key.is_empty() && !is_masked(key) && !key.starts_with("sk-") {
        issues.push(ConfigIssue::new(
            "integrations.openai.apiKey",
            "Expected key starting with 'sk-'",
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn store_in(dir: &Path) -> ConfigStore {
        // Seed a project root inside the temp dir so validation never
        // touches the working directory.
        let mut seeded = Settings::default();
        seeded.projects.root = dir.join("projects").to_string_lossy().to_string();
        let path = dir.join("settings.toml");
        std::fs::write(&path, toml::to_string_pretty(&seeded).unwrap()).unwrap();
        ConfigStore::open(path).unwrap()
    }

    #[test]
    fn defaults_when_missing() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());
        let cfg = store.get_all(false);
        assert_eq!(cfg.bridges.unity_bridge_port, 8001);
        assert_eq!(cfg.agents.tool_shim.max_calls_per_turn, 4);
    }

    #[test]
    fn masks_and_keeps_secrets() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());
        store
            .update(json!({"integrations": {"openai": {"apiKey": "sk-ABCDEF1234"}}}))
            .unwrap();
        assert_eq!(store.get_all(true).integrations.openai.api_key, "****1234");
        assert_eq!(
            store.get_all(false).integrations.openai.api_key,
            "sk-ABCDEF1234"
        );

        // Updating with the masked value keeps the stored secret.
        store
            .update(json!({"integrations": {"openai": {"apiKey": "****1234"}}}))
            .unwrap();
        assert_eq!(
            store.get_all(false).integrations.openai.api_key,
            "sk-ABCDEF1234"
        );
    }

    #[test]
    fn update_with_unmasked_snapshot_is_a_noop() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());
        store
            .update(json!({"integrations": {"gemini": {"apiKey": "g-key-9999"}}}))
            .unwrap();
        let before = store.get_all(false);
        let snapshot = serde_json::to_value(&before).unwrap();
        store.update(snapshot).unwrap();
        assert_eq!(store.get_all(false), before);
    }

    #[test]
    fn rejects_bad_openai_key_shape() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());
        let err = store
            .update(json!({"integrations": {"openai": {"apiKey": "not-a-key"}}}))
            .unwrap_err();
        match err {
            GatewayError::ConfigInvalid(issues) => {
                assert!(issues.iter().any(|i| i.field == "integrations.openai.apiKey"));
            }
            other => panic!("expected ConfigInvalid, got {other:?}"),
        }
    }

    #[test]
    fn rejects_missing_executable_path() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());
        let err = store
            .update(json!({"executables": {"unityExecutablePath": "/definitely/not/here/Unity"}}))
            .unwrap_err();
        assert!(matches!(err, GatewayError::ConfigInvalid(_)));
    }

    #[test]
    fn writes_backup_on_second_save() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());
        store.update(json!({"agents": {"toolShim": {"maxCallsPerTurn": 3}}})).unwrap();
        store.update(json!({"agents": {"toolShim": {"maxCallsPerTurn": 2}}})).unwrap();
        assert!(dir.path().join("settings.toml.bak").exists());
        assert_eq!(store.get_all(false).agents.tool_shim.max_calls_per_turn, 2);
    }

    #[test]
    fn legacy_processes_stay_in_sync() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());
        let cfg = store
            .update(json!({"bridges": {"unityBridgePort": 18801}}))
            .unwrap();
        assert_eq!(
            cfg.processes.get("unity_bridge").and_then(|p| p.port),
            Some(18801)
        );
    }
}
