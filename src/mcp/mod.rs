//! Thin typed façade over the MCP adapter's tool surface. Calls go over a
//! local HTTP JSON endpoint; every reply is normalized into
//! `{status, result|error, raw?}` so callers never parse adapter quirks.

use crate::config::ConfigStore;
use crate::errors::{GatewayError, GatewayResult};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

const RETRY_ATTEMPTS: usize = 2;
const RETRY_DELAY: Duration = Duration::from_millis(200);

/// Accepts an adapter reply string and produces the normalized shape.
pub fn parse_adapter_json(raw: &str) -> Value {
    match serde_json::from_str::<Value>(raw) {
        Ok(v) => v,
        Err(e) => json!({
            "status": "error",
            "error": format!("invalid JSON from adapter: {e}"),
            "raw": raw,
        }),
    }
}

pub struct McpClient {
    http: reqwest::Client,
    base_url: String,
    config: Arc<ConfigStore>,
}

impl McpClient {
    pub fn new(base_url: impl Into<String>, config: Arc<ConfigStore>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
            config,
        }
    }

    /// Adapter endpoint on the unity bridge port; kept in lockstep with
    /// the supervisor's launch environment.
    pub fn from_config(config: Arc<ConfigStore>) -> Self {
        let port = config.get_all(false).bridges.unity_bridge_port;
        Self::new(format!("http://127.0.0.1:{port}"), config)
    }

    fn timeout_for(&self, tool: &str) -> Duration {
        let timeouts = self.config.get_all(false).timeouts;
        let secs = if tool.starts_with("blender") {
            timeouts.blender_addon
        } else {
            timeouts.unity_editor
        };
        Duration::from_secs_f64(secs.max(1.0))
    }

    async fn call_adapter(&self, tool: &str, payload: &Value, timeout: Duration) -> GatewayResult<Value> {
        let url = format!("{}/tools/{tool}", self.base_url);
        // Callers wrap each call in the same family timeout; the request
        // deadline sits slightly above it so their timeout fires first and
        // this one only bounds a dead transport.
        let request_deadline = timeout + Duration::from_secs(1);
        let mut last_err: Option<GatewayError> = None;
        for attempt in 1..=RETRY_ATTEMPTS {
            let sent = self
                .http
                .post(&url)
                .json(payload)
                .timeout(request_deadline)
                .send()
                .await;
            match sent {
                Ok(resp) => {
                    let text = resp.text().await.map_err(|e| {
                        GatewayError::TransportClosed(format!("adapter reply lost: {e}"))
                    })?;
                    return Ok(parse_adapter_json(&text));
                }
                Err(e) if e.is_timeout() => {
                    return Err(GatewayError::Timeout(format!("tool '{tool}'")));
                }
                Err(e) => {
                    warn!("MCP call failed (try {attempt}/{RETRY_ATTEMPTS}): {e}");
                    last_err = Some(GatewayError::Upstream(e.to_string()));
                    tokio::time::sleep(RETRY_DELAY).await;
                }
            }
        }
        Err(last_err.unwrap_or_else(|| GatewayError::Upstream("adapter unreachable".into())))
    }

    /// Generic entry point used by the shim and the orchestrator.
    pub async fn run_tool(
        &self,
        name: &str,
        args: &Value,
        _correlation_id: Option<&str>,
    ) -> GatewayResult<Value> {
        match name {
            "unity.get_scene_hierarchy" | "unity_get_scene_hierarchy" => {
                self.get_scene_hierarchy().await
            }
            "unity.capture_screenshot" | "unity_capture_screenshot" => {
                self.capture_screenshot().await
            }
            "unity.instantiate_fbx" => {
                let asset = args
                    .get("asset")
                    .and_then(Value::as_str)
                    .unwrap_or("Assets/Generated/agent_export.fbx");
                self.instantiate_prefab(asset).await
            }
            "blender.create_primitive" => {
                let kind = args.get("type").and_then(Value::as_str).unwrap_or("cube");
                let size = args.get("size").and_then(Value::as_f64).unwrap_or(1.0);
                let name = args.get("name").and_then(Value::as_str);
                self.create_primitive(kind, size, name).await
            }
            "blender.export_fbx" => {
                let outfile = args
                    .get("outfile")
                    .and_then(Value::as_str)
                    .unwrap_or("Assets/Generated/agent_export.fbx");
                self.export_fbx(outfile).await
            }
            other => {
                let timeout = self.timeout_for(other);
                self.call_adapter(other, args, timeout).await
            }
        }
    }

    // ------------------------- Unity helpers -------------------------

    pub async fn get_scene_hierarchy(&self) -> GatewayResult<Value> {
        let timeout = self.timeout_for("unity");
        self.call_adapter("unity_get_scene_hierarchy", &json!({}), timeout)
            .await
    }

    pub async fn capture_screenshot(&self) -> GatewayResult<Value> {
        let timeout = self.timeout_for("unity");
        self.call_adapter("unity_capture_screenshot", &json!({}), timeout)
            .await
    }

    pub async fn unity_command(&self, code: &str) -> GatewayResult<Value> {
        let timeout = self.timeout_for("unity");
        self.call_adapter("unity_command", &json!({ "code": code }), timeout)
            .await
    }

    /// No dedicated adapter tool exists for instantiation; drive the
    /// editor with a generated snippet until one does.
    pub async fn instantiate_prefab(&self, asset_path: &str) -> GatewayResult<Value> {
        let code = instantiate_prefab_code(asset_path);
        let mut result = self.unity_command(&code).await?;
        if let Some(obj) = result.as_object_mut() {
            obj.entry("instantiated")
                .or_insert_with(|| Value::String(asset_path.to_string()));
        }
        Ok(result)
    }

    // ------------------------ Blender helpers ------------------------

    pub async fn export_fbx(&self, outfile: &str) -> GatewayResult<Value> {
        let timeout = self.timeout_for("blender");
        self.call_adapter("blender_call", &json!({"command": "export_fbx", "params": {"path": outfile}}), timeout)
            .await
    }

    pub async fn create_primitive(
        &self,
        kind: &str,
        size: f64,
        name: Option<&str>,
    ) -> GatewayResult<Value> {
        let mut payload = json!({"kind": kind, "params": {"size": size}});
        if let Some(n) = name {
            payload["name"] = Value::String(n.to_string());
        }
        let timeout = self.timeout_for("blender");
        self.call_adapter("blender_modeling_create_primitive", &payload, timeout)
            .await
    }
}

pub fn instantiate_prefab_code(asset_path: &str) -> String {
    format!(
        r#"using UnityEditor;
using UnityEngine;
var go = AssetDatabase.LoadAssetAtPath<GameObject>(@"{asset_path}");
if (go == null) {{
    throw new System.Exception("Prefab/FBX not found: {asset_path}");
}}
var instance = PrefabUtility.InstantiatePrefab(go) as GameObject;
if (instance == null) {{
    throw new System.Exception("Failed to instantiate prefab: {asset_path}");
}}
instance.transform.position = Vector3.zero;
"#
    )
}

/// Editor snippet destroying scene objects that match the asset's name;
/// the best-effort inverse of `instantiate_prefab`.
pub fn destroy_instances_code(asset_path: &str) -> String {
    format!(
        r#"using UnityEditor;
using UnityEngine;
var go = AssetDatabase.LoadAssetAtPath<GameObject>(@"{asset_path}");
if (go != null) {{
    var instances = GameObject.FindObjectsByType<GameObject>(FindObjectsSortMode.None);
    foreach (var i in instances) {{ if (i.name == go.name) {{ Object.DestroyImmediate(i); }} }}
}}
"#
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_valid_adapter_reply() {
        let v = parse_adapter_json(r#"{"status":"ok","result":{"path":"a.png"}}"#);
        assert_eq!(v["status"], "ok");
        assert_eq!(v["result"]["path"], "a.png");
    }

    #[test]
    fn parse_garbage_normalizes_to_error_shape() {
        let v = parse_adapter_json("not json at all");
        assert_eq!(v["status"], "error");
        assert_eq!(v["raw"], "not json at all");
        assert!(v["error"].as_str().unwrap().contains("invalid JSON"));
    }

    #[test]
    fn instantiate_code_embeds_asset_path() {
        let code = instantiate_prefab_code("Assets/Generated/test_cube.fbx");
        assert!(code.contains("Assets/Generated/test_cube.fbx"));
        assert!(code.contains("InstantiatePrefab"));
    }

    #[test]
    fn destroy_code_matches_by_name() {
        let code = destroy_instances_code("Assets/Generated/test_cube.fbx");
        assert!(code.contains("DestroyImmediate"));
    }

    #[tokio::test]
    async fn unreachable_adapter_surfaces_upstream_error() {
        let dir = tempfile::tempdir().unwrap();
        let config = Arc::new(
            crate::config::ConfigStore::open(dir.path().join("settings.toml")).unwrap(),
        );
        // A port nothing listens on; connect errors are retried then surfaced.
        let client = McpClient::new("http://127.0.0.1:1", config);
        let err = client
            .run_tool("unity.capture_screenshot", &json!({}), None)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            GatewayError::Upstream(_) | GatewayError::Timeout(_)
        ));
    }
}
