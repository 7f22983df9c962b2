//! Tool catalog: the data-driven whitelist plus per-tool argument schemas.
//! New tools need a catalog entry and a handler registration, nothing else.

use serde::Deserialize;
use serde_json::Value;
use std::sync::OnceLock;

static DEFAULT_CATALOG: OnceLock<ToolCatalog> = OnceLock::new();

#[derive(Debug, Clone, Deserialize)]
pub struct ToolSchema {
    pub name: String,
    pub parameters: Value,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCatalog {
    pub function_schema: Vec<ToolSchema>,
}

impl ToolCatalog {
    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }

    /// Built-in catalog embedded at compile time.
    pub fn builtin() -> &'static ToolCatalog {
        DEFAULT_CATALOG.get_or_init(|| {
            ToolCatalog::from_json(include_str!("catalog.json"))
                .unwrap_or(ToolCatalog {
                    function_schema: Vec::new(),
                })
        })
    }

    pub fn get(&self, name: &str) -> Option<&ToolSchema> {
        self.function_schema.iter().find(|t| t.name == name)
    }

    pub fn allows(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn tool_names(&self) -> Vec<&str> {
        self.function_schema.iter().map(|t| t.name.as_str()).collect()
    }

    /// Validates args against the tool's declared schema. Checks required
    /// keys, then basic type and enum membership per property; anything
    /// the schema does not describe passes.
    pub fn validate_args(&self, name: &str, args: &Value) -> Result<(), String> {
        let schema = match self.get(name) {
            Some(t) => &t.parameters,
            None => return Err("unknown tool".to_string()),
        };
        let args_obj = match args.as_object() {
            Some(map) => map,
            None => return Err("args must be an object".to_string()),
        };
        if let Some(required) = schema.get("required").and_then(Value::as_array) {
            for req in required {
                if let Some(key) = req.as_str() {
                    if !args_obj.contains_key(key) {
                        return Err(format!("missing required arg: {key}"));
                    }
                }
            }
        }
        if let Some(props) = schema.get("properties").and_then(Value::as_object) {
            for (key, value) in args_obj {
                let Some(prop) = props.get(key) else { continue };
                if let Some(expected) = prop.get("type").and_then(Value::as_str) {
                    if !type_matches(expected, value) {
                        return Err(format!("arg '{key}' must be of type {expected}"));
                    }
                }
                if let Some(allowed) = prop.get("enum").and_then(Value::as_array) {
                    if !allowed.contains(value) {
                        return Err(format!("arg '{key}' not in allowed values"));
                    }
                }
            }
        }
        Ok(())
    }
}

fn type_matches(expected: &str, value: &Value) -> bool {
    match expected {
        "string" => value.is_string(),
        "number" => value.is_number(),
        "integer" => value.is_i64() || value.is_u64(),
        "boolean" => value.is_boolean(),
        "array" => value.is_array(),
        "object" => value.is_object(),
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn builtin_catalog_loads() {
        let catalog = ToolCatalog::builtin();
        assert!(catalog.allows("ping"));
        assert!(catalog.allows("blender.export_fbx"));
        assert!(!catalog.allows("rm.everything"));
    }

    #[test]
    fn required_args_enforced() {
        let catalog = ToolCatalog::builtin();
        assert!(catalog
            .validate_args("blender.export_fbx", &json!({"outfile": "a.fbx"}))
            .is_ok());
        let err = catalog
            .validate_args("blender.export_fbx", &json!({}))
            .unwrap_err();
        assert!(err.contains("missing required arg: outfile"));
    }

    #[test]
    fn type_and_enum_checked() {
        let catalog = ToolCatalog::builtin();
        let err = catalog
            .validate_args("blender.create_primitive", &json!({"type": "cube", "size": "big"}))
            .unwrap_err();
        assert!(err.contains("size"));
        let err = catalog
            .validate_args("blender.create_primitive", &json!({"type": "dodecahedron"}))
            .unwrap_err();
        assert!(err.contains("allowed values"));
    }

    #[test]
    fn unknown_tool_rejected() {
        let catalog = ToolCatalog::builtin();
        assert_eq!(
            catalog.validate_args("nope", &json!({})),
            Err("unknown tool".to_string())
        );
    }
}
