//! Provider adapters demultiplex raw CLI output into the neutral
//! `ProviderEvent` stream. Each CLI family gets its own adapter; the
//! session and shim only ever see the neutral events.

use serde_json::Value;

#[derive(Debug, Clone, PartialEq)]
pub enum ProviderEvent {
    Token { content: String },
    ToolCall { name: String, args: Value },
    Final { content: Option<String> },
    Error { message: String },
}

pub trait ProviderAdapter: Send + Sync {
    /// Splits one raw output line into zero or more events.
    fn parse_line(&self, line: &str) -> Vec<ProviderEvent>;

    /// Hook for rewriting user input before it reaches the CLI stdin.
    fn prepare_input(&self, text: &str) -> String {
        text.to_string()
    }
}

/// Adapter for CLIs that emit newline-delimited JSON objects:
/// `{"tool_call": {"name": ..., "args": {...}}}`, `{"token": {...}}`,
/// `{"final": {...}}`, `{"error": {...}}`. Anything else is a plain token.
#[derive(Debug, Default)]
pub struct JsonLinesAdapter;

impl ProviderAdapter for JsonLinesAdapter {
    fn parse_line(&self, line: &str) -> Vec<ProviderEvent> {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return Vec::new();
        }
        let Ok(value) = serde_json::from_str::<Value>(trimmed) else {
            return vec![ProviderEvent::Token {
                content: line.to_string(),
            }];
        };
        let Some(obj) = value.as_object() else {
            return vec![ProviderEvent::Token {
                content: line.to_string(),
            }];
        };

        if let Some(call) = obj.get("tool_call") {
            let name = call
                .get("name")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let args = call.get("args").cloned().unwrap_or(Value::Object(Default::default()));
            return vec![ProviderEvent::ToolCall { name, args }];
        }
        if let Some(token) = obj.get("token") {
            let content = token
                .get("content")
                .and_then(Value::as_str)
                .or_else(|| token.as_str())
                .unwrap_or_default()
                .to_string();
            return vec![ProviderEvent::Token { content }];
        }
        if let Some(fin) = obj.get("final") {
            let content = fin
                .get("content")
                .and_then(Value::as_str)
                .or_else(|| fin.as_str())
                .map(str::to_string);
            return vec![ProviderEvent::Final { content }];
        }
        if let Some(err) = obj.get("error") {
            let message = err
                .get("message")
                .and_then(Value::as_str)
                .or_else(|| err.as_str())
                .unwrap_or("unknown provider error")
                .to_string();
            return vec![ProviderEvent::Error { message }];
        }
        // JSON we don't recognize still reaches the chat stream verbatim.
        vec![ProviderEvent::Token {
            content: line.to_string(),
        }]
    }
}

/// Stderr chatter that is part of normal CLI startup, not an error.
pub fn is_benign_stderr(line: &str) -> bool {
    const BENIGN_PATTERNS: [&str; 3] = [
        "Error during discovery for server",
        "Connection closed",
        "Starting MCP server",
    ];
    BENIGN_PATTERNS.iter().any(|p| line.contains(p))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn tool_call_lines_are_demuxed() {
        let adapter = JsonLinesAdapter;
        let events =
            adapter.parse_line(r#"{"tool_call": {"name": "ping", "args": {"x": 1}}}"#);
        assert_eq!(
            events,
            vec![ProviderEvent::ToolCall {
                name: "ping".to_string(),
                args: json!({"x": 1}),
            }]
        );
    }

    #[test]
    fn plain_text_is_a_token() {
        let adapter = JsonLinesAdapter;
        let events = adapter.parse_line("I created the cube.");
        assert_eq!(
            events,
            vec![ProviderEvent::Token {
                content: "I created the cube.".to_string()
            }]
        );
    }

    #[test]
    fn token_and_error_objects() {
        let adapter = JsonLinesAdapter;
        assert_eq!(
            adapter.parse_line(r#"{"token": {"content": "hi"}}"#),
            vec![ProviderEvent::Token {
                content: "hi".to_string()
            }]
        );
        assert_eq!(
            adapter.parse_line(r#"{"error": {"message": "boom"}}"#),
            vec![ProviderEvent::Error {
                message: "boom".to_string()
            }]
        );
    }

    #[test]
    fn unknown_json_falls_through_as_token() {
        let adapter = JsonLinesAdapter;
        let events = adapter.parse_line(r#"{"progress": 0.5}"#);
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], ProviderEvent::Token { .. }));
    }

    #[test]
    fn empty_lines_produce_nothing() {
        let adapter = JsonLinesAdapter;
        assert!(adapter.parse_line("   ").is_empty());
    }

    #[test]
    fn benign_stderr_patterns() {
        assert!(is_benign_stderr("Error during discovery for server xyz"));
        assert!(!is_benign_stderr("TypeError: cannot read property"));
    }
}
