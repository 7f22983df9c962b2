use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;

/// One configuration validation failure, keyed by the dotted setting path.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ConfigIssue {
    pub field: String,
    pub message: String,
}

impl ConfigIssue {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// Error taxonomy surfaced across the gateway. Each variant maps to a
/// stable `kind` string on the wire and an HTTP status.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("invalid configuration ({} error(s))", .0.len())]
    ConfigInvalid(Vec<ConfigIssue>),

    #[error("{0} not found")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error("agent process is not running")]
    NotRunning,

    #[error("bridges not ready: {0}")]
    BridgesNotReady(String),

    #[error("port in use: {0}")]
    PortInUse(String),

    #[error("tool not allowed: {0}")]
    ToolNotAllowed(String),

    #[error("schema violation: {0}")]
    SchemaViolation(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("upstream error: {0}")]
    Upstream(String),

    #[error("transport closed: {0}")]
    TransportClosed(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ConfigInvalid(_) => "config_invalid",
            Self::NotFound(_) => "not_found",
            Self::Conflict(_) => "conflict",
            Self::NotRunning => "not_running",
            Self::BridgesNotReady(_) => "bridges_not_ready",
            Self::PortInUse(_) => "port_in_use",
            Self::ToolNotAllowed(_) => "tool_not_allowed",
            Self::SchemaViolation(_) => "schema_violation",
            Self::Timeout(_) => "timeout",
            Self::Upstream(_) => "upstream",
            Self::TransportClosed(_) => "transport_closed",
            Self::Internal(_) => "internal",
        }
    }

    fn status_code(&self) -> StatusCode {
        match self {
            Self::ConfigInvalid(_) | Self::SchemaViolation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::NotRunning | Self::BridgesNotReady(_) | Self::PortInUse(_) => {
                StatusCode::CONFLICT
            }
            Self::ToolNotAllowed(_) => StatusCode::FORBIDDEN,
            Self::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Self::Upstream(_) | Self::TransportClosed(_) => StatusCode::BAD_GATEWAY,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<rusqlite::Error> for GatewayError {
    fn from(e: rusqlite::Error) -> Self {
        GatewayError::Internal(format!("database error: {e}"))
    }
}

impl From<std::io::Error> for GatewayError {
    fn from(e: std::io::Error) -> Self {
        GatewayError::Internal(format!("io error: {e}"))
    }
}

impl From<serde_json::Error> for GatewayError {
    fn from(e: serde_json::Error) -> Self {
        GatewayError::Internal(format!("serialization error: {e}"))
    }
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    error: String,
    kind: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<Vec<ConfigIssue>>,
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        if matches!(self, Self::Internal(_)) {
            // Internal errors carry a generic message to the UI; details stay in logs.
            tracing::error!("internal error: {self}");
        }
        let details = match &self {
            Self::ConfigInvalid(issues) => Some(issues.clone()),
            _ => None,
        };
        let message = match &self {
            Self::Internal(_) => "internal server error".to_string(),
            other => other.to_string(),
        };
        let body = ErrorBody {
            error: message,
            kind: self.kind(),
            details,
        };
        (self.status_code(), Json(body)).into_response()
    }
}

pub type GatewayResult<T> = Result<T, GatewayError>;
