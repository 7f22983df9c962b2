//! Typed WebSocket envelopes delivered by the broker.

pub mod broker;

pub use broker::Broker;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventType {
    #[serde(rename = "chat")]
    Chat,
    #[serde(rename = "action")]
    Action,
    #[serde(rename = "update")]
    Update,
    #[serde(rename = "scene")]
    Scene,
    #[serde(rename = "timeline")]
    Timeline,
    #[serde(rename = "log")]
    Log,
    #[serde(rename = "error")]
    Error,
    #[serde(rename = "project")]
    Project,
    #[serde(rename = "plan.generated")]
    PlanGenerated,
    #[serde(rename = "plan.refined")]
    PlanRefined,
    #[serde(rename = "plan.accepted")]
    PlanAccepted,
    #[serde(rename = "plan.edited")]
    PlanEdited,
    #[serde(rename = "task.started")]
    TaskStarted,
    #[serde(rename = "task.progress")]
    TaskProgress,
    #[serde(rename = "task.blocked")]
    TaskBlocked,
    #[serde(rename = "task.completed")]
    TaskCompleted,
    #[serde(rename = "context.updated")]
    ContextUpdated,
    #[serde(rename = "context.generated")]
    ContextGenerated,
    #[serde(rename = "artifact.created")]
    ArtifactCreated,
    #[serde(rename = "artifact.validated")]
    ArtifactValidated,
}

/// Wire shape for every event pushed to UI clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: EventType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    pub payload: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    pub timestamp: String,
}

impl Envelope {
    pub fn new(
        event_type: EventType,
        project_id: Option<String>,
        payload: Value,
        correlation_id: Option<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            event_type,
            project_id,
            payload,
            correlation_id,
            timestamp: Utc::now().to_rfc3339(),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }
}
