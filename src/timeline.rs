//! Timeline persistence helpers shared by the shim, the orchestrator and
//! the API. Generic domain events are encoded as `tool = "event:<kind>"`
//! rows with `status = "event"` and a -1 step index.

use crate::db::{Db, TimelineEvent};
use crate::errors::GatewayResult;
use crate::ws::{Broker, Envelope, EventType};
use serde::Serialize;
use serde_json::{json, Value};
use tracing::error;

pub const GENERIC_STEP_INDEX: i64 = -1;

/// API shape for one timeline entry.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TimelineItem {
    pub id: i64,
    pub project_id: String,
    #[serde(rename = "type")]
    pub item_type: String,
    pub payload: Option<Value>,
    pub ts: String,
    pub related_ids: Vec<String>,
}

pub fn to_api_item(ev: &TimelineEvent) -> TimelineItem {
    let item_type = match ev.tool.strip_prefix("event:") {
        Some(kind) => kind.to_string(),
        None => "step".to_string(),
    };
    let payload = ev
        .result_json
        .as_deref()
        .and_then(|raw| serde_json::from_str(raw).ok());
    let related_ids = serde_json::from_str::<Value>(&ev.args_json)
        .ok()
        .and_then(|v| {
            v.get("relatedIds").and_then(|ids| {
                ids.as_array().map(|arr| {
                    arr.iter()
                        .filter_map(|x| x.as_str().map(str::to_string))
                        .collect()
                })
            })
        })
        .unwrap_or_default();
    let ts = ev
        .finished_at
        .clone()
        .unwrap_or_else(|| ev.started_at.clone());
    TimelineItem {
        id: ev.id,
        project_id: ev.project_id.clone(),
        item_type,
        payload,
        ts,
        related_ids,
    }
}

pub fn list(db: &Db, project_id: &str, limit: usize) -> GatewayResult<Vec<TimelineItem>> {
    let rows = db.list_timeline_events(project_id, limit)?;
    Ok(rows.iter().map(to_api_item).collect())
}

/// Persists a generic event row and broadcasts it on the timeline stream.
pub async fn record_event(
    db: &Db,
    broker: &Broker,
    project_id: &str,
    kind: &str,
    payload: Value,
    related_ids: Vec<String>,
    correlation_id: Option<&str>,
) -> GatewayResult<TimelineItem> {
    let ts = crate::db::now_ts();
    let args = json!({ "relatedIds": related_ids });
    let id = db.add_timeline_event(
        project_id,
        GENERIC_STEP_INDEX,
        &format!("event:{kind}"),
        &args.to_string(),
        "event",
        Some(&payload.to_string()),
        correlation_id,
        &ts,
        Some(&ts),
    )?;
    let item = TimelineItem {
        id,
        project_id: project_id.to_string(),
        item_type: kind.to_string(),
        payload: Some(payload.clone()),
        ts: ts.clone(),
        related_ids,
    };

    let envelope = Envelope::new(
        EventType::Timeline,
        Some(project_id.to_string()),
        json!({
            "index": item.id,
            "tool": item.item_type,
            "status": "event",
            "result": payload,
            "timestamp": ts,
            "correlationId": correlation_id,
        }),
        correlation_id.map(str::to_string),
    );
    broker.broadcast_project(project_id, &envelope).await;

    if let Err(e) = db.add_event_log(project_id, kind, &item.payload.clone().unwrap_or(json!({})).to_string()) {
        error!("failed to append event log: {e}");
    }
    Ok(item)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn generic_event_round_trip() {
        let db = Db::open_in_memory().unwrap();
        let broker = Broker::new();
        db.create_project("p", "P", "p").unwrap();

        let item = record_event(
            &db,
            &broker,
            "p",
            "tool_call.started",
            json!({"name": "ping"}),
            vec![],
            Some("c-9"),
        )
        .await
        .unwrap();
        assert_eq!(item.item_type, "tool_call.started");

        let listed = list(&db, "p", 10).unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].item_type, "tool_call.started");
        assert_eq!(listed[0].payload.as_ref().unwrap()["name"], "ping");

        // Generic events close immediately: finished == started.
        let raw = db.get_timeline_event(item.id).unwrap().unwrap();
        assert_eq!(raw.status, "event");
        assert_eq!(raw.finished_at.as_deref(), Some(raw.started_at.as_str()));
        assert_eq!(raw.step_index, GENERIC_STEP_INDEX);

        // Audit log entry written alongside.
        assert_eq!(db.list_event_log("p", 10).unwrap().len(), 1);
    }

    #[test]
    fn plan_step_maps_to_step_type() {
        let db = Db::open_in_memory().unwrap();
        db.create_project("p", "P", "p").unwrap();
        let id = db
            .add_timeline_event("p", 0, "blender.export_fbx", "{}", "running", None, None, &crate::db::now_ts(), None)
            .unwrap();
        let ev = db.get_timeline_event(id).unwrap().unwrap();
        assert_eq!(to_api_item(&ev).item_type, "step");
    }
}
