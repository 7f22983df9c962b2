//! WebSocket endpoint: each connection joins the room for its project (or
//! the global room) and receives broker envelopes until it disconnects or
//! falls behind.

use super::ServerState;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::Response;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::sync::Arc;
use tracing::debug;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WsParams {
    #[serde(default)]
    pub project_id: Option<String>,
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<WsParams>,
    State(state): State<Arc<ServerState>>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state, params.project_id))
}

async fn handle_socket(socket: WebSocket, state: Arc<ServerState>, room: Option<String>) {
    let (handle, mut rx) = state.broker.join(room).await;
    let (mut sender, mut receiver) = socket.split();

    let writer = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            if sender.send(Message::Text(message.into())).await.is_err() {
                break;
            }
        }
        let _ = sender.close().await;
    });

    // Inbound frames are only consumed to observe the close; clients talk
    // to the gateway over the HTTP API.
    while let Some(frame) = receiver.next().await {
        match frame {
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(other) => debug!("ignoring inbound ws frame: {other:?}"),
        }
    }

    state.broker.leave(&handle).await;
    writer.abort();
}
