//! Room-scoped connection broker. Each client owns a bounded outbound
//! queue drained by its socket task; a full queue drops the client so a
//! slow consumer can never stall a broadcast.

use super::Envelope;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::mpsc::{self, Receiver, Sender};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

const CLIENT_QUEUE_CAPACITY: usize = 64;

#[derive(Debug, Clone)]
struct Client {
    id: u64,
    tx: Sender<String>,
}

/// Handle returned on join; used to leave the room on disconnect.
#[derive(Debug, Clone)]
pub struct ClientHandle {
    pub id: u64,
    pub room: Option<String>,
}

#[derive(Default)]
pub struct Broker {
    /// Room key is the project id; `None` subscribers live in `global`.
    rooms: RwLock<HashMap<String, Vec<Client>>>,
    global: RwLock<Vec<Client>>,
    next_id: AtomicU64,
}

impl Broker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a connection; messages arrive on the returned receiver.
    pub async fn join(&self, room: Option<String>) -> (ClientHandle, Receiver<String>) {
        let (tx, rx) = mpsc::channel(CLIENT_QUEUE_CAPACITY);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let client = Client { id, tx };
        match &room {
            Some(key) => {
                let mut rooms = self.rooms.write().await;
                rooms.entry(key.clone()).or_default().push(client);
            }
            None => {
                self.global.write().await.push(client);
            }
        }
        info!("ws client {id} joined room {:?}", room);
        (ClientHandle { id, room }, rx)
    }

    pub async fn leave(&self, handle: &ClientHandle) {
        match &handle.room {
            Some(key) => {
                let mut rooms = self.rooms.write().await;
                if let Some(clients) = rooms.get_mut(key) {
                    clients.retain(|c| c.id != handle.id);
                    if clients.is_empty() {
                        rooms.remove(key);
                    }
                }
            }
            None => {
                self.global.write().await.retain(|c| c.id != handle.id);
            }
        }
        info!("ws client {} left room {:?}", handle.id, handle.room);
    }

    /// Delivers to the project room plus global subscribers. Best-effort:
    /// clients whose queue is full are dropped, never awaited.
    pub async fn broadcast_project(&self, project_id: &str, envelope: &Envelope) {
        let message = envelope.to_json();
        let mut dead: Vec<u64> = Vec::new();
        {
            let rooms = self.rooms.read().await;
            if let Some(clients) = rooms.get(project_id) {
                send_all(clients, &message, &mut dead);
            }
        }
        {
            let global = self.global.read().await;
            send_all(&global, &message, &mut dead);
        }
        if !dead.is_empty() {
            self.evict(&dead).await;
        }
    }

    /// Delivers to every connection regardless of room.
    pub async fn broadcast_all(&self, envelope: &Envelope) {
        let message = envelope.to_json();
        let mut dead: Vec<u64> = Vec::new();
        {
            let rooms = self.rooms.read().await;
            for clients in rooms.values() {
                send_all(clients, &message, &mut dead);
            }
        }
        {
            let global = self.global.read().await;
            send_all(&global, &message, &mut dead);
        }
        if !dead.is_empty() {
            self.evict(&dead).await;
        }
    }

    async fn evict(&self, ids: &[u64]) {
        let mut rooms = self.rooms.write().await;
        for clients in rooms.values_mut() {
            clients.retain(|c| !ids.contains(&c.id));
        }
        rooms.retain(|_, clients| !clients.is_empty());
        drop(rooms);
        self.global.write().await.retain(|c| !ids.contains(&c.id));
    }

    #[cfg(test)]
    pub async fn connection_count(&self) -> usize {
        let rooms = self.rooms.read().await;
        let in_rooms: usize = rooms.values().map(Vec::len).sum();
        in_rooms + self.global.read().await.len()
    }
}

fn send_all(clients: &[Client], message: &str, dead: &mut Vec<u64>) {
    for client in clients {
        match client.tx.try_send(message.to_string()) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                warn!("ws client {} queue full, dropping connection", client.id);
                dead.push(client.id);
            }
            Err(TrySendError::Closed(_)) => {
                debug!("ws client {} already closed", client.id);
                dead.push(client.id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ws::EventType;
    use serde_json::json;

    fn envelope(project: &str) -> Envelope {
        Envelope::new(
            EventType::Update,
            Some(project.to_string()),
            json!({"n": 1}),
            None,
        )
    }

    #[tokio::test]
    async fn room_scoped_delivery() {
        let broker = Broker::new();
        let (_h1, mut rx1) = broker.join(Some("alpha".to_string())).await;
        let (_h2, mut rx2) = broker.join(Some("beta".to_string())).await;
        let (_h3, mut rx3) = broker.join(None).await;

        broker.broadcast_project("alpha", &envelope("alpha")).await;

        let got = rx1.try_recv().unwrap();
        assert!(got.contains("\"projectId\":\"alpha\""));
        assert!(rx2.try_recv().is_err());
        // Global subscribers see every project broadcast.
        assert!(rx3.try_recv().is_ok());
    }

    #[tokio::test]
    async fn broadcast_all_reaches_every_room() {
        let broker = Broker::new();
        let (_h1, mut rx1) = broker.join(Some("alpha".to_string())).await;
        let (_h2, mut rx2) = broker.join(Some("beta".to_string())).await;
        broker.broadcast_all(&envelope("any")).await;
        assert!(rx1.try_recv().is_ok());
        assert!(rx2.try_recv().is_ok());
    }

    #[tokio::test]
    async fn slow_consumer_is_dropped() {
        let broker = Broker::new();
        let (_h, _rx) = broker.join(Some("alpha".to_string())).await;
        // Never drain the receiver; overflow the bounded queue.
        for _ in 0..(CLIENT_QUEUE_CAPACITY + 1) {
            broker.broadcast_project("alpha", &envelope("alpha")).await;
        }
        assert_eq!(broker.connection_count().await, 0);
    }

    #[tokio::test]
    async fn per_connection_order_is_preserved() {
        let broker = Broker::new();
        let (_h, mut rx) = broker.join(Some("alpha".to_string())).await;
        for i in 0..5 {
            let env = Envelope::new(
                EventType::Timeline,
                Some("alpha".to_string()),
                json!({"index": i}),
                None,
            );
            broker.broadcast_project("alpha", &env).await;
        }
        for i in 0..5 {
            let msg = rx.try_recv().unwrap();
            let v: serde_json::Value = serde_json::from_str(&msg).unwrap();
            assert_eq!(v["payload"]["index"], i);
        }
    }

    #[tokio::test]
    async fn leave_removes_client() {
        let broker = Broker::new();
        let (h, _rx) = broker.join(Some("alpha".to_string())).await;
        assert_eq!(broker.connection_count().await, 1);
        broker.leave(&h).await;
        assert_eq!(broker.connection_count().await, 0);
    }
}
