use std::collections::HashMap;
use std::sync::Arc;

use bittle_common::protocol::Outbound;
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

use crate::store::name_key;

/// Sending half of one connection's outbound frame queue.
pub type Outbox = mpsc::UnboundedSender<Outbound>;

#[derive(Debug, Clone)]
struct ClientEntry {
    conn_id: Uuid,
    outbox: Outbox,
}

/// Logged-in connections by account name. A newer login under the same name
/// replaces the older entry.
#[derive(Debug, Clone, Default)]
pub struct ClientRegistry {
    clients: Arc<RwLock<HashMap<String, ClientEntry>>>,
}

impl ClientRegistry {
    pub async fn register(&self, name: &str, conn_id: Uuid, outbox: Outbox) {
        self.clients.write().await.insert(name_key(name), ClientEntry { conn_id, outbox });
    }

    /// Remove `name` only if it still belongs to `conn_id`.
    pub async fn unregister(&self, name: &str, conn_id: Uuid) {
        let mut clients = self.clients.write().await;
        let key = name_key(name);
        if clients.get(&key).is_some_and(|entry| entry.conn_id == conn_id) {
            clients.remove(&key);
        }
    }

    /// Deliver a frame to the connection logged in as `name`. Returns false
    /// when nobody is logged in under that name or the socket is gone.
    pub async fn send_to(&self, name: &str, frame: Outbound) -> bool {
        let clients = self.clients.read().await;
        match clients.get(&name_key(name)) {
            Some(entry) => entry.outbox.send(frame).is_ok(),
            None => false,
        }
    }

    pub async fn is_connected(&self, name: &str) -> bool {
        self.clients.read().await.contains_key(&name_key(name))
    }
}
