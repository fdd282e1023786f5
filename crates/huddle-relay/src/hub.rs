//! Connection hub: one outbound queue per live connection.
//!
//! The hub is store-less. It holds no messages, only the sender half of each
//! connection's egress queue; the per-connection writer task drains the
//! receiver half onto the WebSocket in order.

use huddle_common::protocol::ServerMessage;
use huddle_common::ConnectionId;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};

#[derive(Clone, Default)]
pub struct ConnectionHub {
    connections: Arc<RwLock<HashMap<ConnectionId, mpsc::UnboundedSender<ServerMessage>>>>,
}

impl ConnectionHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection and get the receiving end of its egress queue.
    pub async fn register(&self, connection_id: ConnectionId) -> mpsc::UnboundedReceiver<ServerMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.connections.write().await.insert(connection_id, tx);
        rx
    }

    pub async fn unregister(&self, connection_id: ConnectionId) {
        self.connections.write().await.remove(&connection_id);
    }

    /// Queue a message for one connection. Returns `false` if it is gone.
    pub async fn send_to(&self, connection_id: ConnectionId, message: ServerMessage) -> bool {
        match self.connections.read().await.get(&connection_id) {
            Some(tx) => tx.send(message).is_ok(),
            None => false,
        }
    }

    /// Queue a message for every listed connection, skipping `except`.
    pub async fn send_many(
        &self,
        targets: &[ConnectionId],
        except: Option<ConnectionId>,
        message: &ServerMessage,
    ) -> usize {
        let connections = self.connections.read().await;
        targets
            .iter()
            .filter(|id| Some(**id) != except)
            .filter_map(|id| connections.get(id))
            .filter(|tx| tx.send(message.clone()).is_ok())
            .count()
    }

    /// Drop every egress queue. Each writer task then closes its socket.
    pub async fn close_all(&self) -> usize {
        self.connections.write().await.drain().count()
    }

    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }
}
