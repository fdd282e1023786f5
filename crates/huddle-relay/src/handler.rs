//! Relay WebSocket handler.
//!
//! Connection lifecycle:
//!
//! 1. Client connects to /ws
//! 2. Server assigns a connection id and sends `welcome`
//! 3. Client sends `join` with a room id and display name
//! 4. Server broadcasts the room's full membership to every member
//! 5. Clients exchange offers, answers and candidates through directed frames
//! 6. Client sends `leave` or disconnects → membership re-broadcast
//!
//! Inbound frames are processed one at a time per connection; outbound frames
//! go through the connection's egress queue, so each peer sees them in send order.

use crate::RelayServer;
use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::Response,
};
use futures_util::{SinkExt, StreamExt};
use huddle_common::error::RelayError;
use huddle_common::protocol::ClientMessage;
use huddle_common::ConnectionId;
use std::sync::Arc;

/// WebSocket upgrade handler.
pub async fn ws_handler(ws: WebSocketUpgrade, State(server): State<Arc<RelayServer>>) -> Response {
    ws.on_upgrade(move |socket| handle_connection(socket, server))
}

/// Handle a single relay WebSocket connection.
async fn handle_connection(socket: WebSocket, server: Arc<RelayServer>) {
    let (mut sender, mut receiver) = socket.split();
    let relay = &server.relay;

    let connection_id = ConnectionId::generate();
    let mut egress = relay.hub().register(connection_id).await;

    tracing::debug!(connection = %connection_id, "Relay WebSocket connected");

    // ── Sender task ──────────────────────────────────────────────────────────
    // Drains this connection's egress queue onto the socket.
    let send_task = tokio::spawn(async move {
        while let Some(message) = egress.recv().await {
            let json = match serde_json::to_string(&message) {
                Ok(json) => json,
                Err(e) => {
                    tracing::error!(error = %e, "Failed to serialize server message");
                    continue;
                }
            };
            if sender.send(Message::Text(json.into())).await.is_err() {
                return;
            }
        }
        // Queue closed by the hub: the relay is shutting down.
        let _ = sender.send(Message::Close(None)).await;
    });

    relay.welcome(connection_id).await;

    // ── Receive loop ─────────────────────────────────────────────────────────
    while let Some(Ok(msg)) = receiver.next().await {
        match msg {
            Message::Text(text) => {
                let result = match serde_json::from_str::<ClientMessage>(&text) {
                    Ok(message) => relay.handle(connection_id, message).await,
                    Err(e) => Err(RelayError::InvalidMessage(e)),
                };

                if let Err(e) = result {
                    tracing::warn!(
                        connection = %connection_id,
                        code = e.error_code(),
                        error = %e,
                        "Rejected client message"
                    );
                    relay.hub().send_to(connection_id, e.to_message()).await;
                }
            }
            Message::Close(_) => break,
            _ => {}
        }
    }

    // Cleanup on disconnect
    relay.disconnect(connection_id).await;
    send_task.abort();

    tracing::info!(connection = %connection_id, "Relay WebSocket disconnected");
}
