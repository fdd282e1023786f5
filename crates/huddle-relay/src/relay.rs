//! Relay channel: routes client messages by address.
//!
//! - Directed messages (offer, answer, candidate) go to the `to` connection only.
//! - Room broadcasts go to every member of the room except the sender.
//! - Chat is the exception: it is echoed to the sender too, stamped with the
//!   server clock, so every member renders the same timestamp.
//!
//! Payloads (SDP, candidates, strokes, note html) are forwarded untouched.
//!
//! Membership changes and the queueing of their snapshots happen under one
//! lock, so every member receives snapshots in registry order.

use crate::hub::ConnectionHub;
use crate::registry::{Departure, RoomRegistry};
use chrono::Utc;
use huddle_common::error::{RelayError, RelayResult};
use huddle_common::protocol::{ChatMessage, ClientMessage, IceServerConfig, ServerMessage};
use huddle_common::validation::{validate_request, JoinRequest};
use huddle_common::{ConnectionId, RoomId};
use std::sync::Arc;
use tokio::sync::Mutex;

#[derive(Clone)]
pub struct Relay {
    registry: RoomRegistry,
    hub: ConnectionHub,
    ice_servers: Vec<IceServerConfig>,
    membership: Arc<Mutex<()>>,
}

impl Relay {
    pub fn new(registry: RoomRegistry, ice_servers: Vec<IceServerConfig>) -> Self {
        Self {
            registry,
            hub: ConnectionHub::new(),
            ice_servers,
            membership: Arc::new(Mutex::new(())),
        }
    }

    pub fn registry(&self) -> &RoomRegistry {
        &self.registry
    }

    pub fn hub(&self) -> &ConnectionHub {
        &self.hub
    }

    /// Greet a freshly registered connection with its id.
    pub async fn welcome(&self, connection_id: ConnectionId) {
        self.hub
            .send_to(
                connection_id,
                ServerMessage::Welcome {
                    connection_id,
                    ice_servers: self.ice_servers.clone(),
                },
            )
            .await;
    }

    /// Route one inbound message. Errors are reported back to `from` by the caller.
    pub async fn handle(&self, from: ConnectionId, message: ClientMessage) -> RelayResult<()> {
        if let Some(room_id) = message.broadcast_room() {
            if !self.registry.is_member(from, room_id).await {
                tracing::warn!(
                    connection = %from,
                    room = %room_id,
                    "Dropping broadcast from non-member"
                );
                return Err(RelayError::NotInRoom {
                    room_id: room_id.clone(),
                });
            }
        }

        match message {
            ClientMessage::Join {
                room_id,
                display_name,
            } => self.join(from, room_id, display_name).await,

            ClientMessage::Leave { room_id } => {
                let _membership = self.membership.lock().await;
                if let Some(departure) = self.registry.leave(from, &room_id).await {
                    self.announce_departure(departure).await;
                }
                Ok(())
            }

            ClientMessage::SessionOffer {
                to,
                description,
                tracks,
            } => {
                self.forward(
                    to,
                    ServerMessage::SessionOffer {
                        from,
                        description,
                        tracks,
                    },
                )
                .await
            }

            ClientMessage::SessionAnswer { to, description } => {
                self.forward(to, ServerMessage::SessionAnswer { from, description })
                    .await
            }

            ClientMessage::IceCandidate { to, candidate } => {
                self.forward(to, ServerMessage::IceCandidate { from, candidate })
                    .await
            }

            ClientMessage::ChatMessage {
                room_id,
                text,
                display_name,
                color,
                is_system,
            } => {
                let chat = ChatMessage {
                    room_id: room_id.clone(),
                    from: Some(from),
                    text,
                    display_name,
                    color,
                    is_system,
                    timestamp: Utc::now(),
                };
                self.broadcast(&room_id, None, ServerMessage::ChatMessage(chat))
                    .await;
                Ok(())
            }

            ClientMessage::Draw { room_id, stroke } => {
                let msg = ServerMessage::Draw {
                    room_id: room_id.clone(),
                    from,
                    stroke,
                };
                self.broadcast(&room_id, Some(from), msg).await;
                Ok(())
            }

            ClientMessage::NoteUpdate { room_id, html } => {
                let msg = ServerMessage::NoteUpdate {
                    room_id: room_id.clone(),
                    from,
                    html,
                };
                self.broadcast(&room_id, Some(from), msg).await;
                Ok(())
            }

            ClientMessage::ScreenShareStart { room_id } => {
                let msg = ServerMessage::ScreenShareStart {
                    room_id: room_id.clone(),
                    from,
                };
                self.broadcast(&room_id, Some(from), msg).await;
                Ok(())
            }

            ClientMessage::ScreenShareStop { room_id } => {
                let msg = ServerMessage::ScreenShareStop {
                    room_id: room_id.clone(),
                    from,
                };
                self.broadcast(&room_id, Some(from), msg).await;
                Ok(())
            }

            ClientMessage::Speaking { room_id, active } => {
                let msg = ServerMessage::Speaking {
                    room_id: room_id.clone(),
                    from,
                    active,
                };
                self.broadcast(&room_id, Some(from), msg).await;
                Ok(())
            }

            ClientMessage::BoardActive { room_id, active } => {
                let msg = ServerMessage::BoardActive {
                    room_id: room_id.clone(),
                    from,
                    active,
                };
                self.broadcast(&room_id, Some(from), msg).await;
                Ok(())
            }
        }
    }

    /// Connection lost: leave every room and notify the remaining members.
    pub async fn disconnect(&self, connection_id: ConnectionId) {
        self.hub.unregister(connection_id).await;
        let _membership = self.membership.lock().await;
        for departure in self.registry.disconnect(connection_id).await {
            self.announce_departure(departure).await;
        }
    }

    async fn join(
        &self,
        from: ConnectionId,
        room_id: RoomId,
        display_name: String,
    ) -> RelayResult<()> {
        validate_request(&JoinRequest {
            room_id: room_id.as_str(),
            display_name: &display_name,
        })?;
        let display_name = display_name.trim().to_owned();

        let _membership = self.membership.lock().await;
        let joined = match self.registry.join(from, room_id.clone(), display_name).await {
            Ok(joined) => joined,
            Err(RelayError::RoomFull { room_id, max }) => {
                self.hub
                    .send_to(
                        from,
                        ServerMessage::RoomFull {
                            room_id,
                            max_participants: max,
                        },
                    )
                    .await;
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        let targets: Vec<ConnectionId> = joined.members.iter().map(|p| p.connection_id).collect();
        let membership = ServerMessage::Membership {
            room_id: room_id.clone(),
            participants: joined.members,
        };
        self.hub.send_many(&targets, None, &membership).await;

        if joined.is_new {
            let notice = ChatMessage::system(
                room_id,
                format!("{} joined the room", joined.participant.display_name),
            );
            self.hub
                .send_many(&targets, None, &ServerMessage::ChatMessage(notice))
                .await;
        }
        Ok(())
    }

    /// Broadcast the remaining membership, then the departure notice.
    /// The snapshot was taken at removal time, so the leaver is never in it.
    async fn announce_departure(&self, departure: Departure) {
        let Departure {
            participant,
            remaining,
        } = departure;
        let targets: Vec<ConnectionId> = remaining.iter().map(|p| p.connection_id).collect();

        let membership = ServerMessage::Membership {
            room_id: participant.room_id.clone(),
            participants: remaining,
        };
        self.hub.send_many(&targets, None, &membership).await;

        let notice = ChatMessage::system(
            participant.room_id,
            format!("{} left the room", participant.display_name),
        );
        self.hub
            .send_many(&targets, None, &ServerMessage::ChatMessage(notice))
            .await;
    }

    async fn forward(&self, to: ConnectionId, message: ServerMessage) -> RelayResult<()> {
        if !self.hub.send_to(to, message).await {
            // Routine when a peer leaves mid-negotiation.
            tracing::debug!(target_connection = %to, "Directed message for unknown connection dropped");
        }
        Ok(())
    }

    async fn broadcast(&self, room_id: &RoomId, except: Option<ConnectionId>, message: ServerMessage) {
        let members = self.registry.member_ids(room_id).await;
        let delivered = self.hub.send_many(&members, except, &message).await;
        tracing::debug!(room = %room_id, delivered, "Room broadcast");
    }
}
