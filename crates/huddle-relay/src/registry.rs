//! Room registry: the authoritative source of "who is in this room".
//!
//! Two indexes for fast lookups:
//! - `rooms`: room_id → Room (participants keyed by connection id)
//! - `by_connection`: connection_id → rooms it is a member of
//!
//! Every mutation returns the post-mutation membership snapshot, taken under
//! the same write lock, so callers broadcast exactly what the registry holds.
//! Empty rooms are reaped on the spot.

use chrono::{DateTime, Utc};
use huddle_common::config::Capacity;
use huddle_common::error::{RelayError, RelayResult};
use huddle_common::protocol::ParticipantInfo;
use huddle_common::{ConnectionId, RoomId};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;

/// One connected client inside one room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Participant {
    pub connection_id: ConnectionId,
    pub room_id: RoomId,
    pub display_name: String,
    pub joined_at: DateTime<Utc>,
}

impl Participant {
    pub fn info(&self) -> ParticipantInfo {
        ParticipantInfo {
            connection_id: self.connection_id,
            display_name: self.display_name.clone(),
        }
    }
}

#[derive(Debug)]
struct Room {
    participants: HashMap<ConnectionId, Participant>,
}

impl Room {
    fn snapshot(&self) -> Vec<ParticipantInfo> {
        let mut members: Vec<ParticipantInfo> =
            self.participants.values().map(Participant::info).collect();
        members.sort_by_key(|p| p.connection_id);
        members
    }
}

/// Result of a successful join.
#[derive(Debug, Clone)]
pub struct Joined {
    pub participant: Participant,
    /// `false` when the connection was already a member and only its name was refreshed.
    pub is_new: bool,
    /// Full membership after the join, joiner included.
    pub members: Vec<ParticipantInfo>,
}

/// A participant removed from a room, with the membership that remains.
#[derive(Debug, Clone)]
pub struct Departure {
    pub participant: Participant,
    /// Membership after removal. Never contains the departed participant.
    pub remaining: Vec<ParticipantInfo>,
}

#[derive(Default)]
struct Indexes {
    rooms: HashMap<RoomId, Room>,
    by_connection: HashMap<ConnectionId, HashSet<RoomId>>,
}

impl Indexes {
    fn remove(&mut self, connection_id: ConnectionId, room_id: &RoomId) -> Option<Departure> {
        let room = self.rooms.get_mut(room_id)?;
        let participant = room.participants.remove(&connection_id)?;
        let remaining = room.snapshot();

        if room.participants.is_empty() {
            self.rooms.remove(room_id);
            tracing::debug!(room = %room_id, "Reaped empty room");
        }

        if let Some(joined) = self.by_connection.get_mut(&connection_id) {
            joined.remove(room_id);
            if joined.is_empty() {
                self.by_connection.remove(&connection_id);
            }
        }

        Some(Departure {
            participant,
            remaining,
        })
    }
}

/// Shared, cloneable handle to the room registry.
#[derive(Clone)]
pub struct RoomRegistry {
    inner: Arc<RwLock<Indexes>>,
    capacity: Capacity,
}

impl RoomRegistry {
    pub fn new(capacity: Capacity) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Indexes::default())),
            capacity,
        }
    }

    pub fn capacity(&self) -> Capacity {
        self.capacity
    }

    /// Add a connection to a room, creating the room on first join.
    ///
    /// Idempotent per connection: re-joining replaces the display name and
    /// never counts against the capacity.
    pub async fn join(
        &self,
        connection_id: ConnectionId,
        room_id: RoomId,
        display_name: String,
    ) -> RelayResult<Joined> {
        let mut guard = self.inner.write().await;
        let indexes = &mut *guard;

        let current = indexes
            .rooms
            .get(&room_id)
            .map(|r| r.participants.len())
            .unwrap_or(0);
        let already_member = indexes
            .rooms
            .get(&room_id)
            .is_some_and(|r| r.participants.contains_key(&connection_id));

        if !already_member && !self.capacity.admits(current) {
            let max = match self.capacity {
                Capacity::Limited(max) => max,
                Capacity::Unbounded => current,
            };
            tracing::info!(
                connection = %connection_id,
                room = %room_id,
                max,
                "Join rejected, room full"
            );
            return Err(RelayError::RoomFull { room_id, max });
        }

        let room = indexes
            .rooms
            .entry(room_id.clone())
            .or_insert_with(|| Room {
                participants: HashMap::new(),
            });

        let participant = match room.participants.get_mut(&connection_id) {
            Some(existing) => {
                existing.display_name = display_name;
                existing.clone()
            }
            None => {
                let participant = Participant {
                    connection_id,
                    room_id: room_id.clone(),
                    display_name,
                    joined_at: Utc::now(),
                };
                room.participants.insert(connection_id, participant.clone());
                participant
            }
        };
        let members = room.snapshot();

        indexes
            .by_connection
            .entry(connection_id)
            .or_default()
            .insert(room_id.clone());

        tracing::info!(
            connection = %connection_id,
            room = %room_id,
            name = %participant.display_name,
            members = members.len(),
            rejoin = already_member,
            "Participant joined room"
        );

        Ok(Joined {
            participant,
            is_new: !already_member,
            members,
        })
    }

    /// Explicitly leave one room. Returns `None` if the connection was not a member.
    pub async fn leave(&self, connection_id: ConnectionId, room_id: &RoomId) -> Option<Departure> {
        let departure = self.inner.write().await.remove(connection_id, room_id);

        if let Some(ref d) = departure {
            tracing::info!(
                connection = %connection_id,
                room = %room_id,
                remaining = d.remaining.len(),
                "Participant left room"
            );
        }

        departure
    }

    /// Connection lost: remove it from every room it belonged to.
    pub async fn disconnect(&self, connection_id: ConnectionId) -> Vec<Departure> {
        let mut indexes = self.inner.write().await;
        let rooms: Vec<RoomId> = indexes
            .by_connection
            .get(&connection_id)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();

        let departures: Vec<Departure> = rooms
            .iter()
            .filter_map(|room_id| indexes.remove(connection_id, room_id))
            .collect();

        if !departures.is_empty() {
            tracing::info!(
                connection = %connection_id,
                rooms = departures.len(),
                "Disconnected participant removed from rooms"
            );
        }

        departures
    }

    /// Current membership of a room (empty if the room does not exist).
    pub async fn members(&self, room_id: &RoomId) -> Vec<ParticipantInfo> {
        self.inner
            .read()
            .await
            .rooms
            .get(room_id)
            .map(Room::snapshot)
            .unwrap_or_default()
    }

    /// Connection ids of a room's members.
    pub async fn member_ids(&self, room_id: &RoomId) -> Vec<ConnectionId> {
        self.inner
            .read()
            .await
            .rooms
            .get(room_id)
            .map(|r| r.participants.keys().copied().collect())
            .unwrap_or_default()
    }

    pub async fn is_member(&self, connection_id: ConnectionId, room_id: &RoomId) -> bool {
        self.inner
            .read()
            .await
            .by_connection
            .get(&connection_id)
            .is_some_and(|rooms| rooms.contains(room_id))
    }

    pub async fn stats(&self) -> RegistryStats {
        let indexes = self.inner.read().await;
        RegistryStats {
            active_rooms: indexes.rooms.len(),
            total_participants: indexes
                .rooms
                .values()
                .map(|r| r.participants.len())
                .sum(),
        }
    }
}

impl Default for RoomRegistry {
    fn default() -> Self {
        Self::new(Capacity::Unbounded)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RegistryStats {
    pub active_rooms: usize,
    pub total_participants: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn room(name: &str) -> RoomId {
        RoomId::from(name)
    }

    #[tokio::test]
    async fn test_join_is_idempotent_and_renames() {
        let registry = RoomRegistry::default();
        let a = ConnectionId::generate();

        let first = registry.join(a, room("r"), "alice".into()).await.expect("join");
        assert!(first.is_new);

        let again = registry.join(a, room("r"), "alicia".into()).await.expect("rejoin");
        assert!(!again.is_new);
        assert_eq!(again.members.len(), 1);
        assert_eq!(again.members[0].display_name, "alicia");
    }

    #[tokio::test]
    async fn test_leave_snapshot_excludes_leaver() {
        let registry = RoomRegistry::default();
        let (a, b) = (ConnectionId::generate(), ConnectionId::generate());
        registry.join(a, room("r"), "a".into()).await.expect("join a");
        registry.join(b, room("r"), "b".into()).await.expect("join b");

        let departure = registry.leave(a, &room("r")).await.expect("a was a member");
        assert_eq!(departure.participant.connection_id, a);
        assert!(departure.remaining.iter().all(|p| p.connection_id != a));
        assert_eq!(departure.remaining.len(), 1);

        assert!(registry.leave(a, &room("r")).await.is_none());
    }

    #[tokio::test]
    async fn test_disconnect_removes_from_every_room() {
        let registry = RoomRegistry::default();
        let (a, b) = (ConnectionId::generate(), ConnectionId::generate());
        registry.join(a, room("one"), "a".into()).await.expect("join");
        registry.join(a, room("two"), "a".into()).await.expect("join");
        registry.join(b, room("two"), "b".into()).await.expect("join");

        let departures = registry.disconnect(a).await;
        assert_eq!(departures.len(), 2);
        assert!(!registry.is_member(a, &room("one")).await);
        assert!(!registry.is_member(a, &room("two")).await);
        assert_eq!(registry.members(&room("two")).await.len(), 1);
        assert!(registry.disconnect(a).await.is_empty());
    }

    #[tokio::test]
    async fn test_empty_rooms_are_reaped() {
        let registry = RoomRegistry::default();
        let a = ConnectionId::generate();
        registry.join(a, room("r"), "a".into()).await.expect("join");
        assert_eq!(registry.stats().await.active_rooms, 1);

        registry.leave(a, &room("r")).await;
        assert_eq!(
            registry.stats().await,
            RegistryStats {
                active_rooms: 0,
                total_participants: 0
            }
        );
    }

    #[tokio::test]
    async fn test_capacity_rejects_without_mutation() {
        let registry = RoomRegistry::new(Capacity::Limited(2));
        let ids: Vec<ConnectionId> = (0..3).map(|_| ConnectionId::generate()).collect();
        registry.join(ids[0], room("r"), "a".into()).await.expect("first");
        registry.join(ids[1], room("r"), "b".into()).await.expect("second");

        let err = registry
            .join(ids[2], room("r"), "c".into())
            .await
            .expect_err("third is rejected");
        assert!(matches!(err, RelayError::RoomFull { max: 2, .. }));
        assert_eq!(registry.members(&room("r")).await.len(), 2);
        assert!(!registry.is_member(ids[2], &room("r")).await);

        // Existing members may always refresh their name.
        registry
            .join(ids[1], room("r"), "bee".into())
            .await
            .expect("rejoin at capacity");
    }
}
