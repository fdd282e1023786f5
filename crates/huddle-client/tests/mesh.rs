//! Several negotiation engines wired through the real relay, with the
//! in-memory transport standing in for the media stack.

use huddle_client::engine::{NegotiationEngine, SessionEvent};
use huddle_client::media::LocalMediaController;
use huddle_client::memory::{MemoryDevices, MemoryNetwork};
use huddle_client::negotiation::{Phase, Role};
use huddle_client::transport::{PeerConnection, TransportEvent};
use huddle_common::ConnectionId;
use huddle_common::config::Capacity;
use huddle_common::protocol::{
    ClientMessage, IceServerConfig, MediaKind, ParticipantInfo, ServerMessage, TrackPurpose,
};
use huddle_relay::registry::RoomRegistry;
use huddle_relay::relay::Relay;
use std::sync::Arc;
use tokio::sync::mpsc;

const ROOM: &str = "room-1";

struct Client {
    id: ConnectionId,
    engine: NegotiationEngine,
    media: LocalMediaController,
    inbox: mpsc::UnboundedReceiver<ServerMessage>,
    outbox: mpsc::UnboundedReceiver<ClientMessage>,
    transport: mpsc::UnboundedReceiver<TransportEvent>,
    events: Vec<SessionEvent>,
    last_membership: Vec<ParticipantInfo>,
}

impl Client {
    fn opened(&self) -> usize {
        self.events
            .iter()
            .filter(|e| matches!(e, SessionEvent::Opened { .. }))
            .count()
    }

    fn closed(&self, peer: ConnectionId) -> usize {
        self.events
            .iter()
            .filter(|e| matches!(e, SessionEvent::Closed { peer: p } if *p == peer))
            .count()
    }

    fn member_ids(&self) -> Vec<ConnectionId> {
        self.last_membership.iter().map(|p| p.connection_id).collect()
    }

    fn phase_toward(&self, peer: ConnectionId) -> Option<Phase> {
        self.engine.sessions().get(&peer).map(|s| s.negotiation.phase())
    }
}

struct Mesh {
    relay: Relay,
    network: MemoryNetwork,
    clients: Vec<Client>,
}

impl Mesh {
    fn new() -> Self {
        Self {
            relay: Relay::new(RoomRegistry::new(Capacity::Unbounded), IceServerConfig::defaults()),
            network: MemoryNetwork::new(),
            clients: Vec::new(),
        }
    }

    /// Connect a client with camera and microphone. Clients get increasing ids.
    async fn connect(&mut self) -> usize {
        self.connect_with_media(true).await
    }

    async fn connect_with_media(&mut self, with_media: bool) -> usize {
        let id = ConnectionId::generate();
        let mut inbox = self.relay.hub().register(id).await;
        self.relay.welcome(id).await;
        let Some(ServerMessage::Welcome {
            connection_id,
            ice_servers,
        }) = inbox.recv().await
        else {
            panic!("expected welcome");
        };

        let (signaling, outbox) = mpsc::unbounded_channel();
        let (transport_tx, transport) = mpsc::unbounded_channel();
        let mut engine =
            NegotiationEngine::new(Arc::new(self.network.clone()), signaling, transport_tx, 64);
        engine.set_identity(connection_id, ice_servers);

        let mut media = LocalMediaController::new(Arc::new(MemoryDevices::new()));
        if with_media {
            media.acquire().await.unwrap();
            engine.set_local_tracks(media.local_tracks()).await;
        }

        self.clients.push(Client {
            id,
            engine,
            media,
            inbox,
            outbox,
            transport,
            events: Vec::new(),
            last_membership: Vec::new(),
        });
        self.clients.len() - 1
    }

    async fn send(&mut self, index: usize, message: ClientMessage) {
        let id = self.clients[index].id;
        self.relay.handle(id, message).await.unwrap();
    }

    async fn join(&mut self, index: usize, name: &str) {
        self.send(
            index,
            ClientMessage::Join {
                room_id: ROOM.into(),
                display_name: name.into(),
            },
        )
        .await;
        self.settle().await;
    }

    /// Deliver everything in flight until every queue is empty.
    async fn settle(&mut self) {
        loop {
            let mut progressed = false;
            for client in self.clients.iter_mut() {
                while let Ok(message) = client.outbox.try_recv() {
                    progressed = true;
                    self.relay.handle(client.id, message).await.unwrap();
                }
                while let Ok(event) = client.transport.try_recv() {
                    progressed = true;
                    let events = client.engine.handle_transport_event(event).await;
                    client.events.extend(events);
                }
                while let Ok(message) = client.inbox.try_recv() {
                    progressed = true;
                    if let ServerMessage::Membership { participants, .. } = &message {
                        client.last_membership = participants.clone();
                    }
                    let events = client.engine.handle_server_message(&message).await;
                    client.events.extend(events);
                }
            }
            if !progressed {
                break;
            }
        }
    }

    fn id(&self, index: usize) -> ConnectionId {
        self.clients[index].id
    }
}

#[tokio::test]
async fn three_clients_call_mute_and_one_leaves() {
    let mut mesh = Mesh::new();
    let a = mesh.connect().await;
    let b = mesh.connect().await;
    let c = mesh.connect().await;
    let (id_a, id_b, id_c) = (mesh.id(a), mesh.id(b), mesh.id(c));
    assert!(id_a < id_b && id_b < id_c);

    mesh.join(a, "alice").await;
    mesh.join(b, "bob").await;
    mesh.join(c, "carol").await;

    // Everyone sees the same three members.
    for client in &mesh.clients {
        let mut members = client.member_ids();
        members.sort();
        assert_eq!(members, vec![id_a, id_b, id_c]);
    }

    // A has the smallest id and initiates toward both others.
    let sessions = mesh.clients[a].engine.sessions();
    assert_eq!(sessions.get(&id_b).unwrap().role, Role::Initiator);
    assert_eq!(sessions.get(&id_c).unwrap().role, Role::Initiator);
    assert_eq!(mesh.clients[b].engine.sessions().get(&id_a).unwrap().role, Role::Responder);
    assert_eq!(mesh.clients[c].engine.sessions().get(&id_a).unwrap().role, Role::Responder);

    // Exactly one offer per pair, from the initiator.
    let net = &mesh.network;
    assert_eq!(net.connection(id_a, id_b).unwrap().offers_created(), 1);
    assert_eq!(net.connection(id_b, id_a).unwrap().offers_created(), 0);
    assert_eq!(net.connection(id_a, id_c).unwrap().offers_created(), 1);
    assert_eq!(net.connection(id_c, id_a).unwrap().offers_created(), 0);

    for (x, y) in [(a, id_b), (a, id_c), (b, id_a), (b, id_c), (c, id_a), (c, id_b)] {
        assert_eq!(mesh.clients[x].phase_toward(y), Some(Phase::Connected));
    }

    // A's camera and microphone reached B with their declared purposes.
    let purposes: Vec<_> = mesh.clients[b]
        .events
        .iter()
        .filter_map(|e| match e {
            SessionEvent::RemoteMedia { peer, purpose, .. } if *peer == id_a => Some(*purpose),
            _ => None,
        })
        .collect();
    assert!(purposes.contains(&TrackPurpose::Camera));
    assert!(purposes.contains(&TrackPurpose::Microphone));

    // A mutes: its audio sender toward B and C is disabled.
    let client_a = &mut mesh.clients[a];
    client_a.media.set_muted(true, client_a.engine.sessions());
    for peer in [id_b, id_c] {
        let conn = mesh.network.connection(id_a, peer).unwrap();
        let audio: Vec<_> = conn
            .senders()
            .into_iter()
            .filter(|s| s.kind() == MediaKind::Audio)
            .collect();
        assert_eq!(audio.len(), 1);
        assert!(!audio[0].is_enabled());
    }

    // C leaves.
    mesh.send(c, ClientMessage::Leave { room_id: ROOM.into() }).await;
    mesh.settle().await;

    for x in [a, b] {
        let mut members = mesh.clients[x].member_ids();
        members.sort();
        assert_eq!(members, vec![id_a, id_b]);
        assert_eq!(mesh.clients[x].closed(id_c), 1);
        assert!(!mesh.clients[x].engine.sessions().contains(&id_c));
    }
    assert!(mesh.network.connection(id_a, id_c).unwrap().is_closed());
    assert!(mesh.network.connection(id_b, id_c).unwrap().is_closed());

    // A↔B is untouched.
    assert!(!mesh.network.connection(id_a, id_b).unwrap().is_closed());
    assert_eq!(mesh.clients[a].phase_toward(id_b), Some(Phase::Connected));

    // A's local tracks are still live; only mute changed the audio.
    for track in mesh.clients[a].media.processed_tracks() {
        assert!(track.is_live());
        assert_eq!(track.is_enabled(), track.kind() == MediaKind::Video);
    }
}

#[tokio::test]
async fn repeated_membership_snapshot_changes_nothing() {
    let mut mesh = Mesh::new();
    let a = mesh.connect().await;
    let b = mesh.connect().await;
    mesh.join(a, "alice").await;
    mesh.join(b, "bob").await;

    let opened: Vec<_> = mesh.clients.iter().map(Client::opened).collect();
    let offers = mesh
        .network
        .connection(mesh.id(a), mesh.id(b))
        .unwrap()
        .offers_created();

    // Re-join with the same name: the relay re-broadcasts the same snapshot.
    mesh.join(b, "bob").await;

    let after: Vec<_> = mesh.clients.iter().map(Client::opened).collect();
    assert_eq!(opened, after);
    assert_eq!(mesh.clients[a].closed(mesh.id(b)), 0);
    assert_eq!(
        mesh.network
            .connection(mesh.id(a), mesh.id(b))
            .unwrap()
            .offers_created(),
        offers
    );
}

#[tokio::test]
async fn late_joiner_session_starts_muted() {
    let mut mesh = Mesh::new();
    let a = mesh.connect().await;
    let b = mesh.connect().await;
    mesh.join(a, "alice").await;

    let client_a = &mut mesh.clients[a];
    client_a.media.set_muted(true, client_a.engine.sessions());

    mesh.join(b, "bob").await;
    let conn = mesh.network.connection(mesh.id(a), mesh.id(b)).unwrap();
    assert!(conn
        .senders()
        .iter()
        .filter(|s| s.kind() == MediaKind::Audio)
        .all(|s| !s.is_enabled()));

    // Unmute restores every layer.
    let client_a = &mut mesh.clients[a];
    client_a.media.set_muted(false, client_a.engine.sessions());
    assert!(conn.senders().iter().all(|s| s.is_enabled()));
    assert_eq!(mesh.clients[a].media.gain(), 1.0);
}

#[tokio::test]
async fn screen_share_is_classified_by_declared_purpose() {
    let mut mesh = Mesh::new();
    let a = mesh.connect().await;
    let b = mesh.connect().await;
    mesh.join(a, "alice").await;
    mesh.join(b, "bob").await;
    let (id_a, id_b) = (mesh.id(a), mesh.id(b));

    // B (responder) shares its screen: renegotiation over the live session.
    let client_b = &mut mesh.clients[b];
    let screen = client_b.media.start_screen_share().await.unwrap();
    client_b.engine.start_screen_share(screen).await;
    mesh.settle().await;

    assert!(mesh.clients[a].events.iter().any(|e| matches!(
        e,
        SessionEvent::RemoteMedia { peer, track_id, purpose: TrackPurpose::Screen }
            if *peer == id_b && track_id == "screen"
    )));
    assert_eq!(mesh.clients[a].phase_toward(id_b), Some(Phase::Connected));
    assert_eq!(mesh.clients[b].phase_toward(id_a), Some(Phase::Connected));
    assert_eq!(mesh.network.connection(id_b, id_a).unwrap().senders().len(), 3);

    // Re-attaching the same camera/microphone adds nothing.
    let client_b = &mut mesh.clients[b];
    client_b.engine.set_local_tracks(client_b.media.local_tracks()).await;
    assert_eq!(mesh.network.connection(id_b, id_a).unwrap().senders().len(), 3);

    // Stopping removes only the screen sender and keeps the session.
    let client_b = &mut mesh.clients[b];
    client_b.media.stop_screen_share();
    client_b.engine.stop_screen_share().await;
    mesh.settle().await;

    let conn = mesh.network.connection(id_b, id_a).unwrap();
    assert_eq!(conn.senders().len(), 2);
    assert!(!conn.is_closed());
    assert_eq!(mesh.clients[b].phase_toward(id_a), Some(Phase::Connected));
}

#[tokio::test]
async fn initiator_without_media_still_receives_peer_media() {
    let mut mesh = Mesh::new();
    let a = mesh.connect_with_media(false).await;
    let b = mesh.connect().await;
    let (id_a, id_b) = (mesh.id(a), mesh.id(b));
    assert!(id_a < id_b);

    mesh.join(a, "alice").await;
    mesh.join(b, "bob").await;

    assert_eq!(mesh.network.connection(id_a, id_b).unwrap().offers_created(), 1);
    assert_eq!(mesh.clients[a].phase_toward(id_b), Some(Phase::Connected));
    assert_eq!(mesh.clients[b].phase_toward(id_a), Some(Phase::Connected));

    let purposes: Vec<_> = mesh.clients[a]
        .events
        .iter()
        .filter_map(|e| match e {
            SessionEvent::RemoteMedia { peer, purpose, .. } if *peer == id_b => Some(*purpose),
            _ => None,
        })
        .collect();
    assert!(purposes.contains(&TrackPurpose::Camera));
    assert!(purposes.contains(&TrackPurpose::Microphone));

    // Nothing flows the other way.
    assert!(!mesh.clients[b]
        .events
        .iter()
        .any(|e| matches!(e, SessionEvent::RemoteMedia { .. })));
}
