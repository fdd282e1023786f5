//! Negotiation engine.
//!
//! One instance per signaling connection. Owns the peer session table and
//! turns relay traffic into transport calls:
//!
//! - membership snapshots are reconciled into sessions (open new, close gone)
//! - offers, answers and candidates are applied to the addressed session
//! - local track changes renegotiate every affected session
//!
//! Each input runs through the session's [`Negotiation`] reducer and the
//! returned steps are performed in order. A failing step restores the state
//! the session had before the input and is reported, never retried.
//!
//! Closing a session closes its connection only. Local tracks belong to the
//! media controller and keep running for the other sessions.

use crate::error::{NegotiationError, NegotiationStage, TransportError};
use crate::media::{LocalTrack, TrackHandle};
use crate::negotiation::{Input, Role, Step};
use crate::session::{push_bounded, PeerSession, PeerSessionTable};
use crate::transport::{PeerConnection, PeerConnectionFactory, TransportEvent};
use huddle_common::ConnectionId;
use huddle_common::protocol::{
    ClientMessage, IceCandidate, IceServerConfig, ParticipantInfo, ServerMessage,
    SessionDescription, TrackAnnouncement, TrackPurpose,
};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Session-level outcome reported to the application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Opened {
        peer: ConnectionId,
        display_name: String,
        role: Role,
    },
    Closed {
        peer: ConnectionId,
    },
    /// Inbound media from `peer`, routed to the slot for `purpose`.
    RemoteMedia {
        peer: ConnectionId,
        track_id: String,
        purpose: TrackPurpose,
    },
    Failed(NegotiationError),
}

pub struct NegotiationEngine {
    local_id: Option<ConnectionId>,
    ice_servers: Vec<IceServerConfig>,
    sessions: PeerSessionTable,
    factory: Arc<dyn PeerConnectionFactory>,
    signaling: mpsc::UnboundedSender<ClientMessage>,
    transport_events: mpsc::UnboundedSender<TransportEvent>,
    /// Candidates from peers we have no session for yet.
    orphan_candidates: HashMap<ConnectionId, VecDeque<IceCandidate>>,
    candidate_limit: usize,
    local_tracks: Vec<LocalTrack>,
    screen_track: Option<TrackHandle>,
}

impl NegotiationEngine {
    pub fn new(
        factory: Arc<dyn PeerConnectionFactory>,
        signaling: mpsc::UnboundedSender<ClientMessage>,
        transport_events: mpsc::UnboundedSender<TransportEvent>,
        candidate_limit: usize,
    ) -> Self {
        Self {
            local_id: None,
            ice_servers: IceServerConfig::defaults(),
            sessions: PeerSessionTable::default(),
            factory,
            signaling,
            transport_events,
            orphan_candidates: HashMap::new(),
            candidate_limit,
            local_tracks: Vec::new(),
            screen_track: None,
        }
    }

    /// Adopt the id and ICE servers assigned by the relay's `welcome`.
    pub fn set_identity(&mut self, local_id: ConnectionId, ice_servers: Vec<IceServerConfig>) {
        self.local_id = Some(local_id);
        self.ice_servers = ice_servers;
    }

    pub fn local_id(&self) -> Option<ConnectionId> {
        self.local_id
    }

    pub fn sessions(&self) -> &PeerSessionTable {
        &self.sessions
    }

    /// Feed one relay message. Messages that are not negotiation traffic are ignored.
    pub async fn handle_server_message(&mut self, message: &ServerMessage) -> Vec<SessionEvent> {
        match message {
            ServerMessage::Membership { participants, .. } => self.reconcile(participants).await,
            ServerMessage::SessionOffer {
                from,
                description,
                tracks,
            } => self.handle_offer(*from, description, tracks).await,
            ServerMessage::SessionAnswer { from, description } => {
                self.handle_answer(*from, description).await
            }
            ServerMessage::IceCandidate { from, candidate } => {
                self.handle_candidate(*from, candidate.clone()).await
            }
            _ => Vec::new(),
        }
    }

    /// Bring the session table in line with an authoritative membership
    /// snapshot. Applying the same snapshot twice changes nothing.
    pub async fn reconcile(&mut self, participants: &[ParticipantInfo]) -> Vec<SessionEvent> {
        let Some(local) = self.local_id else {
            tracing::warn!("Membership received before welcome, ignoring");
            return Vec::new();
        };
        let mut events = Vec::new();

        let present: HashSet<ConnectionId> = participants
            .iter()
            .map(|p| p.connection_id)
            .filter(|id| *id != local)
            .collect();
        for peer in self.sessions.ids() {
            if !present.contains(&peer) && self.teardown(peer) {
                events.push(SessionEvent::Closed { peer });
            }
        }

        for participant in participants.iter().filter(|p| p.connection_id != local) {
            let peer = participant.connection_id;
            if self.open_session(local, peer, &participant.display_name, &mut events) {
                self.drive_reported(peer, Input::Start, None, &mut events).await;
            }
        }
        events
    }

    pub async fn handle_offer(
        &mut self,
        from: ConnectionId,
        description: &SessionDescription,
        tracks: &[TrackAnnouncement],
    ) -> Vec<SessionEvent> {
        let Some(local) = self.local_id else {
            return Vec::new();
        };
        let mut events = Vec::new();
        if !self.sessions.contains(&from) {
            tracing::debug!(peer = %from, "Offer from peer not yet in membership");
            self.open_session(local, from, "", &mut events);
        }
        if let Some(session) = self.sessions.get_mut(&from) {
            session.declare_tracks(tracks);
        }
        self.drive_reported(from, Input::RemoteOffer, Some(description), &mut events)
            .await;
        events
    }

    pub async fn handle_answer(
        &mut self,
        from: ConnectionId,
        description: &SessionDescription,
    ) -> Vec<SessionEvent> {
        let mut events = Vec::new();
        if !self.sessions.contains(&from) {
            tracing::warn!(peer = %from, "Answer for unknown session, ignoring");
            return events;
        }
        self.drive_reported(from, Input::RemoteAnswer, Some(description), &mut events)
            .await;
        events
    }

    /// Apply a remote candidate, or hold it until its session can take it.
    pub async fn handle_candidate(
        &mut self,
        from: ConnectionId,
        candidate: IceCandidate,
    ) -> Vec<SessionEvent> {
        let limit = self.candidate_limit;
        let Some(session) = self.sessions.get_mut(&from) else {
            let queue = self.orphan_candidates.entry(from).or_default();
            if !push_bounded(queue, candidate, limit) {
                tracing::warn!(peer = %from, "Candidate buffer full, dropped oldest");
            }
            return Vec::new();
        };

        if !session.remote_description_set {
            if !session.buffer_candidate(candidate, limit) {
                tracing::warn!(peer = %from, "Candidate buffer full, dropped oldest");
            }
            return Vec::new();
        }

        let connection = Arc::clone(&session.connection);
        match connection.add_ice_candidate(&candidate).await {
            Ok(()) => Vec::new(),
            Err(e) => {
                let err = NegotiationError::new(from, NegotiationStage::AddCandidate, e);
                tracing::warn!(error = %err, "Remote candidate rejected");
                vec![SessionEvent::Failed(err)]
            }
        }
    }

    pub async fn handle_transport_event(&mut self, event: TransportEvent) -> Vec<SessionEvent> {
        match event {
            TransportEvent::LocalCandidate { peer, candidate } => {
                if self.sessions.contains(&peer) {
                    self.signal(ClientMessage::IceCandidate {
                        to: peer,
                        candidate,
                    });
                }
                Vec::new()
            }
            TransportEvent::RemoteTrack {
                peer,
                track_id,
                kind,
            } => {
                let Some(session) = self.sessions.get_mut(&peer) else {
                    return Vec::new();
                };
                let purpose = session.classify_remote_track(&track_id, kind);
                tracing::debug!(peer = %peer, track = %track_id, ?purpose, "Remote media");
                vec![SessionEvent::RemoteMedia {
                    peer,
                    track_id,
                    purpose,
                }]
            }
        }
    }

    /// Replace the camera/microphone tracks offered to peers and renegotiate
    /// every session that gained a track.
    pub async fn set_local_tracks(&mut self, tracks: Vec<LocalTrack>) -> Vec<SessionEvent> {
        self.local_tracks = tracks;
        let mut events = Vec::new();

        for peer in self.sessions.ids() {
            let mut changed = false;
            if let Some(session) = self.sessions.get_mut(&peer) {
                for local in &self.local_tracks {
                    match session.attach_track(&local.track) {
                        Ok(Some(_)) => changed = true,
                        Ok(None) => {}
                        Err(e) => events.push(SessionEvent::Failed(NegotiationError::new(
                            peer,
                            NegotiationStage::AttachTrack,
                            e,
                        ))),
                    }
                }
            }
            if changed {
                self.drive_reported(peer, Input::LocalTracksChanged, None, &mut events)
                    .await;
            }
        }
        events
    }

    pub async fn start_screen_share(&mut self, track: TrackHandle) -> Vec<SessionEvent> {
        self.screen_track = Some(track);
        let mut events = Vec::new();

        for peer in self.sessions.ids() {
            let attached = match (self.sessions.get_mut(&peer), &self.screen_track) {
                (Some(session), Some(screen)) => session.attach_screen(screen),
                _ => Ok(false),
            };
            match attached {
                Ok(true) => {
                    self.drive_reported(peer, Input::LocalTracksChanged, None, &mut events)
                        .await
                }
                Ok(false) => {}
                Err(e) => events.push(SessionEvent::Failed(NegotiationError::new(
                    peer,
                    NegotiationStage::AttachTrack,
                    e,
                ))),
            }
        }
        events
    }

    pub async fn stop_screen_share(&mut self) -> Vec<SessionEvent> {
        self.screen_track = None;
        let mut events = Vec::new();

        for peer in self.sessions.ids() {
            let detached = match self.sessions.get_mut(&peer) {
                Some(session) => session.detach_screen(),
                None => Ok(false),
            };
            match detached {
                Ok(true) => {
                    self.drive_reported(peer, Input::LocalTracksChanged, None, &mut events)
                        .await
                }
                Ok(false) => {}
                Err(e) => events.push(SessionEvent::Failed(NegotiationError::new(
                    peer,
                    NegotiationStage::AttachTrack,
                    e,
                ))),
            }
        }
        events
    }

    /// Close one session. Returns `false` if there was none.
    pub fn teardown(&mut self, peer: ConnectionId) -> bool {
        self.orphan_candidates.remove(&peer);
        let Some(session) = self.sessions.remove(&peer) else {
            return false;
        };
        let (_, steps) = session.negotiation.apply(Input::Close);
        if steps.contains(&Step::CloseConnection) {
            session.connection.close();
        }
        tracing::info!(peer = %peer, "Peer session closed");
        true
    }

    /// Close every session, keeping the local identity.
    pub fn close_all(&mut self) -> Vec<SessionEvent> {
        let events = self
            .sessions
            .ids()
            .into_iter()
            .filter(|peer| self.teardown(*peer))
            .map(|peer| SessionEvent::Closed { peer })
            .collect();
        self.orphan_candidates.clear();
        events
    }

    /// Drop every session, as after a channel loss. The local id is
    /// forgotten; the next `welcome` assigns a new one.
    pub fn reset(&mut self) -> Vec<SessionEvent> {
        let events = self.close_all();
        self.local_id = None;
        events
    }

    /// Forget the local tracks. Used on hang-up, after the media is released.
    pub fn clear_local_media(&mut self) {
        self.local_tracks.clear();
        self.screen_track = None;
    }

    fn open_session(
        &mut self,
        local: ConnectionId,
        peer: ConnectionId,
        display_name: &str,
        events: &mut Vec<SessionEvent>,
    ) -> bool {
        if let Some(session) = self.sessions.get_mut(&peer) {
            if !display_name.is_empty() {
                session.display_name = display_name.to_owned();
            }
            return false;
        }

        let connection =
            self.factory
                .create(local, peer, &self.ice_servers, self.transport_events.clone());
        let mut session = PeerSession::new(peer, local, connection, display_name.to_owned());

        let mut attach_failure = None;
        for local_track in &self.local_tracks {
            if let Err(e) = session.attach_track(&local_track.track) {
                attach_failure = Some(e);
            }
        }
        if let Some(screen) = &self.screen_track {
            if let Err(e) = session.attach_screen(screen) {
                attach_failure = Some(e);
            }
        }
        if let Some(e) = attach_failure {
            events.push(SessionEvent::Failed(NegotiationError::new(
                peer,
                NegotiationStage::AttachTrack,
                e,
            )));
        }
        if let Some(early) = self.orphan_candidates.remove(&peer) {
            session.pending_candidates.extend(early);
        }

        let role = session.role;
        self.sessions.get_or_insert_with(peer, || session);
        tracing::info!(peer = %peer, ?role, "Peer session opened");
        events.push(SessionEvent::Opened {
            peer,
            display_name: display_name.to_owned(),
            role,
        });
        true
    }

    async fn drive_reported(
        &mut self,
        peer: ConnectionId,
        input: Input,
        remote: Option<&SessionDescription>,
        events: &mut Vec<SessionEvent>,
    ) {
        if let Err(err) = self.drive(peer, input, remote).await {
            tracing::warn!(error = %err, "Negotiation failed, session kept in last stable state");
            events.push(SessionEvent::Failed(err));
        }
    }

    async fn drive(
        &mut self,
        peer: ConnectionId,
        input: Input,
        remote: Option<&SessionDescription>,
    ) -> Result<(), NegotiationError> {
        let mut inputs = VecDeque::from([input]);

        while let Some(input) = inputs.pop_front() {
            let Some(session) = self.sessions.get_mut(&peer) else {
                return Ok(());
            };
            let stable = session.negotiation;
            let (next, steps) = stable.apply(input);
            session.negotiation = next;
            tracing::debug!(peer = %peer, ?input, from = ?stable.phase(), to = ?next.phase(), "Negotiation transition");

            // Once a rollback went through, our offer no longer exists.
            let mut restore = stable;
            for step in steps {
                match self.execute(peer, step, remote).await {
                    Ok(follow_up) => {
                        if step == Step::Rollback {
                            restore = stable.rolled_back();
                        }
                        inputs.extend(follow_up);
                    }
                    Err(err) => {
                        if let Some(session) = self.sessions.get_mut(&peer) {
                            session.negotiation = restore;
                        }
                        return Err(err);
                    }
                }
            }
        }
        Ok(())
    }

    async fn execute(
        &mut self,
        peer: ConnectionId,
        step: Step,
        remote: Option<&SessionDescription>,
    ) -> Result<Option<Input>, NegotiationError> {
        use NegotiationStage as Stage;

        let Some(session) = self.sessions.get(&peer) else {
            return Ok(None);
        };
        let connection = Arc::clone(&session.connection);
        let fail = |stage: Stage| move |e: TransportError| NegotiationError::new(peer, stage, e);

        match step {
            Step::SendOffer => {
                let offer = connection
                    .create_offer()
                    .await
                    .map_err(fail(Stage::CreateOffer))?;
                connection
                    .set_local_description(&offer)
                    .await
                    .map_err(fail(Stage::SetLocalDescription))?;
                let tracks = self
                    .sessions
                    .get(&peer)
                    .map(PeerSession::announcements)
                    .unwrap_or_default();
                self.signal(ClientMessage::SessionOffer {
                    to: peer,
                    description: offer,
                    tracks,
                });
                Ok(None)
            }
            Step::AcceptOffer => {
                let offer = remote.ok_or_else(|| {
                    NegotiationError::new(peer, Stage::SetRemoteDescription, "no offer to accept")
                })?;
                connection
                    .set_remote_description(offer)
                    .await
                    .map_err(fail(Stage::SetRemoteDescription))?;
                self.flush_candidates(peer, &connection).await;
                let answer = connection
                    .create_answer()
                    .await
                    .map_err(fail(Stage::CreateAnswer))?;
                connection
                    .set_local_description(&answer)
                    .await
                    .map_err(fail(Stage::SetLocalDescription))?;
                self.signal(ClientMessage::SessionAnswer {
                    to: peer,
                    description: answer,
                });
                Ok(Some(Input::AnswerSent))
            }
            Step::ApplyAnswer => {
                let answer = remote.ok_or_else(|| {
                    NegotiationError::new(peer, Stage::SetRemoteDescription, "no answer to apply")
                })?;
                connection
                    .set_remote_description(answer)
                    .await
                    .map_err(fail(Stage::SetRemoteDescription))?;
                self.flush_candidates(peer, &connection).await;
                Ok(None)
            }
            Step::Rollback => {
                connection
                    .rollback()
                    .await
                    .map_err(fail(Stage::Rollback))?;
                Ok(None)
            }
            Step::CloseConnection => {
                connection.close();
                Ok(None)
            }
        }
    }

    /// Mark the remote description applied and hand over held candidates.
    async fn flush_candidates(&mut self, peer: ConnectionId, connection: &Arc<dyn PeerConnection>) {
        let held: Vec<IceCandidate> = match self.sessions.get_mut(&peer) {
            Some(session) => {
                session.remote_description_set = true;
                session.pending_candidates.drain(..).collect()
            }
            None => return,
        };
        for candidate in held {
            if let Err(e) = connection.add_ice_candidate(&candidate).await {
                tracing::warn!(peer = %peer, error = %e, "Held candidate rejected");
            }
        }
    }

    fn signal(&self, message: ClientMessage) {
        if self.signaling.send(message).is_err() {
            tracing::debug!("Signaling channel closed, dropping outbound message");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::MediaTrack;
    use crate::memory::MemoryNetwork;
    use crate::negotiation::Phase;
    use huddle_common::protocol::MediaKind;

    struct Harness {
        engine: NegotiationEngine,
        network: MemoryNetwork,
        outbound: mpsc::UnboundedReceiver<ClientMessage>,
        local: ConnectionId,
    }

    fn harness() -> Harness {
        let network = MemoryNetwork::new();
        let (signaling, outbound) = mpsc::unbounded_channel();
        let (transport_events, _transport_rx) = mpsc::unbounded_channel();
        let mut engine =
            NegotiationEngine::new(Arc::new(network.clone()), signaling, transport_events, 4);
        let local = ConnectionId::generate();
        engine.set_identity(local, IceServerConfig::defaults());
        Harness {
            engine,
            network,
            outbound,
            local,
        }
    }

    fn participant(id: ConnectionId, name: &str) -> ParticipantInfo {
        ParticipantInfo {
            connection_id: id,
            display_name: name.into(),
        }
    }

    fn tracks() -> Vec<LocalTrack> {
        vec![
            LocalTrack {
                track: MediaTrack::new("mic", MediaKind::Audio),
                purpose: TrackPurpose::Microphone,
            },
            LocalTrack {
                track: MediaTrack::new("cam", MediaKind::Video),
                purpose: TrackPurpose::Camera,
            },
        ]
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<ClientMessage>) -> Vec<ClientMessage> {
        let mut out = Vec::new();
        while let Ok(m) = rx.try_recv() {
            out.push(m);
        }
        out
    }

    #[tokio::test]
    async fn test_same_snapshot_twice_is_idempotent() {
        let mut h = harness();
        let peer = ConnectionId::generate();
        let snapshot = vec![participant(h.local, "me"), participant(peer, "bob")];

        let first = h.engine.reconcile(&snapshot).await;
        let second = h.engine.reconcile(&snapshot).await;

        assert_eq!(
            first.iter().filter(|e| matches!(e, SessionEvent::Opened { .. })).count(),
            1
        );
        assert!(second.is_empty());
        assert_eq!(h.engine.sessions().len(), 1);
    }

    #[tokio::test]
    async fn test_membership_refreshes_cached_name() {
        let mut h = harness();
        let peer = ConnectionId::generate();
        h.engine
            .reconcile(&[participant(h.local, "me"), participant(peer, "bob")])
            .await;
        h.engine
            .reconcile(&[participant(h.local, "me"), participant(peer, "robert")])
            .await;
        assert_eq!(h.engine.sessions().get(&peer).unwrap().display_name, "robert");
    }

    #[tokio::test]
    async fn test_initiator_sends_offer_with_announcements() {
        let mut h = harness();
        h.engine.set_local_tracks(tracks()).await;
        // An id greater than any earlier v7 id makes us the initiator.
        let peer = ConnectionId::generate();
        h.engine
            .reconcile(&[participant(h.local, "me"), participant(peer, "bob")])
            .await;

        let sent = drain(&mut h.outbound);
        let Some(ClientMessage::SessionOffer { to, tracks, .. }) = sent.first() else {
            panic!("expected offer, got {sent:?}");
        };
        assert_eq!(*to, peer);
        assert_eq!(tracks.len(), 2);
    }

    #[tokio::test]
    async fn test_responder_answers_and_flushes_early_candidates() {
        let mut h = harness();
        let peer = ConnectionId::generate();
        let candidate = IceCandidate {
            candidate: "candidate:early".into(),
            sdp_mid: None,
            sdp_m_line_index: Some(0),
        };

        // Candidate before any session exists.
        h.engine.handle_candidate(peer, candidate.clone()).await;
        let events = h
            .engine
            .handle_offer(peer, &SessionDescription::offer("v=0"), &[])
            .await;
        assert!(events.iter().any(|e| matches!(e, SessionEvent::Opened { .. })));

        let conn = h.network.connection(h.local, peer).unwrap();
        assert_eq!(conn.applied_candidates(), vec![candidate]);
        assert!(drain(&mut h.outbound)
            .iter()
            .any(|m| matches!(m, ClientMessage::SessionAnswer { to, .. } if *to == peer)));
    }

    #[tokio::test]
    async fn test_failed_offer_keeps_last_stable_state() {
        let mut h = harness();
        let peer = ConnectionId::generate();
        h.engine
            .handle_offer(peer, &SessionDescription::offer("v=0"), &[])
            .await;
        let before = h.engine.sessions().get(&peer).unwrap().negotiation;

        h.network
            .connection(h.local, peer)
            .unwrap()
            .fail_next_remote_description();
        let events = h
            .engine
            .handle_offer(peer, &SessionDescription::offer("garbage"), &[])
            .await;

        assert!(matches!(
            events.as_slice(),
            [SessionEvent::Failed(NegotiationError {
                stage: NegotiationStage::SetRemoteDescription,
                ..
            })]
        ));
        assert_eq!(h.engine.sessions().get(&peer).unwrap().negotiation, before);
    }

    #[tokio::test]
    async fn test_failed_answer_after_rollback_does_not_wait_for_discarded_offer() {
        let peer = ConnectionId::generate();
        let mut h = harness();
        assert_eq!(Role::for_pair(h.local, peer), Role::Responder);

        h.engine
            .handle_offer(peer, &SessionDescription::offer("v=0"), &[])
            .await;
        h.engine
            .start_screen_share(MediaTrack::new("screen", MediaKind::Video))
            .await;
        let negotiation = h.engine.sessions().get(&peer).unwrap().negotiation;
        assert_eq!(negotiation.phase(), Phase::OfferSent);

        // Competing offer: we roll back, then applying theirs fails.
        let conn = h.network.connection(h.local, peer).unwrap();
        conn.fail_next_remote_description();
        let events = h
            .engine
            .handle_offer(peer, &SessionDescription::offer("v=0 competing"), &[])
            .await;

        assert!(matches!(
            events.as_slice(),
            [SessionEvent::Failed(NegotiationError {
                stage: NegotiationStage::SetRemoteDescription,
                ..
            })]
        ));
        assert_eq!(conn.local_description(), None);
        let negotiation = h.engine.sessions().get(&peer).unwrap().negotiation;
        assert_eq!(negotiation.phase(), Phase::Connected);
        assert!(negotiation.has_pending_renegotiation());
    }

    #[tokio::test]
    async fn test_initiator_without_media_still_offers() {
        let mut h = harness();
        let peer = ConnectionId::generate();
        h.engine
            .reconcile(&[participant(h.local, "me"), participant(peer, "bob")])
            .await;

        let sent = drain(&mut h.outbound);
        let Some(ClientMessage::SessionOffer { to, tracks, .. }) = sent.first() else {
            panic!("expected offer, got {sent:?}");
        };
        assert_eq!(*to, peer);
        assert!(tracks.is_empty());
    }

    #[tokio::test]
    async fn test_teardown_keeps_local_tracks_live() {
        let mut h = harness();
        let local_tracks = tracks();
        h.engine.set_local_tracks(local_tracks.clone()).await;
        let (b, c) = (ConnectionId::generate(), ConnectionId::generate());
        h.engine
            .reconcile(&[
                participant(h.local, "me"),
                participant(b, "b"),
                participant(c, "c"),
            ])
            .await;

        let events = h
            .engine
            .reconcile(&[participant(h.local, "me"), participant(b, "b")])
            .await;
        assert_eq!(events, vec![SessionEvent::Closed { peer: c }]);

        assert!(h.network.connection(h.local, c).unwrap().is_closed());
        assert!(!h.network.connection(h.local, b).unwrap().is_closed());
        assert!(local_tracks.iter().all(|t| t.track.is_live() && t.track.is_enabled()));
    }

    #[tokio::test]
    async fn test_reset_closes_everything_and_forgets_identity() {
        let mut h = harness();
        let peer = ConnectionId::generate();
        h.engine
            .reconcile(&[participant(h.local, "me"), participant(peer, "bob")])
            .await;

        let events = h.engine.reset();
        assert_eq!(events, vec![SessionEvent::Closed { peer }]);
        assert!(h.engine.sessions().is_empty());
        assert_eq!(h.engine.local_id(), None);
    }

    #[tokio::test]
    async fn test_screen_share_renegotiates_connected_session() {
        let mut h = harness();
        let peer = ConnectionId::generate();
        h.engine
            .handle_offer(peer, &SessionDescription::offer("v=0"), &[])
            .await;
        drain(&mut h.outbound);

        h.engine
            .start_screen_share(MediaTrack::new("screen", MediaKind::Video))
            .await;
        let sent = drain(&mut h.outbound);
        let Some(ClientMessage::SessionOffer { tracks, .. }) = sent.first() else {
            panic!("expected renegotiation offer, got {sent:?}");
        };
        assert!(tracks.iter().any(|t| t.purpose == TrackPurpose::Screen));

        // Starting again attaches nothing new.
        h.engine
            .start_screen_share(MediaTrack::new("screen", MediaKind::Video))
            .await;
        assert!(drain(&mut h.outbound).is_empty());
    }
}
