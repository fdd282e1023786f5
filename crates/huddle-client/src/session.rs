//! Peer session table: one record per remote participant.

use crate::error::TransportError;
use crate::media::TrackHandle;
use crate::negotiation::{Negotiation, Role};
use crate::transport::{PeerConnection, RtpSender};
use huddle_common::ConnectionId;
use huddle_common::protocol::{IceCandidate, MediaKind, TrackAnnouncement, TrackPurpose};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

pub struct PeerSession {
    pub peer_id: ConnectionId,
    pub connection: Arc<dyn PeerConnection>,
    pub role: Role,
    /// Copy of the participant's name, refreshed on every membership snapshot.
    pub display_name: String,
    pub negotiation: Negotiation,
    /// Set once an inbound camera feed has been seen.
    pub has_received_primary_video: bool,
    /// Purposes the peer declared for its tracks, by track id.
    pub declared_tracks: HashMap<String, TrackPurpose>,
    pub screen_sender: Option<Arc<RtpSender>>,
    /// Candidates that arrived before the remote description.
    pub pending_candidates: VecDeque<IceCandidate>,
    pub remote_description_set: bool,
}

impl PeerSession {
    pub fn new(
        peer_id: ConnectionId,
        local_id: ConnectionId,
        connection: Arc<dyn PeerConnection>,
        display_name: String,
    ) -> Self {
        let role = Role::for_pair(local_id, peer_id);
        Self {
            peer_id,
            connection,
            role,
            display_name,
            negotiation: Negotiation::new(role),
            has_received_primary_video: false,
            declared_tracks: HashMap::new(),
            screen_sender: None,
            pending_candidates: VecDeque::new(),
            remote_description_set: false,
        }
    }

    fn is_screen_sender(&self, sender: &Arc<RtpSender>) -> bool {
        self.screen_sender
            .as_ref()
            .is_some_and(|screen| Arc::ptr_eq(screen, sender))
    }

    /// Kinds of the outbound tracks already on this connection, screen share excluded.
    pub fn outbound_kinds(&self) -> Vec<MediaKind> {
        self.connection
            .senders()
            .iter()
            .filter(|s| !self.is_screen_sender(s))
            .map(|s| s.kind())
            .collect()
    }

    /// Attach a camera or microphone track unless one of the same kind is
    /// already attached. Returns the new sender, or `None` when guarded.
    pub fn attach_track(
        &mut self,
        track: &TrackHandle,
    ) -> Result<Option<Arc<RtpSender>>, TransportError> {
        if self.outbound_kinds().contains(&track.kind()) {
            return Ok(None);
        }
        let sender = self.connection.add_track(track)?;
        sender.set_enabled(track.is_enabled());
        Ok(Some(sender))
    }

    /// Attach the display-capture track in its own slot.
    pub fn attach_screen(&mut self, track: &TrackHandle) -> Result<bool, TransportError> {
        if self.screen_sender.is_some() {
            return Ok(false);
        }
        self.screen_sender = Some(self.connection.add_track(track)?);
        Ok(true)
    }

    pub fn detach_screen(&mut self) -> Result<bool, TransportError> {
        match self.screen_sender.take() {
            Some(sender) => {
                self.connection.remove_track(&sender)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Purpose announcements for every outbound track, sent with each offer.
    pub fn announcements(&self) -> Vec<TrackAnnouncement> {
        self.connection
            .senders()
            .iter()
            .map(|sender| TrackAnnouncement {
                track_id: sender.track().id().to_owned(),
                purpose: if self.is_screen_sender(sender) {
                    TrackPurpose::Screen
                } else {
                    match sender.kind() {
                        MediaKind::Audio => TrackPurpose::Microphone,
                        MediaKind::Video => TrackPurpose::Camera,
                    }
                },
            })
            .collect()
    }

    pub fn declare_tracks(&mut self, tracks: &[TrackAnnouncement]) {
        for announcement in tracks {
            self.declared_tracks
                .insert(announcement.track_id.clone(), announcement.purpose);
        }
    }

    /// Decide which slot an inbound track feeds.
    ///
    /// Declared purposes win. Undeclared video falls back to arrival order:
    /// the first is the camera, any later one is a screen share.
    pub fn classify_remote_track(&mut self, track_id: &str, kind: MediaKind) -> TrackPurpose {
        let purpose = match self.declared_tracks.get(track_id) {
            Some(purpose) => *purpose,
            None => match kind {
                MediaKind::Audio => TrackPurpose::Microphone,
                MediaKind::Video if self.has_received_primary_video => TrackPurpose::Screen,
                MediaKind::Video => TrackPurpose::Camera,
            },
        };
        if purpose == TrackPurpose::Camera {
            self.has_received_primary_video = true;
        }
        purpose
    }

    /// Queue a candidate, dropping the oldest beyond `limit`.
    /// Returns `false` when something was dropped.
    pub fn buffer_candidate(&mut self, candidate: IceCandidate, limit: usize) -> bool {
        push_bounded(&mut self.pending_candidates, candidate, limit)
    }
}

pub(crate) fn push_bounded<T>(queue: &mut VecDeque<T>, item: T, limit: usize) -> bool {
    queue.push_back(item);
    if queue.len() > limit {
        queue.pop_front();
        return false;
    }
    true
}

/// Owned arena of peer sessions keyed by remote connection id.
/// At most one session exists per peer.
#[derive(Default)]
pub struct PeerSessionTable {
    sessions: HashMap<ConnectionId, PeerSession>,
}

impl PeerSessionTable {
    /// Existing session for `peer`, or a new one from `create`.
    /// The flag is `true` only when the session was created by this call.
    pub fn get_or_insert_with(
        &mut self,
        peer: ConnectionId,
        create: impl FnOnce() -> PeerSession,
    ) -> (&mut PeerSession, bool) {
        let mut created = false;
        let session = self.sessions.entry(peer).or_insert_with(|| {
            created = true;
            create()
        });
        (session, created)
    }

    pub fn get(&self, peer: &ConnectionId) -> Option<&PeerSession> {
        self.sessions.get(peer)
    }

    pub fn get_mut(&mut self, peer: &ConnectionId) -> Option<&mut PeerSession> {
        self.sessions.get_mut(peer)
    }

    pub fn contains(&self, peer: &ConnectionId) -> bool {
        self.sessions.contains_key(peer)
    }

    pub fn remove(&mut self, peer: &ConnectionId) -> Option<PeerSession> {
        self.sessions.remove(peer)
    }

    pub fn ids(&self) -> Vec<ConnectionId> {
        let mut ids: Vec<_> = self.sessions.keys().copied().collect();
        ids.sort();
        ids
    }

    pub fn iter(&self) -> impl Iterator<Item = &PeerSession> {
        self.sessions.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut PeerSession> {
        self.sessions.values_mut()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
