//! In-memory media backend and transport.
//!
//! Used by headless clients (bots, load generators) that only exercise
//! signaling, and by the test suites. Connections created through the same
//! [`MemoryNetwork`] see each other: applying a remote description surfaces
//! the counterpart's outbound tracks as remote tracks, and setting a local
//! description gathers one host candidate.

use crate::error::{MediaAccessError, TransportError};
use crate::media::{AudioAnalyser, MediaDevices, MediaTrack, TrackHandle};
use crate::transport::{PeerConnection, PeerConnectionFactory, RtpSender, TransportEvent};
use async_trait::async_trait;
use huddle_common::ConnectionId;
use huddle_common::protocol::{IceCandidate, IceServerConfig, MediaKind, SessionDescription};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ── Media ────────────────────────────────────────────────────────────────────

/// Capture backend producing fresh in-memory tracks.
#[derive(Default)]
pub struct MemoryDevices {
    deny: bool,
    user_media_calls: AtomicUsize,
    level: Arc<AtomicU8>,
    issued: Mutex<Vec<TrackHandle>>,
}

impl MemoryDevices {
    pub fn new() -> Self {
        Self::default()
    }

    /// Backend that refuses every capture request.
    pub fn denying() -> Self {
        Self {
            deny: true,
            ..Self::default()
        }
    }

    pub fn user_media_calls(&self) -> usize {
        self.user_media_calls.load(Ordering::SeqCst)
    }

    /// Every capture track handed out so far, display capture included.
    pub fn issued_tracks(&self) -> Vec<TrackHandle> {
        lock(&self.issued).clone()
    }

    /// Magnitude reported in every frequency bin by the analyser.
    pub fn set_level(&self, level: u8) {
        self.level.store(level, Ordering::SeqCst);
    }
}

struct FlatAnalyser {
    level: Arc<AtomicU8>,
}

impl AudioAnalyser for FlatAnalyser {
    fn frequency_data(&self, bins: &mut [u8]) {
        bins.fill(self.level.load(Ordering::SeqCst));
    }
}

#[async_trait]
impl MediaDevices for MemoryDevices {
    async fn user_media(&self) -> Result<Vec<TrackHandle>, MediaAccessError> {
        self.user_media_calls.fetch_add(1, Ordering::SeqCst);
        if self.deny {
            return Err(MediaAccessError::PermissionDenied);
        }
        let tracks = vec![
            MediaTrack::new("mic", MediaKind::Audio),
            MediaTrack::new("cam", MediaKind::Video),
        ];
        lock(&self.issued).extend(tracks.iter().cloned());
        Ok(tracks)
    }

    async fn display_media(&self) -> Result<TrackHandle, MediaAccessError> {
        if self.deny {
            return Err(MediaAccessError::PermissionDenied);
        }
        let track = MediaTrack::new("screen", MediaKind::Video);
        lock(&self.issued).push(Arc::clone(&track));
        Ok(track)
    }

    fn analyser(&self, _track: &TrackHandle) -> Result<Arc<dyn AudioAnalyser>, MediaAccessError> {
        Ok(Arc::new(FlatAnalyser {
            level: Arc::clone(&self.level),
        }))
    }
}

// ── Transport ────────────────────────────────────────────────────────────────

/// Registry of live in-memory connections, keyed by (local, remote).
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    links: Arc<Mutex<HashMap<(ConnectionId, ConnectionId), Arc<MemoryConnection>>>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// The connection `local` opened toward `remote`, if any.
    pub fn connection(&self, local: ConnectionId, remote: ConnectionId) -> Option<Arc<MemoryConnection>> {
        lock(&self.links).get(&(local, remote)).cloned()
    }

    /// Every connection ever opened by `local`, closed ones included.
    pub fn connections_of(&self, local: ConnectionId) -> Vec<Arc<MemoryConnection>> {
        lock(&self.links)
            .iter()
            .filter(|((from, _), _)| *from == local)
            .map(|(_, conn)| Arc::clone(conn))
            .collect()
    }
}

impl PeerConnectionFactory for MemoryNetwork {
    fn create(
        &self,
        local: ConnectionId,
        peer: ConnectionId,
        _ice_servers: &[IceServerConfig],
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Arc<dyn PeerConnection> {
        let connection = Arc::new(MemoryConnection {
            local,
            peer,
            network: Some(self.clone()),
            events: Some(events),
            state: Mutex::default(),
            closed: AtomicBool::new(false),
            fail_remote_description: AtomicBool::new(false),
        });
        // A fresh session replaces whatever the pair had before.
        lock(&self.links).insert((local, peer), Arc::clone(&connection));
        connection
    }
}

#[derive(Default)]
struct LinkState {
    senders: Vec<Arc<RtpSender>>,
    local_description: Option<SessionDescription>,
    remote_description: Option<SessionDescription>,
    candidates: Vec<IceCandidate>,
    offers_created: usize,
    gathered: bool,
    delivered: HashSet<String>,
}

pub struct MemoryConnection {
    local: ConnectionId,
    peer: ConnectionId,
    network: Option<MemoryNetwork>,
    events: Option<mpsc::UnboundedSender<TransportEvent>>,
    state: Mutex<LinkState>,
    closed: AtomicBool,
    fail_remote_description: AtomicBool,
}

impl MemoryConnection {
    /// A connection attached to no network. Nothing is ever delivered.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            local: ConnectionId::generate(),
            peer: ConnectionId::generate(),
            network: None,
            events: None,
            state: Mutex::default(),
            closed: AtomicBool::new(false),
            fail_remote_description: AtomicBool::new(false),
        })
    }

    pub fn peer(&self) -> ConnectionId {
        self.peer
    }

    pub fn offers_created(&self) -> usize {
        lock(&self.state).offers_created
    }

    pub fn local_description(&self) -> Option<SessionDescription> {
        lock(&self.state).local_description.clone()
    }

    pub fn remote_description(&self) -> Option<SessionDescription> {
        lock(&self.state).remote_description.clone()
    }

    pub fn applied_candidates(&self) -> Vec<IceCandidate> {
        lock(&self.state).candidates.clone()
    }

    /// Make the next `set_remote_description` fail.
    pub fn fail_next_remote_description(&self) {
        self.fail_remote_description.store(true, Ordering::SeqCst);
    }

    fn emit(&self, event: TransportEvent) {
        if let Some(events) = &self.events {
            let _ = events.send(event);
        }
    }

    /// Surface the counterpart's outbound tracks not yet seen on this side.
    fn deliver_remote_tracks(&self) {
        let Some(counterpart) = self
            .network
            .as_ref()
            .and_then(|net| net.connection(self.peer, self.local))
        else {
            return;
        };
        let remote_senders = counterpart.senders();

        let fresh: Vec<_> = {
            let mut state = lock(&self.state);
            remote_senders
                .iter()
                .filter(|s| state.delivered.insert(s.track().id().to_owned()))
                .map(|s| (s.track().id().to_owned(), s.kind()))
                .collect()
        };
        for (track_id, kind) in fresh {
            self.emit(TransportEvent::RemoteTrack {
                peer: self.peer,
                track_id,
                kind,
            });
        }
    }
}

#[async_trait]
impl PeerConnection for MemoryConnection {
    async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
        let mut state = lock(&self.state);
        state.offers_created += 1;
        Ok(SessionDescription::offer(format!(
            "v=0 o={} offer={} tracks={}",
            self.local,
            state.offers_created,
            state.senders.len()
        )))
    }

    async fn create_answer(&self) -> Result<SessionDescription, TransportError> {
        let state = lock(&self.state);
        if state.remote_description.is_none() {
            return Err(TransportError::new("no remote offer to answer"));
        }
        Ok(SessionDescription::answer(format!(
            "v=0 o={} tracks={}",
            self.local,
            state.senders.len()
        )))
    }

    async fn set_local_description(&self, description: &SessionDescription) -> Result<(), TransportError> {
        let first = {
            let mut state = lock(&self.state);
            state.local_description = Some(description.clone());
            !std::mem::replace(&mut state.gathered, true)
        };
        if first {
            self.emit(TransportEvent::LocalCandidate {
                peer: self.peer,
                candidate: IceCandidate {
                    candidate: format!("candidate:1 1 udp 2130706431 127.0.0.1 9 typ host ufrag {}", self.local),
                    sdp_mid: Some("0".into()),
                    sdp_m_line_index: Some(0),
                },
            });
        }
        Ok(())
    }

    async fn set_remote_description(&self, description: &SessionDescription) -> Result<(), TransportError> {
        if self.fail_remote_description.swap(false, Ordering::SeqCst) {
            return Err(TransportError::new("malformed session description"));
        }
        lock(&self.state).remote_description = Some(description.clone());
        self.deliver_remote_tracks();
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), TransportError> {
        let mut state = lock(&self.state);
        if state.remote_description.is_none() {
            return Err(TransportError::new("candidate before remote description"));
        }
        state.candidates.push(candidate.clone());
        Ok(())
    }

    async fn rollback(&self) -> Result<(), TransportError> {
        lock(&self.state).local_description = None;
        Ok(())
    }

    fn add_track(&self, track: &TrackHandle) -> Result<Arc<RtpSender>, TransportError> {
        if self.is_closed() {
            return Err(TransportError::new("connection closed"));
        }
        let sender = RtpSender::new(Arc::clone(track));
        lock(&self.state).senders.push(Arc::clone(&sender));
        Ok(sender)
    }

    fn remove_track(&self, sender: &Arc<RtpSender>) -> Result<(), TransportError> {
        lock(&self.state).senders.retain(|s| !Arc::ptr_eq(s, sender));
        Ok(())
    }

    fn senders(&self) -> Vec<Arc<RtpSender>> {
        lock(&self.state).senders.clone()
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}
