//! Seam to the platform's real-time media transport.
//!
//! The transport owns codecs, ICE, DTLS and SRTP. This crate only drives the
//! description exchange and decides which tracks ride on which connection.

use crate::error::TransportError;
use crate::media::TrackHandle;
use async_trait::async_trait;
use huddle_common::ConnectionId;
use huddle_common::protocol::{IceCandidate, IceServerConfig, MediaKind, SessionDescription};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Outbound slot for one local track on one connection.
///
/// Carries its own enabled flag, separate from the track's, so mute can be
/// enforced per connection.
#[derive(Debug)]
pub struct RtpSender {
    track: TrackHandle,
    enabled: AtomicBool,
}

impl RtpSender {
    pub fn new(track: TrackHandle) -> Arc<Self> {
        let enabled = track.is_enabled();
        Arc::new(Self {
            track,
            enabled: AtomicBool::new(enabled),
        })
    }

    pub fn track(&self) -> &TrackHandle {
        &self.track
    }

    pub fn kind(&self) -> MediaKind {
        self.track.kind()
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }
}

/// One pairwise real-time connection.
#[async_trait]
pub trait PeerConnection: Send + Sync {
    /// An offer without local tracks must still ask to receive audio and video.
    async fn create_offer(&self) -> Result<SessionDescription, TransportError>;
    async fn create_answer(&self) -> Result<SessionDescription, TransportError>;
    async fn set_local_description(&self, description: &SessionDescription) -> Result<(), TransportError>;
    async fn set_remote_description(&self, description: &SessionDescription) -> Result<(), TransportError>;
    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), TransportError>;
    /// Drop a local offer that has not been answered.
    async fn rollback(&self) -> Result<(), TransportError>;

    fn add_track(&self, track: &TrackHandle) -> Result<Arc<RtpSender>, TransportError>;
    fn remove_track(&self, sender: &Arc<RtpSender>) -> Result<(), TransportError>;
    fn senders(&self) -> Vec<Arc<RtpSender>>;

    /// Close the connection. Attached tracks are left running.
    fn close(&self);
    fn is_closed(&self) -> bool;
}

/// Asynchronous notifications raised by a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// A local candidate was gathered and must be sent to the peer.
    LocalCandidate {
        peer: ConnectionId,
        candidate: IceCandidate,
    },
    /// The peer's media arrived on this connection.
    RemoteTrack {
        peer: ConnectionId,
        track_id: String,
        kind: MediaKind,
    },
}

pub trait PeerConnectionFactory: Send + Sync {
    /// Open a connection from `local` toward `peer`. The connection reports
    /// through `events`.
    fn create(
        &self,
        local: ConnectionId,
        peer: ConnectionId,
        ice_servers: &[IceServerConfig],
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Arc<dyn PeerConnection>;
}
