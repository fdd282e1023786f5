//! Client error types.

use huddle_common::ConnectionId;
use huddle_common::protocol::MediaKind;
use std::fmt;
use thiserror::Error;

/// Camera, microphone or display capture could not be acquired.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MediaAccessError {
    #[error("Permission to capture media was denied")]
    PermissionDenied,

    #[error("No {kind:?} device available")]
    NoDevice { kind: MediaKind },

    #[error("Media device error: {0}")]
    Device(String),
}

/// Failure reported by the underlying real-time transport.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{0}")]
pub struct TransportError(pub String);

impl TransportError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Negotiation step that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationStage {
    CreateOffer,
    CreateAnswer,
    SetLocalDescription,
    SetRemoteDescription,
    AddCandidate,
    Rollback,
    AttachTrack,
}

impl fmt::Display for NegotiationStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let stage = match self {
            Self::CreateOffer => "create-offer",
            Self::CreateAnswer => "create-answer",
            Self::SetLocalDescription => "set-local-description",
            Self::SetRemoteDescription => "set-remote-description",
            Self::AddCandidate => "add-candidate",
            Self::Rollback => "rollback",
            Self::AttachTrack => "attach-track",
        };
        f.write_str(stage)
    }
}

/// A description exchange or candidate application failed for one peer.
///
/// The session is left in its last stable state; nothing is retried.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("Negotiation with {peer} failed at {stage}: {message}")]
pub struct NegotiationError {
    pub peer: ConnectionId,
    pub stage: NegotiationStage,
    pub message: String,
}

impl NegotiationError {
    pub fn new(peer: ConnectionId, stage: NegotiationStage, cause: impl fmt::Display) -> Self {
        Self {
            peer,
            stage,
            message: cause.to_string(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Media(#[from] MediaAccessError),

    #[error(transparent)]
    Negotiation(#[from] NegotiationError),

    /// The signaling channel dropped. Every session is gone.
    #[error("Signaling channel lost: {0}")]
    ChannelLost(String),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Not joined to a room")]
    NotJoined,

    #[error("Invalid server URL: {0}")]
    InvalidUrl(String),
}

pub type Result<T> = std::result::Result<T, ClientError>;
