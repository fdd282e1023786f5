//! Relay wire protocol.
//!
//! Every frame is one JSON text message of the form
//! `{"event": "<kebab-case-name>", "data": {...}}`. Field names are camelCase.
//!
//! The relay treats session descriptions, candidates, strokes, and note html
//! as opaque: it routes them by `to` (directed) or by `roomId` (broadcast)
//! and never looks inside.

use crate::ids::{ConnectionId, RoomId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ── Client → Server ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "event",
    content = "data",
    rename_all = "kebab-case",
    rename_all_fields = "camelCase"
)]
pub enum ClientMessage {
    /// Join (or refresh display name in) a room.
    Join {
        room_id: RoomId,
        display_name: String,
    },

    /// Explicitly leave a room.
    Leave { room_id: RoomId },

    /// Directed: session description offer for one peer.
    SessionOffer {
        to: ConnectionId,
        description: SessionDescription,
        /// Purpose of every outbound track in this offer.
        #[serde(default)]
        tracks: Vec<TrackAnnouncement>,
    },

    /// Directed: session description answer for one peer.
    SessionAnswer {
        to: ConnectionId,
        description: SessionDescription,
    },

    /// Directed: network candidate for one peer.
    IceCandidate {
        to: ConnectionId,
        candidate: IceCandidate,
    },

    ChatMessage {
        room_id: RoomId,
        text: String,
        display_name: String,
        #[serde(default)]
        color: Option<String>,
        #[serde(default)]
        is_system: bool,
    },

    Draw { room_id: RoomId, stroke: Stroke },

    /// Full-document replace of the shared note.
    NoteUpdate { room_id: RoomId, html: String },

    ScreenShareStart { room_id: RoomId },

    ScreenShareStop { room_id: RoomId },

    Speaking { room_id: RoomId, active: bool },

    BoardActive { room_id: RoomId, active: bool },
}

impl ClientMessage {
    /// Room named by a room-broadcast message, if this is one.
    pub fn broadcast_room(&self) -> Option<&RoomId> {
        match self {
            Self::ChatMessage { room_id, .. }
            | Self::Draw { room_id, .. }
            | Self::NoteUpdate { room_id, .. }
            | Self::ScreenShareStart { room_id }
            | Self::ScreenShareStop { room_id }
            | Self::Speaking { room_id, .. }
            | Self::BoardActive { room_id, .. } => Some(room_id),
            _ => None,
        }
    }
}

// ── Server → Client ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "event",
    content = "data",
    rename_all = "kebab-case",
    rename_all_fields = "camelCase"
)]
pub enum ServerMessage {
    /// First frame on every connection: your id and the ICE servers to use.
    Welcome {
        connection_id: ConnectionId,
        ice_servers: Vec<IceServerConfig>,
    },

    /// Full authoritative membership of a room. Never a delta.
    Membership {
        room_id: RoomId,
        participants: Vec<ParticipantInfo>,
    },

    /// Join rejected because the room is at capacity.
    RoomFull { room_id: RoomId, max_participants: usize },

    SessionOffer {
        from: ConnectionId,
        description: SessionDescription,
        #[serde(default)]
        tracks: Vec<TrackAnnouncement>,
    },

    SessionAnswer {
        from: ConnectionId,
        description: SessionDescription,
    },

    IceCandidate {
        from: ConnectionId,
        candidate: IceCandidate,
    },

    /// Chat line stamped by the server; echoed to the sender as well.
    ChatMessage(ChatMessage),

    Draw {
        room_id: RoomId,
        from: ConnectionId,
        stroke: Stroke,
    },

    NoteUpdate {
        room_id: RoomId,
        from: ConnectionId,
        html: String,
    },

    ScreenShareStart { room_id: RoomId, from: ConnectionId },

    ScreenShareStop { room_id: RoomId, from: ConnectionId },

    Speaking {
        room_id: RoomId,
        from: ConnectionId,
        active: bool,
    },

    BoardActive {
        room_id: RoomId,
        from: ConnectionId,
        active: bool,
    },

    Error { code: u32, message: String },
}

/// One entry of a membership snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantInfo {
    pub connection_id: ConnectionId,
    pub display_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub room_id: RoomId,
    /// `None` for system notices.
    pub from: Option<ConnectionId>,
    pub text: String,
    pub display_name: String,
    pub color: Option<String>,
    pub is_system: bool,
    pub timestamp: DateTime<Utc>,
}

impl ChatMessage {
    pub const SYSTEM_NAME: &'static str = "system";

    /// A server-generated notice such as "alice joined the room".
    pub fn system(room_id: RoomId, text: impl Into<String>) -> Self {
        Self {
            room_id,
            from: None,
            text: text.into(),
            display_name: Self::SYSTEM_NAME.into(),
            color: None,
            is_system: true,
            timestamp: Utc::now(),
        }
    }
}

// ── Negotiation artifacts ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
}

/// A session description as produced by the media transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self { kind: SdpType::Offer, sdp: sdp.into() }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self { kind: SdpType::Answer, sdp: sdp.into() }
    }
}

/// A network connectivity candidate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    pub sdp_mid: Option<String>,
    pub sdp_m_line_index: Option<u32>,
}

/// Media kind of a track.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

/// What a track carries. Declared by the sender so the receiver never has to
/// guess from arrival order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackPurpose {
    Microphone,
    Camera,
    Screen,
}

impl TrackPurpose {
    pub fn kind(self) -> MediaKind {
        match self {
            Self::Microphone => MediaKind::Audio,
            Self::Camera | Self::Screen => MediaKind::Video,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackAnnouncement {
    pub track_id: String,
    pub purpose: TrackPurpose,
}

/// ICE server configuration sent to clients in `welcome`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServerConfig {
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl IceServerConfig {
    /// Public STUN servers. Add TURN for clients behind symmetric NAT.
    pub fn defaults() -> Vec<Self> {
        vec![Self::stun(vec![
            "stun:stun.l.google.com:19302".into(),
            "stun:stun1.l.google.com:19302".into(),
        ])]
    }

    pub fn stun(urls: Vec<String>) -> Self {
        Self {
            urls,
            username: None,
            credential: None,
        }
    }
}

// ── Whiteboard ───────────────────────────────────────────────────────────────

pub const DEFAULT_PEN_COLOR: &str = "#ff0000";
pub const DEFAULT_PEN_WIDTH: f64 = 2.0;
pub const DEFAULT_ERASER_SIZE: f64 = 16.0;

/// One whiteboard stroke segment. Strokes are transient: receivers replay them
/// in arrival order and nothing reconciles across clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "kebab-case")]
pub enum Stroke {
    Draw {
        x0: f64,
        y0: f64,
        x1: f64,
        y1: f64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        color: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        width: Option<f64>,
    },
    Erase {
        x0: f64,
        y0: f64,
        x1: f64,
        y1: f64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        size: Option<f64>,
    },
    /// Clears the rectangle spanned by two opposite corners.
    EraseRect { x0: f64, y0: f64, x1: f64, y1: f64 },
}

impl Stroke {
    /// Rectangle erase from any two opposite corners, normalised to
    /// top-left / bottom-right.
    pub fn erase_rect(a: (f64, f64), b: (f64, f64)) -> Self {
        Self::EraseRect {
            x0: a.0.min(b.0),
            y0: a.1.min(b.1),
            x1: a.0.max(b.0),
            y1: a.1.max(b.1),
        }
    }

    /// Fill in defaults and normalise rectangle corners. Applied by receivers
    /// before replay so every client rasterises the same segment.
    pub fn normalized(self) -> Self {
        match self {
            Self::Draw { x0, y0, x1, y1, color, width } => Self::Draw {
                x0,
                y0,
                x1,
                y1,
                color: Some(color.unwrap_or_else(|| DEFAULT_PEN_COLOR.into())),
                width: Some(width.unwrap_or(DEFAULT_PEN_WIDTH)),
            },
            Self::Erase { x0, y0, x1, y1, size } => Self::Erase {
                x0,
                y0,
                x1,
                y1,
                size: Some(size.unwrap_or(DEFAULT_ERASER_SIZE)),
            },
            Self::EraseRect { x0, y0, x1, y1 } => Self::erase_rect((x0, y0), (x1, y1)),
        }
    }
}
