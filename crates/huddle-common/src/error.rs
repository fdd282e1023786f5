//! Relay error types.
//!
//! Every error has a numeric wire code (sent in `ServerMessage::Error`) and a
//! string code for programmatic handling.

use crate::ids::RoomId;
use crate::protocol::ServerMessage;

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("Room {room_id} is full (max {max} participants)")]
    RoomFull { room_id: RoomId, max: usize },

    #[error("Validation failed: {message}")]
    Validation { message: String },

    #[error("Invalid message: {0}")]
    InvalidMessage(#[from] serde_json::Error),

    #[error("Not a member of room {room_id}")]
    NotInRoom { room_id: RoomId },
}

impl RelayError {
    /// Numeric code carried on the wire.
    pub fn code(&self) -> u32 {
        match self {
            Self::InvalidMessage(_) => 4000,
            Self::Validation { .. } => 4001,
            Self::NotInRoom { .. } => 4003,
            Self::RoomFull { .. } => 4009,
        }
    }

    /// Error code string for programmatic handling by clients.
    pub fn error_code(&self) -> &str {
        match self {
            Self::RoomFull { .. } => "ROOM_FULL",
            Self::Validation { .. } => "VALIDATION_ERROR",
            Self::InvalidMessage(_) => "INVALID_MESSAGE",
            Self::NotInRoom { .. } => "NOT_IN_ROOM",
        }
    }

    /// Wire frame reporting this error to the offending connection.
    pub fn to_message(&self) -> ServerMessage {
        ServerMessage::Error {
            code: self.code(),
            message: self.to_string(),
        }
    }
}

pub type RelayResult<T> = Result<T, RelayError>;
