//! # huddle-common
//!
//! Shared primitives for the Huddle relay server and client:
//! connection/room identifiers, the relay wire protocol, configuration,
//! error types, and input validation. No networking lives here.

pub mod config;
pub mod error;
pub mod ids;
pub mod protocol;
pub mod validation;

pub use ids::{ConnectionId, RoomId};
