//! # huddle-client
//!
//! Client side of a Huddle room:
//!
//! - [`engine::NegotiationEngine`] keeps one [`session::PeerSession`] per remote
//!   participant and drives its offer/answer exchange through the relay
//! - [`negotiation`] is the per-session state machine, a pure reducer
//! - [`media::LocalMediaController`] owns captured tracks, mute and gain
//! - [`vad`] turns microphone energy into speaking transitions
//! - [`activity::RoomActivity`] tracks chat, whiteboard, note and highlights
//! - [`client::CollabClient`] ties it together over a [`gateway::SignalingChannel`]
//!
//! The media transport itself sits behind [`transport::PeerConnection`];
//! [`memory`] provides an in-process implementation.

pub mod activity;
pub mod client;
pub mod config;
pub mod engine;
pub mod error;
pub mod gateway;
pub mod media;
pub mod memory;
pub mod negotiation;
pub mod session;
pub mod transport;
pub mod vad;

pub use client::{CollabClient, Command, RoomEvent};
pub use config::ClientConfig;
pub use engine::{NegotiationEngine, SessionEvent};
pub use error::{ClientError, Result};
