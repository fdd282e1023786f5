//! Client configuration.

use crate::error::{ClientError, Result};
use std::time::Duration;
use url::Url;

pub const DEFAULT_SERVER_URL: &str = "ws://localhost:5000/ws";

/// Candidates held per peer before a session can take them.
pub const DEFAULT_PENDING_CANDIDATE_LIMIT: usize = 64;

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Relay WebSocket endpoint (`ws://` or `wss://`).
    pub server_url: String,
    /// How often the voice-activity detector samples the microphone.
    pub vad_interval: Duration,
    pub pending_candidate_limit: usize,
    /// Reconnect attempts after a channel loss before giving up.
    pub max_reconnect: u32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: DEFAULT_SERVER_URL.to_owned(),
            vad_interval: Duration::from_millis(50),
            pending_candidate_limit: DEFAULT_PENDING_CANDIDATE_LIMIT,
            max_reconnect: 10,
        }
    }
}

impl ClientConfig {
    pub fn new(server_url: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            ..Self::default()
        }
    }

    pub fn with_vad_interval(mut self, interval: Duration) -> Self {
        self.vad_interval = interval;
        self
    }

    pub fn with_max_reconnect(mut self, attempts: u32) -> Self {
        self.max_reconnect = attempts;
        self
    }

    /// Parsed relay endpoint. Only WebSocket schemes are accepted.
    pub fn endpoint(&self) -> Result<Url> {
        let url =
            Url::parse(&self.server_url).map_err(|e| ClientError::InvalidUrl(e.to_string()))?;
        match url.scheme() {
            "ws" | "wss" => Ok(url),
            other => Err(ClientError::InvalidUrl(format!(
                "unsupported scheme '{other}'"
            ))),
        }
    }
}
