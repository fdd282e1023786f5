//! Server configuration loaded from defaults, an optional `huddle.toml`,
//! and environment variables.
//!
//! Precedence: env vars > .env file > huddle.toml > defaults.
//! Environment keys use the `HUDDLE` prefix and `__` as the section
//! separator, e.g. `HUDDLE_SERVER__PORT=5000`.

use config::builder::DefaultState;
use config::ConfigBuilder;
use serde::Deserialize;
use std::sync::OnceLock;

static CONFIG: OnceLock<AppConfig> = OnceLock::new();

/// Initialize the global configuration from the environment.
///
/// Calling this more than once returns the configuration loaded first.
pub fn init() -> Result<&'static AppConfig, config::ConfigError> {
    // Load .env file if present (development)
    let _ = dotenvy::dotenv();

    if let Some(cfg) = CONFIG.get() {
        return Ok(cfg);
    }

    let cfg = defaults()?
        .add_source(config::File::with_name("huddle").required(false))
        .add_source(
            config::Environment::with_prefix("HUDDLE")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("ice.stun_urls")
                .try_parsing(true),
        )
        .build()?;

    let app_config: AppConfig = cfg.try_deserialize()?;
    Ok(CONFIG.get_or_init(|| app_config))
}

/// Builder pre-loaded with every default value.
pub fn defaults() -> Result<ConfigBuilder<DefaultState>, config::ConfigError> {
    config::Config::builder()
        .set_default("server.host", "0.0.0.0")?
        .set_default("server.port", 5000)?
        .set_default("server.allowed_origin", "http://localhost:3000")?
        .set_default("rooms.max_participants", 0)? // 0 = unbounded
        .set_default(
            "ice.stun_urls",
            vec![
                "stun:stun.l.google.com:19302",
                "stun:stun1.l.google.com:19302",
            ],
        )?
        .set_default("log.json", false)
}

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub rooms: RoomsConfig,
    pub ice: IceConfig,
    pub log: LogConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Origin allowed by CORS. `*` allows any origin.
    pub allowed_origin: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RoomsConfig {
    /// Maximum participants per room; `0` means no limit.
    pub max_participants: usize,
}

impl RoomsConfig {
    pub fn capacity(&self) -> Capacity {
        Capacity::from_limit(self.max_participants)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct IceConfig {
    pub stun_urls: Vec<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LogConfig {
    /// Emit JSON log lines instead of the human-readable format.
    pub json: bool,
}

/// Per-room participant cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Capacity {
    #[default]
    Unbounded,
    Limited(usize),
}

impl Capacity {
    /// `0` is treated as "no limit".
    pub fn from_limit(limit: usize) -> Self {
        match limit {
            0 => Self::Unbounded,
            n => Self::Limited(n),
        }
    }

    /// Whether a room currently holding `current` participants accepts one more.
    pub fn admits(self, current: usize) -> bool {
        match self {
            Self::Unbounded => true,
            Self::Limited(max) => current < max,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use config::{File, FileFormat};

    #[test]
    fn test_defaults_deserialize() {
        let cfg: AppConfig = defaults()
            .and_then(|b| b.build())
            .and_then(|c| c.try_deserialize())
            .expect("defaults are complete");
        assert_eq!(cfg.server.port, 5000);
        assert_eq!(cfg.server.allowed_origin, "http://localhost:3000");
        assert_eq!(cfg.rooms.capacity(), Capacity::Unbounded);
        assert_eq!(cfg.ice.stun_urls.len(), 2);
        assert!(!cfg.log.json);
    }

    #[test]
    fn test_file_overrides_defaults() {
        let toml = "[rooms]\nmax_participants = 2\n[server]\nport = 7000\n";
        let cfg: AppConfig = defaults()
            .map(|b| b.add_source(File::from_str(toml, FileFormat::Toml)))
            .and_then(|b| b.build())
            .and_then(|c| c.try_deserialize())
            .expect("valid overrides");
        assert_eq!(cfg.server.port, 7000);
        assert_eq!(cfg.rooms.capacity(), Capacity::Limited(2));
    }

    #[test]
    fn test_capacity_admits() {
        assert!(Capacity::Unbounded.admits(10_000));
        assert!(Capacity::Limited(2).admits(1));
        assert!(!Capacity::Limited(2).admits(2));
    }
}
