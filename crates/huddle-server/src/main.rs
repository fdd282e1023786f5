//! # Huddle Server
//!
//! Single-process relay for Huddle rooms:
//! - `/ws` signaling channel (membership, negotiation, room events)
//! - `/health` and `/stats`
//!
//! All state lives in memory. Media flows peer to peer and never reaches
//! this process.

use clap::Parser;
use huddle_common::config::Capacity;
use huddle_common::protocol::IceServerConfig;
use huddle_relay::{cors_layer, RelayServer};
use std::net::SocketAddr;

/// Command-line overrides for the loaded configuration.
#[derive(Parser, Debug)]
#[command(name = "huddle", version, about = "Signaling relay for Huddle rooms")]
struct Cli {
    /// Listen port.
    #[arg(long, env = "PORT")]
    port: Option<u16>,

    /// Origin allowed by CORS; `*` allows any.
    #[arg(long, env = "CLIENT_ORIGIN")]
    allowed_origin: Option<String>,

    /// Participants per room; 0 = unbounded.
    #[arg(long)]
    max_participants: Option<usize>,

    /// Emit logs as JSON lines.
    #[arg(long)]
    log_json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let config = huddle_common::config::init()?;

    // Initialize tracing (structured logging)
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "huddle=debug,tower_http=debug".into());
    if cli.log_json || config.log.json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .with_thread_ids(true)
            .init();
    }

    tracing::info!("Starting Huddle relay v{}", env!("CARGO_PKG_VERSION"));

    let port = cli.port.unwrap_or(config.server.port);
    let allowed_origin = cli
        .allowed_origin
        .as_deref()
        .unwrap_or(&config.server.allowed_origin);
    let capacity = match cli.max_participants {
        Some(limit) => Capacity::from_limit(limit),
        None => config.rooms.capacity(),
    };
    let ice_servers = if config.ice.stun_urls.is_empty() {
        IceServerConfig::defaults()
    } else {
        vec![IceServerConfig::stun(config.ice.stun_urls.clone())]
    };

    let server = RelayServer::new(capacity, ice_servers);
    let router = server.build_router(cors_layer(allowed_origin)?);
    let addr = SocketAddr::new(config.server.host.parse()?, port);

    tracing::info!(?capacity, %allowed_origin, "Room policy");
    tracing::info!("Relay listening on ws://{addr}/ws");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            server.close_connections().await;
        })
        .await?;

    tracing::info!("Relay stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}
