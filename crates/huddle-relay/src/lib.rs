//! # huddle-relay
//!
//! Signaling relay for Huddle rooms.
//!
//! Architecture: store-less relay over WebSocket
//! - The room registry is the only source of membership truth
//! - Every membership change is broadcast as a full snapshot, never a delta
//! - Negotiation artifacts are forwarded point-to-point by connection id
//! - Chat, whiteboard, notes and presence indicators are fanned out per room
//! - Media never touches the server; peers connect to each other directly

pub mod handler;
pub mod hub;
pub mod registry;
pub mod relay;

use axum::http::{HeaderValue, Method};
use axum::{extract::State, routing::get, Json, Router};
use huddle_common::config::Capacity;
use huddle_common::protocol::IceServerConfig;
use registry::RoomRegistry;
use relay::Relay;
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tower_http::cors::{AllowOrigin, CorsLayer};

/// Relay server state, shared by every connection.
#[derive(Clone)]
pub struct RelayServer {
    pub relay: Relay,
    started_at: Instant,
}

impl RelayServer {
    pub fn new(capacity: Capacity, ice_servers: Vec<IceServerConfig>) -> Self {
        Self {
            relay: Relay::new(RoomRegistry::new(capacity), ice_servers),
            started_at: Instant::now(),
        }
    }

    /// Router with the `/ws` signaling endpoint plus `/health` and `/stats`.
    pub fn build_router(&self, cors: CorsLayer) -> Router {
        Router::new()
            .route("/ws", get(handler::ws_handler))
            .route("/health", get(health_check))
            .route("/stats", get(stats))
            .layer(cors)
            .layer(tower_http::trace::TraceLayer::new_for_http())
            .with_state(Arc::new(self.clone()))
    }

    /// Close every WebSocket so a graceful shutdown is not held open by
    /// long-lived connections. Clients see the channel drop and reconnect.
    pub async fn close_connections(&self) {
        let closed = self.relay.hub().close_all().await;
        tracing::info!(closed, "Closed relay connections");
    }

    pub async fn stats(&self) -> RelayStats {
        let registry = self.relay.registry().stats().await;
        RelayStats {
            active_rooms: registry.active_rooms,
            total_participants: registry.total_participants,
            connections: self.relay.hub().connection_count().await,
        }
    }
}

/// CORS policy for a single allowed origin; `*` allows any.
pub fn cors_layer(allowed_origin: &str) -> Result<CorsLayer, axum::http::header::InvalidHeaderValue> {
    let origin = if allowed_origin == "*" {
        AllowOrigin::any()
    } else {
        AllowOrigin::exact(HeaderValue::from_str(allowed_origin)?)
    };
    Ok(CorsLayer::new()
        .allow_origin(origin)
        .allow_methods([Method::GET, Method::POST]))
}

#[derive(Debug, Serialize)]
pub struct RelayStats {
    pub active_rooms: usize,
    pub total_participants: usize,
    pub connections: usize,
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    uptime_secs: u64,
}

async fn health_check(State(server): State<Arc<RelayServer>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
        uptime_secs: server.started_at.elapsed().as_secs(),
    })
}

async fn stats(State(server): State<Arc<RelayServer>>) -> Json<RelayStats> {
    Json(server.stats().await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    async fn get_json(router: Router, path: &str) -> serde_json::Value {
        let res = router
            .oneshot(Request::get(path).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(res.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health_route() {
        let server = RelayServer::new(Capacity::Unbounded, IceServerConfig::defaults());
        let router = server.build_router(cors_layer("*").unwrap());
        let health = get_json(router, "/health").await;
        assert_eq!(health["status"], "healthy");
        assert_eq!(health["version"], env!("CARGO_PKG_VERSION"));
    }

    #[tokio::test]
    async fn test_stats_route_counts_rooms_and_connections() {
        let server = RelayServer::new(Capacity::Unbounded, IceServerConfig::defaults());
        let a = huddle_common::ConnectionId::generate();
        let _rx = server.relay.hub().register(a).await;
        server
            .relay
            .registry()
            .join(a, "r".into(), "alice".into())
            .await
            .unwrap();

        let router = server.build_router(cors_layer("*").unwrap());
        let stats = get_json(router, "/stats").await;
        assert_eq!(stats["active_rooms"], 1);
        assert_eq!(stats["total_participants"], 1);
        assert_eq!(stats["connections"], 1);
    }

    #[test]
    fn test_cors_layer_accepts_wildcard_and_exact_origin() {
        assert!(cors_layer("*").is_ok());
        assert!(cors_layer("http://localhost:3000").is_ok());
        assert!(cors_layer("bad\norigin").is_err());
    }
}
