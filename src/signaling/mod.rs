#![forbid(unsafe_code)]

// Signaling module - WebSocket signaling endpoint

pub mod connection;
pub mod protocol;

use crate::metrics::ServerMetrics;
use crate::rooms::RoomServer;
use axum::{
    extract::{ws::WebSocketUpgrade, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

/// How many concurrent signaling connections to admit. Zero would turn
/// every upgrade away, so it falls back to the default.
fn connection_limit() -> usize {
    let limit: usize = std::env::var("MAX_CONNECTIONS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(10_000);
    if limit == 0 {
        warn!("MAX_CONNECTIONS=0 rejects everyone, using default 10000");
        return 10_000;
    }
    limit
}

/// Shared state behind the signaling endpoint
#[derive(Clone)]
pub struct SignalingServer {
    room_server: Arc<RoomServer>,
    metrics: ServerMetrics,
    connection_semaphore: Arc<Semaphore>,
}

impl SignalingServer {
    pub fn new(room_server: Arc<RoomServer>, metrics: ServerMetrics) -> Self {
        let limit = connection_limit();
        info!("admitting up to {} signaling connections", limit);

        Self {
            room_server,
            metrics,
            connection_semaphore: Arc::new(Semaphore::new(limit)),
        }
    }

    /// Assembles the HTTP surface: the WebSocket upgrade plus the health
    /// and metrics probes.
    pub fn router(self) -> Router {
        Router::new()
            .route("/ws", get(ws_handler))
            .route("/health", get(health_handler))
            .route("/metrics", get(metrics_handler))
            .with_state(self)
            .layer(CorsLayer::permissive())
    }

    /// Binds the signaling endpoint and serves it until the process stops.
    ///
    /// # Errors
    /// Returns an error if the port cannot be bound.
    pub async fn serve(self, port: u16) -> anyhow::Result<()> {
        let addr = format!("0.0.0.0:{port}");
        info!("signaling endpoint listening on {}", addr);

        let listener = tokio::net::TcpListener::bind(&addr).await?;
        let app = self.router();

        axum::serve(listener, app).await?;

        Ok(())
    }
}

/// Liveness probe with current registry sizes
async fn health_handler(State(server): State<SignalingServer>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "rooms": server.room_server.room_count(),
        "peers": server.room_server.peer_count(),
    }))
}

/// Prometheus scrape target. When METRICS_TOKEN is set, scrapers must
/// present it as a bearer token.
async fn metrics_handler(State(server): State<SignalingServer>, headers: HeaderMap) -> Response {
    if let Ok(expected) = std::env::var("METRICS_TOKEN") {
        let provided = headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if provided != format!("Bearer {expected}") {
            return StatusCode::UNAUTHORIZED.into_response();
        }
    }

    let body = server
        .metrics
        .render(server.room_server.room_count(), server.room_server.peer_count());
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
        .into_response()
}

/// Upgrades /ws requests into peer connections, one permit each
async fn ws_handler(ws: WebSocketUpgrade, State(server): State<SignalingServer>) -> Response {
    let permit = match server.connection_semaphore.clone().try_acquire_owned() {
        Ok(permit) => permit,
        Err(_) => {
            warn!("connection limit reached, rejecting WebSocket upgrade");
            return (StatusCode::SERVICE_UNAVAILABLE, "Too many connections").into_response();
        }
    };

    ws.max_message_size(65_536)
        .on_failed_upgrade(|error| {
            warn!("WebSocket upgrade failed: {}", error);
        })
        .on_upgrade(move |socket| {
            connection::handle_connection(socket, server.room_server, server.metrics, permit)
        })
}
