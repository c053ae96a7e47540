#![forbid(unsafe_code)]

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use videoroom::media::MediaConfig;
use videoroom::metrics::ServerMetrics;
use videoroom::rooms::RoomServer;
use videoroom::signaling::SignalingServer;

/// How long to keep running after a media worker dies, so already-queued
/// error events can drain before the supervisor restarts us.
const WORKER_DEATH_EXIT_DELAY: Duration = Duration::from_secs(3);

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "videoroom=debug,mediasoup=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("videoroom - starting server");

    let mut media_config = MediaConfig::default();

    // Announced IP for ICE candidates comes from the environment; fall back
    // to loopback for local testing
    if let Ok(ip) = std::env::var("ANNOUNCE_IP") {
        info!("using ANNOUNCE_IP={}", ip);
        let addr = ip
            .parse()
            .map_err(|_| anyhow::anyhow!("invalid ANNOUNCE_IP: {ip}"))?;
        media_config.transport = media_config.transport.with_announced_ip(addr);
    } else {
        let default_ip: std::net::IpAddr = std::net::Ipv4Addr::LOCALHOST.into();
        info!("no ANNOUNCE_IP set, using {}", default_ip);
        media_config.transport = media_config.transport.with_announced_ip(default_ip);
    }

    let metrics = ServerMetrics::new();
    let room_server = Arc::new(RoomServer::new(media_config, metrics.clone()).await?);
    let _engine_listener = room_server.start();
    let mut fatal = room_server.fatal_flag();

    info!("room server and media engine initialized");

    let signaling_server = SignalingServer::new(Arc::clone(&room_server), metrics);
    let port: u16 = std::env::var("PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(3000);

    tokio::select! {
        result = signaling_server.serve(port) => {
            if let Err(e) = result {
                tracing::error!("signaling server error: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("received Ctrl+C, shutting down...");
            room_server.shutdown().await;
        }
        _ = fatal.changed() => {
            tracing::error!(
                "media worker died, exiting in {:?} so a supervisor can restart us",
                WORKER_DEATH_EXIT_DELAY
            );
            tokio::time::sleep(WORKER_DEATH_EXIT_DELAY).await;
            std::process::exit(1);
        }
    }

    info!("server shutdown complete");
    Ok(())
}
