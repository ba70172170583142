use anyhow::{Context, Result};
use chrono::Local;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::signal;
use tracing::{debug, error, info, warn};

use ad_shield::config::Config;
use ad_shield::init::setup_logging;
use ad_shield::server::DnsEngine;
use ad_shield::transport::MAX_DATAGRAM_LEN;

#[tokio::main]
async fn main() -> Result<()> {
    // 1. Load Config
    let config_path = std::env::args().nth(1).unwrap_or("config.toml".to_string());
    let config_exists = std::path::Path::new(&config_path).exists();
    let config = if config_exists {
        Config::load(&config_path).await?
    } else {
        Config::default()
    };

    // 2. Setup Logging
    setup_logging(&config);
    info!("Starting ad-shield...");
    if !config_exists {
        info!("Config file not found, using defaults.");
    }

    // 3. Build Engine
    let engine = Arc::new(DnsEngine::from_config(&config).await?);

    // 4. Initial Filter Load
    match engine.filters().load_all_enabled_filters().await {
        Ok(count) => info!("Filter index ready with {} domains", count),
        Err(e) => error!("Initial filter load failed: {}", e),
    }

    // 5. Stats Reporter
    if config.stats.enable {
        engine
            .stats()
            .spawn_reporter(Duration::from_secs(config.stats.log_interval_seconds.max(1)));
    }

    // 6. Periodic List Refresh
    let refresh_interval = Duration::from_secs(config.filters.refresh_interval_hours.max(1) * 3600);
    let engine_for_refresh = engine.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(refresh_interval);
        // The first tick completes immediately
        interval.tick().await;
        loop {
            interval.tick().await;
            info!("Scheduled filter list update...");
            if let Err(e) = engine_for_refresh.filters().load_all_enabled_filters().await {
                error!("Filter list update failed: {}", e);
            }
        }
    });

    // 7. Profile Schedule Tick
    let engine_for_profiles = engine.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(60));
        loop {
            interval.tick().await;
            let now = Local::now().naive_local();
            if let Err(e) = engine_for_profiles.profile_tick(&now).await {
                warn!("Applying protection profile failed: {}", e);
            }
        }
    });

    // 8. Capture Loop
    let addr: SocketAddr = config
        .listen
        .parse()
        .with_context(|| format!("Invalid listen address '{}'", config.listen))?;
    let socket = Arc::new(UdpSocket::bind(addr).await?);
    info!("Capture socket listening on {}", addr);

    tokio::select! {
        res = capture_loop(socket, engine) => res?,
        _ = signal::ctrl_c() => {
            info!("Shutdown signal received.");
        }
    }

    Ok(())
}

/// Stand-in for the host capture layer: every datagram is a query whose
/// source port identifies the sending app.
async fn capture_loop(socket: Arc<UdpSocket>, engine: Arc<DnsEngine>) -> Result<()> {
    let mut buf = vec![0u8; MAX_DATAGRAM_LEN];
    loop {
        let (len, peer) = socket.recv_from(&mut buf).await?;
        let packet = buf[..len].to_vec();
        let socket = socket.clone();
        let engine = engine.clone();

        tokio::spawn(async move {
            let Some(response) = engine.handle_query(peer.port(), &packet).await else {
                return;
            };
            if let Err(e) = socket.send_to(&response, peer).await {
                debug!("Failed to answer {}: {}", peer, e);
            }
        });
    }
}
