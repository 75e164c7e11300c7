//! # Chat Room Server
//!
//! A WebSocket chat room on top of the `lib_common` room engine.
//!
//! ## Core Responsibilities:
//! - **WebSocket Termination:** axum upgrades `/ws?name=<id>` and hands each
//!   socket to the room as a `Connection`. TLS (axum-server + rustls) is used
//!   when a certificate and key are available.
//! - **Room Lifecycle:** the `LifecycleController` runs the serve loop and the
//!   heartbeat monitor; Ctrl-C or SIGTERM triggers its two-phase shutdown, and
//!   the HTTP front end stops with it.
//! - **Operations:** `/health` for uptime checks, `/stats` for a JSON view of
//!   members, history and delivery counters, and a periodic traffic log.

use anyhow::Result;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;

use lib_common::core::{ChannelAcceptor, Dispatcher, HistoryBuffer, LifecycleController, LogHooks, Registry};

mod chat_logic;
use chat_logic::{config, downstream, logger, monitor};

const TRAFFIC_REPORT_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> Result<()> {
    // Explicitly install the default crypto provider for rustls
    let _ = rustls::crypto::ring::default_provider().install_default();
    dotenvy::dotenv().ok();

    let config = config::load_config();
    let log_dir = config.log_dir.clone().unwrap_or_else(|| PathBuf::from("./logs"));
    let log_level = config.log_level.clone().unwrap_or_else(|| "info".to_string());
    logger::setup_logging(&log_dir, &log_level)?;

    // --- Phase 1: build the room ---
    let room_config = config.room();
    room_config.validate()?;
    log::info!("Room configuration: {:?}", room_config);

    let registry = Arc::new(Registry::with_hooks(Arc::new(LogHooks)));
    let history = Arc::new(HistoryBuffer::new(room_config.history_capacity));
    let dispatcher = Arc::new(Dispatcher::new(registry, history, &room_config));
    let (incoming, acceptor) = ChannelAcceptor::channel(config.accept_backlog.unwrap_or(128));

    // Cancelling the root token (front end failure) also shuts the room down.
    let root = CancellationToken::new();
    let room = LifecycleController::with_parent(room_config, Arc::clone(&dispatcher), &root)?;
    room.start(acceptor)?;

    // --- Phase 2: front end and background consumers ---
    let state = downstream::AppState::new(incoming, Arc::clone(&dispatcher), room.shutdown_token());
    let downstream_handle = {
        let root = root.clone();
        let config = config.clone();
        tokio::spawn(async move {
            let result = downstream::run(config, state).await;
            if let Err(e) = &result {
                log::error!("Downstream server failed: {}. Shutting down.", e);
                root.cancel();
            }
            result
        })
    };
    let monitor_handle = tokio::spawn(monitor::run(
        Arc::clone(&dispatcher),
        TRAFFIC_REPORT_INTERVAL,
        room.shutdown_token(),
    ));

    // --- Phase 3: wait for a signal or for the room to stop on its own ---
    tokio::select! {
        _ = shutdown_signal() => {
            log::info!("Shutdown signal received. Closing the room gracefully...");
        }
        outcome = room.await_termination() => {
            log::warn!("Room stopped without a shutdown signal: {:?}", outcome);
        }
    }

    room.request_shutdown();
    let outcome = room.await_termination().await;

    if let Err(e) = downstream_handle.await {
        log::error!("Downstream server task failed: {}", e);
    }
    if let Err(e) = monitor_handle.await {
        log::error!("Traffic monitor task failed: {}", e);
    }

    let termination = outcome?;
    log::info!("Shutdown complete ({:?}).", termination);
    Ok(())
}

/// Resolves on Ctrl-C, or on SIGTERM on UNIX systems.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            log::error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut term_signal) => {
                term_signal.recv().await;
            }
            Err(e) => {
                log::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
