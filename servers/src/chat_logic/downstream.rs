use crate::chat_logic::config::Config;
use crate::chat_logic::transport::WsConnection;
use anyhow::Result;
use axum::{
    extract::{ws::WebSocket, Query, State, WebSocketUpgrade},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use axum_server::tls_rustls::RustlsConfig;
use lib_common::core::{Connection, ConnectionHandle, Dispatcher, Incoming};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};

/// # Application State
///
/// Shared by every route: the sender half of the room's acceptor, the
/// dispatcher for read-only stats, and the room's shutdown token.
#[derive(Clone)]
pub struct AppState {
    incoming: mpsc::Sender<Incoming>,
    dispatcher: Arc<Dispatcher>,
    shutdown: CancellationToken,
}

impl AppState {
    pub fn new(
        incoming: mpsc::Sender<Incoming>,
        dispatcher: Arc<Dispatcher>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            incoming,
            dispatcher,
            shutdown,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct JoinParams {
    name: Option<String>,
}

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .route("/stats", get(stats_handler))
        .layer(cors)
        .with_state(state)
}

pub async fn run(config: Config, state: AppState) -> Result<()> {
    let shutdown = state.shutdown.clone();
    let app = router(state);
    let addr: SocketAddr = config.bind_address().parse()?;

    if let Some((cert_path, key_path)) = tls_paths(&config) {
        let tls_config = RustlsConfig::from_pem_file(cert_path, key_path).await?;
        let handle = axum_server::Handle::new();

        let signal_handle = handle.clone();
        tokio::spawn(async move {
            shutdown.cancelled().await;
            log::info!("Downstream server shutting down.");
            signal_handle.graceful_shutdown(Some(Duration::from_secs(10)));
        });

        log::info!("Downstream server listening on wss://{}/ws", addr);
        axum_server::bind_rustls(addr, tls_config)
            .handle(handle)
            .serve(app.into_make_service())
            .await?;
    } else {
        let listener = tokio::net::TcpListener::bind(&addr).await?;
        log::info!("Downstream server listening on ws://{}/ws", addr);
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                shutdown.cancelled().await;
                log::info!("Downstream server shutting down.");
            })
            .await?;
    }

    Ok(())
}

/// TLS is enabled only when both files are present.
fn tls_paths(config: &Config) -> Option<(PathBuf, PathBuf)> {
    match (&config.tls_cert_path, &config.tls_key_path) {
        (Some(cert), Some(key)) if cert.exists() && key.exists() => Some((cert.clone(), key.clone())),
        _ => {
            log::warn!("TLS certificate or key not found. Serving plain WebSocket.");
            None
        }
    }
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<JoinParams>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    let identity = client_name(params.name);
    ws.on_upgrade(move |socket| handle_socket(socket, identity, state))
}

async fn health_handler() -> impl IntoResponse {
    (axum::http::StatusCode::OK, "OK")
}

async fn stats_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.dispatcher.room_stats())
}

/// The requested name, or `User_` plus eight hex digits.
fn client_name(requested: Option<String>) -> String {
    requested
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| {
            let id = uuid::Uuid::new_v4().simple().to_string();
            format!("User_{}", &id[..8])
        })
}

/// Hands the upgraded socket to the room. From here on the room owns it: the
/// registry keeps the connection alive and closes it on eviction or shutdown.
async fn handle_socket(socket: WebSocket, identity: String, state: AppState) {
    let connection = Arc::new(WsConnection::new(socket));
    let handle: ConnectionHandle = connection.clone();

    if state.shutdown.is_cancelled() || state.incoming.send(Incoming::new(identity.clone(), handle)).await.is_err() {
        log::warn!("Room is not accepting connections. Closing '{}'.", identity);
        connection.close().await;
        return;
    }
    log::info!("Client '{}' connected.", identity);
}
