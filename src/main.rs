mod config;
mod error;
mod events;
mod peer;
mod room;
mod sse;
mod stream;
mod track;
mod whep;
mod whip;

use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::services::{ServeDir, ServeFile};
use tracing::info;
use tracing_subscriber::EnvFilter;

// ─── AppState ───────────────────────────────────────────────────────────────

pub struct AppState {
    pub rooms: room::Rooms,
}

// ─── CORS configuration ────────────────────────────────────────────────────

/// Browsers must be able to read the WHEP `Link` headers cross-origin, so
/// every response header is exposed.
fn build_cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any)
        .expose_headers(Any)
}

// ─── Entry point ────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() {
    // Must happen before any DTLS operation inside the WebRTC stack.
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    // Load the env file before tracing so the log level is available.
    config::load_env();
    let log_level =
        std::env::var("ROOMCAST_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&log_level)),
        )
        .init();

    let cfg = config::Config::from_env();

    let state = Arc::new(AppState {
        rooms: room::Rooms::new(),
    });

    let index = format!("{}/index.html", cfg.static_dir.trim_end_matches('/'));
    let spa = ServeDir::new(&cfg.static_dir).not_found_service(ServeFile::new(index));

    let app = Router::new()
        .route(
            "/api/whip",
            post(whip::whip_handler).delete(whip::finish_whip_handler),
        )
        .route("/api/whep/:streamer_user_id", post(whep::whep_handler))
        .route("/api/room/:room_id", get(sse::room_events_handler))
        .route("/api/sse/:viewer_session_id", get(sse::layer_events_handler))
        .route("/api/layer/:viewer_session_id", post(whep::layer_handler))
        .route("/api/status", get(sse::status_handler))
        .fallback_service(spa)
        .layer(build_cors_layer())
        .with_state(Arc::clone(&state));

    info!("Roomcast listening on http://{}", cfg.http_address);
    let listener = tokio::net::TcpListener::bind(&cfg.http_address)
        .await
        .expect("invalid bind address");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("server error");

    info!("Shutting down, closing all rooms");
    state.rooms.close_all().await;
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("failed to listen for ctrl-c");
}
