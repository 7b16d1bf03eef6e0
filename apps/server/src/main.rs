//! DLMan control server — the local HTTP + WebSocket surface (§4.I) that
//! the CLI, a browser extension, or any other frontend talks to instead of
//! linking `dlman-core` directly.

mod error;
mod routes;
mod ws;

use axum::extract::connect_info::ConnectInfo;
use axum::http::{header, Method, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, patch, post};
use axum::{Json, Router};
use dlman_core::DlmanCore;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if cfg!(debug_assertions) {
            tracing_subscriber::EnvFilter::new("debug")
        } else {
            tracing_subscriber::EnvFilter::new("info")
        }
    });
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    let data_dir = std::env::var_os("DLMAN_DATA_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|| {
            dirs::data_dir()
                .map(|d| d.join("dlman"))
                .unwrap_or_else(|| PathBuf::from(".dlman"))
        });
    tokio::fs::create_dir_all(&data_dir).await?;

    let core = DlmanCore::new(data_dir).await?;
    let port: u16 = std::env::var("DLMAN_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(core.get_settings().await?.browser_integration_port);

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::PATCH, Method::DELETE, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE]);

    let app = Router::new()
        .route("/ping", get(routes::ping))
        .route("/api/status", get(routes::status))
        .route("/api/downloads", get(routes::list_downloads).post(routes::add_download))
        .route("/api/downloads/batch", post(routes::add_downloads_batch))
        .route("/api/downloads/probe", post(routes::probe))
        .route(
            "/api/downloads/:id",
            get(routes::get_download).patch(routes::patch_download).delete(routes::delete_download),
        )
        .route("/api/downloads/:id/pause", post(routes::pause_download))
        .route("/api/downloads/:id/resume", post(routes::resume_download))
        .route("/api/downloads/:id/cancel", post(routes::cancel_download))
        .route("/api/downloads/:id/retry", post(routes::retry_download))
        .route("/api/queues", get(routes::list_queues).post(routes::create_queue))
        .route(
            "/api/queues/:id",
            patch(routes::update_queue).delete(routes::delete_queue),
        )
        .route("/api/queues/:id/start", post(routes::start_queue))
        .route("/api/queues/:id/stop", post(routes::stop_queue))
        .route("/api/categories", get(routes::list_categories).post(routes::create_category))
        .route(
            "/api/categories/:id",
            patch(routes::update_category).delete(routes::delete_category),
        )
        .route("/api/settings", get(routes::get_settings).post(routes::update_settings))
        .route("/api/export", get(routes::export_snapshot))
        .route("/api/import", post(routes::import_snapshot))
        .route("/ws", get(ws::upgrade))
        .layer(middleware::from_fn(loopback_only))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(core);

    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    tracing::info!(%addr, "control server listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>()).await?;

    Ok(())
}

/// Defense in depth against the process ever being reached from a non-loopback
/// peer, regardless of how the listener was bound: 404s any connection whose
/// observed peer address isn't 127.0.0.1 / ::1 (the testable property in §8).
async fn loopback_only(
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    request: axum::extract::Request,
    next: Next,
) -> Response {
    let loopback = match addr.ip() {
        IpAddr::V4(ip) => ip.is_loopback(),
        IpAddr::V6(ip) => ip.is_loopback(),
    };
    if !loopback {
        return (StatusCode::NOT_FOUND, Json(serde_json::json!({"error": "not found"}))).into_response();
    }
    next.run(request).await
}
