//! Endpoint HTTP de statut, lecture seule.
//!
//! Seules les routes `/`, `/health`, `/status`, `/queue`, `/waybar` sont
//! servies, en GET uniquement : chemin inconnu → 404 `{error}`,
//! méthode non-GET → 405. Réponses JSON, `Cache-Control: no-store`.

use crate::daemon::DaemonCore;
use crate::state::DaemonMode;
use axum::{
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Extension, Json, Router,
};
use serde_json::json;
use std::sync::Arc;
use tracing::info;

const NO_STORE: [(header::HeaderName, &str); 2] = [
    (header::CACHE_CONTROL, "no-store"),
    (header::CONTENT_TYPE, "application/json; charset=utf-8"),
];

/// Construit le router de statut.
pub fn status_router(core: Arc<DaemonCore>) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .route("/status", get(status))
        .route("/queue", get(queue))
        .route("/waybar", get(waybar))
        .fallback(not_found)
        .layer(Extension(core))
}

/// Démarre le serveur de statut ; échec de bind = fatal.
pub async fn serve(core: Arc<DaemonCore>) -> crate::error::Result<()> {
    let addr = format!("{}:{}", core.config.status_host, core.config.status_port);
    let listener = tokio::net::TcpListener::bind(&addr).await.map_err(|e| {
        crate::error::Error::Ipc(format!("cannot bind status endpoint {}: {}", addr, e))
    })?;
    info!(addr = %addr, "Status endpoint listening");

    let router = status_router(core.clone());
    let shutdown = core.shutdown.clone();
    axum::serve(listener, router.into_make_service())
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .map_err(|e| crate::error::Error::Ipc(e.to_string()))
}

async fn root(Extension(core): Extension<Arc<DaemonCore>>) -> Response {
    let snapshot = core.status_snapshot();
    (
        StatusCode::OK,
        NO_STORE,
        Json(json!({
            "name": "infinitune-daemon",
            "mode": snapshot.mode,
            "connected": snapshot.connected,
        })),
    )
        .into_response()
}

async fn health(Extension(core): Extension<Arc<DaemonCore>>) -> Response {
    let snapshot = core.status_snapshot();
    (
        StatusCode::OK,
        NO_STORE,
        Json(json!({"healthy": true, "connected": snapshot.connected})),
    )
        .into_response()
}

async fn status(Extension(core): Extension<Arc<DaemonCore>>) -> Response {
    let snapshot = core.status_snapshot();
    (StatusCode::OK, NO_STORE, Json(snapshot)).into_response()
}

async fn queue(Extension(core): Extension<Arc<DaemonCore>>) -> Response {
    let snapshot = core.status_snapshot();
    (
        StatusCode::OK,
        NO_STORE,
        Json(json!({"queue": snapshot.queue})),
    )
        .into_response()
}

/// Vue compacte pour waybar : `{text, tooltip, class}`.
async fn waybar(Extension(core): Extension<Arc<DaemonCore>>) -> Response {
    let snapshot = core.status_snapshot();

    let (text, tooltip) = match &snapshot.current {
        Some(entry) => {
            let title = entry.title.as_deref().unwrap_or("Untitled");
            let artist = entry.artist.as_deref().unwrap_or("Unknown artist");
            (
                format!("{} - {}", artist, title),
                format!(
                    "{} - {} ({})",
                    artist,
                    title,
                    snapshot
                        .local_playlist_name
                        .as_deref()
                        .or(snapshot.room_id.as_deref())
                        .unwrap_or("")
                ),
            )
        }
        None => ("infinitune".to_string(), "nothing playing".to_string()),
    };

    let class = if snapshot.mode == DaemonMode::Idle {
        "idle"
    } else if snapshot.engine.is_playing {
        "playing"
    } else {
        "paused"
    };

    (
        StatusCode::OK,
        NO_STORE,
        Json(json!({"text": text, "tooltip": tooltip, "class": class})),
    )
        .into_response()
}

async fn not_found() -> Response {
    (
        StatusCode::NOT_FOUND,
        NO_STORE,
        Json(json!({"error": "not found"})),
    )
        .into_response()
}
