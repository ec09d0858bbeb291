//! API REST de pilotage de la génération (consommée par l'UI web et le
//! daemon en mode local).

use axum::{
    extract::{Path, Query},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::supervisor::Pipeline;
use itnstore::{NewPlaylist, Playlist, PlaylistMode, Song, UserRating};

/// Router `/api` de la génération.
pub fn generation_api_router() -> Router {
    Router::new()
        .route("/api/playlists", get(list_playlists).post(create_playlist))
        .route(
            "/api/playlists/{playlist_id}",
            get(get_playlist).delete(delete_playlist),
        )
        .route("/api/playlists/{playlist_id}/steer", post(steer_playlist))
        .route(
            "/api/playlists/{playlist_id}/heartbeat",
            post(heartbeat_playlist),
        )
        .route("/api/playlists/{playlist_id}/close", post(close_playlist))
        .route("/api/playlists/{playlist_id}/queue", get(playlist_queue))
        .route(
            "/api/playlists/{playlist_id}/position",
            post(update_position),
        )
        .route(
            "/api/playlists/{playlist_id}/interrupt",
            post(inject_interrupt),
        )
        .route("/api/songs/{song_id}/rate", post(rate_song))
        .route("/api/songs/{song_id}/retry", post(retry_song))
        .route("/api/songs/{song_id}/played", post(song_played))
        .route("/api/songs/{song_id}/audio", get(song_audio))
        .route("/api/songs/{song_id}/cover", get(song_cover))
        .route("/api/queues", get(queue_snapshots))
}

/// Résumé d'une playlist (listings).
#[derive(Debug, Serialize, ToSchema)]
pub struct PlaylistSummaryResponse {
    pub id: String,
    pub playlist_key: String,
    pub name: String,
    pub mode: String,
    pub status: String,
    pub prompt: String,
    pub prompt_epoch: i64,
    pub current_order_index: i64,
    pub generated_count: i64,
    pub last_seen_at: DateTime<Utc>,
}

impl From<Playlist> for PlaylistSummaryResponse {
    fn from(p: Playlist) -> Self {
        Self {
            id: p.id,
            playlist_key: p.playlist_key,
            name: p.name,
            mode: p.mode.as_str().to_string(),
            status: p.status.as_str().to_string(),
            prompt: p.prompt,
            prompt_epoch: p.prompt_epoch,
            current_order_index: p.current_order_index,
            generated_count: p.generated_count,
            last_seen_at: p.last_seen_at,
        }
    }
}

/// Réponse détaillée (inclut les morceaux).
#[derive(Debug, Serialize, ToSchema)]
pub struct PlaylistDetailResponse {
    #[serde(flatten)]
    #[schema(inline)]
    pub summary: PlaylistSummaryResponse,
    pub songs: Vec<SongResponse>,
}

/// Morceau exposé par l'API.
#[derive(Debug, Serialize, ToSchema)]
pub struct SongResponse {
    pub id: String,
    pub playlist_id: String,
    pub order_index: i64,
    pub prompt_epoch: i64,
    pub is_interrupt: bool,
    pub status: String,
    pub title: Option<String>,
    pub artist: Option<String>,
    pub caption: Option<String>,
    pub audio_duration: Option<f64>,
    pub audio_url: Option<String>,
    pub cover_url: Option<String>,
    pub user_rating: Option<String>,
    pub error_message: Option<String>,
}

impl From<Song> for SongResponse {
    fn from(s: Song) -> Self {
        Self {
            id: s.id,
            playlist_id: s.playlist_id,
            order_index: s.order_index,
            prompt_epoch: s.prompt_epoch,
            is_interrupt: s.is_interrupt,
            status: s.status.as_str().to_string(),
            title: s.metadata.title,
            artist: s.metadata.artist,
            caption: s.metadata.caption,
            audio_duration: s.metadata.audio_duration,
            audio_url: s.audio_url,
            cover_url: s.cover_url,
            user_rating: s.user_rating.map(|r| r.as_str().to_string()),
            error_message: s.error_message,
        }
    }
}

/// Requête de création de playlist.
#[derive(Debug, Deserialize, ToSchema)]
pub struct CreatePlaylistRequest {
    pub playlist_key: String,
    pub name: Option<String>,
    /// "endless" (défaut) ou "oneshot".
    pub mode: Option<String>,
    pub prompt: String,
}

/// Requête de pilotage (édition du prompt).
#[derive(Debug, Deserialize, ToSchema)]
pub struct SteerRequest {
    pub prompt: String,
}

/// Réponse de pilotage.
#[derive(Debug, Serialize, ToSchema)]
pub struct SteerResponse {
    pub new_epoch: i64,
}

/// Requête de vote.
#[derive(Debug, Deserialize, ToSchema)]
pub struct RateRequest {
    /// "up", "down" ou null pour effacer.
    pub rating: Option<String>,
}

/// Position du consommateur.
#[derive(Debug, Deserialize, ToSchema)]
pub struct PositionRequest {
    pub order_index: i64,
}

/// Injection d'un interrupt.
#[derive(Debug, Deserialize, ToSchema)]
pub struct InterruptRequest {
    pub prompt: String,
}

/// Filtre des listings de playlists.
#[derive(Debug, Default, Deserialize, utoipa::IntoParams)]
pub struct ListQuery {
    /// Limiter à une playlist_key précise.
    #[serde(default)]
    pub key: Option<String>,
}

/// Réponse d'erreur REST générique.
#[derive(Debug, Serialize, ToSchema)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

#[utoipa::path(
    get,
    path = "/api/playlists",
    tag = "playlists",
    params(ListQuery),
    responses(
        (status = 200, description = "Liste des playlists", body = [PlaylistSummaryResponse])
    )
)]
pub async fn list_playlists(Query(query): Query<ListQuery>) -> Response {
    let store = itnstore::get_store();
    let result = match query.key {
        Some(key) => store
            .get_playlist_by_key(&key)
            .map(|p| p.into_iter().collect::<Vec<_>>()),
        None => store.list_playlists(),
    };

    match result {
        Ok(playlists) => {
            let payload: Vec<PlaylistSummaryResponse> = playlists
                .into_iter()
                .map(PlaylistSummaryResponse::from)
                .collect();
            (StatusCode::OK, Json(payload)).into_response()
        }
        Err(err) => map_error(err),
    }
}

#[utoipa::path(
    post,
    path = "/api/playlists",
    tag = "playlists",
    request_body = CreatePlaylistRequest,
    responses(
        (status = 201, description = "Playlist créée", body = PlaylistSummaryResponse),
        (status = 400, description = "Requête invalide", body = ErrorResponse)
    )
)]
pub async fn create_playlist(Json(req): Json<CreatePlaylistRequest>) -> Response {
    if req.playlist_key.trim().is_empty() {
        return map_status(
            StatusCode::BAD_REQUEST,
            "INVALID_KEY",
            "playlist_key cannot be empty",
        );
    }

    let mode = match req.mode.as_deref() {
        None | Some("endless") => PlaylistMode::Endless,
        Some("oneshot") => PlaylistMode::Oneshot,
        Some(other) => {
            return map_status(
                StatusCode::BAD_REQUEST,
                "INVALID_MODE",
                &format!("unknown mode '{}'", other),
            )
        }
    };

    let store = itnstore::get_store();
    let name = req
        .name
        .unwrap_or_else(|| req.playlist_key.clone());
    match store.create_playlist(NewPlaylist {
        playlist_key: req.playlist_key,
        name,
        mode,
        prompt: req.prompt,
    }) {
        Ok(playlist) => (
            StatusCode::CREATED,
            Json(PlaylistSummaryResponse::from(playlist)),
        )
            .into_response(),
        Err(err) => map_error(err),
    }
}

#[utoipa::path(
    get,
    path = "/api/playlists/{playlist_id}",
    tag = "playlists",
    params(("playlist_id" = String, Path, description = "Identifiant de playlist")),
    responses(
        (status = 200, description = "Détail de la playlist", body = PlaylistDetailResponse),
        (status = 404, description = "Playlist inconnue", body = ErrorResponse)
    )
)]
pub async fn get_playlist(Path(playlist_id): Path<String>) -> Response {
    let store = itnstore::get_store();
    let playlist = match store.get_playlist(&playlist_id) {
        Ok(p) => p,
        Err(err) => return map_error(err),
    };
    let songs = match store.list_by_playlist(&playlist_id) {
        Ok(songs) => songs,
        Err(err) => return map_error(err),
    };

    let payload = PlaylistDetailResponse {
        summary: PlaylistSummaryResponse::from(playlist),
        songs: songs.into_iter().map(SongResponse::from).collect(),
    };
    (StatusCode::OK, Json(payload)).into_response()
}

#[utoipa::path(
    delete,
    path = "/api/playlists/{playlist_id}",
    tag = "playlists",
    params(("playlist_id" = String, Path, description = "Identifiant de playlist")),
    responses((status = 204, description = "Playlist supprimée"))
)]
pub async fn delete_playlist(Path(playlist_id): Path<String>) -> Response {
    let store = itnstore::get_store();
    match store.delete_playlist(&playlist_id) {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => map_error(err),
    }
}

#[utoipa::path(
    post,
    path = "/api/playlists/{playlist_id}/steer",
    tag = "playlists",
    params(("playlist_id" = String, Path, description = "Identifiant de playlist")),
    request_body = SteerRequest,
    responses(
        (status = 200, description = "Prompt mis à jour, epoch incrémenté", body = SteerResponse),
        (status = 404, description = "Playlist inconnue", body = ErrorResponse)
    )
)]
pub async fn steer_playlist(
    Path(playlist_id): Path<String>,
    Json(req): Json<SteerRequest>,
) -> Response {
    let store = itnstore::get_store();
    match store.steer(&playlist_id, &req.prompt) {
        Ok(new_epoch) => (StatusCode::OK, Json(SteerResponse { new_epoch })).into_response(),
        Err(err) => map_error(err),
    }
}

#[utoipa::path(
    post,
    path = "/api/playlists/{playlist_id}/heartbeat",
    tag = "playlists",
    params(("playlist_id" = String, Path, description = "Identifiant de playlist")),
    responses((status = 204, description = "Heartbeat enregistré"))
)]
pub async fn heartbeat_playlist(Path(playlist_id): Path<String>) -> Response {
    let store = itnstore::get_store();
    match store.heartbeat(&playlist_id) {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => map_error(err),
    }
}

#[utoipa::path(
    post,
    path = "/api/playlists/{playlist_id}/close",
    tag = "playlists",
    params(("playlist_id" = String, Path, description = "Identifiant de playlist")),
    responses((status = 204, description = "Playlist en fermeture"))
)]
pub async fn close_playlist(Path(playlist_id): Path<String>) -> Response {
    let store = itnstore::get_store();
    match store.update_playlist_status(&playlist_id, itnstore::PlaylistStatus::Closing) {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => map_error(err),
    }
}

#[utoipa::path(
    get,
    path = "/api/playlists/{playlist_id}/queue",
    tag = "playlists",
    params(("playlist_id" = String, Path, description = "Identifiant de playlist")),
    responses(
        (status = 200, description = "Morceaux ready après le pointeur", body = [SongResponse])
    )
)]
pub async fn playlist_queue(Path(playlist_id): Path<String>) -> Response {
    let store = itnstore::get_store();
    match store.ready_queue(&playlist_id) {
        Ok(songs) => {
            let payload: Vec<SongResponse> = songs.into_iter().map(SongResponse::from).collect();
            (StatusCode::OK, Json(payload)).into_response()
        }
        Err(err) => map_error(err),
    }
}

#[utoipa::path(
    post,
    path = "/api/playlists/{playlist_id}/position",
    tag = "playlists",
    params(("playlist_id" = String, Path, description = "Identifiant de playlist")),
    request_body = PositionRequest,
    responses((status = 204, description = "Pointeur avancé"))
)]
pub async fn update_position(
    Path(playlist_id): Path<String>,
    Json(req): Json<PositionRequest>,
) -> Response {
    let store = itnstore::get_store();
    match store.set_current_order_index(&playlist_id, req.order_index) {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => map_error(err),
    }
}

#[utoipa::path(
    post,
    path = "/api/playlists/{playlist_id}/interrupt",
    tag = "playlists",
    params(("playlist_id" = String, Path, description = "Identifiant de playlist")),
    request_body = InterruptRequest,
    responses(
        (status = 201, description = "Interrupt créé", body = SongResponse),
        (status = 409, description = "Playlist fermée", body = ErrorResponse)
    )
)]
pub async fn inject_interrupt(
    Path(playlist_id): Path<String>,
    Json(req): Json<InterruptRequest>,
) -> Response {
    let store = itnstore::get_store();
    let work_queue = match store.get_work_queue(&playlist_id, Default::default()) {
        Ok(wq) => wq,
        Err(err) => return map_error(err),
    };
    let playlist = match store.get_playlist(&playlist_id) {
        Ok(p) => p,
        Err(err) => return map_error(err),
    };

    match store.create_pending(
        &playlist_id,
        work_queue.max_order_index + 1,
        playlist.prompt_epoch,
        true,
        Some(&req.prompt),
    ) {
        Ok(song) => (StatusCode::CREATED, Json(SongResponse::from(song))).into_response(),
        Err(err) => map_error(err),
    }
}

#[utoipa::path(
    post,
    path = "/api/songs/{song_id}/rate",
    tag = "songs",
    params(("song_id" = String, Path, description = "Identifiant de morceau")),
    request_body = RateRequest,
    responses((status = 204, description = "Vote enregistré"))
)]
pub async fn rate_song(Path(song_id): Path<String>, Json(req): Json<RateRequest>) -> Response {
    let rating = match req.rating.as_deref() {
        None => None,
        Some("up") => Some(UserRating::Up),
        Some("down") => Some(UserRating::Down),
        Some(other) => {
            return map_status(
                StatusCode::BAD_REQUEST,
                "INVALID_RATING",
                &format!("unknown rating '{}'", other),
            )
        }
    };

    let store = itnstore::get_store();
    match store.set_user_rating(&song_id, rating) {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => map_error(err),
    }
}

#[utoipa::path(
    post,
    path = "/api/songs/{song_id}/retry",
    tag = "songs",
    params(("song_id" = String, Path, description = "Identifiant de morceau")),
    responses(
        (status = 200, description = "Relance acceptée"),
        (status = 409, description = "Le morceau n'est pas en erreur", body = ErrorResponse)
    )
)]
pub async fn retry_song(Path(song_id): Path<String>) -> Response {
    let store = itnstore::get_store();
    match store.retry_errored(&song_id) {
        Ok(true) => StatusCode::OK.into_response(),
        Ok(false) => map_status(
            StatusCode::CONFLICT,
            "NOT_ERRORED",
            "song is not in error state",
        ),
        Err(err) => map_error(err),
    }
}

#[utoipa::path(
    post,
    path = "/api/songs/{song_id}/played",
    tag = "songs",
    params(("song_id" = String, Path, description = "Identifiant de morceau")),
    responses((status = 204, description = "Morceau marqué consommé"))
)]
pub async fn song_played(Path(song_id): Path<String>) -> Response {
    let store = itnstore::get_store();
    match store.mark_played(&song_id) {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => map_error(err),
    }
}

#[utoipa::path(
    get,
    path = "/api/songs/{song_id}/audio",
    tag = "songs",
    params(("song_id" = String, Path, description = "Identifiant de morceau")),
    responses(
        (status = 200, description = "Fichier audio", content_type = "audio/mpeg"),
        (status = 404, description = "Audio indisponible", body = ErrorResponse)
    )
)]
pub async fn song_audio(Path(song_id): Path<String>) -> Response {
    serve_song_file(&song_id, FileKind::Audio).await
}

#[utoipa::path(
    get,
    path = "/api/songs/{song_id}/cover",
    tag = "songs",
    params(("song_id" = String, Path, description = "Identifiant de morceau")),
    responses(
        (status = 200, description = "Pochette", content_type = "image/png"),
        (status = 404, description = "Pochette indisponible", body = ErrorResponse)
    )
)]
pub async fn song_cover(Path(song_id): Path<String>) -> Response {
    serve_song_file(&song_id, FileKind::Cover).await
}

#[utoipa::path(
    get,
    path = "/api/queues",
    tag = "queues",
    responses((status = 200, description = "Snapshots des files d'endpoints"))
)]
pub async fn queue_snapshots() -> Response {
    let snapshots = Pipeline::get().queue_snapshots();
    (StatusCode::OK, Json(snapshots)).into_response()
}

enum FileKind {
    Audio,
    Cover,
}

/// Stream un fichier du stockage (audio ou pochette).
async fn serve_song_file(song_id: &str, kind: FileKind) -> Response {
    let store = itnstore::get_store();
    let song = match store.get_song(song_id) {
        Ok(song) => song,
        Err(err) => return map_error(err),
    };

    let (path, content_type) = match kind {
        FileKind::Audio => {
            let Some(path) = song.storage_path.clone() else {
                return map_status(StatusCode::NOT_FOUND, "NO_AUDIO", "song has no stored audio");
            };
            let content_type = if path.ends_with(".flac") {
                "audio/flac"
            } else if path.ends_with(".wav") {
                "audio/wav"
            } else {
                "audio/mpeg"
            };
            (std::path::PathBuf::from(path), content_type)
        }
        FileKind::Cover => {
            // La pochette vit à côté de l'audio : {song_id}.cover.{fmt}
            let settings = Pipeline::get().ctx().settings.clone();
            let mut found = None;
            for format in ["png", "jpeg", "jpg", "webp"] {
                let candidate = settings.storage_dir.join(format!("{}.cover.{}", song_id, format));
                if candidate.exists() {
                    found = Some((candidate, format));
                    break;
                }
            }
            let Some((path, format)) = found else {
                return map_status(StatusCode::NOT_FOUND, "NO_COVER", "song has no cover");
            };
            let content_type = match format {
                "jpeg" | "jpg" => "image/jpeg",
                "webp" => "image/webp",
                _ => "image/png",
            };
            (path, content_type)
        }
    };

    match tokio::fs::read(&path).await {
        Ok(bytes) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, content_type)],
            bytes,
        )
            .into_response(),
        Err(_) => map_status(StatusCode::NOT_FOUND, "FILE_MISSING", "stored file is missing"),
    }
}

/// Projette une erreur du store vers une réponse HTTP.
fn map_error(err: itnstore::Error) -> Response {
    use itnstore::Error;
    match &err {
        Error::PlaylistNotFound(_) | Error::SongNotFound(_) => {
            map_status(StatusCode::NOT_FOUND, "NOT_FOUND", &err.to_string())
        }
        Error::PlaylistClosing(_) | Error::PlaylistClosed(_) => {
            map_status(StatusCode::CONFLICT, "PLAYLIST_CLOSED", &err.to_string())
        }
        Error::InvalidStatus(_) => {
            map_status(StatusCode::BAD_REQUEST, "INVALID_STATUS", &err.to_string())
        }
        _ => map_status(
            StatusCode::INTERNAL_SERVER_ERROR,
            "INTERNAL",
            &err.to_string(),
        ),
    }
}

fn map_status(status: StatusCode, error: &str, message: &str) -> Response {
    (
        status,
        Json(ErrorResponse {
            error: error.to_string(),
            message: message.to_string(),
        }),
    )
        .into_response()
}
