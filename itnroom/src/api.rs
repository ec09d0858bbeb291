//! API REST des rooms (listing et suppression).

use crate::manager::RoomManager;
use axum::{
    extract::Path,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get},
    Json, Router,
};
use serde::Serialize;
use utoipa::ToSchema;

/// Router `/api/rooms`.
pub fn rooms_api_router() -> Router {
    Router::new()
        .route("/api/rooms", get(list_rooms))
        .route("/api/rooms/{room_id}", delete(delete_room))
}

/// Room vivante.
#[derive(Debug, Serialize, ToSchema)]
pub struct RoomResponse {
    pub room_id: String,
}

#[utoipa::path(
    get,
    path = "/api/rooms",
    tag = "rooms",
    responses((status = 200, description = "Rooms vivantes", body = [RoomResponse]))
)]
pub async fn list_rooms() -> Response {
    let rooms: Vec<RoomResponse> = RoomManager::get()
        .list_rooms()
        .into_iter()
        .map(|room_id| RoomResponse { room_id })
        .collect();
    (StatusCode::OK, Json(rooms)).into_response()
}

#[utoipa::path(
    delete,
    path = "/api/rooms/{room_id}",
    tag = "rooms",
    params(("room_id" = String, Path, description = "Identifiant de room")),
    responses((status = 204, description = "Room détruite"))
)]
pub async fn delete_room(Path(room_id): Path<String>) -> Response {
    RoomManager::get().delete_room(&room_id);
    StatusCode::NO_CONTENT.into_response()
}
