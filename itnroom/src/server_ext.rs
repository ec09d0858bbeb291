//! Extension pour enregistrer les rooms sur itnserver.

use crate::openapi::ApiDoc;
use crate::{api, ws};
use anyhow::Result;
use itnserver::Server;
use utoipa::OpenApi;

/// Trait d'extension pour ajouter le runtime de rooms au serveur
pub trait RoomsExt {
    /// Enregistre le canal WebSocket et l'API REST des rooms
    ///
    /// # Routes enregistrées
    ///
    /// - `GET /ws/room` - canal full-duplex des devices
    /// - `GET /api/rooms`, `DELETE /api/rooms/{id}`
    /// - `GET /swagger-ui/rooms`
    async fn init_rooms(&mut self) -> Result<()>;
}

impl RoomsExt for Server {
    async fn init_rooms(&mut self) -> Result<()> {
        self.add_handler("/ws/room", ws::room_ws_handler).await;
        self.add_openapi(api::rooms_api_router(), ApiDoc::openapi(), "rooms")
            .await;
        Ok(())
    }
}
