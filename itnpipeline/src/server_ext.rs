//! Extension pour enregistrer l'API de génération sur itnserver.

use crate::openapi::ApiDoc;
use crate::{api, sse};
use anyhow::Result;
use itnserver::Server;
use utoipa::OpenApi;

/// Trait d'extension pour ajouter l'API de génération au serveur
pub trait GenerationExt {
    /// Enregistre les routes REST + SSE de la génération
    ///
    /// # Routes enregistrées
    ///
    /// - `GET/POST /api/playlists` et sous-routes (steer, heartbeat, queue…)
    /// - `POST /api/songs/{id}/...` (rate, retry, played)
    /// - `GET /api/songs/{id}/audio` et `/cover`
    /// - `GET /api/queues`
    /// - `GET /api/events` (SSE)
    /// - `GET /swagger-ui/generation`
    async fn init_generation_api(&mut self) -> Result<()>;
}

impl GenerationExt for Server {
    async fn init_generation_api(&mut self) -> Result<()> {
        let router = api::generation_api_router().merge(sse::generation_events_router());
        self.add_openapi(router, ApiDoc::openapi(), "generation")
            .await;
        Ok(())
    }
}
