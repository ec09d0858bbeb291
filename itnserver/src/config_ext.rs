//! Extension pour intégrer l'API de configuration d'itnconfig dans itnserver.

use crate::Server;
use anyhow::Result;
use itnconfig::{ApiDoc, api, get_config};
use utoipa::OpenApi;

/// Trait d'extension pour ajouter l'API de configuration au serveur
pub trait ConfigExt {
    /// Initialise l'API de configuration et enregistre les routes HTTP
    ///
    /// # Routes enregistrées
    ///
    /// - `GET /api/config` - Récupérer toute la configuration
    /// - `GET /api/config/{path}` - Récupérer une valeur (ex: host.http_port)
    /// - `POST /api/config` - Mettre à jour une valeur
    /// - `GET /swagger-ui/config` - Documentation Swagger
    async fn init_config_api(&mut self) -> Result<()>;
}

impl ConfigExt for Server {
    async fn init_config_api(&mut self) -> Result<()> {
        let config = get_config();

        let api_router = api::create_router(config);
        let openapi = ApiDoc::openapi();
        self.add_openapi(api_router, openapi, "config").await;

        Ok(())
    }
}
