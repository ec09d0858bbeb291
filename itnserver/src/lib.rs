//! # itnserver - Serveur web haut niveau basé sur Axum
//!
//! Cette crate fournit l'ossature HTTP commune du serveur Infinitune :
//!
//! - API de haut niveau pour enregistrer des routes JSON, des routers et
//!   des handlers avec état (SSE, WebSocket)
//! - Système de logs en mémoire (ring buffer) exposé en REST et en SSE
//! - Documentation OpenAPI/Swagger par API enregistrée
//! - Arrêt gracieux sur Ctrl+C
//!
//! ## Exemple
//!
//! ```rust,ignore
//! use itnserver::ServerBuilder;
//!
//! #[tokio::main]
//! async fn main() {
//!     let mut server = ServerBuilder::new_configured().build();
//!     server.add_route("/info", || async {
//!         serde_json::json!({"version": "1.0.0"})
//!     }).await;
//!     server.start().await;
//!     server.wait().await;
//! }
//! ```

pub mod config_ext;
pub mod logs;
pub mod server;

pub use config_ext::ConfigExt;
pub use logs::{LogEntry, LogState, LoggingOptions, SseLayer, init_logging, log_dump, log_sse};
pub use server::{Server, ServerBuilder, ServerInfo};

// ============================================================================
// Singleton global du serveur
// ============================================================================

use once_cell::sync::OnceCell;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Instance globale unique du serveur Infinitune
static GLOBAL_SERVER: OnceCell<Arc<RwLock<Server>>> = OnceCell::new();

/// Initialise le serveur global unique depuis la configuration
///
/// Idempotent : les appels suivants retournent la même instance.
pub fn init_server() -> Arc<RwLock<Server>> {
    GLOBAL_SERVER
        .get_or_init(|| {
            let server = ServerBuilder::new_configured().build();
            Arc::new(RwLock::new(server))
        })
        .clone()
}

/// Récupère le serveur global s'il a été initialisé
pub fn get_server() -> Option<Arc<RwLock<Server>>> {
    GLOBAL_SERVER.get().cloned()
}
