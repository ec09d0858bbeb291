//! # itndaemon - Daemon de lecture local
//!
//! Processus long qui possède le moteur audio et fait le pont entre le
//! CLI, une room distante et le service de génération :
//!
//! - [`engine`] : contrat du moteur audio + pilotage du décodeur externe
//! - [`room_session`] : canal WebSocket persistant vers une room (pulse
//!   `sync`, sonde d'horloge, directives `execute`/`nextSong`)
//! - [`local_session`] : lecture directe d'une playlist par polling HTTP
//! - [`ipc`] : socket de contrôle local (JSON newline-délimité)
//! - [`http`] : endpoint de statut lecture seule
//!
//! Le tout est orchestré par [`daemon::DaemonCore`] ; [`run`] est le
//! point d'entrée du processus (`itn daemon run`).

pub mod api_client;
pub mod daemon;
pub mod engine;
pub mod error;
pub mod http;
pub mod ipc;
pub mod local_session;
pub mod room_session;
pub mod state;

pub use daemon::{DaemonConfig, DaemonCore};
pub use engine::{AudioEngine, DecoderEngine, EngineSnapshot, FakeEngine};
pub use error::{Error, Result};
pub use ipc::{Request, Response};
pub use state::{DaemonMode, DaemonState, QueueEntry, RuntimeState};

use itnutils::{remove_pid_file, write_pid_file};
use std::sync::Arc;
use tracing::{info, warn};

/// Lance le daemon et bloque jusqu'à l'arrêt.
///
/// Séquence d'arrêt : session fermée, moteur arrêté, HTTP et IPC clos,
/// socket et pid supprimés.
pub async fn run() -> Result<()> {
    let config = DaemonConfig::from_config()?;

    // Vérification du socket avant toute autre chose : un daemon vivant
    // est fatal, un socket mort est nettoyé.
    let listener = ipc::bind_control_socket(&config.socket_path, &config.pid_path).await?;
    write_pid_file(&config.pid_path)?;

    let engine: Arc<dyn AudioEngine> = DecoderEngine::spawn(&config.decoder_cmd)?;
    let core = DaemonCore::new(config.clone(), engine);

    info!(
        socket = %config.socket_path.display(),
        status_port = config.status_port,
        "Daemon started"
    );

    // Serveur de statut (échec de bind = refus de démarrer)
    let http_task = {
        let core = core.clone();
        tokio::spawn(async move {
            if let Err(e) = http::serve(core).await {
                warn!("Status endpoint stopped: {}", e);
            }
        })
    };

    // Socket de contrôle
    let ipc_task = {
        let core = core.clone();
        tokio::spawn(async move {
            ipc::serve(core, listener).await;
        })
    };

    // Attente d'arrêt : signal ou action IPC `shutdown`
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Ctrl+C reçu, arrêt du daemon");
            core.shutdown.cancel();
        }
        _ = core.shutdown.cancelled() => {}
    }

    core.teardown().await;
    http_task.abort();
    ipc_task.abort();

    let _ = std::fs::remove_file(&config.socket_path);
    remove_pid_file(&config.pid_path);

    info!("Daemon stopped");
    Ok(())
}
