//! Socket de contrôle local : JSON délimité par newline.
//!
//! Chaque requête : `{"id", "action", "payload"?}` ; chaque réponse :
//! `{"id", "ok", "data"?, "error"?}`. La réponse est écrite puis la
//! connexion fermée. Les actions de session sont sérialisées par le
//! mutex du cœur ; les lectures (`status`, `queue`) ne le prennent pas.

use crate::daemon::DaemonCore;
use crate::error::{Error, Result};
use itnutils::{process_alive, read_pid_file};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, warn};

/// Requête IPC.
#[derive(Debug, Deserialize)]
pub struct Request {
    pub id: String,
    pub action: String,
    #[serde(default)]
    pub payload: Option<Value>,
}

/// Réponse IPC.
#[derive(Debug, Serialize)]
pub struct Response {
    pub id: String,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Prépare le socket de contrôle en appliquant les règles de nettoyage :
///
/// - socket qui refuse la connexion → fichier périmé, supprimé ;
/// - socket qui répond + pid vivant → erreur claire avec le pid ;
/// - socket qui répond + pid mort → la même erreur « in use ».
pub async fn bind_control_socket(socket_path: &Path, pid_path: &Path) -> Result<UnixListener> {
    if socket_path.exists() {
        match UnixStream::connect(socket_path).await {
            Ok(_) => {
                let pid = read_pid_file(pid_path).filter(|pid| process_alive(*pid));
                return Err(Error::SocketInUse { pid });
            }
            Err(_) => {
                debug!(path = %socket_path.display(), "Removing stale control socket");
                let _ = std::fs::remove_file(socket_path);
            }
        }
    }

    Ok(UnixListener::bind(socket_path)?)
}

/// Boucle d'acceptation du socket de contrôle
pub async fn serve(core: Arc<DaemonCore>, listener: UnixListener) {
    loop {
        tokio::select! {
            _ = core.shutdown.cancelled() => break,
            accepted = listener.accept() => {
                let Ok((stream, _)) = accepted else { continue };
                let core = core.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(core, stream).await {
                        debug!("IPC connection error: {}", e);
                    }
                });
            }
        }
    }
}

async fn handle_connection(core: Arc<DaemonCore>, stream: UnixStream) -> Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();

    let Some(line) = lines.next_line().await? else {
        return Ok(());
    };

    let response = match serde_json::from_str::<Request>(&line) {
        Ok(request) => {
            let id = request.id.clone();
            let payload = request.payload.unwrap_or(Value::Null);
            let result = tokio::time::timeout(
                core.config.ipc_timeout,
                core.handle_action(&request.action, payload),
            )
            .await;

            match result {
                Ok(Ok(data)) => Response {
                    id,
                    ok: true,
                    data: Some(data),
                    error: None,
                },
                Ok(Err(e)) => Response {
                    id,
                    ok: false,
                    data: None,
                    error: Some(format!("{}: {}", e.code(), e)),
                },
                Err(_) => Response {
                    id,
                    ok: false,
                    data: None,
                    error: Some("timeout: request exceeded ipc timeout".to_string()),
                },
            }
        }
        Err(e) => {
            warn!("Malformed IPC request: {}", e);
            Response {
                id: String::new(),
                ok: false,
                data: None,
                error: Some(format!("invalid_request: {}", e)),
            }
        }
    };

    let mut encoded = serde_json::to_string(&response).map_err(|e| Error::Ipc(e.to_string()))?;
    encoded.push('\n');
    write_half.write_all(encoded.as_bytes()).await?;
    write_half.shutdown().await?;
    Ok(())
}
