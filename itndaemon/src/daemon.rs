//! Cœur du daemon : sessions, actions IPC, cycle de vie.

use crate::api_client::ApiClient;
use crate::engine::AudioEngine;
use crate::error::{Error, Result};
use crate::local_session::{LocalCtrl, LocalSession, LocalSessionConfig};
use crate::room_session::{RoomSession, RoomSessionConfig};
use crate::state::{DaemonMode, DaemonState};
use itnroom::protocol::Command;
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Configuration du daemon.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub socket_path: PathBuf,
    pub pid_path: PathBuf,
    pub status_host: String,
    pub status_port: u16,
    pub server_url: String,
    pub device_id: String,
    pub device_name: String,
    pub sync_interval: Duration,
    pub local_poll_interval: Duration,
    pub local_heartbeat_interval: Duration,
    pub ipc_timeout: Duration,
    pub connect_wait: Duration,
    pub volume_step: f64,
    pub decoder_cmd: String,
}

impl DaemonConfig {
    /// Charge la configuration du daemon
    pub fn from_config() -> Result<Self> {
        let config = itnconfig::get_config();
        let runtime_dir = config.get_runtime_dir().map_err(Error::Other)?;

        let socket_path = match config.get_string_or(&["daemon", "socket_path"], "") {
            s if s.is_empty() => runtime_dir.join("daemon.sock"),
            s => PathBuf::from(s),
        };
        let pid_path = match config.get_string_or(&["daemon", "pid_path"], "") {
            s if s.is_empty() => runtime_dir.join("daemon.pid"),
            s => PathBuf::from(s),
        };

        Ok(Self {
            socket_path,
            pid_path,
            status_host: config.get_string_or(&["daemon", "status_host"], "127.0.0.1"),
            status_port: config.get_u64_or(&["daemon", "status_port"], 14533) as u16,
            server_url: config.get_base_url(),
            device_id: config.get_device_id().map_err(Error::Other)?,
            device_name: config.get_string_or(&["daemon", "device_name"], "infinitune-daemon"),
            sync_interval: Duration::from_secs(config.get_u64_or(&["daemon", "sync_interval_secs"], 1)),
            local_poll_interval: Duration::from_secs(
                config.get_u64_or(&["daemon", "local_poll_secs"], 4),
            ),
            local_heartbeat_interval: Duration::from_secs(
                config.get_u64_or(&["daemon", "local_heartbeat_secs"], 30),
            ),
            ipc_timeout: Duration::from_secs(config.get_u64_or(&["daemon", "ipc_timeout_secs"], 4)),
            connect_wait: Duration::from_secs(
                config.get_u64_or(&["daemon", "connect_wait_secs"], 4),
            ),
            volume_step: config.get_f64_or(&["cli", "volume_step"], 0.05),
            decoder_cmd: config.get_string_or(&["daemon", "decoder_cmd"], "infinitune-decoder"),
        })
    }
}

/// Session active du daemon.
enum Session {
    None,
    Room(Arc<RoomSession>),
    Local(LocalSession),
}

/// Cœur du daemon : moteur, état, session.
pub struct DaemonCore {
    pub config: DaemonConfig,
    pub state: DaemonState,
    engine: Arc<dyn AudioEngine>,
    /// Point de sérialisation unique des actions qui changent la session.
    session: tokio::sync::Mutex<Session>,
    pub shutdown: CancellationToken,
}

impl DaemonCore {
    pub fn new(config: DaemonConfig, engine: Arc<dyn AudioEngine>) -> Arc<Self> {
        let state = DaemonState::new(config.device_id.clone());
        Arc::new(Self {
            config,
            state,
            engine,
            session: tokio::sync::Mutex::new(Session::None),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn engine(&self) -> &Arc<dyn AudioEngine> {
        &self.engine
    }

    /// Instantané runtime avec l'état moteur à jour
    pub fn status_snapshot(&self) -> crate::state::RuntimeState {
        let mut snapshot = self.state.snapshot();
        snapshot.engine = self.engine.snapshot();
        snapshot
    }

    /// Dispatch d'une action IPC
    pub async fn handle_action(self: &Arc<Self>, action: &str, payload: Value) -> Result<Value> {
        match action {
            // Lectures sans verrou de session
            "status" => Ok(serde_json::to_value(self.status_snapshot())
                .map_err(|e| Error::Ipc(e.to_string()))?),
            "queue" => Ok(json!({"queue": self.state.snapshot().queue})),

            "shutdown" => {
                self.shutdown.cancel();
                Ok(json!({"stopping": true}))
            }

            // Actions de session : sérialisées sur le mutex
            "joinRoom" => self.join_room(payload).await,
            "startLocal" => self.start_local(payload).await,
            "leaveRoom" | "leavePlaylist" | "clearSession" => {
                let mut session = self.session.lock().await;
                self.stop_session(&mut session).await;
                Ok(json!({"cleared": true}))
            }
            "configure" => self.configure(payload).await,

            // Commandes de lecture
            "play" => self.playback_command(Command::Play).await,
            "pause" => self.playback_command(Command::Pause).await,
            "toggle" => self.playback_command(Command::Toggle).await,
            "skip" => self.playback_command(Command::Skip).await,
            "toggleMute" => self.playback_command(Command::ToggleMute).await,
            "setVolume" => {
                let volume = payload["volume"]
                    .as_f64()
                    .ok_or_else(|| Error::InvalidPayload("missing volume".to_string()))?;
                self.playback_command(Command::SetVolume {
                    volume: volume.clamp(0.0, 1.0),
                })
                .await
            }
            "volumeDelta" => {
                let delta = payload["delta"]
                    .as_f64()
                    .unwrap_or_else(|| self.config.volume_step);
                let volume = (self.engine.snapshot().volume + delta).clamp(0.0, 1.0);
                self.playback_command(Command::SetVolume { volume }).await
            }
            "seek" => {
                let time = payload["time"]
                    .as_f64()
                    .ok_or_else(|| Error::InvalidPayload("missing time".to_string()))?;
                self.playback_command(Command::Seek { time }).await
            }
            "selectSong" => {
                let song_id = payload["songId"]
                    .as_str()
                    .ok_or_else(|| Error::InvalidPayload("missing songId".to_string()))?
                    .to_string();
                self.playback_command(Command::SelectSong { song_id }).await
            }

            other => Err(Error::UnknownAction(other.to_string())),
        }
    }

    /// Rejoint une room ; attend l'état connecté avant de répondre.
    async fn join_room(self: &Arc<Self>, payload: Value) -> Result<Value> {
        let room_id = payload["roomId"]
            .as_str()
            .ok_or_else(|| Error::InvalidPayload("missing roomId".to_string()))?
            .to_string();
        let playlist_key = payload["playlistKey"]
            .as_str()
            .unwrap_or(room_id.as_str())
            .to_string();
        let server_url = payload["serverUrl"]
            .as_str()
            .unwrap_or(&self.config.server_url)
            .to_string();

        let mut session = self.session.lock().await;

        // Déjà sur cette room et connecté : no-op.
        if let Session::Room(existing) = &*session {
            let snapshot = self.state.snapshot();
            if existing.is_connected() && snapshot.room_id.as_deref() == Some(room_id.as_str()) {
                return Ok(json!({"alreadyJoined": true}));
            }
        }

        // La clé doit encore se résoudre côté serveur, sinon la session
        // est périmée (playlist supprimée ≠ panne réseau).
        let api = ApiClient::new(&server_url)?;
        api.get_playlist_by_key(&playlist_key).await?;

        self.stop_session(&mut session).await;

        let room_session = RoomSession::connect(
            RoomSessionConfig {
                server_url,
                room_id: room_id.clone(),
                playlist_key: playlist_key.clone(),
                device_id: self.config.device_id.clone(),
                device_name: self.config.device_name.clone(),
                sync_interval: self.config.sync_interval,
            },
            self.engine.clone(),
            self.state.clone(),
        )
        .await?;

        if !room_session.wait_connected(self.config.connect_wait).await {
            room_session.shutdown();
            return Err(Error::RoomConnection(format!(
                "room {} did not reach connected state",
                room_id
            )));
        }

        *session = Session::Room(room_session);
        Ok(json!({"roomId": room_id, "playlistKey": playlist_key}))
    }

    /// Bascule en mode local sur une playlist.
    async fn start_local(self: &Arc<Self>, payload: Value) -> Result<Value> {
        let server_url = payload["serverUrl"]
            .as_str()
            .unwrap_or(&self.config.server_url)
            .to_string();
        let api = Arc::new(ApiClient::new(&server_url)?);

        // Résolution par id ou par clé, avec détection de session périmée.
        let playlist = if let Some(id) = payload["playlistId"].as_str() {
            api.get_playlist(id).await?
        } else if let Some(key) = payload["playlistKey"].as_str() {
            api.get_playlist_by_key(key).await?
        } else {
            return Err(Error::InvalidPayload(
                "missing playlistId or playlistKey".to_string(),
            ));
        };
        let playlist_name = payload["playlistName"]
            .as_str()
            .map(String::from)
            .unwrap_or(playlist.name);

        let mut session = self.session.lock().await;
        self.stop_session(&mut session).await;

        let local = LocalSession::start(
            LocalSessionConfig {
                playlist_id: playlist.id.clone(),
                playlist_name,
                poll_interval: self.config.local_poll_interval,
                heartbeat_interval: self.config.local_heartbeat_interval,
            },
            api,
            self.engine.clone(),
            self.state.clone(),
        );

        *session = Session::Local(local);
        Ok(json!({"playlistId": playlist.id, "playlistKey": playlist.playlist_key}))
    }

    async fn configure(self: &Arc<Self>, payload: Value) -> Result<Value> {
        let path = payload["path"]
            .as_str()
            .ok_or_else(|| Error::InvalidPayload("missing path".to_string()))?;
        let value = payload
            .get("value")
            .cloned()
            .ok_or_else(|| Error::InvalidPayload("missing value".to_string()))?;

        let _session = self.session.lock().await;
        let yaml_value =
            serde_yaml_value(&value).map_err(|e| Error::InvalidPayload(e.to_string()))?;
        let parts: Vec<&str> = path.split('.').collect();
        itnconfig::get_config()
            .set_value(&parts, yaml_value)
            .map_err(Error::Other)?;
        Ok(json!({"path": path}))
    }

    /// Route une commande de lecture vers la session courante.
    ///
    /// En room, play/pause sont appliqués localement immédiatement pour
    /// réduire la latence perçue ; l'état autoritaire reconcilie ensuite.
    async fn playback_command(self: &Arc<Self>, command: Command) -> Result<Value> {
        let session = self.session.lock().await;
        match &*session {
            Session::Room(room) => {
                match &command {
                    Command::Play => {
                        // Idempotence : play sur un daemon déjà en lecture
                        // ne change rien.
                        if self.engine.snapshot().is_playing {
                            return Ok(json!({"noop": true}));
                        }
                        let _ = self.engine.play().await;
                    }
                    Command::Pause => {
                        let _ = self.engine.pause().await;
                    }
                    _ => {}
                }
                room.send_command(command, None).await?;
                Ok(json!({"relayed": true}))
            }
            Session::Local(local) => {
                match command {
                    Command::Play => {
                        if self.engine.snapshot().is_playing {
                            return Ok(json!({"noop": true}));
                        }
                        self.engine.play().await?;
                    }
                    Command::Pause => self.engine.pause().await?,
                    Command::Toggle => self.engine.toggle().await?,
                    Command::Seek { time } => self.engine.seek(time).await?,
                    Command::SetVolume { volume } => self.engine.set_volume(volume).await?,
                    Command::ToggleMute => self.engine.toggle_mute().await?,
                    Command::Skip => local.control(LocalCtrl::Skip).await,
                    Command::SelectSong { song_id } => {
                        local.control(LocalCtrl::SelectSong(song_id)).await
                    }
                }
                Ok(json!({"applied": true}))
            }
            Session::None => Err(Error::NotConnected),
        }
    }

    async fn stop_session(&self, session: &mut Session) {
        match std::mem::replace(session, Session::None) {
            Session::Room(room) => {
                info!("Leaving room session");
                room.shutdown();
            }
            Session::Local(local) => {
                info!("Leaving local session");
                local.shutdown();
            }
            Session::None => {}
        }
        let _ = self.engine.stop(true).await;
        self.state.clear_session();
    }

    /// Séquence d'arrêt complète
    pub async fn teardown(&self) {
        let mut session = self.session.lock().await;
        self.stop_session(&mut session).await;
        if let Err(e) = self.engine.destroy().await {
            warn!("Engine destroy failed: {}", e);
        }
    }
}

fn serde_yaml_value(value: &Value) -> anyhow::Result<serde_yaml::Value> {
    Ok(serde_yaml::to_value(value)?)
}
