//! Room : acteur mono-écrivain de l'état de lecture autoritaire.
//!
//! Chaque room est une tâche unique consommant une inbox mpsc ; les
//! sockets des devices lui transmettent leurs messages et reçoivent les
//! diffusions via un canal sortant par device (l'ordre par device est
//! préservé par le writer dédié).

use crate::protocol::{
    ClientMessage, Command, DeviceMode, DeviceRole, DeviceSnapshot, PlaybackState, ServerMessage,
    SongSnapshot,
};
use chrono::{DateTime, TimeZone, Utc};
use itnstore::{Song, Store};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

/// Paramètres de synchronisation d'une room.
#[derive(Debug, Clone, Copy)]
pub struct RoomTuning {
    /// Avance donnée aux players pour charger un morceau (ms).
    pub start_lead_ms: i64,
    /// Dérive tolérée avant correction (ms).
    pub drift_threshold_ms: i64,
}

impl Default for RoomTuning {
    fn default() -> Self {
        Self {
            start_lead_ms: 300,
            drift_threshold_ms: 500,
        }
    }
}

/// Description d'un device à l'enregistrement.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub device_id: String,
    pub name: String,
    pub role: DeviceRole,
    pub mode: DeviceMode,
}

/// Messages de l'inbox d'une room.
pub enum RoomMsg {
    Join {
        device: DeviceInfo,
        outbound: mpsc::Sender<ServerMessage>,
        reply: oneshot::Sender<()>,
    },
    Client {
        device_id: String,
        message: ClientMessage,
    },
    Disconnect {
        device_id: String,
    },
    /// La file de la playlist a changé (évènement du store).
    RefreshQueue,
    Shutdown,
}

/// Poignée d'une room (envoi dans l'inbox de l'acteur).
#[derive(Clone)]
pub struct RoomHandle {
    pub room_id: String,
    tx: mpsc::Sender<RoomMsg>,
}

impl RoomHandle {
    pub async fn send(&self, msg: RoomMsg) -> bool {
        self.tx.send(msg).await.is_ok()
    }

    pub fn try_send(&self, msg: RoomMsg) -> bool {
        self.tx.try_send(msg).is_ok()
    }
}

struct DeviceEntry {
    info: DeviceInfo,
    tx: mpsc::Sender<ServerMessage>,
}

/// État interne de l'acteur room.
struct RoomActor {
    room_id: String,
    playlist_key: String,
    playlist_id: Option<String>,
    store: Arc<Store>,
    tuning: RoomTuning,
    devices: HashMap<String, DeviceEntry>,
    current_song: Option<Song>,
    /// Position de lecture au dernier point d'ancrage (secondes).
    position: f64,
    /// Point d'ancrage temps serveur (None = en pause).
    anchor: Option<DateTime<Utc>>,
    is_playing: bool,
    volume: f64,
    is_muted: bool,
    /// Dernier startAt émis ; jamais décroissant dans une room.
    last_start_at: i64,
}

/// Démarre l'acteur d'une room et retourne sa poignée.
pub fn spawn_room(
    room_id: String,
    playlist_key: String,
    store: Arc<Store>,
    tuning: RoomTuning,
) -> RoomHandle {
    let (tx, mut rx) = mpsc::channel(256);
    let handle = RoomHandle {
        room_id: room_id.clone(),
        tx,
    };

    let playlist_id = store
        .get_playlist_by_key(&playlist_key)
        .ok()
        .flatten()
        .map(|p| p.id);

    let mut actor = RoomActor {
        room_id: room_id.clone(),
        playlist_key,
        playlist_id,
        store,
        tuning,
        devices: HashMap::new(),
        current_song: None,
        position: 0.0,
        anchor: None,
        is_playing: false,
        volume: 1.0,
        is_muted: false,
        last_start_at: 0,
    };

    tokio::spawn(async move {
        info!(room_id = %room_id, "Room started");
        while let Some(msg) = rx.recv().await {
            match msg {
                RoomMsg::Join {
                    device,
                    outbound,
                    reply,
                } => {
                    actor.handle_join(device, outbound).await;
                    let _ = reply.send(());
                }
                RoomMsg::Client { device_id, message } => {
                    actor.handle_client(&device_id, message).await;
                }
                RoomMsg::Disconnect { device_id } => {
                    if actor.devices.remove(&device_id).is_some() {
                        debug!(room_id = %actor.room_id, device_id = %device_id, "Device removed");
                        actor.broadcast_state().await;
                    }
                }
                RoomMsg::RefreshQueue => {
                    actor.rebind_playlist();
                    actor.broadcast_queue().await;
                }
                RoomMsg::Shutdown => break,
            }
        }
        info!(room_id = %room_id, "Room stopped");
    });

    handle
}

impl RoomActor {
    /// Relie la room à sa playlist quand la clé se résout (ou se re-résout).
    fn rebind_playlist(&mut self) {
        if self.playlist_id.is_some() {
            // La playlist peut avoir été supprimée : vérifier qu'elle existe.
            if let Some(id) = &self.playlist_id {
                if self.store.get_playlist(id).is_err() {
                    self.playlist_id = None;
                }
            }
        }
        if self.playlist_id.is_none() {
            self.playlist_id = self
                .store
                .get_playlist_by_key(&self.playlist_key)
                .ok()
                .flatten()
                .map(|p| p.id);
        }
    }

    /// Position de lecture autoritaire, dérivée du temps serveur.
    fn current_time(&self) -> f64 {
        match (self.is_playing, self.anchor) {
            (true, Some(anchor)) => {
                let elapsed = Utc::now()
                    .signed_duration_since(anchor)
                    .num_milliseconds()
                    .max(0) as f64
                    / 1000.0;
                self.position + elapsed
            }
            _ => self.position,
        }
    }

    fn playback_state(&self) -> PlaybackState {
        PlaybackState {
            current_song_id: self.current_song.as_ref().map(|s| s.id.clone()),
            is_playing: self.is_playing,
            current_time: self.current_time(),
            duration: self
                .current_song
                .as_ref()
                .and_then(|s| s.metadata.audio_duration)
                .unwrap_or(0.0),
            volume: self.volume,
            is_muted: self.is_muted,
        }
    }

    fn device_snapshots(&self) -> Vec<DeviceSnapshot> {
        self.devices
            .values()
            .map(|entry| DeviceSnapshot {
                device_id: entry.info.device_id.clone(),
                name: entry.info.name.clone(),
                role: entry.info.role,
                mode: entry.info.mode,
            })
            .collect()
    }

    async fn send_to(&mut self, device_id: &str, msg: ServerMessage) {
        let failed = match self.devices.get(device_id) {
            Some(entry) => entry.tx.send(msg).await.is_err(),
            None => false,
        };
        // Un envoi impossible vaut déconnexion du device.
        if failed {
            self.devices.remove(device_id);
            warn!(room_id = %self.room_id, device_id = %device_id, "Device send failed, removing");
        }
    }

    async fn broadcast(&mut self, msg: ServerMessage) {
        let ids: Vec<String> = self.devices.keys().cloned().collect();
        for device_id in ids {
            self.send_to(&device_id, msg.clone()).await;
        }
    }

    async fn broadcast_state(&mut self) {
        let msg = ServerMessage::State {
            playback: self.playback_state(),
            current_song: self.current_song.as_ref().map(SongSnapshot::from),
            devices: self.device_snapshots(),
        };
        self.broadcast(msg).await;
    }

    async fn broadcast_queue(&mut self) {
        let songs = match &self.playlist_id {
            Some(playlist_id) => self
                .store
                .ready_queue(playlist_id)
                .map(|songs| songs.iter().map(SongSnapshot::from).collect())
                .unwrap_or_default(),
            // Playlist disparue : les rooms reçoivent une file vide.
            None => Vec::new(),
        };
        self.broadcast(ServerMessage::Queue { songs }).await;
    }

    async fn handle_join(&mut self, device: DeviceInfo, outbound: mpsc::Sender<ServerMessage>) {
        let device_id = device.device_id.clone();
        info!(room_id = %self.room_id, device_id = %device_id, role = ?device.role, "Device joined");

        self.devices.insert(
            device_id.clone(),
            DeviceEntry {
                info: device,
                tx: outbound,
            },
        );
        self.rebind_playlist();

        self.send_to(
            &device_id,
            ServerMessage::JoinAck {
                room_id: self.room_id.clone(),
                device_id: device_id.clone(),
                protocol_version: crate::protocol::PROTOCOL_VERSION,
            },
        )
        .await;

        // État et file immédiats après l'ack.
        let state = ServerMessage::State {
            playback: self.playback_state(),
            current_song: self.current_song.as_ref().map(SongSnapshot::from),
            devices: self.device_snapshots(),
        };
        self.send_to(&device_id, state).await;

        let songs = match &self.playlist_id {
            Some(playlist_id) => self
                .store
                .ready_queue(playlist_id)
                .map(|songs| songs.iter().map(SongSnapshot::from).collect())
                .unwrap_or_default(),
            None => Vec::new(),
        };
        self.send_to(&device_id, ServerMessage::Queue { songs }).await;

        self.broadcast_state().await;
    }

    async fn handle_client(&mut self, device_id: &str, message: ClientMessage) {
        match message {
            ClientMessage::Command {
                command,
                target_device_id,
            } => {
                self.handle_command(device_id, command, target_device_id)
                    .await;
            }
            ClientMessage::Sync {
                current_song_id,
                current_time,
                is_playing: _,
            } => {
                self.handle_sync(device_id, current_song_id, current_time)
                    .await;
            }
            ClientMessage::SongEnded { song_id } => {
                self.handle_song_ended(&song_id).await;
            }
            ClientMessage::RenameDevice { name } => {
                if let Some(entry) = self.devices.get_mut(device_id) {
                    entry.info.name = name;
                }
                self.broadcast_state().await;
            }
            ClientMessage::SetRole { role } => {
                if let Some(entry) = self.devices.get_mut(device_id) {
                    entry.info.role = role;
                }
                self.broadcast_state().await;
            }
            // join et ping sont traités par la couche socket.
            ClientMessage::Join { .. } | ClientMessage::Ping { .. } => {}
        }
    }

    /// Routage des commandes : room-wide par défaut, ciblé en mode individual.
    async fn handle_command(
        &mut self,
        _sender_id: &str,
        command: Command,
        target_device_id: Option<String>,
    ) {
        if let Some(target) = target_device_id {
            // Commande device-scopée : un seul execute ciblé, l'état de la
            // room n'est pas touché.
            self.send_to(&target, ServerMessage::Execute { command }).await;
            return;
        }

        match command {
            Command::Play => {
                if self.current_song.is_none() {
                    self.advance_from(None).await;
                    return;
                }
                self.position = self.current_time();
                self.is_playing = true;
                self.anchor = Some(Utc::now());
                self.broadcast(ServerMessage::Execute {
                    command: Command::Play,
                })
                .await;
                self.broadcast_state().await;
            }
            Command::Pause => {
                self.position = self.current_time();
                self.is_playing = false;
                self.anchor = None;
                self.broadcast(ServerMessage::Execute {
                    command: Command::Pause,
                })
                .await;
                self.broadcast_state().await;
            }
            Command::Toggle => {
                let next = if self.is_playing {
                    Command::Pause
                } else {
                    Command::Play
                };
                Box::pin(self.handle_command(_sender_id, next, None)).await;
            }
            Command::Skip => {
                let ended = self.current_song.as_ref().map(|s| s.id.clone());
                self.advance_from(ended.as_deref()).await;
            }
            Command::SetVolume { volume } => {
                self.volume = volume.clamp(0.0, 1.0);
                self.broadcast(ServerMessage::Execute {
                    command: Command::SetVolume {
                        volume: self.volume,
                    },
                })
                .await;
                self.broadcast_state().await;
            }
            Command::Seek { time } => {
                self.position = time.max(0.0);
                if self.is_playing {
                    self.anchor = Some(Utc::now());
                }
                self.broadcast(ServerMessage::Execute {
                    command: Command::Seek { time: self.position },
                })
                .await;
                self.broadcast_state().await;
            }
            Command::ToggleMute => {
                self.is_muted = !self.is_muted;
                self.broadcast(ServerMessage::Execute {
                    command: Command::ToggleMute,
                })
                .await;
                self.broadcast_state().await;
            }
            Command::SelectSong { song_id } => {
                match self.store.get_song(&song_id) {
                    Ok(song) if song.audio_url.is_some() => {
                        self.start_song(song).await;
                    }
                    _ => {
                        debug!(room_id = %self.room_id, song_id = %song_id, "selectSong on unplayable song");
                    }
                }
            }
        }
    }

    /// Dérive d'un player : correction par seek autoritaire.
    async fn handle_sync(
        &mut self,
        device_id: &str,
        current_song_id: Option<String>,
        reported_time: f64,
    ) {
        if !self.is_playing {
            return;
        }
        let Some(current) = &self.current_song else {
            return;
        };
        if current_song_id.as_deref() != Some(current.id.as_str()) {
            return;
        }

        let expected = self.current_time();
        let drift_ms = ((expected - reported_time) * 1000.0).abs() as i64;
        if drift_ms <= self.tuning.drift_threshold_ms {
            return;
        }

        debug!(
            room_id = %self.room_id,
            device_id = %device_id,
            drift_ms,
            "Drift above threshold, correcting"
        );

        let correction = ServerMessage::Execute {
            command: Command::Seek { time: expected },
        };
        let individual = self
            .devices
            .get(device_id)
            .map(|entry| entry.info.mode == DeviceMode::Individual)
            .unwrap_or(false);
        if individual {
            self.send_to(device_id, correction).await;
        } else {
            self.broadcast(correction).await;
        }
    }

    async fn handle_song_ended(&mut self, song_id: &str) {
        let is_current = self
            .current_song
            .as_ref()
            .map(|s| s.id == song_id)
            .unwrap_or(false);
        if !is_current {
            return;
        }
        self.advance_from(Some(song_id)).await;
    }

    /// Avancement : marque consommé, choisit le prochain ready, programme
    /// son départ et préchauffe le suivant.
    async fn advance_from(&mut self, ended_song_id: Option<&str>) {
        self.rebind_playlist();
        let Some(playlist_id) = self.playlist_id.clone() else {
            return;
        };

        let mut after_index = -1;
        if let Some(ended) = ended_song_id {
            if let Ok(song) = self.store.get_song(ended) {
                after_index = song.order_index;
            }
            let _ = self.store.mark_played(ended);
        } else if let Ok(playlist) = self.store.get_playlist(&playlist_id) {
            after_index = playlist.current_order_index;
        }

        match self.store.next_ready_after(&playlist_id, after_index) {
            Ok(Some(next)) => self.start_song(next).await,
            Ok(None) => {
                // Plus rien à jouer : la room reste vivante, lecture idle.
                self.current_song = None;
                self.is_playing = false;
                self.anchor = None;
                self.position = 0.0;
                self.broadcast_state().await;
            }
            Err(e) => warn!(room_id = %self.room_id, "Queue advance failed: {}", e),
        }
    }

    /// Programme le départ d'un morceau à `startAt` (temps serveur),
    /// monotone par room.
    async fn start_song(&mut self, song: Song) {
        let Some(audio_url) = song.audio_url.clone() else {
            warn!(room_id = %self.room_id, song_id = %song.id, "Ready song without audio_url");
            return;
        };

        let candidate = Utc::now().timestamp_millis() + self.tuning.start_lead_ms;
        let start_at = candidate.max(self.last_start_at);
        self.last_start_at = start_at;

        self.broadcast(ServerMessage::NextSong {
            song_id: song.id.clone(),
            audio_url,
            start_at,
        })
        .await;

        if let Some(playlist_id) = &self.playlist_id {
            let _ = self
                .store
                .set_current_order_index(playlist_id, song.order_index);
        }

        self.position = 0.0;
        self.anchor = Utc
            .timestamp_millis_opt(start_at)
            .single()
            .or(Some(Utc::now()));
        self.is_playing = true;

        // Préchauffage du morceau suivant, s'il existe déjà.
        if let Some(playlist_id) = &self.playlist_id {
            if let Ok(Some(following)) = self.store.next_ready_after(playlist_id, song.order_index)
            {
                if let Some(url) = following.audio_url.clone() {
                    self.broadcast(ServerMessage::Preload {
                        song_id: following.id,
                        audio_url: url,
                    })
                    .await;
                }
            }
        }

        self.current_song = Some(song);
        self.broadcast_state().await;
        self.broadcast_queue().await;
    }
}
