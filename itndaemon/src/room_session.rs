//! Session room : canal WebSocket persistant vers le serveur.
//!
//! Le daemon émet un pulse `sync` (1 Hz) tant qu'il est connecté, sonde
//! l'horloge serveur par `ping`/`pong`, et n'agit sur le moteur que sur
//! directives `execute`/`nextSong`, à l'exception de play/pause que le
//! daemon applique localement d'abord pour réduire la latence perçue,
//! l'état autoritaire reconciliant ensuite.

use crate::engine::AudioEngine;
use crate::error::{Error, Result};
use crate::state::{DaemonMode, DaemonState, QueueEntry};
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use itnroom::clock::ClockSync;
use itnroom::protocol::{ClientMessage, Command, DeviceRole, ServerMessage, SongSnapshot};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Paramètres d'une session room.
#[derive(Debug, Clone)]
pub struct RoomSessionConfig {
    pub server_url: String,
    pub room_id: String,
    pub playlist_key: String,
    pub device_id: String,
    pub device_name: String,
    pub sync_interval: Duration,
}

/// Session room vivante.
pub struct RoomSession {
    cmd_tx: mpsc::Sender<ClientMessage>,
    connected_rx: watch::Receiver<bool>,
    shutdown: CancellationToken,
}

impl RoomSession {
    /// Ouvre la connexion et démarre la session.
    ///
    /// La première connexion est tentée immédiatement (échec = erreur
    /// remontée à l'appelant) ; les coupures ultérieures se reconnectent
    /// en arrière-plan.
    pub async fn connect(
        config: RoomSessionConfig,
        engine: Arc<dyn AudioEngine>,
        state: DaemonState,
    ) -> Result<Arc<RoomSession>> {
        let ws_url = ws_url(&config.server_url);
        let (socket, _) = tokio_tungstenite::connect_async(ws_url.as_str())
            .await
            .map_err(|e| Error::RoomConnection(e.to_string()))?;

        let (connected_tx, connected_rx) = watch::channel(false);
        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        let shutdown = CancellationToken::new();

        let session = Arc::new(RoomSession {
            cmd_tx,
            connected_rx,
            shutdown: shutdown.clone(),
        });

        tokio::spawn(run_session(
            config,
            ws_url,
            Some(socket),
            cmd_rx,
            connected_tx,
            engine,
            state,
            shutdown,
        ));

        Ok(session)
    }

    /// Attend que la session atteigne l'état connecté
    pub async fn wait_connected(&self, timeout: Duration) -> bool {
        let mut rx = self.connected_rx.clone();
        tokio::time::timeout(timeout, async {
            loop {
                if *rx.borrow() {
                    return;
                }
                if rx.changed().await.is_err() {
                    return;
                }
            }
        })
        .await
        .is_ok()
            && *self.connected_rx.borrow()
    }

    pub fn is_connected(&self) -> bool {
        *self.connected_rx.borrow()
    }

    /// Relaie une commande de lecture au serveur
    pub async fn send_command(&self, command: Command, target_device_id: Option<String>) -> Result<()> {
        self.cmd_tx
            .send(ClientMessage::Command {
                command,
                target_device_id,
            })
            .await
            .map_err(|_| Error::NotConnected)
    }

    /// Ferme la session (définitif)
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

fn ws_url(server_url: &str) -> String {
    let base = server_url.trim_end_matches('/');
    let ws = if let Some(rest) = base.strip_prefix("https://") {
        format!("wss://{}", rest)
    } else if let Some(rest) = base.strip_prefix("http://") {
        format!("ws://{}", rest)
    } else {
        format!("ws://{}", base)
    };
    format!("{}/ws/room", ws)
}

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

#[allow(clippy::too_many_arguments)]
async fn run_session(
    config: RoomSessionConfig,
    ws_url: String,
    mut first_socket: Option<WsStream>,
    mut cmd_rx: mpsc::Receiver<ClientMessage>,
    connected_tx: watch::Sender<bool>,
    engine: Arc<dyn AudioEngine>,
    state: DaemonState,
    shutdown: CancellationToken,
) {
    loop {
        let socket = match first_socket.take() {
            Some(socket) => socket,
            None => {
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_secs(3)) => {}
                    _ = shutdown.cancelled() => return,
                }
                match tokio_tungstenite::connect_async(ws_url.as_str()).await {
                    Ok((socket, _)) => socket,
                    Err(e) => {
                        debug!("Room reconnect failed: {}", e);
                        continue;
                    }
                }
            }
        };

        run_connection(
            &config,
            socket,
            &mut cmd_rx,
            &connected_tx,
            &engine,
            &state,
            &shutdown,
        )
        .await;

        let _ = connected_tx.send(false);
        state.update(|s| s.connected = false);

        if shutdown.is_cancelled() {
            return;
        }
        warn!("Room channel lost, reconnecting");
    }
}

async fn run_connection(
    config: &RoomSessionConfig,
    mut socket: WsStream,
    cmd_rx: &mut mpsc::Receiver<ClientMessage>,
    connected_tx: &watch::Sender<bool>,
    engine: &Arc<dyn AudioEngine>,
    state: &DaemonState,
    shutdown: &CancellationToken,
) {
    let clock = Arc::new(Mutex::new(ClockSync::new()));

    // Enregistrement du device.
    let join = ClientMessage::Join {
        room_id: config.room_id.clone(),
        playlist_key: config.playlist_key.clone(),
        room_name: None,
        device_id: config.device_id.clone(),
        device_name: Some(config.device_name.clone()),
        role: DeviceRole::Player,
        mode: None,
    };
    if send_msg(&mut socket, &join).await.is_err() {
        return;
    }

    let mut pulse = tokio::time::interval(config.sync_interval);
    pulse.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut pulse_count: u64 = 0;

    let mut ended_rx = engine.subscribe_ended();

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                let _ = socket.close(None).await;
                return;
            }

            // Pulse 1 Hz : sync + sonde d'horloge périodique
            _ = pulse.tick() => {
                let snapshot = engine.snapshot();
                let sync = ClientMessage::Sync {
                    current_song_id: snapshot.song_id.clone(),
                    current_time: snapshot.current_time,
                    is_playing: snapshot.is_playing,
                };
                if send_msg(&mut socket, &sync).await.is_err() {
                    return;
                }
                if pulse_count % 5 == 0 {
                    let ping = ClientMessage::Ping {
                        client_time: Utc::now().timestamp_millis(),
                    };
                    if send_msg(&mut socket, &ping).await.is_err() {
                        return;
                    }
                }
                pulse_count += 1;
            }

            // Commandes relayées depuis l'IPC
            cmd = cmd_rx.recv() => {
                let Some(cmd) = cmd else { return };
                if send_msg(&mut socket, &cmd).await.is_err() {
                    return;
                }
            }

            // Fin naturelle côté moteur
            ended = ended_rx.recv() => {
                if let Ok(song_id) = ended {
                    let msg = ClientMessage::SongEnded { song_id };
                    if send_msg(&mut socket, &msg).await.is_err() {
                        return;
                    }
                }
            }

            // Messages serveur
            message = socket.next() => {
                let Some(Ok(message)) = message else { return };
                let Message::Text(text) = message else { continue };
                let Ok(server_message) = serde_json::from_str::<ServerMessage>(&text) else {
                    debug!("Unparseable server message: {}", text);
                    continue;
                };
                handle_server_message(
                    server_message,
                    config,
                    connected_tx,
                    engine,
                    state,
                    &clock,
                )
                .await;
            }
        }
    }
}

async fn handle_server_message(
    message: ServerMessage,
    config: &RoomSessionConfig,
    connected_tx: &watch::Sender<bool>,
    engine: &Arc<dyn AudioEngine>,
    state: &DaemonState,
    clock: &Arc<Mutex<ClockSync>>,
) {
    match message {
        ServerMessage::JoinAck {
            room_id,
            protocol_version,
            ..
        } => {
            info!(room_id = %room_id, protocol_version, "Joined room");
            let _ = connected_tx.send(true);
            state.update(|s| {
                s.mode = DaemonMode::Room;
                s.room_id = Some(room_id);
                s.playlist_key = Some(config.playlist_key.clone());
                s.connected = true;
                s.last_error = None;
            });
        }
        ServerMessage::State {
            playback,
            current_song,
            ..
        } => {
            // Reconciliation avec l'état autoritaire après une éventuelle
            // application locale anticipée.
            let snapshot = engine.snapshot();
            if playback.is_playing != snapshot.is_playing {
                let result = if playback.is_playing {
                    engine.play().await
                } else {
                    engine.pause().await
                };
                if let Err(e) = result {
                    warn!("Engine reconcile failed: {}", e);
                }
            }
            state.update(|s| {
                s.current = current_song.as_ref().map(queue_entry);
            });
        }
        ServerMessage::Queue { songs } => {
            state.update(|s| {
                s.queue = songs.iter().map(queue_entry).collect();
            });
        }
        ServerMessage::Execute { command } => {
            apply_execute(engine, command).await;
        }
        ServerMessage::NextSong {
            song_id,
            audio_url,
            start_at,
        } => {
            let local_start = clock.lock().unwrap().server_to_local(start_at);
            if let Err(e) = engine
                .load_song(&song_id, &audio_url, Some(local_start), 0.0)
                .await
            {
                warn!(song_id = %song_id, "Engine load failed: {}", e);
            }
        }
        ServerMessage::Preload { song_id, audio_url } => {
            let _ = engine.preload(&song_id, &audio_url).await;
        }
        ServerMessage::Pong {
            client_time,
            server_time,
        } => {
            let offset = {
                let mut clock = clock.lock().unwrap();
                clock.add_sample(client_time, server_time, Utc::now().timestamp_millis());
                clock.offset_ms()
            };
            state.update(|s| s.server_time_offset_ms = offset);
        }
        ServerMessage::Error { message } => {
            warn!("Room error: {}", message);
            state.update(|s| s.last_error = Some(message));
        }
    }
}

/// Applique une directive autoritaire au moteur.
async fn apply_execute(engine: &Arc<dyn AudioEngine>, command: Command) {
    let result = match command {
        Command::Play => engine.play().await,
        Command::Pause => engine.pause().await,
        Command::Toggle => engine.toggle().await,
        Command::Seek { time } => engine.seek(time).await,
        Command::SetVolume { volume } => engine.set_volume(volume).await,
        Command::ToggleMute => engine.toggle_mute().await,
        // skip/selectSong se matérialisent par un nextSong du serveur.
        Command::Skip | Command::SelectSong { .. } => Ok(()),
    };
    if let Err(e) = result {
        warn!("Engine execute failed: {}", e);
    }
}

fn queue_entry(song: &SongSnapshot) -> QueueEntry {
    QueueEntry {
        song_id: song.song_id.clone(),
        order_index: song.order_index,
        title: song.title.clone(),
        artist: song.artist.clone(),
        audio_url: song.audio_url.clone(),
        duration: song.duration,
    }
}

async fn send_msg(socket: &mut WsStream, message: &ClientMessage) -> Result<()> {
    let text = serde_json::to_string(message).map_err(|e| Error::Ipc(e.to_string()))?;
    socket
        .send(Message::Text(text.into()))
        .await
        .map_err(|e| Error::RoomConnection(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ws_url_conversion() {
        assert_eq!(ws_url("http://host:8080"), "ws://host:8080/ws/room");
        assert_eq!(ws_url("https://host/"), "wss://host/ws/room");
        assert_eq!(ws_url("host:8080"), "ws://host:8080/ws/room");
    }
}
