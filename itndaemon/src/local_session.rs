//! Session locale : lecture d'une playlist sans room.
//!
//! Le daemon rafraîchit la liste de morceaux par polling HTTP, joue les
//! `ready` dans l'ordre des order_index, rapporte consommation et
//! position au service de données et bat le heartbeat de playlist.

use crate::api_client::ApiClient;
use crate::engine::AudioEngine;
use crate::error::Error;
use crate::state::{DaemonMode, DaemonState, QueueEntry};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Contrôles envoyés par l'IPC à la session locale.
pub enum LocalCtrl {
    Skip,
    SelectSong(String),
}

/// Paramètres d'une session locale.
#[derive(Debug, Clone)]
pub struct LocalSessionConfig {
    pub playlist_id: String,
    pub playlist_name: String,
    pub poll_interval: Duration,
    pub heartbeat_interval: Duration,
}

/// Session locale vivante.
pub struct LocalSession {
    ctrl_tx: mpsc::Sender<LocalCtrl>,
    shutdown: CancellationToken,
}

impl LocalSession {
    /// Démarre la session (le premier morceau part dès le premier poll)
    pub fn start(
        config: LocalSessionConfig,
        api: Arc<ApiClient>,
        engine: Arc<dyn AudioEngine>,
        state: DaemonState,
    ) -> LocalSession {
        let (ctrl_tx, ctrl_rx) = mpsc::channel(8);
        let shutdown = CancellationToken::new();

        state.update(|s| {
            s.mode = DaemonMode::Local;
            s.local_playlist_id = Some(config.playlist_id.clone());
            s.local_playlist_name = Some(config.playlist_name.clone());
            s.connected = true;
            s.last_error = None;
        });

        tokio::spawn(run_local(
            config,
            api,
            engine,
            state,
            ctrl_rx,
            shutdown.clone(),
        ));

        LocalSession { ctrl_tx, shutdown }
    }

    pub async fn control(&self, ctrl: LocalCtrl) {
        let _ = self.ctrl_tx.send(ctrl).await;
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

async fn run_local(
    config: LocalSessionConfig,
    api: Arc<ApiClient>,
    engine: Arc<dyn AudioEngine>,
    state: DaemonState,
    mut ctrl_rx: mpsc::Receiver<LocalCtrl>,
    shutdown: CancellationToken,
) {
    info!(playlist_id = %config.playlist_id, "Local playback session started");

    let mut poll = tokio::time::interval(config.poll_interval);
    poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut heartbeat = tokio::time::interval(config.heartbeat_interval);
    heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    let mut ended_rx = engine.subscribe_ended();
    let mut queue: Vec<QueueEntry> = Vec::new();

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,

            // Rafraîchit la file et démarre la lecture si le moteur est idle
            _ = poll.tick() => {
                match api.fetch_queue(&config.playlist_id).await {
                    Ok(fresh) => {
                        queue = fresh;
                        state.update(|s| {
                            s.queue = queue.clone();
                            s.last_error = None;
                        });

                        if engine.snapshot().song_id.is_none() {
                            if let Some(entry) = queue.first().cloned() {
                                start_entry(&engine, &state, &entry).await;
                            }
                        }
                    }
                    Err(Error::StaleRoomSession(message)) => {
                        warn!(playlist_id = %config.playlist_id, "Playlist gone: {}", message);
                        state.update(|s| {
                            s.last_error = Some(message.clone());
                            s.connected = false;
                        });
                    }
                    Err(e) => {
                        debug!("Queue refresh failed: {}", e);
                        state.update(|s| s.last_error = Some(e.to_string()));
                    }
                }
            }

            _ = heartbeat.tick() => {
                if let Err(e) = api.heartbeat(&config.playlist_id).await {
                    debug!("Heartbeat failed: {}", e);
                }
            }

            // Fin naturelle : rapporte et enchaîne
            ended = ended_rx.recv() => {
                let Ok(song_id) = ended else { continue };
                advance_after(&config, &api, &engine, &state, &mut queue, &song_id, true).await;
            }

            ctrl = ctrl_rx.recv() => {
                match ctrl {
                    Some(LocalCtrl::Skip) => {
                        let current = engine.snapshot().song_id;
                        if let Some(song_id) = current {
                            let _ = engine.stop(false).await;
                            advance_after(&config, &api, &engine, &state, &mut queue, &song_id, true).await;
                        }
                    }
                    Some(LocalCtrl::SelectSong(song_id)) => {
                        if let Some(entry) = queue.iter().find(|e| e.song_id == song_id).cloned() {
                            start_entry(&engine, &state, &entry).await;
                        } else {
                            debug!(song_id = %song_id, "selectSong outside local queue");
                        }
                    }
                    None => break,
                }
            }
        }
    }

    info!(playlist_id = %config.playlist_id, "Local playback session stopped");
}

async fn start_entry(engine: &Arc<dyn AudioEngine>, state: &DaemonState, entry: &QueueEntry) {
    let Some(url) = entry.audio_url.clone() else {
        warn!(song_id = %entry.song_id, "Ready song without audio_url");
        return;
    };
    // Lecture locale : timing local, pas de startAt synchronisé.
    if let Err(e) = engine.load_song(&entry.song_id, &url, None, 0.0).await {
        warn!(song_id = %entry.song_id, "Engine load failed: {}", e);
        return;
    }
    state.update(|s| s.current = Some(entry.clone()));
}

/// Rapporte la consommation d'un morceau et démarre le suivant.
async fn advance_after(
    config: &LocalSessionConfig,
    api: &Arc<ApiClient>,
    engine: &Arc<dyn AudioEngine>,
    state: &DaemonState,
    queue: &mut Vec<QueueEntry>,
    song_id: &str,
    report: bool,
) {
    let position = queue.iter().position(|e| e.song_id == song_id);

    if report {
        if let Err(e) = api.report_played(song_id).await {
            debug!(song_id = %song_id, "Report played failed: {}", e);
        }
        if let Some(index) = position {
            let order_index = queue[index].order_index;
            if let Err(e) = api.report_position(&config.playlist_id, order_index).await {
                debug!("Report position failed: {}", e);
            }
        }
    }

    let next = position
        .and_then(|index| queue.get(index + 1))
        .cloned()
        .or_else(|| {
            // Morceau inconnu de la file cachée : repartir du début.
            queue.iter().find(|e| e.song_id != song_id).cloned()
        });

    if let Some(index) = position {
        queue.remove(index);
        let queue_clone = queue.clone();
        state.update(|s| s.queue = queue_clone);
    }

    match next {
        Some(entry) => start_entry(engine, state, &entry).await,
        None => {
            state.update(|s| s.current = None);
            debug!("Local queue drained, waiting for generation");
        }
    }
}
