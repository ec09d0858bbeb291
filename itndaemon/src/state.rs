//! État runtime du daemon, snapshot atomique partagé.
//!
//! Les requêtes `status` (IPC comme HTTP) lisent un instantané sans
//! verrou de session : l'état est remplacé d'un bloc derrière un RwLock.

use crate::engine::EngineSnapshot;
use serde::Serialize;
use std::sync::{Arc, RwLock};

/// Mode de fonctionnement du daemon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DaemonMode {
    Idle,
    Room,
    Local,
}

/// Entrée de file vue par le daemon.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueEntry {
    pub song_id: String,
    pub order_index: i64,
    pub title: Option<String>,
    pub artist: Option<String>,
    pub audio_url: Option<String>,
    pub duration: Option<f64>,
}

/// État runtime complet.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeState {
    pub mode: DaemonMode,
    pub room_id: Option<String>,
    pub playlist_key: Option<String>,
    pub local_playlist_id: Option<String>,
    pub local_playlist_name: Option<String>,
    pub device_id: String,
    pub connected: bool,
    pub last_error: Option<String>,
    pub server_time_offset_ms: i64,
    pub engine: EngineSnapshot,
    pub current: Option<QueueEntry>,
    pub queue: Vec<QueueEntry>,
}

impl RuntimeState {
    fn new(device_id: String) -> Self {
        Self {
            mode: DaemonMode::Idle,
            room_id: None,
            playlist_key: None,
            local_playlist_id: None,
            local_playlist_name: None,
            device_id,
            connected: false,
            last_error: None,
            server_time_offset_ms: 0,
            engine: EngineSnapshot::default(),
            current: None,
            queue: Vec::new(),
        }
    }
}

/// État partagé (cloné tel quel pour chaque snapshot).
#[derive(Clone)]
pub struct DaemonState {
    inner: Arc<RwLock<RuntimeState>>,
}

impl DaemonState {
    pub fn new(device_id: String) -> Self {
        Self {
            inner: Arc::new(RwLock::new(RuntimeState::new(device_id))),
        }
    }

    /// Instantané de l'état courant
    pub fn snapshot(&self) -> RuntimeState {
        self.inner.read().unwrap().clone()
    }

    /// Mutation sous verrou
    pub fn update<F: FnOnce(&mut RuntimeState)>(&self, f: F) {
        let mut state = self.inner.write().unwrap();
        f(&mut state);
    }

    /// Remet l'état de session à zéro (mode idle)
    pub fn clear_session(&self) {
        self.update(|state| {
            state.mode = DaemonMode::Idle;
            state.room_id = None;
            state.playlist_key = None;
            state.local_playlist_id = None;
            state.local_playlist_name = None;
            state.connected = false;
            state.current = None;
            state.queue.clear();
        });
    }
}
